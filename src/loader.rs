//! Loads chunks of one multi-scale volume through the cache and the subscribable queue, and
//! prefetches around whatever was just requested.

use crate::cache::{CacheRegion, CacheStats, CachedVolume, VolumeCache};
use crate::config::{LoaderConfig, PrefetchConfig};
use crate::error::{QueueError, RequestError};
use crate::extent::{AxisRange, ChunkCoord, Extent, C, T, X, Y, Z};
use crate::prefetch::ChunkPrefetchIterator;
use crate::queue::{Completer, CompletionHandle, RequestOptions, SubscribableRequestQueue, SubscriberId};
use anyhow::{bail, Context};
use derive_more::Debug;
use futures::future::BoxFuture;
use itertools::Itertools;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub type ChunkData = Arc<[u8]>;

const PREFETCH_CANCEL_REASON: &str = "prefetch cancelled";

/// Shape of one scale level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScaleLevel {
    /// voxel shape, TCZYX
    pub shape: [usize; 5],
    /// voxel shape of a single chunk, ZYX
    pub chunk_shape: [usize; 3],
}
impl ScaleLevel {
    /// Number of chunks along each axis, TCZYX. Time and channel are never chunked.
    pub fn grid_shape(&self) -> [usize; 5] {
        [
            self.shape[T],
            self.shape[C],
            self.shape[Z].div_ceil(self.chunk_shape[0]),
            self.shape[Y].div_ceil(self.chunk_shape[1]),
            self.shape[X].div_ceil(self.chunk_shape[2]),
        ]
    }

    pub fn contains_chunk(&self, coord: &ChunkCoord) -> bool {
        coord.iter().zip(self.grid_shape()).all(|(c, n)| *c < n)
    }

    /// Voxel extent covered by the chunk. Chunks at the upper border may be partial.
    pub fn chunk_extent(&self, coord: &ChunkCoord) -> Extent {
        let range = |axis: usize, chunk: usize| {
            let min = coord[axis] * chunk;
            AxisRange::new(min, ((coord[axis] + 1) * chunk).min(self.shape[axis]) - 1)
        };
        Extent::new(
            range(X, self.chunk_shape[2]),
            range(Y, self.chunk_shape[1]),
            range(Z, self.chunk_shape[0]),
        )
    }

    fn dims(&self) -> [usize; 3] { [self.shape[X], self.shape[Y], self.shape[Z]] }
}

/// A remote chunked array store.
pub trait ChunkSource: Send + Sync {
    /// Stable identifier, used as request key prefix
    fn id(&self) -> &str;
    /// Scale levels, finest first. All levels share the same time and channel counts.
    fn levels(&self) -> &[ScaleLevel];
    /// Fetches the decoded bytes of one chunk, one byte per voxel in ZYX order.
    fn fetch_chunk(&self, scale: usize, coord: ChunkCoord) -> BoxFuture<'static, anyhow::Result<Vec<u8>>>;
}

#[derive(Debug)]
pub struct ChunkLoader {
    #[debug(skip)]
    source: Arc<dyn ChunkSource>,
    volume: CachedVolume,
    #[debug(skip)]
    cache: Arc<Mutex<VolumeCache>>,
    #[debug(skip)]
    queue: SubscribableRequestQueue<ChunkData>,
    prefetch_subscriber: SubscriberId,
    prefetch: PrefetchConfig,
}

impl ChunkLoader {
    pub fn new(source: Arc<dyn ChunkSource>, config: &LoaderConfig) -> anyhow::Result<Self> {
        let levels = source.levels();
        let Some(first) = levels.first() else {
            bail!("chunk source {} has no scale levels", source.id());
        };
        if let Some(level) = levels.iter().find(|l| l.chunk_shape.contains(&0)) {
            bail!("chunk source {} has empty chunk shape {:?}", source.id(), level.chunk_shape);
        }
        let dims: Vec<[usize; 3]> = levels.iter().map(|l| l.dims()).collect();

        let mut cache = VolumeCache::new(config.max_cache_size);
        let volume = cache.register_volume(first.shape[C], first.shape[T], &dims);
        let queue = SubscribableRequestQueue::new(config.max_active_requests, config.max_low_priority_requests);
        let prefetch_subscriber = queue.add_subscriber();
        log::debug!("loader for {} with {} scale levels", source.id(), levels.len());

        Ok(ChunkLoader {
            source,
            volume,
            cache: Arc::new(Mutex::new(cache)),
            queue,
            prefetch_subscriber,
            prefetch: config.prefetch.clone(),
        })
    }

    pub fn add_subscriber(&self) -> SubscriberId { self.queue.add_subscriber() }
    pub fn remove_subscriber(&self, subscriber: SubscriberId) { self.queue.remove_subscriber(subscriber, None) }

    /// Requests `chunks` (TCZYX) of scale level `scale` on behalf of `subscriber`, one handle per
    /// chunk, then queues low-priority prefetches around them. Cached chunks come back already
    /// resolved; chunks outside the grid come back rejected.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn load_chunks(
        &self,
        subscriber: SubscriberId,
        scale: usize,
        chunks: &[ChunkCoord],
    ) -> Result<Vec<CompletionHandle<ChunkData>>, QueueError> {
        if !self.queue.has_subscriber(subscriber) {
            return Err(QueueError::UnknownSubscriber { id: subscriber });
        }
        let Some(level) = self.source.levels().get(scale).copied() else {
            let err = RequestError::Failed {
                message: format!("unknown scale level {scale}"),
            };
            return Ok(chunks.iter().map(|_| rejected(err.clone())).collect());
        };

        let mut handles = Vec::with_capacity(chunks.len());
        let mut valid = Vec::with_capacity(chunks.len());
        for coord in chunks {
            if !level.contains_chunk(coord) {
                handles.push(rejected(RequestError::Failed {
                    message: format!("chunk {coord:?} outside of grid {:?}", level.grid_shape()),
                }));
                continue;
            }
            valid.push(*coord);
            match self.cached(scale, &level, coord) {
                Some(data) => handles.push(CompletionHandle::resolved(data)),
                None => handles.push(self.request(subscriber, scale, &level, *coord, RequestOptions::default())?),
            }
        }

        self.prefetch_around(scale, &level, &valid);
        Ok(handles)
    }

    /// Cancels the subscriber's interest in one chunk.
    pub fn cancel_chunk(&self, subscriber: SubscriberId, scale: usize, coord: &ChunkCoord) -> bool {
        self.queue.cancel_request(&self.chunk_key(scale, coord), subscriber, None)
    }

    /// Cancels every outstanding prefetch. Returns the number of prefetch subscriptions dropped.
    pub fn cancel_prefetch(&self) -> usize {
        let keys = self.queue.subscribed_keys(self.prefetch_subscriber);
        keys.iter()
            .filter(|key| self.queue.cancel_request(key, self.prefetch_subscriber, Some(PREFETCH_CANCEL_REASON)))
            .count()
    }

    /// Reads a chunk straight from the cache, marking it as recently used.
    pub fn cached_chunk(&self, scale: usize, coord: &ChunkCoord) -> Option<ChunkData> {
        let level = self.source.levels().get(scale).copied()?;
        if !level.contains_chunk(coord) {
            return None;
        }
        self.cached(scale, &level, coord)
    }

    pub fn cache_stats(&self) -> CacheStats { lock(&self.cache).stats() }
    pub fn clear_cache(&self) { lock(&self.cache).clear_volume(&self.volume) }
    pub fn volume(&self) -> &CachedVolume { &self.volume }

    /// Request key of a chunk, `{source}/{scale}/{t}/{c}/{z}/{y}/{x}`
    pub fn chunk_key(&self, scale: usize, coord: &ChunkCoord) -> String {
        format!("{}/{}/{}", self.source.id(), scale, coord.iter().join("/"))
    }

    fn cached(&self, scale: usize, level: &ScaleLevel, coord: &ChunkCoord) -> Option<ChunkData> {
        let region = CacheRegion::new(scale, coord[T]).with_extent(level.chunk_extent(coord));
        lock(&self.cache).get(&self.volume, coord[C], &region)
    }

    fn is_cached(&self, scale: usize, level: &ScaleLevel, coord: &ChunkCoord) -> bool {
        let region = CacheRegion::new(scale, coord[T]).with_extent(level.chunk_extent(coord));
        lock(&self.cache).contains(&self.volume, coord[C], &region)
    }

    fn request(
        &self,
        subscriber: SubscriberId,
        scale: usize,
        level: &ScaleLevel,
        coord: ChunkCoord,
        options: RequestOptions,
    ) -> Result<CompletionHandle<ChunkData>, QueueError> {
        let key = self.chunk_key(scale, &coord);
        let extent = level.chunk_extent(&coord);
        let region = CacheRegion::new(scale, coord[T]).with_extent(extent);
        let source = self.source.clone();
        let cache = self.cache.clone();
        let volume = self.volume.clone();
        let fetch_key = key.clone();

        self.queue.add_request_with(key, subscriber, options, move || async move {
            let data = source
                .fetch_chunk(scale, coord)
                .await
                .with_context(|| format!("Failed to fetch chunk {fetch_key}"))?;
            if data.len() != extent.volume() {
                bail!(
                    "chunk {fetch_key} has {} bytes, expected {} for extent {extent}",
                    data.len(),
                    extent.volume()
                );
            }
            let data: ChunkData = data.into();
            if !lock(&cache).insert(&volume, coord[C], &region, data.clone()) {
                log::debug!("chunk {fetch_key} not cached");
            }
            Ok::<_, anyhow::Error>(data)
        })
    }

    fn prefetch_around(&self, scale: usize, level: &ScaleLevel, chunks: &[ChunkCoord]) {
        if chunks.is_empty() || self.prefetch.max_chunks == 0 {
            return;
        }
        let grid = level.grid_shape();
        let num_chunks = [grid[T], grid[Z], grid[Y], grid[X]];
        let candidates = ChunkPrefetchIterator::new(
            chunks,
            self.prefetch.max_offset,
            num_chunks,
            &self.prefetch.priority_directions,
        );

        let mut issued = 0;
        for coord in candidates {
            if issued >= self.prefetch.max_chunks {
                break;
            }
            if self.queue.has_request(&self.chunk_key(scale, &coord)) || self.is_cached(scale, level, &coord) {
                continue;
            }
            // the prefetch subscriber is owned by the loader and never removed
            if self
                .request(self.prefetch_subscriber, scale, level, coord, RequestOptions::low_priority())
                .is_ok()
            {
                issued += 1;
            }
        }
        if issued > 0 {
            log::debug!("prefetching {issued} chunks of scale {scale}");
        }
    }
}

fn lock(cache: &Mutex<VolumeCache>) -> MutexGuard<'_, VolumeCache> { cache.lock().unwrap_or_else(PoisonError::into_inner) }

fn rejected(err: RequestError) -> CompletionHandle<ChunkData> {
    let (completer, handle) = Completer::pair();
    completer.reject(err);
    handle
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Ramp {
        levels: Vec<ScaleLevel>,
        fetches: Arc<AtomicUsize>,
    }
    impl ChunkSource for Ramp {
        fn id(&self) -> &str { "ramp" }
        fn levels(&self) -> &[ScaleLevel] { &self.levels }
        fn fetch_chunk(&self, scale: usize, coord: ChunkCoord) -> BoxFuture<'static, anyhow::Result<Vec<u8>>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let len = self.levels[scale].chunk_extent(&coord).volume();
            async move { Ok(vec![coord[X] as u8; len]) }.boxed()
        }
    }

    fn level() -> ScaleLevel {
        ScaleLevel {
            shape: [1, 1, 4, 10, 10],
            chunk_shape: [4, 4, 4],
        }
    }

    #[test]
    fn chunk_geometry() {
        let level = level();
        assert_eq!(level.grid_shape(), [1, 1, 1, 3, 3]);
        assert!(level.contains_chunk(&[0, 0, 0, 2, 2]));
        assert!(!level.contains_chunk(&[0, 0, 1, 0, 0]));

        let edge = level.chunk_extent(&[0, 0, 0, 1, 2]);
        assert_eq!(edge.x, AxisRange::new(8, 9));
        assert_eq!(edge.y, AxisRange::new(4, 7));
        assert_eq!(edge.z, AxisRange::new(0, 3));
        assert_eq!(edge.volume(), 32);
    }

    #[tokio::test]
    async fn second_load_is_served_from_cache() {
        let fetches = Arc::new(AtomicUsize::new(0));
        let source = Arc::new(Ramp {
            levels: vec![level()],
            fetches: fetches.clone(),
        });
        let mut config = LoaderConfig::default();
        config.prefetch.max_chunks = 0;
        let loader = ChunkLoader::new(source, &config).unwrap();
        let subscriber = loader.add_subscriber();

        let handles = loader.load_chunks(subscriber, 0, &[[0, 0, 0, 0, 2]]).unwrap();
        let data = handles.into_iter().next().unwrap().wait().await.unwrap();
        assert_eq!(data.len(), 32);
        assert!(data.iter().all(|&b| b == 2));

        let again = loader.load_chunks(subscriber, 0, &[[0, 0, 0, 0, 2]]).unwrap();
        assert!(again[0].is_settled());
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
        assert_eq!(loader.cache_stats().entries, 1);
    }

    #[tokio::test]
    async fn out_of_grid_chunks_are_rejected() {
        let source = Arc::new(Ramp {
            levels: vec![level()],
            fetches: Arc::new(AtomicUsize::new(0)),
        });
        let loader = ChunkLoader::new(source, &LoaderConfig::default()).unwrap();
        let subscriber = loader.add_subscriber();

        let handles = loader.load_chunks(subscriber, 0, &[[0, 0, 0, 3, 0]]).unwrap();
        assert!(matches!(handles[0].state(), crate::queue::RequestState::Rejected(RequestError::Failed { .. })));
        let handles = loader.load_chunks(subscriber, 5, &[[0, 0, 0, 0, 0]]).unwrap();
        assert!(handles[0].is_settled());
        assert!(loader.cached_chunk(0, &[0, 0, 0, 3, 0]).is_none());
    }

    #[test]
    fn rejects_sources_without_levels() {
        let source = Arc::new(Ramp {
            levels: vec![],
            fetches: Arc::new(AtomicUsize::new(0)),
        });
        let err = ChunkLoader::new(source, &LoaderConfig::default()).unwrap_err();
        assert!(err.to_string().contains("no scale levels"));
    }
}
