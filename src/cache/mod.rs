//! Byte-budgeted LRU cache of decoded volume chunks.
//!
//! Every entry lives in two structures at once: the bucket of its volume/scale/time/channel (used for
//! lookups by extent) and the global recency list (used for eviction). Both refer to the entry by its
//! arena index, so removal and promotion never need to scan the recency list.

mod lru;

use crate::extent::{AxisRange, Extent};
use derive_more::Debug;
use fxhash::FxHashMap;
use lru::{EntryId, LruList};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub type VolumeId = u64;

/// Volume ids are unique across all caches of the process, so a handle never matches a volume of
/// another cache.
static NEXT_VOLUME_ID: AtomicU64 = AtomicU64::new(0);

pub const DEFAULT_MAX_CACHE_SIZE: usize = 250_000_000;

/// Handle for a volume registered with a [`VolumeCache`].
///
/// `num_times` and `num_channels` are fixed at registration; every scale level has exactly that
/// many time/channel buckets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedVolume {
    id: VolumeId,
    num_channels: usize,
    num_times: usize,
    scale_dims: Vec<[usize; 3]>,
}
impl CachedVolume {
    pub fn id(&self) -> VolumeId { self.id }
    pub fn num_channels(&self) -> usize { self.num_channels }
    pub fn num_times(&self) -> usize { self.num_times }
    pub fn num_scales(&self) -> usize { self.scale_dims.len() }
    /// `[x, y, z]` dimensions of a scale level
    pub fn scale_dims(&self, scale: usize) -> Option<[usize; 3]> { self.scale_dims.get(scale).copied() }
}

/// Addresses a region of one scale level at one timestep. Axes left at `None` cover the full
/// dimension of the scale level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheRegion {
    pub scale: usize,
    pub time: usize,
    pub x: Option<AxisRange>,
    pub y: Option<AxisRange>,
    pub z: Option<AxisRange>,
}
impl CacheRegion {
    pub fn new(scale: usize, time: usize) -> Self {
        CacheRegion {
            scale,
            time,
            ..Default::default()
        }
    }
    pub fn with_extent(mut self, extent: Extent) -> Self {
        self.x = Some(extent.x);
        self.y = Some(extent.y);
        self.z = Some(extent.z);
        self
    }
    fn resolve(&self, dims: [usize; 3]) -> Extent {
        let full = Extent::full(dims);
        Extent::new(
            self.x.unwrap_or(full.x),
            self.y.unwrap_or(full.y),
            self.z.unwrap_or(full.z),
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub size: usize,
    pub entries: usize,
}

#[derive(Debug, Clone, Copy)]
struct BucketRef {
    volume: VolumeId,
    scale: usize,
    time: usize,
    channel: usize,
}

#[derive(Debug)]
struct CacheEntry {
    #[debug(skip)]
    data: Arc<[u8]>,
    extent: Extent,
    bucket: BucketRef,
}

struct ScaleIndex {
    dims: [usize; 3],
    /// time -> channel -> entries
    buckets: Vec<Vec<Vec<EntryId>>>,
}

struct VolumeIndex {
    scales: Vec<ScaleIndex>,
}
impl VolumeIndex {
    fn bucket(&self, scale: usize, time: usize, channel: usize) -> Option<&Vec<EntryId>> {
        self.scales.get(scale)?.buckets.get(time)?.get(channel)
    }
    fn bucket_mut(&mut self, scale: usize, time: usize, channel: usize) -> Option<&mut Vec<EntryId>> {
        self.scales.get_mut(scale)?.buckets.get_mut(time)?.get_mut(channel)
    }
    fn entry_ids(&self) -> impl Iterator<Item = EntryId> + '_ {
        self.scales
            .iter()
            .flat_map(|s| s.buckets.iter().flatten().flatten().copied())
    }
}

/// In-memory working set of chunk data, bounded by `max_size` bytes.
pub struct VolumeCache {
    max_size: usize,
    current_size: usize,
    lru: LruList<CacheEntry>,
    volumes: FxHashMap<VolumeId, VolumeIndex>,
    hits: u64,
    misses: u64,
    evictions: u64,
}
impl Default for VolumeCache {
    fn default() -> Self { Self::new(DEFAULT_MAX_CACHE_SIZE) }
}

impl VolumeCache {
    pub fn new(max_size: usize) -> Self {
        VolumeCache {
            max_size,
            current_size: 0,
            lru: LruList::new(),
            volumes: FxHashMap::default(),
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    pub fn max_size(&self) -> usize { self.max_size }
    pub fn size(&self) -> usize { self.current_size }
    pub fn num_entries(&self) -> usize { self.lru.len() }
    pub fn is_empty(&self) -> bool { self.lru.is_empty() }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
            size: self.current_size,
            entries: self.lru.len(),
        }
    }

    /// Allocates the time/channel index of every scale level. `scale_dims` are `[x, y, z]`.
    pub fn register_volume(&mut self, num_channels: usize, num_times: usize, scale_dims: &[[usize; 3]]) -> CachedVolume {
        let id = NEXT_VOLUME_ID.fetch_add(1, Ordering::Relaxed);

        let scales = scale_dims
            .iter()
            .map(|&dims| ScaleIndex {
                dims,
                buckets: vec![vec![Vec::new(); num_channels]; num_times],
            })
            .collect();
        self.volumes.insert(id, VolumeIndex { scales });

        CachedVolume {
            id,
            num_channels,
            num_times,
            scale_dims: scale_dims.to_vec(),
        }
    }

    /// Removes all data of the volume and forgets its index. Later inserts for it fail.
    pub fn unregister_volume(&mut self, volume: &CachedVolume) {
        self.clear_volume(volume);
        self.volumes.remove(&volume.id);
    }

    /// Stores `data` for the given channel and region, evicting least recently used entries until
    /// the cache fits its budget again.
    ///
    /// Returns `false` without touching the cache if the region is invalid or outside the scale
    /// level, if the data length does not match the region volume, or if the data alone is larger
    /// than the whole cache.
    pub fn insert(&mut self, volume: &CachedVolume, channel: usize, region: &CacheRegion, data: impl Into<Arc<[u8]>>) -> bool {
        let data: Arc<[u8]> = data.into();
        let Some(index) = self.volumes.get_mut(&volume.id) else {
            log::warn!("insert into unknown volume {}", volume.id);
            return false;
        };
        let Some(scale) = index.scales.get(region.scale) else {
            log::warn!("insert into unknown scale {} of volume {}", region.scale, volume.id);
            return false;
        };
        let extent = region.resolve(scale.dims);
        if !extent.is_valid() || !extent.fits_within(scale.dims) {
            log::warn!("rejecting insert with extent {} for scale dims {:?}", extent, scale.dims);
            return false;
        }
        if data.len() != extent.volume() {
            log::warn!(
                "rejecting insert of {} bytes for extent {} (expected {} bytes)",
                data.len(),
                extent,
                extent.volume()
            );
            return false;
        }
        if data.len() > self.max_size {
            log::debug!("rejecting insert of {} bytes, larger than cache size {}", data.len(), self.max_size);
            return false;
        }
        let Some(bucket) = index.bucket_mut(region.scale, region.time, channel) else {
            log::warn!("insert into unknown time {} / channel {}", region.time, channel);
            return false;
        };

        let existing = bucket
            .iter()
            .copied()
            .find(|&id| self.lru.get(id).is_some_and(|e| e.extent == extent));
        let len = data.len();
        match existing {
            Some(id) => {
                if let Some(entry) = self.lru.get_mut(id) {
                    self.current_size = self.current_size - entry.data.len() + len;
                    entry.data = data;
                }
                self.lru.promote(id);
            }
            None => {
                let id = self.lru.push_front(CacheEntry {
                    data,
                    extent,
                    bucket: BucketRef {
                        volume: volume.id,
                        scale: region.scale,
                        time: region.time,
                        channel,
                    },
                });
                bucket.push(id);
                self.current_size += len;
            }
        }

        self.evict_to_fit();
        true
    }

    /// Exact-extent lookup. A hit makes the entry the most recently used one.
    pub fn get(&mut self, volume: &CachedVolume, channel: usize, region: &CacheRegion) -> Option<Arc<[u8]>> {
        let found = self.find(volume, channel, region);
        match found {
            Some(id) => {
                self.hits += 1;
                self.lru.promote(id);
                self.lru.get(id).map(|e| e.data.clone())
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Looks up each of `channels`; missing channels are `None`.
    pub fn get_channels(&mut self, volume: &CachedVolume, channels: &[usize], region: &CacheRegion) -> Vec<Option<Arc<[u8]>>> {
        channels.iter().map(|&c| self.get(volume, c, region)).collect()
    }

    pub fn get_all_channels(&mut self, volume: &CachedVolume, region: &CacheRegion) -> Vec<Option<Arc<[u8]>>> {
        (0..volume.num_channels).map(|c| self.get(volume, c, region)).collect()
    }

    /// Returns whether an entry exists without affecting recency.
    pub fn contains(&self, volume: &CachedVolume, channel: usize, region: &CacheRegion) -> bool {
        self.find(volume, channel, region).is_some()
    }

    /// Evicts every entry of the volume across all scales, times and channels.
    pub fn clear_volume(&mut self, volume: &CachedVolume) {
        let Some(index) = self.volumes.get_mut(&volume.id) else {
            return;
        };
        let ids: Vec<EntryId> = index.entry_ids().collect();
        for scale in index.scales.iter_mut() {
            scale.buckets.iter_mut().flatten().for_each(Vec::clear);
        }
        for id in &ids {
            if let Some(entry) = self.lru.remove(*id) {
                self.current_size -= entry.data.len();
            }
        }
        log::info!("cleared {} entries of volume {}", ids.len(), volume.id);
    }

    pub fn clear(&mut self) {
        for index in self.volumes.values_mut() {
            for scale in index.scales.iter_mut() {
                scale.buckets.iter_mut().flatten().for_each(Vec::clear);
            }
        }
        log::info!("cleared cache with {} entries", self.lru.len());
        self.lru.clear();
        self.current_size = 0;
    }

    fn find(&self, volume: &CachedVolume, channel: usize, region: &CacheRegion) -> Option<EntryId> {
        let index = self.volumes.get(&volume.id)?;
        let dims = index.scales.get(region.scale)?.dims;
        let extent = region.resolve(dims);
        index
            .bucket(region.scale, region.time, channel)?
            .iter()
            .copied()
            .find(|&id| self.lru.get(id).is_some_and(|e| e.extent == extent))
    }

    fn evict_to_fit(&mut self) {
        while self.current_size > self.max_size {
            let Some(id) = self.lru.tail() else {
                break;
            };
            self.remove_entry(id);
            self.evictions += 1;
        }
    }

    fn remove_entry(&mut self, id: EntryId) {
        let Some(entry) = self.lru.remove(id) else {
            return;
        };
        self.current_size -= entry.data.len();
        let BucketRef {
            volume,
            scale,
            time,
            channel,
        } = entry.bucket;
        log::debug!("evicting {} of volume {volume} scale {scale} t{time} c{channel}", entry.extent);
        if let Some(bucket) = self
            .volumes
            .get_mut(&volume)
            .and_then(|v| v.bucket_mut(scale, time, channel))
        {
            if let Some(pos) = bucket.iter().position(|&e| e == id) {
                bucket.swap_remove(pos);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIMS: [usize; 3] = [4, 4, 4];

    fn region(z: usize) -> CacheRegion {
        CacheRegion::new(0, 0).with_extent(Extent::new(
            AxisRange::full(4),
            AxisRange::full(4),
            AxisRange::new(z, z),
        ))
    }
    fn slice(value: u8) -> Vec<u8> { vec![value; 16] }

    fn assert_consistent(cache: &VolumeCache) {
        let sum: usize = cache.lru.iter().map(|(_, e)| e.data.len()).sum();
        assert_eq!(cache.size(), sum);
        assert!(cache.size() <= cache.max_size());
        let bucketed: usize = cache.volumes.values().map(|v| v.entry_ids().count()).sum();
        assert_eq!(bucketed, cache.num_entries());
    }

    #[test]
    fn handles_do_not_cross_caches() {
        let mut first = VolumeCache::new(1000);
        let mut second = VolumeCache::new(1000);
        let volume = first.register_volume(1, 1, &[DIMS]);
        let other = second.register_volume(1, 1, &[DIMS]);
        assert_ne!(volume.id(), other.id());

        assert!(!second.insert(&volume, 0, &region(0), slice(1)));
        assert!(second.is_empty());
        assert!(first.insert(&volume, 0, &region(0), slice(1)));
        assert!(second.get(&volume, 0, &region(0)).is_none());
        assert!(!second.contains(&other, 0, &region(0)));
    }

    #[test]
    fn insert_then_get_full_extent() {
        let mut cache = VolumeCache::new(1000);
        let volume = cache.register_volume(2, 1, &[DIMS]);
        assert!(cache.insert(&volume, 1, &CacheRegion::new(0, 0), vec![7u8; 64]));

        let data = cache.get(&volume, 1, &CacheRegion::new(0, 0)).unwrap();
        assert_eq!(data.len(), 64);
        assert!(cache.get(&volume, 0, &CacheRegion::new(0, 0)).is_none());
        assert_eq!(cache.size(), 64);
        assert_eq!(cache.num_entries(), 1);
        assert_consistent(&cache);
    }

    #[test]
    fn evicts_least_recently_used_first() {
        let mut cache = VolumeCache::new(48);
        let volume = cache.register_volume(1, 1, &[DIMS]);
        for z in 0..3 {
            assert!(cache.insert(&volume, 0, &region(z), slice(z as u8)));
        }
        assert!(cache.insert(&volume, 0, &region(3), slice(3)));

        assert!(!cache.contains(&volume, 0, &region(0)));
        for z in 1..4 {
            assert!(cache.contains(&volume, 0, &region(z)));
        }
        assert_eq!(cache.stats().evictions, 1);
        assert_consistent(&cache);
    }

    #[test]
    fn get_hit_changes_eviction_order() {
        let mut cache = VolumeCache::new(48);
        let volume = cache.register_volume(1, 1, &[DIMS]);
        for z in 0..3 {
            cache.insert(&volume, 0, &region(z), slice(z as u8));
        }
        assert!(cache.get(&volume, 0, &region(0)).is_some());
        cache.insert(&volume, 0, &region(3), slice(3));

        assert!(cache.contains(&volume, 0, &region(0)));
        assert!(!cache.contains(&volume, 0, &region(1)));
        assert_consistent(&cache);
    }

    #[test]
    fn overwrite_with_identical_extent_replaces_bytes() {
        let mut cache = VolumeCache::new(1000);
        let volume = cache.register_volume(1, 1, &[DIMS]);
        cache.insert(&volume, 0, &region(0), slice(1));
        cache.insert(&volume, 0, &region(1), slice(2));
        assert!(cache.insert(&volume, 0, &region(0), slice(9)));

        assert_eq!(cache.num_entries(), 2);
        assert_eq!(cache.size(), 32);
        assert_eq!(&cache.get(&volume, 0, &region(0)).unwrap()[..], &slice(9)[..]);
        assert_consistent(&cache);
    }

    #[test]
    fn overwrite_promotes_entry() {
        let mut cache = VolumeCache::new(48);
        let volume = cache.register_volume(1, 1, &[DIMS]);
        for z in 0..3 {
            cache.insert(&volume, 0, &region(z), slice(z as u8));
        }
        cache.insert(&volume, 0, &region(0), slice(5));
        cache.insert(&volume, 0, &region(3), slice(3));
        assert!(cache.contains(&volume, 0, &region(0)));
        assert!(!cache.contains(&volume, 0, &region(1)));
    }

    #[test]
    fn rejects_invalid_inserts_without_mutation() {
        let mut cache = VolumeCache::new(32);
        let volume = cache.register_volume(1, 1, &[DIMS]);
        cache.insert(&volume, 0, &region(0), slice(1));
        let before = cache.stats();

        // length does not match extent volume
        assert!(!cache.insert(&volume, 0, &region(1), vec![0u8; 15]));
        // inverted extent
        let inverted = CacheRegion::new(0, 0).with_extent(Extent::new(
            AxisRange::full(4),
            AxisRange::full(4),
            AxisRange::new(2, 0),
        ));
        assert!(!cache.insert(&volume, 0, &inverted, Vec::<u8>::new()));
        // outside scale dims
        let outside = CacheRegion::new(0, 0).with_extent(Extent::new(
            AxisRange::new(0, 4),
            AxisRange::full(4),
            AxisRange::new(0, 0),
        ));
        assert!(!cache.insert(&volume, 0, &outside, vec![0u8; 20]));
        // larger than the whole cache
        assert!(!cache.insert(&volume, 0, &CacheRegion::new(0, 0), vec![0u8; 64]));
        // unknown scale, time and channel
        assert!(!cache.insert(&volume, 0, &CacheRegion::new(1, 0), slice(0)));
        assert!(!cache.insert(&volume, 1, &region(1), slice(0)));
        assert!(!cache.insert(&volume, 0, &CacheRegion { time: 1, ..region(1) }, slice(0)));

        assert_eq!(cache.stats(), before);
        assert!(cache.contains(&volume, 0, &region(0)));
    }

    #[test]
    fn channel_lookups_mark_missing_channels() {
        let mut cache = VolumeCache::new(1000);
        let volume = cache.register_volume(3, 1, &[DIMS]);
        cache.insert(&volume, 0, &region(0), slice(0));
        cache.insert(&volume, 2, &region(0), slice(2));

        let all = cache.get_all_channels(&volume, &region(0));
        assert_eq!(all.iter().map(Option::is_some).collect::<Vec<_>>(), vec![true, false, true]);

        let some = cache.get_channels(&volume, &[2, 1], &region(0));
        assert_eq!(&some[0].as_ref().unwrap()[..], &slice(2)[..]);
        assert!(some[1].is_none());
    }

    #[test]
    fn clear_volume_only_touches_that_volume() {
        let mut cache = VolumeCache::new(1000);
        let a = cache.register_volume(1, 2, &[DIMS, [2, 2, 2]]);
        let b = cache.register_volume(1, 1, &[DIMS]);
        cache.insert(&a, 0, &region(0), slice(0));
        cache.insert(&a, 0, &CacheRegion::new(1, 1), vec![0u8; 8]);
        cache.insert(&b, 0, &region(0), slice(1));

        cache.clear_volume(&a);
        assert_eq!(cache.num_entries(), 1);
        assert_eq!(cache.size(), 16);
        assert!(cache.contains(&b, 0, &region(0)));
        assert!(!cache.contains(&a, 0, &region(0)));
        assert_consistent(&cache);

        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.size(), 0);
        assert!(cache.insert(&a, 0, &region(0), slice(0)));
        assert_consistent(&cache);
    }

    #[test]
    fn unregistered_volume_rejects_inserts() {
        let mut cache = VolumeCache::new(1000);
        let volume = cache.register_volume(1, 1, &[DIMS]);
        cache.insert(&volume, 0, &region(0), slice(0));
        cache.unregister_volume(&volume);
        assert!(cache.is_empty());
        assert!(!cache.insert(&volume, 0, &region(0), slice(0)));
    }

    #[test]
    fn size_invariant_holds_over_mixed_workload() {
        let mut cache = VolumeCache::new(100);
        let volume = cache.register_volume(2, 3, &[[8, 8, 8]]);
        for i in 0..200usize {
            let z = i % 8;
            let len = 1 + (i * 7) % 5;
            let r = CacheRegion::new(0, i % 3).with_extent(Extent::new(
                AxisRange::new(0, len - 1),
                AxisRange::new(0, 3),
                AxisRange::new(z, z),
            ));
            cache.insert(&volume, i % 2, &r, vec![i as u8; len * 4]);
            if i % 5 == 0 {
                cache.get(&volume, (i + 1) % 2, &r);
            }
            assert_consistent(&cache);
        }
    }
}
