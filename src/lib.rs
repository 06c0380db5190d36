#![warn(clippy::all, rust_2018_idioms)]

pub mod cache;
pub mod config;
pub mod error;
pub mod extent;
pub mod loader;
pub mod prefetch;
pub mod queue;

pub use cache::{CacheRegion, CacheStats, CachedVolume, VolumeCache};
pub use config::{LoaderConfig, PrefetchConfig};
pub use error::{QueueError, RequestError};
pub use extent::{AxisRange, ChunkCoord, Extent};
pub use loader::{ChunkData, ChunkLoader, ChunkSource, ScaleLevel};
pub use prefetch::{ChunkPrefetchIterator, PrefetchDirection};
pub use queue::{CompletionHandle, RequestOptions, RequestQueue, RequestState, SubscribableRequestQueue, SubscriberId};
