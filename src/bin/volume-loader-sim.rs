use anyhow::Result;
use clap::Parser;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use volume_loader::extent::{C, X, Y, Z};
use volume_loader::{ChunkCoord, ChunkLoader, ChunkSource, LoaderConfig, ScaleLevel};

#[derive(Parser, Debug)]
#[command(name = "volume-loader-sim", about = "Streams a synthetic volume through the chunk loader")]
struct Args {
    /// JSON loader config, defaults are used for missing fields
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    max_cache_size: Option<usize>,
    #[arg(long)]
    max_active_requests: Option<usize>,
    /// Simulated fetch latency in milliseconds
    #[arg(long, default_value_t = 20)]
    latency_ms: u64,
    /// Voxel size of the synthetic volume along z, y and x
    #[arg(long, default_value_t = 512)]
    size: usize,
    #[arg(long, default_value_t = 64)]
    chunk_size: usize,
    #[arg(long, default_value_t = 3)]
    scales: usize,
    /// Number of steps the simulated viewer walks along x
    #[arg(long, default_value_t = 8)]
    steps: usize,
}

/// Volume whose voxels hold the xor of their coordinates.
struct SyntheticSource {
    levels: Vec<ScaleLevel>,
    latency: Duration,
}
impl SyntheticSource {
    fn new(size: usize, chunk_size: usize, scales: usize, latency: Duration) -> Self {
        let levels = (0..scales)
            .map(|s| {
                let len = (size >> s).max(1);
                ScaleLevel {
                    shape: [1, 1, len, len, len],
                    chunk_shape: [chunk_size; 3],
                }
            })
            .collect();
        SyntheticSource { levels, latency }
    }
}
impl ChunkSource for SyntheticSource {
    fn id(&self) -> &str { "synthetic" }
    fn levels(&self) -> &[ScaleLevel] { &self.levels }
    fn fetch_chunk(&self, scale: usize, coord: ChunkCoord) -> BoxFuture<'static, Result<Vec<u8>>> {
        let extent = self.levels[scale].chunk_extent(&coord);
        let latency = self.latency;
        async move {
            tokio::time::sleep(latency).await;
            let mut data = Vec::with_capacity(extent.volume());
            for z in extent.z.min..=extent.z.max {
                for y in extent.y.min..=extent.y.max {
                    for x in extent.x.min..=extent.x.max {
                        data.push((x ^ y ^ z ^ coord[C]) as u8);
                    }
                }
            }
            Ok(data)
        }
        .boxed()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => LoaderConfig::from_json_file(path)?,
        None => LoaderConfig::default(),
    };
    if let Some(size) = args.max_cache_size {
        config.max_cache_size = size;
    }
    if let Some(active) = args.max_active_requests {
        config.max_active_requests = active;
    }
    log::info!("loader config: {config:?}");

    let source = Arc::new(SyntheticSource::new(
        args.size,
        args.chunk_size,
        args.scales.max(1),
        Duration::from_millis(args.latency_ms),
    ));
    let grid = source.levels()[0].grid_shape();
    let loader = ChunkLoader::new(source, &config)?;
    let viewer = loader.add_subscriber();

    let center = [grid[Z] / 2, grid[Y] / 2];
    for step in 0..args.steps.min(grid[X]) {
        let started = Instant::now();
        let chunk: ChunkCoord = [0, 0, center[0], center[1], step];
        let handles = loader.load_chunks(viewer, 0, &[chunk])?;
        for handle in handles {
            match handle.wait().await {
                Ok(data) => log::debug!("chunk {chunk:?}: {} bytes", data.len()),
                Err(err) => log::warn!("chunk {chunk:?}: {err}"),
            }
        }
        println!(
            "step {step}: {:?} after {:?}, cache {:?}",
            chunk,
            started.elapsed(),
            loader.cache_stats()
        );
    }

    let cancelled = loader.cancel_prefetch();
    loader.remove_subscriber(viewer);
    println!("cancelled {cancelled} prefetches, final cache {:?}", loader.cache_stats());
    Ok(())
}
