use crate::cache::DEFAULT_MAX_CACHE_SIZE;
use crate::prefetch::PrefetchDirection;
use crate::queue::{DEFAULT_MAX_ACTIVE_REQUESTS, DEFAULT_MAX_LOW_PRIORITY_REQUESTS};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct PrefetchConfig {
    /// Maximum look-ahead in chunks, TZYX order
    pub max_offset: [usize; 4],
    pub priority_directions: Vec<PrefetchDirection>,
    /// Upper bound of prefetch requests issued per load
    pub max_chunks: usize,
}
impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            max_offset: [0, 2, 2, 2],
            priority_directions: Vec::new(),
            max_chunks: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Byte budget of the chunk cache
    pub max_cache_size: usize,
    pub max_active_requests: usize,
    pub max_low_priority_requests: usize,
    pub prefetch: PrefetchConfig,
}
impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            max_cache_size: DEFAULT_MAX_CACHE_SIZE,
            max_active_requests: DEFAULT_MAX_ACTIVE_REQUESTS,
            max_low_priority_requests: DEFAULT_MAX_LOW_PRIORITY_REQUESTS,
            prefetch: PrefetchConfig::default(),
        }
    }
}
impl LoaderConfig {
    pub fn from_json(json: &str) -> Result<Self> { serde_json::from_str(json).context("Failed to parse loader config") }
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path).with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_json(&json)
    }
}
