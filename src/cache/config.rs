//! Cache configuration.
//!
//! Controls the response store and the revalidation handler via
//! `isr-cache.toml`.

use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

// Default values for cache configuration
const DEFAULT_ROOT_DIR: &str = ".isr-cache";
const DEFAULT_GENERATION: &str = "default";
const DEFAULT_MAX_BYTES: usize = 50 * 1024 * 1024;
const DEFAULT_INDEX_FLUSH_DEBOUNCE_MS: u64 = 100;
const DEFAULT_PREFILL_CONCURRENCY: usize = 8;
const DEFAULT_IMAGE_ROUTE: &str = "/_image";
const DEFAULT_IMAGE_SWR_SECS: u64 = 86_400;

/// Cache configuration from `isr-cache.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Directory holding one subdirectory per build generation.
    pub root_dir: PathBuf,
    /// Identifier of the current build generation.
    pub generation: String,
    /// Memory-tier budget in bytes.
    pub max_bytes: usize,
    /// Quiet period (ms) before the disk index is rewritten.
    pub index_flush_debounce_ms: u64,
    /// Load disk entries into memory in the background after opening.
    pub prefill: bool,
    /// Concurrent disk reads per pre-fill batch.
    pub prefill_concurrency: usize,
    /// Vacuum earlier generations when the store opens.
    pub vacuum_on_open: bool,
    /// Path prefix of the image endpoint, if any.
    pub image_route: Option<String>,
    /// `stale-while-revalidate` applied to image responses that only carry `max-age`.
    pub image_swr_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from(DEFAULT_ROOT_DIR),
            generation: DEFAULT_GENERATION.to_string(),
            max_bytes: DEFAULT_MAX_BYTES,
            index_flush_debounce_ms: DEFAULT_INDEX_FLUSH_DEBOUNCE_MS,
            prefill: false,
            prefill_concurrency: DEFAULT_PREFILL_CONCURRENCY,
            vacuum_on_open: true,
            image_route: Some(DEFAULT_IMAGE_ROUTE.to_string()),
            image_swr_secs: DEFAULT_IMAGE_SWR_SECS,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            root_dir: settings.root_dir.clone(),
            generation: settings.generation.clone(),
            max_bytes: settings.max_bytes.get(),
            index_flush_debounce_ms: settings.index_flush_debounce.as_millis() as u64,
            prefill: settings.prefill,
            prefill_concurrency: settings.prefill_concurrency.get(),
            vacuum_on_open: true,
            image_route: settings.image_route.clone(),
            image_swr_secs: settings.image_swr_secs,
        }
    }
}

impl CacheConfig {
    pub fn index_flush_debounce(&self) -> Duration {
        Duration::from_millis(self.index_flush_debounce_ms)
    }

    /// Returns the pre-fill batch size, clamping to 1 if zero.
    pub fn prefill_concurrency_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.prefill_concurrency).unwrap_or(NonZeroUsize::MIN)
    }

    /// True when `path` is served by the configured image endpoint.
    pub fn is_image_route(&self, path: &str) -> bool {
        route_matches(self.image_route.as_deref(), path)
    }
}

/// True when `path` is `route` itself or lies below it.
pub(crate) fn route_matches(route: Option<&str>, path: &str) -> bool {
    match route {
        Some(route) if !route.is_empty() => {
            path == route
                || path
                    .strip_prefix(route)
                    .is_some_and(|rest| rest.starts_with('/') || rest.starts_with('?'))
        }
        _ => false,
    }
}
