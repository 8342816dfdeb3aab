//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{num::NonZeroUsize, path::PathBuf, str::FromStr, time::Duration};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::cache::is_safe_generation;

mod cli;

pub use cli::{CacheOverrides, CliArgs, Command, ExpireArgs, InspectArgs, VacuumArgs};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "isr-cache";
const ENV_PREFIX: &str = "ISR_CACHE";
const DEFAULT_ROOT_DIR: &str = ".isr-cache";
const DEFAULT_GENERATION: &str = "default";
const DEFAULT_MAX_BYTES: u64 = 50 * 1024 * 1024;
const DEFAULT_INDEX_FLUSH_DEBOUNCE_MS: u64 = 100;
const DEFAULT_PREFILL_CONCURRENCY: u64 = 8;
const DEFAULT_IMAGE_ROUTE: &str = "/_image";
const DEFAULT_IMAGE_SWR_SECS: u64 = 86_400;

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub cache: CacheSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub root_dir: PathBuf,
    pub generation: String,
    pub max_bytes: NonZeroUsize,
    pub index_flush_debounce: Duration,
    pub prefill: bool,
    pub prefill_concurrency: NonZeroUsize,
    pub image_route: Option<String>,
    pub image_swr_secs: u64,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    if let Some(command) = cli.command.as_ref() {
        raw.apply_overrides(command.overrides());
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    cache: RawCacheSettings,
}

impl RawSettings {
    fn apply_overrides(&mut self, overrides: &CacheOverrides) {
        if let Some(dir) = overrides.root_dir.as_ref() {
            self.cache.root_dir = Some(dir.clone());
        }
        if let Some(generation) = overrides.generation.as_ref() {
            self.cache.generation = Some(generation.clone());
        }
        if let Some(bytes) = overrides.max_bytes {
            self.cache.max_bytes = Some(bytes);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings { logging, cache } = raw;

        let logging = build_logging_settings(logging)?;
        let cache = build_cache_settings(cache)?;

        Ok(Self { logging, cache })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let root_dir = cache
        .root_dir
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ROOT_DIR));
    if root_dir.as_os_str().is_empty() {
        return Err(LoadError::invalid("cache.root_dir", "must not be empty"));
    }

    let generation = cache
        .generation
        .map(|value| value.trim().to_string())
        .unwrap_or_else(|| DEFAULT_GENERATION.to_string());
    if !is_safe_generation(&generation) {
        return Err(LoadError::invalid(
            "cache.generation",
            format!("`{generation}` must be a single path component"),
        ));
    }

    let max_bytes = non_zero_usize(
        cache.max_bytes.unwrap_or(DEFAULT_MAX_BYTES),
        "cache.max_bytes",
    )?;
    let prefill_concurrency = non_zero_usize(
        cache
            .prefill_concurrency
            .unwrap_or(DEFAULT_PREFILL_CONCURRENCY),
        "cache.prefill_concurrency",
    )?;

    let index_flush_debounce = Duration::from_millis(
        cache
            .index_flush_debounce_ms
            .unwrap_or(DEFAULT_INDEX_FLUSH_DEBOUNCE_MS),
    );

    let image_route = match cache.image_route {
        None => Some(DEFAULT_IMAGE_ROUTE.to_string()),
        Some(route) => {
            let trimmed = route.trim();
            if trimmed.is_empty() {
                None
            } else if !trimmed.starts_with('/') {
                return Err(LoadError::invalid(
                    "cache.image_route",
                    "must start with `/` (or be empty to disable)",
                ));
            } else {
                Some(trimmed.trim_end_matches('/').to_string())
            }
        }
    };

    Ok(CacheSettings {
        root_dir,
        generation,
        max_bytes,
        index_flush_debounce,
        prefill: cache.prefill.unwrap_or(false),
        prefill_concurrency,
        image_route,
        image_swr_secs: cache.image_swr_secs.unwrap_or(DEFAULT_IMAGE_SWR_SECS),
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    root_dir: Option<PathBuf>,
    generation: Option<String>,
    max_bytes: Option<u64>,
    index_flush_debounce_ms: Option<u64>,
    prefill: Option<bool>,
    prefill_concurrency: Option<u64>,
    image_route: Option<String>,
    image_swr_secs: Option<u64>,
}

fn non_zero_usize(value: u64, key: &'static str) -> Result<NonZeroUsize, LoadError> {
    let value: usize = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for usize"))?;
    NonZeroUsize::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}
