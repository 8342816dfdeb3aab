use std::path::PathBuf;

use clap::{ArgGroup, Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};

/// Command-line arguments for the isr-cache binary.
#[derive(Debug, Parser)]
#[command(name = "isr-cache", version, about = "Incremental static regeneration cache tools")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(
        long = "config-file",
        env = "ISR_CACHE_CONFIG_FILE",
        value_name = "PATH",
        value_hint = ValueHint::FilePath
    )]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Show occupancy and the keys stored for the current generation.
    Inspect(InspectArgs),
    /// Delete the directories of previously recorded generations.
    Vacuum(VacuumArgs),
    /// Delete one cached response, or all of them.
    Expire(ExpireArgs),
}

impl Command {
    pub fn overrides(&self) -> &CacheOverrides {
        match self {
            Self::Inspect(args) => &args.overrides,
            Self::Vacuum(args) => &args.overrides,
            Self::Expire(args) => &args.overrides,
        }
    }
}

impl Default for Command {
    fn default() -> Self {
        Self::Inspect(InspectArgs::default())
    }
}

#[derive(Debug, Args, Default, Clone)]
pub struct InspectArgs {
    #[command(flatten)]
    pub overrides: CacheOverrides,

    /// List every key known to the disk tier.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub keys: bool,
}

#[derive(Debug, Args, Default, Clone)]
pub struct VacuumArgs {
    #[command(flatten)]
    pub overrides: CacheOverrides,
}

#[derive(Debug, Args, Clone)]
#[command(group(ArgGroup::new("target").required(true).args(["key", "all"])))]
pub struct ExpireArgs {
    #[command(flatten)]
    pub overrides: CacheOverrides,

    /// Cache key to expire (request path plus query).
    #[arg(long, value_name = "KEY")]
    pub key: Option<String>,

    /// Expire every cached response.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub all: bool,
}

#[derive(Debug, Args, Default, Clone)]
pub struct CacheOverrides {
    /// Override the cache root directory.
    #[arg(long = "cache-root-dir", value_name = "PATH", value_hint = ValueHint::DirPath)]
    pub root_dir: Option<PathBuf>,

    /// Override the current build generation.
    #[arg(long = "cache-generation", value_name = "ID")]
    pub generation: Option<String>,

    /// Override the memory-tier budget in bytes.
    #[arg(long = "cache-max-bytes", value_name = "BYTES")]
    pub max_bytes: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,
}
