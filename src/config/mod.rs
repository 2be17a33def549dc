//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    num::{NonZeroU64, NonZeroUsize},
    path::PathBuf,
    str::FromStr,
};

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "biztrack";
const ENV_PREFIX: &str = "BIZTRACK";
const DEFAULT_MEMORY_CAPACITY: u64 = 256;
const DEFAULT_PERSISTENT_DIR: &str = ".biztrack-cache";
const DEFAULT_PAGE_SIZE: u64 = 50;
const DEFAULT_OWNER_SCOPE: &str = "users";

/// Command-line arguments for the biztrack binary.
#[derive(Debug, Parser)]
#[command(
    name = "biztrack",
    version,
    about = "Reactive data layer for business records"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "BIZTRACK_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: Overrides,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Inspect or clear the on-disk view cache.
    Cache(CacheArgs),
    /// Build and print an organisation hierarchy from a JSON file of nodes.
    #[command(name = "org-tree")]
    OrgTree(OrgTreeArgs),
    /// Run a scripted session against an in-memory store.
    Demo,
}

#[derive(Debug, Args, Clone)]
pub struct CacheArgs {
    #[command(subcommand)]
    pub command: CacheCommand,
}

#[derive(Debug, Subcommand, Clone)]
pub enum CacheCommand {
    /// Print entry counts for both tiers.
    Stats,
    /// Print a cached entry as JSON.
    Get {
        /// Full cache key, e.g. `u1:clients:{...}`. `%` and `:` in the owner are
        /// percent-encoded.
        #[arg(long, value_name = "KEY")]
        key: String,
    },
    /// Remove every cached entry belonging to an owner.
    Clear {
        #[arg(long, value_name = "OWNER_ID")]
        owner: String,
    },
}

#[derive(Debug, Args, Clone)]
pub struct OrgTreeArgs {
    /// JSON array of organisation nodes.
    #[arg(long, value_name = "FILE", value_hint = ValueHint::FilePath)]
    pub input: PathBuf,
}

#[derive(Debug, Args, Default, Clone)]
pub struct Overrides {
    /// Override the log level (`error`, `warn`, `info`, `debug`, `trace`).
    #[arg(long = "log-level", value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Emit JSON logs regardless of configuration.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new(),
        global = true
    )]
    pub log_json: Option<bool>,

    /// Override the persistent cache directory.
    #[arg(long = "cache-dir", value_name = "PATH", value_hint = ValueHint::DirPath, global = true)]
    pub cache_dir: Option<PathBuf>,

    /// Override the in-process cache capacity.
    #[arg(long = "cache-memory-capacity", value_name = "COUNT", global = true)]
    pub cache_memory_capacity: Option<u64>,

    /// Run the cache memory-only.
    #[arg(long = "no-persistent", action = clap::ArgAction::SetTrue, global = true)]
    pub no_persistent: bool,

    /// Override the default page size of live views.
    #[arg(long = "page-size", value_name = "COUNT", global = true)]
    pub page_size: Option<u64>,
}

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub cache: CacheSettings,
    pub query: QuerySettings,
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
    pub memory_capacity: NonZeroUsize,
    pub persistent_dir: PathBuf,
    pub enable_persistent: bool,
    pub max_age_seconds: Option<NonZeroU64>,
}

#[derive(Debug, Clone)]
pub struct QuerySettings {
    pub default_page_size: NonZeroUsize,
    pub owner_scope: String,
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
    raw.apply_overrides(&cli.overrides);

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    cache: RawCacheSettings,
    query: RawQuerySettings,
}

impl RawSettings {
    fn apply_overrides(&mut self, overrides: &Overrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(dir) = overrides.cache_dir.as_ref() {
            self.cache.persistent_dir = Some(dir.clone());
        }
        if let Some(capacity) = overrides.cache_memory_capacity {
            self.cache.memory_capacity = Some(capacity);
        }
        if overrides.no_persistent {
            self.cache.enable_persistent = Some(false);
        }
        if let Some(page_size) = overrides.page_size {
            self.query.default_page_size = Some(page_size);
        }
    }
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
    memory_capacity: Option<u64>,
    persistent_dir: Option<PathBuf>,
    enable_persistent: Option<bool>,
    max_age_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawQuerySettings {
    default_page_size: Option<u64>,
    owner_scope: Option<String>,
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        Ok(Self {
            logging: build_logging_settings(raw.logging)?,
            cache: build_cache_settings(raw.cache)?,
            query: build_query_settings(raw.query)?,
        })
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
    let memory_capacity = non_zero_usize(
        cache.memory_capacity.unwrap_or(DEFAULT_MEMORY_CAPACITY),
        "cache.memory_capacity",
    )?;

    let persistent_dir = cache
        .persistent_dir
        .unwrap_or_else(|| PathBuf::from(DEFAULT_PERSISTENT_DIR));
    if persistent_dir.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "cache.persistent_dir",
            "must not be empty",
        ));
    }

    let max_age_seconds = cache
        .max_age_seconds
        .map(|value| {
            NonZeroU64::new(value).ok_or_else(|| {
                LoadError::invalid("cache.max_age_seconds", "must be greater than zero")
            })
        })
        .transpose()?;

    Ok(CacheSettings {
        memory_capacity,
        persistent_dir,
        enable_persistent: cache.enable_persistent.unwrap_or(true),
        max_age_seconds,
    })
}

fn build_query_settings(query: RawQuerySettings) -> Result<QuerySettings, LoadError> {
    let default_page_size = non_zero_usize(
        query.default_page_size.unwrap_or(DEFAULT_PAGE_SIZE),
        "query.default_page_size",
    )?;

    let owner_scope = query
        .owner_scope
        .map(|value| value.trim().trim_matches('/').to_string())
        .unwrap_or_else(|| DEFAULT_OWNER_SCOPE.to_string());
    if owner_scope.is_empty() {
        return Err(LoadError::invalid(
            "query.owner_scope",
            "must name a collection",
        ));
    }

    Ok(QuerySettings {
        default_page_size,
        owner_scope,
    })
}

fn non_zero_usize(value: u64, key: &'static str) -> Result<NonZeroUsize, LoadError> {
    let value = usize::try_from(value)
        .map_err(|_| LoadError::invalid(key, format!("value {value} is out of range")))?;
    NonZeroUsize::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

#[cfg(test)]
mod tests;
