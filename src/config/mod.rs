//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::str::FromStr;

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::cache::{CacheConfig, HydrationRules};

mod cli;

pub use cli::{CliArgs, Command, Overrides, PurgeArgs, ReplayArgs, RulesArgs};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "courier-cache";
const ENV_PREFIX: &str = "COURIER_CACHE";

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub cache: CacheConfig,
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

    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .try_parsing(true),
    );

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;
    raw.apply_overrides(&cli.overrides);
    if let Command::Purge(args) = &cli.command {
        raw.apply_purge_overrides(args);
    }

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    cache: CacheConfig,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

impl RawSettings {
    fn apply_overrides(&mut self, overrides: &Overrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(max_entries) = overrides.max_entries {
            self.cache.max_entries = max_entries;
        }
    }

    fn apply_purge_overrides(&mut self, args: &PurgeArgs) {
        if let Some(dir) = args.storage_dir.as_ref() {
            self.cache.storage_dir = Some(dir.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings { logging, cache } = raw;

        let logging = build_logging_settings(logging)?;
        validate_cache(&cache)?;

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

fn validate_cache(cache: &CacheConfig) -> Result<(), LoadError> {
    if cache.max_entries == 0 {
        return Err(LoadError::invalid(
            "cache.max_entries",
            "must be greater than zero",
        ));
    }
    if !(cache.evict_fraction.is_finite()
        && cache.evict_fraction > 0.0
        && cache.evict_fraction <= 1.0)
    {
        return Err(LoadError::invalid(
            "cache.evict_fraction",
            "must be within (0, 1]",
        ));
    }
    if cache.reclaim_batch == 0 {
        return Err(LoadError::invalid(
            "cache.reclaim_batch",
            "must be greater than zero",
        ));
    }
    if cache.namespace.is_empty() {
        return Err(LoadError::invalid("cache.namespace", "must not be empty"));
    }
    if cache.expiry_index_key.is_empty() {
        return Err(LoadError::invalid(
            "cache.expiry_index_key",
            "must not be empty",
        ));
    }
    if cache.expiry_index_key.starts_with(&cache.namespace) {
        return Err(LoadError::invalid(
            "cache.expiry_index_key",
            "must not start with the entry namespace",
        ));
    }
    if let Some(dir) = cache.storage_dir.as_ref()
        && dir.as_os_str().is_empty()
    {
        return Err(LoadError::invalid("cache.storage_dir", "must not be empty"));
    }

    let mut rules = HydrationRules::empty();
    for (event_type, patterns) in &cache.rules {
        rules
            .add(event_type, patterns)
            .map_err(|err| LoadError::invalid("cache.rules", err.to_string()))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests;
