use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};

/// Command-line arguments for the courier-cache binary.
#[derive(Debug, Parser)]
#[command(
    name = "courier-cache",
    version,
    about = "Inspect and exercise the courier query cache"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(
        long = "config-file",
        env = "COURIER_CACHE_CONFIG_FILE",
        value_name = "PATH",
        global = true
    )]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: Overrides,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Print the effective hydration rule table.
    Rules(RulesArgs),
    /// Seed a cache with keys, publish events from a JSON-lines file, and report what survives.
    Replay(ReplayArgs),
    /// Drop expired entries from a file-backed persistent cache.
    Purge(PurgeArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct Overrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new(),
        global = true
    )]
    pub log_json: Option<bool>,

    /// Override the in-memory entry limit.
    #[arg(long = "max-entries", value_name = "COUNT", global = true)]
    pub max_entries: Option<usize>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct RulesArgs {
    /// Emit the table as JSON instead of text.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub json: bool,
}

#[derive(Debug, Args, Clone)]
pub struct ReplayArgs {
    /// File listing one cache key per line to seed before replaying.
    #[arg(long = "keys", value_name = "FILE", value_hint = ValueHint::FilePath)]
    pub keys: PathBuf,

    /// JSON-lines file of `{"type", "payload", "timestamp"}` events.
    #[arg(value_name = "EVENTS", value_hint = ValueHint::FilePath)]
    pub events: PathBuf,
}

#[derive(Debug, Args, Default, Clone)]
pub struct PurgeArgs {
    /// Storage directory; defaults to `cache.storage_dir` from configuration.
    #[arg(long = "storage-dir", value_name = "DIR", value_hint = ValueHint::DirPath)]
    pub storage_dir: Option<PathBuf>,
}
