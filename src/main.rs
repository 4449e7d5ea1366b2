use std::fs::File;
use std::io::{self, BufReader, Write};
use std::process;
use std::sync::Arc;

use courier_cache::{
    cache::{
        CacheServices, Clock, ManualClock, NullSink, PersistentCache, SystemClock, TracingSink,
        storage,
    },
    config,
    error::AppError,
    infra::{error::InfraError, telemetry},
    replay,
};
use serde::Serialize;
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt()
        .with_max_level(Level::ERROR)
        .with_writer(io::stderr)
        .finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match cli_args.command {
        config::Command::Rules(args) => run_rules(settings, args),
        config::Command::Replay(args) => run_replay(settings, args),
        config::Command::Purge(_) => run_purge(settings),
    }
}

fn run_rules(settings: config::Settings, args: config::RulesArgs) -> Result<(), AppError> {
    let services = CacheServices::new(
        settings.cache,
        Arc::new(storage::MemoryStorage::new()),
        Arc::new(NullSink),
        Arc::new(SystemClock),
    )?;
    let rules = services.hydration.get_rules();

    let mut stdout = io::stdout().lock();
    if args.json {
        print_json(&mut stdout, &rules)?;
    } else {
        for (event_type, patterns) in &rules {
            writeln!(stdout, "{event_type:<28} {}", patterns.join(", "))
                .map_err(InfraError::from)?;
        }
    }
    Ok(())
}

fn run_replay(settings: config::Settings, args: config::ReplayArgs) -> Result<(), AppError> {
    let keys = open(&args.keys)?;
    let events = open(&args.events)?;

    // Frozen clock; replay never writes to real storage.
    let clock = Arc::new(ManualClock::new(SystemClock.now_ms()));
    let services = CacheServices::new(
        settings.cache,
        Arc::new(storage::MemoryStorage::new()),
        Arc::new(TracingSink),
        clock,
    )?;

    let report = replay::replay(&services, keys, events)?;
    print_json(&mut io::stdout().lock(), &report)
}

fn run_purge(settings: config::Settings) -> Result<(), AppError> {
    let Some(dir) = settings.cache.storage_dir.clone() else {
        return Err(AppError::validation(
            "purge requires --storage-dir or cache.storage_dir",
        ));
    };

    let storage = storage::FileStorage::open(&dir, settings.cache.storage_quota_bytes)
        .map_err(|err| AppError::unexpected(format!("cannot open {}: {err}", dir.display())))?;
    let persistent = PersistentCache::new(
        Arc::new(storage),
        &settings.cache,
        Arc::new(SystemClock),
        Arc::new(TracingSink),
    );

    #[derive(Serialize)]
    struct PurgeReport {
        storage_dir: String,
        available: bool,
        remaining: usize,
    }

    let report = PurgeReport {
        storage_dir: dir.display().to_string(),
        available: persistent.is_available(),
        remaining: persistent.size(),
    };
    info!(
        storage_dir = %report.storage_dir,
        remaining = report.remaining,
        "Purge finished"
    );
    print_json(&mut io::stdout().lock(), &report)
}

fn open(path: &std::path::Path) -> Result<BufReader<File>, AppError> {
    File::open(path).map(BufReader::new).map_err(|err| {
        AppError::validation(format!("cannot read {}: {err}", path.display()))
    })
}

fn print_json<W: Write, T: Serialize>(out: &mut W, value: &T) -> Result<(), AppError> {
    serde_json::to_writer_pretty(&mut *out, value)
        .map_err(|err| AppError::unexpected(format!("failed to encode output: {err}")))?;
    writeln!(out).map_err(InfraError::from)?;
    Ok(())
}
