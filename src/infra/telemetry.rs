use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
///
/// Logs go to stderr so command output on stdout stays machine-readable.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

/// Register metric descriptions with the installed recorder. Runs once.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "courier_cache_hit_total",
            Unit::Count,
            "Total number of in-memory query cache hits."
        );
        describe_counter!(
            "courier_cache_miss_total",
            Unit::Count,
            "Total number of in-memory query cache misses."
        );
        describe_counter!(
            "courier_cache_evict_total",
            Unit::Count,
            "Total number of query cache entries evicted due to capacity."
        );
        describe_counter!(
            "courier_cache_invalidated_total",
            Unit::Count,
            "Total number of query cache entries cleared by hydration rules."
        );
        describe_counter!(
            "courier_cache_persist_reclaim_total",
            Unit::Count,
            "Total number of persistent entries reclaimed after a quota error."
        );
        describe_counter!(
            "courier_cache_persist_write_dropped_total",
            Unit::Count,
            "Total number of persistent writes dropped after the retry failed."
        );
        describe_histogram!(
            "courier_cache_hydration_ms",
            Unit::Milliseconds,
            "Time spent applying hydration rules for one event, in milliseconds."
        );
    });
}
