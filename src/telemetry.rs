//! Tracing subscriber installation and metric descriptions.

use std::sync::Once;

use metrics::{Unit, describe_counter};
use thiserror::Error;
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

static METRIC_DESCRIPTIONS: Once = Once::new();

#[derive(Debug, Error)]
#[error("failed to install tracing subscriber: {0}")]
pub struct TelemetryError(String);

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), TelemetryError> {
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
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| TelemetryError(err.to_string()))
}

/// Register descriptions for every counter the data layer emits.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "biztrack_cache_memory_hit_total",
            Unit::Count,
            "Cache reads served by the in-process tier."
        );
        describe_counter!(
            "biztrack_cache_memory_miss_total",
            Unit::Count,
            "Cache reads that missed the in-process tier."
        );
        describe_counter!(
            "biztrack_cache_persistent_hit_total",
            Unit::Count,
            "Cache reads served by the on-disk tier."
        );
        describe_counter!(
            "biztrack_cache_evict_total",
            Unit::Count,
            "In-process cache evictions due to capacity."
        );
        describe_counter!(
            "biztrack_cache_persistent_error_total",
            Unit::Count,
            "On-disk cache operations that failed and were skipped."
        );
        describe_counter!(
            "biztrack_mutation_rollback_total",
            Unit::Count,
            "Optimistic writes restored after a rejected mutation."
        );
        describe_counter!(
            "biztrack_snapshot_applied_total",
            Unit::Count,
            "Live snapshots published to views."
        );
    });
}
