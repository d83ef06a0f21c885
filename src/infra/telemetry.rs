use std::sync::Once;

use metrics::{Unit, describe_counter};
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
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
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

/// Register descriptions for the page cache metrics. Safe to call repeatedly.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "pagefront_cache_hit_total",
            Unit::Count,
            "Total number of pages served from the cache."
        );
        describe_counter!(
            "pagefront_cache_miss_total",
            Unit::Count,
            "Total number of cacheable requests passed to the upstream."
        );
        describe_counter!(
            "pagefront_cache_not_modified_total",
            Unit::Count,
            "Total number of cache hits answered with 304 Not Modified."
        );
        describe_counter!(
            "pagefront_cache_redirect_total",
            Unit::Count,
            "Total number of cached redirects replayed."
        );
        describe_counter!(
            "pagefront_cache_bypass_total",
            Unit::Count,
            "Total number of requests that skipped the cache, by reason."
        );
        describe_counter!(
            "pagefront_cache_store_total",
            Unit::Count,
            "Total number of generated pages written to the cache."
        );
        describe_counter!(
            "pagefront_cache_skip_total",
            Unit::Count,
            "Total number of admitted pages that were not written, by reason."
        );
        describe_counter!(
            "pagefront_cache_genlock_total",
            Unit::Count,
            "Total number of regeneration lock attempts, by result."
        );
        describe_counter!(
            "pagefront_cache_store_error_total",
            Unit::Count,
            "Total number of failed store operations, by operation."
        );
    });
}
