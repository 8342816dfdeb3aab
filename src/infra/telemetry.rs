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

pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "isr_store_memory_hit_total",
            Unit::Count,
            "Total number of lookups served from the memory tier."
        );
        describe_counter!(
            "isr_store_disk_hit_total",
            Unit::Count,
            "Total number of lookups served by loading from the disk tier."
        );
        describe_counter!(
            "isr_store_miss_total",
            Unit::Count,
            "Total number of lookups that found no entry on either tier."
        );
        describe_counter!(
            "isr_store_evict_total",
            Unit::Count,
            "Total number of entries evicted from the memory tier due to the byte budget."
        );
        describe_counter!(
            "isr_store_rejected_total",
            Unit::Count,
            "Total number of entries rejected for exceeding the whole byte budget."
        );
        describe_counter!(
            "isr_store_disk_error_total",
            Unit::Count,
            "Total number of failed entry writes or deletes."
        );
        describe_counter!(
            "isr_handler_responses_total",
            Unit::Count,
            "Responses returned by the revalidation handler, labelled by cache status."
        );
        describe_counter!(
            "isr_handler_renders_total",
            Unit::Count,
            "Origin renders started by the revalidation handler."
        );
        describe_counter!(
            "isr_handler_render_failures_total",
            Unit::Count,
            "Origin renders that returned an error."
        );
    });
}
