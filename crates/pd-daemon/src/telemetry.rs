//! Tracing bootstrap: console logs always, OTLP export when sampled in.

use std::env;

use anyhow::Result;
use opentelemetry::{global, KeyValue};
use opentelemetry_sdk::{
    propagation::TraceContextPropagator,
    resource::Resource,
    runtime::Tokio,
    trace::{self, Sampler},
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const SAMPLING_ENV: &str = "PORT_DADDY_OTEL_SAMPLING_RATE";

/// Keeps the OTLP pipeline alive for the process lifetime and flushes it on
/// shutdown.
#[derive(Debug)]
pub struct TelemetryGuard {
    tracer_installed: bool,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if self.tracer_installed {
            global::shutdown_tracer_provider();
        }
    }
}

pub fn init(service_name: &str) -> Result<TelemetryGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let sampling_rate = sampling_rate_from_env();

    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer());

    if sampling_rate <= 0.0 {
        registry.init();
        return Ok(TelemetryGuard {
            tracer_installed: false,
        });
    }

    match build_tracer(service_name, sampling_rate) {
        Ok(tracer) => {
            registry
                .with(tracing_opentelemetry::layer().with_tracer(tracer))
                .init();
            info!(sampling_rate, "OTLP trace export enabled");
            Ok(TelemetryGuard {
                tracer_installed: true,
            })
        }
        Err(error) => {
            registry.init();
            warn!(%error, "OTLP exporter unavailable; continuing with console logs only");
            Ok(TelemetryGuard {
                tracer_installed: false,
            })
        }
    }
}

fn build_tracer(service_name: &str, sampling_rate: f64) -> Result<trace::Tracer> {
    global::set_text_map_propagator(TraceContextPropagator::new());
    let exporter = opentelemetry_otlp::new_exporter().tonic();
    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_trace_config(
            trace::Config::default()
                .with_sampler(Sampler::TraceIdRatioBased(sampling_rate))
                .with_resource(Resource::new(vec![KeyValue::new(
                    "service.name",
                    service_name.to_string(),
                )])),
        )
        .with_exporter(exporter)
        .install_batch(Tokio)?;
    Ok(tracer)
}

/// Unset or unparsable values disable export rather than erroring; a daemon
/// must come up even when observability is misconfigured.
fn sampling_rate_from_env() -> f64 {
    match env::var(SAMPLING_ENV) {
        Err(_) => 0.0,
        Ok(value) => value.trim().parse::<f64>().map_or(0.0, |rate| rate.clamp(0.0, 1.0)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sampling_rate_defaults_to_disabled() {
        env::remove_var(SAMPLING_ENV);
        assert_eq!(sampling_rate_from_env(), 0.0);

        env::set_var(SAMPLING_ENV, "0.25");
        assert_eq!(sampling_rate_from_env(), 0.25);

        env::set_var(SAMPLING_ENV, "7");
        assert_eq!(sampling_rate_from_env(), 1.0);

        env::set_var(SAMPLING_ENV, "not-a-rate");
        assert_eq!(sampling_rate_from_env(), 0.0);
        env::remove_var(SAMPLING_ENV);
    }
}
