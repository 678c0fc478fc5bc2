use anyhow::{Context, Result};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use opentelemetry::global;
use opentelemetry::trace::TracerProvider;
use opentelemetry::KeyValue;
use opentelemetry_sdk::resource::Resource;
use opentelemetry_sdk::trace::{Sampler, SdkTracerProvider};
use opentelemetry_stdout::SpanExporter;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const OTEL_STDOUT_ENV: &str = "TIDELINE_OTEL_STDOUT";
const DEFAULT_FILTER: &str = "info";

/// Handler runs are mostly short; the tail buckets catch stuck jobs.
const JOB_DURATION_BUCKETS: &[f64] = &[0.005, 0.025, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0];

/// Process-wide logging, tracing and metrics. Dropping it flushes spans.
pub struct Telemetry {
    metrics_handle: PrometheusHandle,
    tracer_provider: Option<SdkTracerProvider>,
}

impl Telemetry {
    /// `service` names the process in exported spans, e.g. `tideline-worker`.
    pub fn init(service: &'static str) -> Result<Self> {
        let metrics_handle = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Full("tideline_job_duration_seconds".into()),
                JOB_DURATION_BUCKETS,
            )
            .context("invalid histogram buckets")?
            .install_recorder()
            .context("failed to install Prometheus metrics recorder")?;

        let fmt = tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_filter(env_filter());
        let tracer_provider = env_truthy(OTEL_STDOUT_ENV).then(|| stdout_provider(service));
        let otel = tracer_provider.as_ref().map(|provider| {
            tracing_opentelemetry::layer()
                .with_tracer(provider.tracer(service))
                .with_filter(env_filter())
        });
        tracing_subscriber::registry()
            .with(fmt)
            .with(otel)
            .try_init()
            .context("failed to initialise tracing subscriber")?;

        if let Some(provider) = &tracer_provider {
            global::set_tracer_provider(provider.clone());
            info!(service, "OpenTelemetry stdout exporter enabled ({OTEL_STDOUT_ENV}=1)");
        }

        Ok(Self {
            metrics_handle,
            tracer_provider,
        })
    }

    pub fn metrics_handle(&self) -> PrometheusHandle {
        self.metrics_handle.clone()
    }
}

impl Drop for Telemetry {
    fn drop(&mut self) {
        if let Some(provider) = &self.tracer_provider {
            if let Err(err) = provider.shutdown() {
                warn!(error = %err, "failed to shutdown OpenTelemetry tracer provider");
            }
        }
    }
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

fn stdout_provider(service: &'static str) -> SdkTracerProvider {
    SdkTracerProvider::builder()
        .with_simple_exporter(SpanExporter::default())
        .with_sampler(Sampler::AlwaysOn)
        .with_resource(
            Resource::builder()
                .with_attributes(vec![KeyValue::new("service.name", service)])
                .build(),
        )
        .build()
}

fn env_truthy(key: &str) -> bool {
    std::env::var(key)
        .map(|value| matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthy_values() {
        std::env::set_var("TIDELINE_TEST_TRUTHY_ON", "Yes");
        std::env::set_var("TIDELINE_TEST_TRUTHY_OFF", "0");
        assert!(env_truthy("TIDELINE_TEST_TRUTHY_ON"));
        assert!(!env_truthy("TIDELINE_TEST_TRUTHY_OFF"));
        assert!(!env_truthy("TIDELINE_TEST_TRUTHY_UNSET"));
    }
}
