use anyhow::{Context, Result};
use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use opentelemetry::global;
use opentelemetry::trace::TracerProvider;
use opentelemetry::KeyValue;
use opentelemetry_sdk::resource::Resource;
use opentelemetry_sdk::trace::{Sampler, SdkTracerProvider};
use opentelemetry_stdout::SpanExporter;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const SERVICE_NAME: &str = "beach-pier";
const OTEL_STDOUT_ENV: &str = "BEACH_PIER_OTEL_STDOUT";
/// Log filter override; `RUST_LOG` is consulted when it is unset.
const LOG_ENV: &str = "BEACH_PIER_LOG";
/// Pier crates log at info; hyper, axum and tungstenite only report warnings.
const DEFAULT_FILTER: &str = "warn,beach_pier_server=info,beach_pier_core=info";

/// Process-wide logging, tracing and metrics setup. Dropping it flushes the
/// tracer provider when one was installed.
pub struct Telemetry {
    metrics_handle: PrometheusHandle,
    tracer_provider: Option<SdkTracerProvider>,
}

impl Telemetry {
    pub fn init() -> Result<Self> {
        let metrics_handle = PrometheusBuilder::new()
            .install_recorder()
            .context("failed to install Prometheus metrics recorder")?;
        describe_metrics();

        let tracer_provider = if env_truthy(OTEL_STDOUT_ENV) {
            let provider = SdkTracerProvider::builder()
                .with_simple_exporter(SpanExporter::default())
                .with_sampler(Sampler::AlwaysOn)
                .with_resource(
                    Resource::builder()
                        .with_attributes(vec![
                            KeyValue::new("service.name", SERVICE_NAME),
                            KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                        ])
                        .build(),
                )
                .build();
            let tracer = provider.tracer(SERVICE_NAME);

            global::set_tracer_provider(provider.clone());
            tracing_subscriber::registry()
                .with(env_filter())
                .with(tracing_subscriber::fmt::layer().with_target(false))
                .with(tracing_opentelemetry::layer().with_tracer(tracer))
                .try_init()
                .context("failed to initialise tracing subscriber")?;
            info!("OpenTelemetry stdout exporter enabled ({OTEL_STDOUT_ENV}=1)");
            Some(provider)
        } else {
            tracing_subscriber::registry()
                .with(env_filter())
                .with(tracing_subscriber::fmt::layer().with_target(false))
                .try_init()
                .context("failed to initialise tracing subscriber")?;
            None
        };

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
    let directives = std::env::var(LOG_ENV)
        .or_else(|_| std::env::var(EnvFilter::DEFAULT_ENV))
        .ok();
    build_filter(directives.as_deref())
}

fn build_filter(directives: Option<&str>) -> EnvFilter {
    directives
        .filter(|value| !value.trim().is_empty())
        .and_then(|value| EnvFilter::try_new(value).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER))
}

fn describe_metrics() {
    describe_counter!(
        "beach_pier_connections_total",
        "Sockets accepted, labelled by whether the context was new or reloaded"
    );
    describe_counter!(
        "beach_pier_contexts_recycled_total",
        "Detached contexts destroyed by the idle recycler"
    );
    describe_gauge!("beach_pier_contexts_active", "Application contexts held by the registry");
    describe_gauge!("beach_pier_pool_available", "Outbound buffers free in the pool");
    describe_counter!(
        "beach_pier_flush_dropped_total",
        "Flushes abandoned because no outbound buffer was free"
    );
    describe_counter!(
        "beach_pier_write_failures_total",
        "Socket writes that failed, labelled closed, transport or timeout"
    );
    describe_counter!(
        "beach_pier_inbound_rejected_total",
        "Inbound messages that could not be dispatched"
    );
    describe_counter!(
        "beach_pier_command_ticks_total",
        "Repeating-command iterations run in response to terminal ticks"
    );
    describe_histogram!(
        "beach_pier_write_bytes",
        Unit::Bytes,
        "Size of each buffer written to a socket"
    );
    describe_histogram!(
        "beach_pier_write_duration_ms",
        Unit::Milliseconds,
        "Time spent writing one buffer to a socket"
    );
}

fn env_truthy(key: &str) -> bool {
    std::env::var(key)
        .map(|val| is_truthy(&val))
        .unwrap_or(false)
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
