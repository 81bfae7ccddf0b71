use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{Resource, runtime, trace as sdktrace};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global subscriber with an env filter and JSON output. Spans are
/// also exported over OTLP when an endpoint is given and the exporter starts.
pub fn init_tracing(service_name: &str, log_level: &str, otlp_endpoint: Option<&str>) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    let telemetry = otlp_endpoint
        .and_then(|endpoint| otlp_tracer(service_name, endpoint))
        .map(|tracer| tracing_opentelemetry::layer().with_tracer(tracer));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(telemetry)
        .with(
            tracing_subscriber::fmt::layer()
                .with_file(true)
                .with_line_number(true)
                .json()
                .flatten_event(true),
        )
        .init();
}

fn otlp_tracer(service_name: &str, endpoint: &str) -> Option<sdktrace::Tracer> {
    let otlp_exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(endpoint);

    match opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(otlp_exporter)
        .with_trace_config(sdktrace::config().with_resource(Resource::new(vec![
            KeyValue::new("service.name", service_name.to_string()),
        ])))
        .install_batch(runtime::Tokio)
    {
        Ok(tracer) => Some(tracer),
        Err(e) => {
            // Subscriber is not installed yet
            eprintln!(
                "Failed to initialize OTLP tracer for service '{}' at endpoint '{}', exporting disabled: {}",
                service_name, endpoint, e
            );
            None
        }
    }
}
