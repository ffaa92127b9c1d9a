//! Tracing pipeline initialisation.
//!
//! Call [`init_tracing`] once at process startup, before any node is
//! spawned, and hold the returned guard for the lifetime of the process.
//!
//! # Environment variables
//!
//! | Variable | Effect |
//! |---|---|
//! | `RUST_LOG` | Log filter (default `"info"`). |
//! | `ROBOKIT_LOG_FORMAT=json` | Emit newline-delimited JSON logs. |
//! | `OTEL_EXPORTER_OTLP_ENDPOINT` | OTLP collector base URL; when set, spans are exported over OTLP/HTTP. |

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{Resource, trace::SdkTracerProvider};
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialise the global `tracing` subscriber, optionally exporting spans
/// over OTLP.
///
/// Spans are exported only when `OTEL_EXPORTER_OTLP_ENDPOINT` is set;
/// otherwise logs go to the console formatter alone.  The returned
/// [`TracerProviderGuard`] must be held until process exit – dropping it
/// flushes any pending span batches.
pub fn init_tracing(service_name: &str) -> TracerProviderGuard {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = if std::env::var("ROBOKIT_LOG_FORMAT").as_deref() == Ok("json") {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().compact().boxed()
    };

    let provider = build_provider(service_name);
    let otel_layer = provider.as_ref().map(|p| {
        tracing_opentelemetry::layer().with_tracer(p.tracer("robokit"))
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(otel_layer)
        .with(fmt_layer)
        .init();

    TracerProviderGuard(provider)
}

/// RAII guard that shuts down the OTel provider on drop, flushing pending
/// spans before the process exits.
pub struct TracerProviderGuard(Option<SdkTracerProvider>);

impl Drop for TracerProviderGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.0.take()
            && let Err(e) = provider.shutdown()
        {
            eprintln!("[robokit] OpenTelemetry provider shutdown error: {e}");
        }
    }
}

/// Build a provider when `OTEL_EXPORTER_OTLP_ENDPOINT` is set, `None`
/// otherwise.  An exporter that fails to initialise degrades to plain
/// console logging instead of aborting startup.
fn build_provider(service_name: &str) -> Option<SdkTracerProvider> {
    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok()?;

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| eprintln!("[robokit] OTLP exporter init failed: {e}"))
        .ok()?;

    let resource = Resource::builder()
        .with_service_name(service_name.to_string())
        .build();

    Some(
        SdkTracerProvider::builder()
            .with_resource(resource)
            // The simple exporter needs no Tokio runtime at init time; nodes
            // and the connection manager bring up their runtimes later.
            .with_simple_exporter(exporter)
            .build(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_provider_returns_none_without_endpoint() {
        // SAFETY: single-threaded test; no other thread reads this env-var.
        unsafe { std::env::remove_var("OTEL_EXPORTER_OTLP_ENDPOINT") };
        assert!(build_provider("robokit-test").is_none());
    }

    #[test]
    fn guard_drop_without_provider_is_safe() {
        let guard = TracerProviderGuard(None);
        drop(guard); // must not panic
    }
}
