//! Prometheus exposition endpoint.

use axum::extract::State;
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, Registry, TextEncoder};

async fn metrics(State(registry): State<Registry>) -> String {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();
    let mut buffer = Vec::new();
    if let Err(error) = encoder.encode(&metric_families, &mut buffer) {
        ::tracing::error!(?error, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

pub fn launch(bind_to_addr: String, registry: Registry) {
    tokio::spawn(async move {
        let app = Router::new().route("/metrics", get(metrics)).with_state(registry);
        let listener = match tokio::net::TcpListener::bind(&bind_to_addr).await {
            Ok(listener) => listener,
            Err(error) => {
                ::tracing::error!(bind_to_addr, ?error, "Failed to bind metrics server");
                return;
            }
        };
        ::tracing::info!(bind_to_addr, "Metrics server listening");
        if let Err(error) = axum::serve(listener, app).await {
            ::tracing::error!(?error, "Metrics server stopped");
        }
    });
}
