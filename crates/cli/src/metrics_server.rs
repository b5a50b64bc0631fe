//! `/metrics` endpoint for Prometheus scraping.

use {
    anyhow::Context,
    axum::{
        Router,
        extract::State,
        http::{StatusCode, header},
        response::IntoResponse,
        routing::get,
    },
    herald_metrics::MetricsHandle,
    tokio::task::JoinHandle,
    tokio_util::sync::CancellationToken,
    tracing::{error, info},
};

/// Bind `listen` and serve until `cancel` fires.
pub async fn spawn(
    listen: &str,
    handle: MetricsHandle,
    cancel: CancellationToken,
) -> anyhow::Result<JoinHandle<()>> {
    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("failed to bind metrics listener on {listen}"))?;
    let addr = listener.local_addr()?;
    let app = router(handle);

    info!(%addr, "metrics endpoint listening");
    Ok(tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(cancel.cancelled_owned())
            .await
        {
            error!(error = %e, "metrics server failed");
        }
    }))
}

fn router(handle: MetricsHandle) -> Router {
    Router::new()
        .route("/metrics", get(prometheus_metrics_handler))
        .with_state(handle)
}

async fn prometheus_metrics_handler(State(handle): State<MetricsHandle>) -> impl IntoResponse {
    if !handle.is_enabled() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain")],
            "Metrics not enabled".to_string(),
        );
    }
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        handle.render(),
    )
}
