use axum::{routing, Router};
use metrics_exporter_prometheus::PrometheusHandle;

use order_common::health::HealthRegistry;
use order_common::metrics;

pub fn app(liveness: HealthRegistry, metrics_handle: Option<PrometheusHandle>) -> Router {
    Router::new()
        .route("/", routing::get(index))
        .route(
            "/metrics",
            routing::get(move || match metrics_handle {
                Some(ref recorder_handle) => std::future::ready(recorder_handle.render()),
                None => std::future::ready("no metrics recorder installed".to_owned()),
            }),
        )
        .route(
            "/_liveness",
            routing::get(move || std::future::ready(liveness.get_status())),
        )
        .layer(axum::middleware::from_fn(metrics::track_metrics))
}

pub async fn index() -> &'static str {
    "order-worker"
}
