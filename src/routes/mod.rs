mod availability;
mod health;
mod live_feed;
mod metrics;

use crate::server::SharedState;
use axum::{routing::get, Router};

pub fn api_routes() -> Router<SharedState> {
    Router::new()
        .route("/live_feed", get(live_feed::live_feed))
        .route("/availability", get(availability::availability))
        .route("/health", get(health::healthcheck))
        .route("/metrics", get(metrics::metrics_handler))
}
