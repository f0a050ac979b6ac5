use crate::{server::SharedState, service::FeedState};
use axum::{extract::State, response::IntoResponse, response::Json};
use serde::Serialize;

#[derive(Serialize)]
pub struct Availability {
    live_feed_available: bool,
    state: FeedState,
    total_slots: Option<usize>,
}

/// What the booking front-end checks before offering the live feed.
pub async fn availability(State(state): State<SharedState>) -> impl IntoResponse {
    state.metrics.record_request("/availability");

    Json(Availability {
        live_feed_available: state.feed.is_available(),
        state: state.feed.state(),
        total_slots: state.feed.service().map(|s| s.registry().count()),
    })
}
