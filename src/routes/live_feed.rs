use crate::{
    server::SharedState,
    stream::{VideoStreamError, CONTENT_TYPE},
};
use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::instrument;

#[instrument(skip(state))]
pub async fn live_feed(State(state): State<SharedState>) -> Result<Response, VideoStreamError> {
    state.metrics.record_request("/live_feed");

    let service = state.feed.service().ok_or(VideoStreamError::Unavailable)?;
    let stream = service.subscribe()?.into_stream();

    let body = Body::from_stream(stream);

    let response = Response::builder()
        .header(header::CONTENT_TYPE, CONTENT_TYPE)
        .body(body)
        .map_err(|e| VideoStreamError::HttpBuilderError(e.to_string()))?;

    Ok(response)
}

impl IntoResponse for VideoStreamError {
    fn into_response(self) -> Response {
        let status = match self {
            VideoStreamError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            VideoStreamError::Source(_) => StatusCode::SERVICE_UNAVAILABLE,
            VideoStreamError::Worker(_) => StatusCode::INTERNAL_SERVER_ERROR,
            VideoStreamError::HttpBuilderError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::testing::{layout_file, test_config};
    use crate::service::{FeedState, LiveFeed};
    use crate::source::testing::SyntheticOpener;
    use crate::telemetry::Metrics;
    use std::{path::Path, sync::Arc};

    fn state_for(feed: LiveFeed) -> SharedState {
        SharedState {
            feed,
            metrics: Arc::new(Metrics::new().unwrap()),
        }
    }

    #[tokio::test]
    async fn test_unavailable_feed_returns_503_without_opening_source() {
        let config = test_config(Path::new("/nonexistent/CarParkPos.yaml"), 107, 48);
        let opener = Arc::new(SyntheticOpener::new(64, 48, vec![0]));
        let metrics = Arc::new(Metrics::new().unwrap());
        let feed = LiveFeed::start(&config, opener.clone(), metrics);
        assert!(!feed.is_available());

        let response = live_feed(State(state_for(feed))).await.into_response();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(body.as_ref(), b"Live feed is unavailable.");
        assert_eq!(opener.open_calls(), 0);
    }

    #[tokio::test]
    async fn test_available_feed_streams_multipart() {
        let layout = layout_file(&[(0, 0)]);
        let config = test_config(layout.path(), 10, 10);
        let metrics = Arc::new(Metrics::new().unwrap());
        let feed = LiveFeed::start(
            &config,
            Arc::new(SyntheticOpener::new(64, 48, vec![0])),
            metrics,
        );

        let response = live_feed(State(state_for(feed.clone())))
            .await
            .into_response();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "multipart/x-mixed-replace; boundary=frame"
        );
        assert_eq!(feed.state(), FeedState::Streaming);

        drop(response);
        assert_eq!(feed.state(), FeedState::Idle);
    }
}
