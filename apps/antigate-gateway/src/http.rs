//! Minimal HTTP surface over the Forward Orchestrator. Request parsing,
//! routing conventions, and user/auth/key validation are named external
//! collaborators (spec §1 "Out of scope"); this router only accepts an
//! already-validated Claude Messages body and a caller-supplied group id,
//! the two pieces of context the orchestrator actually needs.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use bytes::Bytes;
use futures_core::Stream;
use serde::Deserialize;

use antigate_core::journal::RequestJournal;
use antigate_core::orchestrator::{ForwardError, ForwardOrchestrator, ForwardRequest, StreamResult};
use antigate_protocol::claude::types::CreateMessageRequestBody;

pub struct AppState {
    pub orchestrator: ForwardOrchestrator,
    pub journal_capacity: usize,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/messages", post(create_message))
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    StatusCode::OK
}

#[derive(Debug, Deserialize)]
struct MessagesQuery {
    #[serde(default)]
    group_id: Option<String>,
    #[serde(default)]
    session_fingerprint: Option<String>,
    #[serde(default)]
    is_sticky_session: bool,
}

async fn create_message(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateMessageRequestBodyWithRouting>,
) -> axum::response::Response {
    let stream_requested = payload.body.stream.unwrap_or(false);
    let request = ForwardRequest {
        group_id: payload.routing.group_id.unwrap_or_else(|| "default".to_string()),
        session_fingerprint: payload.routing.session_fingerprint,
        is_sticky_session: payload.routing.is_sticky_session,
        body: payload.body,
    };

    if stream_requested {
        return create_message_stream(state, request).await;
    }

    let mut journal = RequestJournal::new(state.journal_capacity);
    match state.orchestrator.forward_nonstream(request, &mut journal).await {
        Ok(message) => Json(message).into_response(),
        Err(error) => forward_error_response(error),
    }
}

/// Streaming branch of `POST /v1/messages` (spec §4.C4 SSE passthrough):
/// drives [`ForwardOrchestrator::forward_stream`] and writes its frames
/// straight onto the response body as they arrive.
async fn create_message_stream(state: Arc<AppState>, request: ForwardRequest) -> axum::response::Response {
    let journal = RequestJournal::new(state.journal_capacity);
    match state.orchestrator.forward_stream(request, journal).await {
        Ok(rx) => axum::response::Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/event-stream")
            .header(header::CACHE_CONTROL, "no-cache")
            .body(Body::from_stream(StreamFrames(rx)))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()),
        Err(error) => forward_error_response(error),
    }
}

fn forward_error_response(error: ForwardError) -> axum::response::Response {
    match error {
        ForwardError::ClientError { status, body } => {
            (StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_REQUEST), body).into_response()
        }
        ForwardError::UpstreamFailover { status, .. } => {
            (StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY), "upstream unavailable").into_response()
        }
        ForwardError::NoAccountsAvailable => {
            (StatusCode::SERVICE_UNAVAILABLE, "no accounts available").into_response()
        }
        ForwardError::Other(message) => (StatusCode::INTERNAL_SERVER_ERROR, message).into_response(),
    }
}

/// Adapts the orchestrator's `mpsc::Receiver<StreamResult>` into the
/// `Stream<Item = Result<Bytes, Infallible>>` `axum::body::Body::from_stream`
/// wants. A failure that reaches the orchestrator after streaming has
/// already started never surfaces here as a body error: it was already
/// written onto the channel as a one-shot `event: error` frame before the
/// channel closed, matching spec §4.C4's "never a mid-stream abort without
/// at least one error frame" rule.
struct StreamFrames(tokio::sync::mpsc::Receiver<StreamResult>);

impl Stream for StreamFrames {
    type Item = Result<Bytes, std::convert::Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.0.poll_recv(cx) {
            Poll::Ready(Some(chunk)) => Poll::Ready(Some(Ok(chunk.frame))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// The wire body is the plain Claude Messages request; routing fields ride
/// alongside it via `serde(flatten)` so a caller who already validated
/// auth/user context can stamp group/session identity onto the same JSON
/// object without this engine needing to know where those identities come
/// from.
#[derive(Debug, Deserialize)]
struct CreateMessageRequestBodyWithRouting {
    #[serde(flatten)]
    routing: MessagesQuery,
    #[serde(flatten)]
    body: CreateMessageRequestBody,
}
