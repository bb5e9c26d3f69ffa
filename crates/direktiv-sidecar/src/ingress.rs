// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Network ingress server (engine → sidecar).
//!
//! - `POST /`: validate the header envelope, enqueue the action and hold the
//!   connection until a worker completes it.
//! - `POST /cancel`: cancel an in-flight action by `Direktiv-ActionID`.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::extract::State;
use axum::http::header::CONTENT_LENGTH;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::time::{Instant, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::action::{ActionRequest, HEADER_ACTION_ID, MAX_PAYLOAD_SIZE};
use crate::local_server::ControlState;
use crate::queue::QueuedAction;
use crate::serve::serve_until_stopped;
use crate::threads::StopSignal;

/// Grace period between stop and forced close of the ingress server.
pub const INGRESS_SHUTDOWN_GRACE: Duration = Duration::from_secs(15);

/// How long ingress waits for the user container to accept connections.
pub const READINESS_TIMEOUT: Duration = Duration::from_secs(120);

/// Interval between "still pending" logs while an action runs.
const PENDING_LOG_INTERVAL: Duration = Duration::from_secs(300);

/// Build the ingress router.
pub fn router(state: Arc<ControlState>) -> Router {
    Router::new()
        .route("/", post(handle_action))
        .route("/cancel", post(handle_cancel))
        .with_state(state)
}

/// Serve ingress until stopped.
pub async fn serve(
    listener: TcpListener,
    state: Arc<ControlState>,
    stop: StopSignal,
    grace: Duration,
) -> std::io::Result<()> {
    serve_until_stopped("ingress", listener, router(state), stop, grace, |_| async {}).await
}

async fn handle_action(
    State(state): State<Arc<ControlState>>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let Some(length) = headers.get(CONTENT_LENGTH) else {
        return (StatusCode::LENGTH_REQUIRED, "content length required").into_response();
    };
    match length.to_str().ok().and_then(|v| v.parse::<u64>().ok()) {
        Some(length) if length > MAX_PAYLOAD_SIZE as u64 => {
            debug!(length, "rejecting oversized action body");
            return (StatusCode::PAYLOAD_TOO_LARGE, "payload too large").into_response();
        }
        Some(_) => {}
        None => return (StatusCode::BAD_REQUEST, "invalid content length").into_response(),
    }
    let body = match to_bytes(body, MAX_PAYLOAD_SIZE).await {
        Ok(body) => body,
        Err(e) => {
            debug!(error = %e, "failed to read action body");
            return (StatusCode::BAD_REQUEST, "failed to read body").into_response();
        }
    };

    let request = match ActionRequest::from_parts(&headers, body) {
        Ok(request) => request,
        Err(e) => {
            debug!(error = %e, "rejecting action request");
            return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
        }
    };
    let action_id = request.action_id.clone();

    // Dropping this handler (engine hung up) cancels the caller token.
    let caller = CancellationToken::new();
    let caller_guard = caller.clone().drop_guard();

    let (completion, mut done) = oneshot::channel();
    let queued = QueuedAction {
        request,
        caller,
        completion,
    };
    if state.queue.send(queued).await.is_err() {
        caller_guard.disarm();
        return (StatusCode::SERVICE_UNAVAILABLE, "sidecar is shutting down").into_response();
    }
    debug!(action_id = %action_id, "action queued");

    let start = Instant::now();
    let mut pending_tick = interval_at(start + PENDING_LOG_INTERVAL, PENDING_LOG_INTERVAL);
    let reply = loop {
        tokio::select! {
            reply = &mut done => break reply,
            _ = pending_tick.tick() => {
                info!(
                    action_id = %action_id,
                    pending_secs = start.elapsed().as_secs(),
                    "action still pending"
                );
            }
        }
    };
    caller_guard.disarm();

    match reply {
        Ok(reply) => (reply.status, reply.message).into_response(),
        Err(_) => {
            warn!(action_id = %action_id, "action dropped without completion");
            (StatusCode::SERVICE_UNAVAILABLE, "action was not completed").into_response()
        }
    }
}

async fn handle_cancel(State(state): State<Arc<ControlState>>, headers: HeaderMap) -> Response {
    let Some(action_id) = headers
        .get(HEADER_ACTION_ID)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
    else {
        return (StatusCode::BAD_REQUEST, "missing header Direktiv-ActionID").into_response();
    };

    info!(action_id = %action_id, "cancel requested");
    tokio::spawn(async move {
        state.cancel(&action_id).await;
    });
    StatusCode::OK.into_response()
}
