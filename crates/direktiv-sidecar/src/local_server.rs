// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Local control server on `127.0.0.1:8889`.
//!
//! Endpoints for the user container:
//! - `POST /log?aid=<id>` (or `GET /log?aid=<id>&log=<msg>`): forward one log line
//! - `GET /var?aid=<id>&scope=<s>&key=<k>`: read a variable
//! - `POST /var?aid=<id>&scope=<s>&key=<k>`: set-or-create a variable
//!
//! [`ControlState`] is also the owner of the in-flight action registry, the
//! inbound queue and the cancel primitive used by ingress and workers.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::{DefaultBodyLimit, Query, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use bytes::Bytes;
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::action::{MAX_LOG_SIZE, MAX_PAYLOAD_SIZE, VariableScope};
use crate::active::{ActiveRequest, ActiveRequests};
use crate::container::UserContainer;
use crate::engine::EngineReporter;
use crate::queue::InboundQueue;
use crate::serve::serve_until_stopped;
use crate::threads::StopSignal;
use crate::variables::VariableClient;
use crate::worker::WorkerPool;

/// Grace period between stop and forced close of the local server.
pub const LOCAL_SHUTDOWN_GRACE: Duration = Duration::from_secs(20);

/// Time a cancelled action gets to wind down before it is hard-cancelled.
pub const CANCEL_GRACE: Duration = Duration::from_secs(10);

/// Time workers get to report after a hard cancel during shutdown.
const HARD_CANCEL_GRACE: Duration = Duration::from_secs(5);

/// Shared state of the sidecar's request plane.
pub struct ControlState {
    pub queue: InboundQueue,
    pub active: ActiveRequests,
    pub variables: VariableClient,
    pub engine: Arc<dyn EngineReporter>,
    pub container: UserContainer,
    pub cancel_grace: Duration,
}

impl ControlState {
    pub fn new(
        queue: InboundQueue,
        variables: VariableClient,
        engine: Arc<dyn EngineReporter>,
        container: UserContainer,
    ) -> Self {
        Self {
            queue,
            active: ActiveRequests::new(),
            variables,
            engine,
            container,
            cancel_grace: CANCEL_GRACE,
        }
    }

    /// Cancel an in-flight action.
    ///
    /// Asks the container to stop (`DELETE /`) in the background, then waits
    /// up to the cancel grace for the action to finish before hard-cancelling
    /// it. Returns false when the action is not active.
    pub async fn cancel(&self, action_id: &str) -> bool {
        let Some(request) = self.active.get(action_id) else {
            debug!(action_id, "cancel for unknown action ignored");
            return false;
        };
        info!(action_id, "cancelling action");

        let container = self.container.clone();
        let id = action_id.to_string();
        tokio::spawn(async move {
            match container.cancel(&id).await {
                Ok(status) if status.is_success() => debug!(action_id = %id, "container acknowledged cancel"),
                Ok(status) => debug!(action_id = %id, status = status.as_u16(), "container rejected cancel"),
                Err(e) => warn!(action_id = %id, error = %e, "cancel request to container failed"),
            }
        });

        if tokio::time::timeout(self.cancel_grace, request.ctx.cancelled())
            .await
            .is_err()
        {
            warn!(
                action_id,
                grace_secs = self.cancel_grace.as_secs(),
                "action did not finish after cancel, hard-cancelling"
            );
            request.ctx.cancel();
        }
        true
    }
}

/// Build the local router.
pub fn router(state: Arc<ControlState>) -> Router {
    Router::new()
        .route(
            "/log",
            get(log_get)
                .post(log_post)
                .layer(DefaultBodyLimit::max(MAX_LOG_SIZE)),
        )
        .route(
            "/var",
            get(var_get)
                .post(var_post)
                .layer(DefaultBodyLimit::max(MAX_PAYLOAD_SIZE)),
        )
        .with_state(state)
}

/// Serve the local endpoints until stopped.
///
/// On stop: drain the queue with 503s, let running actions finish until the
/// deadline, hard-cancel what is left, then close the listener.
pub async fn serve(
    listener: TcpListener,
    state: Arc<ControlState>,
    pool: Arc<WorkerPool>,
    stop: StopSignal,
    grace: Duration,
) -> std::io::Result<()> {
    let app = router(state.clone());
    serve_until_stopped("local", listener, app, stop, grace, |deadline| async move {
        state.queue.drain().await;

        if tokio::time::timeout_at(deadline, pool.wait_idle())
            .await
            .is_err()
        {
            let cancelled = pool.cancel_all();
            warn!(cancelled, "shutdown deadline reached, hard-cancelled running actions");
            if tokio::time::timeout(HARD_CANCEL_GRACE, pool.wait_idle())
                .await
                .is_err()
            {
                warn!("workers still busy after hard cancel");
            }
        }
    })
    .await
}

#[derive(Debug, Deserialize)]
struct LogQuery {
    aid: Option<String>,
    log: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VarQuery {
    aid: Option<String>,
    scope: Option<String>,
    key: Option<String>,
}

fn reply(status: StatusCode, message: impl Into<String>) -> Response {
    (status, message.into()).into_response()
}

async fn log_get(State(state): State<Arc<ControlState>>, Query(query): Query<LogQuery>) -> Response {
    let message = query.log.clone().unwrap_or_default();
    forward_log(&state, query.aid.as_deref(), message).await
}

async fn log_post(
    State(state): State<Arc<ControlState>>,
    Query(query): Query<LogQuery>,
    body: Bytes,
) -> Response {
    let message = String::from_utf8_lossy(&body).into_owned();
    forward_log(&state, query.aid.as_deref(), message).await
}

async fn forward_log(state: &ControlState, aid: Option<&str>, message: String) -> Response {
    let Some(aid) = aid.filter(|a| !a.is_empty()) else {
        return reply(StatusCode::INTERNAL_SERVER_ERROR, "missing aid");
    };
    let Some(request) = state.active.get(aid) else {
        return reply(StatusCode::NOT_FOUND, format!("action {} is not active", aid));
    };
    if message.is_empty() {
        return StatusCode::OK.into_response();
    }

    match state
        .engine
        .action_log(
            &request.meta.instance_id,
            request.meta.iterator,
            vec![message],
            &request.trace,
        )
        .await
    {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => {
            warn!(action_id = aid, error = %e, "failed to forward action log");
            reply(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

/// Resolve the action, scope and key of a `/var` call.
fn resolve_var(
    state: &ControlState,
    query: VarQuery,
) -> Result<(ActiveRequest, VariableScope, String), Response> {
    let (Some(aid), Some(scope), Some(key)) = (query.aid, query.scope, query.key) else {
        return Err(reply(
            StatusCode::BAD_REQUEST,
            "aid, scope and key are required",
        ));
    };
    if key.is_empty() {
        return Err(reply(StatusCode::BAD_REQUEST, "empty key"));
    }
    let scope: VariableScope = scope
        .parse()
        .map_err(|e: String| reply(StatusCode::BAD_REQUEST, e))?;
    if scope == VariableScope::FileSystem {
        return Err(reply(
            StatusCode::BAD_REQUEST,
            "file-system scope is only available for outputs",
        ));
    }
    let request = state
        .active
        .get(&aid)
        .ok_or_else(|| reply(StatusCode::NOT_FOUND, format!("action {} is not active", aid)))?;
    Ok((request, scope, key))
}

async fn var_get(State(state): State<Arc<ControlState>>, Query(query): Query<VarQuery>) -> Response {
    let (request, scope, key) = match resolve_var(&state, query) {
        Ok(resolved) => resolved,
        Err(response) => return response,
    };
    let action = request.action_ref();

    let result = async {
        let meta = state.variables.get_variable_meta(&action, scope, &key).await?;
        let data = state.variables.get_variable_data(&action, &meta.id).await?;
        Ok::<_, crate::variables::VariableError>((meta.mime_type, data))
    }
    .await;

    match result {
        Ok((mime, data)) => {
            let mime = if mime.is_empty() {
                "application/octet-stream".to_string()
            } else {
                mime
            };
            ([(CONTENT_TYPE, mime)], data).into_response()
        }
        Err(e) if e.is_not_found() => reply(StatusCode::NOT_FOUND, e.to_string()),
        Err(e) => {
            warn!(action_id = %request.action_id, %scope, key = %key, error = %e, "variable read failed");
            reply(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn var_post(
    State(state): State<Arc<ControlState>>,
    Query(query): Query<VarQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let (request, scope, key) = match resolve_var(&state, query) {
        Ok(resolved) => resolved,
        Err(response) => return response,
    };
    let mime = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .unwrap_or("application/octet-stream");

    match state
        .variables
        .set_or_create(&request.action_ref(), scope, &key, mime, &body)
        .await
    {
        Ok(outcome) => {
            debug!(action_id = %request.action_id, %scope, key = %key, ?outcome, "variable stored");
            StatusCode::OK.into_response()
        }
        Err(e) => {
            warn!(action_id = %request.action_id, %scope, key = %key, error = %e, "variable write failed");
            reply(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}
