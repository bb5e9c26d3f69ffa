// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker pool: executes queued actions against the user container.
//!
//! Per action:
//!
//! ```text
//!  dequeue ─▶ register ─▶ provision ─▶ invoke ─▶ interpret ─▶ harvest ─▶ report ─▶ cleanup
//!              │            └──────────── bounded by deadline + work token ────────┘
//!              └─ caller watcher: caller gone ─▶ cancel primitive
//! ```
//!
//! Two cancellation scopes are involved. The caller token follows the
//! engine's connection and is only translated into a cancel request. The
//! work token is the action's own scope: it is cancelled by a hard cancel
//! or by shutdown, and every step before reporting races against it and the
//! absolute deadline.

use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::action::{ActionRequest, Outcome};
use crate::active::{ActionMeta, ActiveRequest};
use crate::engine::ActionResults;
use crate::local_server::ControlState;
use crate::queue::{IngressReply, QueuedAction};
use crate::serve::instant_at;
use crate::workspace::Workspace;

/// Message reported when the action deadline expires.
pub const DEADLINE_EXCEEDED: &str = "context deadline exceeded";

/// Message reported when the action is hard-cancelled.
pub const CANCELED: &str = "context canceled";

/// Holds the work token of the action a worker is currently running.
#[derive(Debug, Default)]
struct CancelSlot {
    current: Mutex<Option<CancellationToken>>,
}

impl CancelSlot {
    fn set(&self, token: Option<CancellationToken>) {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = token;
    }

    fn cancel(&self) -> bool {
        match &*self.current.lock().unwrap_or_else(PoisonError::into_inner) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

/// Fixed set of workers sharing the inbound queue.
pub struct WorkerPool {
    slots: Vec<Arc<CancelSlot>>,
    live: watch::Sender<usize>,
}

impl WorkerPool {
    /// Start `count` workers.
    pub fn spawn(count: usize, state: Arc<ControlState>, shared_dir: PathBuf) -> Arc<Self> {
        let pool = Arc::new(Self {
            slots: (0..count).map(|_| Arc::new(CancelSlot::default())).collect(),
            live: watch::Sender::new(count),
        });

        for (id, slot) in pool.slots.iter().enumerate() {
            let worker = Worker {
                id,
                state: state.clone(),
                shared_dir: shared_dir.clone(),
                slot: slot.clone(),
            };
            let pool = pool.clone();
            tokio::spawn(async move {
                worker.run().await;
                pool.live.send_modify(|live| *live = live.saturating_sub(1));
            });
        }

        info!(workers = count, "worker pool started");
        pool
    }

    /// Hard-cancel whatever every worker is doing. Returns how many were busy.
    pub fn cancel_all(&self) -> usize {
        self.slots.iter().filter(|slot| slot.cancel()).count()
    }

    /// Number of workers whose loop is still running.
    pub fn live_workers(&self) -> usize {
        *self.live.borrow()
    }

    /// Wait until every worker loop has exited (the queue must be drained).
    pub async fn wait_idle(&self) {
        let mut rx = self.live.subscribe();
        let _ = rx.wait_for(|live| *live == 0).await;
    }
}

struct Worker {
    id: usize,
    state: Arc<ControlState>,
    shared_dir: PathBuf,
    slot: Arc<CancelSlot>,
}

impl Worker {
    async fn run(self) {
        debug!(worker = self.id, "worker started");

        while let Some(item) = self.state.queue.next().await {
            let QueuedAction {
                request,
                caller,
                completion,
            } = item;
            let action_id = request.action_id.clone();
            let work = CancellationToken::new();
            self.slot.set(Some(work.clone()));

            // Own task so a panic fails this action only.
            let span = info_span!("action", action_id = %action_id, worker = self.id);
            let task = tokio::spawn(
                execute(
                    self.state.clone(),
                    self.shared_dir.clone(),
                    request,
                    caller,
                    work,
                )
                .instrument(span),
            );

            let reply = match task.await {
                Ok(reply) => reply,
                Err(e) => {
                    error!(worker = self.id, action_id = %action_id, error = %e, "action task failed");
                    self.state.active.deregister(&action_id);
                    if let Ok(workspace) = Workspace::new(&self.shared_dir, &action_id)
                        && let Err(e) = workspace.remove().await
                    {
                        warn!(action_id = %action_id, error = %e, "failed to remove workspace");
                    }
                    IngressReply::unavailable("action failed unexpectedly")
                }
            };
            self.slot.set(None);
            let _ = completion.send(reply);
        }

        debug!(worker = self.id, "worker stopped");
    }
}

/// Race a step against the work token and the action deadline.
async fn bounded<T, E: std::fmt::Display>(
    deadline: Instant,
    work: &CancellationToken,
    step: impl Future<Output = Result<T, E>>,
) -> Result<T, String> {
    tokio::select! {
        biased;
        _ = work.cancelled() => Err(CANCELED.to_string()),
        result = tokio::time::timeout_at(deadline, step) => match result {
            Err(_) => Err(DEADLINE_EXCEEDED.to_string()),
            Ok(Err(e)) if work.is_cancelled() => {
                debug!(error = %e, "step failed after cancel");
                Err(CANCELED.to_string())
            }
            Ok(Err(e)) => Err(e.to_string()),
            Ok(Ok(value)) => Ok(value),
        },
    }
}

/// Run one action end to end and report it.
async fn execute(
    state: Arc<ControlState>,
    shared_dir: PathBuf,
    request: ActionRequest,
    caller: CancellationToken,
    work: CancellationToken,
) -> IngressReply {
    let action_id = request.action_id.clone();

    let active = ActiveRequest {
        action_id: action_id.clone(),
        ctx: work.clone(),
        meta: ActionMeta::from(&request),
        trace: request.trace.clone(),
    };
    if let Err(e) = state.active.register(active.clone()) {
        warn!(error = %e, "rejecting duplicate action");
        return IngressReply {
            status: axum::http::StatusCode::CONFLICT,
            message: e.to_string(),
        };
    }

    // Caller disconnects become a regular cancel; the action keeps its own scope.
    let finished = CancellationToken::new();
    let watcher = tokio::spawn({
        let state = state.clone();
        let finished = finished.clone();
        let action_id = action_id.clone();
        async move {
            tokio::select! {
                _ = finished.cancelled() => {}
                _ = caller.cancelled() => {
                    info!(action_id = %action_id, "caller disconnected, cancelling action");
                    state.cancel(&action_id).await;
                }
            }
        }
    });

    let deadline = instant_at(request.deadline);
    let (workspace, outcome) = match Workspace::new(&shared_dir, &action_id) {
        Ok(workspace) => {
            let outcome = run_action(&state, &workspace, &request, &active, deadline).await;
            (Some(workspace), outcome)
        }
        Err(e) => (None, Outcome::uncatchable(e.to_string())),
    };

    match &outcome {
        Outcome::Success(output) => info!(bytes = output.len(), "action succeeded"),
        Outcome::Catchable { code, message } => {
            info!(error_code = %code, error_message = %message, "action failed with catchable error")
        }
        Outcome::Uncatchable { code, message } => {
            warn!(error_code = %code, error_message = %message, "action failed uncatchably")
        }
    }

    let results = ActionResults::new(
        &request.instance_id,
        request.step,
        &action_id,
        request.iterator,
        outcome,
    );
    if let Err(e) = state
        .engine
        .report_action_results(results, &request.trace)
        .await
    {
        error!(error = %e, "failed to report action results");
    }

    finished.cancel();
    state.active.deregister(&action_id);
    if let Some(workspace) = &workspace
        && let Err(e) = workspace.remove().await
    {
        warn!(path = %workspace.root().display(), error = %e, "failed to remove workspace");
    }
    let _ = watcher.await;

    IngressReply::done()
}

/// Provision, invoke, interpret and harvest. Every failure becomes an outcome.
async fn run_action(
    state: &ControlState,
    workspace: &Workspace,
    request: &ActionRequest,
    active: &ActiveRequest,
    deadline: Instant,
) -> Outcome {
    let work = &active.ctx;
    let action = active.action_ref();

    if let Err(message) = bounded(
        deadline,
        work,
        workspace.provision(&state.variables, &action, &request.files),
    )
    .await
    {
        return Outcome::uncatchable(message);
    }
    debug!(files = request.files.len(), "workspace provisioned");

    let response = match bounded(
        deadline,
        work,
        state.container.invoke(request, workspace.root()),
    )
    .await
    {
        Ok(response) => response,
        Err(message) => return Outcome::uncatchable(message),
    };
    let outcome = response.into_outcome();

    match bounded(deadline, work, workspace.harvest(&state.variables, &action)).await {
        Ok(harvested) => {
            if !harvested.is_empty() {
                debug!(outputs = harvested.len(), "outputs harvested");
            }
            outcome
        }
        Err(message) => Outcome::uncatchable(message),
    }
}
