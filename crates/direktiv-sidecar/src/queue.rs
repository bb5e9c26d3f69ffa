// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bounded inbound queue between the ingress server and the workers.
//!
//! ```text
//!  ingress handler ──send──▶ [ mpsc (capacity N) ] ──next──▶ worker 1..W
//!        ▲                                                     │
//!        └──────────────── completion (oneshot) ◀──────────────┘
//! ```
//!
//! Draining publishes the shutdown first, then closes the channel and
//! answers every entry still in it with 503.

use std::time::Duration;

use axum::http::StatusCode;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::time::{Instant, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::action::ActionRequest;

/// Interval between warnings while an enqueue is blocked.
const ENQUEUE_WARN_INTERVAL: Duration = Duration::from_secs(30);

/// Answer sent back to the waiting ingress handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngressReply {
    pub status: StatusCode,
    pub message: String,
}

impl IngressReply {
    /// Action processed and reported.
    pub fn done() -> Self {
        Self {
            status: StatusCode::OK,
            message: String::new(),
        }
    }

    /// Sidecar is shutting down.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: message.into(),
        }
    }
}

/// One queued action plus the channels tying it to its caller.
#[derive(Debug)]
pub struct QueuedAction {
    pub request: ActionRequest,
    /// Cancelled when the engine's connection goes away.
    pub caller: CancellationToken,
    pub completion: oneshot::Sender<IngressReply>,
}

impl QueuedAction {
    pub fn reply(self, reply: IngressReply) {
        let _ = self.completion.send(reply);
    }
}

/// Returned by [`InboundQueue::send`] once draining started.
#[derive(Debug, thiserror::Error)]
#[error("inbound queue is closed")]
pub struct QueueClosed;

/// The single inbound queue.
#[derive(Debug)]
pub struct InboundQueue {
    tx: mpsc::Sender<QueuedAction>,
    rx: Mutex<mpsc::Receiver<QueuedAction>>,
    draining: CancellationToken,
    capacity: usize,
}

impl InboundQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Mutex::new(rx),
            draining: CancellationToken::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_draining(&self) -> bool {
        self.draining.is_cancelled()
    }

    /// Enqueue an action, waiting for capacity.
    ///
    /// Logs a warning every 30 s while blocked. Fails once draining started.
    pub async fn send(&self, item: QueuedAction) -> Result<(), QueueClosed> {
        if self.is_draining() {
            return Err(QueueClosed);
        }

        let action_id = item.request.action_id.clone();
        let start = Instant::now();
        let reserve = self.tx.reserve();
        tokio::pin!(reserve);
        let mut warn_tick =
            interval_at(start + ENQUEUE_WARN_INTERVAL, ENQUEUE_WARN_INTERVAL);

        loop {
            tokio::select! {
                biased;

                _ = self.draining.cancelled() => return Err(QueueClosed),

                permit = &mut reserve => {
                    let permit = permit.map_err(|_| QueueClosed)?;
                    permit.send(item);
                    return Ok(());
                }

                _ = warn_tick.tick() => {
                    warn!(
                        action_id = %action_id,
                        waited_secs = start.elapsed().as_secs(),
                        "enqueue blocked, all workers busy"
                    );
                }
            }
        }
    }

    /// Next action for a worker; `None` once draining started.
    pub async fn next(&self) -> Option<QueuedAction> {
        let mut rx = tokio::select! {
            biased;
            _ = self.draining.cancelled() => return None,
            rx = self.rx.lock() => rx,
        };
        tokio::select! {
            biased;
            _ = self.draining.cancelled() => None,
            item = rx.recv() => item,
        }
    }

    /// Publish shutdown, close the channel and answer queued entries with 503.
    ///
    /// Returns how many entries were drained. Idempotent.
    pub async fn drain(&self) -> usize {
        self.draining.cancel();
        let mut rx = self.rx.lock().await;
        rx.close();

        let mut drained = 0;
        while let Ok(item) = rx.try_recv() {
            item.reply(IngressReply::unavailable("sidecar is shutting down"));
            drained += 1;
        }
        if drained > 0 {
            info!(drained, "drained queued actions");
        }
        drained
    }
}
