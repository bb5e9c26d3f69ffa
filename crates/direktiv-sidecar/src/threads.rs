// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Thread registry: coordinated shutdown of long-lived tasks.
//!
//! Every long-lived task (local server, ingress server, signal listener)
//! registers once and receives a [`ThreadGuard`] plus a [`StopSignal`]. The
//! first [`ThreadRegistry::stop`] call latches a shutdown timestamp and
//! delivers it to every stop signal, including ones registered later. When
//! the last guard is dropped, [`ThreadRegistry::wait`] resolves.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::{oneshot, watch};
use tracing::debug;

/// Exit code for a graceful shutdown.
pub const EXIT_SUCCESS: i32 = 0;

/// Exit code when a component failed fatally.
pub const EXIT_FAILURE: i32 = 1;

#[derive(Default)]
struct State {
    active: usize,
    stopped_at: Option<DateTime<Utc>>,
    exit_code: i32,
    stoppers: Vec<oneshot::Sender<DateTime<Utc>>>,
}

/// Process-wide supervisor of long-lived tasks.
pub struct ThreadRegistry {
    state: Mutex<State>,
    finished: watch::Sender<bool>,
}

impl Default for ThreadRegistry {
    fn default() -> Self {
        Self {
            state: Mutex::new(State::default()),
            finished: watch::Sender::new(false),
        }
    }
}

impl ThreadRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a long-lived task.
    ///
    /// If shutdown was already latched, the returned signal fires immediately.
    pub fn register(self: &Arc<Self>, name: &'static str) -> (ThreadGuard, StopSignal) {
        let (tx, rx) = oneshot::channel();
        let mut state = self.lock();
        state.active += 1;
        match state.stopped_at {
            Some(ts) => {
                let _ = tx.send(ts);
            }
            None => state.stoppers.push(tx),
        }
        debug!(thread = name, active = state.active, "thread registered");
        drop(state);

        (
            ThreadGuard {
                registry: Arc::clone(self),
                name,
            },
            StopSignal {
                rx: Some(rx),
                latched: None,
            },
        )
    }

    /// Latch shutdown.
    ///
    /// The first call wins the timestamp. The exit code keeps the maximum of
    /// every code passed in.
    pub fn stop(&self, timestamp: DateTime<Utc>, code: i32) {
        let mut state = self.lock();
        state.exit_code = state.exit_code.max(code);
        if state.stopped_at.is_some() {
            return;
        }
        state.stopped_at = Some(timestamp);
        for stopper in state.stoppers.drain(..) {
            let _ = stopper.send(timestamp);
        }
        debug!(code, "shutdown latched");
    }

    /// Whether shutdown has been latched.
    pub fn is_stopped(&self) -> bool {
        self.lock().stopped_at.is_some()
    }

    /// Wait until every registered task has returned.
    pub async fn wait(&self) {
        let mut rx = self.finished.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }

    /// The latched exit code.
    pub fn exit_status(&self) -> i32 {
        self.lock().exit_code
    }
}

/// Deregistration handle; dropping it marks the task as returned.
pub struct ThreadGuard {
    registry: Arc<ThreadRegistry>,
    name: &'static str,
}

impl Drop for ThreadGuard {
    fn drop(&mut self) {
        let mut state = self.registry.lock();
        state.active = state.active.saturating_sub(1);
        debug!(thread = self.name, active = state.active, "thread returned");
        if state.active == 0 {
            self.registry.finished.send_replace(true);
        }
    }
}

/// Receives the shutdown timestamp once.
pub struct StopSignal {
    rx: Option<oneshot::Receiver<DateTime<Utc>>>,
    latched: Option<DateTime<Utc>>,
}

impl StopSignal {
    /// Resolve with the shutdown timestamp. Safe to await repeatedly and
    /// cancel-safe inside `select!`.
    pub async fn stopped(&mut self) -> DateTime<Utc> {
        if let Some(ts) = self.latched {
            return ts;
        }
        let ts = match self.rx.as_mut() {
            Some(rx) => rx.await.unwrap_or_else(|_| Utc::now()),
            None => Utc::now(),
        };
        self.rx = None;
        self.latched = Some(ts);
        ts
    }
}
