// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process signal listener.
//!
//! The first SIGINT, SIGTERM or SIGUSR1 latches a graceful shutdown. A second
//! signal, or the force-exit timer expiring, ends the process immediately.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::signal::unix::{Signal, SignalKind, signal};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::threads::{EXIT_FAILURE, EXIT_SUCCESS, ThreadRegistry};

/// Unconditional exit delay after the first signal.
pub const FORCE_EXIT_AFTER: Duration = Duration::from_secs(20);

struct Signals {
    term: Signal,
    int: Signal,
    usr1: Signal,
}

impl Signals {
    fn install() -> io::Result<Self> {
        Ok(Self {
            term: signal(SignalKind::terminate())?,
            int: signal(SignalKind::interrupt())?,
            usr1: signal(SignalKind::user_defined1())?,
        })
    }

    async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.term.recv() => "SIGTERM",
            _ = self.int.recv() => "SIGINT",
            _ = self.usr1.recv() => "SIGUSR1",
        }
    }
}

/// Install the handlers and start listening.
///
/// The listener is a registered thread until the first signal (or until
/// shutdown is latched by something else); after that it only guards the
/// force exit.
pub fn spawn(registry: Arc<ThreadRegistry>, force_exit_after: Duration) -> io::Result<JoinHandle<()>> {
    let mut signals = Signals::install()?;
    let (guard, mut stop) = registry.register("signals");

    Ok(tokio::spawn(async move {
        let received = tokio::select! {
            name = signals.recv() => name,
            _ = stop.stopped() => return,
        };

        info!(signal = received, "signal received, shutting down");
        registry.stop(Utc::now(), EXIT_SUCCESS);
        drop(guard);

        tokio::select! {
            name = signals.recv() => warn!(signal = name, "second signal, exiting immediately"),
            _ = tokio::time::sleep(force_exit_after) => {
                warn!(after_secs = force_exit_after.as_secs(), "graceful shutdown stalled, forcing exit");
            }
        }
        std::process::exit(EXIT_FAILURE);
    }))
}
