// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared HTTP server lifecycle: serve until stopped, then shut down
//! gracefully within a grace period measured from the stop timestamp.

use std::future::{Future, IntoFuture};
use std::io;
use std::time::Duration;

use axum::Router;
use chrono::{DateTime, TimeDelta, Utc};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::threads::StopSignal;

/// Convert a wall-clock timestamp into a monotonic instant.
///
/// Timestamps in the past map to "now".
pub fn instant_at(ts: DateTime<Utc>) -> Instant {
    let remaining = (ts - Utc::now()).to_std().unwrap_or(Duration::ZERO);
    Instant::now() + remaining
}

/// Shutdown deadline for a server with the given grace.
pub fn shutdown_deadline(stopped_at: DateTime<Utc>, grace: Duration) -> Instant {
    let grace = TimeDelta::from_std(grace).unwrap_or(TimeDelta::zero());
    instant_at(stopped_at + grace)
}

/// Serve `router` until `stop` fires.
///
/// `before_shutdown` runs while the listener still accepts connections and
/// receives the shutdown deadline. Connections still open at the deadline
/// are dropped. An early exit of the server is an error.
pub async fn serve_until_stopped<F, Fut>(
    name: &'static str,
    listener: TcpListener,
    router: Router,
    mut stop: StopSignal,
    grace: Duration,
    before_shutdown: F,
) -> io::Result<()>
where
    F: FnOnce(Instant) -> Fut,
    Fut: Future<Output = ()>,
{
    let addr = listener.local_addr()?;
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let mut server = tokio::spawn(
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .into_future(),
    );
    info!(server = name, addr = %addr, "listening");

    let stopped_at = tokio::select! {
        ts = stop.stopped() => ts,
        result = &mut server => {
            return match result {
                Ok(Ok(())) => Err(io::Error::other(format!("{} server exited unexpectedly", name))),
                Ok(Err(e)) => Err(e),
                Err(e) => Err(io::Error::other(e)),
            };
        }
    };

    let deadline = shutdown_deadline(stopped_at, grace);
    info!(server = name, grace_secs = grace.as_secs(), "shutting down");
    before_shutdown(deadline).await;

    let _ = shutdown_tx.send(());
    match tokio::time::timeout_at(deadline, &mut server).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => Err(io::Error::other(e)),
        Err(_) => {
            warn!(server = name, "shutdown deadline passed, dropping open connections");
            server.abort();
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_past_timestamp_is_now() {
        let before = Instant::now();
        let at = instant_at(Utc::now() - TimeDelta::seconds(10));
        assert!(at >= before);
        assert!(at <= Instant::now());
    }

    #[test]
    fn test_deadline_adds_grace() {
        let deadline = shutdown_deadline(Utc::now(), Duration::from_secs(20));
        let remaining = deadline - Instant::now();
        assert!(remaining > Duration::from_secs(19));
        assert!(remaining <= Duration::from_secs(20));
    }
}
