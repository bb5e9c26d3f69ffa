// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Recording engine for testing.
//!
//! Keeps every report and log line in memory instead of talking to a flow
//! engine, and lets tests wait for reports to arrive.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

use super::traits::*;
use crate::telemetry::TraceCarrier;

/// One recorded `ActionLog` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedLog {
    pub instance_id: String,
    pub iterator: i32,
    pub lines: Vec<String>,
}

/// Engine reporter that records calls.
#[derive(Default)]
pub struct RecordingEngine {
    reports: Mutex<Vec<ActionResults>>,
    logs: Mutex<Vec<RecordedLog>>,
    traces: Mutex<Vec<TraceCarrier>>,
    changed: Notify,
    /// If true, every call fails.
    fail: AtomicBool,
}

impl RecordingEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make subsequent calls fail (or succeed again).
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub async fn reports(&self) -> Vec<ActionResults> {
        self.reports.lock().await.clone()
    }

    pub async fn logs(&self) -> Vec<RecordedLog> {
        self.logs.lock().await.clone()
    }

    /// Trace carriers seen on report calls, in order.
    pub async fn report_traces(&self) -> Vec<TraceCarrier> {
        self.traces.lock().await.clone()
    }

    /// Wait until at least `count` reports were recorded.
    pub async fn wait_for_reports(&self, count: usize, timeout: Duration) -> Vec<ActionResults> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.changed.notified();
            {
                let reports = self.reports.lock().await;
                if reports.len() >= count {
                    return reports.clone();
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.reports.lock().await.clone();
            }
        }
    }

    fn check(&self) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(EngineError::Other("engine unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl EngineReporter for RecordingEngine {
    async fn report_action_results(
        &self,
        results: ActionResults,
        trace: &TraceCarrier,
    ) -> Result<()> {
        self.check()?;
        self.reports.lock().await.push(results);
        self.traces.lock().await.push(trace.clone());
        self.changed.notify_waiters();
        Ok(())
    }

    async fn action_log(
        &self,
        instance_id: &str,
        iterator: i32,
        lines: Vec<String>,
        _trace: &TraceCarrier,
    ) -> Result<()> {
        self.check()?;
        self.logs.lock().await.push(RecordedLog {
            instance_id: instance_id.to_string(),
            iterator,
            lines,
        });
        self.changed.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::Outcome;

    #[tokio::test]
    async fn test_wait_for_reports() {
        let engine = RecordingEngine::new();

        let reporter = engine.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let results = ActionResults::new("i", 0, "a", 0, Outcome::uncatchable("x"));
            reporter
                .report_action_results(results, &TraceCarrier::default())
                .await
                .unwrap();
        });

        let reports = engine.wait_for_reports(1, Duration::from_secs(2)).await;
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].action_id, "a");
    }

    #[tokio::test]
    async fn test_failing_engine() {
        let engine = RecordingEngine::new();
        engine.set_failing(true);

        let err = engine
            .action_log("i", 0, vec!["line".to_string()], &TraceCarrier::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unavailable"));
        assert!(engine.logs().await.is_empty());
    }
}
