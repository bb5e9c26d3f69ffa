// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Engine reporter trait definitions.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::action::Outcome;
use crate::telemetry::TraceCarrier;

/// Errors from engine calls.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// The RPC returned a non-OK status.
    #[error("engine rpc failed: {0}")]
    Rpc(#[from] tonic::Status),

    /// Other error.
    #[error("Other: {0}")]
    Other(String),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Result of one action, flattened for the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionResults {
    pub instance_id: String,
    pub step: i32,
    pub action_id: String,
    pub iterator: i32,
    pub output: Bytes,
    pub error_code: String,
    pub error_message: String,
}

impl ActionResults {
    /// Flatten an outcome into report fields.
    pub fn new(
        instance_id: impl Into<String>,
        step: i32,
        action_id: impl Into<String>,
        iterator: i32,
        outcome: Outcome,
    ) -> Self {
        let (output, error_code, error_message) = match outcome {
            Outcome::Success(output) => (output, String::new(), String::new()),
            Outcome::Catchable { code, message } | Outcome::Uncatchable { code, message } => {
                (Bytes::new(), code, message)
            }
        };
        Self {
            instance_id: instance_id.into(),
            step,
            action_id: action_id.into(),
            iterator,
            output,
            error_code,
            error_message,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error_code.is_empty() && self.error_message.is_empty()
    }
}

/// Sink for action results and action log lines.
#[async_trait]
pub trait EngineReporter: Send + Sync {
    /// Report the outcome of an action. Called exactly once per accepted action.
    async fn report_action_results(
        &self,
        results: ActionResults,
        trace: &TraceCarrier,
    ) -> Result<()>;

    /// Forward log lines of an action.
    async fn action_log(
        &self,
        instance_id: &str,
        iterator: i32,
        lines: Vec<String>,
        trace: &TraceCarrier,
    ) -> Result<()>;
}
