// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Registry of in-flight actions, keyed by action id.
//!
//! The map lock is held only around map operations; callers clone the record
//! out and do their I/O afterwards.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;

use crate::action::ActionRequest;
use crate::telemetry::TraceCarrier;
use crate::variables::ActionRef;

/// Snapshot of the action fields the local endpoints need.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionMeta {
    pub instance_id: String,
    pub namespace: String,
    pub workflow_path: Option<String>,
    pub step: i32,
    pub iterator: i32,
}

impl From<&ActionRequest> for ActionMeta {
    fn from(request: &ActionRequest) -> Self {
        Self {
            instance_id: request.instance_id.clone(),
            namespace: request.namespace.clone(),
            workflow_path: request.workflow_path.clone(),
            step: request.step,
            iterator: request.iterator,
        }
    }
}

/// Runtime record of an executing action.
///
/// `ctx` is the long-lived action scope: it is not tied to the caller's
/// connection, and cancelling it hard-cancels the worker.
#[derive(Debug, Clone)]
pub struct ActiveRequest {
    pub action_id: String,
    pub ctx: CancellationToken,
    pub meta: ActionMeta,
    pub trace: TraceCarrier,
}

impl ActiveRequest {
    /// Identifiers for variable store calls made on behalf of this action.
    pub fn action_ref(&self) -> ActionRef<'_> {
        ActionRef {
            namespace: &self.meta.namespace,
            instance_id: &self.meta.instance_id,
            workflow_path: self.meta.workflow_path.as_deref(),
            cancel: &self.ctx,
        }
    }
}

/// Returned when an action id is already registered.
#[derive(Debug, thiserror::Error)]
#[error("action {0} is already active")]
pub struct DuplicateAction(pub String);

/// `action-id → ActiveRequest` map.
#[derive(Debug, Default)]
pub struct ActiveRequests {
    inner: Mutex<HashMap<String, ActiveRequest>>,
}

impl ActiveRequests {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ActiveRequest>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a record; at most one per action id.
    pub fn register(&self, request: ActiveRequest) -> Result<(), DuplicateAction> {
        let mut map = self.lock();
        if map.contains_key(&request.action_id) {
            return Err(DuplicateAction(request.action_id));
        }
        map.insert(request.action_id.clone(), request);
        Ok(())
    }

    pub fn get(&self, action_id: &str) -> Option<ActiveRequest> {
        self.lock().get(action_id).cloned()
    }

    pub fn contains(&self, action_id: &str) -> bool {
        self.lock().contains_key(action_id)
    }

    /// Remove a record and close its context.
    pub fn deregister(&self, action_id: &str) -> Option<ActiveRequest> {
        let removed = self.lock().remove(action_id);
        if let Some(request) = &removed {
            request.ctx.cancel();
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str) -> ActiveRequest {
        ActiveRequest {
            action_id: id.to_string(),
            ctx: CancellationToken::new(),
            meta: ActionMeta {
                instance_id: "i".to_string(),
                namespace: "ns".to_string(),
                workflow_path: Some("/wf.yaml".to_string()),
                step: 1,
                iterator: 0,
            },
            trace: TraceCarrier::default(),
        }
    }

    #[test]
    fn test_register_rejects_duplicates() {
        let active = ActiveRequests::new();
        active.register(record("a")).unwrap();

        let err = active.register(record("a")).unwrap_err();
        assert_eq!(err.0, "a");
        assert_eq!(active.len(), 1);
    }

    #[test]
    fn test_deregister_cancels_context() {
        let active = ActiveRequests::new();
        let req = record("a");
        let ctx = req.ctx.clone();
        active.register(req).unwrap();

        let removed = active.deregister("a").unwrap();
        assert_eq!(removed.action_id, "a");
        assert!(ctx.is_cancelled());
        assert!(active.get("a").is_none());
        assert!(active.deregister("a").is_none());
        assert!(active.is_empty());
    }

    #[test]
    fn test_action_ref_fields() {
        let req = record("a");
        let action = req.action_ref();
        assert_eq!(action.namespace, "ns");
        assert_eq!(action.instance_id, "i");
        assert_eq!(action.workflow_path, Some("/wf.yaml"));
    }
}
