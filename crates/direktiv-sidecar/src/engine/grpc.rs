// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! gRPC-backed engine reporter.

use async_trait::async_trait;
use direktiv_protocol::FlowClient;
use direktiv_protocol::flow_proto::{ActionLogRequest, ReportActionResultsRequest};
use tracing::debug;

use super::traits::*;
use crate::telemetry::TraceCarrier;

/// Reports to the flow engine over `direktiv_flow.Flow`.
#[derive(Debug, Clone)]
pub struct GrpcEngine {
    client: FlowClient,
}

impl GrpcEngine {
    pub fn new(client: FlowClient) -> Self {
        Self { client }
    }
}

fn with_trace<T>(message: T, trace: &TraceCarrier) -> tonic::Request<T> {
    let mut request = tonic::Request::new(message);
    trace.inject_metadata(request.metadata_mut());
    request
}

#[async_trait]
impl EngineReporter for GrpcEngine {
    async fn report_action_results(
        &self,
        results: ActionResults,
        trace: &TraceCarrier,
    ) -> Result<()> {
        let message = ReportActionResultsRequest {
            instance_id: results.instance_id,
            step: results.step,
            action_id: results.action_id,
            iterator: results.iterator,
            output: results.output.to_vec(),
            error_code: results.error_code,
            error_message: results.error_message,
        };
        // Clones share the channel; the tonic client needs `&mut self`.
        let mut client = self.client.clone();
        client
            .report_action_results(with_trace(message, trace))
            .await?;
        Ok(())
    }

    async fn action_log(
        &self,
        instance_id: &str,
        iterator: i32,
        lines: Vec<String>,
        trace: &TraceCarrier,
    ) -> Result<()> {
        debug!(instance_id, lines = lines.len(), "forwarding action log");
        let message = ActionLogRequest {
            instance_id: instance_id.to_string(),
            iterator,
            msg: lines,
        };
        let mut client = self.client.clone();
        client.action_log(with_trace(message, trace)).await?;
        Ok(())
    }
}
