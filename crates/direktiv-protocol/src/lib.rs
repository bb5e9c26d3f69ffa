// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Direktiv Protocol - gRPC + Protobuf communication with the flow engine
//!
//! This crate provides the wire protocol the action sidecar uses to talk to
//! the flow engine:
//! - Reporting action results (success, catchable and uncatchable failures)
//! - Forwarding log lines emitted by the user container
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    direktiv-protocol                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  RPC Layer: unary calls on `direktiv_flow.Flow`             │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Serialization: Protobuf (prost)                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Transport: HTTP/2 + TLS (tonic, rustls)                    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use direktiv_protocol::{FlowClient, FlowClientConfig, flow_proto};
//!
//! let mut client = FlowClient::connect_lazy(&FlowClientConfig::default())?;
//!
//! let request = flow_proto::ReportActionResultsRequest {
//!     instance_id: "instance-1".to_string(),
//!     step: 2,
//!     action_id: "action-1".to_string(),
//!     iterator: 0,
//!     output: b"{}".to_vec(),
//!     error_code: String::new(),
//!     error_message: String::new(),
//! };
//!
//! client.report_action_results(tonic::Request::new(request)).await?;
//! ```

pub mod client;
pub mod flow_proto;

// Re-export main types
pub use client::{ClientError, FlowClient, FlowClientConfig};
