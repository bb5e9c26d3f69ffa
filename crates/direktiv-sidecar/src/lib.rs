// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Direktiv Action Sidecar
//!
//! The per-pod agent between the flow engine and a user container:
//! - Accepts actions from the engine and queues them with back-pressure
//! - Stages input files from variables into a per-action workspace
//! - Invokes the user container over local HTTP
//! - Stores output files as variables and reports the outcome to the engine
//!
//! # Architecture
//!
//! ```text
//!        flow engine
//!     │  POST / , /cancel        ▲ ReportActionResults / ActionLog (gRPC)
//!     ▼                          │
//! ┌──────────────────────┐  ┌────┴─────────────────────────────────────┐
//! │ ingress :8890        │  │ worker pool (W workers)                  │
//! │  validate envelope   │  │  provision ─▶ invoke ─▶ harvest ─▶ report│
//! │  enqueue, wait       │─▶│                                          │
//! └──────────────────────┘  └────┬───────────────┬─────────────────────┘
//!            inbound queue       │ workspace     │ HTTP POST /
//!                                ▼               ▼
//! ┌──────────────────────┐    /mnt/shared/   ┌──────────────────┐
//! │ local server :8889   │◀── /log, /var ────│ user container   │
//! │  active requests     │                   │ localhost:8080   │
//! └─────────┬────────────┘                   └──────────────────┘
//!           ▼
//!     variable store (HTTP :6665)
//! ```
//!
//! Shutdown is coordinated by the [`threads::ThreadRegistry`]: the first stop
//! drains the queue with 503s, gives running actions the server grace period,
//! then hard-cancels what is left.

pub mod action;
pub mod active;
pub mod archive;
pub mod config;
pub mod container;
pub mod engine;
pub mod error;
pub mod ingress;
pub mod local_server;
pub mod queue;
pub mod runtime;
pub mod serve;
pub mod signals;
pub mod telemetry;
pub mod threads;
pub mod variables;
pub mod worker;
pub mod workspace;

pub use error::{Error, Result};
