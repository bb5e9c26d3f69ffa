// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Engine module - reporting back to the flow engine.
//!
//! The worker pool and local server only see the [`EngineReporter`] trait;
//! production wiring uses [`GrpcEngine`], tests use [`RecordingEngine`].

pub mod grpc;
pub mod mock;
mod traits;

pub use grpc::GrpcEngine;
pub use mock::RecordingEngine;
pub use traits::*;
