// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for direktiv-sidecar.

use thiserror::Error;

/// Sidecar errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Flow engine client could not be created.
    #[error("Flow client error: {0}")]
    FlowClient(#[from] direktiv_protocol::ClientError),

    /// HTTP client could not be built.
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    /// User container call or readiness probe failed.
    #[error("User container error: {0}")]
    Container(#[from] crate::container::ContainerError),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type using the sidecar Error.
pub type Result<T> = std::result::Result<T, Error>;
