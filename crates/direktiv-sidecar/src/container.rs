// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP access to the user container on `localhost:<user-port>`.

use std::path::Path;
use std::time::{Duration, Instant};

use axum::http::HeaderMap;
use bytes::{Bytes, BytesMut};
use reqwest::StatusCode;
use reqwest::header::CONTENT_TYPE;
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::{debug, info, trace};

use crate::action::{
    ActionRequest, HEADER_ACTION_ID, HEADER_ERROR_CODE, HEADER_ERROR_MESSAGE, HEADER_ITERATOR,
    HEADER_TEMP_DIR, MAX_PAYLOAD_SIZE, Outcome,
};

/// Probe timeout for a single readiness connect.
const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Pause between readiness probes.
const PROBE_INTERVAL: Duration = Duration::from_millis(250);

/// Error code reported when the container answers non-2xx without an error code.
pub const CONTAINER_FAILED: &str = "container failed";

/// User container errors.
#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("{0}")]
    Transport(#[from] reqwest::Error),

    #[error("response body exceeds {limit} bytes")]
    TooLarge { limit: usize },

    #[error("user container not ready on port {port} after {waited:?}: {last_error}")]
    NotReady {
        port: u16,
        waited: Duration,
        last_error: String,
    },
}

/// Raw answer of the user container.
#[derive(Debug, Clone)]
pub struct ContainerResponse {
    pub status: StatusCode,
    pub error_code: Option<String>,
    pub error_message: String,
    pub body: Bytes,
}

impl ContainerResponse {
    /// Classify the response.
    ///
    /// An error-code header wins over the status; otherwise non-2xx is an
    /// uncatchable `container failed` carrying the body as message.
    pub fn into_outcome(self) -> Outcome {
        if let Some(code) = self.error_code {
            return Outcome::Catchable {
                code,
                message: self.error_message,
            };
        }
        if !self.status.is_success() {
            return Outcome::Uncatchable {
                code: CONTAINER_FAILED.to_string(),
                message: String::from_utf8_lossy(&self.body).into_owned(),
            };
        }
        Outcome::Success(self.body)
    }
}

/// Client for the user container.
#[derive(Debug, Clone)]
pub struct UserContainer {
    http: reqwest::Client,
    host: String,
    port: u16,
}

impl UserContainer {
    pub fn new(port: u16) -> Result<Self, reqwest::Error> {
        Self::with_host("localhost", port)
    }

    pub fn with_host(host: impl Into<String>, port: u16) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            host: host.into(),
            port,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// Poll the container port until it accepts a TCP connection.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<(), ContainerError> {
        let start = Instant::now();
        let mut last_error = String::from("no attempt made");

        debug!(port = self.port, "waiting for user container");

        while start.elapsed() < timeout {
            match tokio::time::timeout(
                PROBE_TIMEOUT,
                TcpStream::connect((self.host.as_str(), self.port)),
            )
            .await
            {
                Ok(Ok(_)) => {
                    info!(port = self.port, elapsed = ?start.elapsed(), "user container ready");
                    return Ok(());
                }
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => last_error = "connect timed out".to_string(),
            }
            trace!(port = self.port, error = %last_error, "user container not ready, retrying");
            tokio::time::sleep(PROBE_INTERVAL).await;
        }

        Err(ContainerError::NotReady {
            port: self.port,
            waited: start.elapsed(),
            last_error,
        })
    }

    /// Run an action in the container.
    pub async fn invoke(
        &self,
        request: &ActionRequest,
        temp_dir: &Path,
    ) -> Result<ContainerResponse, ContainerError> {
        let mut trace_headers = HeaderMap::new();
        request.trace.inject_headers(&mut trace_headers);

        let mut response = self
            .http
            .post(format!("{}/", self.base_url()))
            .query(&[("action_id", request.action_id.as_str())])
            .headers(trace_headers)
            .header(HEADER_ACTION_ID, &request.action_id)
            .header(HEADER_ITERATOR, request.iterator.to_string())
            .header(HEADER_TEMP_DIR, temp_dir.to_string_lossy().as_ref())
            .header(CONTENT_TYPE, "application/json")
            .body(request.input.clone())
            .send()
            .await?;

        let status = response.status();
        let header = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let error_code = header(HEADER_ERROR_CODE).filter(|c| !c.is_empty());
        let error_message = header(HEADER_ERROR_MESSAGE).unwrap_or_default();

        if let Some(len) = response.content_length()
            && len > MAX_PAYLOAD_SIZE as u64
        {
            return Err(ContainerError::TooLarge {
                limit: MAX_PAYLOAD_SIZE,
            });
        }

        let mut body = BytesMut::new();
        while let Some(chunk) = response.chunk().await? {
            if body.len() + chunk.len() > MAX_PAYLOAD_SIZE {
                return Err(ContainerError::TooLarge {
                    limit: MAX_PAYLOAD_SIZE,
                });
            }
            body.extend_from_slice(&chunk);
        }

        debug!(
            action_id = %request.action_id,
            status = status.as_u16(),
            bytes = body.len(),
            "user container responded"
        );

        Ok(ContainerResponse {
            status,
            error_code,
            error_message,
            body: body.freeze(),
        })
    }

    /// Ask the container to cancel an action (`DELETE /`). Best effort.
    pub async fn cancel(&self, action_id: &str) -> Result<StatusCode, ContainerError> {
        let response = self
            .http
            .delete(format!("{}/", self.base_url()))
            .header(HEADER_ACTION_ID, action_id)
            .timeout(Duration::from_secs(10))
            .send()
            .await?;
        Ok(response.status())
    }
}
