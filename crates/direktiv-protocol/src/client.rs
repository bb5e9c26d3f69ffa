// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! gRPC client for the flow engine.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint};
use tracing::{debug, instrument};

use crate::flow_proto::{
    ACTION_LOG_PATH, ActionLogRequest, REPORT_ACTION_RESULTS_PATH, ReportActionResultsRequest,
};

/// Errors that can occur in the flow client
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("rpc failed: {0}")]
    Status(#[from] tonic::Status),

    #[error("invalid endpoint {0}")]
    InvalidEndpoint(String),

    #[error("failed to read CA certificate {path}: {source}")]
    CaCertificate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Configuration for the flow client
#[derive(Debug, Clone)]
pub struct FlowClientConfig {
    /// Host name of the flow engine
    pub host: String,
    /// gRPC port of the flow engine
    pub port: u16,
    /// Use TLS for the connection
    pub tls: bool,
    /// Additional PEM bundle trusted for the engine certificate
    pub ca_cert: Option<PathBuf>,
    /// Server name for TLS verification (defaults to `host`)
    pub server_name: Option<String>,
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Per-request timeout in milliseconds
    pub request_timeout_ms: u64,
}

impl Default for FlowClientConfig {
    fn default() -> Self {
        Self {
            host: "direktiv-flow".to_string(),
            port: 7777,
            tls: true,
            ca_cert: None,
            server_name: None,
            connect_timeout_ms: 10_000,
            request_timeout_ms: 30_000,
        }
    }
}

impl FlowClientConfig {
    /// Endpoint URI derived from host, port and TLS setting.
    pub fn uri(&self) -> String {
        let scheme = if self.tls { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }
}

/// gRPC client for the `direktiv_flow.Flow` service.
///
/// Cloning is cheap; clones share the underlying HTTP/2 channel.
#[derive(Debug, Clone)]
pub struct FlowClient {
    inner: tonic::client::Grpc<Channel>,
}

impl FlowClient {
    /// Wrap an existing channel.
    pub fn new(channel: Channel) -> Self {
        Self {
            inner: tonic::client::Grpc::new(channel),
        }
    }

    /// Connect eagerly, failing if the engine is not reachable.
    pub async fn connect(config: &FlowClientConfig) -> Result<Self, ClientError> {
        let channel = Self::endpoint(config)?.connect().await?;
        Ok(Self::new(channel))
    }

    /// Create a client that connects on first use.
    pub fn connect_lazy(config: &FlowClientConfig) -> Result<Self, ClientError> {
        Ok(Self::new(Self::endpoint(config)?.connect_lazy()))
    }

    /// Build the tonic endpoint for the given configuration.
    pub fn endpoint(config: &FlowClientConfig) -> Result<Endpoint, ClientError> {
        let uri = config.uri();
        let mut endpoint = Endpoint::from_shared(uri.clone())
            .map_err(|e| ClientError::InvalidEndpoint(format!("{}: {}", uri, e)))?
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .timeout(Duration::from_millis(config.request_timeout_ms));

        if config.tls {
            let domain = config
                .server_name
                .clone()
                .unwrap_or_else(|| config.host.clone());
            let mut tls = ClientTlsConfig::new()
                .with_webpki_roots()
                .domain_name(domain);

            if let Some(path) = &config.ca_cert {
                let pem = std::fs::read(path).map_err(|source| ClientError::CaCertificate {
                    path: path.clone(),
                    source,
                })?;
                tls = tls.ca_certificate(Certificate::from_pem(pem));
            }

            endpoint = endpoint.tls_config(tls)?;
        }

        debug!(uri = %uri, tls = config.tls, "flow endpoint configured");
        Ok(endpoint)
    }

    /// Report the outcome of an action.
    #[instrument(skip_all, fields(action_id = %request.get_ref().action_id))]
    pub async fn report_action_results(
        &mut self,
        request: tonic::Request<ReportActionResultsRequest>,
    ) -> Result<tonic::Response<()>, tonic::Status> {
        self.ready().await?;
        let path = PathAndQuery::from_static(REPORT_ACTION_RESULTS_PATH);
        self.inner
            .unary(request, path, ProstCodec::default())
            .await
    }

    /// Forward log lines of an action.
    pub async fn action_log(
        &mut self,
        request: tonic::Request<ActionLogRequest>,
    ) -> Result<tonic::Response<()>, tonic::Status> {
        self.ready().await?;
        let path = PathAndQuery::from_static(ACTION_LOG_PATH);
        self.inner
            .unary(request, path, ProstCodec::default())
            .await
    }

    async fn ready(&mut self) -> Result<(), tonic::Status> {
        self.inner
            .ready()
            .await
            .map_err(|e| tonic::Status::unknown(format!("service was not ready: {}", e)))
    }
}
