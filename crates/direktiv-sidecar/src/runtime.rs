// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for the action sidecar.
//!
//! [`SidecarRuntime`] owns every process-wide piece (thread registry, inbound
//! queue, active-request map, worker pool, clients) and wires them together.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use direktiv_sidecar::config::Config;
//! use direktiv_sidecar::engine::GrpcEngine;
//! use direktiv_sidecar::runtime::SidecarRuntime;
//!
//! let config = Config::from_env()?;
//! let client = direktiv_protocol::FlowClient::connect_lazy(&config.flow_client_config())?;
//!
//! let runtime = SidecarRuntime::builder(config)
//!     .engine(Arc::new(GrpcEngine::new(client)))
//!     .handle_signals(true)
//!     .build()?
//!     .start()
//!     .await?;
//!
//! // `SidecarRuntimeConfig::run` does both steps at once.
//! let exit_code = runtime.wait().await;
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::config::Config;
use crate::container::UserContainer;
use crate::engine::EngineReporter;
use crate::error::{Error, Result};
use crate::ingress::{self, INGRESS_SHUTDOWN_GRACE, READINESS_TIMEOUT};
use crate::local_server::{self, CANCEL_GRACE, ControlState, LOCAL_SHUTDOWN_GRACE};
use crate::queue::InboundQueue;
use crate::signals::{self, FORCE_EXIT_AFTER};
use crate::threads::{EXIT_FAILURE, StopSignal, ThreadRegistry};
use crate::variables::VariableClient;
use crate::worker::WorkerPool;

/// Builder for [`SidecarRuntime`].
pub struct SidecarRuntimeBuilder {
    config: Config,
    engine: Option<Arc<dyn EngineReporter>>,
    ingress_listener: Option<TcpListener>,
    local_listener: Option<TcpListener>,
    handle_signals: bool,
    readiness_timeout: Duration,
    local_grace: Duration,
    ingress_grace: Duration,
    cancel_grace: Duration,
}

impl SidecarRuntimeBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            engine: None,
            ingress_listener: None,
            local_listener: None,
            handle_signals: false,
            readiness_timeout: READINESS_TIMEOUT,
            local_grace: LOCAL_SHUTDOWN_GRACE,
            ingress_grace: INGRESS_SHUTDOWN_GRACE,
            cancel_grace: CANCEL_GRACE,
        }
    }

    /// Set the engine reporter (required).
    pub fn engine(mut self, engine: Arc<dyn EngineReporter>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Use an already bound ingress listener instead of binding the configured address.
    pub fn ingress_listener(mut self, listener: TcpListener) -> Self {
        self.ingress_listener = Some(listener);
        self
    }

    /// Use an already bound local listener instead of binding the configured address.
    pub fn local_listener(mut self, listener: TcpListener) -> Self {
        self.local_listener = Some(listener);
        self
    }

    /// Install SIGINT/SIGTERM/SIGUSR1 handlers (default: off).
    pub fn handle_signals(mut self, enabled: bool) -> Self {
        self.handle_signals = enabled;
        self
    }

    /// How long to wait for the user container before giving up (default: 2 minutes).
    pub fn readiness_timeout(mut self, timeout: Duration) -> Self {
        self.readiness_timeout = timeout;
        self
    }

    /// Grace periods of the local and ingress servers (defaults: 20 s / 15 s).
    pub fn shutdown_grace(mut self, local: Duration, ingress: Duration) -> Self {
        self.local_grace = local;
        self.ingress_grace = ingress;
        self
    }

    /// Time a cancelled action gets before it is hard-cancelled (default: 10 s).
    pub fn cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    /// Validate the builder.
    pub fn build(self) -> Result<SidecarRuntimeConfig> {
        let engine = self
            .engine
            .ok_or_else(|| Error::Other("engine is required".to_string()))?;

        Ok(SidecarRuntimeConfig {
            config: self.config,
            engine,
            ingress_listener: self.ingress_listener,
            local_listener: self.local_listener,
            handle_signals: self.handle_signals,
            readiness_timeout: self.readiness_timeout,
            local_grace: self.local_grace,
            ingress_grace: self.ingress_grace,
            cancel_grace: self.cancel_grace,
        })
    }
}

/// Validated configuration of a [`SidecarRuntime`].
pub struct SidecarRuntimeConfig {
    config: Config,
    engine: Arc<dyn EngineReporter>,
    ingress_listener: Option<TcpListener>,
    local_listener: Option<TcpListener>,
    handle_signals: bool,
    readiness_timeout: Duration,
    local_grace: Duration,
    ingress_grace: Duration,
    cancel_grace: Duration,
}

impl SidecarRuntimeConfig {
    /// Start, then wait for shutdown and return the exit code.
    pub async fn run(self) -> Result<i32> {
        Ok(self.start().await?.wait().await)
    }

    /// Start workers and servers.
    ///
    /// The local server is bound before this returns. Ingress first waits for
    /// the user container and binds afterwards unless a listener was supplied.
    pub async fn start(self) -> Result<SidecarRuntime> {
        let config = self.config;
        let registry = ThreadRegistry::new();

        let variables = VariableClient::new(config.variable_store_url(), config.api_key.clone())?;
        let container = UserContainer::new(config.user_port)?;

        let mut control = ControlState::new(
            InboundQueue::new(config.queue_size),
            variables,
            self.engine,
            container,
        );
        control.cancel_grace = self.cancel_grace;
        let state = Arc::new(control);

        let pool = WorkerPool::spawn(config.workers, state.clone(), config.shared_dir.clone());

        let local_listener = match self.local_listener {
            Some(listener) => listener,
            None => TcpListener::bind(config.local_addr).await.inspect_err(|e| {
                error!(addr = %config.local_addr, error = %e, "failed to bind local server")
            })?,
        };
        let local_addr = local_listener.local_addr()?;

        let ingress_addr = match &self.ingress_listener {
            Some(listener) => listener.local_addr()?,
            None => config.ingress_addr,
        };

        // Local control server
        {
            let (guard, stop) = registry.register("local-server");
            let registry = registry.clone();
            let state = state.clone();
            let pool = pool.clone();
            let grace = self.local_grace;
            tokio::spawn(async move {
                let _guard = guard;
                if let Err(e) = local_server::serve(local_listener, state, pool, stop, grace).await {
                    error!(error = %e, "local server failed");
                    registry.stop(Utc::now(), EXIT_FAILURE);
                }
            });
        }

        // Network ingress server
        {
            let (guard, stop) = registry.register("ingress-server");
            let registry = registry.clone();
            let ingress = IngressTask {
                state: state.clone(),
                listener: self.ingress_listener,
                addr: config.ingress_addr,
                readiness_timeout: self.readiness_timeout,
                grace: self.ingress_grace,
            };
            tokio::spawn(async move {
                let _guard = guard;
                if let Err(e) = ingress.run(stop).await {
                    error!(error = %e, "ingress server failed");
                    registry.stop(Utc::now(), EXIT_FAILURE);
                }
            });
        }

        if self.handle_signals {
            signals::spawn(registry.clone(), FORCE_EXIT_AFTER)?;
        }

        info!(
            local_addr = %local_addr,
            ingress_addr = %ingress_addr,
            workers = config.workers,
            queue_size = config.queue_size,
            "sidecar started"
        );

        Ok(SidecarRuntime {
            registry,
            state,
            pool,
            local_addr,
            ingress_addr,
        })
    }
}

struct IngressTask {
    state: Arc<ControlState>,
    listener: Option<TcpListener>,
    addr: SocketAddr,
    readiness_timeout: Duration,
    grace: Duration,
}

impl IngressTask {
    async fn run(self, mut stop: StopSignal) -> Result<()> {
        tokio::select! {
            ready = self.state.container.wait_ready(self.readiness_timeout) => ready?,
            _ = stop.stopped() => return Ok(()),
        }

        let listener = match self.listener {
            Some(listener) => listener,
            None => TcpListener::bind(self.addr).await.inspect_err(|e| {
                error!(addr = %self.addr, error = %e, "failed to bind ingress server")
            })?,
        };

        ingress::serve(listener, self.state, stop, self.grace).await?;
        Ok(())
    }
}

/// A running sidecar.
pub struct SidecarRuntime {
    registry: Arc<ThreadRegistry>,
    state: Arc<ControlState>,
    pool: Arc<WorkerPool>,
    local_addr: SocketAddr,
    ingress_addr: SocketAddr,
}

impl SidecarRuntime {
    pub fn builder(config: Config) -> SidecarRuntimeBuilder {
        SidecarRuntimeBuilder::new(config)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn ingress_addr(&self) -> SocketAddr {
        self.ingress_addr
    }

    pub fn registry(&self) -> &Arc<ThreadRegistry> {
        &self.registry
    }

    pub fn state(&self) -> &Arc<ControlState> {
        &self.state
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Latch shutdown with the given exit code.
    pub fn stop(&self, code: i32) {
        self.registry.stop(Utc::now(), code);
    }

    /// Wait for every server to return and yield the exit code.
    pub async fn wait(self) -> i32 {
        self.registry.wait().await;
        let code = self.registry.exit_status();
        info!(exit_code = code, "sidecar stopped");
        code
    }
}
