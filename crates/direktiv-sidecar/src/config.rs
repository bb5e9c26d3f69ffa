// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use direktiv_protocol::FlowClientConfig;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human readable text (default)
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

impl LogFormat {
    /// Read `DIREKTIV_LOG_FORMAT`, falling back to text for unknown values.
    pub fn from_env() -> Self {
        match std::env::var("DIREKTIV_LOG_FORMAT").as_deref() {
            Ok("json") => LogFormat::Json,
            _ => LogFormat::Text,
        }
    }
}

/// Sidecar configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Host of the flow engine (gRPC) and the variable store (HTTP)
    pub flow_host: String,
    /// Flow engine gRPC port
    pub flow_grpc_port: u16,
    /// Variable store HTTP port
    pub flow_api_port: u16,
    /// Use TLS toward the flow engine
    pub flow_tls: bool,
    /// Optional PEM bundle trusted for the flow engine certificate
    pub flow_ca_cert: Option<PathBuf>,
    /// Token sent to the variable store
    pub api_key: String,
    /// Port the user container listens on
    pub user_port: u16,
    /// Root directory for per-action workspaces
    pub shared_dir: PathBuf,
    /// Number of workers
    pub workers: usize,
    /// Capacity of the inbound queue
    pub queue_size: usize,
    /// Address of the network ingress server (engine → sidecar)
    pub ingress_addr: SocketAddr,
    /// Address of the local control server (user container → sidecar)
    pub local_addr: SocketAddr,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            flow_host: "direktiv-flow".to_string(),
            flow_grpc_port: 7777,
            flow_api_port: 6665,
            flow_tls: true,
            flow_ca_cert: None,
            api_key: String::new(),
            user_port: 8080,
            shared_dir: PathBuf::from("/mnt/shared"),
            workers: 10,
            queue_size: 100,
            ingress_addr: SocketAddr::from(([0, 0, 0, 0], 8890)),
            local_addr: SocketAddr::from(([127, 0, 0, 1], 8889)),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Optional (with defaults):
    /// - `DIREKTIV_FLOW_HOST`: flow engine / variable store host (default: direktiv-flow)
    /// - `DIREKTIV_FLOW_GRPC_PORT`: flow engine gRPC port (default: 7777)
    /// - `DIREKTIV_FLOW_API_PORT`: variable store port (default: 6665)
    /// - `DIREKTIV_FLOW_TLS`: TLS toward the engine (default: true)
    /// - `DIREKTIV_FLOW_CA_CERT`: PEM bundle for the engine certificate
    /// - `DIREKTIV_API_KEY`: variable store token (default: empty)
    /// - `DIREKTIV_USER_PORT`: user container port (default: 8080)
    /// - `DIREKTIV_SHARED_DIR`: workspace root (default: /mnt/shared)
    /// - `DIREKTIV_WORKERS`: worker count (default: 10)
    /// - `DIREKTIV_QUEUE_SIZE`: inbound queue capacity (default: 100)
    /// - `DIREKTIV_CONTAINER_MODE`: when set, ingress binds port 80 instead of 8890
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let flow_host = std::env::var("DIREKTIV_FLOW_HOST").unwrap_or(defaults.flow_host);
        let flow_grpc_port = parse_var("DIREKTIV_FLOW_GRPC_PORT", defaults.flow_grpc_port)
            .map_err(|_| {
                ConfigError::Invalid("DIREKTIV_FLOW_GRPC_PORT", "must be a valid port number")
            })?;
        let flow_api_port = parse_var("DIREKTIV_FLOW_API_PORT", defaults.flow_api_port)
            .map_err(|_| {
                ConfigError::Invalid("DIREKTIV_FLOW_API_PORT", "must be a valid port number")
            })?;

        let flow_tls = match std::env::var("DIREKTIV_FLOW_TLS") {
            Ok(v) => match v.as_str() {
                "true" | "1" => true,
                "false" | "0" => false,
                _ => {
                    return Err(ConfigError::Invalid(
                        "DIREKTIV_FLOW_TLS",
                        "must be true, false, 1 or 0",
                    ));
                }
            },
            Err(_) => defaults.flow_tls,
        };

        let flow_ca_cert = std::env::var("DIREKTIV_FLOW_CA_CERT")
            .ok()
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);

        let api_key = std::env::var("DIREKTIV_API_KEY").unwrap_or_default();

        let user_port = parse_var("DIREKTIV_USER_PORT", defaults.user_port).map_err(|_| {
            ConfigError::Invalid("DIREKTIV_USER_PORT", "must be a valid port number")
        })?;

        let shared_dir = std::env::var("DIREKTIV_SHARED_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.shared_dir);

        let workers: usize = parse_var("DIREKTIV_WORKERS", defaults.workers)
            .ok()
            .filter(|w| *w > 0)
            .ok_or(ConfigError::Invalid(
                "DIREKTIV_WORKERS",
                "must be a positive integer",
            ))?;

        let queue_size: usize = parse_var("DIREKTIV_QUEUE_SIZE", defaults.queue_size)
            .ok()
            .filter(|q| *q > 0)
            .ok_or(ConfigError::Invalid(
                "DIREKTIV_QUEUE_SIZE",
                "must be a positive integer",
            ))?;

        let ingress_port = if std::env::var_os("DIREKTIV_CONTAINER_MODE").is_some() {
            80
        } else {
            defaults.ingress_addr.port()
        };

        Ok(Self {
            flow_host,
            flow_grpc_port,
            flow_api_port,
            flow_tls,
            flow_ca_cert,
            api_key,
            user_port,
            shared_dir,
            workers,
            queue_size,
            ingress_addr: SocketAddr::from(([0, 0, 0, 0], ingress_port)),
            local_addr: defaults.local_addr,
        })
    }

    /// Base URL of the variable store.
    pub fn variable_store_url(&self) -> String {
        format!("http://{}:{}", self.flow_host, self.flow_api_port)
    }

    /// Client configuration for the flow engine RPC.
    pub fn flow_client_config(&self) -> FlowClientConfig {
        FlowClientConfig {
            host: self.flow_host.clone(),
            port: self.flow_grpc_port,
            tls: self.flow_tls,
            ca_cert: self.flow_ca_cert.clone(),
            ..Default::default()
        }
    }
}

fn parse_var<T: FromStr>(name: &str, default: T) -> Result<T, T::Err> {
    match std::env::var(name) {
        Ok(value) => value.parse(),
        Err(_) => Ok(default),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that modify environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const VARS: &[&str] = &[
        "DIREKTIV_FLOW_HOST",
        "DIREKTIV_FLOW_GRPC_PORT",
        "DIREKTIV_FLOW_API_PORT",
        "DIREKTIV_FLOW_TLS",
        "DIREKTIV_FLOW_CA_CERT",
        "DIREKTIV_API_KEY",
        "DIREKTIV_USER_PORT",
        "DIREKTIV_SHARED_DIR",
        "DIREKTIV_WORKERS",
        "DIREKTIV_QUEUE_SIZE",
        "DIREKTIV_CONTAINER_MODE",
    ];

    /// Helper to set env vars for a test and restore them after
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        /// Start from a clean slate for every variable the config reads.
        fn clean() -> Self {
            let mut guard = Self { vars: Vec::new() };
            for var in VARS {
                guard.remove(var);
            }
            guard
        }

        fn set(&mut self, key: &str, value: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }

        fn remove(&mut self, key: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::remove_var(key) };
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..).rev() {
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe {
                    match value {
                        Some(v) => env::set_var(&key, v),
                        None => env::remove_var(&key),
                    }
                }
            }
        }
    }

    #[test]
    fn test_config_from_env_with_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let _guard = EnvGuard::clean();

        let config = Config::from_env().unwrap();

        assert_eq!(config.flow_host, "direktiv-flow");
        assert_eq!(config.flow_grpc_port, 7777);
        assert_eq!(config.flow_api_port, 6665);
        assert!(config.flow_tls);
        assert_eq!(config.user_port, 8080);
        assert_eq!(config.shared_dir, PathBuf::from("/mnt/shared"));
        assert_eq!(config.workers, 10);
        assert_eq!(config.queue_size, 100);
        assert_eq!(config.ingress_addr.port(), 8890);
        assert_eq!(config.local_addr, "127.0.0.1:8889".parse().unwrap());
    }

    #[test]
    fn test_config_container_mode_binds_port_80() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();

        guard.set("DIREKTIV_CONTAINER_MODE", "1");

        let config = Config::from_env().unwrap();
        assert_eq!(config.ingress_addr.port(), 80);
    }

    #[test]
    fn test_config_all_custom() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();

        guard.set("DIREKTIV_FLOW_HOST", "flow.internal");
        guard.set("DIREKTIV_FLOW_GRPC_PORT", "9777");
        guard.set("DIREKTIV_FLOW_API_PORT", "9665");
        guard.set("DIREKTIV_FLOW_TLS", "false");
        guard.set("DIREKTIV_API_KEY", "secret");
        guard.set("DIREKTIV_USER_PORT", "9090");
        guard.set("DIREKTIV_SHARED_DIR", "/tmp/shared");
        guard.set("DIREKTIV_WORKERS", "4");
        guard.set("DIREKTIV_QUEUE_SIZE", "8");

        let config = Config::from_env().unwrap();

        assert_eq!(config.variable_store_url(), "http://flow.internal:9665");
        assert_eq!(config.api_key, "secret");
        assert_eq!(config.user_port, 9090);
        assert_eq!(config.workers, 4);
        assert_eq!(config.queue_size, 8);

        let flow = config.flow_client_config();
        assert_eq!(flow.host, "flow.internal");
        assert_eq!(flow.port, 9777);
        assert!(!flow.tls);
    }

    #[test]
    fn test_config_invalid_user_port() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();

        guard.set("DIREKTIV_USER_PORT", "99999");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("DIREKTIV_USER_PORT", _)));
        assert!(err.to_string().contains("DIREKTIV_USER_PORT"));
    }

    #[test]
    fn test_config_zero_workers_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();

        guard.set("DIREKTIV_WORKERS", "0");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("DIREKTIV_WORKERS", _)));
    }

    #[test]
    fn test_config_invalid_tls_flag() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();

        guard.set("DIREKTIV_FLOW_TLS", "maybe");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("DIREKTIV_FLOW_TLS", _)));
    }
}
