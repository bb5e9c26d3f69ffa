// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP client for the variable store.
//!
//! Scope routing:
//!
//! | Scope         | Lookup filter          | Create body field |
//! |---------------|------------------------|-------------------|
//! | `instance`    | `?instanceId=<id>`     | `instanceId`      |
//! | `workflow`    | `?workflowPath=<path>` | `workflowPath`    |
//! | `namespace`   | none                   | none              |
//! | `file-system` | namespace file tree    | file create       |
//!
//! Every operation runs under the action's cancellation token, so cancelling
//! an action aborts its in-flight variable store exchanges.

use std::future::Future;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::{Bytes, BytesMut};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::action::{HEADER_TOKEN, MAX_PAYLOAD_SIZE, VariableScope};

/// Largest store response read into memory: a base64 payload of
/// [`MAX_PAYLOAD_SIZE`] plus room for the JSON around it.
pub const MAX_RESPONSE_SIZE: usize = MAX_PAYLOAD_SIZE.div_ceil(3) * 4 + (1 << 20);

/// Variable client errors.
#[derive(Debug, Error)]
pub enum VariableError {
    /// The variable (or file) does not exist.
    #[error("{scope} variable '{key}' not found")]
    NotFound { key: String, scope: String },

    #[error("variable store request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// Structured error returned by the store.
    #[error("variable store returned {status}: {code}: {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },

    #[error("malformed variable store response: {0}")]
    Decode(String),

    #[error("variable store response exceeds {limit} bytes")]
    TooLarge { limit: usize },

    #[error("scope {0} is not supported for this operation")]
    InvalidScope(VariableScope),

    #[error("workflow scope requires a workflow path")]
    MissingWorkflowPath,

    #[error("context canceled")]
    Cancelled,
}

impl VariableError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, VariableError::NotFound { .. })
    }
}

/// Identifiers of the action on whose behalf the store is accessed.
#[derive(Debug, Clone, Copy)]
pub struct ActionRef<'a> {
    pub namespace: &'a str,
    pub instance_id: &'a str,
    pub workflow_path: Option<&'a str>,
    pub cancel: &'a CancellationToken,
}

/// Summary of a stored variable.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableMeta {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub size: u64,
}

/// Body of a variable creation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewVariable<'a> {
    pub name: &'a str,
    pub mime_type: &'a str,
    pub data: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_path: Option<&'a str>,
}

/// Partial update of a variable.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VariablePatch<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

/// Which branch `set_or_create` took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOutcome {
    Created,
    Patched,
}

#[derive(Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Deserialize)]
struct DataNode {
    #[serde(default)]
    data: Option<String>,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

/// Client for the variable store HTTP API.
#[derive(Debug, Clone)]
pub struct VariableClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
    response_limit: usize,
}

impl VariableClient {
    /// Create a client for `base_url` (e.g. `http://direktiv-flow:6665`).
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self::with_client(http, base_url, token))
    }

    /// Create a client around an existing reqwest client.
    pub fn with_client(
        http: reqwest::Client,
        base_url: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            response_limit: MAX_RESPONSE_SIZE,
        }
    }

    /// Cap the size of a single store response (default [`MAX_RESPONSE_SIZE`]).
    pub fn with_response_limit(mut self, limit: usize) -> Self {
        self.response_limit = limit;
        self
    }

    fn namespace_url(&self, namespace: &str) -> String {
        format!(
            "{}/api/v2/namespaces/{}",
            self.base_url,
            urlencoding::encode(namespace)
        )
    }

    fn files_url(&self, namespace: &str, path: &str) -> String {
        let encoded: Vec<String> = path
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect();
        let mut joined = encoded.join("/");
        if !joined.starts_with('/') {
            joined.insert(0, '/');
        }
        format!("{}/files{}", self.namespace_url(namespace), joined)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request.header(HEADER_TOKEN, &self.token)
    }

    /// Look up a variable by name in a scope.
    #[instrument(skip(self, action), fields(namespace = action.namespace))]
    pub async fn get_variable_meta(
        &self,
        action: &ActionRef<'_>,
        scope: VariableScope,
        key: &str,
    ) -> Result<VariableMeta, VariableError> {
        let mut request = self
            .http
            .get(format!("{}/variables", self.namespace_url(action.namespace)));
        request = match scope {
            VariableScope::Instance => request.query(&[("instanceId", action.instance_id)]),
            VariableScope::Workflow => request.query(&[("workflowPath", workflow_path(action)?)]),
            VariableScope::Namespace => request,
            VariableScope::FileSystem => return Err(VariableError::InvalidScope(scope)),
        };

        cancellable(action.cancel, async {
            let response = check(self.authorized(request).send().await?).await?;
            let list: Envelope<Vec<VariableMeta>> = decode(response, self.response_limit).await?;
            let wanted = format!("{}-variable", scope);
            list.data
                .into_iter()
                .find(|v| v.kind == wanted && v.name == key)
                .ok_or_else(|| VariableError::NotFound {
                    key: key.to_string(),
                    scope: scope.to_string(),
                })
        })
        .await
    }

    /// Fetch the bytes of a variable by id.
    pub async fn get_variable_data(
        &self,
        action: &ActionRef<'_>,
        id: &str,
    ) -> Result<Bytes, VariableError> {
        let url = format!(
            "{}/variables/{}",
            self.namespace_url(action.namespace),
            urlencoding::encode(id)
        );
        cancellable(action.cancel, async {
            let response = check(self.authorized(self.http.get(url)).send().await?).await?;
            let node: Envelope<DataNode> = decode(response, self.response_limit).await?;
            decode_data(node.data.data)
        })
        .await
    }

    /// Read a file from the namespace file tree. 404 maps to NotFound with scope `file`.
    pub async fn get_referenced_file(
        &self,
        action: &ActionRef<'_>,
        path: &str,
    ) -> Result<Bytes, VariableError> {
        let url = self.files_url(action.namespace, path);
        cancellable(action.cancel, async {
            let response = self.authorized(self.http.get(url)).send().await?;
            if response.status() == StatusCode::NOT_FOUND {
                return Err(VariableError::NotFound {
                    key: path.to_string(),
                    scope: "file".to_string(),
                });
            }
            let node: Envelope<DataNode> = decode(check(response).await?, self.response_limit).await?;
            decode_data(node.data.data)
        })
        .await
    }

    /// Create a variable.
    pub async fn create_variable(
        &self,
        action: &ActionRef<'_>,
        payload: &NewVariable<'_>,
    ) -> Result<(), VariableError> {
        let url = format!("{}/variables", self.namespace_url(action.namespace));
        cancellable(action.cancel, async {
            check(self.authorized(self.http.post(url).json(payload)).send().await?).await?;
            Ok(())
        })
        .await
    }

    /// Partially update a variable.
    pub async fn patch_variable(
        &self,
        action: &ActionRef<'_>,
        id: &str,
        patch: &VariablePatch<'_>,
    ) -> Result<(), VariableError> {
        let url = format!(
            "{}/variables/{}",
            self.namespace_url(action.namespace),
            urlencoding::encode(id)
        );
        cancellable(action.cancel, async {
            check(self.authorized(self.http.patch(url).json(patch)).send().await?).await?;
            Ok(())
        })
        .await
    }

    /// Create a file in the namespace file tree.
    pub async fn create_file(
        &self,
        action: &ActionRef<'_>,
        path: &str,
        mime_type: &str,
        data: &[u8],
    ) -> Result<(), VariableError> {
        let (dir, name) = match path.trim_start_matches('/').rsplit_once('/') {
            Some((dir, name)) => (format!("/{}", dir), name),
            None => ("/".to_string(), path.trim_start_matches('/')),
        };
        let url = self.files_url(action.namespace, &dir);
        let body = serde_json::json!({
            "name": name,
            "type": "file",
            "mimeType": mime_type,
            "data": BASE64.encode(data),
        });
        cancellable(action.cancel, async {
            check(self.authorized(self.http.post(url).json(&body)).send().await?).await?;
            Ok(())
        })
        .await
    }

    /// Replace the content of a namespace file.
    pub async fn patch_file(
        &self,
        action: &ActionRef<'_>,
        path: &str,
        mime_type: &str,
        data: &[u8],
    ) -> Result<(), VariableError> {
        let url = self.files_url(action.namespace, path);
        let body = serde_json::json!({
            "mimeType": mime_type,
            "data": BASE64.encode(data),
        });
        cancellable(action.cancel, async {
            check(self.authorized(self.http.patch(url).json(&body)).send().await?).await?;
            Ok(())
        })
        .await
    }

    /// Fetch the bytes stored under `key` in `scope`.
    pub async fn get_variable(
        &self,
        action: &ActionRef<'_>,
        scope: VariableScope,
        key: &str,
    ) -> Result<Bytes, VariableError> {
        if scope == VariableScope::FileSystem {
            return self.get_referenced_file(action, key).await;
        }
        let meta = self.get_variable_meta(action, scope, key).await?;
        self.get_variable_data(action, &meta.id).await
    }

    /// Store `data` under `key`: patch when it exists, create otherwise.
    pub async fn set_or_create(
        &self,
        action: &ActionRef<'_>,
        scope: VariableScope,
        key: &str,
        mime_type: &str,
        data: &[u8],
    ) -> Result<SetOutcome, VariableError> {
        if scope == VariableScope::FileSystem {
            return match self.get_referenced_file(action, key).await {
                Ok(_) => {
                    self.patch_file(action, key, mime_type, data).await?;
                    Ok(SetOutcome::Patched)
                }
                Err(e) if e.is_not_found() => {
                    self.create_file(action, key, mime_type, data).await?;
                    Ok(SetOutcome::Created)
                }
                Err(e) => Err(e),
            };
        }

        match self.get_variable_meta(action, scope, key).await {
            Ok(meta) => {
                let patch = VariablePatch {
                    name: None,
                    mime_type: Some(mime_type),
                    data: Some(BASE64.encode(data)),
                };
                self.patch_variable(action, &meta.id, &patch).await?;
                debug!(key, %scope, id = %meta.id, "variable patched");
                Ok(SetOutcome::Patched)
            }
            Err(e) if e.is_not_found() => {
                let payload = NewVariable {
                    name: key,
                    mime_type,
                    data: BASE64.encode(data),
                    instance_id: (scope == VariableScope::Instance).then_some(action.instance_id),
                    workflow_path: match scope {
                        VariableScope::Workflow => Some(workflow_path(action)?),
                        _ => None,
                    },
                };
                self.create_variable(action, &payload).await?;
                debug!(key, %scope, "variable created");
                Ok(SetOutcome::Created)
            }
            Err(e) => Err(e),
        }
    }
}

fn workflow_path<'a>(action: &ActionRef<'a>) -> Result<&'a str, VariableError> {
    action
        .workflow_path
        .filter(|p| !p.is_empty())
        .ok_or(VariableError::MissingWorkflowPath)
}

async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T, VariableError>>,
) -> Result<T, VariableError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(VariableError::Cancelled),
        result = fut => result,
    }
}

async fn check(response: Response) -> Result<Response, VariableError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let (code, message) = match serde_json::from_str::<ApiErrorBody>(&body) {
        Ok(parsed) => (parsed.error.code, parsed.error.message),
        Err(_) => (String::new(), body),
    };
    Err(VariableError::Api {
        status: status.as_u16(),
        code,
        message,
    })
}

async fn decode<T: serde::de::DeserializeOwned>(
    mut response: Response,
    limit: usize,
) -> Result<T, VariableError> {
    if let Some(len) = response.content_length()
        && len > limit as u64
    {
        return Err(VariableError::TooLarge { limit });
    }
    let mut body = BytesMut::new();
    while let Some(chunk) = response.chunk().await? {
        if body.len() + chunk.len() > limit {
            return Err(VariableError::TooLarge { limit });
        }
        body.extend_from_slice(&chunk);
    }
    serde_json::from_slice(&body).map_err(|e| VariableError::Decode(e.to_string()))
}

fn decode_data(data: Option<String>) -> Result<Bytes, VariableError> {
    match data {
        Some(encoded) if !encoded.is_empty() => BASE64
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(|e| VariableError::Decode(format!("base64: {}", e))),
        _ => Ok(Bytes::new()),
    }
}
