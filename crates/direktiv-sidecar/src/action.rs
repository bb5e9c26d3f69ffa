// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Action envelope types.
//!
//! An action arrives as a set of `Direktiv-*` headers plus a JSON body. This
//! module parses the envelope into a typed [`ActionRequest`] and defines the
//! [`Outcome`] reported back to the flow engine.

use std::fmt;
use std::str::FromStr;

use axum::http::HeaderMap;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::telemetry::TraceCarrier;

/// Maximum size of an action input or user-container response body.
pub const MAX_PAYLOAD_SIZE: usize = 128 << 20;

/// Maximum size of a log line posted to the local server.
pub const MAX_LOG_SIZE: usize = 4 << 20;

pub const HEADER_ACTION_ID: &str = "Direktiv-ActionID";
pub const HEADER_INSTANCE_ID: &str = "Direktiv-InstanceID";
pub const HEADER_NAMESPACE: &str = "Direktiv-Namespace";
pub const HEADER_STEP: &str = "Direktiv-Step";
pub const HEADER_ITERATOR: &str = "Direktiv-Iterator";
pub const HEADER_DEADLINE: &str = "Direktiv-Deadline";
pub const HEADER_FUNCTION_CONTEXT: &str = "Direktiv-Function-Context";
pub const HEADER_FILES: &str = "Direktiv-Files";
pub const HEADER_TEMP_DIR: &str = "Direktiv-TempDir";
pub const HEADER_ERROR_CODE: &str = "Direktiv-ErrorCode";
pub const HEADER_ERROR_MESSAGE: &str = "Direktiv-ErrorMessage";
pub const HEADER_TOKEN: &str = "Direktiv-Token";

/// Envelope validation errors. Always answered with 400 at ingress.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("missing header {0}")]
    MissingHeader(&'static str),

    #[error("invalid header {header}: {reason}")]
    InvalidHeader {
        header: &'static str,
        reason: String,
    },

    #[error("invalid file spec: {0}")]
    InvalidFileSpec(String),

    #[error("payload of {0} bytes exceeds the {MAX_PAYLOAD_SIZE} byte limit")]
    PayloadTooLarge(usize),
}

/// Addressing domain of a variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VariableScope {
    #[serde(rename = "instance")]
    Instance,
    #[serde(rename = "workflow")]
    Workflow,
    #[serde(rename = "namespace")]
    Namespace,
    #[serde(rename = "file-system")]
    FileSystem,
}

impl VariableScope {
    /// All scopes, in harvest order.
    pub const ALL: [VariableScope; 4] = [
        VariableScope::FileSystem,
        VariableScope::Namespace,
        VariableScope::Workflow,
        VariableScope::Instance,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            VariableScope::Instance => "instance",
            VariableScope::Workflow => "workflow",
            VariableScope::Namespace => "namespace",
            VariableScope::FileSystem => "file-system",
        }
    }
}

impl fmt::Display for VariableScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VariableScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "instance" => Ok(VariableScope::Instance),
            "workflow" => Ok(VariableScope::Workflow),
            "namespace" => Ok(VariableScope::Namespace),
            "file-system" => Ok(VariableScope::FileSystem),
            other => Err(format!("unknown scope '{}'", other)),
        }
    }
}

/// How a staged variable is written to disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FileType {
    #[default]
    #[serde(rename = "plain", alias = "")]
    Plain,
    #[serde(rename = "base64")]
    Base64,
    #[serde(rename = "tar")]
    Tar,
    #[serde(rename = "tar.gz")]
    TarGz,
}

impl FileType {
    /// Archive types materialize as a directory.
    pub fn is_archive(&self) -> bool {
        matches!(self, FileType::Tar | FileType::TarGz)
    }
}

/// One variable-derived artifact to stage into the workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileSpec {
    pub key: String,
    #[serde(rename = "as", default, skip_serializing_if = "String::is_empty")]
    pub as_name: String,
    pub scope: VariableScope,
    #[serde(rename = "type", default)]
    pub file_type: FileType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub permissions: String,
}

impl FileSpec {
    /// Name of the staged file or directory inside the workspace.
    ///
    /// Defaults to the last path segment of `key`, so file-system keys such as
    /// `/config/app.yaml` land as `app.yaml`.
    pub fn destination(&self) -> &str {
        if !self.as_name.is_empty() {
            return &self.as_name;
        }
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }

    /// Octal permission override, if any.
    pub fn mode(&self) -> Result<Option<u32>, ValidationError> {
        if self.permissions.is_empty() {
            return Ok(None);
        }
        match u32::from_str_radix(&self.permissions, 8) {
            Ok(mode) if mode <= 0o7777 => Ok(Some(mode)),
            _ => Err(ValidationError::InvalidFileSpec(format!(
                "permissions '{}' is not an octal mode",
                self.permissions
            ))),
        }
    }

    /// Decode one `Direktiv-Files` header value.
    pub fn decode(value: &str) -> Result<Self, ValidationError> {
        let raw = BASE64
            .decode(value.trim())
            .map_err(|e| ValidationError::InvalidFileSpec(format!("base64: {}", e)))?;
        let spec: FileSpec = serde_json::from_slice(&raw)
            .map_err(|e| ValidationError::InvalidFileSpec(e.to_string()))?;
        spec.validate()?;
        Ok(spec)
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if self.key.is_empty() {
            return Err(ValidationError::InvalidFileSpec("empty key".to_string()));
        }
        let dest = self.destination();
        if dest.is_empty() || dest == "." || dest == ".." || dest.contains(['/', '\\']) {
            return Err(ValidationError::InvalidFileSpec(format!(
                "invalid destination '{}'",
                dest
            )));
        }
        self.mode()?;
        Ok(())
    }
}

/// Decoded `Direktiv-Function-Context`.
///
/// Only `workflowPath` is interpreted; every other key is kept verbatim.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FunctionContext {
    #[serde(rename = "workflowPath", default, skip_serializing_if = "Option::is_none")]
    pub workflow_path: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl FunctionContext {
    fn decode(value: &str) -> Result<Self, ValidationError> {
        let invalid = |reason: String| ValidationError::InvalidHeader {
            header: HEADER_FUNCTION_CONTEXT,
            reason,
        };
        let raw = BASE64
            .decode(value.trim())
            .map_err(|e| invalid(format!("base64: {}", e)))?;
        serde_json::from_slice(&raw).map_err(|e| invalid(e.to_string()))
    }
}

/// A validated action, ready to be queued.
#[derive(Debug, Clone)]
pub struct ActionRequest {
    pub action_id: String,
    pub instance_id: String,
    pub namespace: String,
    pub workflow_path: Option<String>,
    pub step: i32,
    pub iterator: i32,
    pub deadline: DateTime<Utc>,
    pub input: Bytes,
    pub files: Vec<FileSpec>,
    pub function_context: FunctionContext,
    pub trace: TraceCarrier,
}

impl ActionRequest {
    /// Parse the header envelope and body of an engine request.
    pub fn from_parts(headers: &HeaderMap, body: Bytes) -> Result<Self, ValidationError> {
        if body.len() > MAX_PAYLOAD_SIZE {
            return Err(ValidationError::PayloadTooLarge(body.len()));
        }

        let action_id = action_id(headers)?.to_string();
        let instance_id = required(headers, HEADER_INSTANCE_ID)?.to_string();
        let namespace = required(headers, HEADER_NAMESPACE)?.to_string();
        let step = counter(headers, HEADER_STEP)?;
        let iterator = counter(headers, HEADER_ITERATOR)?;

        let deadline = DateTime::parse_from_rfc3339(required(headers, HEADER_DEADLINE)?)
            .map_err(|e| ValidationError::InvalidHeader {
                header: HEADER_DEADLINE,
                reason: e.to_string(),
            })?
            .with_timezone(&Utc);

        let function_context = FunctionContext::decode(required(headers, HEADER_FUNCTION_CONTEXT)?)?;

        let files = headers
            .get_all(HEADER_FILES)
            .iter()
            .map(|value| {
                let value = value.to_str().map_err(|_| {
                    ValidationError::InvalidFileSpec("header is not ASCII".to_string())
                })?;
                FileSpec::decode(value)
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            action_id,
            instance_id,
            namespace,
            workflow_path: function_context.workflow_path.clone(),
            step,
            iterator,
            deadline,
            input: body,
            files,
            function_context,
            trace: TraceCarrier::from_headers(headers),
        })
    }
}

/// The action id names the workspace directory, so it must be one path segment.
fn action_id(headers: &HeaderMap) -> Result<&str, ValidationError> {
    let id = required(headers, HEADER_ACTION_ID)?;
    if id == "." || id == ".." || id.contains(['/', '\\', '\0']) {
        return Err(ValidationError::InvalidHeader {
            header: HEADER_ACTION_ID,
            reason: "must be a single path segment".to_string(),
        });
    }
    Ok(id)
}

fn required<'a>(headers: &'a HeaderMap, name: &'static str) -> Result<&'a str, ValidationError> {
    let value = headers
        .get(name)
        .ok_or(ValidationError::MissingHeader(name))?
        .to_str()
        .map_err(|_| ValidationError::InvalidHeader {
            header: name,
            reason: "not visible ASCII".to_string(),
        })?;
    if value.is_empty() {
        return Err(ValidationError::MissingHeader(name));
    }
    Ok(value)
}

// Non-negative decimal that must also fit the engine's int32 fields.
fn counter(headers: &HeaderMap, name: &'static str) -> Result<i32, ValidationError> {
    let invalid = |reason: String| ValidationError::InvalidHeader {
        header: name,
        reason,
    };
    let value: u32 = required(headers, name)?
        .parse()
        .map_err(|e: std::num::ParseIntError| invalid(e.to_string()))?;
    i32::try_from(value).map_err(|_| invalid(format!("{} is out of range", value)))
}

/// Result of one action as reported to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Container answered 2xx without an error code.
    Success(Bytes),
    /// Container reported an error the workflow may catch.
    Catchable { code: String, message: String },
    /// Anything else; terminal for the instance.
    Uncatchable { code: String, message: String },
}

impl Outcome {
    /// Uncatchable failure with an empty code.
    pub fn uncatchable(message: impl Into<String>) -> Self {
        Outcome::Uncatchable {
            code: String::new(),
            message: message.into(),
        }
    }

    /// Short label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Outcome::Success(_) => "success",
            Outcome::Catchable { .. } => "catchable",
            Outcome::Uncatchable { .. } => "uncatchable",
        }
    }
}
