// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-action workspace under the shared directory.
//!
//! Layout of `<shared>/<action-id>/`:
//! - `<as or key>` - one file or directory per FileSpec
//! - `out/instance/`, `out/workflow/`, `out/namespace/`, `out/file-system/` -
//!   outputs deposited by the user container (mode 0777)
//!
//! Provisioning only reads from the variable store. Harvest writes one
//! variable per output entry.

use std::fs::{self, File, Permissions};
use std::io::{self, Read};
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::read::DecoderReader;
use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, info};

use crate::action::{FileSpec, FileType, ValidationError, VariableScope};
use crate::archive::{self, ArchiveError};
use crate::variables::{ActionRef, SetOutcome, VariableClient, VariableError};

/// Mode of the output directories, writable by any container user.
const OUTPUT_DIR_MODE: u32 = 0o777;

/// Mime type of harvested files.
pub const MIME_OCTET_STREAM: &str = "application/octet-stream";

/// Mime type of harvested directories.
pub const MIME_GZIP: &str = "application/gzip";

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("fetching {scope} variable '{key}': {source}")]
    Fetch {
        key: String,
        scope: VariableScope,
        #[source]
        source: VariableError,
    },

    #[error("staging '{name}': {source}")]
    Archive {
        name: String,
        #[source]
        source: ArchiveError,
    },

    #[error("staging '{name}': {source}")]
    Stage {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("storing {scope} output '{name}': {source}")]
    Store {
        name: String,
        scope: VariableScope,
        #[source]
        source: VariableError,
    },

    #[error(transparent)]
    Invalid(#[from] ValidationError),

    #[error("action id '{0}' does not name a directory under the shared root")]
    OutsideRoot(String),

    #[error("workspace io: {0}")]
    Io(#[from] io::Error),

    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl WorkspaceError {
    /// The underlying variable call was aborted by the action's cancel token.
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            WorkspaceError::Fetch {
                source: VariableError::Cancelled,
                ..
            } | WorkspaceError::Store {
                source: VariableError::Cancelled,
                ..
            }
        )
    }
}

/// One stored output variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Harvested {
    pub scope: VariableScope,
    pub key: String,
    pub outcome: SetOutcome,
}

/// Workspace of one action.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    /// Workspace `<shared_dir>/<action_id>`. The id must be one normal path segment.
    pub fn new(shared_dir: &Path, action_id: &str) -> Result<Self, WorkspaceError> {
        let mut components = Path::new(action_id).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(name)), None) if name.to_str() == Some(action_id) => Ok(Self {
                root: shared_dir.join(name),
            }),
            _ => Err(WorkspaceError::OutsideRoot(action_id.to_string())),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn out_dir(&self, scope: VariableScope) -> PathBuf {
        self.root.join("out").join(scope.as_str())
    }

    /// Create the workspace, stage every FileSpec and pre-create output dirs.
    ///
    /// A variable that does not exist stages as an empty file or directory.
    /// FileSpecs are fetched one at a time, so a worker holds at most one
    /// variable in memory (bounded by the store client's response limit).
    pub async fn provision(
        &self,
        variables: &VariableClient,
        action: &ActionRef<'_>,
        files: &[FileSpec],
    ) -> Result<(), WorkspaceError> {
        tokio::fs::create_dir_all(&self.root).await?;

        for spec in files {
            let data = match variables.get_variable(action, spec.scope, &spec.key).await {
                Ok(data) => data,
                Err(e) if e.is_not_found() => {
                    debug!(key = %spec.key, scope = %spec.scope, "variable not found, staging empty");
                    Bytes::new()
                }
                Err(source) => {
                    return Err(WorkspaceError::Fetch {
                        key: spec.key.clone(),
                        scope: spec.scope,
                        source,
                    });
                }
            };

            let root = self.root.clone();
            let spec_owned = spec.clone();
            tokio::task::spawn_blocking(move || materialize(&root, &spec_owned, &data)).await??;
        }

        self.create_output_dirs().await
    }

    /// Pre-create `out/<scope>/` for every scope.
    pub async fn create_output_dirs(&self) -> Result<(), WorkspaceError> {
        for scope in VariableScope::ALL {
            let dir = self.out_dir(scope);
            tokio::fs::create_dir_all(&dir).await?;
            tokio::fs::set_permissions(&dir, Permissions::from_mode(OUTPUT_DIR_MODE)).await?;
        }
        Ok(())
    }

    /// Store everything the container left under `out/`.
    ///
    /// Files are stored as-is, directories as one tar.gz blob. Entries are
    /// processed per scope in name order.
    pub async fn harvest(
        &self,
        variables: &VariableClient,
        action: &ActionRef<'_>,
    ) -> Result<Vec<Harvested>, WorkspaceError> {
        let mut harvested = Vec::new();

        for scope in VariableScope::ALL {
            let dir = self.out_dir(scope);
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };

            let mut found = Vec::new();
            while let Some(entry) = entries.next_entry().await? {
                found.push(entry);
            }
            found.sort_by_key(|e| e.file_name());

            for entry in found {
                let name = entry.file_name().to_string_lossy().into_owned();
                let file_type = entry.file_type().await?;
                let path = entry.path();

                let (data, mime) = if file_type.is_file() {
                    (tokio::fs::read(&path).await?, MIME_OCTET_STREAM)
                } else if file_type.is_dir() {
                    (pack_dir(path).await?, MIME_GZIP)
                } else {
                    debug!(name = %name, %scope, "skipping non-regular output entry");
                    continue;
                };

                let key = match scope {
                    VariableScope::FileSystem => format!("/{}", name),
                    _ => name.clone(),
                };
                let outcome = variables
                    .set_or_create(action, scope, &key, mime, &data)
                    .await
                    .map_err(|source| WorkspaceError::Store {
                        name: name.clone(),
                        scope,
                        source,
                    })?;

                info!(key = %key, %scope, bytes = data.len(), ?outcome, "output variable stored");
                harvested.push(Harvested {
                    scope,
                    key,
                    outcome,
                });
            }
        }

        Ok(harvested)
    }

    /// Delete the workspace. Missing directories are fine.
    pub async fn remove(&self) -> io::Result<()> {
        match tokio::fs::remove_dir_all(&self.root).await {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

async fn pack_dir(path: PathBuf) -> Result<Vec<u8>, WorkspaceError> {
    let packed = tokio::task::spawn_blocking(move || -> Result<Vec<u8>, ArchiveError> {
        let (mut file, len) = archive::pack_tar_gz(&path)?;
        let mut data = Vec::with_capacity(usize::try_from(len).unwrap_or_default());
        io::Read::read_to_end(&mut file, &mut data)?;
        Ok(data)
    })
    .await?;
    packed.map_err(|source| WorkspaceError::Archive {
        name: "output directory".to_string(),
        source,
    })
}

/// Drops ASCII whitespace, so line-wrapped base64 decodes.
struct SkipWhitespace<R>(R);

impl<R: Read> Read for SkipWhitespace<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let n = self.0.read(buf)?;
            if n == 0 {
                return Ok(0);
            }
            let mut kept = 0;
            for idx in 0..n {
                let byte = buf[idx];
                if !byte.is_ascii_whitespace() {
                    buf[kept] = byte;
                    kept += 1;
                }
            }
            if kept > 0 {
                return Ok(kept);
            }
        }
    }
}

/// Write one FileSpec's bytes into the workspace.
fn materialize(root: &Path, spec: &FileSpec, data: &[u8]) -> Result<(), WorkspaceError> {
    let name = spec.destination().to_string();
    let dest = root.join(&name);
    let mode = spec.mode()?;
    let stage_err = |source: io::Error| WorkspaceError::Stage {
        name: name.clone(),
        source,
    };
    let archive_err = |source: ArchiveError| WorkspaceError::Archive {
        name: name.clone(),
        source,
    };

    match spec.file_type {
        FileType::Plain => fs::write(&dest, data).map_err(stage_err)?,
        FileType::Base64 => {
            let mut file = File::create(&dest).map_err(stage_err)?;
            let mut decoder = DecoderReader::new(SkipWhitespace(data), &BASE64);
            io::copy(&mut decoder, &mut file).map_err(stage_err)?;
        }
        FileType::Tar => archive::unpack_tar(data, &dest, mode).map_err(archive_err)?,
        FileType::TarGz => archive::unpack_tar_gz(data, &dest, mode).map_err(archive_err)?,
    }

    if let Some(mode) = mode
        && !spec.file_type.is_archive()
    {
        fs::set_permissions(&dest, Permissions::from_mode(mode)).map_err(stage_err)?;
    }

    debug!(name = %name, file_type = ?spec.file_type, bytes = data.len(), "staged");
    Ok(())
}
