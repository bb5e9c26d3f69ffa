// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tar and tar.gz expansion and packing.
//!
//! Expansion validates every member before anything is written: a member
//! whose name contains `..` or whose type is not a regular file or directory
//! fails the whole archive, leaving the destination untouched.

use std::fs::{self, File, Permissions};
use std::io::{self, Read, Seek, SeekFrom};
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use tar::{Archive, EntryType};
use thiserror::Error;
use walkdir::WalkDir;

/// Mode applied to expanded members unless overridden.
pub const DEFAULT_MEMBER_MODE: u32 = 0o750;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("tar member '{0}' escapes the destination")]
    ZipSlip(String),

    #[error("tar member '{name}' has unsupported type {kind}")]
    Unsupported { name: String, kind: String },

    #[error("archive io: {0}")]
    Io(#[from] io::Error),

    #[error("walk: {0}")]
    Walk(#[from] walkdir::Error),
}

enum Member {
    Dir(PathBuf),
    File(PathBuf),
    Skip,
}

fn classify(entry: &tar::Entry<'_, impl Read>) -> Result<Member, ArchiveError> {
    let name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
    if name.contains("..") {
        return Err(ArchiveError::ZipSlip(name));
    }

    let kind = entry.header().entry_type();
    if matches!(kind, EntryType::XGlobalHeader) {
        return Ok(Member::Skip);
    }

    // Leading `/` and `./` are dropped so every member lands inside the destination.
    let relative: PathBuf = Path::new(&name)
        .components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .collect();
    if relative.as_os_str().is_empty() {
        return Ok(Member::Skip);
    }

    match kind {
        EntryType::Directory => Ok(Member::Dir(relative)),
        EntryType::Regular | EntryType::Continuous => Ok(Member::File(relative)),
        other => Err(ArchiveError::Unsupported {
            name,
            kind: format!("{:?}", other),
        }),
    }
}

fn validate<R: Read>(reader: R) -> Result<(), ArchiveError> {
    let mut archive = Archive::new(reader);
    for entry in archive.entries()? {
        classify(&entry?)?;
    }
    Ok(())
}

fn extract<R: Read>(reader: R, dest: &Path, mode: u32) -> Result<(), ArchiveError> {
    let perms = || Permissions::from_mode(mode);
    fs::create_dir_all(dest)?;

    // Directory modes are applied last so a restrictive mode cannot block
    // writing their members.
    let mut dirs = vec![dest.to_path_buf()];
    let mut archive = Archive::new(reader);
    for entry in archive.entries()? {
        let mut entry = entry?;
        match classify(&entry)? {
            Member::Dir(rel) => {
                let path = dest.join(rel);
                fs::create_dir_all(&path)?;
                dirs.push(path);
            }
            Member::File(rel) => {
                let path = dest.join(rel);
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                let mut file = File::create(&path)?;
                io::copy(&mut entry, &mut file)?;
                file.set_permissions(perms())?;
            }
            Member::Skip => {}
        }
    }

    for dir in dirs.iter().rev() {
        fs::set_permissions(dir, perms())?;
    }
    Ok(())
}

/// Expand an uncompressed tar into `dest`.
pub fn unpack_tar(data: &[u8], dest: &Path, mode: Option<u32>) -> Result<(), ArchiveError> {
    validate(data)?;
    extract(data, dest, mode.unwrap_or(DEFAULT_MEMBER_MODE))
}

/// Expand a gzip-compressed tar into `dest`. An empty stream yields an empty directory.
pub fn unpack_tar_gz(data: &[u8], dest: &Path, mode: Option<u32>) -> Result<(), ArchiveError> {
    let mode = mode.unwrap_or(DEFAULT_MEMBER_MODE);
    if data.is_empty() {
        fs::create_dir_all(dest)?;
        fs::set_permissions(dest, Permissions::from_mode(mode))?;
        return Ok(());
    }
    validate(GzDecoder::new(data))?;
    extract(GzDecoder::new(data), dest, mode)
}

/// Pack `dir` as tar.gz into an anonymous temp file.
///
/// Member paths are relative to `dir`; entries other than regular files and
/// directories are skipped. Returns the file rewound to the start, and its
/// length.
pub fn pack_tar_gz(dir: &Path) -> Result<(File, u64), ArchiveError> {
    let file = tempfile::tempfile()?;
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));

    for entry in WalkDir::new(dir)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
    {
        let entry = entry?;
        let Ok(relative) = entry.path().strip_prefix(dir) else {
            continue;
        };
        let file_type = entry.file_type();
        if file_type.is_dir() {
            builder.append_dir(relative, entry.path())?;
        } else if file_type.is_file() {
            builder.append_path_with_name(entry.path(), relative)?;
        }
    }

    let mut file = builder.into_inner()?.finish()?;
    let len = file.seek(SeekFrom::End(0))?;
    file.rewind()?;
    Ok((file, len))
}
