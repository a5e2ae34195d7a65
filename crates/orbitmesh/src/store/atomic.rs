// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Atomic file primitives: temp-file + rename + fsync writes, guarded reads.
//!
//! Every persisted blob goes through [`write_atomic`] so a crash mid-write
//! can never leave a torn file in place of a good one. Reads go through
//! [`read_checked`], which refuses symlinks and oversized files before
//! opening.

use std::fs::{self, DirBuilder, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Largest blob the store will read back (10 MiB).
pub const MAX_BLOB_SIZE: u64 = 10 * 1024 * 1024;

/// Errors produced by the storage layer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    InvalidId(#[from] crate::id::InvalidId),
    #[error("refusing to read symlink at {path}")]
    SymlinkNotAllowed { path: PathBuf },
    #[error("file {path} is {size} bytes, above the {MAX_BLOB_SIZE} byte limit")]
    FileTooLarge { path: PathBuf, size: u64 },
    #[error("no blob at {path}")]
    NotFound { path: PathBuf },
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    /// Whether this error means the blob simply does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Create `dir` (and any missing parents) with mode `0700`.
pub fn ensure_dir(dir: &Path) -> Result<(), StoreError> {
    if dir.is_dir() {
        return Ok(());
    }
    DirBuilder::new().recursive(true).mode(0o700).create(dir)?;
    Ok(())
}

/// Write `bytes` to `path` atomically.
///
/// Protocol: create a unique `.tmp` file in the destination directory with
/// mode `0600`, write, fsync, rename over the target, fsync the directory.
/// The temp file is removed on any failure.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let dir = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent"))?;
    ensure_dir(dir)?;

    let tmp = dir.join(format!(".{}.tmp", uuid::Uuid::new_v4().simple()));
    let result = write_and_rename(&tmp, path, dir, bytes);
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

fn write_and_rename(tmp: &Path, path: &Path, dir: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);

    fs::rename(tmp, path)?;

    // Durability of the rename itself requires fsyncing the directory.
    File::open(dir)?.sync_all()?;
    Ok(())
}

/// Read `path` after guarding against symlinks and oversized files.
///
/// `lstat` runs before any open so a symlink is never followed.
pub fn read_checked(path: &Path) -> Result<Vec<u8>, StoreError> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(StoreError::NotFound { path: path.to_owned() });
        }
        Err(e) => return Err(e.into()),
    };

    if meta.file_type().is_symlink() {
        return Err(StoreError::SymlinkNotAllowed { path: path.to_owned() });
    }
    if meta.len() > MAX_BLOB_SIZE {
        return Err(StoreError::FileTooLarge { path: path.to_owned(), size: meta.len() });
    }

    Ok(fs::read(path)?)
}

/// Remove `path`, mapping a missing file to [`StoreError::NotFound`].
pub fn remove_checked(path: &Path) -> Result<(), StoreError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            Err(StoreError::NotFound { path: path.to_owned() })
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
#[path = "atomic_tests.rs"]
mod tests;
