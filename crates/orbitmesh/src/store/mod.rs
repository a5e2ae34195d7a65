// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Typed blob store over the on-disk layout:
//!
//! ```text
//! sessions/<id>.json                 session snapshot
//! sessions/<id>.messages.jsonl       activity ledger
//! sessions/<id>.ptylog               byte ledger (PTY sessions)
//! sessions/attempts/<id>/<attempt>.json
//! sessions/resume_tokens/<token>.json
//! terminals/<id>.json
//! snapshots/<id>.json.gz             legacy gzip session snapshots
//! providers.json / agents.json / projects.json
//! ```
//!
//! Identifiers are validated before any path is formed, every write goes
//! through the atomic protocol, and `List` returns partial results so one
//! corrupt file never hides the healthy rows next to it.

pub mod atomic;

pub use atomic::{StoreError, MAX_BLOB_SIZE};

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::attempt::{ResumeToken, RunAttempt};
use crate::id;
use crate::session::Session;
use crate::terminal::TerminalRecord;

/// One skipped entry from a `List` scan.
#[derive(Debug, Clone, Error)]
#[error("{file}: {detail}")]
pub struct ListEntryError {
    pub file: String,
    pub detail: String,
}

/// Partial-result wrapper for `List` operations: good rows plus the errors
/// for entries that could not be loaded.
#[derive(Debug)]
pub struct ListOutcome<T> {
    pub items: Vec<T>,
    pub errors: Vec<ListEntryError>,
}

/// Stored provider configuration (array blob `providers.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Stored agent configuration (array blob `agents.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub id: String,
    pub name: String,
    /// Launch command for terminal-owning sessions.
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Stored project record (array blob `projects.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectRecord {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Typed blob store rooted at the base directory.
#[derive(Debug, Clone)]
pub struct BlobStore {
    base: PathBuf,
    /// Per-blob locks serializing the write+rename step. Temp files are
    /// unique per write, so this only orders competing renames of the same
    /// target.
    blob_locks: std::sync::Arc<std::sync::Mutex<HashMap<PathBuf, std::sync::Arc<std::sync::Mutex<()>>>>>,
}

impl BlobStore {
    /// Open a store, creating the base directory (`0700`) if needed.
    pub fn open(base: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let base = base.into();
        atomic::ensure_dir(&base)?;
        Ok(Self { base, blob_locks: Default::default() })
    }

    fn blob_lock(&self, path: &Path) -> std::sync::Arc<std::sync::Mutex<()>> {
        #[allow(clippy::unwrap_used)] // no poisoning: holders never panic
        let mut locks = self.blob_locks.lock().unwrap();
        locks.entry(path.to_owned()).or_default().clone()
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    fn sessions_dir(&self) -> PathBuf {
        self.base.join("sessions")
    }

    fn terminals_dir(&self) -> PathBuf {
        self.base.join("terminals")
    }

    fn snapshots_dir(&self) -> PathBuf {
        self.base.join("snapshots")
    }

    fn attempts_dir(&self, session: &str) -> PathBuf {
        self.sessions_dir().join("attempts").join(session)
    }

    fn tokens_dir(&self) -> PathBuf {
        self.sessions_dir().join("resume_tokens")
    }

    // -- path resolution (identifier-validated) -------------------------------

    pub fn session_path(&self, session: &str) -> Result<PathBuf, StoreError> {
        id::validate(session)?;
        Ok(self.sessions_dir().join(format!("{session}.json")))
    }

    /// Activity ledger path for a session (`<id>.messages.jsonl`).
    pub fn activity_path(&self, session: &str) -> Result<PathBuf, StoreError> {
        id::validate(session)?;
        let dir = self.sessions_dir();
        atomic::ensure_dir(&dir)?;
        Ok(dir.join(format!("{session}.messages.jsonl")))
    }

    /// Byte ledger path for a session (`<id>.ptylog`).
    pub fn bytelog_path(&self, session: &str) -> Result<PathBuf, StoreError> {
        id::validate(session)?;
        let dir = self.sessions_dir();
        atomic::ensure_dir(&dir)?;
        Ok(dir.join(format!("{session}.ptylog")))
    }

    pub fn terminal_path(&self, terminal: &str) -> Result<PathBuf, StoreError> {
        id::validate(terminal)?;
        Ok(self.terminals_dir().join(format!("{terminal}.json")))
    }

    pub fn attempt_path(&self, session: &str, attempt: &str) -> Result<PathBuf, StoreError> {
        id::validate(session)?;
        id::validate(attempt)?;
        Ok(self.attempts_dir(session).join(format!("{attempt}.json")))
    }

    pub fn token_path(&self, token: &str) -> Result<PathBuf, StoreError> {
        id::validate(token)?;
        Ok(self.tokens_dir().join(format!("{token}.json")))
    }

    pub fn legacy_snapshot_path(&self, session: &str) -> Result<PathBuf, StoreError> {
        id::validate(session)?;
        Ok(self.snapshots_dir().join(format!("{session}.json.gz")))
    }

    // -- generic helpers ------------------------------------------------------

    fn save_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(value)?;
        let lock = self.blob_lock(path);
        #[allow(clippy::unwrap_used)] // no poisoning: holders never panic
        let _guard = lock.lock().unwrap();
        atomic::write_atomic(path, &bytes)
    }

    fn load_json<T: DeserializeOwned>(&self, path: &Path) -> Result<T, StoreError> {
        let bytes = atomic::read_checked(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Scan `dir` for `*.json` blobs whose stem is a valid identifier.
    ///
    /// Per-entry faults (bad identifier, unreadable, malformed JSON) become
    /// [`ListEntryError`]s; good rows are still returned.
    fn list_dir_json<T: DeserializeOwned>(&self, dir: &Path) -> Result<ListOutcome<T>, StoreError> {
        let mut outcome = ListOutcome { items: Vec::new(), errors: Vec::new() };

        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(outcome),
            Err(e) => return Err(e.into()),
        };

        let mut paths: Vec<PathBuf> = Vec::new();
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") && !entry.file_type()?.is_dir() {
                paths.push(path);
            }
        }
        paths.sort();

        for path in paths {
            let file = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let stem = path
                .file_stem()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            if !id::is_valid(&stem) {
                outcome
                    .errors
                    .push(ListEntryError { file, detail: "invalid identifier".to_owned() });
                continue;
            }
            match self.load_json::<T>(&path) {
                Ok(item) => outcome.items.push(item),
                Err(e) => {
                    warn!(file = %file, error = %e, "skipping unreadable blob during list");
                    outcome.errors.push(ListEntryError { file, detail: e.to_string() });
                }
            }
        }
        Ok(outcome)
    }

    // -- session snapshots ----------------------------------------------------

    pub fn save_session(&self, session: &Session) -> Result<(), StoreError> {
        let path = self.session_path(&session.id)?;
        self.save_json(&path, session)
    }

    pub fn load_session(&self, session: &str) -> Result<Session, StoreError> {
        let path = self.session_path(session)?;
        self.load_json(&path)
    }

    pub fn delete_session(&self, session: &str) -> Result<(), StoreError> {
        let path = self.session_path(session)?;
        atomic::remove_checked(&path)
    }

    pub fn list_sessions(&self) -> Result<ListOutcome<Session>, StoreError> {
        self.list_dir_json(&self.sessions_dir())
    }

    // -- run attempts ---------------------------------------------------------

    pub fn save_attempt(&self, attempt: &RunAttempt) -> Result<(), StoreError> {
        let path = self.attempt_path(&attempt.session_id, &attempt.attempt_id)?;
        self.save_json(&path, attempt)
    }

    pub fn load_attempt(&self, session: &str, attempt: &str) -> Result<RunAttempt, StoreError> {
        let path = self.attempt_path(session, attempt)?;
        self.load_json(&path)
    }

    pub fn delete_attempt(&self, session: &str, attempt: &str) -> Result<(), StoreError> {
        let path = self.attempt_path(session, attempt)?;
        atomic::remove_checked(&path)
    }

    pub fn list_attempts(&self, session: &str) -> Result<ListOutcome<RunAttempt>, StoreError> {
        id::validate(session)?;
        self.list_dir_json(&self.attempts_dir(session))
    }

    /// Attempts across every session, for startup recovery.
    pub fn list_all_attempts(&self) -> Result<ListOutcome<RunAttempt>, StoreError> {
        let root = self.sessions_dir().join("attempts");
        let mut outcome = ListOutcome { items: Vec::new(), errors: Vec::new() };

        let entries = match std::fs::read_dir(&root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(outcome),
            Err(e) => return Err(e.into()),
        };

        let mut dirs: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect();
        dirs.sort();

        for dir in dirs {
            let mut per_session = self.list_dir_json::<RunAttempt>(&dir)?;
            outcome.items.append(&mut per_session.items);
            outcome.errors.append(&mut per_session.errors);
        }
        Ok(outcome)
    }

    // -- resume tokens --------------------------------------------------------

    pub fn save_token(&self, token: &ResumeToken) -> Result<(), StoreError> {
        let path = self.token_path(&token.token_id)?;
        self.save_json(&path, token)
    }

    pub fn load_token(&self, token: &str) -> Result<ResumeToken, StoreError> {
        let path = self.token_path(token)?;
        self.load_json(&path)
    }

    pub fn delete_token(&self, token: &str) -> Result<(), StoreError> {
        let path = self.token_path(token)?;
        atomic::remove_checked(&path)
    }

    // -- terminals ------------------------------------------------------------

    pub fn save_terminal(&self, terminal: &TerminalRecord) -> Result<(), StoreError> {
        let path = self.terminal_path(&terminal.id)?;
        self.save_json(&path, terminal)
    }

    pub fn load_terminal(&self, terminal: &str) -> Result<TerminalRecord, StoreError> {
        let path = self.terminal_path(terminal)?;
        self.load_json(&path)
    }

    pub fn delete_terminal(&self, terminal: &str) -> Result<(), StoreError> {
        let path = self.terminal_path(terminal)?;
        atomic::remove_checked(&path)
    }

    pub fn list_terminals(&self) -> Result<ListOutcome<TerminalRecord>, StoreError> {
        self.list_dir_json(&self.terminals_dir())
    }

    // -- config arrays --------------------------------------------------------

    pub fn load_provider_configs(&self) -> Result<Vec<ProviderConfig>, StoreError> {
        self.load_array(&self.base.join("providers.json"))
    }

    pub fn save_provider_configs(&self, configs: &[ProviderConfig]) -> Result<(), StoreError> {
        self.save_json(&self.base.join("providers.json"), &configs)
    }

    pub fn load_agent_configs(&self) -> Result<Vec<AgentConfig>, StoreError> {
        self.load_array(&self.base.join("agents.json"))
    }

    pub fn save_agent_configs(&self, configs: &[AgentConfig]) -> Result<(), StoreError> {
        self.save_json(&self.base.join("agents.json"), &configs)
    }

    pub fn load_projects(&self) -> Result<Vec<ProjectRecord>, StoreError> {
        self.load_array(&self.base.join("projects.json"))
    }

    pub fn save_projects(&self, projects: &[ProjectRecord]) -> Result<(), StoreError> {
        self.save_json(&self.base.join("projects.json"), &projects)
    }

    /// A missing array blob loads as empty.
    fn load_array<T: DeserializeOwned>(&self, path: &Path) -> Result<Vec<T>, StoreError> {
        match self.load_json(path) {
            Ok(items) => Ok(items),
            Err(e) if e.is_not_found() => Ok(vec![]),
            Err(e) => Err(e),
        }
    }

    // -- legacy gzip snapshots ------------------------------------------------

    /// Read a legacy `snapshots/<id>.json.gz` blob.
    pub fn load_legacy_snapshot(&self, session: &str) -> Result<serde_json::Value, StoreError> {
        let path = self.legacy_snapshot_path(session)?;
        let compressed = atomic::read_checked(&path)?;
        let mut decoder = flate2::read::GzDecoder::new(compressed.as_slice());
        let mut bytes = Vec::new();
        decoder.read_to_end(&mut bytes)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Write a legacy-format snapshot (migration tooling and tests).
    pub fn save_legacy_snapshot(
        &self,
        session: &str,
        value: &serde_json::Value,
    ) -> Result<(), StoreError> {
        use std::io::Write;
        let path = self.legacy_snapshot_path(session)?;
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(&serde_json::to_vec(value)?)?;
        let compressed = encoder.finish()?;
        atomic::write_atomic(&path, &compressed)
    }
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
