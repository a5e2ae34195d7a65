// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! JSONL activity ledger (`<id>.messages.jsonl`) and the fold that turns it
//! into the message list.
//!
//! One JSON record per line. `seq` is strictly monotone and dense from 1;
//! appending assigns one more than the maximum already on disk. The fold is
//! deterministic: the same file prefix always rebuilds the same messages,
//! however many times it is read.

use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::LedgerError;

/// How a record projects onto the message list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Projection {
    /// Start a new message.
    Append,
    /// Start a new message, preserving the raw provider payload.
    AppendRaw,
    /// Concatenate onto a trailing output message (or promote to one).
    AppendOutputDelta,
}

/// Kind of a message in the rebuilt feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    User,
    Output,
    System,
    Error,
    Tool,
}

/// One persisted activity-ledger line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub seq: u64,
    pub timestamp_ms: u64,
    pub projection: Projection,
    pub kind: MessageKind,
    pub contents: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<serde_json::Value>,
}

/// A message rebuilt by folding the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub kind: MessageKind,
    pub contents: String,
    pub timestamp_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<serde_json::Value>,
}

/// Corrupt lines were skipped while folding a session's ledger.
///
/// Callers prefer the rebuilt messages when any were recovered and surface
/// this error only when nothing could be.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{corrupt} corrupt activity line(s) skipped for session {session}")]
pub struct CorruptionError {
    pub session: String,
    pub corrupt: usize,
}

/// Append handle for a session's activity ledger.
pub struct ActivityLedger {
    file: File,
    path: PathBuf,
    next_seq: u64,
}

impl ActivityLedger {
    /// Open (or create) the ledger, scanning for the highest existing `seq`
    /// so the next append continues the dense sequence.
    pub fn open(path: &Path) -> Result<Self, LedgerError> {
        let max_seq = match File::open(path) {
            Ok(f) => {
                let mut max = 0u64;
                for line in BufReader::new(f).lines() {
                    let line = line?;
                    if let Ok(record) = serde_json::from_str::<ActivityRecord>(&line) {
                        max = max.max(record.seq);
                    }
                }
                max
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };

        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file, path: path.to_owned(), next_seq: max_seq + 1 })
    }

    /// Append one record, assigning and returning the next `seq`.
    pub fn append(
        &mut self,
        projection: Projection,
        kind: MessageKind,
        contents: impl Into<String>,
        raw: Option<serde_json::Value>,
    ) -> Result<u64, LedgerError> {
        self.append_at(crate::session::now_ms(), projection, kind, contents, raw)
    }

    /// Append one record with an explicit timestamp (replay, tests).
    pub fn append_at(
        &mut self,
        timestamp_ms: u64,
        projection: Projection,
        kind: MessageKind,
        contents: impl Into<String>,
        raw: Option<serde_json::Value>,
    ) -> Result<u64, LedgerError> {
        let seq = self.next_seq;
        let record = ActivityRecord {
            seq,
            timestamp_ms,
            projection,
            kind,
            contents: contents.into(),
            raw,
        };
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');
        self.file.write_all(line.as_bytes())?;
        self.file.sync_data()?;
        self.next_seq += 1;
        Ok(seq)
    }

    /// The `seq` the next append will receive.
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Fold a session's activity ledger into its message list.
///
/// Records apply in `seq` order. Corrupt lines (unparseable JSON, zero
/// `seq`, zero timestamp) are counted and skipped; when any were skipped the
/// rebuilt messages are still returned alongside the typed error. A missing
/// file folds to an empty list.
pub fn fold_messages(
    path: &Path,
    session: &str,
) -> Result<(Vec<Message>, Option<CorruptionError>), LedgerError> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((vec![], None)),
        Err(e) => return Err(e.into()),
    };

    let mut records: Vec<ActivityRecord> = Vec::new();
    let mut corrupt = 0usize;
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<ActivityRecord>(&line) {
            Ok(r) if r.seq > 0 && r.timestamp_ms > 0 => records.push(r),
            _ => corrupt += 1,
        }
    }
    records.sort_by_key(|r| r.seq);

    let mut messages: Vec<Message> = Vec::new();
    for record in records {
        match record.projection {
            Projection::Append | Projection::AppendRaw => {
                messages.push(Message {
                    id: format!("{session}-m{}", record.seq),
                    kind: record.kind,
                    contents: record.contents,
                    timestamp_ms: record.timestamp_ms,
                    raw: record.raw,
                });
            }
            Projection::AppendOutputDelta => {
                match messages.last_mut() {
                    Some(tail) if tail.kind == MessageKind::Output => {
                        tail.contents.push_str(&record.contents);
                        tail.timestamp_ms = record.timestamp_ms;
                    }
                    _ => {
                        // No output tail to extend — promote to a new
                        // output message.
                        messages.push(Message {
                            id: format!("{session}-m{}", record.seq),
                            kind: MessageKind::Output,
                            contents: record.contents,
                            timestamp_ms: record.timestamp_ms,
                            raw: record.raw,
                        });
                    }
                }
            }
        }
    }

    let corruption = (corrupt > 0).then(|| CorruptionError { session: session.to_owned(), corrupt });
    Ok((messages, corruption))
}

#[cfg(test)]
#[path = "activity_tests.rs"]
mod tests;
