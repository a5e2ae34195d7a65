// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Append-only ledgers: the framed byte log for raw PTY output and the
//! JSONL activity log the message feed is folded from.
//!
//! Both files only ever grow. Recovery writes are additional records with
//! higher sequence numbers, never edits of earlier ones.

pub mod activity;
pub mod bytelog;

pub use activity::{
    fold_messages, ActivityLedger, ActivityRecord, CorruptionError, Message, MessageKind,
    Projection,
};
pub use bytelog::{ByteLedger, Frame, ReplayOutcome, DIRECTION_OUT};

use std::io;

use thiserror::Error;

/// Errors from ledger operations.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}
