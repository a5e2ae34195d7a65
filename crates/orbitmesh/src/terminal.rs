// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Terminal runtime: owns the virtual screen for a PTY session, tees raw
//! bytes into the byte ledger, and fans semantic terminal events out to
//! watchers.
//!
//! Downstream code never sees ANSI. Output becomes snapshots, row diffs,
//! cursor moves, bells, and mode changes; inbound dashboard input is
//! encoded here into PTY-side writes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::debug;

use crate::ledger::{ByteLedger, Frame, LedgerError, DIRECTION_OUT};
use crate::provider::TerminalInput;
use crate::screen::{CursorPosition, Screen, ScreenSnapshot};
use crate::session::now_ms;
use crate::wire::InboundMessage;

/// Default buffer depth for diff subscribers.
pub const DEFAULT_DIFF_BUFFER: usize = 64;

/// Terminal variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminalKind {
    #[serde(rename = "pty")]
    Pty,
    #[serde(rename = "ad-hoc")]
    AdHoc,
}

/// Screen contents persisted with a [`TerminalRecord`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredScreen {
    pub rows: u16,
    pub cols: u16,
    pub lines: Vec<String>,
}

/// Persisted terminal blob (`terminals/<id>.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalRecord {
    pub id: String,
    pub session_id: String,
    pub kind: TerminalKind,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
    pub last_seq: u64,
    pub last_snapshot: StoredScreen,
}

/// Semantic terminal event delivered to watchers.
#[derive(Debug, Clone, PartialEq)]
pub enum TerminalEvent {
    Snapshot { snapshot: ScreenSnapshot, seq: u64 },
    Diff { first_row: u16, lines: Vec<String>, cursor: CursorPosition, seq: u64 },
    Cursor { cursor: CursorPosition, seq: u64 },
    Bell { seq: u64 },
    Mode { alt_screen: bool, seq: u64 },
}

impl TerminalEvent {
    pub fn seq(&self) -> u64 {
        match self {
            Self::Snapshot { seq, .. }
            | Self::Diff { seq, .. }
            | Self::Cursor { seq, .. }
            | Self::Bell { seq }
            | Self::Mode { seq, .. } => *seq,
        }
    }
}

/// Errors from terminal input handling.
#[derive(Debug, Error)]
pub enum TerminalError {
    #[error("raw input is disabled")]
    RawInputDisabled,
    #[error("unknown key: {key:?}")]
    UnknownKey { key: String },
    #[error("unknown control action: {action:?}")]
    UnknownControl { action: String },
    #[error("terminal has no input sink")]
    NoInputSink,
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Runtime for one terminal.
pub struct TerminalRuntime {
    id: String,
    session_id: String,
    kind: TerminalKind,
    created_at_ms: u64,
    screen: RwLock<Screen>,
    bytelog: Option<Mutex<ByteLedger>>,
    input_tx: Option<mpsc::Sender<TerminalInput>>,
    raw_input_enabled: bool,
    last_seq: AtomicU64,
    subscribers: RwLock<HashMap<u64, mpsc::Sender<TerminalEvent>>>,
    next_subscriber: AtomicU64,
    /// Client id of the most recent writer. Mechanism only — single-writer
    /// policy lives in the transport layer.
    last_writer: StdMutex<Option<String>>,
}

impl TerminalRuntime {
    pub fn new(
        id: impl Into<String>,
        session_id: impl Into<String>,
        kind: TerminalKind,
        cols: u16,
        rows: u16,
        bytelog: Option<ByteLedger>,
        input_tx: Option<mpsc::Sender<TerminalInput>>,
        raw_input_enabled: bool,
    ) -> Self {
        Self {
            id: id.into(),
            session_id: session_id.into(),
            kind,
            created_at_ms: now_ms(),
            screen: RwLock::new(Screen::new(cols, rows)),
            bytelog: bytelog.map(Mutex::new),
            input_tx,
            raw_input_enabled,
            last_seq: AtomicU64::new(0),
            subscribers: RwLock::new(HashMap::new()),
            next_subscriber: AtomicU64::new(1),
            last_writer: StdMutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn last_seq(&self) -> u64 {
        self.last_seq.load(Ordering::Acquire)
    }

    fn next_seq(&self) -> u64 {
        self.last_seq.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Feed provider output: append to the byte ledger, update the screen,
    /// and emit diff events to watchers.
    pub async fn apply_output(&self, data: &[u8]) -> Result<(), TerminalError> {
        if let Some(ref bytelog) = self.bytelog {
            let nanos = unix_nanos();
            bytelog.lock().await.append(DIRECTION_OUT, nanos, data)?;
        }
        self.feed_screen(data).await;
        Ok(())
    }

    /// Replay ledger frames through the screen without re-appending them.
    pub async fn apply_replay(&self, frames: &[Frame]) {
        for frame in frames {
            if frame.direction == DIRECTION_OUT {
                self.feed_screen(&frame.payload).await;
            }
        }
    }

    async fn feed_screen(&self, data: &[u8]) {
        let (outcome, diff_lines, cursor, alt_screen) = {
            let mut screen = self.screen.write().await;
            let outcome = screen.feed(data);
            let diff_lines = outcome.damage.map(|(first, last)| screen.rows_text(first, last));
            (outcome, diff_lines, screen.cursor(), screen.is_alt_screen())
        };

        if let (Some((first_row, _)), Some(lines)) = (outcome.damage, diff_lines) {
            self.emit(TerminalEvent::Diff { first_row, lines, cursor, seq: self.next_seq() })
                .await;
        } else if outcome.cursor_moved {
            self.emit(TerminalEvent::Cursor { cursor, seq: self.next_seq() }).await;
        }
        if outcome.bell {
            self.emit(TerminalEvent::Bell { seq: self.next_seq() }).await;
        }
        if outcome.mode_changed {
            self.emit(TerminalEvent::Mode { alt_screen, seq: self.next_seq() }).await;
        }
    }

    /// Current screen snapshot.
    pub async fn snapshot(&self) -> ScreenSnapshot {
        self.screen.read().await.snapshot()
    }

    /// Emit a full snapshot event to watchers (periodic tick or on demand)
    /// and return it.
    pub async fn emit_snapshot(&self) -> ScreenSnapshot {
        let snapshot = self.snapshot().await;
        self.emit(TerminalEvent::Snapshot { snapshot: snapshot.clone(), seq: self.next_seq() })
            .await;
        snapshot
    }

    /// Register a watcher with a bounded buffer. Slow watchers are dropped.
    pub async fn subscribe(&self, buffer: usize) -> (u64, mpsc::Receiver<TerminalEvent>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        self.subscribers.write().await.insert(id, tx);
        (id, rx)
    }

    /// Idempotent.
    pub async fn unsubscribe(&self, id: u64) -> bool {
        self.subscribers.write().await.remove(&id).is_some()
    }

    async fn emit(&self, event: TerminalEvent) {
        let targets: Vec<(u64, mpsc::Sender<TerminalEvent>)> = {
            let subscribers = self.subscribers.read().await;
            subscribers.iter().map(|(id, tx)| (*id, tx.clone())).collect()
        };
        let mut dropped = Vec::new();
        for (id, tx) in targets {
            if tx.try_send(event.clone()).is_err() {
                dropped.push(id);
            }
        }
        if !dropped.is_empty() {
            let mut subscribers = self.subscribers.write().await;
            for id in dropped {
                if subscribers.remove(&id).is_some() {
                    debug!(terminal = %self.id, watcher = id, "dropped slow terminal watcher");
                }
            }
        }
    }

    /// Translate inbound dashboard input into PTY writes.
    ///
    /// `client` is recorded as the last writer; the single-writer policy
    /// itself belongs to the transport collaborator.
    pub async fn apply_input(
        &self,
        client: &str,
        message: &InboundMessage,
    ) -> Result<(), TerminalError> {
        let input_tx = self.input_tx.as_ref().ok_or(TerminalError::NoInputSink)?;

        let input = match message {
            InboundMessage::Resize { cols, rows } => {
                self.screen.write().await.resize(*cols, *rows);
                TerminalInput::Resize { cols: *cols, rows: *rows }
            }
            other => TerminalInput::Write(encode_input(other, self.raw_input_enabled)?),
        };

        #[allow(clippy::unwrap_used)] // no poisoning: holders never panic
        {
            *self.last_writer.lock().unwrap() = Some(client.to_owned());
        }
        if input_tx.send(input).await.is_err() {
            return Err(TerminalError::NoInputSink);
        }
        Ok(())
    }

    /// Client id of the most recent writer, if any.
    pub fn last_writer(&self) -> Option<String> {
        #[allow(clippy::unwrap_used)] // no poisoning: holders never panic
        let writer = self.last_writer.lock().unwrap().clone();
        writer
    }

    /// Build the persistable record from the current state.
    pub async fn to_record(&self) -> TerminalRecord {
        let snapshot = self.snapshot().await;
        TerminalRecord {
            id: self.id.clone(),
            session_id: self.session_id.clone(),
            kind: self.kind,
            created_at_ms: self.created_at_ms,
            updated_at_ms: now_ms(),
            last_seq: self.last_seq(),
            last_snapshot: StoredScreen {
                rows: snapshot.rows,
                cols: snapshot.cols,
                lines: snapshot.lines,
            },
        }
    }
}

/// Encode a non-resize inbound message into PTY bytes.
fn encode_input(message: &InboundMessage, raw_enabled: bool) -> Result<Bytes, TerminalError> {
    match message {
        InboundMessage::Text { text } => Ok(Bytes::from(text.clone().into_bytes())),
        InboundMessage::Key { key, modifiers } => encode_key(key, modifiers),
        InboundMessage::Mouse { row, col, button } => {
            // SGR mouse press+release at the given cell.
            let encoded = format!(
                "\x1b[<{button};{col};{row}M\x1b[<{button};{col};{row}m",
                button = button,
                col = col + 1,
                row = row + 1,
            );
            Ok(Bytes::from(encoded.into_bytes()))
        }
        InboundMessage::Control { action } => match action.as_str() {
            "interrupt" => Ok(Bytes::from_static(b"\x03")),
            "eof" => Ok(Bytes::from_static(b"\x04")),
            "suspend" => Ok(Bytes::from_static(b"\x1a")),
            other => Err(TerminalError::UnknownControl { action: other.to_owned() }),
        },
        InboundMessage::Raw { data } => {
            if !raw_enabled {
                return Err(TerminalError::RawInputDisabled);
            }
            Ok(Bytes::from(data.clone().into_bytes()))
        }
        // Resize never reaches here; apply_input handles it first.
        InboundMessage::Resize { .. } => Err(TerminalError::NoInputSink),
    }
}

/// Encode a named key (with modifiers) into its byte sequence.
fn encode_key(key: &str, modifiers: &[String]) -> Result<Bytes, TerminalError> {
    let ctrl = modifiers.iter().any(|m| m == "ctrl");

    if ctrl {
        let mut chars = key.chars();
        if let (Some(c), None) = (chars.next(), chars.next()) {
            if c.is_ascii_alphabetic() {
                let byte = (c.to_ascii_lowercase() as u8) & 0x1f;
                return Ok(Bytes::copy_from_slice(&[byte]));
            }
        }
    }

    let bytes: &[u8] = match key {
        "enter" => b"\r",
        "escape" => b"\x1b",
        "tab" => b"\t",
        "backspace" => b"\x7f",
        "up" => b"\x1b[A",
        "down" => b"\x1b[B",
        "right" => b"\x1b[C",
        "left" => b"\x1b[D",
        "home" => b"\x1b[H",
        "end" => b"\x1b[F",
        "pageup" => b"\x1b[5~",
        "pagedown" => b"\x1b[6~",
        "delete" => b"\x1b[3~",
        "space" => b" ",
        other => {
            // Single printable characters pass through.
            let mut chars = other.chars();
            if let (Some(c), None) = (chars.next(), chars.next()) {
                let mut buf = [0u8; 4];
                let s = c.encode_utf8(&mut buf);
                return Ok(Bytes::copy_from_slice(s.as_bytes()));
            }
            return Err(TerminalError::UnknownKey { key: other.to_owned() });
        }
    };
    Ok(Bytes::from_static(bytes))
}

fn unix_nanos() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
#[path = "terminal_tests.rs"]
mod tests;
