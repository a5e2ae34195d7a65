// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Wire-format types shared by the hub and its subscribers.
//!
//! Outbound traffic is the versioned [`Envelope`]; inbound traffic from
//! dashboard clients is [`InboundMessage`]. Transports on either side agree
//! on this format, so dashboard clients work unchanged regardless of which
//! transport delivered the envelope.

use serde::{Deserialize, Serialize};

/// Envelope schema version.
pub const ENVELOPE_VERSION: u32 = 1;

/// Outbound envelope type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvelopeType {
    #[serde(rename = "terminal.snapshot")]
    TerminalSnapshot,
    #[serde(rename = "terminal.diff")]
    TerminalDiff,
    #[serde(rename = "terminal.cursor")]
    TerminalCursor,
    #[serde(rename = "terminal.bell")]
    TerminalBell,
    #[serde(rename = "terminal.mode")]
    TerminalMode,
    #[serde(rename = "terminal.error")]
    TerminalError,
    #[serde(rename = "sessions.state")]
    SessionsState,
    #[serde(rename = "sessions.activity")]
    SessionsActivity,
    #[serde(rename = "extractor.warning")]
    ExtractorWarning,
    #[serde(rename = "heartbeat")]
    Heartbeat,
}

impl EnvelopeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TerminalSnapshot => "terminal.snapshot",
            Self::TerminalDiff => "terminal.diff",
            Self::TerminalCursor => "terminal.cursor",
            Self::TerminalBell => "terminal.bell",
            Self::TerminalMode => "terminal.mode",
            Self::TerminalError => "terminal.error",
            Self::SessionsState => "sessions.state",
            Self::SessionsActivity => "sessions.activity",
            Self::ExtractorWarning => "extractor.warning",
            Self::Heartbeat => "heartbeat",
        }
    }
}

/// A named fan-out channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Global session state changes.
    SessionsState,
    /// Per-session activity feed.
    SessionsActivity(String),
    /// Global terminal lifecycle.
    TerminalsState,
    /// Per-terminal output stream.
    TerminalsOutput(String),
}

impl Topic {
    pub fn name(&self) -> String {
        match self {
            Self::SessionsState => "sessions.state".to_owned(),
            Self::SessionsActivity(id) => format!("sessions.activity:{id}"),
            Self::TerminalsState => "terminals.state".to_owned(),
            Self::TerminalsOutput(id) => format!("terminals.output:{id}"),
        }
    }

    /// Parse a topic name back into its variant. Unknown names yield `None`.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "sessions.state" => Some(Self::SessionsState),
            "terminals.state" => Some(Self::TerminalsState),
            _ => {
                if let Some(id) = name.strip_prefix("sessions.activity:") {
                    crate::id::is_valid(id).then(|| Self::SessionsActivity(id.to_owned()))
                } else if let Some(id) = name.strip_prefix("terminals.output:") {
                    crate::id::is_valid(id).then(|| Self::TerminalsOutput(id.to_owned()))
                } else {
                    None
                }
            }
        }
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name())
    }
}

/// The unit of fan-out emitted by the hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "v")]
    pub version: u32,
    #[serde(rename = "type")]
    pub kind: EnvelopeType,
    pub topic: String,
    pub seq: u64,
    pub ts: u64,
    pub payload: serde_json::Value,
}

/// Inbound messages from dashboard clients.
///
/// `input.raw` is parsed but rejected by the terminal runtime unless raw
/// input was explicitly enabled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum InboundMessage {
    #[serde(rename = "input.key")]
    Key {
        key: String,
        #[serde(default)]
        modifiers: Vec<String>,
    },
    #[serde(rename = "input.text")]
    Text { text: String },
    #[serde(rename = "input.mouse")]
    Mouse { row: u16, col: u16, button: u8 },
    #[serde(rename = "input.resize")]
    Resize { cols: u16, rows: u16 },
    #[serde(rename = "input.control")]
    Control { action: String },
    #[serde(rename = "input.raw")]
    Raw { data: String },
}

#[cfg(test)]
#[path = "wire_tests.rs"]
mod tests;
