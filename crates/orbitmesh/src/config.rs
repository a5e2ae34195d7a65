// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

/// Local control plane for supervising agent sessions.
#[derive(Debug, Parser)]
#[command(name = "orbitmesh", version, about)]
pub struct Config {
    /// Base directory for persisted state.
    #[arg(long, env = "ORBITMESH_BASE_DIR")]
    pub base_dir: Option<PathBuf>,

    /// HTTP port for the transport collaborator.
    #[arg(long, env = "ORBITMESH_PORT")]
    pub port: Option<u16>,

    /// Git directory for the commit-viewer collaborator.
    #[arg(long, env = "ORBITMESH_GIT_DIR")]
    pub git_dir: Option<PathBuf>,

    /// Default terminal columns for new sessions.
    #[arg(long, env = "ORBITMESH_COLS", default_value = "200")]
    pub cols: u16,

    /// Default terminal rows for new sessions.
    #[arg(long, env = "ORBITMESH_ROWS", default_value = "50")]
    pub rows: u16,

    /// Seconds between executor health-check sweeps.
    #[arg(long, env = "ORBITMESH_HEALTH_INTERVAL", default_value = "30")]
    pub health_interval: u64,

    /// Seconds without a heartbeat before a session is marked unhealthy.
    #[arg(long, env = "ORBITMESH_HEARTBEAT_THRESHOLD", default_value = "120")]
    pub heartbeat_threshold: u64,

    /// Seconds allowed for graceful shutdown before adapters are killed.
    #[arg(long, env = "ORBITMESH_SHUTDOWN_TIMEOUT", default_value = "5")]
    pub shutdown_timeout: u64,

    /// Allow `input.raw` messages from clients.
    #[arg(long, env = "ORBITMESH_RAW_INPUT", default_value = "false")]
    pub raw_input: bool,

    /// Log format (json or text).
    #[arg(long, env = "ORBITMESH_LOG_FORMAT", default_value = "json")]
    pub log_format: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "ORBITMESH_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    /// Resolve the base directory, defaulting to `~/.orbitmesh`.
    pub fn resolved_base_dir(&self) -> PathBuf {
        match self.base_dir {
            Some(ref dir) => dir.clone(),
            None => {
                let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_owned());
                PathBuf::from(home).join(".orbitmesh")
            }
        }
    }

    /// Validate the configuration after parsing.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.cols == 0 || self.rows == 0 {
            anyhow::bail!("terminal dimensions must be non-zero");
        }
        match self.log_format.as_str() {
            "json" | "text" => {}
            other => anyhow::bail!("invalid log format: {other}"),
        }
        match self.log_level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => anyhow::bail!("invalid log level: {other}"),
        }
        Ok(())
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval)
    }

    pub fn heartbeat_threshold(&self) -> Duration {
        Duration::from_secs(self.heartbeat_threshold)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout)
    }

    /// Defaults for tests and embedding without CLI parsing.
    pub fn for_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: Some(base_dir.into()),
            port: None,
            git_dir: None,
            cols: 200,
            rows: 50,
            health_interval: 30,
            heartbeat_threshold: 120,
            shutdown_timeout: 5,
            raw_input: false,
            log_format: "json".to_owned(),
            log_level: "info".to_owned(),
        }
    }
}

/// Recognized per-session configuration options.
///
/// All fields are optional and unknown keys are ignored, so configs written
/// by newer dashboards still load.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acp_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acp_args: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_vertex_ai: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vertex_project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vertex_location: Option<String>,
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
