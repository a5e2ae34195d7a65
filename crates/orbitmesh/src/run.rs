// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Top-level runner — shared by `main` and integration tests.

use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::executor::AgentExecutor;

/// Outcome of a full process run.
pub struct RunResult {
    /// False when shutdown had to force-kill adapters.
    pub clean: bool,
    pub executor: Arc<AgentExecutor>,
}

/// Initialize the tracing subscriber from the config. Safe to call once.
pub fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));
    if config.log_format == "json" {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Bring up the executor, recover prior sessions, and run until a
/// termination signal arrives.
pub async fn run(config: Config) -> anyhow::Result<RunResult> {
    let shutdown_timeout = config.shutdown_timeout();
    let executor = AgentExecutor::new(config)?;

    let report = executor.startup().await?;
    for warning in &report.warnings {
        tracing::warn!("recovery: {warning}");
    }
    info!(
        base_dir = %executor.store().base().display(),
        resumed = report.resumed.len(),
        unresumable = report.unresumable.len(),
        "orbitmesh core ready"
    );

    // SIGINT and SIGTERM both trigger a deadline-bounded shutdown.
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => info!("SIGINT received"),
        _ = sigterm.recv() => info!("SIGTERM received"),
    }

    let report = executor.shutdown(shutdown_timeout).await?;
    if report.forced.is_empty() {
        info!(stopped = report.stopped, "clean shutdown");
        Ok(RunResult { clean: true, executor })
    } else {
        error!(forced = report.forced.len(), "shutdown forced adapter kills");
        Ok(RunResult { clean: false, executor })
    }
}
