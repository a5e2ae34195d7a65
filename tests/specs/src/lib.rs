// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared helpers for the end-to-end scenario specs.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use orbitmesh::config::Config;
use orbitmesh::executor::AgentExecutor;
use orbitmesh::session::SessionState;
use orbitmesh::store::BlobStore;

/// A temp base directory plus the handles the specs need.
pub struct SpecEnv {
    pub dir: tempfile::TempDir,
}

impl SpecEnv {
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self { dir: tempfile::tempdir()? })
    }

    pub fn base(&self) -> &Path {
        self.dir.path()
    }

    pub fn config(&self) -> Config {
        Config::for_base_dir(self.base())
    }

    pub fn store(&self) -> anyhow::Result<BlobStore> {
        Ok(BlobStore::open(self.base())?)
    }
}

/// Poll until the session reaches `state` or the timeout expires.
pub async fn wait_for_state(
    executor: &Arc<AgentExecutor>,
    id: &str,
    state: SessionState,
    timeout: Duration,
) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let current = executor.get_session(id).await?.state;
        if current == state {
            return Ok(());
        }
        if tokio::time::Instant::now() > deadline {
            anyhow::bail!("session {id} stuck in {current}, wanted {state}");
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
