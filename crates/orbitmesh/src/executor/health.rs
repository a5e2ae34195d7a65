// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Periodic health sweep over live sessions.
//!
//! A session is unhealthy when its adapter reports `error` or its attempt
//! heartbeat has gone stale. Unhealthy sessions are marked `error` and
//! stopped; paused sessions are exempt from the staleness check since a
//! stopped process cannot heartbeat.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::provider::ProviderState;
use crate::session::{now_ms, SessionState};

use super::AgentExecutor;

pub(crate) async fn run(executor: Arc<AgentExecutor>, shutdown: CancellationToken) {
    let interval = executor.config().health_interval();
    info!(interval_secs = interval.as_secs(), "health checker started");

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.cancelled() => {
                debug!("health checker shutting down");
                return;
            }
        }
        sweep(&executor).await;
    }
}

/// One pass over every live session.
pub(crate) async fn sweep(executor: &Arc<AgentExecutor>) {
    let threshold = executor.config().heartbeat_threshold();

    for (id, live) in executor.live_sessions().await {
        let status = live.provider.lock().await.status();
        let heartbeat_at = live.attempt.lock().await.heartbeat_at_ms;
        let age = Duration::from_millis(now_ms().saturating_sub(heartbeat_at));

        let adapter_errored = status.state == ProviderState::Error;
        let stale = age > threshold;
        if !adapter_errored && !stale {
            continue;
        }

        let session_state = live.entity.lock().await.state;
        if session_state == SessionState::Paused && !adapter_errored {
            // Paused providers are silent on purpose.
            continue;
        }

        let reason = if adapter_errored {
            format!("health: adapter error: {}", status.error.unwrap_or_default())
        } else {
            format!("health: heartbeat stale for {}s", age.as_secs())
        };
        warn!(session = %id, %reason, "health check failed, stopping session");

        // Mark the session errored, then initiate stop.
        {
            let mut session = live.entity.lock().await;
            if session.transition(SessionState::Error, &reason).is_ok() {
                let copy = session.clone();
                drop(session);
                let _ = executor.store().save_session(&copy);
                executor.publish_state(&copy, &reason).await;
            }
        }
        {
            let mut attempt = live.attempt.lock().await;
            if attempt.is_open() {
                let _ = executor.attempts().finish(&mut attempt, "health-check");
            }
        }

        let stop_timeout = executor.config().shutdown_timeout();
        let stopped = {
            let mut provider = live.provider.lock().await;
            tokio::time::timeout(stop_timeout, provider.stop()).await
        };
        if !matches!(stopped, Ok(Ok(()))) {
            let _ = live.provider.lock().await.kill();
        }
    }
}
