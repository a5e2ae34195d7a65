// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-session monitor task.
//!
//! Consumes the adapter's event stream, drives the terminal runtime and
//! extractor, persists diff-level changes (ledger records, session
//! snapshots), and publishes envelopes. Serializes all mutation for its
//! session; nothing else writes a live session's state.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::extract::{ActivityAction, ActivityMutation, Extractor};
use crate::ledger::{ActivityLedger, MessageKind, Projection};
use crate::provider::ProviderEvent;
use crate::session::SessionState;
use crate::terminal::{TerminalEvent, DEFAULT_DIFF_BUFFER};
use crate::wire::{EnvelopeType, Topic};

use super::{AgentExecutor, LiveSession};

/// Full terminal snapshots are emitted on this cadence.
const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(10);

/// Drain window for remaining adapter events after cancellation.
const DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Spawn the monitor plus a watcher that turns a monitor panic into a clean
/// `error` transition instead of a silently dead session.
pub(crate) fn spawn(
    executor: Arc<AgentExecutor>,
    session_id: String,
    live: Arc<LiveSession>,
    events: mpsc::Receiver<ProviderEvent>,
    extractor: Extractor,
    activity: ActivityLedger,
) -> JoinHandle<()> {
    let watcher_executor = Arc::clone(&executor);
    let watcher_live = Arc::clone(&live);
    let watcher_id = session_id.clone();

    let inner = tokio::spawn(run(executor, session_id, live, events, extractor, activity));

    tokio::spawn(async move {
        let result = inner.await;
        if let Err(e) = result {
            if e.is_panic() {
                warn!(session = %watcher_id, "monitor task panicked, failing session");
                recover_from_panic(&watcher_executor, &watcher_id, &watcher_live).await;
            }
        }
    })
}

/// Panic recovery: log, transition to `error`, publish a terminal
/// envelope, close the adapter.
async fn recover_from_panic(
    executor: &AgentExecutor,
    session_id: &str,
    live: &LiveSession,
) {
    {
        let mut session = live.entity.lock().await;
        if session.transition(SessionState::Error, "monitor-panic").is_ok() {
            let copy = session.clone();
            drop(session);
            let _ = executor.store().save_session(&copy);
            executor.publish_state(&copy, "monitor-panic").await;
        }
    }
    let mut attempt = live.attempt.lock().await;
    if attempt.is_open() {
        let _ = executor.attempts().finish(&mut attempt, "monitor-panic");
    }
    let _ = live.provider.lock().await.kill();
    executor.drop_live(session_id).await;
}

struct Monitor {
    executor: Arc<AgentExecutor>,
    session_id: String,
    live: Arc<LiveSession>,
    extractor: Extractor,
    activity: ActivityLedger,
}

async fn run(
    executor: Arc<AgentExecutor>,
    session_id: String,
    live: Arc<LiveSession>,
    mut events: mpsc::Receiver<ProviderEvent>,
    extractor: Extractor,
    activity: ActivityLedger,
) {
    let cancel = live.cancel.clone();
    let mut monitor = Monitor { executor, session_id, live, extractor, activity };

    // Watch the terminal runtime's own event stream so screen diffs reach
    // the hub and the extractor.
    let mut terminal_events = match monitor.live.terminal {
        Some(ref terminal) => Some(terminal.subscribe(DEFAULT_DIFF_BUFFER).await.1),
        None => None,
    };

    let mut snapshot_tick = tokio::time::interval(SNAPSHOT_INTERVAL);
    snapshot_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    snapshot_tick.tick().await; // first tick fires immediately; skip it

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Some(event) => {
                        let terminal = monitor.handle_provider_event(&event).await;
                        if terminal {
                            break;
                        }
                    }
                    None => {
                        // Channel closed without a terminal event: the
                        // adapter died. Fail the session.
                        monitor.fail("provider-events-closed").await;
                        break;
                    }
                }
            }

            terminal_event = recv_opt(&mut terminal_events) => {
                match terminal_event {
                    Some(event) => monitor.handle_terminal_event(&event).await,
                    // Runtime dropped this watcher; stop selecting on it.
                    None => terminal_events = None,
                }
            }

            _ = snapshot_tick.tick() => {
                monitor.emit_periodic_snapshot().await;
            }

            _ = cancel.cancelled() => {
                debug!(session = %monitor.session_id, "monitor cancelled, draining");
                monitor.drain(&mut events).await;
                break;
            }
        }
    }

    monitor.finish().await;
}

/// Receive from an optional channel; pends forever when absent so the
/// select arm simply never fires.
async fn recv_opt(
    receiver: &mut Option<mpsc::Receiver<TerminalEvent>>,
) -> Option<TerminalEvent> {
    match receiver {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

impl Monitor {
    /// Handle one provider event. Returns `true` on a terminal event.
    async fn handle_provider_event(&mut self, event: &ProviderEvent) -> bool {
        {
            let mut attempt = self.live.attempt.lock().await;
            if let Err(e) = self.executor.attempts().heartbeat(&mut attempt) {
                warn!(session = %self.session_id, error = %e, "heartbeat persist failed");
            }
        }

        match event {
            ProviderEvent::Output(data) => {
                if let Some(ref terminal) = self.live.terminal {
                    if let Err(e) = terminal.apply_output(data).await {
                        warn!(session = %self.session_id, error = %e, "terminal apply failed");
                        self.executor
                            .hub()
                            .publish(
                                &Topic::TerminalsOutput(self.session_id.clone()),
                                EnvelopeType::TerminalError,
                                serde_json::json!({ "detail": e.to_string() }),
                            )
                            .await;
                    }
                }
                false
            }
            ProviderEvent::Message { kind, contents, raw } => {
                let projection =
                    if raw.is_some() { Projection::AppendRaw } else { Projection::Append };
                self.append_activity(projection, *kind, contents, raw.clone());
                let mutations = self.extract(event);
                self.publish_mutations(mutations).await;
                false
            }
            ProviderEvent::OutputDelta { contents } => {
                self.append_activity(
                    Projection::AppendOutputDelta,
                    MessageKind::Output,
                    contents,
                    None,
                );
                let mutations = self.extract(event);
                self.publish_mutations(mutations).await;
                false
            }
            ProviderEvent::TaskChanged { task } => {
                {
                    let mut session = self.live.entity.lock().await;
                    session.current_task = task.clone();
                    let copy = session.clone();
                    drop(session);
                    let _ = self.executor.store().save_session(&copy);
                }
                self.append_activity(
                    Projection::Append,
                    MessageKind::System,
                    &format!("task: {}", task.as_deref().unwrap_or("(none)")),
                    None,
                );
                let mutations = self.extract(event);
                self.publish_mutations(mutations).await;
                false
            }
            ProviderEvent::Started { provider_session_id } => {
                // Seen again on resume; refresh the recorded provider id.
                let mut attempt = self.live.attempt.lock().await;
                let _ = self
                    .executor
                    .attempts()
                    .record_provider_id(&mut attempt, provider_session_id.clone());
                drop(attempt);
                let mutations = self.extract(event);
                self.publish_mutations(mutations).await;
                false
            }
            ProviderEvent::Exited { code, signal } => {
                self.append_activity(
                    Projection::Append,
                    MessageKind::System,
                    &format!("process exited (code={code:?}, signal={signal:?})"),
                    None,
                );
                let mutations = self.extract(event);
                self.publish_mutations(mutations).await;
                self.handle_exit(*code, *signal).await;
                true
            }
            ProviderEvent::Errored { detail } => {
                self.append_activity(Projection::Append, MessageKind::Error, detail, None);
                let mutations = self.extract(event);
                self.publish_mutations(mutations).await;
                self.fail(detail).await;
                true
            }
        }
    }

    fn extract(&mut self, event: &ProviderEvent) -> Vec<ActivityMutation> {
        self.extractor.on_provider_event(event)
    }

    fn append_activity(
        &mut self,
        projection: Projection,
        kind: MessageKind,
        contents: &str,
        raw: Option<serde_json::Value>,
    ) {
        if let Err(e) = self.activity.append(projection, kind, contents, raw) {
            warn!(session = %self.session_id, error = %e, "activity ledger append failed");
        }
    }

    async fn publish_mutations(&self, mutations: Vec<ActivityMutation>) {
        for mutation in mutations {
            self.executor
                .hub()
                .publish(
                    &Topic::SessionsActivity(self.session_id.clone()),
                    EnvelopeType::SessionsActivity,
                    serde_json::json!({
                        "action": mutation.action,
                        "entry": mutation.entry,
                    }),
                )
                .await;
        }
    }

    async fn handle_terminal_event(&mut self, event: &TerminalEvent) {
        let topic = Topic::TerminalsOutput(self.session_id.clone());
        match event {
            TerminalEvent::Diff { first_row, lines, cursor, seq } => {
                self.executor
                    .hub()
                    .publish(
                        &topic,
                        EnvelopeType::TerminalDiff,
                        serde_json::json!({
                            "first_row": first_row,
                            "lines": lines,
                            "cursor": cursor,
                            "seq": seq,
                        }),
                    )
                    .await;

                // Screen-rule extraction runs on diffs, with mutations
                // persisted like any other.
                let mutations = self.extractor.on_terminal_diff(*first_row, lines);
                for mutation in &mutations {
                    if mutation.action == ActivityAction::Upsert {
                        let kind = match mutation.entry.kind.as_str() {
                            "tool" => MessageKind::Tool,
                            "error" => MessageKind::Error,
                            _ => MessageKind::System,
                        };
                        let contents = mutation.entry.data.to_string();
                        self.append_activity(Projection::Append, kind, &contents, None);
                    }
                }
                self.publish_mutations(mutations).await;
            }
            TerminalEvent::Snapshot { snapshot, seq } => {
                self.executor
                    .hub()
                    .publish(
                        &topic,
                        EnvelopeType::TerminalSnapshot,
                        serde_json::json!({ "snapshot": snapshot, "seq": seq }),
                    )
                    .await;
            }
            TerminalEvent::Cursor { cursor, seq } => {
                self.executor
                    .hub()
                    .publish(
                        &topic,
                        EnvelopeType::TerminalCursor,
                        serde_json::json!({ "cursor": cursor, "seq": seq }),
                    )
                    .await;
            }
            TerminalEvent::Bell { seq } => {
                self.executor
                    .hub()
                    .publish(&topic, EnvelopeType::TerminalBell, serde_json::json!({ "seq": seq }))
                    .await;
            }
            TerminalEvent::Mode { alt_screen, seq } => {
                self.executor
                    .hub()
                    .publish(
                        &topic,
                        EnvelopeType::TerminalMode,
                        serde_json::json!({ "alt_screen": alt_screen, "seq": seq }),
                    )
                    .await;
            }
        }
    }

    async fn emit_periodic_snapshot(&self) {
        if let Some(ref terminal) = self.live.terminal {
            terminal.emit_snapshot().await;
            if let Err(e) = self.executor.store().save_terminal(&terminal.to_record().await) {
                warn!(session = %self.session_id, error = %e, "terminal record persist failed");
            }
        }
    }

    /// Clean or unclean process exit.
    async fn handle_exit(&self, code: Option<i32>, signal: Option<i32>) {
        let clean = code == Some(0);
        let mut session = self.live.entity.lock().await;

        if clean {
            // running/paused → stopping → stopped.
            if !matches!(session.state, SessionState::Stopping) {
                let _ = session.transition(SessionState::Stopping, "process-exited");
            }
            let _ = session.transition(SessionState::Stopped, "exit-code-0");
        } else {
            let reason = format!("process failed (code={code:?}, signal={signal:?})");
            if matches!(session.state, SessionState::Stopping) {
                // A kill during stop is still an orderly stop.
                let _ = session.transition(SessionState::Stopped, &reason);
            } else {
                let _ = session.transition(SessionState::Error, &reason);
            }
        }
        let copy = session.clone();
        drop(session);

        let _ = self.executor.store().save_session(&copy);
        self.executor.publish_state(&copy, "process-exited").await;

        let mut attempt = self.live.attempt.lock().await;
        if attempt.is_open() {
            let reason = if copy.state == SessionState::Stopped { "exited" } else { "failed" };
            let _ = self.executor.attempts().finish(&mut attempt, reason);
        }
    }

    /// Unrecoverable adapter failure.
    async fn fail(&self, detail: &str) {
        {
            let mut session = self.live.entity.lock().await;
            if session.transition(SessionState::Error, detail).is_ok() {
                let copy = session.clone();
                drop(session);
                let _ = self.executor.store().save_session(&copy);
                self.executor.publish_state(&copy, detail).await;
            }
        }
        let mut attempt = self.live.attempt.lock().await;
        if attempt.is_open() {
            let _ = self.executor.attempts().finish(&mut attempt, "errored");
        }
    }

    /// Consume whatever the adapter still has buffered, within the grace
    /// window, so final output is not lost on cancellation.
    async fn drain(&mut self, events: &mut mpsc::Receiver<ProviderEvent>) {
        let deadline = tokio::time::Instant::now() + DRAIN_GRACE;
        loop {
            let event = tokio::select! {
                event = events.recv() => event,
                _ = tokio::time::sleep_until(deadline) => break,
            };
            match event {
                Some(event) => {
                    if self.handle_provider_event(&event).await {
                        break;
                    }
                }
                None => break,
            }
        }
    }

    /// Final bookkeeping after the loop ends.
    async fn finish(&self) {
        let session = self.live.entity.lock().await.clone();
        let _ = self.executor.store().save_session(&session);

        if let Some(ref terminal) = self.live.terminal {
            let _ = self.executor.store().save_terminal(&terminal.to_record().await);
        }
        self.executor.drop_live(&self.session_id).await;
        debug!(session = %self.session_id, state = %session.state, "monitor finished");
    }
}
