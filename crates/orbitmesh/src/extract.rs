// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Activity extractor: turns terminal diffs and provider events into a
//! stream of revisable activity mutations.
//!
//! Entries start `open` while the extractor may still refine them; a
//! finalize closes them for good. The feed keeps a window of the last eight
//! open entries — anything older can no longer be revised, which bounds how
//! much history a replay has to reconsider.

use std::collections::{HashSet, VecDeque};

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ledger::MessageKind;
use crate::provider::ProviderEvent;
use crate::session::now_ms;

/// Open-entry window size.
pub const OPEN_WINDOW: usize = 8;

/// A revisable record in the human-visible feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub id: String,
    pub session_id: String,
    pub kind: String,
    pub timestamp_ms: u64,
    /// Starts at 1; higher revisions replace lower ones.
    pub revision: u64,
    pub open: bool,
    pub data: serde_json::Value,
    /// Per-session monotone id of the emitting stream event, for
    /// stream-vs-history deduplication on clients.
    pub event_id: u64,
}

/// What to do with an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityAction {
    Upsert,
    Finalize,
    Delete,
}

/// One emitted mutation: persisted to the activity ledger and published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityMutation {
    pub action: ActivityAction,
    pub entry: ActivityEntry,
}

/// Errors from extractor profile loading.
#[derive(Debug, Error)]
pub enum ExtractorConfigError {
    #[error("profile {profile}: invalid {field} regex: {detail}")]
    InvalidRegex { profile: String, field: String, detail: String },
    #[error("profile {profile}: key template references unknown capture {capture:?}")]
    UnknownCapture { profile: String, capture: String },
    #[error("profile {profile} has no rules")]
    Empty { profile: String },
}

/// On-disk shape of an extractor profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileSpec {
    pub name: String,
    /// Matched against the provider's launch command.
    pub command_regex: String,
    /// Matched against the space-joined launch arguments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args_regex: Option<String>,
    pub rules: Vec<RuleSpec>,
}

/// One screen-region rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSpec {
    /// Entry kind this rule produces (e.g. "tool", "status").
    pub kind: String,
    /// Inclusive row range the rule watches; `None` watches everywhere.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<(u16, u16)>,
    /// Line regex with named captures.
    pub pattern: String,
    /// Stable entity-key template, e.g. `"tool-{name}"`; `{capture}`
    /// placeholders are substituted from the pattern's named groups.
    pub key: String,
}

struct CompiledRule {
    kind: String,
    rows: Option<(u16, u16)>,
    pattern: Regex,
    key: String,
}

/// A compiled, validated profile.
pub struct ExtractorProfile {
    pub name: String,
    command: Regex,
    args: Option<Regex>,
    rules: Vec<CompiledRule>,
}

/// Extract `{placeholder}` names from a key template.
fn template_captures(template: &str) -> Vec<String> {
    let mut captures = Vec::new();
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        let Some(end) = rest[start..].find('}') else { break };
        captures.push(rest[start + 1..start + end].to_owned());
        rest = &rest[start + end + 1..];
    }
    captures
}

impl ExtractorProfile {
    /// Compile a spec, validating every regex and key template.
    pub fn compile(spec: &ProfileSpec) -> Result<Self, ExtractorConfigError> {
        let bad_regex = |field: &str, e: &regex::Error| ExtractorConfigError::InvalidRegex {
            profile: spec.name.clone(),
            field: field.to_owned(),
            detail: e.to_string(),
        };

        if spec.rules.is_empty() {
            return Err(ExtractorConfigError::Empty { profile: spec.name.clone() });
        }

        let command = Regex::new(&spec.command_regex).map_err(|e| bad_regex("command", &e))?;
        let args = spec
            .args_regex
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|e| bad_regex("args", &e))?;

        let mut rules = Vec::with_capacity(spec.rules.len());
        for rule in &spec.rules {
            let pattern = Regex::new(&rule.pattern).map_err(|e| bad_regex("pattern", &e))?;
            let names: HashSet<&str> = pattern.capture_names().flatten().collect();
            for capture in template_captures(&rule.key) {
                if !names.contains(capture.as_str()) {
                    return Err(ExtractorConfigError::UnknownCapture {
                        profile: spec.name.clone(),
                        capture,
                    });
                }
            }
            rules.push(CompiledRule {
                kind: rule.kind.clone(),
                rows: rule.rows,
                pattern,
                key: rule.key.clone(),
            });
        }

        Ok(Self { name: spec.name.clone(), command, args, rules })
    }

    /// Whether this profile applies to a launch identity.
    pub fn matches_identity(&self, command: &str, args: &[String]) -> bool {
        if !self.command.is_match(command) {
            return false;
        }
        match self.args {
            Some(ref pattern) => pattern.is_match(&args.join(" ")),
            None => true,
        }
    }
}

/// Stateful view of a session's activity entries.
///
/// Applies mutations with the open-window and revision rules; rejected
/// mutations return `false` and change nothing.
#[derive(Default)]
pub struct ActivityFeed {
    open: VecDeque<ActivityEntry>,
    closed: Vec<ActivityEntry>,
    finalized_ids: HashSet<String>,
}

impl ActivityFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open_entries(&self) -> impl Iterator<Item = &ActivityEntry> {
        self.open.iter()
    }

    pub fn closed_entries(&self) -> &[ActivityEntry] {
        &self.closed
    }

    pub fn apply(&mut self, mutation: &ActivityMutation) -> bool {
        match mutation.action {
            ActivityAction::Upsert => self.apply_upsert(&mutation.entry),
            ActivityAction::Finalize => self.apply_finalize(&mutation.entry.id),
            ActivityAction::Delete => self.apply_delete(&mutation.entry.id),
        }
    }

    fn apply_upsert(&mut self, entry: &ActivityEntry) -> bool {
        if self.finalized_ids.contains(&entry.id) {
            return false;
        }

        if let Some(existing) = self.open.iter_mut().find(|e| e.id == entry.id) {
            if entry.revision < existing.revision {
                return false;
            }
            *existing = entry.clone();
            return true;
        }

        if !entry.open {
            self.finalized_ids.insert(entry.id.clone());
            self.closed.push(entry.clone());
            return true;
        }

        self.open.push_back(entry.clone());
        if self.open.len() > OPEN_WINDOW {
            // The oldest entry leaves the revisable window for good.
            if let Some(aged) = self.open.pop_front() {
                self.finalized_ids.insert(aged.id.clone());
                self.closed.push(aged);
            }
        }
        true
    }

    fn apply_finalize(&mut self, id: &str) -> bool {
        if let Some(pos) = self.open.iter().position(|e| e.id == id) {
            if let Some(mut entry) = self.open.remove(pos) {
                entry.open = false;
                self.finalized_ids.insert(entry.id.clone());
                self.closed.push(entry);
            }
            return true;
        }
        // Finalizing twice is idempotent.
        self.finalized_ids.contains(id)
    }

    fn apply_delete(&mut self, id: &str) -> bool {
        let in_open = self.open.iter().position(|e| e.id == id);
        if let Some(pos) = in_open {
            self.open.remove(pos);
            return true;
        }
        let before = self.closed.len();
        self.closed.retain(|e| e.id != id);
        self.finalized_ids.remove(id);
        before != self.closed.len()
    }
}

/// Per-session extractor: consumes provider events and terminal diffs,
/// emits mutations, and mirrors them into its own [`ActivityFeed`].
pub struct Extractor {
    session_id: String,
    feed: ActivityFeed,
    profile: Option<ExtractorProfile>,
    next_event_id: u64,
    next_entry: u64,
    /// Id of the currently-open streamed output entry, if any.
    streaming_output: Option<String>,
    /// Accumulated text of the streamed output entry.
    streaming_text: String,
}

impl Extractor {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            feed: ActivityFeed::new(),
            profile: None,
            next_event_id: 0,
            next_entry: 0,
            streaming_output: None,
            streaming_text: String::new(),
        }
    }

    pub fn feed(&self) -> &ActivityFeed {
        &self.feed
    }

    pub fn profile_name(&self) -> Option<&str> {
        self.profile.as_ref().map(|p| p.name.as_str())
    }

    /// Compile `specs` and select the profile matching the launch identity.
    ///
    /// Invalid specs are reported; the previously active profile stays in
    /// effect when no valid spec matches. Callers publish each error as an
    /// `extractor.warning` envelope.
    pub fn load_profiles(
        &mut self,
        specs: &[ProfileSpec],
        command: &str,
        args: &[String],
    ) -> Vec<ExtractorConfigError> {
        let mut errors = Vec::new();
        for spec in specs {
            match ExtractorProfile::compile(spec) {
                Ok(profile) => {
                    if self.profile.is_none() && profile.matches_identity(command, args) {
                        self.profile = Some(profile);
                    }
                }
                Err(e) => errors.push(e),
            }
        }
        errors
    }

    fn next_event_id(&mut self) -> u64 {
        self.next_event_id += 1;
        self.next_event_id
    }

    fn generated_id(&mut self, prefix: &str) -> String {
        self.next_entry += 1;
        format!("{prefix}-{}", self.next_entry)
    }

    fn entry(
        &mut self,
        id: String,
        kind: &str,
        revision: u64,
        open: bool,
        data: serde_json::Value,
    ) -> ActivityEntry {
        ActivityEntry {
            id,
            session_id: self.session_id.clone(),
            kind: kind.to_owned(),
            timestamp_ms: now_ms(),
            revision,
            open,
            data,
            event_id: self.next_event_id(),
        }
    }

    fn emit(&mut self, action: ActivityAction, entry: ActivityEntry) -> Option<ActivityMutation> {
        let mutation = ActivityMutation { action, entry };
        self.feed.apply(&mutation).then_some(mutation)
    }

    /// Translate one provider event into activity mutations.
    pub fn on_provider_event(&mut self, event: &ProviderEvent) -> Vec<ActivityMutation> {
        let mut mutations = Vec::new();
        match event {
            ProviderEvent::Started { provider_session_id } => {
                let id = self.generated_id("lifecycle");
                let entry = self.entry(
                    id,
                    "lifecycle",
                    1,
                    false,
                    serde_json::json!({
                        "phase": "started",
                        "provider_session_id": provider_session_id,
                    }),
                );
                mutations.extend(self.emit(ActivityAction::Upsert, entry));
            }
            ProviderEvent::Message { kind, contents, raw } => {
                mutations.extend(self.close_streaming_output());
                let id = self.generated_id("msg");
                let entry = self.entry(
                    id,
                    kind_str(*kind),
                    1,
                    false,
                    serde_json::json!({ "text": contents, "raw": raw }),
                );
                mutations.extend(self.emit(ActivityAction::Upsert, entry));
            }
            ProviderEvent::OutputDelta { contents } => {
                self.streaming_text.push_str(contents);
                let text = self.streaming_text.clone();
                match self.streaming_output.clone() {
                    Some(id) => {
                        let revision = self
                            .feed
                            .open_entries()
                            .find(|e| e.id == id)
                            .map(|e| e.revision + 1)
                            .unwrap_or(1);
                        let entry = self.entry(
                            id,
                            "output",
                            revision,
                            true,
                            serde_json::json!({ "text": text }),
                        );
                        mutations.extend(self.emit(ActivityAction::Upsert, entry));
                    }
                    None => {
                        let id = self.generated_id("out");
                        self.streaming_output = Some(id.clone());
                        let entry =
                            self.entry(id, "output", 1, true, serde_json::json!({ "text": text }));
                        mutations.extend(self.emit(ActivityAction::Upsert, entry));
                    }
                }
            }
            ProviderEvent::TaskChanged { task } => {
                let id = self.generated_id("task");
                let entry =
                    self.entry(id, "task", 1, false, serde_json::json!({ "task": task }));
                mutations.extend(self.emit(ActivityAction::Upsert, entry));
            }
            ProviderEvent::Exited { code, signal } => {
                mutations.extend(self.close_streaming_output());
                let id = self.generated_id("lifecycle");
                let entry = self.entry(
                    id,
                    "lifecycle",
                    1,
                    false,
                    serde_json::json!({ "phase": "exited", "code": code, "signal": signal }),
                );
                mutations.extend(self.emit(ActivityAction::Upsert, entry));
            }
            ProviderEvent::Errored { detail } => {
                mutations.extend(self.close_streaming_output());
                let id = self.generated_id("err");
                let entry =
                    self.entry(id, "error", 1, false, serde_json::json!({ "detail": detail }));
                mutations.extend(self.emit(ActivityAction::Upsert, entry));
            }
            ProviderEvent::Output(_) => {
                // Raw PTY bytes arrive via terminal diffs instead.
            }
        }
        mutations
    }

    fn close_streaming_output(&mut self) -> Option<ActivityMutation> {
        let id = self.streaming_output.take()?;
        self.streaming_text.clear();
        let entry = self.entry(id, "output", 1, false, serde_json::Value::Null);
        self.emit(ActivityAction::Finalize, entry)
    }

    /// Run the active profile's rules over a terminal diff.
    ///
    /// The stable entity key keeps re-renders of the same screen region
    /// converging on one entry with increasing revisions.
    pub fn on_terminal_diff(&mut self, first_row: u16, lines: &[String]) -> Vec<ActivityMutation> {
        let Some(profile) = self.profile.take() else {
            return Vec::new();
        };
        let mut mutations = Vec::new();

        for rule in &profile.rules {
            for (offset, line) in lines.iter().enumerate() {
                let row = first_row + offset as u16;
                if let Some((from, to)) = rule.rows {
                    if row < from || row > to {
                        continue;
                    }
                }
                let Some(captures) = rule.pattern.captures(line) else {
                    continue;
                };

                let mut data = serde_json::Map::new();
                let mut key = rule.key.clone();
                for name in rule.pattern.capture_names().flatten() {
                    if let Some(value) = captures.name(name) {
                        data.insert(
                            name.to_owned(),
                            serde_json::Value::String(value.as_str().to_owned()),
                        );
                        key = key.replace(&format!("{{{name}}}"), value.as_str());
                    }
                }
                data.insert("row".to_owned(), serde_json::json!(row));

                let revision = self
                    .feed
                    .open_entries()
                    .find(|e| e.id == key)
                    .map(|e| e.revision + 1)
                    .unwrap_or(1);
                let entry = self.entry(
                    key,
                    &rule.kind.clone(),
                    revision,
                    true,
                    serde_json::Value::Object(data),
                );
                mutations.extend(self.emit(ActivityAction::Upsert, entry));
            }
        }

        self.profile = Some(profile);
        mutations
    }
}

fn kind_str(kind: MessageKind) -> &'static str {
    match kind {
        MessageKind::User => "user",
        MessageKind::Output => "output",
        MessageKind::System => "system",
        MessageKind::Error => "error",
        MessageKind::Tool => "tool",
    }
}

#[cfg(test)]
#[path = "extract_tests.rs"]
mod tests;
