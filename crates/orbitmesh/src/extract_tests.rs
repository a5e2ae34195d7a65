// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use proptest::prelude::*;
use serde_json::json;

use crate::ledger::MessageKind;
use crate::provider::ProviderEvent;

use super::*;

fn entry(id: &str, revision: u64, open: bool) -> ActivityEntry {
    ActivityEntry {
        id: id.to_owned(),
        session_id: "s1".to_owned(),
        kind: "tool".to_owned(),
        timestamp_ms: 1,
        revision,
        open,
        data: json!({"rev": revision}),
        event_id: revision,
    }
}

fn upsert(id: &str, revision: u64) -> ActivityMutation {
    ActivityMutation { action: ActivityAction::Upsert, entry: entry(id, revision, true) }
}

fn finalize(id: &str) -> ActivityMutation {
    ActivityMutation { action: ActivityAction::Finalize, entry: entry(id, 1, false) }
}

#[test]
fn upsert_appends_then_replaces_by_revision() {
    let mut feed = ActivityFeed::new();

    assert!(feed.apply(&upsert("a", 1)));
    assert!(feed.apply(&upsert("a", 2)));
    // Stale revision is dropped.
    assert!(!feed.apply(&upsert("a", 1)));

    let open: Vec<_> = feed.open_entries().collect();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].revision, 2);
}

#[test]
fn upsert_is_idempotent_at_same_revision() {
    let mut feed = ActivityFeed::new();
    feed.apply(&upsert("a", 3));
    let before: Vec<_> = feed.open_entries().cloned().collect();

    // Same revision replaces with identical content — indistinguishable.
    assert!(feed.apply(&upsert("a", 3)));
    let after: Vec<_> = feed.open_entries().cloned().collect();
    assert_eq!(before, after);
}

#[test]
fn finalize_closes_and_blocks_further_upserts() {
    let mut feed = ActivityFeed::new();
    feed.apply(&upsert("a", 1));

    assert!(feed.apply(&finalize("a")));
    assert!(feed.open_entries().next().is_none());
    assert_eq!(feed.closed_entries().len(), 1);
    assert!(!feed.closed_entries()[0].open);

    // Post-finalize upserts are dropped, finalize stays idempotent.
    assert!(!feed.apply(&upsert("a", 5)));
    assert!(feed.apply(&finalize("a")));
}

#[test]
fn window_caps_open_entries_at_eight() {
    let mut feed = ActivityFeed::new();
    for i in 0..10 {
        feed.apply(&upsert(&format!("e{i}"), 1));
    }

    assert_eq!(feed.open_entries().count(), OPEN_WINDOW);
    // The two oldest aged out and are no longer updatable.
    assert!(!feed.apply(&upsert("e0", 2)));
    assert!(!feed.apply(&upsert("e1", 2)));
    // Recent ones still are.
    assert!(feed.apply(&upsert("e9", 2)));
}

#[test]
fn delete_removes_entries() {
    let mut feed = ActivityFeed::new();
    feed.apply(&upsert("a", 1));
    let delete = ActivityMutation { action: ActivityAction::Delete, entry: entry("a", 1, true) };
    assert!(feed.apply(&delete));
    assert!(feed.open_entries().next().is_none());
    assert!(!feed.apply(&delete));
}

#[test]
fn provider_message_produces_closed_entry() {
    let mut extractor = Extractor::new("s1");
    let mutations = extractor.on_provider_event(&ProviderEvent::Message {
        kind: MessageKind::User,
        contents: "hello".to_owned(),
        raw: None,
    });

    assert_eq!(mutations.len(), 1);
    assert_eq!(mutations[0].action, ActivityAction::Upsert);
    assert_eq!(mutations[0].entry.kind, "user");
    assert!(!mutations[0].entry.open);
    assert_eq!(mutations[0].entry.data["text"], "hello");
}

#[test]
fn deltas_revise_one_streaming_entry_then_finalize() {
    let mut extractor = Extractor::new("s1");

    let first = extractor
        .on_provider_event(&ProviderEvent::OutputDelta { contents: "a".to_owned() });
    let second = extractor
        .on_provider_event(&ProviderEvent::OutputDelta { contents: "b".to_owned() });

    assert_eq!(first[0].entry.id, second[0].entry.id);
    assert_eq!(first[0].entry.revision, 1);
    assert_eq!(second[0].entry.revision, 2);
    assert_eq!(second[0].entry.data["text"], "ab");
    assert!(second[0].entry.open);

    // A complete message closes the streaming entry first.
    let mutations = extractor.on_provider_event(&ProviderEvent::Message {
        kind: MessageKind::Output,
        contents: "done".to_owned(),
        raw: None,
    });
    assert_eq!(mutations.len(), 2);
    assert_eq!(mutations[0].action, ActivityAction::Finalize);
    assert_eq!(mutations[0].entry.id, first[0].entry.id);
    assert_eq!(mutations[1].action, ActivityAction::Upsert);
}

#[test]
fn event_ids_are_monotone_per_session() {
    let mut extractor = Extractor::new("s1");
    let mut last = 0;
    for _ in 0..5 {
        let mutations = extractor
            .on_provider_event(&ProviderEvent::TaskChanged { task: Some("t".to_owned()) });
        for mutation in mutations {
            assert!(mutation.entry.event_id > last);
            last = mutation.entry.event_id;
        }
    }
}

fn tool_profile() -> ProfileSpec {
    ProfileSpec {
        name: "agent-cli".to_owned(),
        command_regex: "^claude$".to_owned(),
        args_regex: None,
        rules: vec![RuleSpec {
            kind: "tool".to_owned(),
            rows: Some((0, 10)),
            pattern: r"^\s*Running (?P<name>\w+)\.\.\.".to_owned(),
            key: "tool-{name}".to_owned(),
        }],
    }
}

#[test]
fn profile_rules_derive_stable_keys() {
    let mut extractor = Extractor::new("s1");
    let errors = extractor.load_profiles(&[tool_profile()], "claude", &[]);
    assert!(errors.is_empty());
    assert_eq!(extractor.profile_name(), Some("agent-cli"));

    let first = extractor.on_terminal_diff(2, &["Running bash...".to_owned()]);
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].entry.id, "tool-bash");
    assert_eq!(first[0].entry.revision, 1);
    assert_eq!(first[0].entry.data["name"], "bash");

    // Same region re-rendering bumps the revision on the same key.
    let second = extractor.on_terminal_diff(2, &["Running bash...".to_owned()]);
    assert_eq!(second[0].entry.id, "tool-bash");
    assert_eq!(second[0].entry.revision, 2);
}

#[test]
fn rules_respect_row_ranges() {
    let mut extractor = Extractor::new("s1");
    extractor.load_profiles(&[tool_profile()], "claude", &[]);

    let mutations = extractor.on_terminal_diff(20, &["Running bash...".to_owned()]);
    assert!(mutations.is_empty(), "row 20 is outside the rule's 0..=10 range");
}

#[test]
fn non_matching_identity_leaves_no_profile() {
    let mut extractor = Extractor::new("s1");
    let errors = extractor.load_profiles(&[tool_profile()], "vim", &[]);
    assert!(errors.is_empty());
    assert_eq!(extractor.profile_name(), None);
    assert!(extractor.on_terminal_diff(0, &["Running bash...".to_owned()]).is_empty());
}

#[test]
fn invalid_profile_is_rejected_and_last_valid_stays() {
    let mut extractor = Extractor::new("s1");
    extractor.load_profiles(&[tool_profile()], "claude", &[]);

    let broken = ProfileSpec {
        name: "broken".to_owned(),
        command_regex: "(".to_owned(),
        args_regex: None,
        rules: vec![RuleSpec {
            kind: "x".to_owned(),
            rows: None,
            pattern: ".*".to_owned(),
            key: "k".to_owned(),
        }],
    };
    let errors = extractor.load_profiles(&[broken], "claude", &[]);
    assert_eq!(errors.len(), 1);
    assert!(matches!(errors[0], ExtractorConfigError::InvalidRegex { .. }));
    // The previously selected profile is still active.
    assert_eq!(extractor.profile_name(), Some("agent-cli"));
}

#[test]
fn key_template_with_unknown_capture_is_rejected() {
    let spec = ProfileSpec {
        name: "bad-key".to_owned(),
        command_regex: ".*".to_owned(),
        args_regex: None,
        rules: vec![RuleSpec {
            kind: "tool".to_owned(),
            rows: None,
            pattern: r"(?P<name>\w+)".to_owned(),
            key: "tool-{missing}".to_owned(),
        }],
    };
    let err = ExtractorProfile::compile(&spec).err();
    assert!(matches!(
        err,
        Some(ExtractorConfigError::UnknownCapture { ref capture, .. }) if capture == "missing"
    ));
}

#[test]
fn empty_profile_is_rejected() {
    let spec = ProfileSpec {
        name: "empty".to_owned(),
        command_regex: ".*".to_owned(),
        args_regex: None,
        rules: vec![],
    };
    assert!(matches!(
        ExtractorProfile::compile(&spec),
        Err(ExtractorConfigError::Empty { .. })
    ));
}

proptest! {
    /// Applying `{upsert e; upsert e}` is indistinguishable from
    /// `{upsert e}` when the revision is unchanged.
    #[test]
    fn upsert_replay_is_idempotent(id in "[a-z]{1,8}", revision in 1u64..64) {
        let mutation = upsert(&id, revision);

        let mut once = ActivityFeed::new();
        once.apply(&mutation);

        let mut twice = ActivityFeed::new();
        twice.apply(&mutation);
        prop_assert!(twice.apply(&mutation));

        let first: Vec<_> = once.open_entries().cloned().collect();
        let replayed: Vec<_> = twice.open_entries().cloned().collect();
        prop_assert_eq!(first, replayed);
        prop_assert_eq!(once.closed_entries(), twice.closed_entries());
    }

    /// Stale upserts are dropped: the stored revision never decreases.
    #[test]
    fn stale_upserts_never_regress(revisions in prop::collection::vec(1u64..32, 1..16)) {
        let mut feed = ActivityFeed::new();
        let mut high = 0u64;
        for revision in revisions {
            let accepted = feed.apply(&upsert("x", revision));
            prop_assert_eq!(accepted, revision >= high);
            if accepted {
                high = revision;
            }
            let stored = feed.open_entries().next().map(|e| e.revision);
            prop_assert_eq!(stored, Some(high));
        }
    }
}

#[test]
fn args_regex_filters_identity() {
    let mut spec = tool_profile();
    spec.args_regex = Some("--resume".to_owned());
    let profile = ExtractorProfile::compile(&spec).unwrap();

    assert!(profile.matches_identity("claude", &["--resume".to_owned(), "abc".to_owned()]));
    assert!(!profile.matches_identity("claude", &["--fresh".to_owned()]));
}
