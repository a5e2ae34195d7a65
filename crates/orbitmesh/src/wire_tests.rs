// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use yare::parameterized;

use super::*;

#[parameterized(
    sessions_state = { Topic::SessionsState, "sessions.state" },
    terminals_state = { Topic::TerminalsState, "terminals.state" },
)]
fn global_topic_names(topic: Topic, name: &str) {
    assert_eq!(topic.name(), name);
    assert_eq!(Topic::parse(name), Some(topic));
}

#[test]
fn per_entity_topic_names() {
    let topic = Topic::SessionsActivity("sess-1".to_owned());
    assert_eq!(topic.name(), "sessions.activity:sess-1");
    assert_eq!(Topic::parse("sessions.activity:sess-1"), Some(topic));

    let topic = Topic::TerminalsOutput("term-1".to_owned());
    assert_eq!(topic.name(), "terminals.output:term-1");
    assert_eq!(Topic::parse("terminals.output:term-1"), Some(topic));
}

#[parameterized(
    unknown = { "sessions.unknown" },
    empty_id = { "sessions.activity:" },
    bad_id = { "terminals.output:../etc" },
    garbage = { "nope" },
)]
fn unparseable_topics(name: &str) {
    assert_eq!(Topic::parse(name), None);
}

#[test]
fn envelope_wire_shape() -> anyhow::Result<()> {
    let envelope = Envelope {
        version: ENVELOPE_VERSION,
        kind: EnvelopeType::SessionsState,
        topic: "sessions.state".to_owned(),
        seq: 7,
        ts: 1_700_000_000_000,
        payload: serde_json::json!({"session": "s1", "state": "running"}),
    };

    let value: serde_json::Value = serde_json::to_value(&envelope)?;
    assert_eq!(value["v"], 1);
    assert_eq!(value["type"], "sessions.state");
    assert_eq!(value["seq"], 7);
    assert_eq!(value["payload"]["state"], "running");
    Ok(())
}

#[test]
fn inbound_messages_parse() -> anyhow::Result<()> {
    let key: InboundMessage =
        serde_json::from_str(r#"{"type":"input.key","key":"enter","modifiers":["ctrl"]}"#)?;
    assert_eq!(key, InboundMessage::Key { key: "enter".into(), modifiers: vec!["ctrl".into()] });

    let resize: InboundMessage =
        serde_json::from_str(r#"{"type":"input.resize","cols":120,"rows":40}"#)?;
    assert_eq!(resize, InboundMessage::Resize { cols: 120, rows: 40 });

    let text: InboundMessage = serde_json::from_str(r#"{"type":"input.text","text":"ls\n"}"#)?;
    assert_eq!(text, InboundMessage::Text { text: "ls\n".into() });
    Ok(())
}

#[test]
fn unknown_inbound_type_fails() {
    let result = serde_json::from_str::<InboundMessage>(r#"{"type":"input.telepathy"}"#);
    assert!(result.is_err());
}
