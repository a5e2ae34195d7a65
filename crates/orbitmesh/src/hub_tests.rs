// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use serde_json::json;

use crate::wire::{EnvelopeType, Topic};

use super::*;

#[tokio::test]
async fn subscriber_receives_matching_topic() {
    let hub = Hub::new();
    let mut sub = hub.subscribe(&[Topic::SessionsState], 8).await;

    hub.publish(&Topic::SessionsState, EnvelopeType::SessionsState, json!({"n": 1})).await;
    hub.publish(&Topic::TerminalsState, EnvelopeType::TerminalSnapshot, json!({"n": 2})).await;

    let received = sub.receiver.recv().await.unwrap();
    assert_eq!(received.payload["n"], 1);
    assert_eq!(received.version, 1);
    // Nothing else queued: the terminals.state envelope did not match.
    assert!(sub.receiver.try_recv().is_err());
}

#[tokio::test]
async fn per_session_topics_are_isolated() {
    let hub = Hub::new();
    let mut sub_a = hub.subscribe(&[Topic::SessionsActivity("a".into())], 8).await;
    let mut sub_b = hub.subscribe(&[Topic::SessionsActivity("b".into())], 8).await;

    hub.publish(
        &Topic::SessionsActivity("a".into()),
        EnvelopeType::SessionsActivity,
        json!({"for": "a"}),
    )
    .await;

    assert_eq!(sub_a.receiver.recv().await.unwrap().payload["for"], "a");
    assert!(sub_b.receiver.try_recv().is_err());
}

#[tokio::test]
async fn sequence_is_strictly_increasing() {
    let hub = Hub::new();
    let mut sub = hub.subscribe(&[Topic::SessionsState], 64).await;

    for i in 0..10 {
        hub.publish(&Topic::SessionsState, EnvelopeType::SessionsState, json!({"i": i})).await;
    }

    let mut last = 0;
    for _ in 0..10 {
        let envelope = sub.receiver.recv().await.unwrap();
        assert!(envelope.seq > last, "seq {} not > {last}", envelope.seq);
        last = envelope.seq;
    }
}

#[tokio::test]
async fn slow_subscriber_is_dropped_fast_one_survives() {
    let hub = Hub::new();
    let mut fast = hub.subscribe(&[Topic::SessionsState], 65).await;
    let slow = hub.subscribe(&[Topic::SessionsState], 64).await;
    assert_eq!(hub.subscriber_count().await, 2);

    // Publish 65 envelopes; the slow subscriber never drains.
    for i in 0..65 {
        hub.publish(&Topic::SessionsState, EnvelopeType::SessionsState, json!({"i": i})).await;
    }

    // The slow subscriber was unregistered at the overflowing publish.
    assert_eq!(hub.subscriber_count().await, 1);

    let mut last = 0;
    for i in 0..65 {
        let envelope = fast.receiver.recv().await.unwrap();
        assert_eq!(envelope.payload["i"], i);
        assert!(envelope.seq > last);
        last = envelope.seq;
    }

    // Publishing again is a no-op for the dropped subscriber.
    hub.publish(&Topic::SessionsState, EnvelopeType::SessionsState, json!({"late": true})).await;
    assert!(!hub.unsubscribe(slow.id).await, "slow subscriber should already be gone");
}

#[tokio::test]
async fn unsubscribe_is_idempotent() {
    let hub = Hub::new();
    let sub = hub.subscribe(&[Topic::TerminalsState], 8).await;

    assert!(hub.unsubscribe(sub.id).await);
    assert!(!hub.unsubscribe(sub.id).await);
    assert_eq!(hub.subscriber_count().await, 0);
}

#[tokio::test]
async fn dropped_receiver_is_pruned_on_publish() {
    let hub = Hub::new();
    let sub = hub.subscribe(&[Topic::SessionsState], 8).await;
    drop(sub.receiver);

    hub.publish(&Topic::SessionsState, EnvelopeType::SessionsState, json!({})).await;
    assert_eq!(hub.subscriber_count().await, 0);
}

#[tokio::test]
async fn add_topics_extends_subscription() {
    let hub = Hub::new();
    let mut sub = hub.subscribe(&[Topic::SessionsState], 8).await;
    hub.add_topics(sub.id, &[Topic::TerminalsOutput("t1".into())]).await;

    hub.publish(
        &Topic::TerminalsOutput("t1".into()),
        EnvelopeType::TerminalDiff,
        json!({"rows": []}),
    )
    .await;

    let envelope = sub.receiver.recv().await.unwrap();
    assert_eq!(envelope.topic, "terminals.output:t1");
}

#[tokio::test]
async fn publish_returns_the_envelope() {
    let hub = Hub::new();
    let envelope = hub
        .publish(&Topic::SessionsState, EnvelopeType::SessionsState, json!({"x": 1}))
        .await;
    assert_eq!(envelope.topic, "sessions.state");
    assert_eq!(envelope.seq, 1);
    assert!(envelope.ts > 0);
}
