//! Cross-instance delivery tests.
//!
//! Covered:
//! - An event published on instance A reaches a viewer on instance B
//! - Viewers on two instances each get a single publish exactly once
//!   (scenario B)
//! - Instances without viewers for a key never receive its events

use super::harness::{TestCluster, SETTLE};
use crate::event::{ScanType, TrackingEvent};
use std::time::Duration;

#[tokio::test]
async fn publish_on_one_instance_reaches_another() {
    let cluster = TestCluster::new();
    let a = cluster.instance();
    let b = cluster.instance();

    let mut viewer = b.join(&cluster, "42").await;

    let event = TrackingEvent::scan_updated(42, ScanType::Out, "Depot 3");
    a.bridge.publish_event(&event.key(), &event).await.unwrap();

    let received = viewer.next_event(SETTLE).await.unwrap();
    let parsed: TrackingEvent = serde_json::from_str(&received).unwrap();
    assert_eq!(parsed, event);
}

#[tokio::test]
async fn one_publish_reaches_each_instance_once() {
    let cluster = TestCluster::new();
    let a = cluster.instance();
    let b = cluster.instance();

    let mut c1 = a.join(&cluster, "42").await;
    let mut c2 = b.join(&cluster, "42").await;
    cluster.wait_for_listeners("ws:delivery:42", 2).await;

    let receivers = a.bridge.publish(&"42".into(), b"once").await.unwrap();
    assert_eq!(receivers, 2);

    assert_eq!(c1.next_event(SETTLE).await.as_deref(), Some("once"));
    assert_eq!(c2.next_event(SETTLE).await.as_deref(), Some("once"));

    // No duplicates trail behind.
    assert!(c1.next_event(Duration::from_millis(50)).await.is_none());
    assert!(c2.next_event(Duration::from_millis(50)).await.is_none());
}

#[tokio::test]
async fn instances_only_listen_to_their_own_keys() {
    let cluster = TestCluster::new();
    let a = cluster.instance();
    let b = cluster.instance();

    let mut on_a = a.join(&cluster, "1").await;
    let mut on_b = b.join(&cluster, "2").await;

    a.bridge.publish(&"2".into(), b"for-2").await.unwrap();
    b.bridge.publish(&"1".into(), b"for-1").await.unwrap();

    assert_eq!(on_a.next_event(SETTLE).await.as_deref(), Some("for-1"));
    assert_eq!(on_b.next_event(SETTLE).await.as_deref(), Some("for-2"));

    assert!(!a.registry.has_forwarder(&"2".into()));
    assert!(!b.registry.has_forwarder(&"1".into()));
}
