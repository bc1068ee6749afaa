//! Notification Tests
//!
//! One-shot semantics, subtree bubbling, replacement, and close behavior at
//! the tree level.

use std::sync::Arc;

use keyhive::notify::NotifyEvent;
use keyhive::session::{HandleId, SessionId};
use keyhive::tree::{
    Attributes, CreateOptions, KeyId, Registry, ValueType, CHANGE_LAST_SET, CHANGE_NAME,
};

fn w(s: &str) -> Vec<u16> {
    s.encode_utf16().collect()
}

fn create(registry: &mut Registry, path: &str) -> KeyId {
    let root = registry.root();
    registry
        .create_key(
            root,
            &w(path),
            None,
            CreateOptions::default(),
            Attributes::empty(),
            None,
            1,
        )
        .unwrap()
        .0
}

fn arm(registry: &mut Registry, key: KeyId, filter: u32, subtree: bool) -> Arc<NotifyEvent> {
    let event = NotifyEvent::new();
    registry.arm_notify(key, SessionId(1), HandleId(1), filter, subtree, event.clone());
    event
}

#[test]
fn test_subtree_name_change_bubbles() {
    let mut registry = Registry::new();
    let a = create(&mut registry, "A");
    let event = arm(&mut registry, a, CHANGE_NAME, true);

    create(&mut registry, "A\\X\\Y");
    assert!(event.is_signaled());
}

#[test]
fn test_notification_fires_exactly_once() {
    let mut registry = Registry::new();
    let a = create(&mut registry, "A");
    let event = arm(&mut registry, a, CHANGE_NAME, true);

    create(&mut registry, "A\\X");
    assert!(event.is_signaled());
    event.reset();

    // the event was consumed when it fired; further changes stay silent
    create(&mut registry, "A\\Z");
    assert!(!event.is_signaled());
}

#[test]
fn test_value_change_does_not_bubble() {
    let mut registry = Registry::new();
    let a = create(&mut registry, "A");
    let x = create(&mut registry, "A\\X");
    let event = arm(&mut registry, a, CHANGE_LAST_SET, true);

    registry.set_value(x, &w("v"), ValueType::SZ, b"").unwrap();
    assert!(!event.is_signaled());
}

#[test]
fn test_value_change_fires_on_origin_key() {
    let mut registry = Registry::new();
    let a = create(&mut registry, "A");
    let event = arm(&mut registry, a, CHANGE_LAST_SET, true);

    registry.set_value(a, &w("v"), ValueType::SZ, b"").unwrap();
    assert!(event.is_signaled());
}

#[test]
fn test_non_subtree_ignores_deep_changes() {
    let mut registry = Registry::new();
    let a = create(&mut registry, "A");
    let x = create(&mut registry, "A\\X");
    let event = arm(&mut registry, a, CHANGE_NAME, false);

    // a grandchild appearing only bubbles, and bubbles match subtree
    // subscriptions only
    create(&mut registry, "A\\X\\Y");
    assert!(!event.is_signaled());

    // removing a direct child is a change on A itself
    registry.delete_key(x, true).unwrap();
    assert!(event.is_signaled());
}

#[test]
fn test_filter_mismatch_does_not_fire() {
    let mut registry = Registry::new();
    let a = create(&mut registry, "A");
    let event = arm(&mut registry, a, CHANGE_LAST_SET, true);

    create(&mut registry, "A\\X");
    assert!(!event.is_signaled());
}

#[test]
fn test_rearm_replaces_event_without_duplicating() {
    let mut registry = Registry::new();
    let a = create(&mut registry, "A");
    let first = arm(&mut registry, a, CHANGE_NAME, true);
    let second = arm(&mut registry, a, CHANGE_NAME, true);

    create(&mut registry, "A\\X");
    assert!(!first.is_signaled(), "replaced event must not fire");
    assert!(second.is_signaled());
    assert_eq!(registry.node(a).notify.len(), 1);
}

#[test]
fn test_close_signals_and_removes() {
    let mut registry = Registry::new();
    let a = create(&mut registry, "A");
    let event = arm(&mut registry, a, CHANGE_NAME, true);

    registry.close_notify(a, SessionId(1), HandleId(1));
    assert!(event.is_signaled());
    assert!(registry.node(a).notify.is_empty());
}

#[test]
fn test_close_for_other_handle_is_ignored() {
    let mut registry = Registry::new();
    let a = create(&mut registry, "A");
    let event = arm(&mut registry, a, CHANGE_NAME, true);

    registry.close_notify(a, SessionId(1), HandleId(2));
    assert!(!event.is_signaled());
    assert_eq!(registry.node(a).notify.len(), 1);
}

#[test]
fn test_key_destruction_signals_watchers() {
    let mut registry = Registry::new();
    let a = create(&mut registry, "A");
    let event = arm(&mut registry, a, CHANGE_NAME, true);

    registry.delete_key(a, false).unwrap();
    assert!(event.is_signaled());
}
