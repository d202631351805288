//! Topic fan-out tests
//!
//! Ordering, unsubscribe semantics and isolation of failing subscribers.

use riskstream::protocol::DomainEvent;
use riskstream::realtime::EventDispatcher;
use riskstream::testing::{FailingSubscriber, PanickingSubscriber, RecordingSubscriber};
use riskstream::SubscriberError;
use serde_json::json;
use std::sync::{Arc, Mutex};

fn risk_event(score: f64) -> DomainEvent {
    DomainEvent::new("risk", json!({ "score": score }))
}

#[test]
fn test_subscribe_receive_unsubscribe_scenario() {
    let dispatcher = EventDispatcher::new();
    let callback = RecordingSubscriber::new();
    let id = dispatcher.subscribe("risk", callback.clone()).unwrap();

    dispatcher.dispatch(&risk_event(0.8));
    assert_eq!(callback.payloads(), vec![json!({"score": 0.8})]);

    assert!(dispatcher.unsubscribe(id));
    dispatcher.dispatch(&risk_event(0.9));
    assert_eq!(callback.count(), 1);
}

#[test]
fn test_failing_middle_subscriber_does_not_block_others() {
    let dispatcher = EventDispatcher::new();
    let first = RecordingSubscriber::new();
    let second = FailingSubscriber::new("downstream unavailable");
    let third = RecordingSubscriber::new();
    dispatcher.subscribe("risk", first.clone()).unwrap();
    dispatcher.subscribe("risk", second.clone()).unwrap();
    dispatcher.subscribe("risk", third.clone()).unwrap();

    let report = dispatcher.dispatch(&risk_event(0.5));

    assert_eq!(report.delivered, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(first.count(), 1);
    assert_eq!(second.calls(), 1);
    assert_eq!(third.count(), 1);

    // Later events are unaffected as well
    dispatcher.dispatch(&risk_event(0.6));
    assert_eq!(first.count(), 2);
    assert_eq!(third.count(), 2);
}

#[test]
fn test_panicking_subscriber_is_contained() {
    let dispatcher = EventDispatcher::new();
    let before = RecordingSubscriber::new();
    let after = RecordingSubscriber::new();
    dispatcher.subscribe("risk", before.clone()).unwrap();
    dispatcher.subscribe("risk", PanickingSubscriber).unwrap();
    dispatcher.subscribe("risk", after.clone()).unwrap();

    let report = dispatcher.dispatch(&risk_event(1.0));

    assert_eq!(report.failed, 1);
    assert_eq!(before.count(), 1);
    assert_eq!(after.count(), 1);
}

#[test]
fn test_delivery_follows_subscription_order() {
    let dispatcher = EventDispatcher::new();
    let order = Arc::new(Mutex::new(Vec::new()));

    for name in ["a", "b", "c", "d"] {
        let order = order.clone();
        dispatcher
            .subscribe("risk", move |_: &DomainEvent| -> Result<(), SubscriberError> {
                order.lock().unwrap().push(name);
                Ok(())
            })
            .unwrap();
    }

    dispatcher.dispatch(&risk_event(0.1));
    assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c", "d"]);
}

#[test]
fn test_events_without_subscribers_are_discarded() {
    let dispatcher = EventDispatcher::new();
    let recorder = RecordingSubscriber::new();
    dispatcher.subscribe("alert", recorder.clone()).unwrap();

    let report = dispatcher.dispatch(&risk_event(0.3));

    assert!(report.is_empty());
    assert_eq!(recorder.count(), 0);
}

#[test]
fn test_unsubscribe_during_dispatch_applies_to_next_event() {
    let dispatcher = Arc::new(EventDispatcher::new());
    let victim = RecordingSubscriber::new();
    let victim_id = Arc::new(Mutex::new(None));

    let remover = {
        let dispatcher = Arc::downgrade(&dispatcher);
        let victim_id = victim_id.clone();
        move |_: &DomainEvent| -> Result<(), SubscriberError> {
            let target = *victim_id.lock().unwrap();
            if let (Some(dispatcher), Some(id)) = (dispatcher.upgrade(), target) {
                dispatcher.unsubscribe(id);
            }
            Ok(())
        }
    };
    dispatcher.subscribe("risk", remover).unwrap();
    *victim_id.lock().unwrap() = Some(dispatcher.subscribe("risk", victim.clone()).unwrap());

    // The in-flight snapshot still includes the victim
    dispatcher.dispatch(&risk_event(0.1));
    assert_eq!(victim.count(), 1);

    dispatcher.dispatch(&risk_event(0.2));
    assert_eq!(victim.count(), 1);
    assert_eq!(dispatcher.subscriber_count("risk"), 1);
}

#[test]
fn test_unsubscribe_removes_exactly_one_registration() {
    let dispatcher = EventDispatcher::new();
    let recorder = RecordingSubscriber::new();
    let first = dispatcher.subscribe("risk", recorder.clone()).unwrap();
    dispatcher.subscribe("risk", recorder.clone()).unwrap();

    assert!(dispatcher.unsubscribe(first));
    assert!(!dispatcher.unsubscribe(first));

    dispatcher.dispatch(&risk_event(0.4));
    assert_eq!(recorder.count(), 1);
}
