//! Topic-keyed subscriber registry and fan-out
//!
//! Subscriber lists are held behind `Arc` so a dispatch takes a snapshot by
//! cloning a pointer. `subscribe`/`unsubscribe` copy the list only when a
//! dispatch is holding the old one, which keeps the in-flight iteration
//! untouched while registry changes apply from the next event on.

use crate::error::SubscriberError;
use crate::protocol::{normalize_topic, DomainEvent, TopicError};
use serde::Serialize;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Receives decoded events for the topics it is registered on
pub trait Subscriber: Send + Sync {
    fn on_event(&self, event: &DomainEvent) -> Result<(), SubscriberError>;
}

impl<F> Subscriber for F
where
    F: Fn(&DomainEvent) -> Result<(), SubscriberError> + Send + Sync,
{
    fn on_event(&self, event: &DomainEvent) -> Result<(), SubscriberError> {
        self(event)
    }
}

/// Opaque handle returned by `subscribe`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Outcome of one fan-out
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
}

impl DispatchReport {
    pub fn is_empty(&self) -> bool {
        self.delivered == 0 && self.failed == 0
    }
}

#[derive(Clone)]
struct Registration {
    id: SubscriptionId,
    subscriber: Arc<dyn Subscriber>,
}

#[derive(Default)]
struct Registry {
    topics: HashMap<String, Arc<Vec<Registration>>>,
    index: HashMap<SubscriptionId, String>,
}

/// Subscriber registry shared between the facade and the driver task
#[derive(Default)]
pub struct EventDispatcher {
    registry: Mutex<Registry>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        // Subscriber code never runs under this lock, so a poisoned guard
        // still holds a consistent registry
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `subscriber` on `topic`; delivery order follows registration order
    pub fn subscribe<S>(&self, topic: &str, subscriber: S) -> Result<SubscriptionId, TopicError>
    where
        S: Subscriber + 'static,
    {
        let topic = normalize_topic(topic)?;
        let id = SubscriptionId::new();

        let mut registry = self.registry();
        let list = registry.topics.entry(topic.clone()).or_default();
        Arc::make_mut(list).push(Registration {
            id,
            subscriber: Arc::new(subscriber),
        });
        registry.index.insert(id, topic.clone());
        drop(registry);

        debug!(subscription_id = %id, topic = %topic, "Subscriber registered");
        Ok(id)
    }

    /// Remove exactly one registration; false if the id is unknown
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut registry = self.registry();
        let Some(topic) = registry.index.remove(&id) else {
            return false;
        };

        let now_empty = match registry.topics.get_mut(&topic) {
            Some(list) => {
                Arc::make_mut(list).retain(|registration| registration.id != id);
                list.is_empty()
            }
            None => false,
        };
        if now_empty {
            registry.topics.remove(&topic);
        }
        drop(registry);

        debug!(subscription_id = %id, topic = %topic, "Subscriber removed");
        true
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.registry()
            .topics
            .get(topic)
            .map_or(0, |list| list.len())
    }

    pub fn total_subscribers(&self) -> usize {
        self.registry().index.len()
    }

    /// Topics with at least one subscriber, sorted
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.registry().topics.keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Deliver `event` to every subscriber of its topic, in registration order
    ///
    /// A subscriber that returns an error or panics is logged and counted;
    /// delivery continues with the next one.
    pub fn dispatch(&self, event: &DomainEvent) -> DispatchReport {
        let snapshot = self.registry().topics.get(&event.topic).cloned();
        let Some(subscribers) = snapshot else {
            trace!(topic = %event.topic, "No subscribers for topic, discarding event");
            return DispatchReport::default();
        };

        let span = crate::dispatch_span!(topic = %event.topic, subscribers = subscribers.len());
        let _guard = span.enter();

        let mut report = DispatchReport::default();
        for registration in subscribers.iter() {
            let outcome =
                catch_unwind(AssertUnwindSafe(|| registration.subscriber.on_event(event)));
            match outcome {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(e)) => {
                    report.failed += 1;
                    warn!(
                        subscription_id = %registration.id,
                        topic = %event.topic,
                        error = %e,
                        "Subscriber callback failed"
                    );
                }
                Err(panic) => {
                    report.failed += 1;
                    warn!(
                        subscription_id = %registration.id,
                        topic = %event.topic,
                        panic = %panic_message(panic.as_ref()),
                        "Subscriber callback panicked"
                    );
                }
            }
        }
        report
    }
}

impl fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("topics", &self.topics())
            .field("subscribers", &self.total_subscribers())
            .finish()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
