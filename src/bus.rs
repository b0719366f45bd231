//! Named-topic publish/subscribe event backbone.
//!
//! Every other component notifies through the bus instead of reaching into
//! another's internals. Delivery of one [`EventBus::publish`] call is
//! concurrent across handlers and completes (each handler independently,
//! success or failure) before the call returns. Handler failures are
//! logged, never propagated.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

/// Catch-all topic: subscribers here receive every published event.
pub const CATCH_ALL: &str = "*";

/// Number of recent events retained for introspection.
const HISTORY_CAPACITY: usize = 200;

/// An immutable published event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Topic the event was published under.
    pub topic: String,
    /// Opaque payload.
    pub payload: serde_json::Value,
    /// Identifier of the publishing component.
    pub sender: String,
    /// Publish time.
    pub timestamp: DateTime<Utc>,
}

/// Handler for published events.
///
/// Subscribers are registered as `Arc<dyn Subscriber>`; the bus
/// deduplicates by `Arc` identity, so re-subscribing the same handler to
/// the same topic is a no-op.
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Handle one delivered event. Errors and panics are caught by the bus.
    async fn on_event(&self, event: Event);
}

/// Ticket identifying a subscription on a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionTicket(String);

impl std::fmt::Display for SubscriptionTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Default)]
struct BusState {
    subscribers: HashMap<String, Vec<Arc<dyn Subscriber>>>,
    history: VecDeque<Event>,
    topic_counts: HashMap<String, u64>,
}

/// Publish/subscribe bus with bounded recent-event history.
#[derive(Default)]
pub struct EventBus {
    state: RwLock<BusState>,
}

impl EventBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a handler to a topic.
    ///
    /// Subscribing the same `Arc` handler to the same topic twice returns
    /// the previously issued ticket without registering a duplicate.
    pub async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn Subscriber>,
    ) -> SubscriptionTicket {
        let mut state = self.state.write().await;
        let handlers = state.subscribers.entry(topic.to_owned()).or_default();

        for (idx, existing) in handlers.iter().enumerate() {
            if Arc::ptr_eq(existing, &handler) {
                return SubscriptionTicket(format!("{topic}_{}", idx.saturating_add(1)));
            }
        }

        handlers.push(handler);
        SubscriptionTicket(format!("{topic}_{}", handlers.len()))
    }

    /// Publish an event and wait for every handler invocation of this call
    /// to finish. Individual handler failures are logged, never surfaced.
    ///
    /// Publishing to a topic with no subscribers is a safe no-op (the event
    /// is still recorded in history).
    pub async fn publish(&self, topic: &str, payload: serde_json::Value, sender: &str) {
        let event = Event {
            topic: topic.to_owned(),
            payload,
            sender: sender.to_owned(),
            timestamp: Utc::now(),
        };

        let handlers = {
            let mut state = self.state.write().await;
            state.history.push_back(event.clone());
            while state.history.len() > HISTORY_CAPACITY {
                state.history.pop_front();
            }
            let count = state.topic_counts.entry(topic.to_owned()).or_insert(0);
            *count = count.saturating_add(1);

            let mut snapshot: Vec<Arc<dyn Subscriber>> = Vec::new();
            if let Some(direct) = state.subscribers.get(topic) {
                snapshot.extend(direct.iter().cloned());
            }
            if let Some(catch_all) = state.subscribers.get(CATCH_ALL) {
                snapshot.extend(catch_all.iter().cloned());
            }
            snapshot
        };

        if handlers.is_empty() {
            debug!(topic, "published event with no subscribers");
            return;
        }

        let mut deliveries = JoinSet::new();
        for handler in handlers {
            let event = event.clone();
            deliveries.spawn(async move { handler.on_event(event).await });
        }
        while let Some(joined) = deliveries.join_next().await {
            if let Err(e) = joined {
                error!(topic, error = %e, "event handler failed");
            }
        }
    }

    /// Fire-and-forget publish for contexts that cannot await delivery.
    ///
    /// Schedules delivery on the current Tokio runtime when one is
    /// reachable, otherwise runs delivery to completion on a throwaway
    /// current-thread runtime. Never panics regardless of delivery outcome.
    pub fn publish_detached(self: &Arc<Self>, topic: &str, payload: serde_json::Value, sender: &str) {
        let bus = Arc::clone(self);
        let topic = topic.to_owned();
        let sender = sender.to_owned();

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                bus.publish(&topic, payload, &sender).await;
            });
            return;
        }

        match tokio::runtime::Builder::new_current_thread().enable_all().build() {
            Ok(runtime) => {
                runtime.block_on(bus.publish(&topic, payload, &sender));
            }
            Err(e) => {
                warn!(topic, error = %e, "detached publish dropped: no runtime available");
            }
        }
    }

    /// The most recent events, newest last, at most `n`.
    pub async fn recent(&self, n: usize) -> Vec<Event> {
        let state = self.state.read().await;
        let len = state.history.len();
        state
            .history
            .iter()
            .skip(len.saturating_sub(n))
            .cloned()
            .collect()
    }

    /// How many events have been published on a topic.
    pub async fn topic_count(&self, topic: &str) -> u64 {
        let state = self.state.read().await;
        state.topic_counts.get(topic).copied().unwrap_or(0)
    }
}
