//! Live Update Channel: fans message events out to the subscribers of a conversation key.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{ChatError, Result};
use crate::key::ConversationKey;
use crate::models::Message;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LiveEvent {
    Created {
        key: ConversationKey,
        message: Message,
    },
    Deleted {
        key: ConversationKey,
        message_id: String,
    },
}

impl LiveEvent {
    pub fn key(&self) -> &ConversationKey {
        match self {
            LiveEvent::Created { key, .. } | LiveEvent::Deleted { key, .. } => key,
        }
    }
}

/// Receiving end of a subscription
pub trait EventSink: Send + Sync {
    fn deliver(&self, event: &LiveEvent) -> Result<()>;
}

impl EventSink for mpsc::UnboundedSender<LiveEvent> {
    fn deliver(&self, event: &LiveEvent) -> Result<()> {
        self.send(event.clone())
            .map_err(|_| ChatError::Transport("subscriber channel closed".to_string()))
    }
}

struct Subscriber {
    id: u64,
    sink: Arc<dyn EventSink>,
}

/// Subscription registry, keyed by conversation
pub struct LiveChannel {
    subscribers: DashMap<ConversationKey, Vec<Subscriber>>,
    next_id: AtomicU64,
}

impl LiveChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            subscribers: DashMap::new(),
            next_id: AtomicU64::new(1),
        })
    }

    /// Register `sink` for future events on `key`. Nothing published earlier is replayed.
    pub fn subscribe(self: &Arc<Self>, key: ConversationKey, sink: Arc<dyn EventSink>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .entry(key.clone())
            .or_default()
            .push(Subscriber { id, sink });
        debug!(key = %key, subscription = id, "Subscribed");

        Subscription {
            id,
            key,
            channel: Arc::downgrade(self),
            active: AtomicBool::new(true),
        }
    }

    /// Deliver to every current subscriber of the event's key, returning how many were reached.
    ///
    /// Sinks that fail are logged and pruned; publish itself never fails.
    pub fn publish(&self, event: &LiveEvent) -> usize {
        let key = event.key();
        let mut delivered = 0;
        let mut dead = Vec::new();

        // Holding the shard guard keeps the subscriber set stable for this publish
        if let Some(subscribers) = self.subscribers.get(key) {
            for subscriber in subscribers.iter() {
                match subscriber.sink.deliver(event) {
                    Ok(()) => delivered += 1,
                    Err(e) => {
                        warn!(key = %key, subscription = subscriber.id, error = %e, "Dropping subscriber");
                        dead.push(subscriber.id);
                    }
                }
            }
        }

        for id in dead {
            self.remove(key, id);
        }
        delivered
    }

    pub fn subscriber_count(&self, key: &ConversationKey) -> usize {
        self.subscribers.get(key).map(|s| s.len()).unwrap_or(0)
    }

    pub fn active_keys(&self) -> usize {
        self.subscribers.len()
    }

    fn remove(&self, key: &ConversationKey, id: u64) {
        if let Some(mut entry) = self.subscribers.get_mut(key) {
            entry.retain(|s| s.id != id);
            if entry.is_empty() {
                drop(entry);
                self.subscribers.remove_if(key, |_, subs| subs.is_empty());
            }
        }
    }
}

/// Handle returned by [`LiveChannel::subscribe`]
pub struct Subscription {
    id: u64,
    key: ConversationKey,
    channel: Weak<LiveChannel>,
    active: AtomicBool,
}

impl Subscription {
    pub fn key(&self) -> &ConversationKey {
        &self.key
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Idempotent; a torn-down channel is fine too
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(channel) = self.channel.upgrade() {
            channel.remove(&self.key, self.id);
            debug!(key = %self.key, subscription = self.id, "Unsubscribed");
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
