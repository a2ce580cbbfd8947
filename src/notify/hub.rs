//! Subscription index and best-effort delivery

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde::Serialize;

use super::{Event, Transport};

struct Subscriber {
    transport: Arc<dyn Transport>,
    keys: Vec<String>,
    groups: Vec<String>,
}

#[derive(Default)]
struct Index {
    subscribers: HashMap<String, Subscriber>,
    by_key: HashMap<String, HashSet<String>>,
    by_group: HashMap<String, HashSet<String>>,
}

impl Index {
    fn remove(&mut self, id: &str) -> Option<Subscriber> {
        let sub = self.subscribers.remove(id)?;
        for key in &sub.keys {
            if let Some(ids) = self.by_key.get_mut(key) {
                ids.remove(id);
                if ids.is_empty() {
                    self.by_key.remove(key);
                }
            }
        }
        for group in &sub.groups {
            if let Some(ids) = self.by_group.get_mut(group) {
                ids.remove(id);
                if ids.is_empty() {
                    self.by_group.remove(group);
                }
            }
        }
        Some(sub)
    }
}

/// Outcome of one publish or broadcast
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Subscribers that received the event
    pub delivered: usize,
    /// Subscribers dropped because their send failed or timed out
    pub dropped: usize,
}

/// Subscriber counts for diagnostics
#[derive(Debug, Clone, Default, Serialize)]
pub struct SubscriptionStats {
    pub total: usize,
    pub by_key: HashMap<String, usize>,
    pub by_group: HashMap<String, usize>,
}

/// Pub/sub fan-out over subscriber transports
///
/// Subscribers are indexed by the device keys and groups they asked for. A
/// subscriber with neither receives broadcasts only.
pub struct NotificationHub {
    index: RwLock<Index>,
    send_timeout: Duration,
}

impl NotificationHub {
    /// Create a hub with the given per-send timeout
    #[must_use]
    pub fn new(send_timeout: Duration) -> Self {
        Self {
            index: RwLock::new(Index::default()),
            send_timeout,
        }
    }

    /// Register a transport, replacing any earlier registration with its id
    pub fn subscribe(&self, transport: Arc<dyn Transport>, keys: Vec<String>, groups: Vec<String>) {
        let id = transport.id().to_string();
        let mut index = self.index.write().unwrap_or_else(PoisonError::into_inner);
        index.remove(&id);

        for key in &keys {
            index.by_key.entry(key.clone()).or_default().insert(id.clone());
        }
        for group in &groups {
            index
                .by_group
                .entry(group.clone())
                .or_default()
                .insert(id.clone());
        }

        tracing::debug!(subscriber = %id, ?keys, ?groups, "subscribed");
        index.subscribers.insert(
            id,
            Subscriber {
                transport,
                keys,
                groups,
            },
        );
    }

    /// Drop a subscriber from every index, returning whether it was known
    ///
    /// The transport itself is left open; callers that own it close it.
    pub fn unsubscribe(&self, transport_id: &str) -> bool {
        let removed = self
            .index
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(transport_id)
            .is_some();

        if removed {
            tracing::debug!(subscriber = transport_id, "unsubscribed");
        }
        removed
    }

    /// Deliver an event to subscribers of its key or group
    pub async fn publish(&self, event: &Event) -> PublishReport {
        let targets = {
            let index = self.index.read().unwrap_or_else(PoisonError::into_inner);
            let mut ids: HashSet<&String> = HashSet::new();
            if let Some(key) = &event.key {
                ids.extend(index.by_key.get(key).into_iter().flatten());
            }
            if let Some(group) = &event.group {
                ids.extend(index.by_group.get(group).into_iter().flatten());
            }
            ids.into_iter()
                .filter_map(|id| index.subscribers.get(id))
                .map(|s| Arc::clone(&s.transport))
                .collect::<Vec<_>>()
        };

        self.deliver(event, targets).await
    }

    /// Deliver an event to every subscriber regardless of filters
    pub async fn broadcast(&self, event: &Event) -> PublishReport {
        let targets = self
            .index
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .subscribers
            .values()
            .map(|s| Arc::clone(&s.transport))
            .collect::<Vec<_>>();

        self.deliver(event, targets).await
    }

    async fn deliver(&self, event: &Event, targets: Vec<Arc<dyn Transport>>) -> PublishReport {
        if targets.is_empty() {
            return PublishReport::default();
        }

        let payload = match serde_json::to_string(event) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize event");
                return PublishReport::default();
            }
        };

        let sends = targets.iter().map(|transport| {
            let payload = payload.as_str();
            async move {
                match tokio::time::timeout(self.send_timeout, transport.send(payload)).await {
                    Ok(Ok(())) => None,
                    Ok(Err(e)) => {
                        tracing::warn!(subscriber = transport.id(), error = %e, "send failed");
                        Some(Arc::clone(transport))
                    }
                    Err(_) => {
                        tracing::warn!(subscriber = transport.id(), "send timed out");
                        Some(Arc::clone(transport))
                    }
                }
            }
        });

        let failed: Vec<_> = futures::future::join_all(sends)
            .await
            .into_iter()
            .flatten()
            .collect();

        for transport in &failed {
            self.unsubscribe(transport.id());
            transport.close().await;
        }

        PublishReport {
            delivered: targets.len() - failed.len(),
            dropped: failed.len(),
        }
    }

    /// Close and forget every subscriber
    pub async fn close_all(&self) {
        let subscribers: Vec<_> = {
            let mut index = self.index.write().unwrap_or_else(PoisonError::into_inner);
            index.by_key.clear();
            index.by_group.clear();
            index.subscribers.drain().map(|(_, s)| s.transport).collect()
        };

        let count = subscribers.len();
        futures::future::join_all(subscribers.iter().map(|t| t.close())).await;
        tracing::info!(count, "closed all subscribers");
    }

    /// Number of registered subscribers
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.index
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .subscribers
            .len()
    }

    /// Subscriber counts by key and by group
    #[must_use]
    pub fn stats(&self) -> SubscriptionStats {
        let index = self.index.read().unwrap_or_else(PoisonError::into_inner);
        SubscriptionStats {
            total: index.subscribers.len(),
            by_key: index
                .by_key
                .iter()
                .map(|(k, ids)| (k.clone(), ids.len()))
                .collect(),
            by_group: index
                .by_group
                .iter()
                .map(|(g, ids)| (g.clone(), ids.len()))
                .collect(),
        }
    }
}
