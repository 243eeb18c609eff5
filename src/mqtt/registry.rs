use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use log::{debug, error, warn};

use super::transport::MqttTransport;
use super::{Callback, InboundMessage};

pub type SubscriptionId = u64;

struct Subscriber {
    id: SubscriptionId,
    callback: Callback,
}

struct Inner {
    calls: HashMap<String, Vec<Subscriber>>,
    /* true while the transport mirrors the topic set */
    online: bool,
    /* topics whose subscribe or unsubscribe the transport rejected */
    pending: HashSet<String>,
}

/// Topic level deduplication and fan out of inbound messages.
///
/// The transport is subscribed to a topic exactly while at least one callback
/// is registered for it. While offline only the map changes, the next
/// `resubscribe_all` brings the transport back in line. Requests the
/// transport rejects while online are kept as pending until `retry_pending`
/// gets them through.
pub struct SubscriptionRegistry {
    inner: RwLock<Inner>,
    next_id: AtomicU64,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        return SubscriptionRegistry {
            inner: RwLock::new(Inner { calls: HashMap::new(), online: false, pending: HashSet::new() }),
            next_id: AtomicU64::new(1),
        };
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        return self.inner.read().unwrap_or_else(|e| e.into_inner());
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        return self.inner.write().unwrap_or_else(|e| e.into_inner());
    }

    pub fn add(&self, transport: &dyn MqttTransport, topic: &str, callback: Callback) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.write();

        let subscribers = inner.calls.entry(topic.to_string()).or_default();
        subscribers.push(Subscriber { id, callback });

        if subscribers.len() == 1 {
            debug!("Adding new callback list for topic {topic}");
            /* A rejected unsubscribe left the broker subscribed already */
            if inner.online && !inner.pending.remove(topic) {
                if let Err(e) = transport.subscribe(topic) {
                    warn!("Subscribing to {topic} failed, retrying later: {e}");
                    inner.pending.insert(topic.to_string());
                }
            }
        } else {
            debug!("Adding callback {id} to known topic {topic}");
        }

        return id;
    }

    /// Returns false if the id was not registered under the topic
    pub fn remove(&self, transport: &dyn MqttTransport, topic: &str, id: SubscriptionId) -> bool {
        let mut inner = self.write();

        let Some(subscribers) = inner.calls.get_mut(topic) else {
            return false;
        };

        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        if subscribers.len() == before {
            return false;
        }

        if subscribers.is_empty() {
            inner.calls.remove(topic);
            debug!("Last callback for {topic} removed");
            /* A rejected subscribe never reached the broker */
            if inner.online && !inner.pending.remove(topic) {
                if let Err(e) = transport.unsubscribe(topic) {
                    warn!("Unsubscribing from {topic} failed, retrying later: {e}");
                    inner.pending.insert(topic.to_string());
                }
            }
        }

        return true;
    }

    /// Invoke every callback registered for the exact topic, in registration
    /// order. Returns the number of callbacks that were run.
    pub fn dispatch(&self, message: &InboundMessage) -> usize {
        /* Copy the callbacks out so they can attach and detach themselves */
        let callbacks: Vec<(SubscriptionId, Callback)> = match self.read().calls.get(&message.topic) {
            Some(subscribers) => subscribers.iter().map(|s| (s.id, Arc::clone(&s.callback))).collect(),
            None => {
                debug!("Received data for unknown topic {}", message.topic);
                return 0;
            }
        };

        for (id, callback) in callbacks.iter() {
            match catch_unwind(AssertUnwindSafe(|| callback(message))) {
                Ok(Ok(())) => {},
                Ok(Err(e)) => {
                    warn!("Callback {id} on {} failed: {e}", message.topic);
                },
                Err(_) => {
                    error!("Callback {id} on {} panicked", message.topic);
                }
            }
        }

        return callbacks.len();
    }

    /// Subscribe every topic with a live callback once and mark the registry
    /// online. Called after each successful (re)connect.
    /// Topics the transport rejects are left pending for `retry_pending`.
    pub fn resubscribe_all(&self, transport: &dyn MqttTransport) -> usize {
        let mut guard = self.write();
        let inner = &mut *guard;
        inner.online = true;
        /* Clean session, whatever was pending before is gone on the broker */
        inner.pending.clear();

        let mut count = 0;
        for topic in inner.calls.keys() {
            match transport.subscribe(topic) {
                Ok(_) => { count += 1; },
                Err(e) => {
                    debug!("Resubscribing {topic} failed, retrying later: {e}");
                    inner.pending.insert(topic.clone());
                }
            }
        }

        if !inner.pending.is_empty() {
            warn!("{} of {} topics could not be resubscribed yet", inner.pending.len(), inner.calls.len());
        }
        return count;
    }

    /// Send the requests the transport rejected earlier. Stops at the first
    /// rejection since the request queue is still full then. Returns the
    /// number of topics still pending.
    pub fn retry_pending(&self, transport: &dyn MqttTransport) -> usize {
        let mut guard = self.write();
        let inner = &mut *guard;
        if !inner.online || inner.pending.is_empty() {
            return inner.pending.len();
        }

        let topics: Vec<String> = inner.pending.iter().cloned().collect();
        for topic in topics {
            let wanted = inner.calls.contains_key(&topic);
            let result = if wanted { transport.subscribe(&topic) } else { transport.unsubscribe(&topic) };
            match result {
                Ok(_) => {
                    debug!("Pending {} of {topic} sent", if wanted { "subscribe" } else { "unsubscribe" });
                    inner.pending.remove(&topic);
                },
                Err(e) => {
                    debug!("Retrying {topic} failed: {e}");
                    break;
                }
            }
        }

        return inner.pending.len();
    }

    /// The broker forgot our subscriptions, stop mirroring until the next connect
    pub fn mark_offline(&self) {
        let mut inner = self.write();
        inner.online = false;
        inner.pending.clear();
    }

    pub fn pending(&self) -> usize {
        return self.read().pending.len();
    }

    pub fn is_online(&self) -> bool {
        return self.read().online;
    }

    pub fn topics(&self) -> Vec<String> {
        return self.read().calls.keys().cloned().collect();
    }

    pub fn callback_count(&self, topic: &str) -> usize {
        return self.read().calls.get(topic).map(|s| s.len()).unwrap_or(0);
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        return SubscriptionRegistry::new();
    }
}
