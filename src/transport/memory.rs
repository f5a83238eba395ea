//! In-process transport.
//!
//! Routes published messages to matching subscriptions and retains the
//! latest message per metadata topic so that `query` can replay it. Used
//! for embedded deployments and tests.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::debug;

use crate::error::TransportError;

use super::{topic_matches, Message, Subscription, SubscriptionId, Transport};

const META_MARKER: &str = "/!meta/";

fn poisoned(path: &str) -> TransportError {
    TransportError::Disconnected {
        path: format!("poisoned lock: {path}"),
    }
}

#[derive(Debug)]
struct Subscriber {
    pattern: String,
    tx: Sender<Arc<Message>>,
}

/// A queued failure, optionally restricted to one exact topic pattern.
type Injected = (Option<String>, TransportError);

#[derive(Debug, Default)]
struct InjectedFailures {
    resolve: VecDeque<TransportError>,
    subscribe: VecDeque<Injected>,
    query: VecDeque<Injected>,
}

fn take_for(queue: &mut VecDeque<Injected>, topic: &str) -> Option<TransportError> {
    let pos = queue
        .iter()
        .position(|(only, _)| only.as_deref().map_or(true, |t| t == topic))?;
    queue.remove(pos).map(|(_, err)| err)
}

/// Thread-safe in-memory [`Transport`].
#[derive(Debug, Default)]
pub struct InMemoryTransport {
    aliases: RwLock<HashMap<String, String>>,
    subscribers: RwLock<HashMap<SubscriptionId, Subscriber>>,
    retained: RwLock<BTreeMap<String, Arc<Message>>>,
    failures: Mutex<InjectedFailures>,
    subscribe_calls: AtomicU64,
    query_calls: AtomicU64,
}

impl InMemoryTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `alias` to `identity` for [`Transport::resolve_namespace_identity`].
    pub fn register_alias(&self, alias: impl Into<String>, identity: impl Into<String>) {
        if let Ok(mut aliases) = self.aliases.write() {
            aliases.insert(alias.into(), identity.into());
        }
    }

    /// Make the next `resolve_namespace_identity` call fail with `err`.
    pub fn fail_next_resolve(&self, err: TransportError) {
        if let Ok(mut f) = self.failures.lock() {
            f.resolve.push_back(err);
        }
    }

    /// Make the next `subscribe` call fail with `err`.
    pub fn fail_next_subscribe(&self, err: TransportError) {
        if let Ok(mut f) = self.failures.lock() {
            f.subscribe.push_back((None, err));
        }
    }

    /// Make the next `subscribe` call on exactly `topic` fail with `err`.
    pub fn fail_subscribe_to(&self, topic: impl Into<String>, err: TransportError) {
        if let Ok(mut f) = self.failures.lock() {
            f.subscribe.push_back((Some(topic.into()), err));
        }
    }

    /// Make the next `query` call fail with `err`.
    pub fn fail_next_query(&self, err: TransportError) {
        if let Ok(mut f) = self.failures.lock() {
            f.query.push_back((None, err));
        }
    }

    /// Make the next `query` call on exactly `topic` fail with `err`.
    pub fn fail_query_to(&self, topic: impl Into<String>, err: TransportError) {
        if let Ok(mut f) = self.failures.lock() {
            f.query.push_back((Some(topic.into()), err));
        }
    }

    /// Number of `subscribe` calls made, including failed ones.
    #[must_use]
    pub fn subscribe_calls(&self) -> u64 {
        self.subscribe_calls.load(Ordering::Relaxed)
    }

    /// Number of `query` calls made, including failed ones.
    #[must_use]
    pub fn query_calls(&self) -> u64 {
        self.query_calls.load(Ordering::Relaxed)
    }

    /// Number of subscriptions currently live.
    #[must_use]
    pub fn active_subscriptions(&self) -> usize {
        self.subscribers.read().map(|s| s.len()).unwrap_or(0)
    }

    /// Number of live subscriptions whose pattern is exactly `pattern`.
    #[must_use]
    pub fn subscriptions_on(&self, pattern: &str) -> usize {
        self.subscribers
            .read()
            .map(|s| s.values().filter(|sub| sub.pattern == pattern).count())
            .unwrap_or(0)
    }

    fn take_failure(&self, pick: impl FnOnce(&mut InjectedFailures) -> Option<TransportError>) -> Option<TransportError> {
        self.failures.lock().ok().and_then(|mut f| pick(&mut f))
    }
}

impl Transport for InMemoryTransport {
    fn resolve_namespace_identity(&self, alias: &str) -> Result<String, TransportError> {
        if let Some(err) = self.take_failure(|f| f.resolve.pop_front()) {
            return Err(err);
        }
        let aliases = self.aliases.read().map_err(|_| poisoned("aliases"))?;
        Ok(aliases
            .get(alias)
            .cloned()
            .unwrap_or_else(|| alias.trim_matches('/').to_string()))
    }

    fn subscribe(&self, topic_pattern: &str) -> Result<Subscription, TransportError> {
        self.subscribe_calls.fetch_add(1, Ordering::Relaxed);
        if let Some(err) = self.take_failure(|f| take_for(&mut f.subscribe, topic_pattern)) {
            return Err(err);
        }

        let (tx, rx) = unbounded();
        let id = SubscriptionId::new();
        self.subscribers
            .write()
            .map_err(|_| poisoned("subscribers"))?
            .insert(
                id,
                Subscriber {
                    pattern: topic_pattern.to_string(),
                    tx,
                },
            );
        debug!(%id, topic = topic_pattern, "transport subscription opened");
        Ok(Subscription::new(id, topic_pattern, rx))
    }

    fn query(&self, topic_pattern: &str) -> Result<Receiver<Arc<Message>>, TransportError> {
        self.query_calls.fetch_add(1, Ordering::Relaxed);
        if let Some(err) = self.take_failure(|f| take_for(&mut f.query, topic_pattern)) {
            return Err(err);
        }

        let retained = self.retained.read().map_err(|_| poisoned("retained"))?;
        let (tx, rx) = unbounded();
        for msg in retained.values().filter(|m| topic_matches(topic_pattern, &m.topic)) {
            // The receiver is still held locally, so this cannot fail.
            let _ = tx.send(Arc::clone(msg));
        }
        Ok(rx)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        if let Ok(mut subs) = self.subscribers.write() {
            if subs.remove(&id).is_some() {
                debug!(%id, "transport subscription closed");
            }
        }
    }

    fn publish(&self, message: Message) -> Result<(), TransportError> {
        let message = Arc::new(message);

        if message.topic.contains(META_MARKER) {
            let mut retained = self.retained.write().map_err(|_| TransportError::PublishFailed {
                topic: message.topic.clone(),
                message: "poisoned lock: retained".to_string(),
            })?;
            if message.is_empty() {
                retained.remove(&message.topic);
            } else {
                retained.insert(message.topic.clone(), Arc::clone(&message));
            }
        }

        let targets: Vec<Sender<Arc<Message>>> = {
            let subs = self.subscribers.read().map_err(|_| TransportError::PublishFailed {
                topic: message.topic.clone(),
                message: "poisoned lock: subscribers".to_string(),
            })?;
            subs.values()
                .filter(|s| topic_matches(&s.pattern, &message.topic))
                .map(|s| s.tx.clone())
                .collect()
        };

        for tx in targets {
            // A dropped receiver only means the consumer went away.
            let _ = tx.send(Arc::clone(&message));
        }
        Ok(())
    }
}
