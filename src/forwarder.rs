//! Per-path forwarding.
//!
//! A [`Forwarder`] owns one transport subscription on a concrete path and
//! broadcasts every message it receives to the views currently interested
//! in that path.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use crate::error::{lock_err, ViewResult};
use crate::pool::{WorkerPool, WorkerPoolHandle};
use crate::transport::{Message, Subscription, SubscriptionId, Transport};
use crate::view::{View, ViewId};

type Interest = Arc<Mutex<HashMap<ViewId, Arc<View>>>>;

fn broadcast(interest: &Interest, msg: &Arc<Message>) -> ViewResult<usize> {
    let targets: Vec<Arc<View>> = {
        let guard = interest.lock().map_err(|_| lock_err("forwarder interest"))?;
        guard.values().cloned().collect()
    };
    Ok(targets.iter().filter(|v| v.deliver(msg)).count())
}

/// One live subscription bound to one path, plus the views interested in it.
#[derive(Debug)]
pub struct Forwarder {
    path: String,
    subscription_id: SubscriptionId,
    interest: Interest,
    workers: Mutex<Option<WorkerPoolHandle>>,
}

impl Forwarder {
    /// Start draining `subscription` with `workers` threads.
    pub(crate) fn start(path: impl Into<String>, subscription: Subscription, workers: usize) -> ViewResult<Arc<Self>> {
        let path = path.into();
        let interest: Interest = Arc::new(Mutex::new(HashMap::new()));

        let pool_interest = Arc::clone(&interest);
        let pool_path = path.clone();
        let handle = WorkerPool::new(
            "metaview-fwd",
            subscription.receiver().clone(),
            move |msg: Arc<Message>| {
                if let Err(e) = broadcast(&pool_interest, &msg) {
                    debug!(path = %pool_path, error = %e, "forward failed");
                }
            },
            workers,
        )
        .start()?;

        Ok(Arc::new(Self {
            path,
            subscription_id: subscription.id(),
            interest,
            workers: Mutex::new(Some(handle)),
        }))
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub const fn subscription_id(&self) -> SubscriptionId {
        self.subscription_id
    }

    /// Add views to the interest set. Adding a view twice is a no-op.
    pub fn add_views(&self, views: &[Arc<View>]) -> ViewResult<()> {
        let mut guard = self.interest.lock().map_err(|_| lock_err("forwarder interest"))?;
        for v in views {
            guard.entry(v.id()).or_insert_with(|| Arc::clone(v));
        }
        Ok(())
    }

    /// Remove views from the interest set and return how many remain.
    pub fn remove_views(&self, views: &[Arc<View>]) -> ViewResult<usize> {
        let mut guard = self.interest.lock().map_err(|_| lock_err("forwarder interest"))?;
        for v in views {
            guard.remove(&v.id());
        }
        Ok(guard.len())
    }

    /// Push an already-seen message to every interested view. Returns the
    /// number of views that accepted it.
    pub fn send(&self, msg: &Arc<Message>) -> ViewResult<usize> {
        broadcast(&self.interest, msg)
    }

    /// Ids of the interested views.
    pub fn interest(&self) -> ViewResult<Vec<ViewId>> {
        let guard = self.interest.lock().map_err(|_| lock_err("forwarder interest"))?;
        Ok(guard.keys().copied().collect())
    }

    /// Tear down the transport subscription. The workers exit once the
    /// stream disconnects.
    pub(crate) fn close(&self, transport: &dyn Transport) {
        transport.unsubscribe(self.subscription_id);
        if let Ok(mut workers) = self.workers.lock() {
            workers.take();
        }
        if let Ok(mut guard) = self.interest.lock() {
            guard.clear();
        }
        info!(path = %self.path, "stopped forwarding");
    }
}
