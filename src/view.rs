//! Views: registered expressions and the paths they currently match.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{lock_err, TransportError, ViewResult};
use crate::expression::{Expression, ExpressionHash};
use crate::transport::Message;

/// Unique identifier for a view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ViewId(Uuid);

impl ViewId {
    /// Creates a new random view ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ViewId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ViewId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Path → currently matched.
pub type MatchSet = HashMap<String, bool>;

/// A live registration of one expression.
///
/// The match set has its own lock: reconciliation writes it while lookups
/// ask whether a path is matched.
#[derive(Debug)]
pub struct View {
    id: ViewId,
    expression: Expression,
    hash: ExpressionHash,
    match_set: Mutex<MatchSet>,
    tx: Sender<Arc<Message>>,
    dropped: AtomicU64,
}

impl View {
    /// Build a view over an already-resolved expression and its delivery stream.
    pub fn new(expression: Expression, capacity: usize) -> ViewResult<(Arc<Self>, ViewStream)> {
        let hash = expression.hash()?;
        let (tx, rx) = bounded(capacity.max(1));
        let id = ViewId::new();
        let view = Arc::new(Self {
            id,
            expression,
            hash,
            match_set: Mutex::new(MatchSet::new()),
            tx,
            dropped: AtomicU64::new(0),
        });
        Ok((view, ViewStream { view_id: id, rx }))
    }

    #[must_use]
    pub const fn id(&self) -> ViewId {
        self.id
    }

    #[must_use]
    pub const fn expression(&self) -> &Expression {
        &self.expression
    }

    #[must_use]
    pub const fn hash(&self) -> &ExpressionHash {
        &self.hash
    }

    /// Whether `path` is currently matched by this view.
    pub fn is_matched(&self, path: &str) -> ViewResult<bool> {
        let set = self.match_set.lock().map_err(|_| lock_err("view match set"))?;
        Ok(set.get(path).copied().unwrap_or(false))
    }

    /// Sorted snapshot of the matched paths.
    pub fn matched_paths(&self) -> ViewResult<Vec<String>> {
        let set = self.match_set.lock().map_err(|_| lock_err("view match set"))?;
        let mut paths: Vec<String> = set
            .iter()
            .filter(|(_, matched)| **matched)
            .map(|(p, _)| p.clone())
            .collect();
        paths.sort();
        Ok(paths)
    }

    pub(crate) fn set_matched(&self, path: &str, matched: bool) -> ViewResult<()> {
        let mut set = self.match_set.lock().map_err(|_| lock_err("view match set"))?;
        if matched {
            set.insert(path.to_string(), true);
        } else {
            set.remove(path);
        }
        Ok(())
    }

    pub(crate) fn clear_matches(&self) -> ViewResult<Vec<String>> {
        let mut set = self.match_set.lock().map_err(|_| lock_err("view match set"))?;
        Ok(set.drain().filter(|(_, m)| *m).map(|(p, _)| p).collect())
    }

    /// Hand a message to the subscriber. Never blocks; a full or closed
    /// stream counts as a drop.
    pub(crate) fn deliver(&self, msg: &Arc<Message>) -> bool {
        match self.tx.try_send(Arc::clone(msg)) {
            Ok(()) => true,
            Err(TrySendError::Full(_) | TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Messages that could not be delivered.
    #[must_use]
    pub fn dropped_messages(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Receiving end of a view's forwarded messages.
#[derive(Debug)]
pub struct ViewStream {
    view_id: ViewId,
    rx: Receiver<Arc<Message>>,
}

impl ViewStream {
    #[must_use]
    pub const fn view_id(&self) -> ViewId {
        self.view_id
    }

    /// Receive the next message (blocking).
    pub fn recv(&self) -> Result<Arc<Message>, TransportError> {
        self.rx.recv().map_err(|_| self.disconnected())
    }

    /// Receive the next message, waiting at most `timeout`.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<Arc<Message>>, TransportError> {
        match self.rx.recv_timeout(timeout) {
            Ok(msg) => Ok(Some(msg)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(self.disconnected()),
        }
    }

    /// Non-blocking receive.
    pub fn try_recv(&self) -> Result<Option<Arc<Message>>, TransportError> {
        match self.rx.try_recv() {
            Ok(msg) => Ok(Some(msg)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(self.disconnected()),
        }
    }

    fn disconnected(&self) -> TransportError {
        TransportError::Disconnected {
            path: format!("view_stream/{}", self.view_id),
        }
    }
}

/// What `register_view` hands back.
#[derive(Debug)]
pub struct ViewRegistration {
    pub view: Arc<View>,
    pub stream: ViewStream,
}
