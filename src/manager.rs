//! View manager: namespace subscriptions, reconciliation, forwarding.
//!
//! The manager owns three shared maps, each behind its own lock:
//! namespace subscriptions, expression hash → views, and path → forwarder.
//! Metadata arriving on a namespace subscription is extracted, inserted into
//! the index, and followed by a reconciliation pass that re-runs every
//! registered expression and starts or stops per-path forwarding to match.
//!
//! Lock discipline: at most one map lock is held at a time, view match sets
//! are only touched after map locks are released, and transport calls are
//! never made while holding any of them. Reconciliation passes, view
//! unregistration and the public forwarding calls are serialized by a
//! dedicated mutex so that match sets and forwarders change from one pass at
//! a time.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::thread;

use crossbeam_channel::Receiver;
use tracing::{debug, error, info, warn};

use crate::config::ViewManagerConfig;
use crate::error::{lock_err, TransportError, ViewError, ViewResult};
use crate::expression::{Expression, ExpressionHash};
use crate::forwarder::Forwarder;
use crate::index::{MemoryMetadataIndex, MetadataIndex};
use crate::pool::{WorkerPool, WorkerPoolHandle};
use crate::record::extract_records;
use crate::transport::{Message, Subscription, SubscriptionId, Transport};
use crate::view::{View, ViewId, ViewRegistration};

/// An established namespace subscription.
#[derive(Debug)]
struct NamespaceSubscription {
    identity: String,
    topic: String,
    live: SubscriptionId,
    _workers: Vec<WorkerPoolHandle>,
}

/// Transport side of a namespace that is not committed yet.
struct PendingNamespace {
    alias: String,
    identity: String,
    topic: String,
    live: Subscription,
    history: Receiver<Arc<Message>>,
}

/// Orchestrates views over a live metadata namespace.
pub struct ViewManager {
    me: Weak<ViewManager>,
    cfg: ViewManagerConfig,
    transport: Arc<dyn Transport>,
    index: Arc<dyn MetadataIndex>,

    // alias -> subscription
    namespaces: RwLock<HashMap<String, NamespaceSubscription>>,
    namespace_setup: Mutex<()>,

    expressions: RwLock<HashMap<ExpressionHash, Vec<Arc<View>>>>,

    forwarders: RwLock<HashMap<String, Arc<Forwarder>>>,

    reconcile: Mutex<()>,
    shut_down: AtomicBool,
}

impl std::fmt::Debug for ViewManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewManager")
            .field("cfg", &self.cfg)
            .field("shut_down", &self.shut_down.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl ViewManager {
    /// Create a manager over `transport` and `index`.
    pub fn new(
        cfg: ViewManagerConfig,
        transport: Arc<dyn Transport>,
        index: Arc<dyn MetadataIndex>,
    ) -> ViewResult<Arc<Self>> {
        cfg.validate()?;
        Ok(Arc::new_cyclic(|me| Self {
            me: me.clone(),
            cfg,
            transport,
            index,
            namespaces: RwLock::new(HashMap::new()),
            namespace_setup: Mutex::new(()),
            expressions: RwLock::new(HashMap::new()),
            forwarders: RwLock::new(HashMap::new()),
            reconcile: Mutex::new(()),
            shut_down: AtomicBool::new(false),
        }))
    }

    /// Create a manager backed by a fresh [`MemoryMetadataIndex`].
    pub fn with_memory_index(cfg: ViewManagerConfig, transport: Arc<dyn Transport>) -> ViewResult<Arc<Self>> {
        Self::new(cfg, transport, Arc::new(MemoryMetadataIndex::new()))
    }

    #[must_use]
    pub fn index(&self) -> &Arc<dyn MetadataIndex> {
        &self.index
    }

    #[must_use]
    pub const fn config(&self) -> &ViewManagerConfig {
        &self.cfg
    }

    fn ensure_running(&self) -> ViewResult<()> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(ViewError::internal("view manager is shut down"));
        }
        Ok(())
    }

    /// Register a view over `expr`.
    ///
    /// Every namespace the expression names gets exactly one live
    /// subscription plus a historical replay. Matches already in the index
    /// start forwarding before this returns. On error nothing stays
    /// registered.
    pub fn register_view(&self, expr: Expression) -> ViewResult<ViewRegistration> {
        self.ensure_running()?;

        let identities = self.subscribe_namespaces(&expr)?;
        let resolved = expr.with_namespaces(identities);
        let (view, stream) = View::new(resolved, self.cfg.view_stream_capacity)?;

        {
            let mut exprs = self.expressions.write().map_err(|_| lock_err("expressions"))?;
            exprs.entry(view.hash().clone()).or_default().push(Arc::clone(&view));
        }

        if let Err(e) = self.forward_initial_matches(&view) {
            error!(view = %view.id(), error = %e, "initial match failed, rolling back view");
            if let Err(rollback) = self.unregister_view(view.id()) {
                error!(view = %view.id(), error = %rollback, "rollback failed");
            }
            return Err(e);
        }

        info!(view = %view.id(), hash = %view.hash(), "registered view");
        Ok(ViewRegistration { view, stream })
    }

    /// Remove a view and stop forwarding every path it matched.
    pub fn unregister_view(&self, id: ViewId) -> ViewResult<()> {
        let _pass = self.reconcile.lock().map_err(|_| lock_err("reconcile"))?;

        let view = {
            let mut exprs = self.expressions.write().map_err(|_| lock_err("expressions"))?;
            let mut found = None;
            for (hash, views) in exprs.iter_mut() {
                if let Some(pos) = views.iter().position(|v| v.id() == id) {
                    found = Some((hash.clone(), views.remove(pos)));
                    break;
                }
            }
            let Some((hash, view)) = found else {
                return Err(ViewError::ViewNotFound { id: id.to_string() });
            };
            if exprs.get(&hash).is_some_and(Vec::is_empty) {
                exprs.remove(&hash);
            }
            view
        };

        for path in view.matched_paths()? {
            self.detach(&path, &[Arc::clone(&view)])?;
        }
        info!(view = %id, "unregistered view");
        Ok(())
    }

    fn forward_initial_matches(&self, view: &Arc<View>) -> ViewResult<()> {
        let _pass = self.reconcile.lock().map_err(|_| lock_err("reconcile"))?;
        for rec in self.index.exec(view.expression())? {
            if view.is_matched(&rec.uri)? {
                continue;
            }
            self.attach(&rec.uri, &[Arc::clone(view)])?;
            if let Some(src) = &rec.source {
                view.deliver(src);
            }
        }
        Ok(())
    }

    /// Ensure each namespace in `expr` has a live subscription and return the
    /// resolved identities. Newly opened namespaces are committed together or
    /// not at all.
    fn subscribe_namespaces(&self, expr: &Expression) -> ViewResult<Vec<String>> {
        let mut identities = Vec::with_capacity(expr.namespaces.len());
        let mut missing = Vec::new();
        {
            let ns = self.namespaces.read().map_err(|_| lock_err("namespaces"))?;
            for alias in &expr.namespaces {
                match ns.get(alias) {
                    Some(sub) => identities.push(sub.identity.clone()),
                    None => missing.push(alias.clone()),
                }
            }
        }
        if missing.is_empty() {
            return Ok(identities);
        }

        let _setup = self.namespace_setup.lock().map_err(|_| lock_err("namespace setup"))?;

        let mut pending: Vec<PendingNamespace> = Vec::new();
        for alias in missing {
            {
                let ns = self.namespaces.read().map_err(|_| lock_err("namespaces"))?;
                if let Some(sub) = ns.get(&alias) {
                    identities.push(sub.identity.clone());
                    continue;
                }
            }
            match self.open_namespace(&alias) {
                Ok(p) => {
                    identities.push(p.identity.clone());
                    pending.push(p);
                }
                Err(e) => {
                    for p in &pending {
                        self.transport.unsubscribe(p.live.id());
                    }
                    return Err(e);
                }
            }
        }

        // Pools of this batch that already started stop ingesting on rollback.
        let cancelled = Arc::new(AtomicBool::new(false));
        let mut started = Vec::with_capacity(pending.len());
        let live_ids: Vec<SubscriptionId> = pending.iter().map(|p| p.live.id()).collect();
        for p in pending {
            match self.start_namespace(p, &cancelled) {
                Ok(entry) => started.push(entry),
                Err(e) => {
                    cancelled.store(true, Ordering::Release);
                    for id in &live_ids {
                        self.transport.unsubscribe(*id);
                    }
                    return Err(e);
                }
            }
        }

        let mut ns = self.namespaces.write().map_err(|_| lock_err("namespaces"))?;
        for (alias, entry) in started {
            info!(namespace = %alias, identity = %entry.identity, topic = %entry.topic, "subscribed to namespace");
            ns.insert(alias, entry);
        }
        Ok(identities)
    }

    fn open_namespace(&self, alias: &str) -> ViewResult<PendingNamespace> {
        let identity = self.with_retry("resolve", || self.transport.resolve_namespace_identity(alias))?;
        debug!(namespace = alias, identity = %identity, "resolved namespace alias");

        let topic = self.cfg.namespace_topic(&identity);
        let live = self.with_retry("subscribe", || self.transport.subscribe(&topic))?;

        // Subscriptions only see future messages, so replay what is already there.
        let history = match self.with_retry("query", || self.transport.query(&topic)) {
            Ok(rx) => rx,
            Err(e) => {
                self.transport.unsubscribe(live.id());
                return Err(e);
            }
        };

        Ok(PendingNamespace {
            alias: alias.to_string(),
            identity,
            topic,
            live,
            history,
        })
    }

    fn start_namespace(
        &self,
        p: PendingNamespace,
        cancelled: &Arc<AtomicBool>,
    ) -> ViewResult<(String, NamespaceSubscription)> {
        let handler = self.ingest_handler(Arc::clone(cancelled));
        let live = WorkerPool::new(
            "metaview-ns",
            p.live.receiver().clone(),
            handler.clone(),
            self.cfg.namespace_workers,
        )
        .start()?;
        let history = WorkerPool::new("metaview-ns-history", p.history, handler, self.cfg.namespace_workers).start()?;

        Ok((
            p.alias,
            NamespaceSubscription {
                identity: p.identity,
                topic: p.topic,
                live: p.live.id(),
                _workers: vec![live, history],
            },
        ))
    }

    fn ingest_handler(&self, cancelled: Arc<AtomicBool>) -> impl Fn(Arc<Message>) + Clone + Send + Sync + 'static {
        let me = self.me.clone();
        move |msg: Arc<Message>| {
            if cancelled.load(Ordering::Acquire) {
                return;
            }
            let Some(vm) = me.upgrade() else {
                return;
            };
            if let Err(e) = vm.ingest(&msg) {
                error!(topic = %msg.topic, error = %e, "could not ingest metadata");
            }
        }
    }

    fn with_retry<T>(&self, op: &'static str, mut call: impl FnMut() -> Result<T, TransportError>) -> ViewResult<T> {
        let mut attempt = 1;
        loop {
            match call() {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() && attempt < self.cfg.retry.max_attempts => {
                    warn!(op, attempt, error = %e, "transport call failed, retrying");
                    thread::sleep(self.cfg.retry.backoff_for(attempt));
                    attempt += 1;
                }
                Err(e) => {
                    error!(op, attempts = attempt, error = %e, "transport call failed");
                    return Err(e.into());
                }
            }
        }
    }

    /// Extract records from a metadata message, index them, and reconcile.
    ///
    /// Invalid records are logged and skipped.
    pub fn ingest(&self, msg: &Arc<Message>) -> ViewResult<()> {
        if self.shut_down.load(Ordering::Acquire) {
            return Ok(());
        }
        for rec in extract_records(msg) {
            let uri = rec.uri.clone();
            if let Err(e) = self.index.insert(rec) {
                debug!(uri = %uri, error = %e, "could not insert record");
            }
        }
        self.reconcile_all()
    }

    /// Re-run every registered expression and reconcile forwarding, repeating
    /// while the index changes underneath the pass.
    pub fn reconcile_all(&self) -> ViewResult<()> {
        let _pass = self.reconcile.lock().map_err(|_| lock_err("reconcile"))?;
        for round in 0..self.cfg.max_reconcile_rounds {
            let before = self.index.generation();
            self.reconcile_pass()?;
            if self.index.generation() == before {
                return Ok(());
            }
            debug!(round, "index changed during reconciliation, running again");
        }
        warn!(
            rounds = self.cfg.max_reconcile_rounds,
            "reconciliation did not reach a fixed point; next batch will continue"
        );
        Ok(())
    }

    fn reconcile_pass(&self) -> ViewResult<()> {
        let groups: Vec<Vec<Arc<View>>> = {
            let exprs = self.expressions.read().map_err(|_| lock_err("expressions"))?;
            exprs.values().cloned().collect()
        };
        for views in groups {
            self.reconcile_group(&views)?;
        }
        Ok(())
    }

    fn reconcile_group(&self, views: &[Arc<View>]) -> ViewResult<()> {
        let Some(first) = views.first() else {
            return Ok(());
        };
        let matching = self.index.exec(first.expression())?;
        let current: HashSet<&str> = matching.iter().map(|r| r.uri.as_str()).collect();

        for rec in &matching {
            let mut newcomers = Vec::new();
            for v in views {
                if !v.is_matched(&rec.uri)? {
                    newcomers.push(Arc::clone(v));
                }
            }
            if newcomers.is_empty() {
                continue;
            }

            match self.attach(&rec.uri, &newcomers) {
                Ok((fwd, created)) => {
                    // Pass the triggering message on so it is not lost.
                    if let Some(src) = &rec.source {
                        if created {
                            fwd.send(src)?;
                        } else {
                            for v in &newcomers {
                                v.deliver(src);
                            }
                        }
                    }
                }
                Err(e) => {
                    error!(path = %rec.uri, error = %e, "could not start forwarding");
                }
            }
        }

        let mut stale: HashMap<String, Vec<Arc<View>>> = HashMap::new();
        for v in views {
            for path in v.matched_paths()? {
                if !current.contains(path.as_str()) {
                    stale.entry(path).or_default().push(Arc::clone(v));
                }
            }
        }
        for (path, vs) in stale {
            self.detach(&path, &vs)?;
        }
        Ok(())
    }

    /// Route `path` to `views`, creating its forwarder on first use.
    ///
    /// Returns the forwarder and whether it was created by this call. A
    /// failed transport subscription leaves no state behind. Runs between
    /// reconciliation passes, never during one.
    pub fn start_forwarding(&self, path: &str, views: &[Arc<View>]) -> ViewResult<(Arc<Forwarder>, bool)> {
        let _pass = self.reconcile.lock().map_err(|_| lock_err("reconcile"))?;
        self.attach(path, views)
    }

    /// Detach `views` from `path`. The forwarder is removed from the map and
    /// its subscription torn down as soon as its interest set is empty.
    pub fn stop_forwarding(&self, path: &str, views: &[Arc<View>]) -> ViewResult<()> {
        let _pass = self.reconcile.lock().map_err(|_| lock_err("reconcile"))?;
        self.detach(path, views)
    }

    // Callers hold `reconcile`, which keeps the forwarder map and the match
    // sets changing together.
    fn attach(&self, path: &str, views: &[Arc<View>]) -> ViewResult<(Arc<Forwarder>, bool)> {
        self.ensure_running()?;

        let existing = {
            let fwds = self.forwarders.read().map_err(|_| lock_err("forwarders"))?;
            match fwds.get(path) {
                Some(f) => {
                    f.add_views(views)?;
                    Some(Arc::clone(f))
                }
                None => None,
            }
        };
        if let Some(fwd) = existing {
            mark_matched(path, views)?;
            return Ok((fwd, false));
        }

        let sub = self.with_retry("subscribe", || self.transport.subscribe(path))?;
        let sub_id = sub.id();
        let fresh = match Forwarder::start(path, sub, self.cfg.forwarder_workers) {
            Ok(f) => f,
            Err(e) => {
                self.transport.unsubscribe(sub_id);
                return Err(e);
            }
        };

        let installed = self.install_forwarder(path, &fresh, views);
        let (fwd, created) = match installed {
            Ok(pair) => pair,
            Err(e) => {
                fresh.close(self.transport.as_ref());
                return Err(e);
            }
        };
        if !created {
            fresh.close(self.transport.as_ref());
        } else {
            info!(path, "started forwarding");
        }

        mark_matched(path, views)?;
        Ok((fwd, created))
    }

    fn install_forwarder(
        &self,
        path: &str,
        fresh: &Arc<Forwarder>,
        views: &[Arc<View>],
    ) -> ViewResult<(Arc<Forwarder>, bool)> {
        let mut fwds = self.forwarders.write().map_err(|_| lock_err("forwarders"))?;
        if let Some(existing) = fwds.get(path) {
            existing.add_views(views)?;
            return Ok((Arc::clone(existing), false));
        }
        fresh.add_views(views)?;
        fwds.insert(path.to_string(), Arc::clone(fresh));
        Ok((Arc::clone(fresh), true))
    }

    fn detach(&self, path: &str, views: &[Arc<View>]) -> ViewResult<()> {
        let retired = {
            let mut fwds = self.forwarders.write().map_err(|_| lock_err("forwarders"))?;
            let remaining = match fwds.get(path) {
                Some(f) => Some(f.remove_views(views)?),
                None => None,
            };
            match remaining {
                Some(0) => fwds.remove(path),
                _ => None,
            }
        };

        for v in views {
            v.set_matched(path, false)?;
        }
        if let Some(fwd) = retired {
            fwd.close(self.transport.as_ref());
        }
        Ok(())
    }

    /// Stop every forwarder and namespace subscription and drop all views.
    /// Later registrations fail. Calling it twice is a no-op.
    pub fn shutdown(&self) -> ViewResult<()> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _pass = self.reconcile.lock().map_err(|_| lock_err("reconcile"))?;

        let views: Vec<Arc<View>> = {
            let mut exprs = self.expressions.write().map_err(|_| lock_err("expressions"))?;
            exprs.drain().flat_map(|(_, vs)| vs).collect()
        };
        let forwarders: Vec<Arc<Forwarder>> = {
            let mut fwds = self.forwarders.write().map_err(|_| lock_err("forwarders"))?;
            fwds.drain().map(|(_, f)| f).collect()
        };
        let namespaces: Vec<NamespaceSubscription> = {
            let mut ns = self.namespaces.write().map_err(|_| lock_err("namespaces"))?;
            ns.drain().map(|(_, s)| s).collect()
        };

        for f in &forwarders {
            f.close(self.transport.as_ref());
        }
        for v in &views {
            v.clear_matches()?;
        }
        for ns in &namespaces {
            self.transport.unsubscribe(ns.live);
        }
        info!(
            views = views.len(),
            forwarders = forwarders.len(),
            namespaces = namespaces.len(),
            "view manager shut down"
        );
        Ok(())
    }

    pub fn has_forwarder(&self, path: &str) -> ViewResult<bool> {
        let fwds = self.forwarders.read().map_err(|_| lock_err("forwarders"))?;
        Ok(fwds.contains_key(path))
    }

    pub fn forwarder_count(&self) -> ViewResult<usize> {
        let fwds = self.forwarders.read().map_err(|_| lock_err("forwarders"))?;
        Ok(fwds.len())
    }

    /// Views currently interested in `path`; empty if it has no forwarder.
    pub fn forwarder_interest(&self, path: &str) -> ViewResult<Vec<ViewId>> {
        let fwd = {
            let fwds = self.forwarders.read().map_err(|_| lock_err("forwarders"))?;
            fwds.get(path).cloned()
        };
        match fwd {
            Some(f) => f.interest(),
            None => Ok(Vec::new()),
        }
    }

    pub fn namespace_subscription_count(&self) -> ViewResult<usize> {
        let ns = self.namespaces.read().map_err(|_| lock_err("namespaces"))?;
        Ok(ns.len())
    }

    pub fn view_count(&self) -> ViewResult<usize> {
        let exprs = self.expressions.read().map_err(|_| lock_err("expressions"))?;
        Ok(exprs.values().map(Vec::len).sum())
    }

    /// Number of distinct expressions among registered views.
    pub fn expression_group_count(&self) -> ViewResult<usize> {
        let exprs = self.expressions.read().map_err(|_| lock_err("expressions"))?;
        Ok(exprs.len())
    }
}

fn mark_matched(path: &str, views: &[Arc<View>]) -> ViewResult<()> {
    for v in views {
        v.set_matched(path, true)?;
    }
    Ok(())
}
