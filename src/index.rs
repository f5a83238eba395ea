//! Metadata index.
//!
//! Holds the latest [`MetadataRecord`] per URI and answers expression
//! queries with a linear scan. Namespace membership is checked before the
//! predicate tree, which keeps the scan cheap for the low-volume metadata
//! spaces this is meant for.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use tracing::debug;

use crate::error::{lock_err, ViewResult};
use crate::expression::{Evaluate, Expression};
use crate::record::MetadataRecord;

/// Storage contract for metadata records.
pub trait MetadataIndex: Send + Sync {
    /// Validate and upsert `record`. An empty value deletes the entry already
    /// stored at its URI; with nothing stored it is upserted like any other.
    fn insert(&self, record: MetadataRecord) -> ViewResult<()>;

    /// Every stored record in one of `expr`'s namespaces that satisfies its predicate.
    fn exec(&self, expr: &Expression) -> ViewResult<Vec<MetadataRecord>>;

    /// Ad hoc string queries. Backends may return nothing.
    fn query(&self, query: &str) -> ViewResult<Vec<MetadataRecord>>;

    /// The record stored at `uri`, if any.
    fn get(&self, uri: &str) -> ViewResult<Option<MetadataRecord>>;

    fn len(&self) -> ViewResult<usize>;

    fn is_empty(&self) -> ViewResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Counter bumped on every mutation.
    fn generation(&self) -> u64;
}

#[derive(Debug, Default)]
struct Entries {
    records: HashMap<String, MetadataRecord>,
    // uri -> timestamp of the tombstone that removed it
    removed: HashMap<String, i64>,
}

impl Entries {
    /// Newest timestamp known for `uri`, stored or removed.
    fn newest(&self, uri: &str) -> Option<i64> {
        self.records
            .get(uri)
            .map(|r| r.timestamp)
            .or_else(|| self.removed.get(uri).copied())
    }
}

/// Thread-safe in-memory [`MetadataIndex`] keyed by URI.
///
/// Records older than what the index already holds for their URI are
/// ignored, so a replayed value cannot undo a newer write or delete.
#[derive(Debug, Default)]
pub struct MemoryMetadataIndex {
    entries: RwLock<Entries>,
    generation: AtomicU64,
}

impl MemoryMetadataIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetadataIndex for MemoryMetadataIndex {
    fn insert(&self, record: MetadataRecord) -> ViewResult<()> {
        record.validate()?;

        let mut entries = self.entries.write().map_err(|_| lock_err("metadata index"))?;
        if entries.newest(&record.uri).is_some_and(|t| record.timestamp < t) {
            debug!(uri = %record.uri, timestamp = record.timestamp, "skipping stale record");
            return Ok(());
        }

        if record.is_tombstone() && entries.records.contains_key(&record.uri) {
            entries.records.remove(&record.uri);
            entries.removed.insert(record.uri, record.timestamp);
        } else {
            entries.removed.remove(&record.uri);
            entries.records.insert(record.uri.clone(), record);
        }
        self.generation.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn exec(&self, expr: &Expression) -> ViewResult<Vec<MetadataRecord>> {
        let entries = self.entries.read().map_err(|_| lock_err("metadata index"))?;
        let mut matched = Vec::new();
        for rec in entries.records.values() {
            if !expr.has_namespace(&rec.namespace) {
                continue;
            }
            match expr.node.eval(rec) {
                Ok(true) => matched.push(rec.clone()),
                Ok(false) => {}
                Err(e) => debug!(uri = %rec.uri, error = %e, "predicate evaluation failed, treating as no match"),
            }
        }
        Ok(matched)
    }

    fn query(&self, _query: &str) -> ViewResult<Vec<MetadataRecord>> {
        Ok(Vec::new())
    }

    fn get(&self, uri: &str) -> ViewResult<Option<MetadataRecord>> {
        let entries = self.entries.read().map_err(|_| lock_err("metadata index"))?;
        Ok(entries.records.get(uri).cloned())
    }

    fn len(&self) -> ViewResult<usize> {
        let entries = self.entries.read().map_err(|_| lock_err("metadata index"))?;
        Ok(entries.records.len())
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }
}
