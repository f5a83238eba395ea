//! Prefix-based metadata inheritance for timeseries messages.
//!
//! A batch of application messages is keyed by path. Paths that carry a
//! stream identifier are timeseries; every other path only contributes
//! metadata to the timeseries below it. Collapsing a batch copies ancestor
//! metadata down (nearest ancestor wins, existing keys are never
//! overwritten) and then drops the non-timeseries paths.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ViewResult;

/// Flat string-keyed metadata.
pub type Dict = BTreeMap<String, serde_json::Value>;

/// Unit of the timestamps in a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitOfTime {
    Seconds,
    Milliseconds,
    Microseconds,
    Nanoseconds,
}

/// Kind of values a stream carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamType {
    Numeric,
    Object,
}

/// Typed stream properties. Each one is inherited on its own.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Properties {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_of_time: Option<UnitOfTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_of_measure: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_type: Option<StreamType>,
}

impl Properties {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.unit_of_time.is_none() && self.unit_of_measure.is_none() && self.stream_type.is_none()
    }

    /// Fill each unset property from `ancestor`.
    fn inherit_from(&mut self, ancestor: &Self) {
        if self.unit_of_time.is_none() {
            self.unit_of_time = ancestor.unit_of_time;
        }
        if self.unit_of_measure.is_none() {
            self.unit_of_measure.clone_from(&ancestor.unit_of_measure);
        }
        if self.stream_type.is_none() {
            self.stream_type = ancestor.stream_type;
        }
    }
}

/// One reading of a timeseries.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub time: u64,
    pub value: f64,
}

/// An application-level message for one path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamMessage {
    pub path: String,
    /// Stream identifier. Present only on timeseries paths.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(default)]
    pub properties: Properties,
    #[serde(default)]
    pub actuator: Dict,
    #[serde(default)]
    pub metadata: Dict,
    #[serde(default)]
    pub readings: Vec<Reading>,
}

impl StreamMessage {
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_uuid(mut self, uuid: impl Into<String>) -> Self {
        self.uuid = Some(uuid.into());
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn is_timeseries(&self) -> bool {
        self.uuid.as_deref().is_some_and(|u| !u.is_empty())
    }

    /// True if the message carries anything beyond path, uuid and readings.
    #[must_use]
    pub fn has_metadata(&self) -> bool {
        !self.metadata.is_empty() || !self.actuator.is_empty() || !self.properties.is_empty()
    }

    fn inherit_from(&mut self, ancestor: &Self) {
        for (k, v) in &ancestor.metadata {
            self.metadata.entry(k.clone()).or_insert_with(|| v.clone());
        }
        for (k, v) in &ancestor.actuator {
            self.actuator.entry(k.clone()).or_insert_with(|| v.clone());
        }
        self.properties.inherit_from(&ancestor.properties);
    }
}

/// `/` plus every proper ancestor of `path`, root first.
#[must_use]
pub fn path_prefixes(path: &str) -> Vec<String> {
    let parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let mut prefixes = vec!["/".to_string()];
    for i in 1..parts.len() {
        prefixes.push(format!("/{}", parts[..i].join("/")));
    }
    prefixes
}

/// Messages of one batch, keyed by path.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TieredMessages(pub HashMap<String, StreamMessage>);

impl TieredMessages {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a message under its own path.
    pub fn insert(&mut self, msg: StreamMessage) {
        self.0.insert(msg.path.clone(), msg);
    }

    #[must_use]
    pub fn get(&self, path: &str) -> Option<&StreamMessage> {
        self.0.get(path)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Apply inheritance to every timeseries and drop all other paths.
    pub fn collapse_to_timeseries(&mut self) {
        let timeseries: Vec<String> = self
            .0
            .iter()
            .filter(|(_, m)| m.is_timeseries())
            .map(|(p, _)| p.clone())
            .collect();

        for path in timeseries {
            let mut prefixes = path_prefixes(&path);
            prefixes.sort_unstable_by(|a, b| b.cmp(a));

            let ancestors: Vec<StreamMessage> = prefixes
                .iter()
                .filter_map(|p| self.0.get(p))
                .filter(|m| m.has_metadata())
                .cloned()
                .collect();

            if let Some(msg) = self.0.get_mut(&path) {
                for ancestor in &ancestors {
                    msg.inherit_from(ancestor);
                }
            }
        }

        self.0.retain(|_, m| m.is_timeseries());
    }

    /// Consume the batch, yielding its messages.
    #[must_use]
    pub fn into_messages(self) -> Vec<StreamMessage> {
        self.0.into_values().collect()
    }
}

impl FromIterator<StreamMessage> for TieredMessages {
    fn from_iter<I: IntoIterator<Item = StreamMessage>>(iter: I) -> Self {
        let mut tiered = Self::new();
        for msg in iter {
            tiered.insert(msg);
        }
        tiered
    }
}

/// Ingestion collaborator that persists timeseries data and metadata.
pub trait Archiver: Send + Sync {
    fn add_data(&self, msg: StreamMessage) -> ViewResult<()>;
}

/// Collapse `messages` and hand every timeseries to `archiver`.
///
/// Failures are logged and skipped. Returns how many messages were archived.
pub fn archive_timeseries(mut messages: TieredMessages, archiver: &dyn Archiver) -> usize {
    messages.collapse_to_timeseries();
    let mut archived = 0;
    for msg in messages.into_messages() {
        let path = msg.path.clone();
        match archiver.add_data(msg) {
            Ok(()) => archived += 1,
            Err(e) => warn!(path = %path, error = %e, "could not add data"),
        }
    }
    archived
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;
    use crate::error::ViewError;

    #[test]
    fn prefixes_cover_root_and_ancestors() {
        assert_eq!(path_prefixes("/a/b/c"), vec!["/", "/a", "/a/b"]);
        assert_eq!(path_prefixes("/a"), vec!["/"]);
    }

    #[test]
    fn inherits_from_ancestor() {
        let mut batch: TieredMessages = [
            StreamMessage::new("/a/b").with_uuid("u1"),
            StreamMessage::new("/a").with_metadata("units", "W"),
        ]
        .into_iter()
        .collect();

        batch.collapse_to_timeseries();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.get("/a/b").unwrap().metadata["units"], json!("W"));
        assert!(batch.get("/a").is_none());
    }

    #[test]
    fn own_value_is_never_overwritten() {
        let mut batch: TieredMessages = [
            StreamMessage::new("/a/b").with_uuid("u1").with_metadata("units", "kW"),
            StreamMessage::new("/a").with_metadata("units", "W"),
        ]
        .into_iter()
        .collect();

        batch.collapse_to_timeseries();
        assert_eq!(batch.get("/a/b").unwrap().metadata["units"], json!("kW"));
    }

    #[test]
    fn nearest_ancestor_wins() {
        let mut batch: TieredMessages = [
            StreamMessage::new("/a/b/c").with_uuid("u1"),
            StreamMessage::new("/a/b").with_metadata("room", "410"),
            StreamMessage::new("/a")
                .with_metadata("room", "000")
                .with_metadata("building", "soda"),
            StreamMessage::new("/").with_metadata("site", "berkeley"),
        ]
        .into_iter()
        .collect();

        batch.collapse_to_timeseries();
        let ts = batch.get("/a/b/c").unwrap();
        assert_eq!(ts.metadata["room"], json!("410"));
        assert_eq!(ts.metadata["building"], json!("soda"));
        assert_eq!(ts.metadata["site"], json!("berkeley"));
    }

    #[test]
    fn properties_and_actuator_inherit_when_unset() {
        let mut parent = StreamMessage::new("/a");
        parent.properties.unit_of_measure = Some("W".to_string());
        parent.properties.unit_of_time = Some(UnitOfTime::Seconds);
        parent.actuator.insert("model".to_string(), json!("binary"));

        let mut child = StreamMessage::new("/a/b").with_uuid("u1");
        child.properties.unit_of_time = Some(UnitOfTime::Milliseconds);

        let mut batch: TieredMessages = [parent, child].into_iter().collect();
        batch.collapse_to_timeseries();

        let ts = batch.get("/a/b").unwrap();
        assert_eq!(ts.properties.unit_of_measure.as_deref(), Some("W"));
        assert_eq!(ts.properties.unit_of_time, Some(UnitOfTime::Milliseconds));
        assert_eq!(ts.actuator["model"], json!("binary"));
    }

    #[test]
    fn empty_uuid_is_not_timeseries() {
        let mut batch: TieredMessages = [StreamMessage::new("/a").with_uuid("")].into_iter().collect();
        batch.collapse_to_timeseries();
        assert!(batch.is_empty());
    }

    #[derive(Default)]
    struct RecordingArchiver {
        seen: Mutex<Vec<String>>,
    }

    impl Archiver for RecordingArchiver {
        fn add_data(&self, msg: StreamMessage) -> ViewResult<()> {
            if msg.path == "/bad" {
                return Err(ViewError::internal("rejected"));
            }
            self.seen.lock().unwrap().push(msg.path);
            Ok(())
        }
    }

    #[test]
    fn archive_skips_failures() {
        let batch: TieredMessages = [
            StreamMessage::new("/ok").with_uuid("u1"),
            StreamMessage::new("/bad").with_uuid("u2"),
            StreamMessage::new("/").with_metadata("site", "x"),
        ]
        .into_iter()
        .collect();

        let archiver = RecordingArchiver::default();
        assert_eq!(archive_timeseries(batch, &archiver), 1);
        assert_eq!(*archiver.seen.lock().unwrap(), vec!["/ok".to_string()]);
    }
}
