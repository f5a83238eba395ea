//! Metadata records and the record extractor.
//!
//! A [`MetadataRecord`] is one observed key/value assertion filed under a
//! path. Records are produced from raw transport messages by
//! [`extract_records`] and validated only when they reach the index.

use std::sync::Arc;

use chrono::Utc;

use crate::error::ValidationError;
use crate::transport::{segments, Message, PayloadKind};

/// Final URI segment marking a record filed under a path prefix.
pub const WILDCARD_SEGMENT: &str = "*";

/// One observed metadata assertion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataRecord {
    /// Last path segment of the assertion.
    pub key: String,
    /// Raw payload bytes. Empty means "delete this path's record".
    pub value: Vec<u8>,
    /// Top-level namespace the path belongs to.
    pub namespace: String,
    /// Normalized path this record is filed under.
    pub uri: String,
    /// Identity of the publisher.
    pub publisher_id: String,
    /// Observation time in nanoseconds.
    pub timestamp: i64,
    /// The transport message this record was extracted from.
    pub source: Option<Arc<Message>>,
}

impl MetadataRecord {
    /// Builds a record without a source message.
    #[must_use]
    pub fn new(
        namespace: impl Into<String>,
        uri: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<Vec<u8>>,
        publisher_id: impl Into<String>,
        timestamp: i64,
    ) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            namespace: namespace.into(),
            uri: uri.into(),
            publisher_id: publisher_id.into(),
            timestamp,
            source: None,
        }
    }

    /// Attach the originating message.
    #[must_use]
    pub fn with_source(mut self, source: Arc<Message>) -> Self {
        self.source = Some(source);
        self
    }

    /// True if this record asks for deletion.
    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        self.value.is_empty()
    }

    /// Value as UTF-8, if it is.
    #[must_use]
    pub fn value_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.value).ok()
    }

    /// Check the record invariant.
    ///
    /// The key must be a single segment equal to the final segment of the
    /// URI. A URI ending in `*` is filed under its prefix and accepts any key.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.key.is_empty() {
            return Err(ValidationError::EmptyKey);
        }
        if self.key.contains('/') {
            return Err(ValidationError::KeyNotSingleSegment { key: self.key.clone() });
        }
        for (field, value) in [
            ("uri", &self.uri),
            ("namespace", &self.namespace),
            ("publisher_id", &self.publisher_id),
        ] {
            if value.is_empty() {
                return Err(ValidationError::MissingField {
                    field: field.to_string(),
                });
            }
        }
        if self.timestamp <= 0 {
            return Err(ValidationError::NonPositiveTimestamp {
                timestamp: self.timestamp,
            });
        }

        match segments(&self.uri).last() {
            Some(&WILDCARD_SEGMENT) => Ok(()),
            Some(last) if *last == self.key => Ok(()),
            _ => Err(ValidationError::KeyPathMismatch {
                key: self.key.clone(),
                uri: self.uri.clone(),
            }),
        }
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }
}

fn now_nanos() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}

/// Turn one metadata message into one record per payload object.
///
/// The topic is expected to look like `<ns>/<path…>/!meta/<key>`: the marker
/// and key are stripped and the remaining path is wildcard-suffixed. No
/// validation happens here.
#[must_use]
pub fn extract_records(msg: &Arc<Message>) -> Vec<MetadataRecord> {
    let parts: Vec<&str> = msg.topic.split('/').collect();
    if parts.len() < 3 {
        return Vec::new();
    }

    let key = parts[parts.len() - 1];
    let namespace = parts[0];
    let uri = format!("{}/{WILDCARD_SEGMENT}", parts[..parts.len() - 2].join("/"));

    let metadata = msg.payloads.iter().find(|po| po.kind == PayloadKind::Metadata);
    let tuple = metadata.and_then(|po| po.metadata_tuple());
    let value = match (&tuple, metadata, msg.payloads.first()) {
        (Some(t), _, _) => t.value.clone().into_bytes(),
        (None, Some(po), _) | (None, None, Some(po)) => po.contents.clone(),
        (None, None, None) => Vec::new(),
    };
    let timestamp = tuple.as_ref().map_or(0, |t| t.time);
    let timestamp = if timestamp > 0 { timestamp } else { now_nanos() };

    msg.payloads
        .iter()
        .map(|_| MetadataRecord {
            key: key.to_string(),
            value: value.clone(),
            namespace: namespace.to_string(),
            uri: uri.clone(),
            publisher_id: msg.from.clone(),
            timestamp,
            source: Some(Arc::clone(msg)),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::PayloadObject;

    fn record(uri: &str, key: &str) -> MetadataRecord {
        MetadataRecord::new("ns1", uri, key, "v", "vk1", 1)
    }

    #[test]
    fn key_must_match_final_segment() {
        assert!(record("/bldg1/rm1", "rm1").is_valid());
        assert_eq!(
            record("/bldg1/rm1", "rm2").validate(),
            Err(ValidationError::KeyPathMismatch {
                key: "rm2".to_string(),
                uri: "/bldg1/rm1".to_string(),
            })
        );
    }

    #[test]
    fn wildcard_uri_accepts_any_key() {
        assert!(record("ns1/bldg1/rm1/*", "location").is_valid());
        assert!(!record("ns1/bldg1/rm1/*", "a/b").is_valid());
    }

    #[test]
    fn required_fields_enforced() {
        let mut rec = record("/bldg1/rm1", "rm1");
        rec.publisher_id.clear();
        assert_eq!(
            rec.validate(),
            Err(ValidationError::MissingField {
                field: "publisher_id".to_string()
            })
        );

        let mut rec = record("/bldg1/rm1", "rm1");
        rec.namespace.clear();
        assert!(!rec.is_valid());

        let mut rec = record("/bldg1/rm1", "rm1");
        rec.timestamp = 0;
        assert_eq!(rec.validate(), Err(ValidationError::NonPositiveTimestamp { timestamp: 0 }));

        assert_eq!(record("/bldg1/rm1", "").validate(), Err(ValidationError::EmptyKey));
        assert!(!record("", "rm1").is_valid());
    }

    #[test]
    fn extracts_metadata_tuple() {
        let msg = Arc::new(Message::new(
            "ns1/bldg1/rm1/!meta/location",
            "vk1",
            vec![PayloadObject::metadata("floor2", 42)],
        ));
        let recs = extract_records(&msg);
        assert_eq!(recs.len(), 1);
        let rec = &recs[0];
        assert_eq!(rec.key, "location");
        assert_eq!(rec.namespace, "ns1");
        assert_eq!(rec.uri, "ns1/bldg1/rm1/*");
        assert_eq!(rec.publisher_id, "vk1");
        assert_eq!(rec.value, b"floor2");
        assert_eq!(rec.timestamp, 42);
        assert!(rec.is_valid());
        assert!(Arc::ptr_eq(rec.source.as_ref().unwrap(), &msg));
    }

    #[test]
    fn falls_back_to_first_payload_contents() {
        let msg = Arc::new(Message::new(
            "ns1/bldg1/!meta/owner",
            "vk1",
            vec![PayloadObject::text("alice"), PayloadObject::binary(vec![1, 2])],
        ));
        let recs = extract_records(&msg);
        assert_eq!(recs.len(), 2);
        assert!(recs.iter().all(|r| r.value == b"alice"));
        assert!(recs[0].timestamp > 0);
    }

    #[test]
    fn short_topics_yield_nothing() {
        let msg = Arc::new(Message::new("ns1/x", "vk1", vec![PayloadObject::text("v")]));
        assert!(extract_records(&msg).is_empty());
    }
}
