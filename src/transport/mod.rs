//! Pub/sub transport boundary.
//!
//! The view manager never talks to a broker directly. It relies on the
//! [`Transport`] trait: live subscriptions, one-shot historical queries,
//! publishing, and namespace alias resolution. Streams are crossbeam
//! receivers that disconnect when the subscription is torn down.

use std::fmt;
use std::sync::Arc;

use crossbeam_channel::Receiver;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TransportError;

/// In-process transport.
pub mod memory;

pub use memory::InMemoryTransport;

/// Identifier of one live subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    /// Creates a new random subscription ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Encoding of a payload object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadKind {
    /// A JSON-encoded [`MetadataTuple`].
    Metadata,
    /// UTF-8 text.
    Text,
    /// Opaque bytes.
    Binary,
    /// Any other numbered payload type.
    Other(u32),
}

/// One typed payload carried by a [`Message`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadObject {
    pub kind: PayloadKind,
    pub contents: Vec<u8>,
}

impl PayloadObject {
    /// A metadata payload wrapping `value`.
    #[must_use]
    pub fn metadata(value: impl Into<String>, time: i64) -> Self {
        let tuple = MetadataTuple {
            value: value.into(),
            time,
        };
        // A struct of a string and an integer always serializes.
        let contents = serde_json::to_vec(&tuple).unwrap_or_default();
        Self {
            kind: PayloadKind::Metadata,
            contents,
        }
    }

    /// A text payload.
    #[must_use]
    pub fn text(value: impl Into<String>) -> Self {
        Self {
            kind: PayloadKind::Text,
            contents: value.into().into_bytes(),
        }
    }

    /// An opaque binary payload.
    #[must_use]
    pub fn binary(contents: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: PayloadKind::Binary,
            contents: contents.into(),
        }
    }

    /// Decode the metadata tuple, if this is a well-formed metadata payload.
    #[must_use]
    pub fn metadata_tuple(&self) -> Option<MetadataTuple> {
        if self.kind != PayloadKind::Metadata {
            return None;
        }
        serde_json::from_slice(&self.contents).ok()
    }
}

/// Key/value metadata assertion as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataTuple {
    pub value: String,
    #[serde(default)]
    pub time: i64,
}

/// A message delivered by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Topic the message was published on.
    pub topic: String,
    /// Identity of the publisher.
    pub from: String,
    pub payloads: Vec<PayloadObject>,
}

impl Message {
    #[must_use]
    pub fn new(topic: impl Into<String>, from: impl Into<String>, payloads: Vec<PayloadObject>) -> Self {
        Self {
            topic: topic.into(),
            from: from.into(),
            payloads,
        }
    }

    /// True when every payload is empty (a metadata tombstone).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.payloads.iter().all(|po| match po.metadata_tuple() {
            Some(tuple) => tuple.value.is_empty(),
            None => po.contents.is_empty(),
        })
    }
}

/// A live subscription: its id, its pattern, and the stream of matching messages.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    topic: String,
    rx: Receiver<Arc<Message>>,
}

impl Subscription {
    #[must_use]
    pub fn new(id: SubscriptionId, topic: impl Into<String>, rx: Receiver<Arc<Message>>) -> Self {
        Self {
            id,
            topic: topic.into(),
            rx,
        }
    }

    #[must_use]
    pub const fn id(&self) -> SubscriptionId {
        self.id
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    #[must_use]
    pub fn receiver(&self) -> &Receiver<Arc<Message>> {
        &self.rx
    }
}

/// The pub/sub collaborator.
pub trait Transport: Send + Sync {
    /// Map a namespace alias to the identity that appears in delivered topics.
    fn resolve_namespace_identity(&self, alias: &str) -> Result<String, TransportError>;

    /// Subscribe to every future message matching `topic_pattern`.
    fn subscribe(&self, topic_pattern: &str) -> Result<Subscription, TransportError>;

    /// Replay retained messages matching `topic_pattern`. The stream ends after replay.
    fn query(&self, topic_pattern: &str) -> Result<Receiver<Arc<Message>>, TransportError>;

    /// Tear down a subscription. Unknown ids are ignored.
    fn unsubscribe(&self, id: SubscriptionId);

    fn publish(&self, message: Message) -> Result<(), TransportError>;
}

/// Split a path into its non-empty segments.
pub(crate) fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

/// Match a topic against a pattern where `+` is exactly one segment and `*`
/// is zero or more segments.
#[must_use]
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    match_segments(&segments(pattern), &segments(topic))
}

fn match_segments(pattern: &[&str], topic: &[&str]) -> bool {
    match pattern.split_first() {
        None => topic.is_empty(),
        Some((&"*", rest)) => (0..=topic.len()).any(|skip| match_segments(rest, &topic[skip..])),
        Some((&"+", rest)) => !topic.is_empty() && match_segments(rest, &topic[1..]),
        Some((seg, rest)) => topic.first() == Some(seg) && match_segments(rest, &topic[1..]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plus_matches_exactly_one_segment() {
        assert!(topic_matches("ns/+/temp", "ns/rm1/temp"));
        assert!(!topic_matches("ns/+/temp", "ns/temp"));
        assert!(!topic_matches("ns/+/temp", "ns/a/b/temp"));
    }

    #[test]
    fn star_matches_any_depth() {
        assert!(topic_matches("ns/*/!meta/+", "ns/bldg1/rm1/!meta/location"));
        assert!(topic_matches("ns/*/!meta/+", "ns/!meta/owner"));
        assert!(topic_matches("ns/bldg1/rm1/*", "ns/bldg1/rm1"));
        assert!(topic_matches("ns/bldg1/rm1/*", "ns/bldg1/rm1/sensor/temp"));
        assert!(!topic_matches("ns/bldg1/rm1/*", "ns/bldg1/rm2/temp"));
        assert!(!topic_matches("ns/*/!meta/+", "other/bldg1/!meta/location"));
    }

    #[test]
    fn leading_and_trailing_slashes_ignored() {
        assert!(topic_matches("/bldg1/rm1", "bldg1/rm1/"));
    }

    #[test]
    fn metadata_payload_decodes() {
        let po = PayloadObject::metadata("occupied=true", 7);
        let tuple = po.metadata_tuple().unwrap();
        assert_eq!(tuple.value, "occupied=true");
        assert_eq!(tuple.time, 7);
        assert!(PayloadObject::text("x").metadata_tuple().is_none());
    }

    #[test]
    fn empty_message_detection() {
        let tomb = Message::new("ns/a/!meta/k", "vk", vec![PayloadObject::metadata("", 1)]);
        assert!(tomb.is_empty());
        let live = Message::new("ns/a/!meta/k", "vk", vec![PayloadObject::text("v")]);
        assert!(!live.is_empty());
    }
}
