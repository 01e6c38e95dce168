//! ---
//! mpipe_section: "02-record-data-model"
//! mpipe_subsection: "module"
//! mpipe_type: "source"
//! mpipe_scope: "code"
//! mpipe_description: "Metric record model and topic identities."
//! mpipe_version: "v0.0.0-prealpha"
//! mpipe_owner: "tbd"
//! ---
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Identity of one appendable, ordered message stream within a namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TopicKey {
    namespace: String,
    name: String,
}

impl TopicKey {
    /// Construct a topic key from raw components.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Provision the configured set of metrics topics: topic `i` is named
    /// `{prefix}{i}`, all in the same namespace.
    pub fn provision(namespace: &str, prefix: &str, count: usize) -> Vec<TopicKey> {
        (0..count)
            .map(|index| TopicKey::new(namespace, format!("{prefix}{index}")))
            .collect()
    }

    /// Namespace the topic lives in.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Topic name within its namespace.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for TopicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.name)
    }
}

/// Opaque, topic-scoped position marker assigned by the message source.
///
/// Markers compare lexically over their bytes; the source guarantees that
/// lexical order follows publication order within a topic.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MessageId(Bytes);

impl MessageId {
    /// Wrap raw marker bytes handed out by a message source.
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// Build a marker from a numeric sequence, big-endian so that lexical
    /// order over the bytes matches numeric order.
    pub fn from_sequence(sequence: u64) -> Self {
        Self(Bytes::copy_from_slice(&sequence.to_be_bytes()))
    }

    /// Raw marker bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

/// A raw message as fetched from a topic: its marker plus the undecoded payload.
#[derive(Debug, Clone)]
pub struct RawMessage {
    /// Marker identifying the message's position in its topic.
    pub id: MessageId,
    /// Undecoded record payload.
    pub payload: Bytes,
}

impl RawMessage {
    /// Pair a marker with its payload.
    pub fn new(id: MessageId, payload: impl Into<Bytes>) -> Self {
        Self {
            id,
            payload: payload.into(),
        }
    }
}
