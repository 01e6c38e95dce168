//! ---
//! mpipe_section: "03-persistence-checkpointing"
//! mpipe_subsection: "module"
//! mpipe_type: "source"
//! mpipe_scope: "code"
//! mpipe_description: "Store contracts and storage bindings."
//! mpipe_version: "v0.0.0-prealpha"
//! mpipe_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Contracts for the processor's external collaborators — the message
//! source it fetches from, the metric sink it persists to, and the
//! checkpoint store it commits read progress to — together with
//! in-memory doubles and file-backed reference implementations.

use std::collections::HashMap;

use async_trait::async_trait;
use m_pipe_record::{MessageId, MetricRecord, RawMessage, TopicKey};

pub mod checkpoint_file;
pub mod jsonl;
pub mod memory;

pub use checkpoint_file::FileCheckpointStore;
pub use jsonl::{JsonlMetricSink, JsonlSinkReader};
pub use memory::{MemoryCheckpointStore, MemoryMessageSource, MemoryMetricSink};

/// Where a fetch resumes within a topic.
#[derive(Debug, Clone)]
pub enum FetchStart {
    /// Replay the topic from its first retained message.
    Beginning,
    /// Resume strictly after the given marker.
    After(MessageId),
}

/// Error raised by a [`MessageSource`] fetch.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// The backing message bus cannot be reached right now.
    #[error("message bus unavailable: {0}")]
    Unavailable(String),
    /// Wrapper for IO errors from file- or socket-backed sources.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error raised by a [`MetricSink`] append.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// Wrapper for IO errors while writing the batch.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Wrapper for record serialization issues.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    /// The sink refused the batch.
    #[error("sink rejected batch: {0}")]
    Rejected(String),
}

/// Error raised by a [`CheckpointStore`] operation.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// The store cannot be reached right now; callers may retry.
    #[error("checkpoint store unavailable: {0}")]
    Unavailable(String),
    /// Wrapper for IO errors while reading or writing checkpoints.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Wrapper for document serialization issues.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    /// The stored checkpoint document cannot be interpreted.
    #[error("corrupt checkpoint document: {0}")]
    Corrupt(String),
}

/// Per-topic ordered message stream, resumable from a marker.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Fetch up to `limit` messages from `topic`, in publication order,
    /// starting at `start`. The returned batch is finite; dropping it
    /// releases any underlying resources.
    async fn fetch(
        &self,
        topic: &TopicKey,
        start: FetchStart,
        limit: usize,
    ) -> Result<Vec<RawMessage>, SourceError>;
}

/// Durable append target for batches of decoded metric records.
#[async_trait]
pub trait MetricSink: Send + Sync {
    /// Persist one batch. The sink need not preserve batch order.
    async fn append(&self, batch: Vec<MetricRecord>) -> Result<(), SinkError>;
}

/// Durable map from topic identity to last-consumed marker.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Read the committed marker for one topic, if any.
    async fn load_marker(&self, topic: &TopicKey) -> Result<Option<MessageId>, CheckpointError>;

    /// Commit markers for all given topics in one call. From the caller's
    /// perspective the commit is all-or-nothing; entries for topics not in
    /// `markers` are left untouched.
    async fn commit_markers(
        &self,
        markers: &HashMap<TopicKey, MessageId>,
    ) -> Result<(), CheckpointError>;
}
