//! ---
//! mpipe_section: "03-persistence-checkpointing"
//! mpipe_subsection: "module"
//! mpipe_type: "source"
//! mpipe_scope: "code"
//! mpipe_description: "Store contracts and storage bindings."
//! mpipe_version: "v0.0.0-prealpha"
//! mpipe_owner: "tbd"
//! ---
//! In-memory collaborator doubles used by the simulation harness and the
//! integration suites. All three support failure injection so recovery
//! paths can be exercised deterministically.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use m_pipe_record::{JsonRecordCodec, MessageId, MetricRecord, RawMessage, TopicKey};
use parking_lot::Mutex;

use crate::{
    CheckpointError, CheckpointStore, FetchStart, MessageSource, MetricSink, SinkError,
    SourceError,
};

#[derive(Debug, Default)]
struct TopicLog {
    next_sequence: u64,
    messages: Vec<RawMessage>,
}

/// In-memory message source: per-topic ordered logs with monotonically
/// increasing markers. Messages may be published while consumers run.
#[derive(Debug, Default)]
pub struct MemoryMessageSource {
    topics: Mutex<HashMap<TopicKey, TopicLog>>,
    fail_fetches: Mutex<usize>,
}

impl MemoryMessageSource {
    /// Create an empty source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a raw payload to a topic, returning the assigned marker.
    pub fn publish(&self, topic: &TopicKey, payload: impl Into<Bytes>) -> MessageId {
        let mut topics = self.topics.lock();
        let log = topics.entry(topic.clone()).or_default();
        log.next_sequence += 1;
        let id = MessageId::from_sequence(log.next_sequence);
        log.messages.push(RawMessage::new(id.clone(), payload));
        id
    }

    /// Append a metric record encoded with the reference JSON codec.
    pub fn publish_record(&self, topic: &TopicKey, record: &MetricRecord) -> MessageId {
        let payload =
            JsonRecordCodec::encode(record).expect("metric record encodes as JSON");
        self.publish(topic, payload)
    }

    /// Make the next `count` fetches fail with [`SourceError::Unavailable`].
    pub fn fail_fetches(&self, count: usize) {
        *self.fail_fetches.lock() = count;
    }

    /// Number of messages retained for a topic.
    pub fn len(&self, topic: &TopicKey) -> usize {
        self.topics
            .lock()
            .get(topic)
            .map(|log| log.messages.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl MessageSource for MemoryMessageSource {
    async fn fetch(
        &self,
        topic: &TopicKey,
        start: FetchStart,
        limit: usize,
    ) -> Result<Vec<RawMessage>, SourceError> {
        {
            let mut failures = self.fail_fetches.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(SourceError::Unavailable(
                    "injected fetch failure".to_owned(),
                ));
            }
        }

        let topics = self.topics.lock();
        let Some(log) = topics.get(topic) else {
            return Ok(Vec::new());
        };
        let batch = log
            .messages
            .iter()
            .filter(|message| match &start {
                FetchStart::Beginning => true,
                FetchStart::After(marker) => message.id > *marker,
            })
            .take(limit)
            .cloned()
            .collect();
        Ok(batch)
    }
}

/// In-memory metric sink capturing appended batches for inspection.
#[derive(Debug, Default)]
pub struct MemoryMetricSink {
    batches: Mutex<Vec<Vec<MetricRecord>>>,
    fail_appends: Mutex<usize>,
    append_delay: Mutex<Option<Duration>>,
}

impl MemoryMetricSink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` appends fail with [`SinkError::Rejected`].
    pub fn fail_appends(&self, count: usize) {
        *self.fail_appends.lock() = count;
    }

    /// Injected append failures not yet consumed.
    pub fn remaining_failures(&self) -> usize {
        *self.fail_appends.lock()
    }

    /// Delay every successful append, to widen contention windows in tests.
    pub fn set_append_delay(&self, delay: Duration) {
        *self.append_delay.lock() = Some(delay);
    }

    /// All batches appended so far, in arrival order.
    pub fn batches(&self) -> Vec<Vec<MetricRecord>> {
        self.batches.lock().clone()
    }

    /// All records appended so far, flattened in arrival order.
    pub fn records(&self) -> Vec<MetricRecord> {
        self.batches.lock().iter().flatten().cloned().collect()
    }
}

#[async_trait]
impl MetricSink for MemoryMetricSink {
    async fn append(&self, batch: Vec<MetricRecord>) -> Result<(), SinkError> {
        {
            let mut failures = self.fail_appends.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(SinkError::Rejected("injected append failure".to_owned()));
            }
        }
        let delay = *self.append_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.batches.lock().push(batch);
        Ok(())
    }
}

/// In-memory checkpoint store with injectable unavailability windows.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    markers: Mutex<HashMap<TopicKey, MessageId>>,
    unavailable: Mutex<usize>,
    fail_commits: Mutex<usize>,
}

impl MemoryCheckpointStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate a marker, as if committed by an earlier run.
    pub fn seed(&self, topic: TopicKey, marker: MessageId) {
        self.markers.lock().insert(topic, marker);
    }

    /// Make the next `count` loads or commits fail as unavailable.
    pub fn set_unavailable(&self, count: usize) {
        *self.unavailable.lock() = count;
    }

    /// Make the next `count` commits fail while loads keep working.
    pub fn fail_commits(&self, count: usize) {
        *self.fail_commits.lock() = count;
    }

    /// Snapshot of the committed markers.
    pub fn markers(&self) -> HashMap<TopicKey, MessageId> {
        self.markers.lock().clone()
    }

    fn check_available(&self) -> Result<(), CheckpointError> {
        let mut unavailable = self.unavailable.lock();
        if *unavailable > 0 {
            *unavailable -= 1;
            return Err(CheckpointError::Unavailable(
                "injected outage".to_owned(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load_marker(&self, topic: &TopicKey) -> Result<Option<MessageId>, CheckpointError> {
        self.check_available()?;
        Ok(self.markers.lock().get(topic).cloned())
    }

    async fn commit_markers(
        &self,
        markers: &HashMap<TopicKey, MessageId>,
    ) -> Result<(), CheckpointError> {
        self.check_available()?;
        {
            let mut failures = self.fail_commits.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(CheckpointError::Unavailable(
                    "injected commit failure".to_owned(),
                ));
            }
        }
        let mut committed = self.markers.lock();
        for (topic, marker) in markers {
            committed.insert(topic.clone(), marker.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topic() -> TopicKey {
        TopicKey::new("system", "metrics0")
    }

    #[tokio::test]
    async fn fetch_resumes_after_marker() {
        let source = MemoryMessageSource::new();
        let first = source.publish(&topic(), &b"a"[..]);
        let _second = source.publish(&topic(), &b"b"[..]);
        let third = source.publish(&topic(), &b"c"[..]);

        let batch = source
            .fetch(&topic(), FetchStart::After(first), 10)
            .await
            .unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[1].id, third);

        let bounded = source
            .fetch(&topic(), FetchStart::Beginning, 2)
            .await
            .unwrap();
        assert_eq!(bounded.len(), 2);
    }

    #[tokio::test]
    async fn injected_fetch_failures_are_transient() {
        let source = MemoryMessageSource::new();
        source.publish(&topic(), &b"a"[..]);
        source.fail_fetches(1);

        let err = source
            .fetch(&topic(), FetchStart::Beginning, 10)
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::Unavailable(_)));

        let batch = source
            .fetch(&topic(), FetchStart::Beginning, 10)
            .await
            .unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn sink_rejects_then_recovers() {
        let sink = MemoryMetricSink::new();
        sink.fail_appends(1);
        let record = MetricRecord::new(indexmap::IndexMap::new(), 1, Vec::new());

        assert!(sink.append(vec![record.clone()]).await.is_err());
        sink.append(vec![record]).await.unwrap();
        assert_eq!(sink.records().len(), 1);
    }

    #[tokio::test]
    async fn commit_merges_markers() {
        let store = MemoryCheckpointStore::new();
        let other = TopicKey::new("system", "metrics1");
        store.seed(other.clone(), MessageId::from_sequence(5));

        let mut update = HashMap::new();
        update.insert(topic(), MessageId::from_sequence(9));
        store.commit_markers(&update).await.unwrap();

        let markers = store.markers();
        assert_eq!(markers.get(&topic()), Some(&MessageId::from_sequence(9)));
        assert_eq!(markers.get(&other), Some(&MessageId::from_sequence(5)));
    }

    #[tokio::test]
    async fn unavailability_window_expires() {
        let store = MemoryCheckpointStore::new();
        store.set_unavailable(2);
        assert!(store.load_marker(&topic()).await.is_err());
        assert!(store.load_marker(&topic()).await.is_err());
        assert!(store.load_marker(&topic()).await.unwrap().is_none());
    }
}
