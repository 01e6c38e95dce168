//! ---
//! mpipe_section: "04-consumer-orchestration"
//! mpipe_subsection: "module"
//! mpipe_type: "source"
//! mpipe_scope: "code"
//! mpipe_description: "Metrics processor service coordinating consumers and persistence."
//! mpipe_version: "v0.0.0-prealpha"
//! mpipe_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use m_pipe_common::time::{epoch_millis, seconds_to_millis};
use m_pipe_record::{RecordCodec, TopicKey};
use m_pipe_store::{FetchStart, MessageSource, SourceError};
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

use crate::buffer::RecordBuffer;
use crate::coordinator::{PersistCoordinator, PersistOutcome};
use crate::metrics::ProcessorMetrics;
use crate::MarkerMap;

/// Reader loop for one topic: fetch, decode, buffer, advance the marker,
/// then opportunistically run a persistence pass.
pub(crate) struct TopicConsumer {
    pub(crate) topic: TopicKey,
    pub(crate) source: Arc<dyn MessageSource>,
    pub(crate) codec: Arc<dyn RecordCodec>,
    pub(crate) buffer: Arc<RecordBuffer>,
    pub(crate) markers: MarkerMap,
    pub(crate) coordinator: Arc<PersistCoordinator>,
    pub(crate) fetch_limit: usize,
    pub(crate) process_interval: Duration,
    pub(crate) max_delay: Duration,
    pub(crate) metrics: Option<ProcessorMetrics>,
    /// Wall-clock milliseconds of the newest record this consumer buffered.
    pub(crate) last_buffered_ms: i64,
}

impl TopicConsumer {
    pub(crate) async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        loop {
            let Some(sleep_for) = self.cycle().await else {
                debug!(topic = %self.topic, "buffer closed; consumer exiting");
                break;
            };
            tokio::select! {
                biased;
                _ = shutdown.recv() => break,
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }
        debug!(topic = %self.topic, "consumer loop exited");
    }

    /// One fetch/decode/buffer cycle. Returns the sleep before the next
    /// cycle, or `None` once the buffer has been closed for shutdown.
    async fn cycle(&mut self) -> Option<Duration> {
        match self.process_batch().await {
            Ok(next) => next,
            Err(err) => {
                warn!(topic = %self.topic, error = %err, "failed to process metrics; retrying next cycle");
                Some(self.process_interval)
            }
        }
    }

    async fn process_batch(&mut self) -> Result<Option<Duration>, SourceError> {
        let start = match self.markers.read().get(&self.topic) {
            Some(marker) => {
                trace!(topic = %self.topic, marker = %marker, "fetching after marker");
                FetchStart::After(marker.clone())
            }
            None => {
                trace!(topic = %self.topic, "fetching from beginning");
                FetchStart::Beginning
            }
        };
        let batch = self
            .source
            .fetch(&self.topic, start, self.fetch_limit)
            .await?;

        let mut last_observed = None;
        let mut closed = false;
        for message in batch {
            match self.codec.decode(&message.payload) {
                Ok(record) => {
                    let observed_ms = seconds_to_millis(record.timestamp);
                    if self.buffer.push(record).await.is_err() {
                        closed = true;
                        break;
                    }
                    self.last_buffered_ms = observed_ms;
                    last_observed = Some(message.id);
                }
                Err(err) => {
                    // A malformed message never blocks the stream: skip it
                    // and advance the marker past it.
                    warn!(topic = %self.topic, message = %message.id, error = %err, "skipping undecodable message");
                    if let Some(metrics) = &self.metrics {
                        metrics.inc_decode_failure();
                    }
                    last_observed = Some(message.id);
                }
            }
        }

        if let Some(id) = last_observed {
            self.markers.write().insert(self.topic.clone(), id);
        }
        if closed {
            return Ok(None);
        }
        if self.buffer.is_empty() {
            return Ok(Some(self.process_interval));
        }

        if self.coordinator.try_persist().await == PersistOutcome::Busy {
            trace!(topic = %self.topic, "another consumer holds the persist gate");
        }

        // Skip the sleep entirely while this topic lags behind the stream.
        if self.last_buffered_ms > 0 {
            let lag = epoch_millis() - self.last_buffered_ms;
            if lag > self.max_delay.as_millis() as i64 {
                return Ok(Some(Duration::ZERO));
            }
        }
        Ok(Some(self.process_interval))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use indexmap::IndexMap;
    use m_pipe_record::{JsonRecordCodec, MetricRecord, MetricValue};
    use m_pipe_store::{MemoryCheckpointStore, MemoryMessageSource, MemoryMetricSink};
    use parking_lot::RwLock;

    fn topic() -> TopicKey {
        TopicKey::new("system", "metrics0")
    }

    fn record(timestamp: i64) -> MetricRecord {
        MetricRecord::new(
            IndexMap::new(),
            timestamp,
            vec![MetricValue::counter("app.count", 1)],
        )
    }

    struct Fixture {
        source: Arc<MemoryMessageSource>,
        sink: Arc<MemoryMetricSink>,
        markers: MarkerMap,
        consumer: TopicConsumer,
    }

    fn fixture(capacity: usize) -> Fixture {
        let source = Arc::new(MemoryMessageSource::new());
        let sink = Arc::new(MemoryMetricSink::new());
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let buffer = Arc::new(RecordBuffer::new(capacity));
        let markers: MarkerMap = Arc::new(RwLock::new(HashMap::new()));
        let coordinator = Arc::new(PersistCoordinator::new(
            buffer.clone(),
            markers.clone(),
            sink.clone(),
            checkpoints,
            IndexMap::new(),
            None,
        ));
        let consumer = TopicConsumer {
            topic: topic(),
            source: source.clone(),
            codec: Arc::new(JsonRecordCodec),
            buffer,
            markers: markers.clone(),
            coordinator,
            fetch_limit: 100,
            process_interval: Duration::from_millis(10),
            max_delay: Duration::from_secs(60),
            metrics: None,
            last_buffered_ms: 0,
        };
        Fixture {
            source,
            sink,
            markers,
            consumer,
        }
    }

    #[tokio::test]
    async fn batch_is_buffered_persisted_and_marker_advanced() {
        let mut fixture = fixture(16);
        for timestamp in 1..=3 {
            fixture.source.publish_record(&topic(), &record(timestamp));
        }
        let last = fixture.source.publish_record(&topic(), &record(4));

        fixture.consumer.process_batch().await.unwrap();

        // Four records plus the coordinator's self-observability record.
        assert_eq!(fixture.sink.records().len(), 5);
        assert_eq!(fixture.markers.read().get(&topic()), Some(&last));
    }

    #[tokio::test]
    async fn undecodable_message_is_skipped_but_marker_advances() {
        let mut fixture = fixture(16);
        fixture.source.publish_record(&topic(), &record(1));
        fixture.source.publish(&topic(), &b"{not json"[..]);
        let last = fixture.source.publish_record(&topic(), &record(2));

        fixture.consumer.process_batch().await.unwrap();

        let persisted = fixture.sink.records();
        // Two decodable records plus the self-observability record.
        assert_eq!(persisted.len(), 3);
        assert_eq!(fixture.markers.read().get(&topic()), Some(&last));
    }

    #[tokio::test]
    async fn undecodable_tail_still_advances_marker() {
        let mut fixture = fixture(16);
        fixture.source.publish_record(&topic(), &record(1));
        let last = fixture.source.publish(&topic(), &b"garbage"[..]);

        fixture.consumer.process_batch().await.unwrap();
        assert_eq!(fixture.markers.read().get(&topic()), Some(&last));

        // The next cycle fetches nothing new: the malformed tail stays skipped.
        let batch = fixture
            .source
            .fetch(&topic(), FetchStart::After(last), 10)
            .await
            .unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn source_outage_is_retried_with_unchanged_marker() {
        let mut fixture = fixture(16);
        fixture.source.publish_record(&topic(), &record(1));
        fixture.source.fail_fetches(1);

        let sleep_for = fixture.consumer.cycle().await;
        assert_eq!(sleep_for, Some(Duration::from_millis(10)));
        assert!(fixture.markers.read().get(&topic()).is_none());

        fixture.consumer.process_batch().await.unwrap();
        assert!(fixture.markers.read().get(&topic()).is_some());
    }

    #[tokio::test]
    async fn closed_buffer_ends_the_loop() {
        let mut fixture = fixture(1);
        fixture.source.publish_record(&topic(), &record(1));
        fixture.source.publish_record(&topic(), &record(2));
        fixture.consumer.buffer.close();

        let next = fixture.consumer.process_batch().await.unwrap();
        assert!(next.is_none());
    }
}
