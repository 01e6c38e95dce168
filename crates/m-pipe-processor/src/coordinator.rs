//! ---
//! mpipe_section: "04-consumer-orchestration"
//! mpipe_subsection: "module"
//! mpipe_type: "source"
//! mpipe_scope: "code"
//! mpipe_description: "Metrics processor service coordinating consumers and persistence."
//! mpipe_version: "v0.0.0-prealpha"
//! mpipe_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use m_pipe_common::time::{epoch_millis, epoch_seconds, seconds_to_millis};
use m_pipe_record::{MessageId, MetricRecord, MetricValue, TopicKey};
use m_pipe_store::{CheckpointStore, MetricSink};
use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use crate::buffer::RecordBuffer;
use crate::gate::PersistGate;
use crate::metrics::ProcessorMetrics;
use crate::MarkerMap;

/// Self-observability counter: records carried by the persisted batch.
const PROCESS_COUNT_METRIC: &str = "metrics.process.count";
/// Self-observability gauge: age of the newest record in the batch.
const PROCESS_DELAY_METRIC: &str = "metrics.process.delay.ms";

/// Cumulative progress is logged at most this often.
const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(60);

/// Result of an opportunistic persistence attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PersistOutcome {
    /// This caller held the gate and ran the pass.
    Persisted,
    /// Another consumer already holds the gate.
    Busy,
}

/// Single-flight drain of the shared buffer: sink write first, marker
/// commit second, gate released on every exit path.
pub(crate) struct PersistCoordinator {
    buffer: Arc<RecordBuffer>,
    markers: MarkerMap,
    sink: Arc<dyn MetricSink>,
    checkpoints: Arc<dyn CheckpointStore>,
    gate: PersistGate,
    context_tags: IndexMap<String, String>,
    metrics: Option<ProcessorMetrics>,
    records_persisted: AtomicU64,
    last_progress: Mutex<Option<Instant>>,
}

impl PersistCoordinator {
    pub(crate) fn new(
        buffer: Arc<RecordBuffer>,
        markers: MarkerMap,
        sink: Arc<dyn MetricSink>,
        checkpoints: Arc<dyn CheckpointStore>,
        context_tags: IndexMap<String, String>,
        metrics: Option<ProcessorMetrics>,
    ) -> Self {
        Self {
            buffer,
            markers,
            sink,
            checkpoints,
            gate: PersistGate::new(),
            context_tags,
            metrics,
            records_persisted: AtomicU64::new(0),
            last_progress: Mutex::new(None),
        }
    }

    /// Run a persistence pass if the gate is free; never waits for it.
    pub(crate) async fn try_persist(&self) -> PersistOutcome {
        let Some(_guard) = self.gate.try_acquire() else {
            return PersistOutcome::Busy;
        };
        self.persist_pass().await;
        PersistOutcome::Persisted
    }

    /// Best-effort pass for shutdown, once all consumers have exited.
    pub(crate) async fn final_flush(&self) {
        match self.gate.try_acquire() {
            Some(_guard) => self.persist_pass().await,
            // Consumers are joined before the final flush, so the gate can
            // only still be held if a pass was abandoned mid-flight.
            None => warn!("persist gate still held during final flush; skipping"),
        }
    }

    async fn persist_pass(&self) {
        // The snapshot is taken before the drain: marker updates landing
        // after this point ride along in the next pass, and a crash between
        // the sink write and the commit loses at most this pass's batch.
        let snapshot: HashMap<TopicKey, MessageId> = self.markers.read().clone();

        let drained = self.buffer.drain(self.buffer.capacity());
        if drained.is_empty() {
            trace!("nothing buffered; committing markers only");
        } else if !self.write_batch(drained).await {
            return;
        }
        self.commit_markers(snapshot).await;
    }

    /// Write one drained batch plus the synthetic self-observability
    /// record. Returns whether the sink accepted the batch.
    async fn write_batch(&self, mut batch: Vec<MetricRecord>) -> bool {
        let count = batch.len();
        let newest_timestamp = batch.last().map(|record| record.timestamp).unwrap_or(0);
        let delay_ms = (epoch_millis() - seconds_to_millis(newest_timestamp)).max(0);
        batch.push(self.self_record(count, delay_ms));

        match self.sink.append(batch).await {
            Ok(()) => {
                let total = self
                    .records_persisted
                    .fetch_add(count as u64, Ordering::Relaxed)
                    + count as u64;
                if let Some(metrics) = &self.metrics {
                    metrics.add_persisted(count as u64);
                    metrics.set_processing_delay_ms(delay_ms);
                }
                self.log_progress(total, delay_ms);
                true
            }
            Err(err) => {
                // The drained records are gone from the buffer; the loss is
                // bounded by the queue size and the markers stay uncommitted.
                error!(error = %err, dropped = count, "metric sink rejected batch");
                if let Some(metrics) = &self.metrics {
                    metrics.inc_persist_failure();
                }
                false
            }
        }
    }

    async fn commit_markers(&self, snapshot: HashMap<TopicKey, MessageId>) {
        if snapshot.is_empty() {
            return;
        }
        match self.checkpoints.commit_markers(&snapshot).await {
            Ok(()) => debug!(topics = snapshot.len(), "markers committed"),
            Err(err) => {
                // Markers stay advanced in memory, so the next successful
                // commit covers a wider jump; never a regression.
                error!(error = %err, "failed to commit markers");
                if let Some(metrics) = &self.metrics {
                    metrics.inc_checkpoint_failure();
                }
            }
        }
    }

    fn self_record(&self, count: usize, delay_ms: i64) -> MetricRecord {
        MetricRecord::new(
            self.context_tags.clone(),
            epoch_seconds(),
            vec![
                MetricValue::counter(PROCESS_COUNT_METRIC, count as i64),
                MetricValue::gauge(PROCESS_DELAY_METRIC, delay_ms),
            ],
        )
    }

    fn log_progress(&self, total: u64, delay_ms: i64) {
        let mut last = self.last_progress.lock();
        let now = Instant::now();
        let due = last
            .map(|at| now.duration_since(at) >= PROGRESS_LOG_INTERVAL)
            .unwrap_or(true);
        if due {
            *last = Some(now);
            debug!(total_records = total, delay_ms, "metric records persisted");
        }
    }
}
