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
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use m_pipe_common::config::ProcessorConfig;
use m_pipe_record::{RecordCodec, TopicKey};
use m_pipe_store::{CheckpointError, CheckpointStore, MessageSource, MetricSink};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::buffer::RecordBuffer;
use crate::consumer::TopicConsumer;
use crate::coordinator::PersistCoordinator;
use crate::metrics::ProcessorMetrics;
use crate::MarkerMap;

/// Retry cadence while the checkpoint store is unavailable at startup.
const STARTUP_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Lifecycle of the processor service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    /// Constructed, not yet running.
    Idle,
    /// Loading checkpoints for every configured topic.
    Starting,
    /// Consumer tasks are active.
    Running,
    /// Stop requested; consumers draining out.
    Stopping,
    /// Terminal; further stop requests are no-ops.
    Stopped,
}

/// The metrics processor service: owns one consumer task per topic, the
/// shared record buffer, and the persistence coordinator.
pub struct MetricsProcessor {
    config: ProcessorConfig,
    topics: Vec<TopicKey>,
    source: Arc<dyn MessageSource>,
    codec: Arc<dyn RecordCodec>,
    checkpoints: Arc<dyn CheckpointStore>,
    buffer: Arc<RecordBuffer>,
    markers: MarkerMap,
    coordinator: Arc<PersistCoordinator>,
    metrics: Option<ProcessorMetrics>,
    state: watch::Sender<ServiceState>,
    shutdown: broadcast::Sender<()>,
    stop_requested: AtomicBool,
}

impl MetricsProcessor {
    /// Assemble a processor over the given collaborators. Topics are
    /// provisioned from the configured prefix and count.
    pub fn new(
        config: ProcessorConfig,
        source: Arc<dyn MessageSource>,
        codec: Arc<dyn RecordCodec>,
        sink: Arc<dyn MetricSink>,
        checkpoints: Arc<dyn CheckpointStore>,
        metrics: Option<ProcessorMetrics>,
    ) -> Arc<Self> {
        let topics =
            TopicKey::provision(&config.namespace, &config.topic_prefix, config.topic_count);
        let buffer = Arc::new(RecordBuffer::new(config.queue_size));
        let markers: MarkerMap = Arc::new(RwLock::new(HashMap::new()));
        let coordinator = Arc::new(PersistCoordinator::new(
            buffer.clone(),
            markers.clone(),
            sink,
            checkpoints.clone(),
            config.context_tags.clone(),
            metrics.clone(),
        ));
        let (state, _) = watch::channel(ServiceState::Idle);
        let (shutdown, _) = broadcast::channel(4);
        Arc::new(Self {
            config,
            topics,
            source,
            codec,
            checkpoints,
            buffer,
            markers,
            coordinator,
            metrics,
            state,
            shutdown,
            stop_requested: AtomicBool::new(false),
        })
    }

    /// Observe lifecycle transitions.
    pub fn state(&self) -> watch::Receiver<ServiceState> {
        self.state.subscribe()
    }

    /// Topics this processor consumes.
    pub fn topics(&self) -> &[TopicKey] {
        &self.topics
    }

    /// Request a stop: flags the consumers, wakes any insert blocked on
    /// buffer capacity, and lets `run` finish with a final flush.
    /// Idempotent.
    pub fn stop(&self) {
        if self.stop_requested.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("stopping metrics processor");
        let _ = self.shutdown.send(());
        self.buffer.close();
    }

    /// Drive the full lifecycle: load checkpoints, run one consumer task
    /// per topic, block until all exit, then flush residual records.
    /// Returns once the service reaches `Stopped`.
    pub async fn run(&self) {
        self.transition(ServiceState::Starting);
        info!(
            topics = self.topics.len(),
            queue_size = self.config.queue_size,
            "starting metrics processor"
        );

        if !self.load_markers().await || self.stop_requested() {
            self.transition(ServiceState::Stopped);
            info!("metrics processor stopped before consuming");
            return;
        }

        self.transition(ServiceState::Running);
        let fetch_limit = self.config.fetch_limit();
        let mut handles: Vec<JoinHandle<()>> = Vec::new();
        for topic in &self.topics {
            let consumer = TopicConsumer {
                topic: topic.clone(),
                source: self.source.clone(),
                codec: self.codec.clone(),
                buffer: self.buffer.clone(),
                markers: self.markers.clone(),
                coordinator: self.coordinator.clone(),
                fetch_limit,
                process_interval: self.config.process_interval,
                max_delay: self.config.max_delay,
                metrics: self.metrics.clone(),
                last_buffered_ms: 0,
            };
            handles.push(tokio::spawn(consumer.run(self.shutdown.subscribe())));
        }

        // A stop between the Running transition and the subscribe calls
        // above would be lost; every receiver exists now, so re-signal.
        if self.stop_requested() {
            let _ = self.shutdown.send(());
        }

        for handle in handles {
            if let Err(err) = handle.await {
                warn!(error = %err, "consumer join error");
            }
        }

        self.transition(ServiceState::Stopping);
        // A clean shutdown keeps everything that was already fetched.
        self.coordinator.final_flush().await;
        self.transition(ServiceState::Stopped);
        info!("metrics processor stopped");
    }

    /// Load every topic's committed marker, retrying while the checkpoint
    /// store is unavailable. Returns `false` when a stop request aborted
    /// the phase.
    async fn load_markers(&self) -> bool {
        let mut shutdown = self.shutdown.subscribe();
        for topic in &self.topics {
            loop {
                if self.stop_requested() {
                    info!("stop requested while loading checkpoints; aborting startup");
                    return false;
                }
                match self.checkpoints.load_marker(topic).await {
                    Ok(Some(marker)) => {
                        debug!(topic = %topic, marker = %marker, "resuming from committed checkpoint");
                        self.markers.write().insert(topic.clone(), marker);
                        break;
                    }
                    Ok(None) => {
                        debug!(topic = %topic, "no checkpoint recorded; replaying from beginning");
                        break;
                    }
                    Err(CheckpointError::Unavailable(reason)) => {
                        debug!(topic = %topic, %reason, "checkpoint store unavailable; retrying");
                        tokio::select! {
                            _ = shutdown.recv() => {}
                            _ = tokio::time::sleep(STARTUP_RETRY_INTERVAL) => {}
                        }
                    }
                    Err(err) => {
                        // A torn checkpoint must not keep the whole service
                        // down; the topic replays from the beginning.
                        warn!(topic = %topic, error = %err, "cannot read checkpoint; replaying from beginning");
                        break;
                    }
                }
            }
        }
        true
    }

    /// Spawn `run` on the current runtime and return a handle for
    /// observing and stopping the service.
    pub fn spawn(self: Arc<Self>) -> ProcessorHandle {
        let processor = self.clone();
        let task = tokio::spawn(async move { processor.run().await });
        ProcessorHandle {
            processor: self,
            task: Mutex::new(Some(task)),
        }
    }

    fn transition(&self, next: ServiceState) {
        self.state.send_replace(next);
    }

    fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }
}

/// Handle over a spawned [`MetricsProcessor`] task.
pub struct ProcessorHandle {
    processor: Arc<MetricsProcessor>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ProcessorHandle {
    /// Observe lifecycle transitions.
    pub fn state(&self) -> watch::Receiver<ServiceState> {
        self.processor.state()
    }

    /// Request a stop without waiting for completion.
    pub fn stop(&self) {
        self.processor.stop();
    }

    /// Request a stop and wait for the service task to finish.
    pub async fn shutdown(&self) {
        self.processor.stop();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!(error = %err, "processor join error");
            }
        }
    }

    /// Access the underlying service.
    pub fn processor(&self) -> Arc<MetricsProcessor> {
        self.processor.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;
    use m_pipe_record::{JsonRecordCodec, MetricRecord, MetricValue};
    use m_pipe_store::{MemoryCheckpointStore, MemoryMessageSource, MemoryMetricSink};

    fn config(topic_count: usize, queue_size: usize) -> ProcessorConfig {
        let mut config = ProcessorConfig::default();
        config.topic_count = topic_count;
        config.queue_size = queue_size;
        config.process_interval = Duration::from_millis(10);
        config
    }

    fn record(timestamp: i64) -> MetricRecord {
        MetricRecord::new(
            IndexMap::new(),
            timestamp,
            vec![MetricValue::counter("app.count", 1)],
        )
    }

    fn processor(
        config: ProcessorConfig,
        source: Arc<MemoryMessageSource>,
        sink: Arc<MemoryMetricSink>,
        checkpoints: Arc<MemoryCheckpointStore>,
    ) -> Arc<MetricsProcessor> {
        MetricsProcessor::new(
            config,
            source,
            Arc::new(JsonRecordCodec),
            sink,
            checkpoints,
            None,
        )
    }

    async fn wait_for_state(
        mut state: watch::Receiver<ServiceState>,
        expected: ServiceState,
    ) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if *state.borrow() == expected {
                    return;
                }
                state.changed().await.expect("state channel open");
            }
        })
        .await
        .expect("state reached in time");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn consumes_and_stops_cleanly() {
        let source = Arc::new(MemoryMessageSource::new());
        let sink = Arc::new(MemoryMetricSink::new());
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let service = processor(config(2, 32), source.clone(), sink.clone(), checkpoints.clone());

        let topics = service.topics().to_vec();
        for topic in &topics {
            for timestamp in 1..=5 {
                source.publish_record(topic, &record(timestamp));
            }
        }

        let handle = service.spawn();
        wait_for_state(handle.state(), ServiceState::Running).await;

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let data_records = sink
                    .records()
                    .iter()
                    .filter(|r| r.values[0].name == "app.count")
                    .count();
                if data_records == 10 {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("all published records persisted");

        handle.shutdown().await;
        assert_eq!(*handle.state().borrow(), ServiceState::Stopped);

        let markers = checkpoints.markers();
        for topic in &topics {
            assert!(markers.contains_key(topic), "marker committed for {topic}");
        }
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_terminal() {
        let source = Arc::new(MemoryMessageSource::new());
        let sink = Arc::new(MemoryMetricSink::new());
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let service = processor(config(1, 8), source, sink, checkpoints);

        let handle = service.spawn();
        handle.shutdown().await;
        assert_eq!(*handle.state().borrow(), ServiceState::Stopped);

        // Further stop requests are no-ops.
        handle.stop();
        handle.shutdown().await;
        assert_eq!(*handle.state().borrow(), ServiceState::Stopped);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_during_unavailable_startup_ends_stopped() {
        let source = Arc::new(MemoryMessageSource::new());
        let sink = Arc::new(MemoryMetricSink::new());
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        // Far more outages than the startup loop can clear quickly.
        checkpoints.set_unavailable(10_000);

        let service = processor(config(1, 8), source, sink.clone(), checkpoints);
        let handle = service.spawn();
        wait_for_state(handle.state(), ServiceState::Starting).await;

        handle.shutdown().await;
        assert_eq!(*handle.state().borrow(), ServiceState::Stopped);
        assert!(sink.records().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn startup_outage_clears_and_service_consumes() {
        let source = Arc::new(MemoryMessageSource::new());
        let sink = Arc::new(MemoryMetricSink::new());
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        checkpoints.set_unavailable(2);

        let service = processor(config(1, 8), source.clone(), sink.clone(), checkpoints);
        let topic = service.topics()[0].clone();
        source.publish_record(&topic, &record(1));

        let handle = service.spawn();
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if !sink.records().is_empty() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .expect("record persisted after outage cleared");

        handle.shutdown().await;
    }
}
