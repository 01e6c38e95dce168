//! ---
//! mpipe_section: "04-consumer-orchestration"
//! mpipe_subsection: "module"
//! mpipe_type: "source"
//! mpipe_scope: "code"
//! mpipe_description: "Metrics processor service coordinating consumers and persistence."
//! mpipe_version: "v0.0.0-prealpha"
//! mpipe_owner: "tbd"
//! ---
use std::collections::VecDeque;

use m_pipe_record::MetricRecord;
use parking_lot::Mutex;
use tokio::sync::Semaphore;

/// Raised by [`RecordBuffer::push`] once the buffer has been closed.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("record buffer closed")]
pub struct BufferClosed;

/// Bounded FIFO buffer shared by all topic consumers.
///
/// `push` awaits a free slot, which is the pipeline's sole backpressure
/// point: the fastest topic is throttled down to the drain rate. Closing
/// the buffer wakes every pusher blocked on capacity so shutdown never
/// hangs on a full buffer. Draining is non-blocking and preserves
/// insertion order.
pub struct RecordBuffer {
    capacity: usize,
    slots: Semaphore,
    queue: Mutex<VecDeque<MetricRecord>>,
}

impl RecordBuffer {
    /// Create a buffer holding at most `capacity` records.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            slots: Semaphore::new(capacity),
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Records currently buffered.
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Whether the buffer currently holds no records.
    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Append one record, waiting for a free slot when the buffer is full.
    pub async fn push(&self, record: MetricRecord) -> Result<(), BufferClosed> {
        let permit = self.slots.acquire().await.map_err(|_| BufferClosed)?;
        permit.forget();
        self.queue.lock().push_back(record);
        Ok(())
    }

    /// Remove and return up to `max` records in insertion order, freeing
    /// their slots. Never blocks; a single call observes a consistent
    /// prefix of the buffer.
    pub fn drain(&self, max: usize) -> Vec<MetricRecord> {
        let drained: Vec<MetricRecord> = {
            let mut queue = self.queue.lock();
            let take = max.min(queue.len());
            queue.drain(..take).collect()
        };
        if !drained.is_empty() {
            self.slots.add_permits(drained.len());
        }
        drained
    }

    /// Close the buffer: pending and future `push` calls fail with
    /// [`BufferClosed`]. Already-buffered records remain drainable.
    pub fn close(&self) {
        self.slots.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use indexmap::IndexMap;
    use m_pipe_record::MetricValue;
    use tokio::time::timeout;

    fn record(timestamp: i64) -> MetricRecord {
        MetricRecord::new(
            IndexMap::new(),
            timestamp,
            vec![MetricValue::counter("test.count", 1)],
        )
    }

    #[tokio::test]
    async fn drain_preserves_insertion_order() {
        let buffer = RecordBuffer::new(4);
        for timestamp in 1..=3 {
            buffer.push(record(timestamp)).await.unwrap();
        }
        let drained = buffer.drain(10);
        let timestamps: Vec<i64> = drained.iter().map(|r| r.timestamp).collect();
        assert_eq!(timestamps, vec![1, 2, 3]);
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn drain_respects_bound_and_frees_slots() {
        let buffer = RecordBuffer::new(3);
        for timestamp in 1..=3 {
            buffer.push(record(timestamp)).await.unwrap();
        }
        let first = buffer.drain(2);
        assert_eq!(first.len(), 2);
        assert_eq!(buffer.len(), 1);

        // The two freed slots are immediately reusable.
        buffer.push(record(4)).await.unwrap();
        buffer.push(record(5)).await.unwrap();
        assert_eq!(buffer.len(), 3);
    }

    #[tokio::test]
    async fn push_blocks_at_capacity_until_drained() {
        let buffer = Arc::new(RecordBuffer::new(2));
        buffer.push(record(1)).await.unwrap();
        buffer.push(record(2)).await.unwrap();

        let blocked = {
            let buffer = buffer.clone();
            tokio::spawn(async move { buffer.push(record(3)).await })
        };
        // The third push must not complete while the buffer is full.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());

        let drained = buffer.drain(buffer.capacity());
        assert_eq!(drained.len(), 2);

        timeout(Duration::from_secs(1), blocked)
            .await
            .expect("push unblocks after drain")
            .unwrap()
            .unwrap();
        assert_eq!(buffer.len(), 1);
    }

    #[tokio::test]
    async fn close_wakes_blocked_pusher() {
        let buffer = Arc::new(RecordBuffer::new(1));
        buffer.push(record(1)).await.unwrap();

        let blocked = {
            let buffer = buffer.clone();
            tokio::spawn(async move { buffer.push(record(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        buffer.close();

        let result = timeout(Duration::from_secs(1), blocked)
            .await
            .expect("close interrupts blocked push")
            .unwrap();
        assert_eq!(result, Err(BufferClosed));

        // Residual contents stay drainable after close.
        assert_eq!(buffer.drain(10).len(), 1);
    }
}
