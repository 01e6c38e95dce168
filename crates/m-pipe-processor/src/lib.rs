//! ---
//! mpipe_section: "04-consumer-orchestration"
//! mpipe_subsection: "module"
//! mpipe_type: "source"
//! mpipe_scope: "code"
//! mpipe_description: "Metrics processor service coordinating consumers and persistence."
//! mpipe_version: "v0.0.0-prealpha"
//! mpipe_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! The metrics processor: one consumer task per topic feeds a shared
//! bounded buffer; whichever consumer wins a non-blocking gate drains the
//! buffer, writes the batch to the metric sink, and commits every topic's
//! marker to the checkpoint store in one coordinated pass.

use std::collections::HashMap;
use std::sync::Arc;

use m_pipe_record::{MessageId, TopicKey};
use parking_lot::RwLock;

pub mod buffer;
mod consumer;
mod coordinator;
pub mod gate;
pub mod metrics;
pub mod service;

pub use buffer::{BufferClosed, RecordBuffer};
pub use gate::PersistGate;
pub use metrics::{new_registry, ProcessorMetrics, SharedRegistry};
pub use service::{MetricsProcessor, ProcessorHandle, ServiceState};

/// Shared topic → marker map: each consumer updates its own entry, the
/// persistence coordinator snapshots the whole map at commit time.
pub(crate) type MarkerMap = Arc<RwLock<HashMap<TopicKey, MessageId>>>;
