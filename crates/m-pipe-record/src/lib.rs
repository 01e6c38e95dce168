//! ---
//! mpipe_section: "02-record-data-model"
//! mpipe_subsection: "module"
//! mpipe_type: "source"
//! mpipe_scope: "code"
//! mpipe_description: "Metric record model and topic identities."
//! mpipe_version: "v0.0.0-prealpha"
//! mpipe_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Data model shared between the message sources, the processor, and the
//! metric sinks: topic identities, opaque read markers, decoded metric
//! records, and the codec seam turning raw payloads into records.

pub mod codec;
pub mod record;
pub mod topic;

pub use codec::{DecodeError, JsonRecordCodec, RecordCodec};
pub use record::{MetricKind, MetricRecord, MetricValue};
pub use topic::{MessageId, RawMessage, TopicKey};
