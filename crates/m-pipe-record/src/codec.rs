//! ---
//! mpipe_section: "02-record-data-model"
//! mpipe_subsection: "module"
//! mpipe_type: "source"
//! mpipe_scope: "code"
//! mpipe_description: "Metric record model and topic identities."
//! mpipe_version: "v0.0.0-prealpha"
//! mpipe_owner: "tbd"
//! ---
use bytes::Bytes;

use crate::record::MetricRecord;

/// Error raised when a raw payload cannot be decoded into a [`MetricRecord`].
///
/// Codecs must fail with this error and nothing else; any payload the codec
/// cannot understand is treated as malformed and skipped by the consumer.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The payload was not a valid encoding of a metric record.
    #[error("malformed metric record payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Decodes a raw message payload into a typed metric record.
pub trait RecordCodec: Send + Sync {
    /// Decode one payload. May fail per-message; a failure never carries
    /// meaning beyond "skip this message".
    fn decode(&self, payload: &[u8]) -> Result<MetricRecord, DecodeError>;
}

/// Reference codec: newline-free JSON documents.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonRecordCodec;

impl JsonRecordCodec {
    /// Encode a record the way [`RecordCodec::decode`] expects it; used by
    /// publishers and test fixtures.
    pub fn encode(record: &MetricRecord) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(record).map(Bytes::from)
    }
}

impl RecordCodec for JsonRecordCodec {
    fn decode(&self, payload: &[u8]) -> Result<MetricRecord, DecodeError> {
        Ok(serde_json::from_slice(payload)?)
    }
}
