//! ---
//! mpipe_section: "03-persistence-checkpointing"
//! mpipe_subsection: "module"
//! mpipe_type: "source"
//! mpipe_scope: "code"
//! mpipe_description: "Store contracts and storage bindings."
//! mpipe_version: "v0.0.0-prealpha"
//! mpipe_owner: "tbd"
//! ---
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use m_pipe_record::{MessageId, TopicKey};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{CheckpointError, CheckpointStore};

/// Current checkpoint document version.
const CHECKPOINT_FORMAT_VERSION: u16 = 1;

/// On-disk checkpoint document: one JSON object holding every topic's
/// marker, base64-encoded. Commits rewrite the whole document through a
/// temp-file rename, so a torn write never clobbers the previous state.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CheckpointDocument {
    version: u16,
    updated_at: DateTime<Utc>,
    markers: BTreeMap<String, String>,
}

impl CheckpointDocument {
    fn empty() -> Self {
        Self {
            version: CHECKPOINT_FORMAT_VERSION,
            updated_at: Utc::now(),
            markers: BTreeMap::new(),
        }
    }
}

/// File-backed checkpoint store keyed by rendered topic identity.
pub struct FileCheckpointStore {
    path: PathBuf,
    // Serialises read-modify-write commits against this path.
    commit_guard: Mutex<()>,
}

impl FileCheckpointStore {
    /// Bind a store to a document path; the file is created on first commit.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            commit_guard: Mutex::new(()),
        }
    }

    /// Document path on disk.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_document(&self) -> Result<CheckpointDocument, CheckpointError> {
        if !self.path.exists() {
            return Ok(CheckpointDocument::empty());
        }
        let bytes = fs::read(&self.path)?;
        let document: CheckpointDocument = serde_json::from_slice(&bytes)?;
        if document.version != CHECKPOINT_FORMAT_VERSION {
            return Err(CheckpointError::Corrupt(format!(
                "unsupported checkpoint version {}",
                document.version
            )));
        }
        Ok(document)
    }

    fn write_document(&self, document: &CheckpointDocument) -> Result<(), CheckpointError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let staged = self.path.with_extension("tmp");
        fs::write(&staged, serde_json::to_vec_pretty(document)?)?;
        fs::rename(&staged, &self.path)?;
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load_marker(&self, topic: &TopicKey) -> Result<Option<MessageId>, CheckpointError> {
        let document = self.read_document()?;
        let Some(encoded) = document.markers.get(&topic.to_string()) else {
            return Ok(None);
        };
        let bytes = BASE64.decode(encoded).map_err(|err| {
            CheckpointError::Corrupt(format!("marker for {topic} is not base64: {err}"))
        })?;
        Ok(Some(MessageId::new(bytes)))
    }

    async fn commit_markers(
        &self,
        markers: &HashMap<TopicKey, MessageId>,
    ) -> Result<(), CheckpointError> {
        let _guard = self.commit_guard.lock();
        let mut document = self.read_document()?;
        for (topic, marker) in markers {
            document
                .markers
                .insert(topic.to_string(), BASE64.encode(marker.as_bytes()));
        }
        document.updated_at = Utc::now();
        self.write_document(&document)?;
        debug!(path = %self.path.display(), topics = markers.len(), "checkpoints committed");
        Ok(())
    }
}
