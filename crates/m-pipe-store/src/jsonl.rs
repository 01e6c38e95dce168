//! ---
//! mpipe_section: "03-persistence-checkpointing"
//! mpipe_subsection: "module"
//! mpipe_type: "source"
//! mpipe_scope: "code"
//! mpipe_description: "Store contracts and storage bindings."
//! mpipe_version: "v0.0.0-prealpha"
//! mpipe_owner: "tbd"
//! ---
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use m_pipe_record::MetricRecord;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::Digest;

use crate::{MetricSink, SinkError};

/// Current sink file format version.
const SINK_FORMAT_VERSION: u16 = 1;

/// Sink file header stored as the first line of the file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SinkHeader {
    version: u16,
    created_at: DateTime<Utc>,
    hash: String,
}

impl SinkHeader {
    fn new() -> Self {
        let created_at = Utc::now();
        let hash = format!(
            "{:x}",
            sha2::Sha256::digest(created_at.to_rfc3339().as_bytes())
        );
        Self {
            version: SINK_FORMAT_VERSION,
            created_at,
            hash,
        }
    }
}

/// Append-only metric sink writing newline-delimited JSON records.
pub struct JsonlMetricSink {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl JsonlMetricSink {
    /// Open a sink file for appending, writing a header if the file is new.
    pub fn open(path: &Path) -> Result<Self, SinkError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let exists = path.exists();
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut writer = BufWriter::new(file);

        if !exists || is_empty(path)? {
            let header = SinkHeader::new();
            let line = serde_json::to_string(&header)?;
            writer.write_all(line.as_bytes())?;
            writer.write_all(b"\n")?;
            writer.flush()?;
        }

        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(writer),
        })
    }

    /// Access the current path on disk (useful for tests).
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl MetricSink for JsonlMetricSink {
    async fn append(&self, batch: Vec<MetricRecord>) -> Result<(), SinkError> {
        let mut writer = self.writer.lock();
        for record in &batch {
            let line = serde_json::to_string(record)?;
            writer.write_all(line.as_bytes())?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        Ok(())
    }
}

fn is_empty(path: &Path) -> Result<bool, SinkError> {
    Ok(fs::metadata(path)?.len() == 0)
}

/// Streaming reader over a sink file's records, in append order.
pub struct JsonlSinkReader {
    lines: std::io::Lines<BufReader<File>>,
}

impl JsonlSinkReader {
    /// Open the sink file for sequential reading.
    pub fn open(path: &Path) -> Result<Self, SinkError> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        let mut first_line = String::new();
        reader.read_line(&mut first_line)?; // discard header
        Ok(Self {
            lines: reader.lines(),
        })
    }
}

impl Iterator for JsonlSinkReader {
    type Item = Result<MetricRecord, SinkError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.lines.next()? {
            Ok(line) if line.trim().is_empty() => self.next(),
            Ok(line) => Some(serde_json::from_str(&line).map_err(SinkError::from)),
            Err(err) => Some(Err(err.into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;
    use m_pipe_record::MetricValue;
    use tempfile::tempdir;

    fn record(timestamp: i64, value: i64) -> MetricRecord {
        MetricRecord::new(
            IndexMap::new(),
            timestamp,
            vec![MetricValue::counter("events.count", value)],
        )
    }

    #[tokio::test]
    async fn append_and_read_back_in_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("metrics.jsonl");
        let sink = JsonlMetricSink::open(&path).unwrap();

        sink.append(vec![record(1, 10), record(2, 20)]).await.unwrap();
        sink.append(vec![record(3, 30)]).await.unwrap();

        let timestamps: Vec<i64> = JsonlSinkReader::open(&path)
            .unwrap()
            .map(|entry| entry.unwrap().timestamp)
            .collect();
        assert_eq!(timestamps, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn header_written_once_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("metrics.jsonl");

        {
            let sink = JsonlMetricSink::open(&path).unwrap();
            sink.append(vec![record(1, 1)]).await.unwrap();
        }
        {
            let sink = JsonlMetricSink::open(&path).unwrap();
            sink.append(vec![record(2, 2)]).await.unwrap();
        }

        let contents = fs::read_to_string(&path).unwrap();
        let header_lines = contents
            .lines()
            .filter(|line| line.contains("\"hash\""))
            .count();
        assert_eq!(header_lines, 1);

        let count = JsonlSinkReader::open(&path).unwrap().count();
        assert_eq!(count, 2);
    }
}
