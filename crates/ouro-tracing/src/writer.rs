//! JSONL persistence for trajectory records.
//!
//! Append-only, one record per line, flushed per write so a crashed run
//! still leaves a readable trajectory.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::types::TrajectoryRecord;

/// Error type for trajectory writing operations.
#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Configuration for the trajectory writer.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Full path to the trajectory file.
    pub path: PathBuf,

    /// Whether writing is enabled.
    pub enabled: bool,
}

impl WriterConfig {
    /// Write to the given file.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            enabled: true,
        }
    }

    /// Disable writing entirely.
    pub fn disabled() -> Self {
        Self {
            path: PathBuf::new(),
            enabled: false,
        }
    }
}

/// Writes trajectory records to a JSONL file.
///
/// Thread-safe via internal mutex.
pub struct TrajectoryWriter {
    config: WriterConfig,
    file: Mutex<Option<BufWriter<File>>>,
}

impl TrajectoryWriter {
    /// Create a new writer with the given configuration.
    pub fn new(config: WriterConfig) -> Result<Self, WriteError> {
        if config.enabled {
            if let Some(parent) = config.path.parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent)?;
                }
            }
        }
        Ok(Self {
            config,
            file: Mutex::new(None),
        })
    }

    /// Append one record.
    pub fn write(&self, record: &TrajectoryRecord) -> Result<(), WriteError> {
        if !self.config.enabled {
            return Ok(());
        }

        let mut guard = self.file.lock().unwrap();
        if guard.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.config.path)?;
            *guard = Some(BufWriter::new(file));
        }

        if let Some(ref mut writer) = *guard {
            writeln!(writer, "{}", record.to_record())?;
            writer.flush()?;
        }
        Ok(())
    }

    /// The path being written to.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Read all records back from a trajectory file, skipping blank lines.
    pub fn read_records(path: &Path) -> Result<Vec<TrajectoryRecord>, WriteError> {
        let content = fs::read_to_string(path)?;
        let records: Result<Vec<TrajectoryRecord>, _> = content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(TrajectoryRecord::from_record)
            .collect();
        Ok(records?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_write_and_read_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("trajectory.jsonl");
        let writer = TrajectoryWriter::new(WriterConfig::file(&path)).unwrap();

        writer
            .write(&TrajectoryRecord::metadata(&serde_json::json!({"m": 1})))
            .unwrap();
        writer
            .write(&TrajectoryRecord::done(&serde_json::json!({"answer": "42"})))
            .unwrap();

        let records = TrajectoryWriter::read_records(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].event_name(), "metadata");
        assert_eq!(records[1].event_name(), "done");
    }

    #[test]
    fn test_creates_parent_directories() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("deep").join("t.jsonl");
        let writer = TrajectoryWriter::new(WriterConfig::file(&path)).unwrap();

        writer.write(&TrajectoryRecord::error("boom")).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_disabled_writer_writes_nothing() {
        let writer = TrajectoryWriter::new(WriterConfig::disabled()).unwrap();
        writer.write(&TrajectoryRecord::error("ignored")).unwrap();
    }

    #[test]
    fn test_appends_across_writers() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.jsonl");

        let writer = TrajectoryWriter::new(WriterConfig::file(&path)).unwrap();
        writer.write(&TrajectoryRecord::error("first")).unwrap();
        drop(writer);

        let writer = TrajectoryWriter::new(WriterConfig::file(&path)).unwrap();
        writer.write(&TrajectoryRecord::error("second")).unwrap();

        let records = TrajectoryWriter::read_records(&path).unwrap();
        assert_eq!(records.len(), 2);
    }
}
