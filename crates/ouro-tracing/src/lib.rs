//! ouro-tracing: the trajectory sink.
//!
//! One record per completion event (`metadata`, `iteration`, `done`,
//! `error`), newline-delimited and self-contained. Records round-trip via
//! `to_record`/`from_record`; consumers must ignore unknown fields.
//!
//! The driver talks to the sink through [`TrajectorySink`]; [`FileSink`]
//! persists to JSONL, [`NullSink`] discards.

pub mod types;
pub mod writer;

pub use types::TrajectoryRecord;
pub use writer::{TrajectoryWriter, WriteError, WriterConfig};

/// An event sink for completion trajectories.
///
/// Emission is best-effort: a sink must not fail the completion.
pub trait TrajectorySink: Send + Sync {
    fn emit(&self, record: &TrajectoryRecord);
}

/// Sink that persists records to a JSONL file.
pub struct FileSink {
    writer: TrajectoryWriter,
}

impl FileSink {
    /// Create a sink writing to the given path.
    pub fn new(path: impl Into<std::path::PathBuf>) -> Result<Self, WriteError> {
        Ok(Self {
            writer: TrajectoryWriter::new(WriterConfig::file(path))?,
        })
    }
}

impl TrajectorySink for FileSink {
    fn emit(&self, record: &TrajectoryRecord) {
        if let Err(e) = self.writer.write(record) {
            // Losing a trace line must not fail the completion.
            eprintln!("trajectory write failed: {}", e);
        }
    }
}

/// Sink that discards every record.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl TrajectorySink for NullSink {
    fn emit(&self, _record: &TrajectoryRecord) {}
}
