//! Run sessions.
//!
//! Every `ouro run` gets its own directory under `.ouro/sessions/` holding
//! the log file, the trajectory, and `run.json` - a record of what ran and
//! how it ended. The record is written when the session opens and updated
//! once the completion finishes, so an interrupted run still leaves its
//! configuration behind.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use ouro_rlm::{ChatCompletion, StopReason};
use serde::{Deserialize, Serialize};

use crate::config::Config;

/// What a session ran: captured at open time, before any LM call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    /// The session id (also the directory name).
    pub id: String,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// Backend model.
    pub model: String,
    /// Environment backend id.
    pub environment: String,
    /// Iteration budget.
    pub max_iterations: usize,
    /// Recursion depth limit.
    pub max_depth: u32,
    /// Preview of the prompt, once known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    /// How the run ended; absent while it is still going (or was cut off).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<RunOutcome>,
}

/// How a finished run ended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutcome {
    pub stop: StopReason,
    pub truncated: bool,
    pub fallback: bool,
    pub iterations: usize,
    pub total_tokens: u64,
    pub duration_ms: u64,
}

/// A run session: a directory plus the record describing it.
pub struct Session {
    dir: PathBuf,
    record: RunRecord,
}

impl Session {
    /// Open a fresh session under `<ouro_dir>/sessions/`, seeded from the
    /// effective configuration.
    pub fn create(ouro_dir: &Path, config: &Config) -> Result<Self> {
        let id = next_id();
        let dir = ouro_dir.join("sessions").join(&id);
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create session dir {}", dir.display()))?;

        let session = Self {
            dir,
            record: RunRecord {
                id,
                started_at: Utc::now(),
                model: config.backend.model.clone(),
                environment: config.environment.environment_type.clone(),
                max_iterations: config.limits.max_iterations,
                max_depth: config.limits.max_depth,
                prompt: None,
                outcome: None,
            },
        };
        session.save()?;
        Ok(session)
    }

    /// The session id.
    pub fn id(&self) -> &str {
        &self.record.id
    }

    /// The session directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Where this session's trajectory file lives.
    pub fn trajectory_path(&self) -> PathBuf {
        self.dir.join("trajectory.jsonl")
    }

    /// Record the prompt once it is known.
    pub fn set_prompt(&mut self, preview: impl Into<String>) -> Result<()> {
        self.record.prompt = Some(preview.into());
        self.save()
    }

    /// Record how the completion ended.
    pub fn finish(&mut self, completion: &ChatCompletion) -> Result<()> {
        self.record.outcome = Some(RunOutcome {
            stop: completion.metadata.stop,
            truncated: completion.metadata.truncated,
            fallback: completion.metadata.fallback,
            iterations: completion.iterations.len(),
            total_tokens: completion.usage.total_tokens(),
            duration_ms: completion.metadata.duration_ms,
        });
        self.save()
    }

    fn save(&self) -> Result<()> {
        let path = self.dir.join("run.json");
        let json = serde_json::to_string_pretty(&self.record)?;
        fs::write(&path, json)
            .with_context(|| format!("Failed to write run record {}", path.display()))?;
        Ok(())
    }

    /// Read a session's record back from its directory.
    pub fn load_record(dir: &Path) -> Result<RunRecord> {
        let path = dir.join("run.json");
        let json = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read run record {}", path.display()))?;
        Ok(serde_json::from_str(&json)?)
    }
}

/// Session ids sort chronologically and stay unique per host without any
/// extra state: one `ouro` process runs one completion, so the pid breaks
/// ties within a second.
fn next_id() -> String {
    format!(
        "run-{}-p{}",
        Utc::now().format("%Y%m%d-%H%M%S"),
        std::process::id()
    )
}
