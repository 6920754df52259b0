//! Configuration file support.
//!
//! All ouro data lives in a `.ouro/` directory:
//! - `.ouro/config.toml` - Configuration file
//! - `.ouro/sessions/` - Per-run session directories (logs + trajectory)
//!
//! Config discovery searches for `.ouro/config.toml` starting from the
//! current directory and walking up to parent directories.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// The ouro data directory name.
pub const OURO_DIR: &str = ".ouro";
/// The config file name within the ouro directory.
pub const CONFIG_FILE: &str = "config.toml";

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct Config {
    /// LM backend settings.
    pub backend: BackendConfig,
    /// Execution environment settings.
    pub environment: EnvironmentConfig,
    /// Budget settings.
    pub limits: LimitsConfig,
    /// Trajectory sink settings.
    pub trajectory: TrajectoryConfig,
}

/// LM backend configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Backend type; only "openai" (OpenAI-compatible) is built in.
    #[serde(rename = "type")]
    pub backend_type: String,
    /// Model to use.
    pub model: String,
    /// API base URL override (local servers run keyless).
    pub base_url: Option<String>,
    /// Sampling temperature.
    pub temperature: Option<f32>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            backend_type: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            temperature: None,
        }
    }
}

/// Execution environment configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EnvironmentConfig {
    /// Environment type: "local" or "sandbox".
    #[serde(rename = "type")]
    pub environment_type: String,
    /// Interpreter for code execution.
    pub python: String,
    /// Snippet executed once after environment setup.
    pub setup_code: Option<String>,
    /// Broker URL for the sandbox environment (self-hosted when absent).
    pub broker_url: Option<String>,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            environment_type: "local".to_string(),
            python: "python3".to_string(),
            setup_code: None,
            broker_url: None,
        }
    }
}

/// Budget configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum LM turns per top-level call.
    pub max_iterations: usize,
    /// Maximum recursion depth.
    pub max_depth: u32,
    /// Deadline for one LM call, in seconds.
    pub per_call_timeout_secs: u64,
    /// Wall-clock budget for a completion, in seconds.
    pub wall_clock_secs: Option<u64>,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            max_depth: 1,
            per_call_timeout_secs: 600,
            wall_clock_secs: None,
        }
    }
}

/// Trajectory sink configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TrajectoryConfig {
    /// Whether to persist a trajectory file per session.
    pub enabled: bool,
}

impl Default for TrajectoryConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// The nearest `.ouro` directory that holds a config file, looking at
/// `start` and each of its ancestors.
pub fn locate_ouro_dir(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .map(|dir| dir.join(OURO_DIR))
        .find(|candidate| candidate.join(CONFIG_FILE).is_file())
}

impl Config {
    /// Load configuration from a file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// The effective configuration for a run started in `start`: the
    /// nearest config file up the tree, or defaults when there is none.
    ///
    /// Also returns the `.ouro` directory the run should write into - the
    /// located one, or `<start>/.ouro` for a config-less run, so session
    /// data always lands near where the user invoked ouro.
    pub fn load(start: &Path) -> Result<(Self, PathBuf)> {
        match locate_ouro_dir(start) {
            Some(ouro_dir) => {
                let config = Self::from_file(&ouro_dir.join(CONFIG_FILE))?;
                Ok((config, ouro_dir))
            }
            None => Ok((Self::default(), start.join(OURO_DIR))),
        }
    }

    /// Build the driver configuration from this file config.
    pub fn to_rlm_config(&self) -> ouro_rlm::RlmConfig {
        let mut backend_kwargs = serde_json::json!({
            "model": self.backend.model,
        });
        if let Some(ref base_url) = self.backend.base_url {
            backend_kwargs["base_url"] = serde_json::json!(base_url);
        }
        if let Some(temperature) = self.backend.temperature {
            backend_kwargs["temperature"] = serde_json::json!(temperature);
        }

        let mut environment_kwargs = serde_json::json!({
            "python": self.environment.python,
        });
        if let Some(ref setup_code) = self.environment.setup_code {
            environment_kwargs["setup_code"] = serde_json::json!(setup_code);
        }
        if let Some(ref broker_url) = self.environment.broker_url {
            environment_kwargs["broker_url"] = serde_json::json!(broker_url);
        }

        let mut config = ouro_rlm::RlmConfig::new()
            .with_backend(&self.backend.backend_type)
            .with_backend_kwargs(backend_kwargs)
            .with_environment(&self.environment.environment_type)
            .with_environment_kwargs(environment_kwargs)
            .with_max_iterations(self.limits.max_iterations)
            .with_max_depth(self.limits.max_depth)
            .with_per_call_timeout(Duration::from_secs(self.limits.per_call_timeout_secs));
        if let Some(secs) = self.limits.wall_clock_secs {
            config = config.with_wall_clock(Duration::from_secs(secs));
        }
        config
    }
}

/// A specific way the configuration can be unusable.
///
/// Faults carry the offending value so the message can say what was seen
/// as well as what would work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigFault {
    UnknownBackend(String),
    EmptyModel,
    UnknownEnvironment(String),
    ZeroIterations,
    MissingCredentials,
}

impl std::fmt::Display for ConfigFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigFault::UnknownBackend(seen) => write!(
                f,
                "backend.type '{}' is not a known backend; only 'openai' is built in",
                seen
            ),
            ConfigFault::EmptyModel => write!(f, "backend.model must not be empty"),
            ConfigFault::UnknownEnvironment(seen) => write!(
                f,
                "environment.type '{}' is not a known environment; use 'local' or 'sandbox'",
                seen
            ),
            ConfigFault::ZeroIterations => {
                write!(f, "limits.max_iterations must be at least 1")
            }
            ConfigFault::MissingCredentials => write!(
                f,
                "no API key in the environment; set OURO_API_KEY or OPENAI_API_KEY, \
                 or point backend.base_url at a local server"
            ),
        }
    }
}

impl Config {
    /// Every fault in the configuration, not just the first: a user fixing
    /// a config file should see the whole list at once.
    pub fn validate(&self) -> Vec<ConfigFault> {
        let mut faults = Vec::new();

        if self.backend.backend_type != "openai" {
            faults.push(ConfigFault::UnknownBackend(self.backend.backend_type.clone()));
        }
        if self.backend.model.is_empty() {
            faults.push(ConfigFault::EmptyModel);
        }
        if !["local", "sandbox"].contains(&self.environment.environment_type.as_str()) {
            faults.push(ConfigFault::UnknownEnvironment(
                self.environment.environment_type.clone(),
            ));
        }
        if self.limits.max_iterations == 0 {
            faults.push(ConfigFault::ZeroIterations);
        }

        // Credentials come from the process environment; only the hosted
        // default endpoint requires them.
        if self.backend.backend_type == "openai"
            && self.backend.base_url.is_none()
            && std::env::var("OURO_API_KEY").is_err()
            && std::env::var("OPENAI_API_KEY").is_err()
        {
            faults.push(ConfigFault::MissingCredentials);
        }

        faults
    }
}
