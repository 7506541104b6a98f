//! Worker and pool configuration.
//!
//! Values come from three layers, later ones winning: built-in defaults, an
//! optional JSON file, then environment variables. The binary applies its
//! command-line flags on top.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Marker the child prints when it returns to its interactive prompt.
pub const DEFAULT_PROMPT_RETURN: &str = "\n>";
/// Marker the child prints when generation reaches end-of-text.
pub const DEFAULT_END_OF_GENERATION: &str = "[end of text]";

/// Substrings in the child's output that end one prompt exchange.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StopMarkers {
    pub prompt_return: String,
    pub end_of_generation: String,
}

impl Default for StopMarkers {
    fn default() -> Self {
        Self {
            prompt_return: DEFAULT_PROMPT_RETURN.to_string(),
            end_of_generation: DEFAULT_END_OF_GENERATION.to_string(),
        }
    }
}

/// Everything needed to launch and talk to one inference process.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Path to the `llama-cli` style executable.
    pub executable: PathBuf,
    pub model_path: PathBuf,
    pub context_size: u32,
    /// Layers offloaded to the GPU. The remainder runs on the CPU.
    pub gpu_layers: u32,
    pub temperature: f32,
    pub flash_attention: bool,
    /// Echo completions to stdout while they are read.
    pub stream_output: bool,
    /// Upper bound for a single prompt exchange. `None` waits forever.
    pub prompt_timeout_ms: Option<u64>,
    pub stop_markers: StopMarkers,
    /// Passed to the child verbatim after the generated flags.
    pub extra_args: Vec<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            executable: default_executable(),
            model_path: PathBuf::new(),
            context_size: 4096,
            gpu_layers: 0,
            temperature: 1.0,
            flash_attention: true,
            stream_output: false,
            prompt_timeout_ms: None,
            stop_markers: StopMarkers::default(),
            extra_args: Vec::new(),
        }
    }
}

impl WorkerConfig {
    pub fn new(executable: impl Into<PathBuf>, model_path: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            model_path: model_path.into(),
            ..Self::default()
        }
    }

    pub fn prompt_timeout(&self) -> Option<Duration> {
        self.prompt_timeout_ms.map(Duration::from_millis)
    }
}

/// `<cwd>/llamacpp/llama-cli`, with the platform's executable suffix.
fn default_executable() -> PathBuf {
    let base = env::current_dir().unwrap_or_default();
    base.join("llamacpp")
        .join(format!("llama-cli{}", env::consts::EXE_SUFFIX))
}

/// Top-level settings for the pool binary.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub worker: WorkerConfig,
    /// Scheduler threads. `None` means hardware parallelism.
    pub threads: Option<usize>,
    /// Number of child processes to keep alive.
    pub workers: usize,
    pub log_dir: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            worker: WorkerConfig::default(),
            threads: None,
            workers: 1,
            log_dir: "logs".to_string(),
        }
    }
}

impl AppConfig {
    /// Read a JSON config file. Missing fields fall back to defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Defaults, then `path` if given, then the environment.
    pub fn resolve(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::load(p)?,
            None => Self::default(),
        };
        config.apply_env(|name| env::var(name).ok())?;
        Ok(config)
    }

    /// Apply environment overrides. `lookup` is injectable so tests don't
    /// have to mutate the process environment.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("LLAMA_CLI_PATH") {
            self.worker.executable = PathBuf::from(v);
        }
        if let Some(v) = lookup("MODEL_PATH") {
            self.worker.model_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("LLAMA_CONTEXT_SIZE") {
            self.worker.context_size = parse_env("LLAMA_CONTEXT_SIZE", v)?;
        }
        if let Some(v) = lookup("LLAMA_GPU_LAYERS") {
            self.worker.gpu_layers = parse_env("LLAMA_GPU_LAYERS", v)?;
        }
        if let Some(v) = lookup("LLAMA_TEMPERATURE") {
            self.worker.temperature = parse_env("LLAMA_TEMPERATURE", v)?;
        }
        if let Some(v) = lookup("LLAMA_POOL_THREADS") {
            self.threads = Some(parse_env("LLAMA_POOL_THREADS", v)?);
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(name: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidEnv { name, value })
}
