pub mod render;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::control::ControlSettings;
use crate::detector::ReadinessSettings;
use crate::diagnosis::RetryPolicy;
use crate::log::CaptureLimits;
use crate::supervisor::SupervisorSettings;

const CONFIG_FILENAME: &str = "config.toml";
pub const CONFIG_DIR: &str = ".devwarden";

#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum DiagnosisBackendKind {
    /// Shell out to a local LLM CLI.
    #[default]
    Command,
    /// Gemini REST API; key read from the environment.
    Gemini,
    Disabled,
}

impl DiagnosisBackendKind {
    pub fn label(self) -> &'static str {
        match self {
            DiagnosisBackendKind::Command => "command",
            DiagnosisBackendKind::Gemini => "gemini",
            DiagnosisBackendKind::Disabled => "disabled",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Defaults {
    #[serde(default = "default_command")]
    pub command: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_command() -> String {
    "npm run dev".to_string()
}

fn default_max_retries() -> u32 {
    5
}

fn default_stop_grace_millis() -> u64 {
    2000
}

fn default_true() -> bool {
    true
}

fn default_history_limit() -> usize {
    2000
}

fn default_flush_interval_millis() -> u64 {
    100
}

fn default_flush_batch_size() -> usize {
    1000
}

fn default_readiness_timeout_secs() -> u64 {
    60
}

fn default_readiness_throttle_millis() -> u64 {
    3000
}

fn default_readiness_buffer_chars() -> usize {
    5000
}

fn default_readiness_excerpt_chars() -> usize {
    2000
}

fn default_debounce_millis() -> u64 {
    2000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_millis() -> u64 {
    1000
}

fn default_diagnosis_program() -> String {
    "claude".to_string()
}

fn default_diagnosis_args() -> Vec<String> {
    vec![
        "-p".to_string(),
        "--output-format".to_string(),
        "text".to_string(),
    ]
}

fn default_diagnosis_timeout_secs() -> u64 {
    60
}

fn default_model() -> String {
    "gemini-2.0-flash".to_string()
}

fn default_api_key_env() -> String {
    "GEMINI_API_KEY".to_string()
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            command: default_command(),
            max_retries: default_max_retries(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SupervisorConfig {
    #[serde(default = "default_stop_grace_millis")]
    pub stop_grace_millis: u64,
    #[serde(default = "default_true")]
    pub force_color: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            stop_grace_millis: default_stop_grace_millis(),
            force_color: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CaptureConfig {
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default = "default_flush_interval_millis")]
    pub flush_interval_millis: u64,
    #[serde(default = "default_flush_batch_size")]
    pub flush_batch_size: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            history_limit: default_history_limit(),
            flush_interval_millis: default_flush_interval_millis(),
            flush_batch_size: default_flush_batch_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReadinessConfig {
    #[serde(default = "default_readiness_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_readiness_throttle_millis")]
    pub throttle_millis: u64,
    #[serde(default = "default_readiness_buffer_chars")]
    pub buffer_chars: usize,
    #[serde(default = "default_readiness_excerpt_chars")]
    pub excerpt_chars: usize,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_readiness_timeout_secs(),
            throttle_millis: default_readiness_throttle_millis(),
            buffer_chars: default_readiness_buffer_chars(),
            excerpt_chars: default_readiness_excerpt_chars(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalysisConfig {
    #[serde(default = "default_debounce_millis")]
    pub debounce_millis: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_millis")]
    pub backoff_millis: u64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            debounce_millis: default_debounce_millis(),
            max_attempts: default_max_attempts(),
            backoff_millis: default_backoff_millis(),
        }
    }
}

/// Which backend answers diagnosis prompts, and how to reach it.
///
/// ```toml
/// [diagnosis]
/// backend = "gemini"
/// model = "gemini-2.0-flash"
/// api_key_env = "GEMINI_API_KEY"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiagnosisSettings {
    #[serde(default)]
    pub backend: DiagnosisBackendKind,
    #[serde(default = "default_diagnosis_program")]
    pub program: String,
    #[serde(default = "default_diagnosis_args")]
    pub args: Vec<String>,
    #[serde(default = "default_diagnosis_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
}

impl Default for DiagnosisSettings {
    fn default() -> Self {
        Self {
            backend: DiagnosisBackendKind::default(),
            program: default_diagnosis_program(),
            args: default_diagnosis_args(),
            timeout_secs: default_diagnosis_timeout_secs(),
            model: default_model(),
            api_key_env: default_api_key_env(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ProjectConfig {
    #[serde(default)]
    pub defaults: Defaults,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub readiness: ReadinessConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub diagnosis: DiagnosisSettings,
}

impl ProjectConfig {
    /// Search upward from `start` for a `.devwarden/config.toml` file and load it.
    /// Returns the default config if no file is found.
    pub fn load(start: &Path) -> Result<(Self, Option<PathBuf>)> {
        if let Some(path) = Self::find_config_file(start) {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let config: ProjectConfig = toml::from_str(&contents)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            config
                .validate()
                .with_context(|| format!("invalid config in {}", path.display()))?;
            Ok((config, Some(path)))
        } else {
            Ok((ProjectConfig::default(), None))
        }
    }

    fn find_config_file(start: &Path) -> Option<PathBuf> {
        let mut dir = start.to_path_buf();
        loop {
            let candidate = dir.join(CONFIG_DIR).join(CONFIG_FILENAME);
            if candidate.is_file() {
                return Some(candidate);
            }
            if !dir.pop() {
                return None;
            }
        }
    }

    /// Reject values that would make the control loop misbehave.
    pub fn validate(&self) -> Result<()> {
        if self.defaults.max_retries == 0 {
            anyhow::bail!("defaults.max_retries must be at least 1");
        }
        if self.capture.history_limit == 0 {
            anyhow::bail!("capture.history_limit must be at least 1");
        }
        if self.capture.flush_batch_size == 0 {
            anyhow::bail!("capture.flush_batch_size must be at least 1");
        }
        if self.analysis.max_attempts == 0 {
            anyhow::bail!("analysis.max_attempts must be at least 1");
        }
        if self.diagnosis.backend == DiagnosisBackendKind::Command
            && self.diagnosis.program.trim().is_empty()
        {
            anyhow::bail!("diagnosis.program must not be empty for the command backend");
        }
        Ok(())
    }

    /// Plain values the control loop runs on.
    pub fn control_settings(&self) -> ControlSettings {
        ControlSettings {
            max_retries: self.defaults.max_retries,
            readiness_timeout: Duration::from_secs(self.readiness.timeout_secs),
            analysis_debounce: Duration::from_millis(self.analysis.debounce_millis),
            capture: CaptureLimits {
                history_limit: self.capture.history_limit,
                flush_batch_size: self.capture.flush_batch_size,
                flush_interval: Duration::from_millis(self.capture.flush_interval_millis),
            },
            readiness: ReadinessSettings {
                throttle: Duration::from_millis(self.readiness.throttle_millis),
                buffer_chars: self.readiness.buffer_chars,
                excerpt_chars: self.readiness.excerpt_chars,
            },
        }
    }

    pub fn supervisor_settings(&self) -> SupervisorSettings {
        SupervisorSettings {
            stop_grace: Duration::from_millis(self.supervisor.stop_grace_millis),
            force_color: self.supervisor.force_color,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.analysis.max_attempts,
            backoff: Duration::from_millis(self.analysis.backoff_millis),
        }
    }
}
