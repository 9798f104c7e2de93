//! Command backend: shells out to a local LLM CLI.
//!
//! One call per prompt, stateless. The default shells out to `claude -p`
//! with the prompt appended as the last argument; program and arguments are
//! configurable in `.devwarden/config.toml`.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{DiagnosisBackend, DiagnosisError};
use crate::config::DiagnosisSettings;

/// Configuration for the command backend.
#[derive(Debug, Clone)]
pub struct CommandConfig {
    /// Program to invoke. Default: "claude"
    pub program: String,
    /// Arguments placed before the prompt.
    /// Default: ["-p", "--output-format", "text"]
    pub args: Vec<String>,
    /// Maximum time to wait for the response.
    pub timeout: Duration,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self::from(&DiagnosisSettings::default())
    }
}

impl From<&DiagnosisSettings> for CommandConfig {
    fn from(settings: &DiagnosisSettings) -> Self {
        Self {
            program: settings.program.clone(),
            args: settings.args.clone(),
            timeout: Duration::from_secs(settings.timeout_secs),
        }
    }
}

pub struct CommandBackend {
    config: CommandConfig,
    available: bool,
}

impl CommandBackend {
    pub fn new(config: CommandConfig) -> Self {
        let available = program_available(&config.program);
        if !available {
            warn!(program = %config.program, "diagnosis program not found on PATH");
        }
        Self { config, available }
    }

    pub fn from_settings(settings: &DiagnosisSettings) -> Self {
        Self::new(CommandConfig::from(settings))
    }
}

/// Whether `program` names an existing file or resolves through `PATH`.
pub fn program_available(program: &str) -> bool {
    if program.trim().is_empty() {
        return false;
    }
    if program.contains(std::path::MAIN_SEPARATOR) || program.contains('/') {
        return Path::new(program).is_file();
    }
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(program).is_file()))
        .unwrap_or(false)
}

#[async_trait]
impl DiagnosisBackend for CommandBackend {
    fn name(&self) -> &str {
        &self.config.program
    }

    fn is_configured(&self) -> bool {
        self.available
    }

    async fn complete(&self, prompt: &str) -> Result<String, DiagnosisError> {
        info!(program = %self.config.program, "calling diagnosis command");
        debug!(prompt_len = prompt.len(), "diagnosis prompt");

        let mut cmd = Command::new(&self.config.program);
        cmd.args(&self.config.args)
            .arg(prompt)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.config.timeout, cmd.output()).await {
            Ok(result) => result.map_err(|e| {
                DiagnosisError::Transport(format!(
                    "failed to run diagnosis command {}: {e}",
                    self.config.program
                ))
            })?,
            Err(_) => return Err(DiagnosisError::Timeout(self.config.timeout)),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(stderr = %stderr, "diagnosis command failed");
            return Err(DiagnosisError::Transport(format!(
                "{} exited with {}: {}",
                self.config.program,
                output.status,
                stderr.trim()
            )));
        }

        let response = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if response.is_empty() {
            return Err(DiagnosisError::Malformed("empty response".to_string()));
        }
        Ok(response)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh_printing(output: &str) -> CommandConfig {
        // the prompt lands in $0 and is ignored
        CommandConfig {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), format!("printf '%s' '{output}'")],
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn default_config() {
        let config = CommandConfig::default();
        assert_eq!(config.program, "claude");
        assert!(config.args.contains(&"-p".to_string()));
        assert_eq!(config.timeout, Duration::from_secs(60));
        assert_eq!(config.args, DiagnosisSettings::default().args);
    }

    #[test]
    fn program_lookup() {
        assert!(program_available("sh"));
        assert!(!program_available("devwarden-no-such-program"));
        assert!(!program_available(""));
        assert!(!program_available("/definitely/not/here"));
    }

    #[test]
    fn missing_program_is_unconfigured() {
        let backend = CommandBackend::new(CommandConfig {
            program: "devwarden-no-such-program".to_string(),
            ..CommandConfig::default()
        });
        assert!(!backend.is_configured());
    }

    #[tokio::test]
    async fn echo_returns_prompt() {
        let backend = CommandBackend::new(CommandConfig {
            program: "echo".to_string(),
            args: vec![],
            timeout: Duration::from_secs(5),
        });
        let response = backend.complete("test prompt").await.unwrap();
        assert_eq!(response, "test prompt");
    }

    #[tokio::test]
    async fn json_response_passes_through() {
        let backend = CommandBackend::new(sh_printing(r#"{"hasError": true}"#));
        let response = backend.complete("ignored").await.unwrap();
        assert_eq!(response, r#"{"hasError": true}"#);
    }

    #[tokio::test]
    async fn failing_command_is_transport_error() {
        let backend = CommandBackend::new(CommandConfig {
            program: "false".to_string(),
            args: vec![],
            timeout: Duration::from_secs(5),
        });
        let err = backend.complete("test").await.unwrap_err();
        assert!(matches!(err, DiagnosisError::Transport(_)));
    }

    #[tokio::test]
    async fn empty_output_is_malformed() {
        let backend = CommandBackend::new(sh_printing(""));
        let err = backend.complete("test").await.unwrap_err();
        assert!(matches!(err, DiagnosisError::Malformed(_)));
    }

    #[tokio::test]
    async fn slow_command_times_out() {
        let backend = CommandBackend::new(CommandConfig {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), "sleep 5".to_string()],
            timeout: Duration::from_millis(100),
        });
        let err = backend.complete("test").await.unwrap_err();
        assert!(matches!(err, DiagnosisError::Timeout(_)));
    }
}
