//! Diagnosis: asks an LLM backend what went wrong, or whether a server is up.
//!
//! A backend only turns a prompt into raw text. Everything else lives here:
//! prompt composition, strict validation of the JSON that comes back, and
//! the retry policy. [`Diagnoser::analyze`] never fails; after the last
//! attempt it returns a fallback verdict so the control loop keeps going.

pub mod command;
pub mod gemini;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{DiagnosisBackendKind, DiagnosisSettings};

/// Structured answer to "what went wrong in these logs?".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Verdict {
    pub has_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affected_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fix: Option<String>,
}

impl Verdict {
    /// Safe "no error found" verdict carrying an explanation.
    pub fn fallback(message: impl Into<String>) -> Self {
        Self {
            has_error: false,
            error_type: None,
            error_message: Some(message.into()),
            affected_file: None,
            line: None,
            cause: None,
            fix: None,
        }
    }
}

/// Structured answer to "is the dev server up?".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadinessVerdict {
    pub is_ready: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

impl ReadinessVerdict {
    pub fn not_ready() -> Self {
        Self {
            is_ready: false,
            url: None,
            port: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DiagnosisError {
    #[error("diagnosis backend not configured: {0}")]
    NotConfigured(String),
    #[error("diagnosis request failed: {0}")]
    Transport(String),
    #[error("malformed diagnosis response: {0}")]
    Malformed(String),
    #[error("diagnosis timed out after {0:?}")]
    Timeout(Duration),
}

/// Something that can answer a prompt with text.
#[async_trait]
pub trait DiagnosisBackend: Send + Sync {
    /// Human-readable backend name for logs.
    fn name(&self) -> &str;

    /// Whether the backend has what it needs (credential, program) to run.
    /// Unconfigured backends are never called.
    fn is_configured(&self) -> bool;

    /// Send `prompt` and return the raw response text.
    async fn complete(&self, prompt: &str) -> Result<String, DiagnosisError>;
}

/// Backend used when diagnosis is switched off or has no credential.
pub struct UnconfiguredBackend {
    reason: String,
}

impl UnconfiguredBackend {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl DiagnosisBackend for UnconfiguredBackend {
    fn name(&self) -> &str {
        "disabled"
    }

    fn is_configured(&self) -> bool {
        false
    }

    async fn complete(&self, _prompt: &str) -> Result<String, DiagnosisError> {
        Err(DiagnosisError::NotConfigured(self.reason.clone()))
    }
}

/// Build the backend selected in the config.
pub fn backend_from_settings(settings: &DiagnosisSettings) -> Arc<dyn DiagnosisBackend> {
    match settings.backend {
        DiagnosisBackendKind::Command => Arc::new(command::CommandBackend::from_settings(settings)),
        DiagnosisBackendKind::Gemini => Arc::new(gemini::GeminiBackend::from_settings(settings)),
        DiagnosisBackendKind::Disabled => {
            Arc::new(UnconfiguredBackend::new("diagnosis disabled in config"))
        }
    }
}

/// Retry policy for log analysis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Base backoff; the wait after attempt `n` is `n × backoff`.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_secs(1),
        }
    }
}

/// Compose the log-analysis prompt.
pub fn compose_analysis_prompt(excerpt: &str) -> String {
    let mut prompt = String::new();
    prompt.push_str(
        "Analyze the following terminal output from a development server and determine:\n\
         1. Are there any errors? (logic, syntax or type errors; \"command not found\", \
         \"module not found\", \"ENOENT\"; unexpected non-zero exit codes)\n\
         2. If yes, what type of error? (module_not_found, syntax, type, runtime, build, \
         configuration, other)\n\
         3. What is the error message?\n\
         4. What file and line are affected?\n\
         5. What is the likely cause?\n\
         6. What is the suggested fix?\n\n\
         Return a strictly valid JSON object and nothing else, no markdown fences:\n\
         {\"hasError\": boolean, \"errorType\": string, \"errorMessage\": string, \
         \"affectedFile\": string, \"line\": number, \"cause\": string, \"fix\": string}\n\n",
    );
    prompt.push_str("Terminal output:\n");
    prompt.push_str(excerpt);
    prompt.push('\n');
    prompt
}

/// Compose the readiness-verification prompt.
pub fn compose_readiness_prompt(excerpt: &str) -> String {
    let mut prompt = String::new();
    prompt.push_str(
        "Analyze the following terminal output and determine if the development server \
         is fully up and running. Look for indicators like \"ready on http://...\", \
         \"listening on port ...\", \"compiled successfully\" or \"built in ...ms\".\n\n\
         Return a strictly valid JSON object and nothing else, no markdown fences:\n\
         {\"isReady\": boolean, \"url\": string (optional), \"port\": number (optional)}\n\n",
    );
    prompt.push_str("Terminal output:\n");
    prompt.push_str(excerpt);
    prompt.push('\n');
    prompt
}

/// Strip markdown fences and surrounding prose, then parse strictly.
pub fn parse_response<T: DeserializeOwned>(raw: &str) -> Result<T, DiagnosisError> {
    let cleaned = raw.replace("```json", "").replace("```", "");
    let cleaned = cleaned.trim();
    let body = match (cleaned.find('{'), cleaned.rfind('}')) {
        (Some(start), Some(end)) if start < end => &cleaned[start..=end],
        _ => {
            return Err(DiagnosisError::Malformed(format!(
                "no JSON object in response ({} bytes)",
                raw.len()
            )));
        }
    };
    serde_json::from_str(body).map_err(|e| DiagnosisError::Malformed(e.to_string()))
}

/// Backend plus the policy for using it. Cheap to clone into spawned tasks.
#[derive(Clone)]
pub struct Diagnoser {
    backend: Arc<dyn DiagnosisBackend>,
    policy: RetryPolicy,
}

impl Diagnoser {
    pub fn new(backend: Arc<dyn DiagnosisBackend>, policy: RetryPolicy) -> Self {
        Self { backend, policy }
    }

    pub fn is_configured(&self) -> bool {
        self.backend.is_configured()
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// One analysis round-trip with validation, no retries.
    pub async fn analyze_once(&self, excerpt: &str) -> Result<Verdict, DiagnosisError> {
        if !self.backend.is_configured() {
            return Err(DiagnosisError::NotConfigured(format!(
                "{} backend unavailable",
                self.backend.name()
            )));
        }
        let raw = self
            .backend
            .complete(&compose_analysis_prompt(excerpt))
            .await?;
        debug!(bytes = raw.len(), "analysis response");
        parse_response(&raw)
    }

    /// Analyze with retries; never fails.
    ///
    /// An unconfigured backend returns a fallback immediately without
    /// spending an attempt.
    pub async fn analyze(&self, excerpt: &str) -> Verdict {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            match self.analyze_once(excerpt).await {
                Ok(verdict) => {
                    info!(attempt, has_error = verdict.has_error, "analysis complete");
                    return verdict;
                }
                Err(DiagnosisError::NotConfigured(reason)) => {
                    warn!(reason = %reason, "diagnosis not configured");
                    return Verdict::fallback(format!("Diagnosis not configured ({reason})"));
                }
                Err(e) => {
                    warn!(attempt, error = %e, "analysis attempt failed");
                    last_error = e.to_string();
                    if attempt < max_attempts {
                        tokio::time::sleep(self.policy.backoff * attempt).await;
                    }
                }
            }
        }

        Verdict::fallback(format!(
            "Failed to analyze logs after {max_attempts} attempts: {last_error}"
        ))
    }

    /// Ask whether the server is ready. Any failure reads as "not ready";
    /// the detector's throttle decides when to ask again.
    pub async fn check_readiness(&self, excerpt: &str) -> ReadinessVerdict {
        if !self.backend.is_configured() {
            return ReadinessVerdict::not_ready();
        }
        let result = match self
            .backend
            .complete(&compose_readiness_prompt(excerpt))
            .await
        {
            Ok(raw) => parse_response::<ReadinessVerdict>(&raw),
            Err(e) => Err(e),
        };
        match result {
            Ok(verdict) => verdict,
            Err(e) => {
                warn!(error = %e, "readiness check failed");
                ReadinessVerdict::not_ready()
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::ScriptedBackend;
    use super::*;

    fn quick_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            backoff: Duration::from_millis(5),
        }
    }

    fn diagnoser(backend: &Arc<ScriptedBackend>) -> Diagnoser {
        Diagnoser::new(backend.clone(), quick_policy())
    }

    #[test]
    fn parse_plain_json() {
        let v: Verdict = parse_response(
            r#"{"hasError": true, "errorType": "runtime", "affectedFile": "server.js", "line": 9}"#,
        )
        .unwrap();
        assert!(v.has_error);
        assert_eq!(v.error_type.as_deref(), Some("runtime"));
        assert_eq!(v.affected_file.as_deref(), Some("server.js"));
        assert_eq!(v.line, Some(9));
    }

    #[test]
    fn parse_strips_markdown_fences_and_prose() {
        let raw = "Here you go:\n```json\n{\"isReady\": true, \"url\": \"http://localhost:3000\"}\n```";
        let v: ReadinessVerdict = parse_response(raw).unwrap();
        assert!(v.is_ready);
        assert_eq!(v.url.as_deref(), Some("http://localhost:3000"));
        assert_eq!(v.port, None);
    }

    #[test]
    fn parse_rejects_missing_required_field() {
        let err = parse_response::<Verdict>(r#"{"errorType": "syntax"}"#).unwrap_err();
        assert!(matches!(err, DiagnosisError::Malformed(_)));
    }

    #[test]
    fn parse_rejects_wrong_types() {
        let err = parse_response::<Verdict>(r#"{"hasError": "yes"}"#).unwrap_err();
        assert!(matches!(err, DiagnosisError::Malformed(_)));
        let err = parse_response::<Verdict>(r#"{"hasError": true, "line": "twelve"}"#).unwrap_err();
        assert!(matches!(err, DiagnosisError::Malformed(_)));
    }

    #[test]
    fn parse_rejects_non_json() {
        let err = parse_response::<Verdict>("I could not find anything.").unwrap_err();
        assert!(err.to_string().contains("no JSON object"));
    }

    #[test]
    fn null_optional_fields_are_accepted() {
        let v: Verdict = parse_response(r#"{"hasError": false, "fix": null}"#).unwrap();
        assert!(!v.has_error);
        assert!(v.fix.is_none());
    }

    #[test]
    fn prompts_embed_the_excerpt() {
        assert!(compose_analysis_prompt("[12:00:00] [ERROR] boom").contains("[ERROR] boom"));
        assert!(compose_analysis_prompt("x").contains("hasError"));
        let readiness = compose_readiness_prompt("Ready on :3000");
        assert!(readiness.contains("isReady"));
        assert!(readiness.contains("Ready on :3000"));
    }

    #[test]
    fn verdict_serializes_camel_case_without_empty_fields() {
        let json = serde_json::to_string(&Verdict::fallback("nothing")).unwrap();
        assert_eq!(json, r#"{"hasError":false,"errorMessage":"nothing"}"#);
    }

    #[tokio::test]
    async fn analyze_returns_first_valid_verdict() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.push_analysis(Ok(r#"{"hasError": true, "errorType": "syntax"}"#));
        let v = diagnoser(&backend).analyze("logs").await;
        assert!(v.has_error);
        assert_eq!(backend.analysis_calls(), 1);
    }

    #[tokio::test]
    async fn analyze_retries_failures_and_malformed_responses() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.push_analysis(Err(DiagnosisError::Transport("503".into())));
        backend.push_analysis(Ok("not json at all"));
        backend.push_analysis(Ok(r#"{"hasError": true}"#));
        let v = diagnoser(&backend).analyze("logs").await;
        assert!(v.has_error);
        assert_eq!(backend.analysis_calls(), 3);
    }

    #[tokio::test]
    async fn analyze_falls_back_after_three_attempts() {
        let backend = Arc::new(ScriptedBackend::new());
        for _ in 0..5 {
            backend.push_analysis(Err(DiagnosisError::Transport("offline".into())));
        }
        let v = diagnoser(&backend).analyze("logs").await;
        assert!(!v.has_error);
        assert!(v.error_message.unwrap().contains("after 3 attempts"));
        assert_eq!(backend.analysis_calls(), 3);
    }

    #[tokio::test]
    async fn backoff_grows_with_attempt_number() {
        let backend = Arc::new(ScriptedBackend::new());
        for _ in 0..3 {
            backend.push_analysis(Err(DiagnosisError::Transport("offline".into())));
        }
        let d = Diagnoser::new(
            backend.clone(),
            RetryPolicy {
                max_attempts: 3,
                backoff: Duration::from_millis(20),
            },
        );
        let started = std::time::Instant::now();
        d.analyze("logs").await;
        // 1×20ms + 2×20ms between the three attempts
        assert!(started.elapsed() >= Duration::from_millis(60));
    }

    #[tokio::test]
    async fn unconfigured_backend_is_never_called() {
        let backend = Arc::new(ScriptedBackend::unconfigured());
        let d = diagnoser(&backend);
        let v = d.analyze("logs").await;
        assert!(!v.has_error);
        assert!(v.error_message.unwrap().contains("not configured"));
        assert!(!d.check_readiness("Ready").await.is_ready);
        assert_eq!(backend.analysis_calls(), 0);
        assert_eq!(backend.readiness_calls(), 0);
    }

    #[tokio::test]
    async fn readiness_failure_reads_as_not_ready() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.push_readiness(Ok("```json\n{\"isReady\": \"maybe\"}\n```"));
        backend.push_readiness(Ok(r#"{"isReady": true, "port": 3000}"#));
        let d = diagnoser(&backend);
        assert!(!d.check_readiness("Ready").await.is_ready);
        let v = d.check_readiness("Ready").await;
        assert!(v.is_ready);
        assert_eq!(v.port, Some(3000));
        assert_eq!(backend.readiness_calls(), 2);
    }

    #[test]
    fn disabled_settings_build_unconfigured_backend() {
        let settings = DiagnosisSettings {
            backend: DiagnosisBackendKind::Disabled,
            ..DiagnosisSettings::default()
        };
        let backend = backend_from_settings(&settings);
        assert!(!backend.is_configured());
        assert_eq!(backend.name(), "disabled");
    }
}
