//! Gemini backend over the public `generateContent` REST endpoint.
//!
//! ureq is blocking, so each call runs on the blocking pool. The API key is
//! read from the environment once, at construction.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, info};

use super::{DiagnosisBackend, DiagnosisError};
use crate::config::DiagnosisSettings;

const API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";

pub struct GeminiBackend {
    model: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl GeminiBackend {
    pub fn new(model: impl Into<String>, api_key: Option<String>, timeout: Duration) -> Self {
        Self {
            model: model.into(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            timeout,
        }
    }

    pub fn from_settings(settings: &DiagnosisSettings) -> Self {
        let api_key = std::env::var(&settings.api_key_env).ok();
        Self::new(
            settings.model.clone(),
            api_key,
            Duration::from_secs(settings.timeout_secs),
        )
    }

    fn endpoint(&self, key: &str) -> String {
        format!("{API_BASE}/{}:generateContent?key={key}", self.model)
    }
}

/// Pull the first candidate's text out of a `generateContent` response.
pub fn extract_text(body: &Value) -> Result<String, DiagnosisError> {
    let parts = body
        .pointer("/candidates/0/content/parts")
        .and_then(Value::as_array)
        .ok_or_else(|| DiagnosisError::Malformed("response has no candidates".to_string()))?;

    let text: String = parts
        .iter()
        .filter_map(|p| p.get("text").and_then(Value::as_str))
        .collect();
    if text.trim().is_empty() {
        return Err(DiagnosisError::Malformed("candidate has no text".to_string()));
    }
    Ok(text)
}

#[async_trait]
impl DiagnosisBackend for GeminiBackend {
    fn name(&self) -> &str {
        "gemini"
    }

    fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    async fn complete(&self, prompt: &str) -> Result<String, DiagnosisError> {
        let Some(key) = self.api_key.as_deref() else {
            return Err(DiagnosisError::NotConfigured(
                "no Gemini API key in environment".to_string(),
            ));
        };

        info!(model = %self.model, "calling Gemini");
        debug!(prompt_len = prompt.len(), "diagnosis prompt");

        let url = self.endpoint(key);
        let timeout = self.timeout;
        let payload = json!({ "contents": [{ "parts": [{ "text": prompt }] }] });

        let result = tokio::task::spawn_blocking(move || {
            let agent = ureq::AgentBuilder::new().timeout(timeout).build();
            match agent.post(&url).send_json(payload) {
                Ok(response) => response
                    .into_json::<Value>()
                    .map_err(|e| DiagnosisError::Malformed(format!("invalid JSON body: {e}"))),
                Err(ureq::Error::Status(code, response)) => {
                    let body = response.into_string().unwrap_or_default();
                    Err(DiagnosisError::Transport(format!("HTTP {code}: {}", body.trim())))
                }
                Err(ureq::Error::Transport(t)) => {
                    if t.kind() == ureq::ErrorKind::Io && t.to_string().contains("timed out") {
                        Err(DiagnosisError::Timeout(timeout))
                    } else {
                        Err(DiagnosisError::Transport(t.to_string()))
                    }
                }
            }
        })
        .await
        .map_err(|e| DiagnosisError::Transport(format!("request task failed: {e}")))?;

        extract_text(&result?)
    }
}
