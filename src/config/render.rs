//! `devwarden config` output.

use std::fmt::Display;
use std::path::Path;

use anyhow::{Context, Result};

use super::ProjectConfig;

pub fn config_source_label(config_path: Option<&Path>) -> String {
    config_path
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "(defaults, no .devwarden/config.toml found)".to_string())
}

fn push_kv(output: &mut String, key: &str, value: impl Display) {
    output.push_str(&format!("  {key:<20} {value}\n"));
}

pub fn render_config_human(config: &ProjectConfig, config_path: Option<&Path>) -> String {
    let mut output = String::new();
    output.push_str("Defaults\n");
    push_kv(&mut output, "command", &config.defaults.command);
    push_kv(&mut output, "max_retries", config.defaults.max_retries);
    output.push('\n');

    output.push_str("Supervisor\n");
    push_kv(
        &mut output,
        "stop_grace",
        format!("{}ms", config.supervisor.stop_grace_millis),
    );
    push_kv(&mut output, "force_color", config.supervisor.force_color);
    output.push('\n');

    output.push_str("Capture\n");
    push_kv(&mut output, "history_limit", config.capture.history_limit);
    push_kv(
        &mut output,
        "flush_interval",
        format!("{}ms", config.capture.flush_interval_millis),
    );
    push_kv(&mut output, "flush_batch_size", config.capture.flush_batch_size);
    output.push('\n');

    output.push_str("Readiness\n");
    push_kv(&mut output, "timeout", format!("{}s", config.readiness.timeout_secs));
    push_kv(
        &mut output,
        "throttle",
        format!("{}ms", config.readiness.throttle_millis),
    );
    push_kv(&mut output, "buffer_chars", config.readiness.buffer_chars);
    push_kv(&mut output, "excerpt_chars", config.readiness.excerpt_chars);
    output.push('\n');

    output.push_str("Analysis\n");
    push_kv(
        &mut output,
        "debounce",
        format!("{}ms", config.analysis.debounce_millis),
    );
    push_kv(&mut output, "max_attempts", config.analysis.max_attempts);
    push_kv(
        &mut output,
        "backoff",
        format!("{}ms", config.analysis.backoff_millis),
    );
    output.push('\n');

    output.push_str("Diagnosis\n");
    let diagnosis = &config.diagnosis;
    push_kv(&mut output, "backend", diagnosis.backend.label());
    push_kv(&mut output, "program", &diagnosis.program);
    if diagnosis.args.is_empty() {
        push_kv(&mut output, "args", "(none)");
    } else {
        push_kv(&mut output, "args", diagnosis.args.join(", "));
    }
    push_kv(&mut output, "timeout_secs", diagnosis.timeout_secs);
    push_kv(&mut output, "model", &diagnosis.model);
    push_kv(&mut output, "api_key_env", &diagnosis.api_key_env);
    output.push('\n');

    output.push_str("Source Path\n");
    push_kv(&mut output, "path", config_source_label(config_path));

    output
}

pub fn render_config_json(config: &ProjectConfig, config_path: Option<&Path>) -> Result<String> {
    let mut payload = serde_json::to_value(config).context("failed to serialize config")?;
    payload["source_path"] = serde_json::Value::String(config_source_label(config_path));
    serde_json::to_string_pretty(&payload).context("failed to serialize config to JSON")
}
