use anyhow::{anyhow, Context, Result};
use eval_core::{atomic_write_bytes, load_structured_file};
use serde::Deserialize;
use serde_json::Value;
use std::path::Path;

pub const DEFAULT_CONFIG_PATH: &str = "config/config.json";
pub const DEFAULT_OUTPUTS: &str = "outputs";

fn default_threads() -> u64 {
    1
}

fn default_config() -> String {
    DEFAULT_CONFIG_PATH.to_string()
}

fn default_outputs() -> String {
    DEFAULT_OUTPUTS.to_string()
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TaskSpec {
    pub data: String,
    pub task_type: String,
    #[serde(default = "default_threads")]
    pub threads: u64,
    #[serde(default = "default_config")]
    pub config: String,
    #[serde(default = "default_outputs")]
    pub outputs: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

impl TaskSpec {
    pub fn command(&self) -> Vec<String> {
        let mut parts: Vec<String> = vec![
            "evalrun".to_string(),
            "run".to_string(),
            "--data".to_string(),
            self.data.clone(),
            "--task-type".to_string(),
            self.task_type.clone(),
            "--threads".to_string(),
            self.threads.to_string(),
            "--config".to_string(),
            self.config.clone(),
            "--outputs".to_string(),
            self.outputs.clone(),
        ];
        let overrides = [
            ("--base-url", &self.base_url),
            ("--api-key", &self.api_key),
            ("--model", &self.model),
        ];
        for (flag, value) in overrides {
            if let Some(value) = value.as_deref().filter(|v| !v.is_empty()) {
                parts.push(flag.to_string());
                parts.push(value.to_string());
            }
        }
        parts
    }
}

pub fn parse_tasks(value: Value) -> Result<Vec<TaskSpec>> {
    let Value::Array(items) = value else {
        return Err(anyhow!("tasks file must be an array of task objects"));
    };
    items
        .into_iter()
        .enumerate()
        .map(|(idx, item)| {
            if !item.is_object() {
                return Err(anyhow!("task {} is not an object", idx));
            }
            serde_json::from_value(item).with_context(|| format!("task {}", idx))
        })
        .collect()
}

pub fn render_script(tasks: &[TaskSpec]) -> String {
    let mut lines = vec![
        "#!/usr/bin/env bash".to_string(),
        "set -euo pipefail".to_string(),
        String::new(),
    ];
    lines.extend(tasks.iter().map(|t| shell_join(&t.command())));
    format!("{}\n", lines.join("\n"))
}

pub fn generate_script(tasks_path: &Path, out_path: &Path) -> Result<usize> {
    let value = load_structured_file(tasks_path)?;
    let tasks = parse_tasks(value).with_context(|| format!("parse {}", tasks_path.display()))?;
    atomic_write_bytes(out_path, render_script(&tasks).as_bytes())
        .with_context(|| format!("write {}", out_path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(out_path, std::fs::Permissions::from_mode(0o755))
            .with_context(|| format!("chmod {}", out_path.display()))?;
    }
    Ok(tasks.len())
}

pub fn shell_join(parts: &[String]) -> String {
    parts
        .iter()
        .map(|p| shell_quote(p))
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:=".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}
