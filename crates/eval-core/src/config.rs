use serde::Deserialize;
use serde_json::Value;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config not readable: {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("config not parsable: {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

pub fn load_structured_file(path: &Path) -> Result<Value, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let parse_err = |message: String| ConfigError::Parse {
        path: path.to_path_buf(),
        message,
    };
    let is_yaml = matches!(
        path.extension().and_then(|s| s.to_str()),
        Some("yaml") | Some("yml")
    );
    if is_yaml {
        let yaml_value: serde_yaml::Value =
            serde_yaml::from_str(&raw).map_err(|e| parse_err(e.to_string()))?;
        serde_json::to_value(yaml_value).map_err(|e| parse_err(e.to_string()))
    } else {
        serde_json::from_str(&raw).map_err(|e| parse_err(e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InferenceConfig {
    pub model: String,
    pub base_url: String,
    pub api_key: String,
    pub request_timeout_s: u64,
    pub max_retries: u32,
    pub retry_backoff_s: f64,

    pub temperature: f64,
    pub max_tokens: u64,
    pub no_think: bool,
    pub thinking_rules_file: PathBuf,

    /// Checkpoint flush cadence; 0 means "use the worker count".
    pub save_every: usize,
    /// Heartbeat interval of the stall monitor; 0 disables it.
    pub heartbeat_s: u64,
    pub stall_s: Option<u64>,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            model: String::new(),
            base_url: String::new(),
            api_key: String::new(),
            request_timeout_s: 120,
            max_retries: 5,
            retry_backoff_s: 1.0,
            temperature: 0.0,
            max_tokens: 8192,
            no_think: false,
            thinking_rules_file: PathBuf::from("thinking_rules.json"),
            save_every: 0,
            heartbeat_s: 60,
            stall_s: None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct RawApiConfig {
    model: String,
    base_url: String,
    api_key: String,
    timeout: u64,
    max_retries: u32,
    retry_delay: f64,
}

impl Default for RawApiConfig {
    fn default() -> Self {
        let d = InferenceConfig::default();
        Self {
            model: d.model,
            base_url: d.base_url,
            api_key: d.api_key,
            timeout: d.request_timeout_s,
            max_retries: d.max_retries,
            retry_delay: d.retry_backoff_s,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct RawGenerationConfig {
    temperature: f64,
    max_tokens: u64,
    no_think: bool,
    thinking_rules_file: PathBuf,
}

impl Default for RawGenerationConfig {
    fn default() -> Self {
        let d = InferenceConfig::default();
        Self {
            temperature: d.temperature,
            max_tokens: d.max_tokens,
            no_think: d.no_think,
            thinking_rules_file: d.thinking_rules_file,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawConfig {
    api_config: RawApiConfig,
    generation_config: RawGenerationConfig,
    save_every: usize,
    heartbeat_s: Option<u64>,
    stall_s: Option<u64>,
}

impl InferenceConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let value = load_structured_file(path)?;
        Self::from_value(value).map_err(|message| ConfigError::Parse {
            path: path.to_path_buf(),
            message,
        })
    }

    pub fn from_value(value: Value) -> Result<Self, String> {
        let data = match value {
            Value::Object(mut obj) if obj.contains_key("EvalModel") => {
                obj.remove("EvalModel").unwrap_or(Value::Null)
            }
            other => other,
        };
        let raw: RawConfig = serde_json::from_value(data).map_err(|e| e.to_string())?;
        Ok(Self {
            model: raw.api_config.model,
            base_url: raw.api_config.base_url,
            api_key: raw.api_config.api_key,
            request_timeout_s: raw.api_config.timeout,
            max_retries: raw.api_config.max_retries,
            retry_backoff_s: raw.api_config.retry_delay,
            temperature: raw.generation_config.temperature,
            max_tokens: raw.generation_config.max_tokens,
            no_think: raw.generation_config.no_think,
            thinking_rules_file: raw.generation_config.thinking_rules_file,
            save_every: raw.save_every,
            heartbeat_s: raw.heartbeat_s.unwrap_or(60),
            stall_s: raw.stall_s,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wrapped_layout_is_flattened() {
        let cfg = InferenceConfig::from_value(json!({
            "EvalModel": {
                "api_config": {"model": "qwen3-8b", "base_url": "http://h:8000", "timeout": 30},
                "generation_config": {"temperature": 0.2, "no_think": true},
                "save_every": 7
            }
        }))
        .expect("config");
        assert_eq!(cfg.model, "qwen3-8b");
        assert_eq!(cfg.base_url, "http://h:8000");
        assert_eq!(cfg.request_timeout_s, 30);
        assert_eq!(cfg.max_retries, 5);
        assert_eq!(cfg.temperature, 0.2);
        assert_eq!(cfg.max_tokens, 8192);
        assert!(cfg.no_think);
        assert_eq!(cfg.save_every, 7);
        assert_eq!(cfg.heartbeat_s, 60);
        assert_eq!(cfg.stall_s, None);
    }

    #[test]
    fn bare_layout_and_empty_object_use_defaults() {
        let cfg = InferenceConfig::from_value(json!({})).expect("config");
        assert_eq!(cfg, InferenceConfig::default());
        let cfg = InferenceConfig::from_value(json!({"heartbeat_s": 0, "stall_s": 15}))
            .expect("config");
        assert_eq!(cfg.heartbeat_s, 0);
        assert_eq!(cfg.stall_s, Some(15));
    }

    #[test]
    fn wrong_types_are_reported() {
        let err = InferenceConfig::from_value(json!({"save_every": "often"}))
            .expect_err("should fail");
        assert!(err.contains("invalid type"), "unexpected: {}", err);
    }

    #[test]
    fn yaml_files_are_accepted() {
        let dir = std::env::temp_dir().join(format!(
            "evalrun_config_test_{}_{}",
            std::process::id(),
            chrono::Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&dir).expect("temp dir");
        let path = dir.join("config.yaml");
        fs::write(
            &path,
            "api_config:\n  model: m\n  base_url: http://x\ngeneration_config:\n  max_tokens: 16\n",
        )
        .expect("write");
        let cfg = InferenceConfig::from_file(&path).expect("config");
        assert_eq!(cfg.model, "m");
        assert_eq!(cfg.max_tokens, 16);
        assert!(matches!(
            InferenceConfig::from_file(&dir.join("missing.json")),
            Err(ConfigError::Io { .. })
        ));
        let _ = fs::remove_dir_all(dir);
    }
}
