use crate::RunError;
use eval_core::{canonical_json_digest, sha256_file};
use serde_json::json;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

pub const RULES_ABSENT: &str = "builtin";
pub const RULES_UNREADABLE: &str = "error";

#[derive(Debug, Clone)]
pub struct SignatureInputs<'a> {
    pub task_type: &'a str,
    pub model: &'a str,
    pub base_url: &'a str,
    pub dataset_path: &'a Path,
    pub temperature: f64,
    pub max_tokens: u64,
    pub no_think: bool,
    pub rules_path: Option<&'a Path>,
}

pub fn rules_digest(rules_path: Option<&Path>) -> String {
    let Some(path) = rules_path else {
        return RULES_ABSENT.to_string();
    };
    match fs::metadata(path) {
        Err(e) if e.kind() == ErrorKind::NotFound => RULES_ABSENT.to_string(),
        Err(_) => RULES_UNREADABLE.to_string(),
        Ok(_) => sha256_file(path).unwrap_or_else(|_| RULES_UNREADABLE.to_string()),
    }
}

pub fn compute_signature(inputs: &SignatureInputs<'_>) -> Result<String, RunError> {
    let dataset_digest =
        sha256_file(inputs.dataset_path).map_err(|e| RunError::DatasetUnreadable {
            path: inputs.dataset_path.to_path_buf(),
            reason: e.to_string(),
        })?;
    let payload = json!({
        "task_type": inputs.task_type,
        "model": inputs.model,
        "base_url": inputs.base_url,
        "dataset_sha256": dataset_digest,
        "temperature": inputs.temperature,
        "max_tokens": inputs.max_tokens,
        "no_think": inputs.no_think,
        "thinking_rules_sha256": rules_digest(inputs.rules_path),
    });
    Ok(canonical_json_digest(&payload))
}
