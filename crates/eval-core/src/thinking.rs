use crate::config::{load_structured_file, ConfigError};
use serde_json::{Map, Value};
use std::path::Path;

/// Payload keys the client owns; rules can never override them.
pub const RESERVED_PAYLOAD_KEYS: [&str; 4] = ["model", "messages", "temperature", "max_tokens"];

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ThinkingAction {
    pub prompt_prefix: Option<String>,
    pub request_params: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ThinkingRule {
    pub match_contains: Vec<String>,
    pub when_no_think: ThinkingAction,
    pub when_think: ThinkingAction,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ThinkingRules {
    pub rules: Vec<ThinkingRule>,
}

impl ThinkingRules {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let value = load_structured_file(path)?;
        Self::from_value(&value).map_err(|message| ConfigError::Parse {
            path: path.to_path_buf(),
            message,
        })
    }

    pub fn from_value(value: &Value) -> Result<Self, String> {
        let items = value
            .get("rules")
            .and_then(Value::as_array)
            .ok_or_else(|| "rules file must contain a top-level list field 'rules'".to_string())?;
        let mut rules = Vec::new();
        for item in items {
            let Some(obj) = item.as_object() else {
                continue;
            };
            let match_contains: Vec<String> = match obj.get("match_contains") {
                Some(Value::String(s)) => vec![s.clone()],
                Some(Value::Array(list)) => list
                    .iter()
                    .map(|v| match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect(),
                _ => continue,
            };
            let match_contains: Vec<String> = match_contains
                .into_iter()
                .filter(|s| !s.trim().is_empty())
                .map(|s| s.to_lowercase())
                .collect();
            if match_contains.is_empty() {
                continue;
            }
            rules.push(ThinkingRule {
                match_contains,
                when_no_think: parse_action(obj.get("when_no_think")),
                when_think: parse_action(obj.get("when_think")),
            });
        }
        Ok(Self { rules })
    }

    pub fn resolve(&self, model: &str, no_think: bool) -> ThinkingAction {
        let name = model.to_lowercase();
        for rule in &self.rules {
            if rule.match_contains.iter().any(|s| name.contains(s.as_str())) {
                let action = if no_think {
                    &rule.when_no_think
                } else {
                    &rule.when_think
                };
                return sanitize_action(action);
            }
        }
        ThinkingAction::default()
    }
}

fn parse_action(value: Option<&Value>) -> ThinkingAction {
    let Some(obj) = value.and_then(Value::as_object) else {
        return ThinkingAction::default();
    };
    let prompt_prefix = match obj.get("prompt_prefix") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => Some(other.to_string()),
    };
    let request_params = obj.get("request_params").and_then(Value::as_object).cloned();
    ThinkingAction {
        prompt_prefix,
        request_params,
    }
}

fn sanitize_action(action: &ThinkingAction) -> ThinkingAction {
    let params = action.request_params.as_ref().map(|params| {
        params
            .iter()
            .filter(|(k, _)| !RESERVED_PAYLOAD_KEYS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect::<Map<String, Value>>()
    });
    ThinkingAction {
        prompt_prefix: action.prompt_prefix.clone(),
        request_params: params.filter(|p| !p.is_empty()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_rules() -> ThinkingRules {
        ThinkingRules::from_value(&json!({
            "rules": [
                "not an object",
                {"match_contains": "", "when_no_think": {"prompt_prefix": "x"}},
                {
                    "match_contains": ["Qwen3"],
                    "when_no_think": {"prompt_prefix": "/no_think "},
                    "when_think": {}
                },
                {
                    "match_contains": "glm",
                    "when_no_think": {
                        "request_params": {
                            "thinking": {"type": "disabled"},
                            "model": "hijack",
                            "max_tokens": 1
                        }
                    }
                },
                {"match_contains": "qwen", "when_no_think": {"prompt_prefix": "never"}}
            ]
        }))
        .expect("rules")
    }

    #[test]
    fn malformed_entries_are_skipped() {
        assert_eq!(sample_rules().rules.len(), 3);
        assert!(ThinkingRules::from_value(&json!({"rules": {}})).is_err());
    }

    #[test]
    fn first_case_insensitive_match_wins() {
        let rules = sample_rules();
        let action = rules.resolve("qwen3-32b-instruct", true);
        assert_eq!(action.prompt_prefix.as_deref(), Some("/no_think "));
        assert_eq!(rules.resolve("QWEN3-32B", false), ThinkingAction::default());
        assert_eq!(rules.resolve("llama-3", true), ThinkingAction::default());
    }

    #[test]
    fn reserved_request_params_are_stripped() {
        let action = sample_rules().resolve("GLM-4.5", true);
        let params = action.request_params.expect("params");
        assert_eq!(params.len(), 1);
        assert_eq!(params["thinking"], json!({"type": "disabled"}));
    }
}
