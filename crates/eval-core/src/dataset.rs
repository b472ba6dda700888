use crate::digest::sha256_text;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_NO_THINK_PREFIX: &str = "/no_think ";

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("dataset not readable: {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("invalid JSONL at {path}:{line}: {source}")]
    InvalidLine {
        path: PathBuf,
        line: usize,
        source: serde_json::Error,
    },
    #[error("invalid JSON dataset {path}: {source}")]
    InvalidJson {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error(".json dataset must be a JSON array: {0}")]
    NotAnArray(PathBuf),
    #[error("dataset must be .jsonl or .json: {0}")]
    UnsupportedFormat(PathBuf),
    #[error("dataset item {index} is not a JSON object")]
    NotAnObject { index: usize },
    #[error("dataset item {index}: messages must be a non-empty list")]
    MissingMessages { index: usize },
    #[error("dataset item {index}: malformed message: {source}")]
    InvalidMessage {
        index: usize,
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(default)]
    pub role: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub content: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChatMessage {
    pub fn new(role: &str, content: &str) -> Self {
        Self {
            role: role.to_string(),
            content: Value::String(content.to_string()),
            extra: Map::new(),
        }
    }

    pub fn content_text(&self) -> String {
        match &self.content {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DatasetRecord {
    pub record_id: String,
    pub messages: Vec<ChatMessage>,
    pub pathway_id: String,
    pub pubmed_id: String,
}

impl DatasetRecord {
    pub fn new(messages: Vec<ChatMessage>, pathway_id: &str, pubmed_id: &str) -> Self {
        let record_id = compute_record_id(&messages, pathway_id, pubmed_id);
        Self {
            record_id,
            messages,
            pathway_id: pathway_id.to_string(),
            pubmed_id: pubmed_id.to_string(),
        }
    }

    fn from_value(value: Value, index: usize) -> Result<Self, DatasetError> {
        let Value::Object(mut obj) = value else {
            return Err(DatasetError::NotAnObject { index });
        };
        let messages = match obj.remove("messages") {
            Some(Value::Array(items)) if !items.is_empty() => items,
            _ => return Err(DatasetError::MissingMessages { index }),
        };
        let messages: Vec<ChatMessage> = messages
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<_, _>>()
            .map_err(|source| DatasetError::InvalidMessage { index, source })?;
        let pathway_id = key_string(obj.get("pathway_id"));
        let pubmed_id = key_string(obj.get("pubmed_id"));
        Ok(Self::new(messages, &pathway_id, &pubmed_id))
    }
}

pub fn key_string(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

pub fn compute_record_id(messages: &[ChatMessage], pathway_id: &str, pubmed_id: &str) -> String {
    let user_content = messages
        .iter()
        .find(|m| m.role == "user")
        .map(ChatMessage::content_text)
        .unwrap_or_default();
    sha256_text(&format!("{}|{}|{}", pathway_id, pubmed_id, user_content))
}

pub fn load_dataset(path: &Path) -> Result<Vec<DatasetRecord>, DatasetError> {
    let io_err = |source| DatasetError::Io {
        path: path.to_path_buf(),
        source,
    };
    let extension = path
        .extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_ascii_lowercase());
    let values: Vec<Value> = match extension.as_deref() {
        Some("jsonl") => {
            let file = fs::File::open(path).map_err(io_err)?;
            let mut values = Vec::new();
            for (idx, line) in BufReader::new(file).lines().enumerate() {
                let line = line.map_err(io_err)?;
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let value =
                    serde_json::from_str(trimmed).map_err(|source| DatasetError::InvalidLine {
                        path: path.to_path_buf(),
                        line: idx + 1,
                        source,
                    })?;
                values.push(value);
            }
            values
        }
        Some("json") => {
            let bytes = fs::read(path).map_err(io_err)?;
            let value: Value =
                serde_json::from_slice(&bytes).map_err(|source| DatasetError::InvalidJson {
                    path: path.to_path_buf(),
                    source,
                })?;
            match value {
                Value::Array(items) => items,
                _ => return Err(DatasetError::NotAnArray(path.to_path_buf())),
            }
        }
        _ => return Err(DatasetError::UnsupportedFormat(path.to_path_buf())),
    };
    values
        .into_iter()
        .enumerate()
        .map(|(index, value)| DatasetRecord::from_value(value, index))
        .collect()
}

/// Builds the prompt actually sent to the model. A trailing assistant message
/// is the reference answer and is dropped; with `no_think` the prefix is put
/// in front of the first user message unless it is already there.
pub fn build_infer_messages(
    messages: &[ChatMessage],
    no_think: bool,
    prompt_prefix: Option<&str>,
) -> Vec<ChatMessage> {
    let base = match messages.last() {
        Some(last) if last.role == "assistant" => &messages[..messages.len() - 1],
        _ => messages,
    };
    let mut out: Vec<ChatMessage> = base.to_vec();
    if !no_think {
        return out;
    }
    let prefix = prompt_prefix.unwrap_or(DEFAULT_NO_THINK_PREFIX);
    if prefix.is_empty() {
        return out;
    }
    if let Some(first_user) = out.iter_mut().find(|m| m.role == "user") {
        let content = first_user.content_text();
        if !content.starts_with(prefix) {
            first_user.content = Value::String(format!("{}{}", prefix, content));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scratch_file(name: &str, body: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "evalrun_dataset_test_{}_{}",
            std::process::id(),
            chrono::Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&dir).expect("temp dir");
        let path = dir.join(name);
        fs::write(&path, body).expect("write dataset");
        path
    }

    #[test]
    fn record_id_depends_on_keys_and_first_user_message() {
        let msgs = vec![
            ChatMessage::new("system", "be terse"),
            ChatMessage::new("user", "does A bind B?"),
            ChatMessage::new("user", "ignored"),
        ];
        let id = compute_record_id(&msgs, "hsa04110", "123");
        assert_eq!(id, sha256_text("hsa04110|123|does A bind B?"));
        assert_ne!(id, compute_record_id(&msgs, "hsa04110", "124"));
        let mut changed = msgs.clone();
        changed[0] = ChatMessage::new("system", "be verbose");
        assert_eq!(id, compute_record_id(&changed, "hsa04110", "123"));
    }

    #[test]
    fn load_jsonl_normalizes_numeric_keys_and_skips_blank_lines() {
        let path = scratch_file(
            "data.jsonl",
            concat!(
                r#"{"messages":[{"role":"user","content":"q1"}],"pathway_id":"p1","pubmed_id":42}"#,
                "\n\n",
                r#"{"messages":[{"role":"user","content":"q2"},{"role":"assistant","content":"a"}],"pathway_id":"p2"}"#,
                "\n"
            ),
        );
        let records = load_dataset(&path).expect("load");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].pubmed_id, "42");
        assert_eq!(records[1].pubmed_id, "");
        assert_eq!(
            records[0].record_id,
            sha256_text("p1|42|q1"),
            "numeric keys hash like their string form"
        );
        let _ = fs::remove_dir_all(path.parent().expect("parent"));
    }

    #[test]
    fn load_rejects_bad_lines_and_shapes() {
        let bad_line = scratch_file("bad.jsonl", "{\"messages\":[{\"role\":\"user\"}]}\n{oops\n");
        match load_dataset(&bad_line) {
            Err(DatasetError::InvalidLine { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected invalid line, got {:?}", other),
        }
        let not_array = scratch_file("obj.json", "{\"messages\":[]}");
        assert!(matches!(
            load_dataset(&not_array),
            Err(DatasetError::NotAnArray(_))
        ));
        let empty_msgs = scratch_file("empty.json", "[{\"messages\":[]}]");
        assert!(matches!(
            load_dataset(&empty_msgs),
            Err(DatasetError::MissingMessages { index: 0 })
        ));
        let csv = scratch_file("data.csv", "a,b");
        assert!(matches!(
            load_dataset(&csv),
            Err(DatasetError::UnsupportedFormat(_))
        ));
        for p in [bad_line, not_array, empty_msgs, csv] {
            let _ = fs::remove_dir_all(p.parent().expect("parent"));
        }
    }

    #[test]
    fn missing_dataset_is_an_io_error() {
        let err = load_dataset(Path::new("/nonexistent/evalrun/data.jsonl")).expect_err("missing");
        assert!(matches!(err, DatasetError::Io { .. }));
    }

    #[test]
    fn infer_messages_drop_reference_answer() {
        let msgs = vec![
            ChatMessage::new("user", "q"),
            ChatMessage::new("assistant", "reference"),
        ];
        let out = build_infer_messages(&msgs, false, None);
        assert_eq!(out, vec![ChatMessage::new("user", "q")]);
        assert_eq!(msgs.len(), 2, "source messages untouched");
    }

    #[test]
    fn no_think_prefixes_first_user_message_once() {
        let msgs = vec![
            ChatMessage::new("system", "s"),
            ChatMessage::new("user", "q"),
            ChatMessage::new("user", "q2"),
        ];
        let out = build_infer_messages(&msgs, true, None);
        assert_eq!(out[1].content, json!("/no_think q"));
        assert_eq!(out[2].content, json!("q2"));

        let custom = build_infer_messages(&msgs, true, Some("<nothink>"));
        assert_eq!(custom[1].content, json!("<nothink>q"));
        let again = build_infer_messages(&custom, true, Some("<nothink>"));
        assert_eq!(again[1].content, json!("<nothink>q"));

        let untouched = build_infer_messages(&msgs, false, Some("<nothink>"));
        assert_eq!(untouched[1].content, json!("q"));
    }

    #[test]
    fn unknown_message_fields_survive_round_trip() {
        let raw = json!({"role": "user", "content": "q", "name": "alice"});
        let msg: ChatMessage = serde_json::from_value(raw.clone()).expect("decode");
        assert_eq!(serde_json::to_value(&msg).expect("encode"), raw);
    }
}
