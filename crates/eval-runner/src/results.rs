use anyhow::Result;
use eval_core::{append_json_line, compute_record_id, key_string, ChatMessage, DatasetRecord};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalResult {
    pub model: String,
    pub response: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub record_id: String,
    pub messages: Vec<ChatMessage>,
    pub eval_result: EvalResult,
    pub pathway_id: String,
    pub pubmed_id: String,
}

impl ResultRecord {
    pub fn from_response(record: &DatasetRecord, model: &str, response: String) -> Self {
        Self {
            record_id: record.record_id.clone(),
            messages: record.messages.clone(),
            eval_result: EvalResult {
                model: model.to_string(),
                response,
            },
            pathway_id: record.pathway_id.clone(),
            pubmed_id: record.pubmed_id.clone(),
        }
    }
}

#[derive(Debug)]
pub struct ResultLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl ResultLog {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, record: &ResultRecord) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        append_json_line(&self.path, record)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordIdentity {
    Explicit(String),
    Derived(String),
    Anonymous,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultLine {
    pub identity: RecordIdentity,
    pub pair: Option<(String, String)>,
}

impl ResultLine {
    pub fn decode(line: &str) -> Option<Self> {
        let value: Value = serde_json::from_str(line.trim()).ok()?;
        let Value::Object(obj) = value else {
            return None;
        };
        Some(Self {
            identity: decode_identity(&obj),
            pair: pair_from(&obj).or_else(|| {
                obj.get("eval_result")
                    .and_then(Value::as_object)
                    .and_then(pair_from)
            }),
        })
    }

    pub fn record_id(&self) -> Option<&str> {
        match &self.identity {
            RecordIdentity::Explicit(id) | RecordIdentity::Derived(id) => Some(id.as_str()),
            RecordIdentity::Anonymous => None,
        }
    }
}

fn decode_identity(obj: &Map<String, Value>) -> RecordIdentity {
    if let Some(Value::String(id)) = obj.get("record_id") {
        if !id.is_empty() {
            return RecordIdentity::Explicit(id.clone());
        }
    }
    let Some(Value::Array(items)) = obj.get("messages") else {
        return RecordIdentity::Anonymous;
    };
    let messages: Result<Vec<ChatMessage>, _> = items
        .iter()
        .cloned()
        .map(serde_json::from_value)
        .collect();
    match messages {
        Ok(messages) => RecordIdentity::Derived(compute_record_id(
            &messages,
            &key_string(obj.get("pathway_id")),
            &key_string(obj.get("pubmed_id")),
        )),
        Err(_) => RecordIdentity::Anonymous,
    }
}

fn pair_from(obj: &Map<String, Value>) -> Option<(String, String)> {
    let pathway = obj.get("pathway_id").filter(|v| !v.is_null())?;
    let pubmed = obj.get("pubmed_id").filter(|v| !v.is_null())?;
    let pathway = key_string(Some(pathway));
    let pubmed = key_string(Some(pubmed));
    if pathway.is_empty() || pubmed.is_empty() {
        return None;
    }
    Some((pathway, pubmed))
}

/// Decodes every readable line. A missing log is empty; lines that fail to
/// decode are skipped. Bytes are split on `\n` before UTF-8 decoding so one
/// torn multi-byte character only costs its own line.
pub fn scan_result_log(path: &Path) -> Result<Vec<ResultLine>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    Ok(bytes
        .split(|b| *b == b'\n')
        .filter_map(|raw| {
            let line = String::from_utf8_lossy(raw);
            if line.trim().is_empty() {
                return None;
            }
            ResultLine::decode(&line)
        })
        .collect())
}
