use anyhow::Result;
use chrono::{DateTime, Utc};
use eval_core::append_json_line;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

pub const JOURNAL_FILE: &str = "_task_records.jsonl";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Start,
    Resume,
    Complete,
    Partial,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub event: EventKind,
    pub at: DateTime<Utc>,
    pub command: String,
    pub output_dir: String,
    pub model: String,
    pub task_type: String,
    pub signature: String,
    pub run_id: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone)]
pub struct EventContext {
    pub command: String,
    pub output_dir: PathBuf,
    pub model: String,
    pub task_type: String,
    pub signature: String,
    pub run_id: String,
}

impl EventContext {
    pub fn event(&self, kind: EventKind, extra: Map<String, Value>) -> TaskEvent {
        TaskEvent {
            event: kind,
            at: Utc::now(),
            command: self.command.clone(),
            output_dir: self.output_dir.display().to_string(),
            model: self.model.clone(),
            task_type: self.task_type.clone(),
            signature: self.signature.clone(),
            run_id: self.run_id.clone(),
            extra,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventJournal {
    path: PathBuf,
}

impl EventJournal {
    pub fn new(outputs_root: &Path) -> Self {
        Self {
            path: outputs_root.join(JOURNAL_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, event: &TaskEvent) -> Result<()> {
        append_json_line(&self.path, event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;

    #[test]
    fn events_append_with_flattened_extra() {
        let root = std::env::temp_dir().join(format!(
            "evalrun_journal_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        let journal = EventJournal::new(&root);
        let ctx = EventContext {
            command: "evalrun run --data d.jsonl".to_string(),
            output_dir: root.join("m").join("t").join("run_x"),
            model: "m".to_string(),
            task_type: "t".to_string(),
            signature: "sig".to_string(),
            run_id: "run_x".to_string(),
        };
        journal
            .append(&ctx.event(EventKind::Start, Map::new()))
            .expect("start");
        let mut extra = Map::new();
        extra.insert("error".to_string(), json!("disk full"));
        journal
            .append(&ctx.event(EventKind::Fail, extra))
            .expect("fail");

        let body = fs::read_to_string(journal.path()).expect("read");
        let lines: Vec<Value> = body
            .lines()
            .map(|l| serde_json::from_str(l).expect("json line"))
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["event"], "start");
        assert_eq!(lines[1]["event"], "fail");
        assert_eq!(lines[1]["error"], "disk full");
        assert_eq!(lines[1]["run_id"], "run_x");
        let parsed: TaskEvent = serde_json::from_value(lines[1].clone()).expect("typed");
        assert_eq!(parsed.extra.get("error"), Some(&json!("disk full")));
        let _ = fs::remove_dir_all(root);
    }
}
