use crate::results::scan_result_log;
use crate::store::RunPaths;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use eval_core::{atomic_write_json_pretty, DatasetRecord};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    #[serde(default)]
    pub done_record_ids: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

/// Missing file is an empty checkpoint. A file that exists but does not parse
/// is also treated as empty (it is rebuilt from the result log); read errors
/// other than not-found propagate.
pub fn load_checkpoint(path: &Path) -> Result<BTreeSet<String>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(BTreeSet::new()),
        Err(e) => {
            return Err(e).with_context(|| format!("read checkpoint {}", path.display()));
        }
    };
    match serde_json::from_slice::<Checkpoint>(&bytes) {
        Ok(checkpoint) => Ok(checkpoint.done_record_ids.into_iter().collect()),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "checkpoint unparsable; rebuilding from results");
            Ok(BTreeSet::new())
        }
    }
}

pub fn save_checkpoint(path: &Path, done: &BTreeSet<String>) -> Result<()> {
    let checkpoint = Checkpoint {
        done_record_ids: done.iter().cloned().collect(),
        updated_at: Utc::now(),
    };
    atomic_write_json_pretty(path, &checkpoint)
        .with_context(|| format!("write checkpoint {}", path.display()))
}

#[derive(Debug, Default)]
pub struct DoneSet {
    inner: Mutex<BTreeSet<String>>,
}

impl DoneSet {
    pub fn new(initial: BTreeSet<String>) -> Self {
        Self {
            inner: Mutex::new(initial),
        }
    }

    pub fn insert(&self, record_id: &str) -> bool {
        self.lock().insert(record_id.to_string())
    }

    pub fn contains(&self, record_id: &str) -> bool {
        self.lock().contains(record_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn snapshot(&self) -> BTreeSet<String> {
        self.lock().clone()
    }

    pub fn flush(&self, path: &Path) -> Result<()> {
        let snapshot = self.snapshot();
        save_checkpoint(path, &snapshot)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeSet<String>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug)]
pub struct Reconciliation<'a> {
    pub done: BTreeSet<String>,
    pub pending: Vec<&'a DatasetRecord>,
    pub recovered: usize,
    pub dropped: usize,
}

pub fn reconcile<'a>(paths: &RunPaths, records: &'a [DatasetRecord]) -> Result<Reconciliation<'a>> {
    let from_checkpoint = load_checkpoint(&paths.checkpoint_file)?;
    let from_results: BTreeSet<String> = scan_result_log(&paths.results_file)
        .with_context(|| format!("scan results {}", paths.results_file.display()))?
        .iter()
        .filter_map(|line| line.record_id().map(str::to_string))
        .collect();

    let dataset_ids: HashSet<&str> = records.iter().map(|r| r.record_id.as_str()).collect();
    let recovered = from_results.difference(&from_checkpoint).count();
    let union: BTreeSet<String> = from_checkpoint.union(&from_results).cloned().collect();
    let before = union.len();
    let done: BTreeSet<String> = union
        .into_iter()
        .filter(|id| dataset_ids.contains(id.as_str()))
        .collect();
    let dropped = before - done.len();

    save_checkpoint(&paths.checkpoint_file, &done)?;

    let mut seen = HashSet::new();
    let pending: Vec<&DatasetRecord> = records
        .iter()
        .filter(|r| !done.contains(&r.record_id) && seen.insert(r.record_id.as_str()))
        .collect();

    info!(
        done = done.len(),
        pending = pending.len(),
        recovered,
        dropped,
        "reconciled checkpoint with results"
    );
    Ok(Reconciliation {
        done,
        pending,
        recovered,
        dropped,
    })
}
