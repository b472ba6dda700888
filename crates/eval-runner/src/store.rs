use crate::RunError;
use anyhow::Result;
use chrono::{DateTime, Utc};
use eval_core::{atomic_write_json_pretty, ensure_dir, safe_name};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::debug;
use walkdir::WalkDir;

pub const META_FILE: &str = "run_meta.json";
pub const CHECKPOINT_FILE: &str = "checkpoint.json";
pub const RESULTS_FILE: &str = "results.jsonl";
pub const LOG_FILE: &str = "run.log";
pub const DIAGNOSTICS_FILE: &str = "stall_diagnostics.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Partial,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Partial => "partial",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub run_id: String,
    pub signature: String,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunPaths {
    pub run_dir: PathBuf,
    pub meta_file: PathBuf,
    pub checkpoint_file: PathBuf,
    pub results_file: PathBuf,
    pub log_file: PathBuf,
    pub diagnostics_file: PathBuf,
}

impl RunPaths {
    pub fn new(run_dir: &Path) -> Self {
        Self {
            run_dir: run_dir.to_path_buf(),
            meta_file: run_dir.join(META_FILE),
            checkpoint_file: run_dir.join(CHECKPOINT_FILE),
            results_file: run_dir.join(RESULTS_FILE),
            log_file: run_dir.join(LOG_FILE),
            diagnostics_file: run_dir.join(DIAGNOSTICS_FILE),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunSelector {
    Automatic,
    RunId(String),
    Signature(String),
}

impl RunSelector {
    /// Empty strings count as "not given". Both given is a configuration error
    /// raised before anything touches the filesystem.
    pub fn from_overrides(
        run_id: Option<&str>,
        signature: Option<&str>,
    ) -> Result<Self, RunError> {
        let run_id = run_id.map(str::trim).filter(|s| !s.is_empty());
        let signature = signature.map(str::trim).filter(|s| !s.is_empty());
        match (run_id, signature) {
            (Some(_), Some(_)) => Err(RunError::ConflictingResumeSelectors),
            (Some(id), None) => Ok(RunSelector::RunId(id.to_string())),
            (None, Some(sig)) => Ok(RunSelector::Signature(sig.to_string())),
            (None, None) => Ok(RunSelector::Automatic),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunHandle {
    pub meta: RunMetadata,
    pub paths: RunPaths,
    pub resumed: bool,
}

impl RunHandle {
    pub fn persist(&self) -> Result<()> {
        atomic_write_json_pretty(&self.paths.meta_file, &self.meta)
    }

    pub fn touch(&mut self) -> Result<()> {
        self.meta.updated_at = Utc::now();
        self.persist()
    }

    pub fn finalize(&mut self, status: RunStatus) -> Result<()> {
        let now = Utc::now();
        self.meta.status = status;
        self.meta.updated_at = now;
        if status == RunStatus::Completed {
            self.meta.completed_at = Some(now);
        }
        self.persist()
    }
}

pub fn read_metadata(path: &Path) -> Result<RunMetadata, String> {
    let bytes = fs::read(path).map_err(|e| e.to_string())?;
    serde_json::from_slice(&bytes).map_err(|e| e.to_string())
}

pub fn new_run_id() -> String {
    format!("run_{}", Utc::now().format("%Y%m%dT%H%M%S%.6fZ"))
}

#[derive(Debug, Clone)]
pub struct RunStore {
    outputs_root: PathBuf,
}

impl RunStore {
    pub fn new(outputs_root: &Path) -> Self {
        Self {
            outputs_root: outputs_root.to_path_buf(),
        }
    }

    pub fn outputs_root(&self) -> &Path {
        &self.outputs_root
    }

    pub fn task_dir(&self, model: &str, task_type: &str) -> PathBuf {
        self.outputs_root
            .join(safe_name(model))
            .join(safe_name(task_type))
    }

    pub fn resolve(
        &self,
        model: &str,
        task_type: &str,
        computed_signature: &str,
        selector: &RunSelector,
    ) -> Result<RunHandle> {
        let task_dir = self.task_dir(model, task_type);
        match selector {
            RunSelector::RunId(run_id) => Ok(open_explicit(&task_dir, run_id)?),
            RunSelector::Signature(signature) => {
                let (meta, run_dir) = find_latest_unfinished(&task_dir, signature)
                    .ok_or_else(|| RunError::NoUnfinishedRun(signature.clone()))?;
                Ok(RunHandle {
                    meta,
                    paths: RunPaths::new(&run_dir),
                    resumed: true,
                })
            }
            RunSelector::Automatic => match find_latest_unfinished(&task_dir, computed_signature) {
                Some((meta, run_dir)) => Ok(RunHandle {
                    meta,
                    paths: RunPaths::new(&run_dir),
                    resumed: true,
                }),
                None => create_run(&task_dir, computed_signature),
            },
        }
    }
}

fn open_explicit(task_dir: &Path, run_id: &str) -> Result<RunHandle, RunError> {
    let mut components = Path::new(run_id).components();
    let single_component = matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    );
    let run_dir = task_dir.join(run_id);
    if !single_component || !run_dir.is_dir() {
        return Err(RunError::RunNotFound(run_dir));
    }
    let paths = RunPaths::new(&run_dir);
    if !paths.meta_file.is_file() {
        return Err(RunError::RunNotFound(run_dir));
    }
    let meta = read_metadata(&paths.meta_file).map_err(|reason| RunError::MetadataUnreadable {
        path: paths.meta_file.clone(),
        reason,
    })?;
    Ok(RunHandle {
        meta,
        paths,
        resumed: true,
    })
}

/// Scans run directories directly under `task_dir`. Unreadable metadata skips
/// the candidate rather than failing the scan.
pub fn find_latest_unfinished(task_dir: &Path, signature: &str) -> Option<(RunMetadata, PathBuf)> {
    let mut best: Option<(RunMetadata, PathBuf)> = None;
    for entry in WalkDir::new(task_dir).min_depth(1).max_depth(1) {
        let Ok(entry) = entry else {
            continue;
        };
        if !entry.file_type().is_dir() {
            continue;
        }
        let meta_file = entry.path().join(META_FILE);
        let meta = match read_metadata(&meta_file) {
            Ok(meta) => meta,
            Err(reason) => {
                debug!(path = %meta_file.display(), %reason, "skipping run without readable metadata");
                continue;
            }
        };
        if meta.signature != signature || meta.status == RunStatus::Completed {
            continue;
        }
        let newer = match &best {
            None => true,
            Some((current, current_dir)) => {
                (meta.run_id.as_str(), entry.path()) > (current.run_id.as_str(), current_dir.as_path())
            }
        };
        if newer {
            best = Some((meta, entry.path().to_path_buf()));
        }
    }
    best
}

fn create_run(task_dir: &Path, signature: &str) -> Result<RunHandle> {
    ensure_dir(task_dir)?;
    let mut attempts = 0;
    let (run_id, run_dir) = loop {
        let run_id = new_run_id();
        let run_dir = task_dir.join(&run_id);
        match fs::create_dir(&run_dir) {
            Ok(()) => break (run_id, run_dir),
            Err(e) if e.kind() == ErrorKind::AlreadyExists && attempts < 100 => {
                attempts += 1;
                thread::sleep(Duration::from_millis(1));
            }
            Err(e) => return Err(e.into()),
        }
    };
    let now = Utc::now();
    let handle = RunHandle {
        meta: RunMetadata {
            run_id,
            signature: signature.to_string(),
            status: RunStatus::Running,
            created_at: now,
            updated_at: now,
            completed_at: None,
        },
        paths: RunPaths::new(&run_dir),
        resumed: false,
    };
    handle.persist()?;
    Ok(handle)
}
