pub mod checkpoint;
pub mod executor;
pub mod journal;
pub mod logging;
pub mod missing;
pub mod monitor;
pub mod orchestrate;
pub mod results;
pub mod signature;
pub mod store;

use anyhow::{Context, Result};
use checkpoint::{reconcile, DoneSet};
use eval_client::{GenerationParams, InferenceClient};
use eval_core::{load_dataset, DatasetError, DatasetRecord, InferenceConfig, ThinkingAction, ThinkingRules};
use executor::{finalize_run, ExecutionReport, ExecutorSettings, PromptPlan, TaskExecutor};
use journal::{EventContext, EventJournal, EventKind};
use monitor::MonitorSettings;
use serde::Serialize;
use serde_json::{json, Map, Value};
use signature::{compute_signature, SignatureInputs};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use store::{RunHandle, RunSelector, RunStatus, RunStore};
use thiserror::Error;
use tracing::{error, info, warn};

pub use logging::{init_tracing, RunLog};

#[derive(Debug, Error)]
pub enum RunError {
    #[error("--resume-run-id and --resume-signature are mutually exclusive")]
    ConflictingResumeSelectors,
    #[error("threads must be >= 1 (got {0})")]
    InvalidThreads(usize),
    #[error("run not found: {0}")]
    RunNotFound(PathBuf),
    #[error("no unfinished run for signature {0}")]
    NoUnfinishedRun(String),
    #[error("run metadata unreadable: {path}: {reason}")]
    MetadataUnreadable { path: PathBuf, reason: String },
    #[error("dataset unreadable: {path}: {reason}")]
    DatasetUnreadable { path: PathBuf, reason: String },
    #[error(transparent)]
    Dataset(#[from] DatasetError),
}

#[derive(Debug, Clone)]
pub struct RunArgs {
    pub data_path: PathBuf,
    pub task_type: String,
    pub base_url: String,
    pub model: String,
    pub threads: usize,
    pub outputs_root: PathBuf,
    pub resume_run_id: Option<String>,
    pub resume_signature: Option<String>,
    pub command_line: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub run_id: String,
    pub run_dir: PathBuf,
    pub signature: String,
    pub status: RunStatus,
    pub resumed: bool,
    pub total: usize,
    pub done: usize,
    pub processed: usize,
    pub failed: usize,
}

/// Marks the run `failed` on disk unless it was finalized.
struct RunGuard {
    run: RunHandle,
    done: bool,
}

impl RunGuard {
    fn new(run: RunHandle) -> Self {
        Self { run, done: false }
    }

    fn fail(&mut self) {
        if let Err(e) = self.run.finalize(RunStatus::Failed) {
            warn!(error = %e, "could not persist failed status");
        }
        self.done = true;
    }

    fn disarm(&mut self) {
        self.done = true;
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if !self.done {
            if let Err(e) = self.run.finalize(RunStatus::Failed) {
                warn!(run_id = %self.run.meta.run_id, error = %e, "could not persist failed status");
            }
        }
    }
}

pub fn load_thinking_rules(path: &Path) -> ThinkingRules {
    if !path.exists() {
        return ThinkingRules::default();
    }
    match ThinkingRules::from_file(path) {
        Ok(rules) => rules,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "thinking rules ignored");
            ThinkingRules::default()
        }
    }
}

pub fn run_evaluation(
    args: &RunArgs,
    cfg: &InferenceConfig,
    client: &dyn InferenceClient,
    run_log: &RunLog,
) -> Result<RunOutcome> {
    let selector = RunSelector::from_overrides(
        args.resume_run_id.as_deref(),
        args.resume_signature.as_deref(),
    )?;
    if args.threads == 0 {
        return Err(RunError::InvalidThreads(args.threads).into());
    }

    let rules = load_thinking_rules(&cfg.thinking_rules_file);
    let action = rules.resolve(&args.model, cfg.no_think);
    let computed_signature = compute_signature(&SignatureInputs {
        task_type: &args.task_type,
        model: &args.model,
        base_url: &args.base_url,
        dataset_path: &args.data_path,
        temperature: cfg.temperature,
        max_tokens: cfg.max_tokens,
        no_think: cfg.no_think,
        rules_path: Some(&cfg.thinking_rules_file),
    })?;
    let records = load_dataset(&args.data_path).map_err(RunError::from)?;

    let store = RunStore::new(&args.outputs_root);
    let run = store.resolve(&args.model, &args.task_type, &computed_signature, &selector)?;
    if let Err(e) = run_log.attach(&run.paths.log_file) {
        warn!(error = %e, "run log unavailable; logging to stderr only");
    }

    let ctx = EventContext {
        command: args.command_line.clone(),
        output_dir: run.paths.run_dir.clone(),
        model: args.model.clone(),
        task_type: args.task_type.clone(),
        signature: run.meta.signature.clone(),
        run_id: run.meta.run_id.clone(),
    };
    let journal = EventJournal::new(&args.outputs_root);
    let resumed = run.resumed;
    info!(
        run_id = %ctx.run_id,
        run_dir = %run.paths.run_dir.display(),
        resumed,
        dataset = %args.data_path.display(),
        task_type = %args.task_type,
        model = %args.model,
        threads = args.threads,
        "run resolved"
    );

    let mut guard = RunGuard::new(run);
    let driven = drive_run(&mut guard.run, &records, args, cfg, client, &action, &journal, &ctx);
    let (status, done, report) = match driven {
        Ok(result) => {
            guard.disarm();
            result
        }
        Err(err) => {
            guard.fail();
            let mut extra = Map::new();
            extra.insert("error".to_string(), Value::String(format!("{:#}", err)));
            if let Err(e) = journal.append(&ctx.event(EventKind::Fail, extra)) {
                warn!(error = %e, "could not record fail event");
            }
            error!(run_id = %ctx.run_id, error = %format!("{:#}", err), "run failed");
            run_log.detach();
            return Err(err);
        }
    };

    let kind = if status == RunStatus::Completed {
        EventKind::Complete
    } else {
        EventKind::Partial
    };
    let extra = match json!({
        "status": status,
        "done_records": done,
        "total_records": records.len(),
    }) {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    if let Err(e) = journal.append(&ctx.event(kind, extra)) {
        warn!(error = %e, "could not record completion event");
    }
    info!(
        status = %status,
        done,
        total = records.len(),
        processed = report.processed,
        failed = report.failed,
        "finished"
    );
    run_log.detach();

    Ok(RunOutcome {
        run_id: ctx.run_id,
        run_dir: guard.run.paths.run_dir.clone(),
        signature: ctx.signature,
        status,
        resumed,
        total: records.len(),
        done,
        processed: report.processed,
        failed: report.failed,
    })
}

#[allow(clippy::too_many_arguments)]
fn drive_run(
    run: &mut RunHandle,
    records: &[DatasetRecord],
    args: &RunArgs,
    cfg: &InferenceConfig,
    client: &dyn InferenceClient,
    action: &ThinkingAction,
    journal: &EventJournal,
    ctx: &EventContext,
) -> Result<(RunStatus, usize, ExecutionReport)> {
    let kind = if run.resumed {
        EventKind::Resume
    } else {
        EventKind::Start
    };
    journal
        .append(&ctx.event(kind, Map::new()))
        .with_context(|| format!("append {}", journal.path().display()))?;

    let reconciled = reconcile(&run.paths, records)?;
    let distinct = records
        .iter()
        .map(|r| r.record_id.as_str())
        .collect::<HashSet<_>>()
        .len();
    info!(
        total = records.len(),
        done = reconciled.done.len(),
        pending = reconciled.pending.len(),
        "pending set computed"
    );

    let done = Arc::new(DoneSet::new(reconciled.done));
    let executor = TaskExecutor::new(
        client,
        ExecutorSettings {
            concurrency: args.threads,
            save_every: cfg.save_every,
            monitor: MonitorSettings::from_secs(cfg.heartbeat_s, cfg.stall_s),
        },
        PromptPlan {
            model: args.model.clone(),
            no_think: cfg.no_think,
            prompt_prefix: action.prompt_prefix.clone(),
            params: GenerationParams {
                temperature: cfg.temperature,
                max_tokens: cfg.max_tokens,
                extra: action.request_params.clone().unwrap_or_default(),
            },
        },
    );
    let report = executor.run(&reconciled.pending, run, &done, distinct)?;
    let status = finalize_run(run, &done, records)?;
    Ok((status, done.len(), report))
}
