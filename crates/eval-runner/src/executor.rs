use crate::checkpoint::DoneSet;
use crate::monitor::{Diagnostics, MonitorProbe, MonitorSettings, StallMonitor};
use crate::results::{ResultLog, ResultRecord};
use crate::store::{RunHandle, RunStatus};
use anyhow::{Context, Result};
use eval_client::{ClientError, GenerationParams, InferenceClient};
use eval_core::{build_infer_messages, DatasetRecord};
use std::any::Any;
use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy)]
pub struct ExecutorSettings {
    pub concurrency: usize,
    pub save_every: usize,
    pub monitor: MonitorSettings,
}

impl ExecutorSettings {
    pub fn flush_every(&self) -> usize {
        if self.save_every > 0 {
            self.save_every
        } else {
            self.concurrency.max(1)
        }
    }
}

#[derive(Debug, Clone)]
pub struct PromptPlan {
    pub model: String,
    pub no_think: bool,
    pub prompt_prefix: Option<String>,
    pub params: GenerationParams,
}

#[derive(Debug, Error)]
pub enum TaskError {
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("task panicked: {0}")]
    Panicked(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionReport {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
}

pub struct TaskExecutor<'c> {
    client: &'c dyn InferenceClient,
    settings: ExecutorSettings,
    plan: PromptPlan,
}

impl<'c> TaskExecutor<'c> {
    pub fn new(client: &'c dyn InferenceClient, settings: ExecutorSettings, plan: PromptPlan) -> Self {
        Self {
            client,
            settings,
            plan,
        }
    }

    /// Runs every pending record once. A failed record stays pending for the
    /// next invocation; only result-log or checkpoint I/O errors abort.
    pub fn run(
        &self,
        pending: &[&DatasetRecord],
        run: &mut RunHandle,
        done: &Arc<DoneSet>,
        total: usize,
    ) -> Result<ExecutionReport> {
        if pending.is_empty() {
            return Ok(ExecutionReport::default());
        }
        let workers = self.settings.concurrency.max(1).min(pending.len());
        let flush_every = self.settings.flush_every();
        let results = ResultLog::new(&run.paths.results_file);
        let diagnostics = Arc::new(Diagnostics::new(workers));
        let monitor = match StallMonitor::spawn(
            self.settings.monitor,
            MonitorProbe {
                diagnostics: Arc::clone(&diagnostics),
                done: Arc::clone(done),
                total,
                diagnostics_file: run.paths.diagnostics_file.clone(),
            },
        ) {
            Ok(monitor) => monitor,
            Err(e) => {
                warn!(error = %e, "heartbeat monitor not started");
                None
            }
        };

        info!(workers, pending = pending.len(), flush_every, "dispatching");
        let queue = Mutex::new(pending.iter().copied());
        let abort = AtomicBool::new(false);

        let outcome = thread::scope(|scope| -> Result<ExecutionReport> {
            let (tx, rx) = mpsc::channel::<(&DatasetRecord, Result<String, TaskError>)>();
            for worker in 0..workers {
                let tx = tx.clone();
                let queue = &queue;
                let abort = &abort;
                let diagnostics = &diagnostics;
                let spawned = thread::Builder::new()
                    .name(format!("evalrun-worker-{}", worker))
                    .spawn_scoped(scope, move || loop {
                        if abort.load(Ordering::Acquire) {
                            break;
                        }
                        let next = queue.lock().unwrap_or_else(PoisonError::into_inner).next();
                        let Some(record) = next else {
                            break;
                        };
                        diagnostics.begin(worker, record);
                        let result = self.call(record);
                        diagnostics.end(worker, record);
                        if tx.send((record, result)).is_err() {
                            break;
                        }
                    });
                if let Err(e) = spawned {
                    abort.store(true, Ordering::Release);
                    return Err(e).context("spawn worker thread");
                }
            }
            drop(tx);

            let mut report = ExecutionReport::default();
            for (record, result) in rx {
                report.processed += 1;
                match result {
                    Ok(response) => {
                        let line = ResultRecord::from_response(record, &self.plan.model, response);
                        if let Err(e) = results.append(&line) {
                            abort.store(true, Ordering::Release);
                            return Err(e).with_context(|| {
                                format!("append result {}", results.path().display())
                            });
                        }
                        done.insert(&record.record_id);
                        report.succeeded += 1;
                        debug!(
                            record_id = %record.record_id,
                            processed = report.processed,
                            of = pending.len(),
                            "record done"
                        );
                        if report.succeeded % flush_every == 0 {
                            if let Err(e) = flush_progress(run, done) {
                                abort.store(true, Ordering::Release);
                                return Err(e);
                            }
                            info!(
                                done = done.len(),
                                total,
                                processed = report.processed,
                                failed = report.failed,
                                "checkpoint saved"
                            );
                        }
                    }
                    Err(e) => {
                        report.failed += 1;
                        error!(
                            record_id = %record.record_id,
                            pathway_id = %record.pathway_id,
                            pubmed_id = %record.pubmed_id,
                            error = %e,
                            "record failed; left pending"
                        );
                    }
                }
            }
            Ok(report)
        });

        if let Some(monitor) = monitor {
            monitor.stop();
        }
        outcome
    }

    fn call(&self, record: &DatasetRecord) -> Result<String, TaskError> {
        let messages = build_infer_messages(
            &record.messages,
            self.plan.no_think,
            self.plan.prompt_prefix.as_deref(),
        );
        let attempt = panic::catch_unwind(AssertUnwindSafe(|| {
            self.client.chat_completion(&messages, &self.plan.params)
        }));
        match attempt {
            Ok(result) => result.map_err(TaskError::from),
            Err(payload) => Err(TaskError::Panicked(panic_message(payload.as_ref()))),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn flush_progress(run: &mut RunHandle, done: &DoneSet) -> Result<()> {
    done.flush(&run.paths.checkpoint_file)?;
    run.touch()
        .with_context(|| format!("update {}", run.paths.meta_file.display()))
}

/// Final checkpoint, then `completed` when every dataset record is done
/// (trivially so for an empty dataset) and `partial` otherwise.
pub fn finalize_run(
    run: &mut RunHandle,
    done: &DoneSet,
    records: &[DatasetRecord],
) -> Result<RunStatus> {
    done.flush(&run.paths.checkpoint_file)?;
    let dataset_ids: HashSet<&str> = records.iter().map(|r| r.record_id.as_str()).collect();
    let all_done = dataset_ids.iter().all(|id| done.contains(id));
    let status = if all_done {
        RunStatus::Completed
    } else {
        RunStatus::Partial
    };
    run.finalize(status)
        .with_context(|| format!("finalize {}", run.paths.meta_file.display()))?;
    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::load_checkpoint;
    use crate::results::scan_result_log;
    use crate::store::{RunSelector, RunStore};
    use chrono::Utc;
    use eval_core::ChatMessage;
    use std::collections::BTreeSet;
    use std::fs;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicUsize;

    struct Scripted {
        calls: AtomicUsize,
    }

    impl InferenceClient for Scripted {
        fn chat_completion(
            &self,
            messages: &[ChatMessage],
            _params: &GenerationParams,
        ) -> Result<String, ClientError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let question = messages
                .iter()
                .find(|m| m.role == "user")
                .map(ChatMessage::content_text)
                .unwrap_or_default();
            if question.ends_with("fail") {
                return Err(ClientError::RetriesExhausted {
                    attempts: 1,
                    last: Box::new(ClientError::Transport("refused".to_string())),
                });
            }
            if question.ends_with("panic") {
                panic!("client blew up");
            }
            Ok(format!("answer to {}", question))
        }
    }

    fn scratch(label: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!(
            "evalrun_executor_{}_{}_{}",
            label,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&root).expect("temp dir");
        root
    }

    fn records(questions: &[&str]) -> Vec<DatasetRecord> {
        questions
            .iter()
            .enumerate()
            .map(|(i, q)| {
                DatasetRecord::new(
                    vec![
                        ChatMessage::new("user", q),
                        ChatMessage::new("assistant", "gold"),
                    ],
                    "p",
                    &i.to_string(),
                )
            })
            .collect()
    }

    fn settings(concurrency: usize, save_every: usize) -> ExecutorSettings {
        ExecutorSettings {
            concurrency,
            save_every,
            monitor: MonitorSettings::from_secs(0, None),
        }
    }

    fn plan(no_think: bool) -> PromptPlan {
        PromptPlan {
            model: "m".to_string(),
            no_think,
            prompt_prefix: None,
            params: GenerationParams::default(),
        }
    }

    #[test]
    fn flush_cadence_defaults_to_concurrency() {
        assert_eq!(settings(4, 0).flush_every(), 4);
        assert_eq!(settings(4, 10).flush_every(), 10);
        assert_eq!(settings(0, 0).flush_every(), 1);
    }

    #[test]
    fn failures_and_panics_are_isolated() {
        let root = scratch("isolated");
        let mut run = RunStore::new(&root)
            .resolve("m", "t", "sig", &RunSelector::Automatic)
            .expect("run");
        let data = records(&["q0", "q1 fail", "q2", "q3 panic", "q4", "q5", "q6"]);
        let pending: Vec<&DatasetRecord> = data.iter().collect();
        let done = Arc::new(DoneSet::default());
        let client = Scripted {
            calls: AtomicUsize::new(0),
        };
        let executor = TaskExecutor::new(&client, settings(3, 2), plan(true));
        let report = executor
            .run(&pending, &mut run, &done, data.len())
            .expect("run");

        assert_eq!(report.processed, 7);
        assert_eq!(report.succeeded, 5);
        assert_eq!(report.failed, 2);
        assert_eq!(client.calls.load(Ordering::SeqCst), 7);
        assert_eq!(done.len(), 5);
        assert!(!done.contains(&data[1].record_id));
        assert!(!done.contains(&data[3].record_id));

        let lines = scan_result_log(&run.paths.results_file).expect("scan");
        assert_eq!(lines.len(), 5);
        let raw = fs::read_to_string(&run.paths.results_file).expect("read");
        assert!(raw.contains("answer to /no_think q0"));
        let flushed = load_checkpoint(&run.paths.checkpoint_file).expect("checkpoint");
        assert!(flushed.len() >= 4, "two flushes of two successes each");

        let status = finalize_run(&mut run, &done, &data).expect("finalize");
        assert_eq!(status, RunStatus::Partial);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn result_log_failure_aborts_the_run() {
        let root = scratch("abort");
        let mut run = RunStore::new(&root)
            .resolve("m", "t", "sig", &RunSelector::Automatic)
            .expect("run");
        fs::create_dir_all(&run.paths.results_file).expect("block results path");
        let data = records(&["q0", "q1", "q2", "q3"]);
        let pending: Vec<&DatasetRecord> = data.iter().collect();
        let done = Arc::new(DoneSet::default());
        let client = Scripted {
            calls: AtomicUsize::new(0),
        };
        let executor = TaskExecutor::new(&client, settings(1, 0), plan(false));
        let err = executor
            .run(&pending, &mut run, &done, data.len())
            .expect_err("append must fail");
        assert!(err.to_string().contains("append result"));
        assert!(done.is_empty());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn empty_pending_is_a_no_op_and_completes() {
        let root = scratch("empty");
        let mut run = RunStore::new(&root)
            .resolve("m", "t", "sig", &RunSelector::Automatic)
            .expect("run");
        let data = records(&["q0"]);
        let done = Arc::new(DoneSet::new(BTreeSet::from([data[0].record_id.clone()])));
        let client = Scripted {
            calls: AtomicUsize::new(0),
        };
        let report = TaskExecutor::new(&client, settings(2, 0), plan(false))
            .run(&[], &mut run, &done, 1)
            .expect("run");
        assert_eq!(report, ExecutionReport::default());
        assert_eq!(client.calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            finalize_run(&mut run, &done, &data).expect("finalize"),
            RunStatus::Completed
        );
        assert!(run.meta.completed_at.is_some());
        let _ = fs::remove_dir_all(root);
    }
}
