use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use eval_client::{ClientSettings, OpenAiCompatClient};
use eval_core::InferenceConfig;
use eval_runner::missing::{compute_missing_pairs, write_missing_dataset, MissingReport};
use eval_runner::orchestrate::{generate_script, shell_join};
use eval_runner::store::RESULTS_FILE;
use eval_runner::{init_tracing, run_evaluation, RunArgs, RunLog, RunOutcome};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(
    name = "evalrun",
    version,
    about = "Resumable evaluation runs against OpenAI-compatible endpoints"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate a dataset, resuming the latest unfinished matching run
    Run {
        #[arg(long)]
        data: PathBuf,
        #[arg(long)]
        task_type: String,
        #[arg(long)]
        base_url: Option<String>,
        #[arg(long)]
        api_key: Option<String>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long, default_value_t = 1)]
        threads: usize,
        #[arg(long, default_value = "config/config.json")]
        config: PathBuf,
        #[arg(long, default_value = "outputs")]
        outputs: PathBuf,
        #[arg(long, conflicts_with = "resume_signature")]
        resume_run_id: Option<String>,
        #[arg(long)]
        resume_signature: Option<String>,
        /// Heartbeat interval in seconds; 0 disables stall monitoring
        #[arg(long, env = "EVALRUN_HEARTBEAT_S")]
        heartbeat_secs: Option<u64>,
        #[arg(long, env = "EVALRUN_STALL_S")]
        stall_secs: Option<u64>,
        #[arg(long)]
        json: bool,
    },
    /// List dataset (pathway_id, pubmed_id) pairs a run has no result for
    Missing {
        #[arg(long)]
        data: PathBuf,
        #[arg(long)]
        run_dir: PathBuf,
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Generate a bash script running several tasks in sequence
    Orchestrate {
        #[arg(long)]
        tasks: PathBuf,
        #[arg(long)]
        out: PathBuf,
    },
}

fn main() -> Result<()> {
    let command_line = format!(
        "evalrun {}",
        shell_join(&std::env::args().skip(1).collect::<Vec<_>>())
    );
    let cli = Cli::parse();
    let run_log = RunLog::new();
    if let Err(err) = init_tracing(&run_log) {
        eprintln!("warning: {:#}", err);
    }
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command, &run_log, command_line);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn run_command(command: Commands, run_log: &RunLog, command_line: String) -> Result<Option<Value>> {
    match command {
        Commands::Run {
            data,
            task_type,
            base_url,
            api_key,
            model,
            threads,
            config,
            outputs,
            resume_run_id,
            resume_signature,
            heartbeat_secs,
            stall_secs,
            json,
        } => {
            if threads < 1 {
                return Err(anyhow!("--threads must be >= 1"));
            }
            if !data.exists() {
                return Err(anyhow!("dataset not found: {}", data.display()));
            }
            if !config.exists() {
                return Err(anyhow!("config not found: {}", config.display()));
            }
            let mut cfg = InferenceConfig::from_file(&config)?;
            if let Some(secs) = heartbeat_secs {
                cfg.heartbeat_s = secs;
            }
            if stall_secs.is_some() {
                cfg.stall_s = stall_secs;
            }
            let model = pick(model, &cfg.model)
                .ok_or_else(|| anyhow!("model must be provided via --model or config file"))?;
            let base_url = pick(base_url, &cfg.base_url)
                .ok_or_else(|| anyhow!("base-url must be provided via --base-url or config file"))?;
            let api_key = pick(api_key, &cfg.api_key).unwrap_or_default();

            let client = OpenAiCompatClient::new(ClientSettings {
                base_url: base_url.clone(),
                api_key,
                model: model.clone(),
                timeout: Duration::from_secs(cfg.request_timeout_s),
                max_retries: cfg.max_retries,
                retry_backoff: retry_backoff(cfg.retry_backoff_s)?,
            })?;
            let args = RunArgs {
                data_path: data,
                task_type,
                base_url,
                model,
                threads,
                outputs_root: outputs,
                resume_run_id,
                resume_signature,
                command_line,
            };
            let outcome = run_evaluation(&args, &cfg, &client, run_log)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "run": outcome_to_json(&outcome)
                })));
            }
            println!("run_id: {}", outcome.run_id);
            println!("status: {}", outcome.status);
            println!("resumed: {}", outcome.resumed);
            println!("signature: {}", outcome.signature);
            println!("done: {}/{}", outcome.done, outcome.total);
            if outcome.failed > 0 {
                println!("failed_this_invocation: {}", outcome.failed);
            }
            println!("run_dir: {}", outcome.run_dir.display());
        }
        Commands::Missing {
            data,
            run_dir,
            out,
            json,
        } => {
            if !data.exists() {
                return Err(anyhow!("dataset not found: {}", data.display()));
            }
            if !run_dir.exists() {
                return Err(anyhow!("run dir not found: {}", run_dir.display()));
            }
            let report = compute_missing_pairs(&data, &run_dir.join(RESULTS_FILE))?;
            let written = match &out {
                Some(path) => Some(write_missing_dataset(&report, path)?),
                None => None,
            };
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "missing",
                    "report": missing_to_json(&report),
                    "written": written.map(|p| p.display().to_string())
                })));
            }
            println!(
                "total_pairs: {} done_pairs: {} missing_pairs: {}",
                report.total, report.done_pairs, report.missing_pairs
            );
            for r in &report.missing_records {
                println!("{}\t{}\t{}", r.pathway_id, r.pubmed_id, r.record_id);
            }
            if let Some(path) = written {
                println!("wrote: {}", path.display());
            }
        }
        Commands::Orchestrate { tasks, out } => {
            let count = generate_script(&tasks, &out)?;
            println!("tasks: {}", count);
            println!("wrote: {}", out.display());
        }
    }
    Ok(None)
}

fn pick(flag: Option<String>, from_config: &str) -> Option<String> {
    flag.filter(|v| !v.trim().is_empty()).or_else(|| {
        if from_config.trim().is_empty() {
            None
        } else {
            Some(from_config.to_string())
        }
    })
}

fn retry_backoff(secs: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(secs.max(0.0))
        .map_err(|_| anyhow!("invalid retry_delay in config: {}", secs))
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. } | Commands::Missing { json, .. } => *json,
        Commands::Orchestrate { .. } => false,
    }
}

fn outcome_to_json(outcome: &RunOutcome) -> Value {
    json!({
        "run_id": outcome.run_id,
        "run_dir": outcome.run_dir.display().to_string(),
        "signature": outcome.signature,
        "status": outcome.status,
        "resumed": outcome.resumed,
        "total": outcome.total,
        "done": outcome.done,
        "processed": outcome.processed,
        "failed": outcome.failed
    })
}

fn missing_to_json(report: &MissingReport) -> Value {
    json!({
        "total": report.total,
        "done_pairs": report.done_pairs,
        "missing_pairs": report.missing_pairs,
        "missing": report
            .missing_records
            .iter()
            .map(|r| json!({
                "pathway_id": r.pathway_id,
                "pubmed_id": r.pubmed_id,
                "record_id": r.record_id
            }))
            .collect::<Vec<_>>()
    })
}
