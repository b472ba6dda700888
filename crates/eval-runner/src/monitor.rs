use crate::checkpoint::DoneSet;
use anyhow::Result;
use chrono::Utc;
use eval_core::DatasetRecord;
use std::fmt::Write as _;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const MIN_STALL: Duration = Duration::from_secs(180);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorSettings {
    pub heartbeat: Duration,
    pub stall: Duration,
}

impl MonitorSettings {
    /// Without an explicit threshold a stall is `max(180s, 3 x heartbeat)`.
    pub fn new(heartbeat: Duration, stall: Option<Duration>) -> Self {
        let stall = stall.unwrap_or_else(|| MIN_STALL.max(heartbeat * 3));
        Self { heartbeat, stall }
    }

    pub fn from_secs(heartbeat_s: u64, stall_s: Option<u64>) -> Self {
        Self::new(
            Duration::from_secs(heartbeat_s),
            stall_s.map(Duration::from_secs),
        )
    }

    pub fn enabled(&self) -> bool {
        !self.heartbeat.is_zero()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordRef {
    pub record_id: String,
    pub pathway_id: String,
    pub pubmed_id: String,
}

impl RecordRef {
    fn of(record: &DatasetRecord) -> Self {
        Self {
            record_id: record.record_id.clone(),
            pathway_id: record.pathway_id.clone(),
            pubmed_id: record.pubmed_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Calling(RecordRef),
}

#[derive(Debug, Clone)]
struct WorkerSlot {
    state: WorkerState,
    since: Instant,
}

#[derive(Debug)]
struct DiagState {
    last_activity: Instant,
    in_flight: usize,
    last_record: Option<RecordRef>,
    workers: Vec<WorkerSlot>,
}

#[derive(Debug, Clone)]
pub struct WorkerView {
    pub index: usize,
    pub state: WorkerState,
    pub for_how_long: Duration,
}

#[derive(Debug, Clone)]
pub struct DiagSnapshot {
    pub idle: Duration,
    pub in_flight: usize,
    pub last_record: Option<RecordRef>,
    pub workers: Vec<WorkerView>,
}

#[derive(Debug)]
pub struct Diagnostics {
    state: Mutex<DiagState>,
}

impl Diagnostics {
    pub fn new(workers: usize) -> Self {
        let now = Instant::now();
        Self {
            state: Mutex::new(DiagState {
                last_activity: now,
                in_flight: 0,
                last_record: None,
                workers: vec![
                    WorkerSlot {
                        state: WorkerState::Idle,
                        since: now,
                    };
                    workers
                ],
            }),
        }
    }

    pub fn begin(&self, worker: usize, record: &DatasetRecord) {
        let now = Instant::now();
        let mut state = self.lock();
        state.last_activity = now;
        state.in_flight += 1;
        state.last_record = Some(RecordRef::of(record));
        if let Some(slot) = state.workers.get_mut(worker) {
            slot.state = WorkerState::Calling(RecordRef::of(record));
            slot.since = now;
        }
    }

    pub fn end(&self, worker: usize, record: &DatasetRecord) {
        let now = Instant::now();
        let mut state = self.lock();
        state.last_activity = now;
        state.in_flight = state.in_flight.saturating_sub(1);
        state.last_record = Some(RecordRef::of(record));
        if let Some(slot) = state.workers.get_mut(worker) {
            slot.state = WorkerState::Idle;
            slot.since = now;
        }
    }

    pub fn snapshot(&self) -> DiagSnapshot {
        let now = Instant::now();
        let state = self.lock();
        DiagSnapshot {
            idle: now.saturating_duration_since(state.last_activity),
            in_flight: state.in_flight,
            last_record: state.last_record.clone(),
            workers: state
                .workers
                .iter()
                .enumerate()
                .map(|(index, slot)| WorkerView {
                    index,
                    state: slot.state.clone(),
                    for_how_long: now.saturating_duration_since(slot.since),
                })
                .collect(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DiagState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn round_tenths(d: Duration) -> f64 {
    (d.as_secs_f64() * 10.0).round() / 10.0
}

#[derive(Debug, Clone)]
pub struct MonitorProbe {
    pub diagnostics: Arc<Diagnostics>,
    pub done: Arc<DoneSet>,
    pub total: usize,
    pub diagnostics_file: PathBuf,
}

impl MonitorProbe {
    fn beat(&self, settings: &MonitorSettings, last_dump: &mut Option<Instant>) {
        let snap = self.diagnostics.snapshot();
        let done = self.done.len();
        let last = snap.last_record.as_ref();
        info!(
            done,
            total = self.total,
            pending = self.total.saturating_sub(done),
            in_flight = snap.in_flight,
            idle_s = round_tenths(snap.idle),
            last_record_id = last.map_or("-", |r| r.record_id.as_str()),
            last_pathway_id = last.map_or("-", |r| r.pathway_id.as_str()),
            last_pubmed_id = last.map_or("-", |r| r.pubmed_id.as_str()),
            "heartbeat"
        );
        let due = last_dump.map_or(true, |at| at.elapsed() >= settings.stall);
        if snap.idle >= settings.stall && due {
            *last_dump = Some(Instant::now());
            warn!(
                idle_s = round_tenths(snap.idle),
                file = %self.diagnostics_file.display(),
                "stall detected; dumping worker states"
            );
            if let Err(e) = self.dump(&snap, done) {
                debug!(error = %e, "stall dump failed");
            }
        }
    }

    fn dump(&self, snap: &DiagSnapshot, done: usize) -> Result<()> {
        let mut text = String::new();
        writeln!(
            text,
            "\n=== {} STALL_DETECTED idle={:.1}s ===",
            Utc::now().to_rfc3339(),
            snap.idle.as_secs_f64()
        )?;
        writeln!(
            text,
            "done={}/{} in_flight={}",
            done, self.total, snap.in_flight
        )?;
        for worker in &snap.workers {
            match &worker.state {
                WorkerState::Idle => writeln!(
                    text,
                    "worker-{}: idle for {:.1}s",
                    worker.index,
                    worker.for_how_long.as_secs_f64()
                )?,
                WorkerState::Calling(r) => writeln!(
                    text,
                    "worker-{}: calling record_id={} pathway_id={} pubmed_id={} for {:.1}s",
                    worker.index,
                    r.record_id,
                    r.pathway_id,
                    r.pubmed_id,
                    worker.for_how_long.as_secs_f64()
                )?,
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.diagnostics_file)?;
        file.write_all(text.as_bytes())?;
        file.flush()?;
        Ok(())
    }
}

/// Background heartbeat thread tied to one run. Stopping it (or dropping it)
/// wakes the thread immediately and joins it.
#[derive(Debug)]
pub struct StallMonitor {
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl StallMonitor {
    pub fn spawn(settings: MonitorSettings, probe: MonitorProbe) -> Result<Option<Self>> {
        if !settings.enabled() {
            debug!("heartbeat disabled");
            return Ok(None);
        }
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let handle = thread::Builder::new()
            .name("evalrun-heartbeat".to_string())
            .spawn(move || {
                let mut last_dump = None;
                loop {
                    match stop_rx.recv_timeout(settings.heartbeat) {
                        Err(RecvTimeoutError::Timeout) => probe.beat(&settings, &mut last_dump),
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            })?;
        Ok(Some(Self {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        }))
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("heartbeat thread panicked");
            }
        }
    }
}

impl Drop for StallMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eval_core::ChatMessage;
    use std::collections::BTreeSet;
    use std::fs;

    fn record(q: &str) -> DatasetRecord {
        DatasetRecord::new(vec![ChatMessage::new("user", q)], "p1", "42")
    }

    #[test]
    fn default_stall_threshold() {
        let s = MonitorSettings::from_secs(60, None);
        assert_eq!(s.stall, Duration::from_secs(180));
        let s = MonitorSettings::from_secs(100, None);
        assert_eq!(s.stall, Duration::from_secs(300));
        let s = MonitorSettings::from_secs(100, Some(5));
        assert_eq!(s.stall, Duration::from_secs(5));
        assert!(!MonitorSettings::from_secs(0, None).enabled());
    }

    #[test]
    fn begin_and_end_track_in_flight() {
        let diag = Diagnostics::new(2);
        let rec = record("q");
        diag.begin(1, &rec);
        let snap = diag.snapshot();
        assert_eq!(snap.in_flight, 1);
        assert_eq!(snap.workers[0].state, WorkerState::Idle);
        assert!(matches!(&snap.workers[1].state, WorkerState::Calling(r) if r.record_id == rec.record_id));
        diag.end(1, &rec);
        diag.end(7, &rec);
        let snap = diag.snapshot();
        assert_eq!(snap.in_flight, 0);
        assert_eq!(snap.last_record.map(|r| r.pubmed_id), Some("42".to_string()));
    }

    #[test]
    fn disabled_monitor_never_spawns() {
        let probe = MonitorProbe {
            diagnostics: Arc::new(Diagnostics::new(1)),
            done: Arc::new(DoneSet::default()),
            total: 0,
            diagnostics_file: std::env::temp_dir().join("evalrun_never_written.log"),
        };
        let monitor = StallMonitor::spawn(MonitorSettings::from_secs(0, None), probe)
            .expect("spawn");
        assert!(monitor.is_none());
    }

    #[test]
    fn stalled_worker_is_dumped_and_monitor_stops() {
        let root = std::env::temp_dir().join(format!(
            "evalrun_monitor_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&root).expect("temp dir");
        let file = root.join("stall_diagnostics.log");
        let diagnostics = Arc::new(Diagnostics::new(2));
        let rec = record("slow");
        diagnostics.begin(0, &rec);
        let probe = MonitorProbe {
            diagnostics: Arc::clone(&diagnostics),
            done: Arc::new(DoneSet::new(BTreeSet::new())),
            total: 3,
            diagnostics_file: file.clone(),
        };
        let settings = MonitorSettings::new(Duration::from_millis(10), Some(Duration::from_millis(30)));
        let monitor = StallMonitor::spawn(settings, probe)
            .expect("spawn")
            .expect("enabled");
        thread::sleep(Duration::from_millis(250));
        monitor.stop();

        let body = fs::read_to_string(&file).expect("diagnostics written");
        assert!(body.contains("STALL_DETECTED"));
        assert!(body.contains(&format!("worker-0: calling record_id={}", rec.record_id)));
        assert!(body.contains("worker-1: idle"));
        assert!(body.contains("done=0/3 in_flight=1"));
        let _ = fs::remove_dir_all(root);
    }
}
