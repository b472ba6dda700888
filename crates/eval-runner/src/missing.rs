use crate::results::scan_result_log;
use anyhow::{Context, Result};
use eval_core::{atomic_write_bytes, load_dataset, ChatMessage, DatasetRecord};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

type Pair = (String, String);

#[derive(Debug, Clone)]
pub struct MissingReport {
    pub total: usize,
    pub done_pairs: usize,
    pub missing_pairs: usize,
    pub missing_records: Vec<DatasetRecord>,
}

#[derive(Serialize)]
struct MissingLine<'a> {
    messages: &'a [ChatMessage],
    pathway_id: &'a str,
    pubmed_id: &'a str,
}

/// A pair listed twice in the dataset keeps its first position and its last
/// record.
pub fn compute_missing_pairs(data_path: &Path, results_path: &Path) -> Result<MissingReport> {
    let records = load_dataset(data_path)?;
    let mut order: Vec<Pair> = Vec::new();
    let mut by_pair: HashMap<Pair, DatasetRecord> = HashMap::new();
    for record in records {
        let key = (record.pathway_id.clone(), record.pubmed_id.clone());
        if by_pair.insert(key.clone(), record).is_none() {
            order.push(key);
        }
    }

    let done: HashSet<Pair> = scan_result_log(results_path)
        .with_context(|| format!("scan results {}", results_path.display()))?
        .into_iter()
        .filter_map(|line| line.pair)
        .collect();

    let done_pairs = order.iter().filter(|k| done.contains(*k)).count();
    let missing_records: Vec<DatasetRecord> = order
        .iter()
        .filter(|k| !done.contains(*k))
        .filter_map(|k| by_pair.remove(k))
        .collect();

    Ok(MissingReport {
        total: order.len(),
        done_pairs,
        missing_pairs: missing_records.len(),
        missing_records,
    })
}

pub fn write_missing_dataset(report: &MissingReport, out_path: &Path) -> Result<PathBuf> {
    let mut body = Vec::new();
    for record in &report.missing_records {
        serde_json::to_writer(
            &mut body,
            &MissingLine {
                messages: &record.messages,
                pathway_id: &record.pathway_id,
                pubmed_id: &record.pubmed_id,
            },
        )?;
        body.push(b'\n');
    }
    atomic_write_bytes(out_path, &body)
        .with_context(|| format!("write {}", out_path.display()))?;
    Ok(out_path.to_path_buf())
}
