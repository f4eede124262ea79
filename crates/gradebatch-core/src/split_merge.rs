//! Retry plumbing: `split` extracts the requests that need another attempt,
//! `merge` folds retry results back over the original responses.

use crate::jsonl::{read_responses, write_jsonl};
use crate::model::{RequestRecord, ResponseRecord};
use anyhow::Context;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SplitSummary {
    pub total: usize,
    pub missing: usize,
    pub failed: usize,
    pub written: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeSummary {
    pub files: usize,
    pub records: usize,
    pub overridden: usize,
}

/// Writes the requests whose response is absent, non-200, or carries an
/// error. Request lines are copied byte for byte.
pub fn split_failed(
    requests_path: &Path,
    responses_path: &Path,
    out_path: &Path,
) -> anyhow::Result<SplitSummary> {
    // the last record for an id decides
    let latest: HashMap<String, ResponseRecord> = read_responses(responses_path)?
        .into_iter()
        .map(|r| (r.custom_id.clone(), r))
        .collect();

    let raw = std::fs::read_to_string(requests_path)
        .with_context(|| format!("failed to read {}", requests_path.display()))?;

    let mut summary = SplitSummary::default();
    let mut keep = Vec::new();
    for (idx, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let req: RequestRecord = serde_json::from_str(line).with_context(|| {
            format!("{}:{}: invalid request record", requests_path.display(), idx + 1)
        })?;
        summary.total += 1;
        match latest.get(&req.custom_id) {
            None => {
                summary.missing += 1;
                keep.push(line);
            }
            Some(rec) if !rec.is_success() => {
                summary.failed += 1;
                keep.push(line);
            }
            Some(_) => {}
        }
    }

    if let Some(parent) = out_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let mut file = std::fs::File::create(out_path)
        .with_context(|| format!("failed to create {}", out_path.display()))?;
    for line in &keep {
        writeln!(file, "{}", line)?;
    }
    summary.written = keep.len();

    tracing::info!(
        input = %requests_path.display(),
        output = %out_path.display(),
        total = summary.total,
        missing = summary.missing,
        failed = summary.failed,
        "split retry requests"
    );
    Ok(summary)
}

/// Later files win for a shared custom id; records keep the position where
/// their id first appeared.
pub fn merge_responses(inputs: &[PathBuf], out_path: &Path) -> anyhow::Result<MergeSummary> {
    if inputs.is_empty() {
        anyhow::bail!("merge needs at least one response file");
    }
    let mut order: Vec<String> = Vec::new();
    let mut by_id: HashMap<String, ResponseRecord> = HashMap::new();
    let mut summary = MergeSummary {
        files: inputs.len(),
        ..Default::default()
    };

    for path in inputs {
        let records = read_responses(path)?;
        tracing::debug!(file = %path.display(), records = records.len(), "merging");
        for rec in records {
            let id = rec.custom_id.clone();
            if by_id.insert(id.clone(), rec).is_some() {
                summary.overridden += 1;
            } else {
                order.push(id);
            }
        }
    }

    let merged: Vec<ResponseRecord> = order
        .iter()
        .filter_map(|id| by_id.remove(id))
        .collect();
    summary.records = merged.len();
    write_jsonl(out_path, &merged)?;

    tracing::info!(
        files = summary.files,
        records = summary.records,
        overridden = summary.overridden,
        output = %out_path.display(),
        "merged responses"
    );
    Ok(summary)
}
