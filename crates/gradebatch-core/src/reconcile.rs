//! Joins an answer batch with its evaluator batches into one table per model
//! configuration and derives `final_correctness` by majority vote.

use crate::custom_id::CustomId;
use crate::errors::StructuralError;
use crate::jsonl::{file_stem, read_responses};
use crate::model::ResponseRecord;
use anyhow::Context;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

/// Score for a metric that has no evaluator record at all.
pub const MISSING_SCORE: i32 = -1;
/// Score for an evaluator response whose grade could not be read.
pub const UNPARSEABLE_SCORE: i32 = -2;
pub const NOT_ANSWERED: &str = "<not answered>";
pub const CORRECTNESS_METRIC: &str = "correctness";
pub const FINAL_COLUMN: &str = "final_correctness";

const KEY_COLUMNS: [&str; 4] = [
    "model_config_id",
    "question_id",
    "prompt_variation_id",
    "response",
];

/// Letter grade from the last whitespace-delimited token: `A`..`D` map to
/// 3..0, case-insensitive, surrounding punctuation ignored.
pub fn extract_score(text: &str) -> i32 {
    let Some(token) = text.split_whitespace().last() else {
        return UNPARSEABLE_SCORE;
    };
    let token = token
        .trim_matches(|c: char| !c.is_alphanumeric())
        .to_ascii_uppercase();
    match token.as_str() {
        "A" => 3,
        "B" => 2,
        "C" => 1,
        "D" => 0,
        _ => UNPARSEABLE_SCORE,
    }
}

/// Any value seen at least twice wins; among equally frequent winners the
/// lowest score is taken. No repeated value (including a single voter) is 0.
pub fn majority_vote(scores: &[i32]) -> i32 {
    let mut counts: BTreeMap<i32, usize> = BTreeMap::new();
    for s in scores {
        *counts.entry(*s).or_default() += 1;
    }
    let best = counts.values().copied().max().unwrap_or(0);
    if best < 2 {
        return 0;
    }
    // BTreeMap iterates in ascending score order
    counts
        .into_iter()
        .find(|(_, n)| *n == best)
        .map(|(score, _)| score)
        .unwrap_or(0)
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RowKey {
    pub model_config_id: String,
    pub question_id: String,
    pub prompt_variation_id: String,
}

impl From<&CustomId> for RowKey {
    fn from(id: &CustomId) -> Self {
        Self {
            model_config_id: id.model_config_id.clone(),
            question_id: id.question_id.clone(),
            prompt_variation_id: id.prompt_variation_id.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EvaluatorInput {
    pub name: String,
    pub path: PathBuf,
}

impl EvaluatorInput {
    /// `name=path`, or a bare path named after its parent directory.
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        if let Some((name, path)) = raw.split_once('=') {
            if name.is_empty() || path.is_empty() {
                anyhow::bail!("evaluator must be NAME=PATH, got '{}'", raw);
            }
            return Ok(Self {
                name: name.to_string(),
                path: PathBuf::from(path),
            });
        }
        let path = PathBuf::from(raw);
        let name = path
            .parent()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().to_string())
            .filter(|n| !n.is_empty())
            .ok_or_else(|| anyhow::anyhow!("cannot derive an evaluator name from '{}'; use NAME=PATH", raw))?;
        Ok(Self { name, path })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconciledRow {
    pub key: RowKey,
    pub response: String,
    /// One score per entry of [`ReconciledTable::columns`].
    pub scores: Vec<i32>,
    pub final_correctness: i32,
}

#[derive(Debug, Clone)]
pub struct ReconciledTable {
    pub model_config_id: String,
    /// `<evaluator>_<metric>` score columns, in output order.
    pub columns: Vec<String>,
    pub rows: Vec<ReconciledRow>,
}

impl ReconciledTable {
    pub fn header(&self) -> Vec<String> {
        KEY_COLUMNS
            .iter()
            .map(|s| s.to_string())
            .chain(self.columns.iter().cloned())
            .chain(std::iter::once(FINAL_COLUMN.to_string()))
            .collect()
    }

    pub fn to_csv(&self) -> String {
        let mut out = String::new();
        let header: Vec<String> = self.header().iter().map(|h| escape_csv(h)).collect();
        let _ = writeln!(out, "{}", header.join(","));
        for row in &self.rows {
            let mut fields = vec![
                escape_csv(&row.key.model_config_id),
                escape_csv(&row.key.question_id),
                escape_csv(&row.key.prompt_variation_id),
                escape_csv(&row.response),
            ];
            fields.extend(row.scores.iter().map(|s| s.to_string()));
            fields.push(row.final_correctness.to_string());
            let _ = writeln!(out, "{}", fields.join(","));
        }
        out
    }
}

fn escape_csv(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

fn source_name(path: &Path) -> String {
    path.display().to_string()
}

/// Answers keyed by row; later duplicates replace earlier ones.
fn load_answers(path: &Path, expected_mc: &str) -> anyhow::Result<BTreeMap<RowKey, ResponseRecord>> {
    let source = source_name(path);
    let mut out = BTreeMap::new();
    for rec in read_responses(path)? {
        let id = CustomId::parse_expecting(&rec.custom_id, expected_mc, &source)?;
        if id.metric_id.is_some() {
            return Err(StructuralError::MalformedCustomId {
                custom_id: rec.custom_id.clone(),
                reason: format!("evaluator record in answer file {}", source),
            }
            .into());
        }
        out.insert(RowKey::from(&id), rec);
    }
    Ok(out)
}

/// One evaluator's long-form records pivoted to `key → metric → score`.
fn load_evaluator(
    input: &EvaluatorInput,
    expected_mc: &str,
) -> anyhow::Result<BTreeMap<RowKey, BTreeMap<String, i32>>> {
    let source = source_name(&input.path);
    let mut out: BTreeMap<RowKey, BTreeMap<String, i32>> = BTreeMap::new();
    let mut unparseable = 0usize;
    for rec in read_responses(&input.path)
        .with_context(|| format!("reading evaluator '{}'", input.name))?
    {
        let id = CustomId::parse_expecting(&rec.custom_id, expected_mc, &source)?;
        let Some(metric) = id.metric_id.clone() else {
            return Err(StructuralError::MalformedCustomId {
                custom_id: rec.custom_id.clone(),
                reason: format!("answer record in evaluator file {}", source),
            }
            .into());
        };
        let score = match (&rec.content, rec.is_success()) {
            (Some(text), true) => {
                let s = extract_score(text);
                if s == UNPARSEABLE_SCORE {
                    unparseable += 1;
                }
                s
            }
            _ => MISSING_SCORE,
        };
        out.entry(RowKey::from(&id)).or_default().insert(metric, score);
    }
    if unparseable > 0 {
        tracing::warn!(evaluator = %input.name, unparseable, "grades without a recognizable letter");
    }
    Ok(out)
}

/// Builds the reconciled table for one answer file.
///
/// `expected_mc` defaults to the answer file's stem; every custom id in every
/// input must carry that model config id.
pub fn reconcile(
    answer_path: &Path,
    evaluators: &[EvaluatorInput],
    expected_mc: Option<&str>,
) -> anyhow::Result<ReconciledTable> {
    let expected = match expected_mc {
        Some(mc) => mc.to_string(),
        None => file_stem(answer_path),
    };

    let answers = load_answers(answer_path, &expected)?;
    let mut keys: BTreeSet<RowKey> = answers.keys().cloned().collect();

    let mut columns = Vec::new();
    // (metrics, pivot) per evaluator, in column order
    let mut pivots = Vec::with_capacity(evaluators.len());
    for input in evaluators {
        let pivot = load_evaluator(input, &expected)?;
        let metrics: BTreeSet<String> = pivot.values().flat_map(|m| m.keys().cloned()).collect();
        for m in &metrics {
            columns.push(format!("{}_{}", input.name, m));
        }
        keys.extend(pivot.keys().cloned());
        pivots.push((metrics, pivot));
    }

    let duplicate = {
        let mut seen = HashSet::new();
        columns.iter().find(|c| !seen.insert(c.as_str())).cloned()
    };
    if let Some(col) = duplicate {
        anyhow::bail!("duplicate score column '{}'; evaluator names must be unique", col);
    }

    let vote_columns: Vec<usize> = columns
        .iter()
        .enumerate()
        .filter(|(_, c)| c.ends_with(&format!("_{}", CORRECTNESS_METRIC)))
        .map(|(i, _)| i)
        .collect();

    let mut rows = Vec::with_capacity(keys.len());
    let mut unanswered = 0usize;
    for key in keys {
        let response = match answers.get(&key) {
            Some(rec) if rec.is_success() => rec.content.clone().unwrap_or_default(),
            _ => {
                unanswered += 1;
                NOT_ANSWERED.to_string()
            }
        };
        let mut scores = Vec::with_capacity(columns.len());
        for (metrics, pivot) in &pivots {
            let row = pivot.get(&key);
            for m in metrics {
                scores.push(row.and_then(|r| r.get(m)).copied().unwrap_or(MISSING_SCORE));
            }
        }
        let votes: Vec<i32> = vote_columns.iter().map(|&i| scores[i]).collect();
        rows.push(ReconciledRow {
            key,
            response,
            final_correctness: majority_vote(&votes),
            scores,
        });
    }

    tracing::info!(
        model_config = %expected,
        rows = rows.len(),
        evaluators = evaluators.len(),
        unanswered,
        "reconciled"
    );
    Ok(ReconciledTable {
        model_config_id: expected,
        columns,
        rows,
    })
}

/// Writes `<out_dir>/<model_config_id>.csv`.
pub fn write_csv(table: &ReconciledTable, out_dir: &Path) -> anyhow::Result<PathBuf> {
    std::fs::create_dir_all(out_dir)
        .with_context(|| format!("failed to create {}", out_dir.display()))?;
    let path = out_dir.join(format!("{}.csv", table.model_config_id));
    std::fs::write(&path, table.to_csv())
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path)
}
