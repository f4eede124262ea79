use crate::errors::{ConfigError, StructuralError};
use crate::model::{EvaluatorConfig, ModelConfig, PromptTemplate, Question};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub mod env;
pub mod path_resolver;

pub use env::ProviderSettings;

pub const SUPPORTED_CONFIG_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfig {
    #[serde(default, rename = "configVersion", alias = "version")]
    pub version: u32,
    pub models: Vec<ModelConfig>,
    #[serde(default)]
    pub prompts: Vec<PromptTemplate>,
    #[serde(default)]
    pub evaluators: Vec<EvaluatorConfig>,
    #[serde(default)]
    pub settings: Settings,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub questions: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_interval_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiry_hours: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<String>,
}

impl Settings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds.unwrap_or(60).max(1))
    }

    pub fn expiry(&self) -> Option<Duration> {
        self.expiry_hours
            .filter(|h| *h > 0.0)
            .map(|h| Duration::from_secs_f64(h * 3600.0))
    }

    pub fn workers(&self) -> usize {
        self.workers.unwrap_or(8).max(1)
    }
}

impl ExperimentConfig {
    /// Exact-match lookup; an unknown id is fatal and the error names the
    /// closest known id when there is a plausible one.
    pub fn model(&self, id: &str) -> Result<&ModelConfig, StructuralError> {
        if let Some(m) = self.models.iter().find(|m| m.id == id) {
            return Ok(m);
        }
        let best = self
            .models
            .iter()
            .map(|m| (strsim::jaro_winkler(id, &m.id), m.id.as_str()))
            .filter(|(score, _)| *score >= 0.8)
            .max_by(|a, b| a.0.total_cmp(&b.0));
        let hint = best
            .map(|(_, name)| format!(" (did you mean '{}'?)", name))
            .unwrap_or_default();
        Err(StructuralError::UnknownModelConfig {
            id: id.to_string(),
            hint,
        })
    }

    pub fn prompts_by_id(&self, ids: &[String]) -> Result<Vec<PromptTemplate>, ConfigError> {
        if ids.is_empty() {
            return Ok(self.prompts.clone());
        }
        ids.iter()
            .map(|id| {
                self.prompts
                    .iter()
                    .find(|p| &p.id == id)
                    .cloned()
                    .ok_or_else(|| ConfigError(format!("unknown prompt variation '{}'", id)))
            })
            .collect()
    }

    pub fn evaluator(&self, id: &str) -> Result<&EvaluatorConfig, ConfigError> {
        self.evaluators
            .iter()
            .find(|e| e.id == id)
            .ok_or_else(|| ConfigError(format!("unknown evaluator '{}'", id)))
    }
}

pub fn load_config(path: &Path, strict: bool) -> Result<ExperimentConfig, ConfigError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| ConfigError(format!("failed to read config {}: {}", path.display(), e)))?;

    let mut ignored_keys = std::collections::BTreeSet::new();
    let deserializer = serde_yaml::Deserializer::from_str(&raw);
    let mut cfg: ExperimentConfig = serde_ignored::deserialize(deserializer, |path| {
        ignored_keys.insert(path.to_string());
    })
    .map_err(|e| ConfigError(format!("failed to parse YAML: {}", e)))?;

    let meaningful_unknowns: Vec<_> = ignored_keys
        .iter()
        .filter(|k| !k.starts_with('_') && !k.starts_with("x-"))
        .collect();
    if !meaningful_unknowns.is_empty() {
        if strict {
            return Err(ConfigError(format!(
                "Unknown fields detected in strict mode: {:?} (file: {})",
                meaningful_unknowns,
                path.display()
            )));
        }
        tracing::warn!(keys = ?meaningful_unknowns, "ignored unknown config fields");
    }

    if cfg.version != SUPPORTED_CONFIG_VERSION {
        return Err(ConfigError(format!(
            "unsupported config version {} (supported: {})",
            cfg.version, SUPPORTED_CONFIG_VERSION
        )));
    }

    if cfg.models.is_empty() {
        return Err(ConfigError("config has no models".into()));
    }

    let mut seen = std::collections::HashSet::new();
    for m in &cfg.models {
        if !seen.insert(m.id.as_str()) {
            return Err(ConfigError(format!("duplicate model config id '{}'", m.id)));
        }
        if m.repeats == 0 {
            return Err(ConfigError(format!(
                "model config '{}' has repeats: 0",
                m.id
            )));
        }
    }

    path_resolver::PathResolver::new(path).resolve_settings(&mut cfg.settings);

    Ok(cfg)
}

pub fn load_questions(path: &Path) -> anyhow::Result<Vec<Question>> {
    crate::jsonl::read_jsonl(path)
}

pub fn questions_path(cfg: &ExperimentConfig, override_path: Option<&Path>) -> Option<PathBuf> {
    override_path
        .map(Path::to_path_buf)
        .or_else(|| cfg.settings.questions.as_ref().map(PathBuf::from))
}

pub fn write_sample_config(path: &Path) -> Result<(), ConfigError> {
    std::fs::write(
        path,
        r#"configVersion: 1
settings:
  questions: questions.jsonl
  poll_interval_seconds: 60
  expiry_hours: 24
  workers: 8
models:
  - id: mc01
    model: gpt-4o-mini
    temperature: 0.0
    max_tokens: 512
  - id: mc02
    model: claude-3-5-haiku-20241022
    max_tokens: 512
prompts:
  - id: p1
    template: |
      Answer the following question with the letter of the best option.
      {question}
      {options}
evaluators:
  - id: judge1
    model_config: mc01
    metric: correctness
    template: |
      Question: {question}
      Options:
      {options}
      Correct answer: {correct}
      Model response: {response}
      Grade the response A (correct), B (partially correct), C (mostly wrong) or D (wrong).
      Finish with the grade letter only.
"#,
    )
    .map_err(|e| ConfigError(format!("failed to write sample config: {}", e)))?;
    Ok(())
}
