use super::http::{json_step, require_str, str_at, text_step, to_jsonl_bytes, upload_batch_file};
use super::{lift_model, BatchAdapter};
use crate::config::env::require;
use crate::config::ProviderSettings;
use crate::jsonl::{file_stem, write_jsonl};
use crate::model::Provider;
use crate::normalize::{normalize_lines, normalize_mistral_line};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

const PROCESSING: &[&str] = &["QUEUED", "RUNNING"];
const SUCCESS: &[&str] = &["SUCCESS"];
const FAILURE: &[&str] = &[
    "FAILED",
    "TIMEOUT_EXCEEDED",
    "CANCELLATION_REQUESTED",
    "CANCELLED",
];

/// Mistral `/v1/batch/jobs`. The model is a job-level field; request bodies
/// carry it with a `mistral/` routing prefix that is stripped on submission.
pub struct MistralBatchAdapter {
    pub api_key: String,
    pub base_url: String,
    pub client: reqwest::Client,
}

impl MistralBatchAdapter {
    pub fn new(settings: &ProviderSettings) -> anyhow::Result<Self> {
        let api_key = require(&settings.mistral_api_key, "MISTRAL_API_KEY")?.to_string();
        Ok(Self {
            api_key,
            base_url: settings.mistral_base_url(),
            client: reqwest::Client::new(),
        })
    }
}

#[async_trait]
impl BatchAdapter for MistralBatchAdapter {
    fn provider(&self) -> Provider {
        Provider::Mistral
    }

    async fn send(&self, jsonl_path: &Path) -> anyhow::Result<String> {
        let (requests, model) = lift_model(jsonl_path)?;
        let lines: Vec<Value> = requests
            .into_iter()
            .map(|r| json!({ "custom_id": r.custom_id, "body": r.body }))
            .collect();
        let file_id = upload_batch_file(
            &self.client,
            &self.base_url,
            &self.api_key,
            format!("{}.jsonl", file_stem(jsonl_path)),
            to_jsonl_bytes(&lines)?,
            "mistral",
        )
        .await?;
        tracing::info!(provider = "mistral", file_id = %file_id, model = %model, "uploaded request file");

        let job = json_step(
            self.client
                .post(format!("{}/v1/batch/jobs", self.base_url))
                .bearer_auth(&self.api_key)
                .json(&json!({
                    "input_files": [file_id],
                    "model": model,
                    "endpoint": "/v1/chat/completions",
                })),
            "mistral",
            "create_job",
        )
        .await?;
        require_str(&job, "/id", "mistral", "create_job")
    }

    async fn check_status(&self, batch_id: &str) -> anyhow::Result<String> {
        let job = json_step(
            self.client
                .get(format!("{}/v1/batch/jobs/{}", self.base_url, batch_id))
                .bearer_auth(&self.api_key),
            "mistral",
            "status",
        )
        .await?;
        require_str(&job, "/status", "mistral", "status")
    }

    async fn download(
        &self,
        batch_id: &str,
        output_path: &Path,
    ) -> anyhow::Result<Option<PathBuf>> {
        let job = json_step(
            self.client
                .get(format!("{}/v1/batch/jobs/{}", self.base_url, batch_id))
                .bearer_auth(&self.api_key),
            "mistral",
            "status",
        )
        .await?;
        let status = str_at(&job, "/status").unwrap_or_default();
        if !SUCCESS.contains(&status.as_str()) {
            tracing::warn!(provider = "mistral", batch_id, status = %status, "job did not succeed; nothing to download");
            return Ok(None);
        }

        let mut records = Vec::new();
        let mut artifacts = 0;
        for field in ["/output_file", "/error_file"] {
            let Some(file_id) = str_at(&job, field) else {
                continue;
            };
            let text = text_step(
                self.client
                    .get(format!("{}/v1/files/{}/content", self.base_url, file_id))
                    .bearer_auth(&self.api_key),
                "mistral",
                "download",
            )
            .await?;
            records.extend(normalize_lines(&text, normalize_mistral_line));
            artifacts += 1;
        }
        if artifacts == 0 {
            tracing::warn!(provider = "mistral", batch_id, "job succeeded without an output file");
            return Ok(None);
        }

        write_jsonl(output_path, &records)?;
        tracing::info!(provider = "mistral", batch_id, records = records.len(), "wrote normalized results");
        Ok(Some(output_path.to_path_buf()))
    }

    fn processing_statuses(&self) -> &'static [&'static str] {
        PROCESSING
    }

    fn success_statuses(&self) -> &'static [&'static str] {
        SUCCESS
    }

    fn failure_statuses(&self) -> &'static [&'static str] {
        FAILURE
    }
}
