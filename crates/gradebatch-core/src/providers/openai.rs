use super::http::{json_step, require_str, str_at, text_step, upload_batch_file};
use super::BatchAdapter;
use crate::config::env::require;
use crate::config::ProviderSettings;
use crate::jsonl::{file_stem, write_jsonl};
use crate::model::Provider;
use crate::normalize::{normalize_lines, normalize_openai_line};
use anyhow::Context;
use async_trait::async_trait;
use serde_json::json;
use std::path::{Path, PathBuf};

const PROCESSING: &[&str] = &["validating", "in_progress", "finalizing", "cancelling"];
const SUCCESS: &[&str] = &["completed"];
const FAILURE: &[&str] = &["failed", "expired", "cancelled"];

/// OpenAI-compatible `/v1/batches`. Successful and failed requests come back
/// as two separate files; both are merged into the normalized output.
pub struct OpenAiBatchAdapter {
    pub api_key: String,
    pub base_url: String,
    pub completion_window: String,
    pub client: reqwest::Client,
}

impl OpenAiBatchAdapter {
    pub fn new(settings: &ProviderSettings) -> anyhow::Result<Self> {
        let api_key = require(&settings.openai_api_key, "OPENAI_API_KEY")?.to_string();
        Ok(Self {
            api_key,
            base_url: settings.openai_base_url(),
            completion_window: "24h".to_string(),
            client: reqwest::Client::new(),
        })
    }
}

#[async_trait]
impl BatchAdapter for OpenAiBatchAdapter {
    fn provider(&self) -> Provider {
        Provider::Openai
    }

    async fn send(&self, jsonl_path: &Path) -> anyhow::Result<String> {
        let bytes = tokio::fs::read(jsonl_path)
            .await
            .with_context(|| format!("failed to read {}", jsonl_path.display()))?;
        let file_name = format!("{}.jsonl", file_stem(jsonl_path));

        let file_id = upload_batch_file(
            &self.client,
            &self.base_url,
            &self.api_key,
            file_name,
            bytes,
            "openai",
        )
        .await?;
        tracing::info!(provider = "openai", file_id = %file_id, "uploaded request file");

        let batch = json_step(
            self.client
                .post(format!("{}/v1/batches", self.base_url))
                .bearer_auth(&self.api_key)
                .json(&json!({
                    "input_file_id": file_id,
                    "endpoint": "/v1/chat/completions",
                    "completion_window": self.completion_window,
                })),
            "openai",
            "create_batch",
        )
        .await?;
        require_str(&batch, "/id", "openai", "create_batch")
    }

    async fn check_status(&self, batch_id: &str) -> anyhow::Result<String> {
        let batch = json_step(
            self.client
                .get(format!("{}/v1/batches/{}", self.base_url, batch_id))
                .bearer_auth(&self.api_key),
            "openai",
            "status",
        )
        .await?;
        require_str(&batch, "/status", "openai", "status")
    }

    async fn download(
        &self,
        batch_id: &str,
        output_path: &Path,
    ) -> anyhow::Result<Option<PathBuf>> {
        let batch = json_step(
            self.client
                .get(format!("{}/v1/batches/{}", self.base_url, batch_id))
                .bearer_auth(&self.api_key),
            "openai",
            "status",
        )
        .await?;
        let status = str_at(&batch, "/status").unwrap_or_default();
        if !SUCCESS.contains(&status.as_str()) {
            tracing::warn!(provider = "openai", batch_id, status = %status, "batch did not succeed; nothing to download");
            return Ok(None);
        }

        let mut records = Vec::new();
        let mut artifacts = 0;
        for field in ["/output_file_id", "/error_file_id"] {
            let Some(file_id) = str_at(&batch, field) else {
                continue;
            };
            let text = text_step(
                self.client
                    .get(format!("{}/v1/files/{}/content", self.base_url, file_id))
                    .bearer_auth(&self.api_key),
                "openai",
                "download",
            )
            .await?;
            records.extend(normalize_lines(&text, normalize_openai_line));
            artifacts += 1;
        }

        if artifacts == 0 {
            tracing::warn!(provider = "openai", batch_id, "batch completed without an output artifact");
            return Ok(None);
        }

        write_jsonl(output_path, &records)?;
        tracing::info!(
            provider = "openai",
            batch_id,
            records = records.len(),
            output = %output_path.display(),
            "wrote normalized results"
        );
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
