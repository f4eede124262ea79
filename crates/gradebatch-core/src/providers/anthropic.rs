use super::http::{json_step, require_str, str_at, text_step};
use super::BatchAdapter;
use crate::config::env::require;
use crate::config::ProviderSettings;
use crate::jsonl::{read_requests, write_jsonl};
use crate::model::{strip_provider_prefix, Provider};
use crate::normalize::{normalize_anthropic_line, normalize_lines};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

const PROCESSING: &[&str] = &["in_progress", "canceling"];
const SUCCESS: &[&str] = &["ended"];
const FAILURE: &[&str] = &[];

pub const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Anthropic Message Batches. Requests are submitted inline, no upload step.
pub struct AnthropicBatchAdapter {
    pub api_key: String,
    pub base_url: String,
    pub client: reqwest::Client,
}

impl AnthropicBatchAdapter {
    pub fn new(settings: &ProviderSettings) -> anyhow::Result<Self> {
        let api_key = require(&settings.anthropic_api_key, "ANTHROPIC_API_KEY")?.to_string();
        Ok(Self {
            api_key,
            base_url: settings.anthropic_base_url(),
            client: reqwest::Client::new(),
        })
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
    }

    async fn fetch_batch(&self, batch_id: &str) -> anyhow::Result<Value> {
        json_step(
            self.authed(
                self.client
                    .get(format!("{}/v1/messages/batches/{}", self.base_url, batch_id)),
            ),
            "anthropic",
            "status",
        )
        .await
    }
}

#[async_trait]
impl BatchAdapter for AnthropicBatchAdapter {
    fn provider(&self) -> Provider {
        Provider::Anthropic
    }

    async fn send(&self, jsonl_path: &Path) -> anyhow::Result<String> {
        let requests: Vec<Value> = read_requests(jsonl_path)?
            .into_iter()
            .map(|r| {
                let mut params = r.body;
                if let Some(model) = params.get("model").and_then(Value::as_str) {
                    let stripped = strip_provider_prefix(model).to_string();
                    params["model"] = json!(stripped);
                }
                json!({ "custom_id": r.custom_id, "params": params })
            })
            .collect();
        tracing::info!(provider = "anthropic", requests = requests.len(), "submitting message batch");

        let batch = json_step(
            self.authed(
                self.client
                    .post(format!("{}/v1/messages/batches", self.base_url)),
            )
            .json(&json!({ "requests": requests })),
            "anthropic",
            "create_batch",
        )
        .await?;
        require_str(&batch, "/id", "anthropic", "create_batch")
    }

    async fn check_status(&self, batch_id: &str) -> anyhow::Result<String> {
        let batch = self.fetch_batch(batch_id).await?;
        require_str(&batch, "/processing_status", "anthropic", "status")
    }

    async fn download(
        &self,
        batch_id: &str,
        output_path: &Path,
    ) -> anyhow::Result<Option<PathBuf>> {
        let batch = self.fetch_batch(batch_id).await?;
        let status = str_at(&batch, "/processing_status").unwrap_or_default();
        if !SUCCESS.contains(&status.as_str()) {
            tracing::warn!(provider = "anthropic", batch_id, status = %status, "batch has not ended; nothing to download");
            return Ok(None);
        }
        let Some(results_url) = str_at(&batch, "/results_url") else {
            tracing::warn!(provider = "anthropic", batch_id, "batch ended without results_url");
            return Ok(None);
        };

        let text = text_step(self.authed(self.client.get(results_url)), "anthropic", "download").await?;
        let records = normalize_lines(&text, normalize_anthropic_line);
        write_jsonl(output_path, &records)?;
        tracing::info!(provider = "anthropic", batch_id, records = records.len(), "wrote normalized results");
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
