use super::http::{json_step, require_str, send_step, str_at, text_step, to_jsonl_bytes};
use super::{lift_model, BatchAdapter};
use crate::config::env::require;
use crate::config::ProviderSettings;
use crate::jsonl::{file_stem, write_jsonl};
use crate::model::{Provider, RequestRecord};
use crate::normalize::{normalize_lines, normalize_vertex_line, vertex_request_text, RequestTextMap};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

const PROCESSING: &[&str] = &[
    "JOB_STATE_QUEUED",
    "JOB_STATE_PENDING",
    "JOB_STATE_RUNNING",
    "JOB_STATE_UPDATING",
];
const SUCCESS: &[&str] = &["JOB_STATE_SUCCEEDED"];
const FAILURE: &[&str] = &[
    "JOB_STATE_FAILED",
    "JOB_STATE_CANCELLED",
    "JOB_STATE_CANCELLING",
    "JOB_STATE_EXPIRED",
    "JOB_STATE_PAUSED",
];

const STAGING_PREFIX: &str = "gradebatch";

/// Vertex AI batch prediction over Cloud Storage.
///
/// Submission is two vendor calls (stage the input object, create the job).
/// The output does not echo custom ids, so they are recovered from the request
/// text via a map built from the request file.
pub struct VertexBatchAdapter {
    pub access_token: String,
    pub project_id: String,
    pub location: String,
    pub bucket: String,
    pub api_base_url: String,
    pub gcs_base_url: String,
    pub client: reqwest::Client,
    requests: RequestTextMap,
}

impl VertexBatchAdapter {
    pub fn new(settings: &ProviderSettings) -> anyhow::Result<Self> {
        let access_token = require(&settings.vertex_access_token, "VERTEX_ACCESS_TOKEN")?;
        let project_id = require(&settings.vertex_project_id, "VERTEX_PROJECT_ID")?;
        let bucket = require(&settings.vertex_bucket, "VERTEX_BUCKET")?;
        Ok(Self {
            access_token: access_token.to_string(),
            project_id: project_id.to_string(),
            location: settings.vertex_location(),
            bucket: bucket.to_string(),
            api_base_url: settings.vertex_base_url(),
            gcs_base_url: settings.gcs_base_url(),
            client: reqwest::Client::new(),
            requests: RequestTextMap::default(),
        })
    }

    async fn stage_input(&self, object: &str, bytes: Vec<u8>) -> anyhow::Result<()> {
        send_step(
            self.client
                .post(format!(
                    "{}/upload/storage/v1/b/{}/o",
                    self.gcs_base_url, self.bucket
                ))
                .query(&[("uploadType", "media"), ("name", object)])
                .bearer_auth(&self.access_token)
                .header("content-type", "application/jsonl")
                .body(bytes),
            "vertex",
            "stage_upload",
        )
        .await?;
        Ok(())
    }

    async fn fetch_job(&self, job_name: &str) -> anyhow::Result<Value> {
        json_step(
            self.client
                .get(format!("{}/v1/{}", self.api_base_url, job_name))
                .bearer_auth(&self.access_token),
            "vertex",
            "status",
        )
        .await
    }

    async fn list_objects(&self, bucket: &str, prefix: &str) -> anyhow::Result<Vec<String>> {
        let listing = json_step(
            self.client
                .get(format!("{}/storage/v1/b/{}/o", self.gcs_base_url, bucket))
                .query(&[("prefix", prefix)])
                .bearer_auth(&self.access_token),
            "vertex",
            "list_outputs",
        )
        .await?;
        Ok(listing
            .get("items")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|i| i.get("name").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn fetch_object(&self, bucket: &str, name: &str) -> anyhow::Result<String> {
        let mut url = reqwest::Url::parse(&format!(
            "{}/storage/v1/b/{}/o",
            self.gcs_base_url, bucket
        ))?;
        url.path_segments_mut()
            .map_err(|_| anyhow::anyhow!("invalid storage base url: {}", self.gcs_base_url))?
            .push(name);
        text_step(
            self.client
                .get(url)
                .query(&[("alt", "media")])
                .bearer_auth(&self.access_token),
            "vertex",
            "download",
        )
        .await
    }
}

/// `gs://bucket/some/prefix` → (`bucket`, `some/prefix`).
fn split_gcs_uri(uri: &str) -> Option<(String, String)> {
    let rest = uri.strip_prefix("gs://")?;
    let (bucket, prefix) = rest.split_once('/').unwrap_or((rest, ""));
    if bucket.is_empty() {
        return None;
    }
    Some((bucket.to_string(), prefix.trim_end_matches('/').to_string()))
}

#[async_trait]
impl BatchAdapter for VertexBatchAdapter {
    fn provider(&self) -> Provider {
        Provider::Vertex
    }

    fn attach_requests(&mut self, requests: &[RequestRecord]) {
        let mut map = RequestTextMap::default();
        for r in requests {
            match vertex_request_text(&r.body) {
                Some(text) => map.insert(text, r.custom_id.clone()),
                None => tracing::warn!(custom_id = %r.custom_id, "request has no user text; it cannot be matched in vertex output"),
            }
        }
        self.requests = map;
    }

    async fn send(&self, jsonl_path: &Path) -> anyhow::Result<String> {
        let (requests, model) = lift_model(jsonl_path)?;
        let lines: Vec<Value> = requests
            .into_iter()
            .map(|r| json!({ "request": r.body }))
            .collect();

        let stem = file_stem(jsonl_path);
        let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%SZ");
        let run_prefix = format!("{}/{}/{}", STAGING_PREFIX, stem, stamp);
        let object = format!("{}/input.jsonl", run_prefix);

        self.stage_input(&object, to_jsonl_bytes(&lines)?).await?;
        tracing::info!(provider = "vertex", object = %object, requests = lines.len(), "staged input");

        let job = json_step(
            self.client
                .post(format!(
                    "{}/v1/projects/{}/locations/{}/batchPredictionJobs",
                    self.api_base_url, self.project_id, self.location
                ))
                .bearer_auth(&self.access_token)
                .json(&json!({
                    "displayName": format!("{}-{}", stem, stamp),
                    "model": format!("publishers/google/models/{}", model),
                    "inputConfig": {
                        "instancesFormat": "jsonl",
                        "gcsSource": { "uris": [format!("gs://{}/{}", self.bucket, object)] },
                    },
                    "outputConfig": {
                        "predictionsFormat": "jsonl",
                        "gcsDestination": {
                            "outputUriPrefix": format!("gs://{}/{}/output", self.bucket, run_prefix),
                        },
                    },
                })),
            "vertex",
            "create_job",
        )
        .await?;
        require_str(&job, "/name", "vertex", "create_job")
    }

    async fn check_status(&self, batch_id: &str) -> anyhow::Result<String> {
        let job = self.fetch_job(batch_id).await?;
        require_str(&job, "/state", "vertex", "status")
    }

    async fn download(
        &self,
        batch_id: &str,
        output_path: &Path,
    ) -> anyhow::Result<Option<PathBuf>> {
        let job = self.fetch_job(batch_id).await?;
        let state = str_at(&job, "/state").unwrap_or_default();
        if !SUCCESS.contains(&state.as_str()) {
            tracing::warn!(provider = "vertex", batch_id, state = %state, "job did not succeed; nothing to download");
            return Ok(None);
        }
        let Some(output_dir) = str_at(&job, "/outputInfo/gcsOutputDirectory") else {
            tracing::warn!(provider = "vertex", batch_id, "job succeeded without an output directory");
            return Ok(None);
        };
        let (bucket, prefix) = split_gcs_uri(&output_dir)
            .ok_or_else(|| anyhow::anyhow!("unexpected output directory '{}'", output_dir))?;

        let mut files: Vec<String> = self
            .list_objects(&bucket, &prefix)
            .await?
            .into_iter()
            .filter(|n| n.contains("prediction") && n.ends_with(".jsonl"))
            .collect();
        files.sort();
        if files.is_empty() {
            tracing::warn!(provider = "vertex", batch_id, output_dir = %output_dir, "no prediction files found");
            return Ok(None);
        }
        if self.requests.is_empty() {
            tracing::warn!(provider = "vertex", batch_id, "no request file attached; custom ids cannot be recovered");
        }

        let mut map = self.requests.clone();
        let mut records = Vec::new();
        for name in &files {
            let text = self.fetch_object(&bucket, name).await?;
            records.extend(normalize_lines(&text, |n, l| normalize_vertex_line(n, l, &mut map)));
        }
        if !map.is_empty() {
            tracing::warn!(provider = "vertex", batch_id, unmatched = map.len(), "requests without a prediction line");
        }

        write_jsonl(output_path, &records)?;
        tracing::info!(provider = "vertex", batch_id, files = files.len(), records = records.len(), "wrote normalized results");
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gcs_uri_splits_into_bucket_and_prefix() {
        assert_eq!(
            split_gcs_uri("gs://b/gradebatch/mc01/output/prediction-x/"),
            Some(("b".to_string(), "gradebatch/mc01/output/prediction-x".to_string()))
        );
        assert_eq!(split_gcs_uri("gs://b"), Some(("b".to_string(), String::new())));
        assert_eq!(split_gcs_uri("s3://b/x"), None);
    }
}
