use super::{AdapterOptions, BatchAdapter};
use crate::config::ProviderSettings;
use crate::jsonl::{read_requests, write_jsonl};
use crate::model::{Provider, RequestRecord, ResponseRecord, STATUS_TRANSPORT_ERROR, STATUS_UNPARSEABLE};
use crate::normalize::normalize_chat_completion;
use crate::storage::cache::{cache_key, ResponseCache};
use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::task::JoinSet;

const PROCESSING: &[&str] = &["pending"];
const SUCCESS: &[&str] = &["completed"];
const FAILURE: &[&str] = &[];

/// Synchronous fallback: every request is sent straight to an
/// OpenAI-compatible chat endpoint by a fixed-size pool of tasks.
///
/// There is no vendor job. `send` does all the work and returns the output
/// path as the "batch id"; results are written once, after every request has
/// been answered, so an interrupted run leaves no partial output.
pub struct DirectAdapter {
    pub base_url: String,
    pub api_key: Option<String>,
    pub workers: usize,
    pub cache_path: Option<PathBuf>,
    pub output_path: PathBuf,
}

impl DirectAdapter {
    pub fn new(settings: &ProviderSettings, opts: &AdapterOptions) -> Self {
        Self {
            base_url: settings.openai_base_url(),
            api_key: settings.openai_api_key.clone(),
            workers: opts.workers.max(1),
            cache_path: opts.cache_path.clone(),
            output_path: opts.output_path.clone(),
        }
    }

    fn worker(&self) -> anyhow::Result<DirectWorker> {
        let cache = match &self.cache_path {
            Some(p) => Some(ResponseCache::open(p)?),
            None => None,
        };
        Ok(DirectWorker {
            base_url: self.base_url.clone(),
            api_key: self.api_key.clone(),
            client: reqwest::Client::new(),
            cache,
        })
    }

    /// Runs every request and returns the records in request order.
    ///
    /// Each pool task builds its own client and cache handle; the only thing
    /// shared is the read-only request list and a cursor into it.
    pub async fn run(&self, requests: Vec<RequestRecord>) -> anyhow::Result<Vec<ResponseRecord>> {
        let total = requests.len();
        let requests = Arc::new(requests);
        let cursor = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));

        let mut set = JoinSet::new();
        for _ in 0..self.workers.min(total.max(1)) {
            let worker = self.worker()?;
            let requests = requests.clone();
            let cursor = cursor.clone();
            let done = done.clone();
            set.spawn(async move {
                let mut out = Vec::new();
                loop {
                    let idx = cursor.fetch_add(1, Ordering::SeqCst);
                    let Some(req) = requests.get(idx) else { break };
                    out.push((idx, worker.call(req.clone()).await));
                    let n = done.fetch_add(1, Ordering::SeqCst) + 1;
                    if n % 50 == 0 || n == total {
                        tracing::info!(done = n, total, "direct requests answered");
                    }
                }
                out
            });
        }

        let mut slots: Vec<Option<ResponseRecord>> = vec![None; total];
        loop {
            tokio::select! {
                joined = set.join_next() => {
                    let Some(joined) = joined else { break };
                    match joined {
                        Ok(batch) => {
                            for (idx, rec) in batch {
                                slots[idx] = Some(rec);
                            }
                        }
                        Err(e) => tracing::error!(error = %e, "direct worker task failed"),
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    set.abort_all();
                    let answered = done.load(Ordering::SeqCst);
                    tracing::warn!(done = answered, total, "interrupted; no results written");
                    anyhow::bail!("interrupted after {} of {} requests", answered, total);
                }
            }
        }

        Ok(slots
            .into_iter()
            .zip(requests.iter())
            .map(|(slot, req)| {
                slot.unwrap_or_else(|| {
                    ResponseRecord::failed(
                        req.custom_id.clone(),
                        STATUS_TRANSPORT_ERROR,
                        "worker did not return a result",
                    )
                })
            })
            .collect())
    }
}

/// One pool task's client and cache handle.
pub struct DirectWorker {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
    cache: Option<ResponseCache>,
}

impl DirectWorker {
    pub async fn call(&self, req: RequestRecord) -> ResponseRecord {
        let model = req
            .body
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let key = cache_key(&req.custom_id, &model, &req.body);

        if let Some(cache) = &self.cache {
            match cache.get(&key) {
                Ok(Some(content)) => {
                    tracing::debug!(custom_id = %req.custom_id, "cache hit");
                    return ResponseRecord::ok(req.custom_id, content);
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, "cache lookup failed"),
            }
        }

        let mut http = self
            .client
            .post(format!("{}{}", self.base_url, req.url))
            .json(&req.body);
        if let Some(key) = &self.api_key {
            http = http.bearer_auth(key);
        }

        let resp = match http.send().await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(custom_id = %req.custom_id, error = %e, "transport error");
                return ResponseRecord::failed(req.custom_id, STATUS_TRANSPORT_ERROR, e.to_string());
            }
        };
        let status = resp.status().as_u16();
        let text = match resp.text().await {
            Ok(t) => t,
            Err(e) => {
                return ResponseRecord::failed(req.custom_id, STATUS_TRANSPORT_ERROR, e.to_string());
            }
        };
        let body: Value = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(_) if status != 200 => Value::String(text),
            Err(e) => {
                return ResponseRecord::failed(
                    req.custom_id,
                    STATUS_UNPARSEABLE,
                    format!("response is not JSON: {}", e),
                );
            }
        };

        let rec = normalize_chat_completion(&req.custom_id, status, &body);
        if let (true, Some(cache), Some(content)) = (rec.is_success(), &self.cache, &rec.content) {
            if let Err(e) = cache.put(&key, &model, content) {
                tracing::warn!(error = %e, "cache write failed");
            }
        }
        rec
    }
}

#[async_trait]
impl BatchAdapter for DirectAdapter {
    fn provider(&self) -> Provider {
        Provider::Direct
    }

    fn is_synchronous(&self) -> bool {
        true
    }

    async fn send(&self, jsonl_path: &Path) -> anyhow::Result<String> {
        let requests = read_requests(jsonl_path)?;
        tracing::info!(
            requests = requests.len(),
            workers = self.workers,
            base_url = %self.base_url,
            "running requests directly"
        );
        let records = self.run(requests).await?;
        let failed = records.iter().filter(|r| !r.is_success()).count();
        write_jsonl(&self.output_path, &records)?;
        if failed > 0 {
            tracing::warn!(failed, total = records.len(), "some direct requests failed");
        }
        Ok(self.output_path.display().to_string())
    }

    async fn check_status(&self, batch_id: &str) -> anyhow::Result<String> {
        let status = if Path::new(batch_id).exists() {
            SUCCESS[0]
        } else {
            PROCESSING[0]
        };
        Ok(status.to_string())
    }

    async fn download(
        &self,
        batch_id: &str,
        output_path: &Path,
    ) -> anyhow::Result<Option<PathBuf>> {
        let written = Path::new(batch_id);
        if !written.exists() {
            return Ok(None);
        }
        if written != output_path {
            tokio::fs::copy(written, output_path).await?;
        }
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
    use serde_json::json;

    fn req(id: &str, content: &str) -> RequestRecord {
        RequestRecord {
            custom_id: id.into(),
            method: "POST".into(),
            url: "/v1/chat/completions".into(),
            body: json!({ "model": "gpt-4o-mini", "messages": [{ "role": "user", "content": content }] }),
        }
    }

    fn adapter(base_url: String, cache_path: Option<PathBuf>, out: PathBuf) -> DirectAdapter {
        let settings = ProviderSettings {
            openai_base_url: Some(base_url),
            ..Default::default()
        };
        DirectAdapter::new(
            &settings,
            &AdapterOptions { workers: 2, cache_path, output_path: out },
        )
    }

    #[tokio::test]
    async fn results_keep_request_order_and_errors_become_records() {
        let mut server = mockito::Server::new_async().await;
        let _ok = server
            .mock("POST", "/v1/chat/completions")
            .match_body(mockito::Matcher::Regex("first".into()))
            .with_status(200)
            .with_body(r#"{"choices":[{"message":{"role":"assistant","content":"A"}}]}"#)
            .create_async()
            .await;
        let _err = server
            .mock("POST", "/v1/chat/completions")
            .match_body(mockito::Matcher::Regex("second".into()))
            .with_status(429)
            .with_body(r#"{"error":{"message":"slow down"}}"#)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("mc01.jsonl");
        let a = adapter(server.url(), None, out.clone());
        let records = a
            .run(vec![req("mc01-q1-p1", "first"), req("mc01-q2-p1", "second")])
            .await
            .unwrap();

        assert_eq!(records[0].custom_id, "mc01-q1-p1");
        assert_eq!(records[0].content.as_deref(), Some("A"));
        assert_eq!(records[1].status_code, 429);
        assert_eq!(records[1].error.as_deref(), Some("slow down"));
    }

    #[tokio::test]
    async fn cached_responses_skip_the_network() {
        let mut server = mockito::Server::new_async().await;
        let call = server
            .mock("POST", "/v1/chat/completions")
            .with_status(200)
            .with_body(r#"{"choices":[{"message":{"content":"C"}}]}"#)
            .expect(1)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("cache.db");
        let out = dir.path().join("mc01.jsonl");
        let a = adapter(server.url(), Some(cache), out);

        let first = a.run(vec![req("mc01-q1-p1", "same")]).await.unwrap();
        let second = a.run(vec![req("mc01-q1-p1", "same")]).await.unwrap();
        assert_eq!(first[0].content, second[0].content);
        call.assert_async().await;
    }

    #[tokio::test]
    async fn repeat_rounds_are_cached_separately() {
        let mut server = mockito::Server::new_async().await;
        let call = server
            .mock("POST", "/v1/chat/completions")
            .with_status(200)
            .with_body(r#"{"choices":[{"message":{"content":"D"}}]}"#)
            .expect(3)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("mc01.jsonl");
        let a = adapter(server.url(), Some(dir.path().join("cache.db")), out);
        let rounds = vec![
            req("mc01-q1-p1_r1", "same"),
            req("mc01-q1-p1_r2", "same"),
            req("mc01-q1-p1_r3", "same"),
        ];

        a.run(rounds.clone()).await.unwrap();
        // the second pass is served from the cache round by round
        let again = a.run(rounds).await.unwrap();
        assert_eq!(again.len(), 3);
        call.assert_async().await;
    }

    #[tokio::test]
    async fn send_writes_output_and_returns_its_path() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", "/v1/chat/completions")
            .with_status(200)
            .with_body(r#"{"choices":[{"message":{"content":"B"}}]}"#)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in").join("mc01.jsonl");
        let out = dir.path().join("out").join("mc01.jsonl");
        write_jsonl(&input, &[req("mc01-q1-p1", "x")]).unwrap();

        let a = adapter(server.url(), None, out.clone());
        let id = a.send(&input).await.unwrap();
        assert_eq!(id, out.display().to_string());
        assert_eq!(a.check_status(&id).await.unwrap(), "completed");
        assert_eq!(read_requests(&input).unwrap().len(), 1);
        assert_eq!(crate::jsonl::read_responses(&out).unwrap()[0].content.as_deref(), Some("B"));
    }
}
