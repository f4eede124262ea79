use crate::config::ProviderSettings;
use crate::jsonl::read_requests;
use crate::model::{strip_provider_prefix, Provider, RequestRecord};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

pub mod anthropic;
pub mod direct;
mod http;
pub mod mistral;
pub mod openai;
pub mod vertex;

/// One vendor's asynchronous batch API.
///
/// Status strings are returned verbatim in the vendor's vocabulary; the
/// controller classifies them against the three status sets below.
#[async_trait]
pub trait BatchAdapter: Send + Sync {
    fn provider(&self) -> Provider;

    /// Gives the adapter a look at the request file before download. Only
    /// adapters whose output loses the custom id need this.
    fn attach_requests(&mut self, _requests: &[RequestRecord]) {}

    /// Submission performs the work itself; there is nothing to poll.
    fn is_synchronous(&self) -> bool {
        false
    }

    async fn send(&self, jsonl_path: &Path) -> anyhow::Result<String>;

    async fn check_status(&self, batch_id: &str) -> anyhow::Result<String>;

    /// Writes normalized records to `output_path`. `None` when the batch did
    /// not succeed or produced no output artifact.
    async fn download(&self, batch_id: &str, output_path: &Path)
        -> anyhow::Result<Option<PathBuf>>;

    fn processing_statuses(&self) -> &'static [&'static str];
    fn success_statuses(&self) -> &'static [&'static str];
    fn failure_statuses(&self) -> &'static [&'static str];
}

#[derive(Debug, Clone)]
pub struct AdapterOptions {
    /// Concurrency of the direct path.
    pub workers: usize,
    pub cache_path: Option<PathBuf>,
    /// Where the direct path writes its results.
    pub output_path: PathBuf,
}

/// Resolves the adapter once, up front; credentials are checked here so a
/// missing key fails before any upload.
pub fn build_adapter(
    provider: Provider,
    settings: &ProviderSettings,
    opts: &AdapterOptions,
) -> anyhow::Result<Box<dyn BatchAdapter>> {
    let adapter: Box<dyn BatchAdapter> = match provider {
        Provider::Openai => Box::new(openai::OpenAiBatchAdapter::new(settings)?),
        Provider::Anthropic => Box::new(anthropic::AnthropicBatchAdapter::new(settings)?),
        Provider::Vertex => Box::new(vertex::VertexBatchAdapter::new(settings)?),
        Provider::Mistral => Box::new(mistral::MistralBatchAdapter::new(settings)?),
        Provider::Direct => Box::new(direct::DirectAdapter::new(settings, opts)),
    };
    Ok(adapter)
}

/// Reads a request file whose vendor takes the model at job level: the
/// `model` field is removed from every body and returned once, without its
/// routing prefix. Mixed models in one file are rejected.
pub(crate) fn lift_model(jsonl_path: &Path) -> anyhow::Result<(Vec<RequestRecord>, String)> {
    let mut requests = read_requests(jsonl_path)?;
    let mut model: Option<String> = None;
    for r in requests.iter_mut() {
        let this_model = r
            .body
            .as_object_mut()
            .and_then(|o| o.remove("model"))
            .and_then(|m| m.as_str().map(str::to_string));
        match (&model, this_model) {
            (None, Some(m)) => model = Some(m),
            (Some(prev), Some(m)) if prev != &m => {
                anyhow::bail!(
                    "{}: mixed models in one batch: '{}' and '{}'",
                    jsonl_path.display(),
                    prev,
                    m
                )
            }
            _ => {}
        }
    }
    let model = model
        .ok_or_else(|| anyhow::anyhow!("{}: no request names a model", jsonl_path.display()))?;
    Ok((requests, strip_provider_prefix(&model).to_string()))
}
