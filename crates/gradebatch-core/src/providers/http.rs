use anyhow::Context;
use serde_json::Value;

/// Sends one step of a vendor workflow. Transport and HTTP failures are
/// logged with the step name so that, e.g., a staging upload failure is
/// distinguishable from a job-creation failure.
pub(crate) async fn send_step(
    req: reqwest::RequestBuilder,
    provider: &'static str,
    step: &'static str,
) -> anyhow::Result<reqwest::Response> {
    let resp = match req.send().await {
        Ok(r) => r,
        Err(e) => {
            tracing::error!(provider, step, error = %e, "request did not complete");
            return Err(anyhow::Error::new(e).context(format!("{provider} {step}: request failed")));
        }
    };
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        tracing::error!(provider, step, status = status.as_u16(), "vendor returned an error");
        anyhow::bail!("{provider} {step} failed ({status}): {body}");
    }
    Ok(resp)
}

pub(crate) async fn json_step(
    req: reqwest::RequestBuilder,
    provider: &'static str,
    step: &'static str,
) -> anyhow::Result<Value> {
    send_step(req, provider, step)
        .await?
        .json::<Value>()
        .await
        .with_context(|| format!("{provider} {step}: response is not JSON"))
}

pub(crate) async fn text_step(
    req: reqwest::RequestBuilder,
    provider: &'static str,
    step: &'static str,
) -> anyhow::Result<String> {
    send_step(req, provider, step)
        .await?
        .text()
        .await
        .with_context(|| format!("{provider} {step}: failed to read body"))
}

pub(crate) fn str_at(v: &Value, pointer: &str) -> Option<String> {
    v.pointer(pointer).and_then(Value::as_str).map(str::to_string)
}

pub(crate) fn require_str(
    v: &Value,
    pointer: &str,
    provider: &'static str,
    step: &'static str,
) -> anyhow::Result<String> {
    str_at(v, pointer)
        .ok_or_else(|| anyhow::anyhow!("{provider} {step}: response missing {pointer}: {v}"))
}

/// Multipart upload to an OpenAI-style `/v1/files` endpoint.
pub(crate) async fn upload_batch_file(
    client: &reqwest::Client,
    base_url: &str,
    api_key: &str,
    file_name: String,
    bytes: Vec<u8>,
    provider: &'static str,
) -> anyhow::Result<String> {
    let part = reqwest::multipart::Part::bytes(bytes)
        .file_name(file_name)
        .mime_str("application/jsonl")?;
    let form = reqwest::multipart::Form::new()
        .text("purpose", "batch")
        .part("file", part);
    let file = json_step(
        client
            .post(format!("{}/v1/files", base_url))
            .bearer_auth(api_key)
            .multipart(form),
        provider,
        "upload",
    )
    .await?;
    require_str(&file, "/id", provider, "upload")
}

/// Serializes values as JSON Lines into memory.
pub(crate) fn to_jsonl_bytes(lines: &[Value]) -> anyhow::Result<Vec<u8>> {
    let mut out = Vec::new();
    for l in lines {
        serde_json::to_writer(&mut out, l)?;
        out.push(b'\n');
    }
    Ok(out)
}
