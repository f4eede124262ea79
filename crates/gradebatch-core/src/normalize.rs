//! Raw vendor output → canonical [`ResponseRecord`].
//!
//! Every function here is total: a line that cannot be understood becomes an
//! error record (logged with its line number), never a panic or a gap.

use crate::model::{ResponseRecord, STATUS_UNPARSEABLE};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};

/// `{request text → custom ids}` for vendors whose output does not echo the
/// caller's custom id. Identical texts (repeat rounds) queue up and are handed
/// out in request order.
#[derive(Debug, Clone, Default)]
pub struct RequestTextMap {
    inner: HashMap<String, VecDeque<String>>,
}

impl RequestTextMap {
    pub fn insert(&mut self, text: String, custom_id: String) {
        self.inner.entry(text).or_default().push_back(custom_id);
    }

    pub fn take(&mut self, text: &str) -> Option<String> {
        let q = self.inner.get_mut(text)?;
        let id = q.pop_front();
        if q.is_empty() {
            self.inner.remove(text);
        }
        id
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.values().map(VecDeque::len).sum()
    }
}

fn placeholder_id(line_no: usize) -> String {
    format!("unparsed-line-{}", line_no)
}

fn parse_line(provider: &str, line_no: usize, raw: &str) -> Result<Value, ResponseRecord> {
    serde_json::from_str::<Value>(raw).map_err(|e| {
        tracing::warn!(provider, line = line_no, error = %e, "unparseable output line");
        ResponseRecord::failed(
            placeholder_id(line_no),
            STATUS_UNPARSEABLE,
            format!("unparseable {} output line {}: {}", provider, line_no, e),
        )
    })
}

fn error_message(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Object(_) => v
            .pointer("/error/message")
            .or_else(|| v.get("message"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| v.to_string()),
        other => other.to_string(),
    }
}

/// Extracts the assistant text from a chat-completion body.
pub fn normalize_chat_completion(custom_id: &str, status_code: u16, body: &Value) -> ResponseRecord {
    if status_code != 200 {
        let msg = body
            .get("error")
            .map(error_message)
            .unwrap_or_else(|| error_message(body));
        return ResponseRecord::failed(custom_id, status_code, msg);
    }
    match body.pointer("/choices/0/message/content") {
        Some(Value::String(s)) => ResponseRecord::ok(custom_id, s.clone()),
        Some(Value::Array(parts)) => {
            let text: String = parts
                .iter()
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect();
            ResponseRecord::ok(custom_id, text)
        }
        _ => {
            let refusal = body
                .pointer("/choices/0/message/refusal")
                .and_then(Value::as_str);
            ResponseRecord::failed(
                custom_id,
                STATUS_UNPARSEABLE,
                match refusal {
                    Some(r) => format!("refused: {}", r),
                    None => "response missing completion text".to_string(),
                },
            )
        }
    }
}

/// OpenAI and Mistral batch output share this line shape:
/// `{custom_id, response: {status_code, body}, error}`.
pub fn normalize_openai_line(line_no: usize, raw: &str) -> ResponseRecord {
    normalize_chat_batch_line("openai", line_no, raw)
}

pub fn normalize_mistral_line(line_no: usize, raw: &str) -> ResponseRecord {
    normalize_chat_batch_line("mistral", line_no, raw)
}

fn normalize_chat_batch_line(provider: &str, line_no: usize, raw: &str) -> ResponseRecord {
    let v = match parse_line(provider, line_no, raw) {
        Ok(v) => v,
        Err(rec) => return rec,
    };
    let custom_id = match v.get("custom_id").and_then(Value::as_str) {
        Some(id) => id.to_string(),
        None => {
            tracing::warn!(provider, line = line_no, "output line has no custom_id");
            return ResponseRecord::failed(
                placeholder_id(line_no),
                STATUS_UNPARSEABLE,
                format!("{} output line {} has no custom_id", provider, line_no),
            );
        }
    };

    let status = v
        .pointer("/response/status_code")
        .and_then(Value::as_u64)
        .and_then(|s| u16::try_from(s).ok());

    if let Some(err) = v.get("error").filter(|e| !e.is_null()) {
        return ResponseRecord::failed(&custom_id, status.unwrap_or(500), error_message(err));
    }

    match (status, v.pointer("/response/body")) {
        (Some(code), Some(body)) => normalize_chat_completion(&custom_id, code, body),
        _ => ResponseRecord::failed(
            &custom_id,
            STATUS_UNPARSEABLE,
            "output line has neither response nor error",
        ),
    }
}

/// Anthropic message batches: the `result.type` discriminator carries the
/// outcome.
pub fn normalize_anthropic_line(line_no: usize, raw: &str) -> ResponseRecord {
    let v = match parse_line("anthropic", line_no, raw) {
        Ok(v) => v,
        Err(rec) => return rec,
    };
    let Some(custom_id) = v.get("custom_id").and_then(Value::as_str) else {
        tracing::warn!(provider = "anthropic", line = line_no, "output line has no custom_id");
        return ResponseRecord::failed(
            placeholder_id(line_no),
            STATUS_UNPARSEABLE,
            format!("anthropic output line {} has no custom_id", line_no),
        );
    };

    let kind = v.pointer("/result/type").and_then(Value::as_str);
    match kind {
        Some("succeeded") => {
            let blocks = v
                .pointer("/result/message/content")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            let text: Vec<&str> = blocks
                .iter()
                .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .collect();
            if text.is_empty() {
                ResponseRecord::failed(custom_id, STATUS_UNPARSEABLE, "message has no text blocks")
            } else {
                ResponseRecord::ok(custom_id, text.join(""))
            }
        }
        Some("errored") => {
            let err = v.pointer("/result/error").cloned().unwrap_or(Value::Null);
            let err_type = err
                .pointer("/error/type")
                .or_else(|| err.get("type"))
                .and_then(Value::as_str)
                .unwrap_or("api_error");
            let code = match err_type {
                "invalid_request_error" => 400,
                "authentication_error" => 401,
                "permission_error" => 403,
                "not_found_error" => 404,
                "rate_limit_error" => 429,
                "overloaded_error" => 529,
                _ => 500,
            };
            ResponseRecord::failed(custom_id, code, error_message(&err))
        }
        Some("canceled") => ResponseRecord::failed(custom_id, 499, "request canceled"),
        Some("expired") => ResponseRecord::failed(custom_id, 408, "request expired"),
        other => ResponseRecord::failed(
            custom_id,
            STATUS_UNPARSEABLE,
            format!("unknown result type {:?}", other),
        ),
    }
}

/// Text of the last user turn in a Gemini `contents` array; this is what the
/// request-text map is keyed by.
pub fn vertex_request_text(request: &Value) -> Option<String> {
    let contents = request.get("contents")?.as_array()?;
    let turn = contents
        .iter()
        .rev()
        .find(|c| c.get("role").and_then(Value::as_str).unwrap_or("user") == "user")?;
    let parts = turn.get("parts")?.as_array()?;
    let text: String = parts
        .iter()
        .filter_map(|p| p.get("text").and_then(Value::as_str))
        .collect();
    Some(text)
}

/// Vertex AI batch prediction output. The custom id is recovered through
/// `map`; grounding/citation metadata is appended to the content.
pub fn normalize_vertex_line(line_no: usize, raw: &str, map: &mut RequestTextMap) -> ResponseRecord {
    let v = match parse_line("vertex", line_no, raw) {
        Ok(v) => v,
        Err(rec) => return rec,
    };

    let custom_id = match v.get("request").and_then(vertex_request_text) {
        Some(text) => match map.take(&text) {
            Some(id) => id,
            None => {
                tracing::warn!(provider = "vertex", line = line_no, "request text not in mapping table");
                return ResponseRecord::failed(
                    placeholder_id(line_no),
                    STATUS_UNPARSEABLE,
                    format!("vertex output line {}: request text does not match any request", line_no),
                );
            }
        },
        None => {
            return ResponseRecord::failed(
                placeholder_id(line_no),
                STATUS_UNPARSEABLE,
                format!("vertex output line {} has no request text", line_no),
            );
        }
    };

    if let Some(status) = v.get("status").and_then(Value::as_str) {
        if !status.is_empty() {
            return ResponseRecord::failed(&custom_id, 500, status);
        }
    }

    let Some(candidate) = v.pointer("/response/candidates/0") else {
        let reason = v
            .pointer("/response/promptFeedback/blockReason")
            .and_then(Value::as_str)
            .map(|r| format!("prompt blocked: {}", r))
            .unwrap_or_else(|| "response has no candidates".to_string());
        return ResponseRecord::failed(&custom_id, 400, reason);
    };

    let text: String = candidate
        .pointer("/content/parts")
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect()
        })
        .unwrap_or_default();

    if text.is_empty() {
        let finish = candidate
            .get("finishReason")
            .and_then(Value::as_str)
            .unwrap_or("UNKNOWN");
        return ResponseRecord::failed(
            &custom_id,
            STATUS_UNPARSEABLE,
            format!("candidate has no text (finishReason={})", finish),
        );
    }

    let citations = collect_citations(candidate);
    ResponseRecord::ok(custom_id, append_citations(&text, &citations))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Citation {
    pub title: Option<String>,
    pub uri: String,
}

fn collect_citations(candidate: &Value) -> Vec<Citation> {
    let mut out: Vec<Citation> = Vec::new();
    let mut push = |title: Option<&str>, uri: Option<&str>| {
        let Some(uri) = uri.filter(|u| !u.is_empty()) else {
            return;
        };
        if out.iter().any(|c| c.uri == uri) {
            return;
        }
        out.push(Citation {
            title: title.filter(|t| !t.is_empty()).map(str::to_string),
            uri: uri.to_string(),
        });
    };

    if let Some(chunks) = candidate
        .pointer("/groundingMetadata/groundingChunks")
        .and_then(Value::as_array)
    {
        for c in chunks {
            let web = c.get("web").or_else(|| c.get("retrievedContext"));
            if let Some(web) = web {
                push(
                    web.get("title").and_then(Value::as_str),
                    web.get("uri").and_then(Value::as_str),
                );
            }
        }
    }
    if let Some(cites) = candidate
        .pointer("/citationMetadata/citations")
        .and_then(Value::as_array)
    {
        for c in cites {
            push(
                c.get("title").and_then(Value::as_str),
                c.get("uri").and_then(Value::as_str),
            );
        }
    }
    out
}

/// Deterministic rendering: numbered in first-seen order, one per line.
pub fn append_citations(text: &str, citations: &[Citation]) -> String {
    if citations.is_empty() {
        return text.to_string();
    }
    let mut out = String::from(text);
    out.push_str("\n\nCitations:");
    for (i, c) in citations.iter().enumerate() {
        match &c.title {
            Some(t) => out.push_str(&format!("\n[{}] {} - {}", i + 1, t, c.uri)),
            None => out.push_str(&format!("\n[{}] {}", i + 1, c.uri)),
        }
    }
    out
}

/// Normalizes a whole output artifact, one record per non-blank line.
pub fn normalize_lines(text: &str, mut f: impl FnMut(usize, &str) -> ResponseRecord) -> Vec<ResponseRecord> {
    text.lines()
        .enumerate()
        .filter(|(_, l)| !l.trim().is_empty())
        .map(|(i, l)| f(i + 1, l))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn openai_success_and_error_shapes() {
        let ok = json!({
            "id": "batch_req_1", "custom_id": "mc01-q1-p1",
            "response": {"status_code": 200, "body": {"choices": [{"message": {"content": "B"}}]}},
            "error": null
        });
        let r = normalize_openai_line(1, &ok.to_string());
        assert!(r.is_success());
        assert_eq!(r.content.as_deref(), Some("B"));

        let bad_status = json!({
            "custom_id": "mc01-q2-p1",
            "response": {"status_code": 429, "body": {"error": {"message": "rate limited"}}},
            "error": null
        });
        let r = normalize_openai_line(2, &bad_status.to_string());
        assert_eq!(r.status_code, 429);
        assert_eq!(r.error.as_deref(), Some("rate limited"));

        let explicit = json!({
            "custom_id": "mc01-q3-p1", "response": null,
            "error": {"code": "batch_expired", "message": "expired"}
        });
        let r = normalize_openai_line(3, &explicit.to_string());
        assert_eq!(r.status_code, 500);
        assert_eq!(r.error.as_deref(), Some("expired"));
    }

    #[test]
    fn out_of_range_status_code_is_not_truncated() {
        // 65736 would wrap to 200 as u16
        let line = json!({
            "custom_id": "mc01-q1-p1",
            "response": {"status_code": 65736, "body": {"choices": [{"message": {"content": "B"}}]}},
            "error": null
        });
        let r = normalize_openai_line(1, &line.to_string());
        assert!(!r.is_success());
        assert_eq!(r.status_code, STATUS_UNPARSEABLE);
    }

    #[test]
    fn malformed_lines_become_error_records() {
        let recs = normalize_lines("{not json\n\n{\"foo\":1}\n", normalize_openai_line);
        assert_eq!(recs.len(), 2);
        assert!(recs.iter().all(|r| r.error.is_some() && r.status_code != 200));
        assert_eq!(recs[0].custom_id, "unparsed-line-1");
        assert_eq!(recs[1].custom_id, "unparsed-line-3");
    }

    #[test]
    fn anthropic_discriminator() {
        let ok = json!({"custom_id": "a-b-c", "result": {"type": "succeeded",
            "message": {"content": [{"type": "text", "text": "Hello"}, {"type": "text", "text": " world"}]}}});
        assert_eq!(
            normalize_anthropic_line(1, &ok.to_string()).content.as_deref(),
            Some("Hello world")
        );
        let err = json!({"custom_id": "a-b-c", "result": {"type": "errored",
            "error": {"type": "error", "error": {"type": "invalid_request_error", "message": "bad"}}}});
        let r = normalize_anthropic_line(2, &err.to_string());
        assert_eq!(r.status_code, 400);
        assert_eq!(r.error.as_deref(), Some("bad"));
        let exp = json!({"custom_id": "a-b-c", "result": {"type": "expired"}});
        assert_eq!(normalize_anthropic_line(3, &exp.to_string()).status_code, 408);
    }

    #[test]
    fn vertex_resolves_ids_and_appends_citations() {
        let mut map = RequestTextMap::default();
        map.insert("What is 2+2?".into(), "mc01-q1-p1_r1".into());
        map.insert("What is 2+2?".into(), "mc01-q1-p1_r2".into());

        let line = json!({
            "request": {"contents": [{"role": "user", "parts": [{"text": "What is 2+2?"}]}]},
            "response": {"candidates": [{
                "content": {"parts": [{"text": "4"}]},
                "groundingMetadata": {"groundingChunks": [
                    {"web": {"uri": "https://a.example", "title": "A"}},
                    {"web": {"uri": "https://a.example", "title": "A"}},
                    {"web": {"uri": "https://b.example"}}
                ]}
            }]},
            "status": ""
        })
        .to_string();

        let first = normalize_vertex_line(1, &line, &mut map);
        assert_eq!(first.custom_id, "mc01-q1-p1_r1");
        assert_eq!(
            first.content.as_deref(),
            Some("4\n\nCitations:\n[1] A - https://a.example\n[2] https://b.example")
        );
        let second = normalize_vertex_line(2, &line, &mut map);
        assert_eq!(second.custom_id, "mc01-q1-p1_r2");

        let third = normalize_vertex_line(3, &line, &mut map);
        assert!(third.error.is_some());
        assert!(map.is_empty());
    }

    #[test]
    fn vertex_status_string_is_an_error() {
        let mut map = RequestTextMap::default();
        map.insert("hi".into(), "m-x-p".into());
        let line = json!({
            "request": {"contents": [{"role": "user", "parts": [{"text": "hi"}]}]},
            "status": "Bad Request: invalid argument"
        });
        let r = normalize_vertex_line(1, &line.to_string(), &mut map);
        assert_eq!(r.custom_id, "m-x-p");
        assert_eq!(r.error.as_deref(), Some("Bad Request: invalid argument"));
    }
}
