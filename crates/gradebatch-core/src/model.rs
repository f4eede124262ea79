use serde::{Deserialize, Serialize};

/// HTTP-like status used for records that could not be read at all.
pub const STATUS_UNPARSEABLE: u16 = 422;
/// Status used when the transport failed before any vendor status was seen.
pub const STATUS_TRANSPORT_ERROR: u16 = 503;

/// One line of a request file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestRecord {
    pub custom_id: String,
    pub method: String,
    pub url: String,
    pub body: serde_json::Value,
}

/// Canonical post-normalization record; exactly one of `content` / `error` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseRecord {
    pub custom_id: String,
    pub status_code: u16,
    pub content: Option<String>,
    pub error: Option<String>,
}

impl ResponseRecord {
    pub fn ok(custom_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            custom_id: custom_id.into(),
            status_code: 200,
            content: Some(content.into()),
            error: None,
        }
    }

    pub fn failed(custom_id: impl Into<String>, status_code: u16, error: impl Into<String>) -> Self {
        Self {
            custom_id: custom_id.into(),
            // a failure must never look like a success downstream
            status_code: if status_code == 200 {
                STATUS_UNPARSEABLE
            } else {
                status_code
            },
            content: None,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status_code == 200 && self.error.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    #[serde(alias = "openai_compatible")]
    Openai,
    Anthropic,
    #[serde(alias = "vertex_ai")]
    Vertex,
    Mistral,
    Direct,
}

impl Provider {
    /// Resolves the vendor from a model id prefix; unprefixed ids go to the
    /// OpenAI-compatible batch API.
    pub fn from_model_id(model: &str) -> Self {
        let lower = model.to_ascii_lowercase();
        if lower.starts_with("anthropic/") || lower.starts_with("claude-") {
            Provider::Anthropic
        } else if lower.starts_with("vertex/")
            || lower.starts_with("vertex_ai/")
            || lower.starts_with("gemini-")
        {
            Provider::Vertex
        } else if lower.starts_with("mistral/") {
            Provider::Mistral
        } else if lower.starts_with("direct/") {
            Provider::Direct
        } else {
            Provider::Openai
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Openai => "openai",
            Provider::Anthropic => "anthropic",
            Provider::Vertex => "vertex",
            Provider::Mistral => "mistral",
            Provider::Direct => "direct",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "openai" | "openai_compatible" => Some(Provider::Openai),
            "anthropic" => Some(Provider::Anthropic),
            "vertex" | "vertex_ai" => Some(Provider::Vertex),
            "mistral" => Some(Provider::Mistral),
            "direct" => Some(Provider::Direct),
            _ => None,
        }
    }
}

/// Strips a routing prefix such as `mistral/` from a model id.
pub fn strip_provider_prefix(model: &str) -> &str {
    const PREFIXES: [&str; 5] = ["anthropic/", "vertex_ai/", "vertex/", "mistral/", "direct/"];
    for p in PREFIXES {
        if model.get(..p.len()).is_some_and(|head| head.eq_ignore_ascii_case(p)) {
            return &model[p.len()..];
        }
    }
    model
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerOption {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub text: String,
    /// 1 marks the correct option; larger ranks are progressively worse.
    pub rank: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    pub id: String,
    pub text: String,
    pub options: Vec<AnswerOption>,
}

impl Question {
    pub fn label_for(&self, idx: usize) -> String {
        self.options
            .get(idx)
            .and_then(|o| o.label.clone())
            .unwrap_or_else(|| option_label(idx))
    }

    pub fn correct_labels(&self) -> Vec<String> {
        self.options
            .iter()
            .enumerate()
            .filter(|(_, o)| o.rank == 1)
            .map(|(i, _)| self.label_for(i))
            .collect()
    }
}

fn option_label(idx: usize) -> String {
    let mut n = idx;
    let mut out = Vec::new();
    loop {
        out.push((b'A' + (n % 26) as u8) as char);
        if n < 26 {
            break;
        }
        n = n / 26 - 1;
    }
    out.iter().rev().collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptTemplate {
    pub id: String,
    pub template: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub id: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<Provider>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_repeats")]
    pub repeats: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
}

fn default_max_tokens() -> u32 {
    1024
}

fn default_repeats() -> u32 {
    1
}

impl ModelConfig {
    pub fn provider(&self) -> Provider {
        self.provider
            .unwrap_or_else(|| Provider::from_model_id(&self.model))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluatorConfig {
    pub id: String,
    /// Model configuration used to issue the grading requests.
    pub model_config: String,
    #[serde(default = "default_metric")]
    pub metric: String,
    pub template: String,
}

fn default_metric() -> String {
    "correctness".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_stripping_handles_non_ascii_ids() {
        assert_eq!(strip_provider_prefix("Mistral/mistral-large"), "mistral-large");
        assert_eq!(strip_provider_prefix("modèle-local"), "modèle-local");
        assert_eq!(strip_provider_prefix("ünïcødé-mødel"), "ünïcødé-mødel");
        assert_eq!(strip_provider_prefix("direct/ünï"), "ünï");
    }

    #[test]
    fn provider_resolved_from_prefix() {
        assert_eq!(Provider::from_model_id("gpt-4o-mini"), Provider::Openai);
        assert_eq!(
            Provider::from_model_id("claude-3-5-sonnet-20241022"),
            Provider::Anthropic
        );
        assert_eq!(
            Provider::from_model_id("anthropic/claude-3-haiku"),
            Provider::Anthropic
        );
        assert_eq!(Provider::from_model_id("gemini-1.5-pro"), Provider::Vertex);
        assert_eq!(
            Provider::from_model_id("vertex_ai/gemini-1.5-flash"),
            Provider::Vertex
        );
        assert_eq!(
            Provider::from_model_id("mistral/mistral-large-latest"),
            Provider::Mistral
        );
        assert_eq!(Provider::from_model_id("direct/llama3"), Provider::Direct);
    }

    #[test]
    fn prefix_stripping() {
        assert_eq!(strip_provider_prefix("mistral/mistral-small"), "mistral-small");
        assert_eq!(strip_provider_prefix("Vertex_AI/gemini-pro"), "gemini-pro");
        assert_eq!(strip_provider_prefix("gpt-4o"), "gpt-4o");
    }

    #[test]
    fn option_labels_continue_past_z() {
        assert_eq!(option_label(0), "A");
        assert_eq!(option_label(25), "Z");
        assert_eq!(option_label(26), "AA");
    }

    #[test]
    fn failed_record_never_reports_200() {
        let r = ResponseRecord::failed("x", 200, "empty completion");
        assert_eq!(r.status_code, STATUS_UNPARSEABLE);
        assert!(!r.is_success());
    }
}
