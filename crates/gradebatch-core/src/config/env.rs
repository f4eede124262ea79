use crate::errors::StructuralError;
use std::fmt;

pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com";
pub const DEFAULT_ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
pub const DEFAULT_MISTRAL_BASE_URL: &str = "https://api.mistral.ai";
pub const DEFAULT_GCS_BASE_URL: &str = "https://storage.googleapis.com";
pub const DEFAULT_VERTEX_LOCATION: &str = "us-central1";

/// Credentials and endpoints, read once at process start and passed by
/// reference into each adapter constructor.
#[derive(Clone, Default)]
pub struct ProviderSettings {
    pub openai_api_key: Option<String>,
    pub openai_base_url: Option<String>,
    pub anthropic_api_key: Option<String>,
    pub anthropic_base_url: Option<String>,
    pub mistral_api_key: Option<String>,
    pub mistral_base_url: Option<String>,
    pub vertex_access_token: Option<String>,
    pub vertex_project_id: Option<String>,
    pub vertex_location: Option<String>,
    pub vertex_bucket: Option<String>,
    pub vertex_base_url: Option<String>,
    pub gcs_base_url: Option<String>,
}

impl ProviderSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let get = |k: &str| get(k).filter(|v| !v.trim().is_empty());
        Self {
            openai_api_key: get("OPENAI_API_KEY"),
            openai_base_url: get("OPENAI_BASE_URL"),
            anthropic_api_key: get("ANTHROPIC_API_KEY"),
            anthropic_base_url: get("ANTHROPIC_BASE_URL"),
            mistral_api_key: get("MISTRAL_API_KEY"),
            mistral_base_url: get("MISTRAL_BASE_URL"),
            vertex_access_token: get("VERTEX_ACCESS_TOKEN"),
            vertex_project_id: get("VERTEX_PROJECT_ID"),
            vertex_location: get("VERTEX_LOCATION"),
            vertex_bucket: get("VERTEX_BUCKET"),
            vertex_base_url: get("VERTEX_BASE_URL"),
            gcs_base_url: get("GCS_BASE_URL"),
        }
    }

    pub fn openai_base_url(&self) -> String {
        trim_base(self.openai_base_url.as_deref().unwrap_or(DEFAULT_OPENAI_BASE_URL))
    }

    pub fn anthropic_base_url(&self) -> String {
        trim_base(
            self.anthropic_base_url
                .as_deref()
                .unwrap_or(DEFAULT_ANTHROPIC_BASE_URL),
        )
    }

    pub fn mistral_base_url(&self) -> String {
        trim_base(self.mistral_base_url.as_deref().unwrap_or(DEFAULT_MISTRAL_BASE_URL))
    }

    pub fn vertex_location(&self) -> String {
        self.vertex_location
            .clone()
            .unwrap_or_else(|| DEFAULT_VERTEX_LOCATION.to_string())
    }

    pub fn vertex_base_url(&self) -> String {
        match &self.vertex_base_url {
            Some(u) => trim_base(u),
            None => format!("https://{}-aiplatform.googleapis.com", self.vertex_location()),
        }
    }

    pub fn gcs_base_url(&self) -> String {
        trim_base(self.gcs_base_url.as_deref().unwrap_or(DEFAULT_GCS_BASE_URL))
    }
}

/// Returns the value or a fatal error naming the missing variable.
pub fn require<'a>(v: &'a Option<String>, name: &'static str) -> Result<&'a str, StructuralError> {
    v.as_deref().ok_or(StructuralError::MissingEnv(name))
}

fn trim_base(u: &str) -> String {
    u.trim_end_matches('/').to_string()
}

fn redacted(v: &Option<String>) -> &'static str {
    if v.is_some() {
        "<set>"
    } else {
        "<unset>"
    }
}

impl fmt::Debug for ProviderSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderSettings")
            .field("openai_api_key", &redacted(&self.openai_api_key))
            .field("openai_base_url", &self.openai_base_url())
            .field("anthropic_api_key", &redacted(&self.anthropic_api_key))
            .field("anthropic_base_url", &self.anthropic_base_url())
            .field("mistral_api_key", &redacted(&self.mistral_api_key))
            .field("mistral_base_url", &self.mistral_base_url())
            .field("vertex_access_token", &redacted(&self.vertex_access_token))
            .field("vertex_project_id", &self.vertex_project_id)
            .field("vertex_location", &self.vertex_location())
            .field("vertex_bucket", &self.vertex_bucket)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn missing_variable_is_named() {
        let s = ProviderSettings::from_lookup(|_| None);
        let err = require(&s.anthropic_api_key, "ANTHROPIC_API_KEY").unwrap_err();
        assert_eq!(
            err.to_string(),
            "missing required environment variable ANTHROPIC_API_KEY"
        );
    }

    #[test]
    fn blank_values_count_as_missing_and_debug_hides_keys() {
        let env: HashMap<&str, &str> = [
            ("OPENAI_API_KEY", "sk-secret"),
            ("MISTRAL_API_KEY", "  "),
            ("OPENAI_BASE_URL", "http://localhost:9999/"),
        ]
        .into_iter()
        .collect();
        let s = ProviderSettings::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert!(s.mistral_api_key.is_none());
        assert_eq!(s.openai_base_url(), "http://localhost:9999");
        let dbg = format!("{:?}", s);
        assert!(!dbg.contains("sk-secret"));
    }

    #[test]
    fn vertex_endpoint_derives_from_location() {
        let s = ProviderSettings::from_lookup(|k| {
            (k == "VERTEX_LOCATION").then(|| "europe-west4".to_string())
        });
        assert_eq!(
            s.vertex_base_url(),
            "https://europe-west4-aiplatform.googleapis.com"
        );
    }
}
