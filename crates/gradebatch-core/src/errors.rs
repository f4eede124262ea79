use thiserror::Error;

/// Problems with the experiment configuration file itself.
#[derive(Debug, Clone)]
pub struct ConfigError(pub String);

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ConfigError {}

/// Operator errors that must abort the run instead of being recovered from.
#[derive(Debug, Error)]
pub enum StructuralError {
    #[error(
        "custom id '{custom_id}' belongs to model config '{found}', but {source_file} implies '{expected}'"
    )]
    ModelConfigMismatch {
        custom_id: String,
        found: String,
        expected: String,
        source_file: String,
    },

    #[error("malformed custom id '{custom_id}': {reason}")]
    MalformedCustomId { custom_id: String, reason: String },

    #[error("invalid custom id component '{component}': {reason}")]
    InvalidComponent {
        component: String,
        reason: &'static str,
    },

    #[error("unknown model config id '{id}'{hint}")]
    UnknownModelConfig { id: String, hint: String },

    #[error("missing required environment variable {0}")]
    MissingEnv(&'static str),
}

/// True when the error chain carries a fatal structural or configuration error.
pub fn is_structural(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|c| c.is::<StructuralError>() || c.is::<ConfigError>())
}
