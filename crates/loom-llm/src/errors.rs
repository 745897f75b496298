//! Provider-level error taxonomy.

use thiserror::Error;

/// Errors raised by provider adapters and the stores they own.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("{provider} is unavailable: {message}{}", format_remediation(.remediation))]
    ProviderUnavailable {
        provider: String,
        message: String,
        remediation: Vec<String>,
    },

    #[error("resource not found: {resource} ({id})")]
    NotFound { resource: &'static str, id: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("api error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("invalid provider response: {0}")]
    InvalidResponse(String),

    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl ProviderError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn not_found(resource: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource,
            id: id.into(),
        }
    }

    /// Transient failures a vendor transport may retry.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Api { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

fn format_remediation(steps: &[String]) -> String {
    if steps.is_empty() {
        return String::new();
    }
    let mut rendered = String::from("\nTo fix this:");
    for (index, step) in steps.iter().enumerate() {
        rendered.push_str(&format!("\n  {}. {}", index + 1, step));
    }
    rendered
}

pub type ProviderResult<T> = Result<T, ProviderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_unavailable_display_lists_remediation_steps() {
        let error = ProviderError::ProviderUnavailable {
            provider: "ollama".to_string(),
            message: "connection refused".to_string(),
            remediation: vec![
                "start the server with `ollama serve`".to_string(),
                "pull the model with `ollama pull llama3.1`".to_string(),
            ],
        };

        let rendered = error.to_string();
        assert!(rendered.starts_with("ollama is unavailable: connection refused"));
        assert!(rendered.contains("1. start the server with `ollama serve`"));
        assert!(rendered.contains("2. pull the model with `ollama pull llama3.1`"));
    }

    #[test]
    fn not_found_error_expected_metadata() {
        let error = ProviderError::not_found("thread", "t-1");
        assert_eq!(error.to_string(), "resource not found: thread (t-1)");
    }

    #[test]
    fn transient_classification_covers_rate_limits_and_server_errors() {
        assert!(ProviderError::Transport("reset".to_string()).is_transient());
        assert!(
            ProviderError::Api {
                status: 429,
                message: String::new()
            }
            .is_transient()
        );
        assert!(
            ProviderError::Api {
                status: 503,
                message: String::new()
            }
            .is_transient()
        );
        assert!(
            !ProviderError::Api {
                status: 400,
                message: String::new()
            }
            .is_transient()
        );
        assert!(!ProviderError::configuration("missing key").is_transient());
    }
}
