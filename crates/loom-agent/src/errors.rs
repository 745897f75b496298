use loom_llm::ProviderError;
use thiserror::Error;

/// Top-level error type for the loom-agent crate.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("run {run_id} failed ({code}): {message}")]
    RunFailed {
        run_id: String,
        code: String,
        message: String,
    },
    #[error("run {run_id} did not finish within {iterations} polls")]
    Timeout { run_id: String, iterations: usize },
    #[error("run {run_id} was cancelled")]
    RunCancelled { run_id: String },
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("tool output batch has {outputs} outputs for {calls} calls")]
    ToolBatchMismatch { calls: usize, outputs: usize },
    #[error("event delivery failed: {0}")]
    Event(String),
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

impl AgentError {
    /// Text suitable as a final assistant-facing reply when a turn cannot
    /// produce a model answer.
    pub fn user_facing_message(&self) -> String {
        match self {
            Self::RunFailed { code, message, .. } => {
                format!("The assistant run failed ({code}): {message}")
            }
            Self::Timeout { .. } => {
                "The assistant took too long to respond. Please try again.".to_string()
            }
            Self::RunCancelled { .. } => "The request was cancelled.".to_string(),
            Self::Provider(ProviderError::ProviderUnavailable { .. })
            | Self::Provider(ProviderError::Configuration(_)) => self.to_string(),
            other => format!("Something went wrong: {other}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_failure_message_carries_code_and_text() {
        let error = AgentError::RunFailed {
            run_id: "run_1".to_string(),
            code: "rate_limit_exceeded".to_string(),
            message: "slow down".to_string(),
        };
        assert_eq!(
            error.user_facing_message(),
            "The assistant run failed (rate_limit_exceeded): slow down"
        );
    }

    #[test]
    fn provider_errors_convert_transparently() {
        let error: AgentError = ProviderError::not_found("thread", "t-1").into();
        assert_eq!(error.to_string(), "resource not found: thread (t-1)");
    }
}
