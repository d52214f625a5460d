/// Shared error type used across all Reverie crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP: {0}")]
    Http(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("tool failed: {0}")]
    ToolFailed(String),

    #[error("tool timed out after {0}s")]
    ToolTimeout(u64),

    #[error("provider {provider}: {message}")]
    LlmTransient { provider: String, message: String },

    #[error("llm failed ({provider}): {message}")]
    LlmFailed { provider: String, message: String },

    #[error("checkpoint: {0}")]
    Checkpoint(String),

    #[error("memory: {0}")]
    Memory(String),

    #[error("limit exceeded: {0}")]
    LimitExceeded(String),

    #[error("rejected by user")]
    RejectedByUser,

    #[error("cancelled")]
    Cancelled,

    #[error("config: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Stable kind string surfaced in `error{kind, message}` events and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Io(_) => "io",
            Error::Json(_) | Error::InvalidInput(_) => "invalid_input",
            Error::Http(_) | Error::LlmTransient { .. } => "llm_transient",
            Error::UnknownTool(_) => "unknown_tool",
            Error::ToolFailed(_) => "tool_failed",
            Error::ToolTimeout(_) => "tool_timeout",
            Error::LlmFailed { .. } => "llm_failed",
            Error::Checkpoint(_) => "checkpoint_failed",
            Error::Memory(_) => "memory_failed",
            Error::LimitExceeded(_) => "limit_exceeded",
            Error::RejectedByUser => "rejected_by_user",
            Error::Cancelled => "cancelled",
            Error::Config(_) => "config",
            Error::Other(_) => "other",
        }
    }

    /// Whether the gateway may retry the request that produced this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Http(_) | Error::LlmTransient { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_match_the_error_table() {
        assert_eq!(Error::UnknownTool("x".into()).kind(), "unknown_tool");
        assert_eq!(Error::ToolTimeout(30).kind(), "tool_timeout");
        assert_eq!(
            Error::LlmFailed {
                provider: "anthropic".into(),
                message: "401".into()
            }
            .kind(),
            "llm_failed"
        );
        assert_eq!(Error::RejectedByUser.kind(), "rejected_by_user");
        assert_eq!(Error::LimitExceeded("iterations".into()).kind(), "limit_exceeded");
    }

    #[test]
    fn transient_errors_are_retryable() {
        assert!(Error::LlmTransient {
            provider: "p".into(),
            message: "503".into()
        }
        .is_retryable());
        assert!(!Error::LlmFailed {
            provider: "p".into(),
            message: "auth".into()
        }
        .is_retryable());
        assert!(!Error::InvalidInput("bad".into()).is_retryable());
    }
}
