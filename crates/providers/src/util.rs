//! Small shared helpers for provider adapters.

use rv_domain::error::{Error, Result};

/// Map a reqwest transport error into the shared error type.
pub(crate) fn from_reqwest(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Http(format!("timeout: {e}"))
    } else {
        Error::Http(e.to_string())
    }
}

/// Classify a non-success HTTP status into a typed error.
///
/// 429 and 5xx are transient (the gateway retries once); everything else —
/// notably 400 validation and 401/403 auth — is terminal.
pub(crate) fn classify_status(
    provider: &str,
    status: u16,
    body: &str,
    retry_after_ms: Option<u64>,
) -> Error {
    match status {
        429 => Error::LlmTransient {
            provider: provider.to_owned(),
            message: match retry_after_ms {
                Some(ms) => format!("rate limited (retry after {ms}ms): {body}"),
                None => format!("rate limited: {body}"),
            },
        },
        500..=599 => Error::LlmTransient {
            provider: provider.to_owned(),
            message: format!("HTTP {status} - {body}"),
        },
        _ => Error::LlmFailed {
            provider: provider.to_owned(),
            message: format!("HTTP {status} - {body}"),
        },
    }
}

/// Extract the `retry-after` header as milliseconds, if present.
pub(crate) fn retry_after_ms(resp: &reqwest::Response) -> Option<u64> {
    resp.headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(|secs| secs * 1000)
}

/// Pull a rate-limit hint back out of a transient error message.
pub(crate) fn parse_retry_hint_ms(message: &str) -> Option<u64> {
    let idx = message.find("retry after ")?;
    let rest = &message[idx + "retry after ".len()..];
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

/// Resolve an API key: a direct value wins, otherwise the named env var.
pub fn resolve_api_key(direct: Option<&str>, env_var: Option<&str>) -> Result<String> {
    if let Some(key) = direct {
        if !key.is_empty() {
            return Ok(key.to_owned());
        }
    }
    if let Some(var) = env_var {
        if let Ok(key) = std::env::var(var) {
            if !key.is_empty() {
                return Ok(key);
            }
        }
        return Err(Error::Config(format!("env var {var} is not set")));
    }
    Err(Error::Config("no API key configured".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_is_transient_with_hint() {
        let err = classify_status("p1", 429, "slow down", Some(2000));
        assert_eq!(err.kind(), "llm_transient");
        assert_eq!(parse_retry_hint_ms(&err.to_string()), Some(2000));
    }

    #[test]
    fn auth_failures_are_terminal() {
        let err = classify_status("p1", 401, "bad key", None);
        assert_eq!(err.kind(), "llm_failed");
        assert!(!err.is_retryable());
    }

    #[test]
    fn server_errors_are_transient() {
        assert!(classify_status("p1", 503, "", None).is_retryable());
    }

    #[test]
    fn hint_absent_when_not_embedded() {
        assert_eq!(parse_retry_hint_ms("rate limited: nope"), None);
    }
}
