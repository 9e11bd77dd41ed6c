pub mod ollama;
pub mod remote;

use crate::llm::LlmError;
use reqwest::StatusCode;

const ERROR_BODY_PREVIEW: usize = 500;

/// Maps a non-success HTTP reply onto the error taxonomy.
pub(crate) fn status_error(status: StatusCode, body: &str) -> LlmError {
    let detail: String = body.chars().take(ERROR_BODY_PREVIEW).collect();
    if status == StatusCode::TOO_MANY_REQUESTS {
        LlmError::RateLimited(detail)
    } else if status.is_server_error() {
        LlmError::ServerError {
            status: status.as_u16(),
            detail,
        }
    } else {
        LlmError::ResponseError(format!("API responded with status code {}: {}", status, detail))
    }
}

/// Transport failures from reqwest, with timeouts kept distinct.
pub(crate) fn transport_error(error: reqwest::Error, timeout_secs: u64) -> LlmError {
    if error.is_timeout() {
        LlmError::Timeout(timeout_secs)
    } else {
        LlmError::ConnectionError(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_to_retry_classes() {
        assert!(matches!(
            status_error(StatusCode::TOO_MANY_REQUESTS, "slow"),
            LlmError::RateLimited(_)
        ));
        assert_eq!(
            status_error(StatusCode::BAD_GATEWAY, "upstream"),
            LlmError::ServerError { status: 502, detail: "upstream".into() }
        );

        let unauthorized = status_error(StatusCode::UNAUTHORIZED, "bad key");
        assert!(matches!(unauthorized, LlmError::ResponseError(_)));
        assert!(!unauthorized.is_retryable());
    }

    #[test]
    fn long_bodies_are_cut() {
        let body = "x".repeat(2000);
        let LlmError::RateLimited(detail) = status_error(StatusCode::TOO_MANY_REQUESTS, &body) else {
            panic!("expected rate limit");
        };
        assert_eq!(detail.len(), ERROR_BODY_PREVIEW);
    }
}
