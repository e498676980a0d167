use thiserror::Error;

pub type Result<T> = std::result::Result<T, LlmError>;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("http status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("unexpected response format: {0}")]
    ResponseFormat(String),

    #[error("stream parse error: {0}")]
    StreamParse(String),
}

impl LlmError {
    /// Maps a non-success HTTP status to an error. 429 is a rate limit, 408 and
    /// 504 are timeouts, everything else keeps its status code.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        match status {
            429 => Self::RateLimited(body),
            408 | 504 => Self::Timeout(format!("status={status} body={body}")),
            _ => Self::Status { status, body },
        }
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            return Self::Timeout(e.to_string());
        }
        if let Some(status) = e.status() {
            return Self::from_status(status.as_u16(), e.to_string());
        }
        Self::Transport(e.to_string())
    }
}

impl From<serde_json::Error> for LlmError {
    fn from(e: serde_json::Error) -> Self {
        Self::ResponseFormat(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::LlmError;

    #[test]
    fn status_429_is_rate_limited() {
        assert!(matches!(
            LlmError::from_status(429, "slow down"),
            LlmError::RateLimited(_)
        ));
    }

    #[test]
    fn gateway_timeout_is_timeout() {
        assert!(matches!(
            LlmError::from_status(504, ""),
            LlmError::Timeout(_)
        ));
    }

    #[test]
    fn other_status_keeps_code() {
        match LlmError::from_status(500, "boom") {
            LlmError::Status { status, body } => {
                assert_eq!(status, 500);
                assert_eq!(body, "boom");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
