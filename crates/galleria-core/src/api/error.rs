use std::time::Duration;

use thiserror::Error;

use crate::auth::StorageError;

/// Failure before any HTTP status was received.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Request timed out")]
    Timeout,

    #[error("Could not connect to server: {0}")]
    Connect(String),

    #[error("Network error: {0}")]
    Other(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout
        } else if err.is_connect() {
            TransportError::Connect(err.to_string())
        } else {
            TransportError::Other(err.to_string())
        }
    }
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// `body` is kept whole for classification; only the rendered message
    /// is truncated.
    #[error("Server responded with status {status}: {}", truncate_body(.body))]
    Status { status: u16, body: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Credential storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

/// Truncate a response body to avoid logging excessive data
fn truncate_body(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY_LENGTH {
        return body.to_string();
    }
    let mut end = MAX_ERROR_BODY_LENGTH;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
}

impl ApiError {
    pub fn from_status(status: u16, body: &str) -> Self {
        ApiError::Status {
            status,
            body: body.to_string(),
        }
    }

    /// HTTP status, if the server answered at all
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status() == Some(401)
    }

    /// Response body parsed as JSON, when it is JSON
    pub fn body_json(&self) -> Option<serde_json::Value> {
        match self {
            ApiError::Status { body, .. } => serde_json::from_str(body).ok(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_truncates_long_bodies() {
        let err = ApiError::from_status(502, &"x".repeat(2000));
        let rendered = err.to_string();
        assert!(rendered.contains(&"x".repeat(MAX_ERROR_BODY_LENGTH)));
        assert!(!rendered.contains(&"x".repeat(MAX_ERROR_BODY_LENGTH + 1)));
        assert!(rendered.ends_with("(truncated, 2000 total bytes)"));

        let ApiError::Status { status, body } = err else {
            panic!("expected status error");
        };
        assert_eq!(status, 502);
        assert_eq!(body.len(), 2000);
    }

    #[test]
    fn test_long_json_body_still_parses() {
        let body = serde_json::json!({"password": ["too common", "y".repeat(800)]}).to_string();
        let err = ApiError::from_status(422, &body);
        assert_eq!(err.body_json().unwrap()["password"][0], "too common");
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        let body = "网".repeat(400);
        let err = ApiError::from_status(500, &body);
        assert_eq!(err.status(), Some(500));
        assert!(err.to_string().contains("truncated"));
    }

    #[test]
    fn test_body_json() {
        let err = ApiError::from_status(400, r#"{"detail": "bad"}"#);
        assert_eq!(err.body_json().unwrap()["detail"], "bad");
        assert!(ApiError::from_status(500, "<html>").body_json().is_none());
        assert!(ApiError::Transport(TransportError::Timeout).status().is_none());
    }
}
