//! Error classification for the presentation layer.
//!
//! Every failed operation is reduced to a [`ClassifiedError`]: one of five
//! kinds, a retryability flag, and a complete user-facing sentence. The
//! classifier is total; inputs it does not understand become
//! [`ErrorKind::Unknown`].
//!
//! Rules, first match wins:
//!
//! | input                     | kind             | retryable |
//! |---------------------------|------------------|-----------|
//! | no HTTP status            | `network`        | yes       |
//! | 400                       | `validation`     | no        |
//! | 401, 403                  | `authentication` | no        |
//! | 429, 500, 502, 503        | `server`         | yes       |
//! | anything else             | keyword heuristic, default `unknown` | per kind |

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use super::ApiError;

/// Body fields checked, in order, before any other list-valued field
const KNOWN_FIELDS: &[&str] = &["username", "password", "email"];

const GENERIC_FAILURE: &str = "The request failed. Please try again.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    Validation,
    Authentication,
    Server,
    Unknown,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Network | ErrorKind::Server | ErrorKind::Unknown)
    }
}

/// What the UI should offer the user next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "snake_case")]
pub enum Remedy {
    Retry,
    ReenterCredentials,
    FixInput,
}

/// Raw failure shape fed to [`classify`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawFailure {
    pub status: Option<u16>,
    pub message: Option<String>,
    pub body: Option<Value>,
}

impl RawFailure {
    pub fn network(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Wire-level shape of an [`ApiError`]. `None` for failures that never
    /// involved the backend's answer (bad payloads, local storage).
    pub fn from_api_error(err: &ApiError) -> Option<Self> {
        match err {
            ApiError::Status { status, .. } => Some(Self {
                status: Some(*status),
                message: None,
                body: err.body_json(),
            }),
            ApiError::Transport(_) | ApiError::Timeout(_) => Some(Self::network(err.to_string())),
            ApiError::InvalidResponse(_) | ApiError::Storage(_) => None,
        }
    }
}

/// A failure ready for display. Carries no behavior.
#[derive(Clone, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
    #[serde(skip)]
    #[cfg_attr(feature = "ts", ts(skip))]
    pub cause: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl ClassifiedError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: kind.is_retryable(),
            cause: None,
        }
    }

    pub fn with_cause<E>(mut self, cause: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.cause = Some(Arc::new(cause));
        self
    }

    pub fn remedy(&self) -> Remedy {
        match self.kind {
            ErrorKind::Validation => Remedy::FixInput,
            ErrorKind::Authentication => Remedy::ReenterCredentials,
            _ => Remedy::Retry,
        }
    }
}

impl fmt::Debug for ClassifiedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassifiedError")
            .field("kind", &self.kind)
            .field("message", &self.message)
            .field("retryable", &self.retryable)
            .field("cause", &self.cause.as_ref().map(|c| c.to_string()))
            .finish()
    }
}

impl fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ClassifiedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|c| c as &(dyn std::error::Error + 'static))
    }
}

impl From<ApiError> for ClassifiedError {
    fn from(err: ApiError) -> Self {
        match RawFailure::from_api_error(&err) {
            Some(raw) => classify(&raw).with_cause(err),
            None => ClassifiedError::new(ErrorKind::Unknown, GENERIC_FAILURE).with_cause(err),
        }
    }
}

/// Map a raw failure to its [`ClassifiedError`].
pub fn classify(failure: &RawFailure) -> ClassifiedError {
    let body_message = failure.body.as_ref().and_then(message_from_body);

    let Some(status) = failure.status else {
        let timed_out = failure
            .message
            .as_deref()
            .is_some_and(|m| mentions_timeout(&m.to_lowercase()));
        let message = if timed_out {
            "The request timed out. Check your connection and try again."
        } else {
            "Unable to reach the server. Check your network connection and try again."
        };
        return ClassifiedError::new(ErrorKind::Network, message);
    };

    match status {
        400 => ClassifiedError::new(
            ErrorKind::Validation,
            body_message.unwrap_or_else(|| {
                "Some of the information you entered is invalid. Please check it and try again."
                    .to_string()
            }),
        ),
        401 => ClassifiedError::new(
            ErrorKind::Authentication,
            body_message.unwrap_or_else(|| {
                "Your session has expired or your credentials are incorrect. Please sign in again."
                    .to_string()
            }),
        ),
        403 => ClassifiedError::new(
            ErrorKind::Authentication,
            body_message.unwrap_or_else(|| {
                "Your account does not have access to this. It may have been disabled; contact an administrator if this persists."
                    .to_string()
            }),
        ),
        429 => ClassifiedError::new(
            ErrorKind::Server,
            "Too many requests were made in a short time. Please wait a moment and try again.",
        ),
        500 | 502 | 503 => ClassifiedError::new(
            ErrorKind::Server,
            "The server ran into a problem. Please try again in a little while.",
        ),
        _ => classify_fallback(body_message, failure.message.as_deref()),
    }
}

fn classify_fallback(body_message: Option<String>, raw_message: Option<&str>) -> ClassifiedError {
    let haystack = body_message
        .as_deref()
        .or(raw_message)
        .unwrap_or_default()
        .to_lowercase();

    let kind = if contains_any(&haystack, &["username", "用户名"]) {
        ErrorKind::Validation
    } else if contains_any(&haystack, &["password", "密码"]) {
        ErrorKind::Authentication
    } else if mentions_timeout(&haystack) || contains_any(&haystack, &["network", "网络"]) {
        ErrorKind::Network
    } else {
        ErrorKind::Unknown
    };

    let message = match body_message {
        Some(message) => message,
        None if kind == ErrorKind::Network => {
            "Unable to reach the server. Check your network connection and try again.".to_string()
        }
        None => GENERIC_FAILURE.to_string(),
    };
    ClassifiedError::new(kind, message)
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

fn mentions_timeout(text: &str) -> bool {
    contains_any(text, &["timeout", "timed out", "超时"])
}

/// Build a user-facing sentence from a backend error body, if it has a
/// recognizable shape.
fn message_from_body(body: &Value) -> Option<String> {
    let obj = match body {
        Value::String(s) => return sentence(s),
        Value::Object(obj) => obj,
        _ => return None,
    };

    if let Some(detail) = obj.get("detail").and_then(Value::as_str) {
        if let Some(message) = sentence(detail) {
            return Some(message);
        }
    }

    if let Some(message) = obj.get("non_field_errors").and_then(joined_messages) {
        return sentence(&message);
    }

    let mut fields: Vec<(&str, &Value)> = KNOWN_FIELDS
        .iter()
        .filter_map(|field| obj.get(*field).map(|v| (*field, v)))
        .collect();
    fields.extend(
        obj.iter()
            .filter(|(k, _)| !KNOWN_FIELDS.contains(&k.as_str()) && k.as_str() != "detail")
            .map(|(k, v)| (k.as_str(), v)),
    );

    for (field, value) in fields {
        if let Some(message) = joined_messages(value) {
            return sentence(&format!("{}: {}", humanize_field(field), message));
        }
    }
    None
}

/// Join a string or list of strings into one fragment
fn joined_messages(value: &Value) -> Option<String> {
    let parts: Vec<String> = match value {
        Value::String(s) => vec![s.trim().to_string()],
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_str)
            .map(|s| s.trim().trim_end_matches(['.', '。']).to_string())
            .collect(),
        _ => return None,
    };
    let parts: Vec<String> = parts.into_iter().filter(|p| !p.is_empty()).collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("; "))
    }
}

fn humanize_field(field: &str) -> String {
    let spaced = field.replace('_', " ");
    let mut chars = spaced.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Capitalize and terminate a fragment so it reads as a sentence
fn sentence(text: &str) -> Option<String> {
    let trimmed = text.trim();
    let mut chars = trimmed.chars();
    let first = chars.next()?;
    let mut out: String = first.to_uppercase().chain(chars).collect();
    if !out.ends_with(['.', '!', '?', '。', '！', '？']) {
        out.push('.');
    }
    Some(out)
}
