use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Well-known error codes returned by the REST API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiErrorKind {
    QueryLimitExceeded,
    ExpiredToken,
    InvalidToken,
    MethodNotFound,
    AccessDenied,
    NotFound,
    InvalidRequest,
    UnresolvedReference,
    Internal,
    Other,
}

impl ApiErrorKind {
    /// Classify a raw server error code
    pub fn classify(code: &str) -> Self {
        match code.to_ascii_uppercase().as_str() {
            "QUERY_LIMIT_EXCEEDED" | "OPERATION_TIME_LIMIT" => ApiErrorKind::QueryLimitExceeded,
            "EXPIRED_TOKEN" => ApiErrorKind::ExpiredToken,
            "INVALID_TOKEN" | "NO_AUTH_FOUND" | "WRONG_AUTH_TYPE" => ApiErrorKind::InvalidToken,
            "ERROR_METHOD_NOT_FOUND" | "METHOD_NOT_FOUND" => ApiErrorKind::MethodNotFound,
            "ACCESS_DENIED" | "INSUFFICIENT_SCOPE" | "INVALID_CREDENTIALS" => {
                ApiErrorKind::AccessDenied
            }
            "NOT_FOUND" | "ERROR_NOT_FOUND" => ApiErrorKind::NotFound,
            "INVALID_REQUEST" | "ERROR_ARGUMENT" | "INVALID_ARG_VALUE" => {
                ApiErrorKind::InvalidRequest
            }
            "UNRESOLVED_REFERENCE" => ApiErrorKind::UnresolvedReference,
            "INTERNAL_SERVER_ERROR" | "ERROR_CORE" | "ERROR_UNEXPECTED_ANSWER" => {
                ApiErrorKind::Internal
            }
            _ => ApiErrorKind::Other,
        }
    }
}

impl fmt::Display for ApiErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ApiErrorKind::QueryLimitExceeded => "query_limit_exceeded",
            ApiErrorKind::ExpiredToken => "expired_token",
            ApiErrorKind::InvalidToken => "invalid_token",
            ApiErrorKind::MethodNotFound => "method_not_found",
            ApiErrorKind::AccessDenied => "access_denied",
            ApiErrorKind::NotFound => "not_found",
            ApiErrorKind::InvalidRequest => "invalid_request",
            ApiErrorKind::UnresolvedReference => "unresolved_reference",
            ApiErrorKind::Internal => "internal",
            ApiErrorKind::Other => "other",
        };
        write!(f, "{}", s)
    }
}

/// A business-logic rejection reported by the server.
///
/// These never surface as `Err` from a call; they travel inside a
/// [`crate::ResultEnvelope`] whose `is_success()` is false.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiError {
    pub kind: ApiErrorKind,
    /// Raw machine-readable code as sent by the server
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    /// Batch command name the error belongs to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        let code = code.into();
        ApiError {
            kind: ApiErrorKind::classify(&code),
            code,
            message: message.into(),
            status: None,
            command: None,
            data: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn unresolved_reference(target: &str) -> Self {
        Self::new(
            "UNRESOLVED_REFERENCE",
            format!("referenced command '{}' did not produce a result", target),
        )
    }

    /// Parse the error part of a response payload.
    ///
    /// Accepts both `{error: "CODE", error_description: "..."}` and
    /// `{error: {code, message}}`.
    pub fn from_payload(payload: &Value) -> Option<Self> {
        let error = payload.get("error")?;
        match error {
            Value::Null => None,
            Value::String(code) => {
                let message = payload
                    .get("error_description")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                Some(ApiError::new(code.as_str(), message))
            }
            Value::Object(obj) => {
                let code = obj
                    .get("code")
                    .map(|c| match c {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .unwrap_or_else(|| "UNKNOWN".to_string());
                let message = obj
                    .get("message")
                    .or_else(|| obj.get("description"))
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let mut err = ApiError::new(code, message);
                if let Some(data) = obj.get("validation") {
                    err = err.with_data(data.clone());
                }
                Some(err)
            }
            other => Some(ApiError::new(other.to_string(), "")),
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(command) = &self.command {
            write!(f, "[{}] ", command)?;
        }
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ApiError {}

/// Failures of the underlying HTTP or push channel
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("Request timed out")]
    Timeout,
    #[error("Invalid response (status {status}): {reason}")]
    InvalidResponse { status: u16, reason: String },
    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Errors that abort a call instead of travelling inside an envelope
#[derive(Debug, Error)]
pub enum B24Error {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("api error: {0}")]
    Api(ApiError),

    #[error("rate limit permit not acquired within {waited:?}")]
    RateLimitTimeout { waited: Duration },

    #[error("call cancelled")]
    Cancelled,

    #[error("decode error: {0}")]
    Decode(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("cursor for '{method}' did not advance past {last_id}")]
    CursorStalled { method: String, last_id: Value },
}

impl B24Error {
    pub fn configuration(message: impl Into<String>) -> Self {
        B24Error::Configuration(message.into())
    }

    /// True for failures where the request never reached the API
    pub fn is_transport(&self) -> bool {
        matches!(self, B24Error::Transport(_))
    }
}

impl From<ApiError> for B24Error {
    fn from(err: ApiError) -> Self {
        B24Error::Api(err)
    }
}

impl From<serde_json::Error> for B24Error {
    fn from(err: serde_json::Error) -> Self {
        B24Error::Decode(format!("JSON error: {}", err))
    }
}
