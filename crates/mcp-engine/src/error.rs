use std::{borrow::Cow, fmt::Display, time::Duration};

use serde_json::json;

pub use crate::model::ErrorData;
use crate::model::ErrorCode;

impl Display for ErrorData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code.0, self.message)?;
        if let Some(data) = &self.data {
            write!(f, "({})", data)?;
        }
        Ok(())
    }
}

impl std::error::Error for ErrorData {}

/// Why an inbound transmission could not be decoded into a batch envelope.
#[derive(Debug, thiserror::Error)]
pub enum MalformedError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("batch must contain at least one item")]
    EmptyBatch,
    #[error("envelope must be a json object or array, got {0}")]
    NotAnEnvelope(&'static str),
}

impl MalformedError {
    pub fn to_error_data(&self) -> ErrorData {
        match self {
            MalformedError::Json(_) => ErrorData::parse_error(self.to_string(), None),
            _ => ErrorData::invalid_request(self.to_string(), None),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("missing session id")]
    MissingId,
    #[error("session {0} not found")]
    NotFound(String),
    #[error("session {0} is closed")]
    Closed(String),
    #[error("session is bound to a different principal")]
    PrincipalMismatch,
}

/// Transmission-level failures. Anything listed here rejects the whole envelope
/// before a single handler runs.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(#[from] MalformedError),
    #[error("unauthorized: {0}")]
    Unauthorized(#[from] SessionError),
    #[error("batch of {size} items exceeds the maximum of {max}")]
    AdmissionRejected { size: usize, max: usize },
    #[error("session is already initialized")]
    AlreadyInitialized,
    #[error("initialize failed: {0}")]
    InitializeFailed(ErrorData),
}

impl EngineError {
    pub fn to_error_data(&self) -> ErrorData {
        match self {
            EngineError::MalformedEnvelope(e) => e.to_error_data(),
            EngineError::Unauthorized(e) => {
                ErrorData::new(ErrorCode::UNAUTHORIZED, e.to_string(), None)
            }
            EngineError::AdmissionRejected { size, max } => ErrorData::new(
                ErrorCode::ADMISSION_REJECTED,
                self.to_string(),
                Some(json!({ "size": size, "max": max })),
            ),
            EngineError::AlreadyInitialized => ErrorData::invalid_request(self.to_string(), None),
            EngineError::InitializeFailed(error) => error.clone(),
        }
    }
}

/// Outcome of a server-initiated request that did not produce a result.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CorrelationError {
    #[error("request {method} timed out after {timeout:?}")]
    Timeout {
        method: &'static str,
        timeout: Duration,
    },
    #[error("request cancelled: {reason}")]
    Cancelled { reason: Cow<'static, str> },
    #[error("client rejected the request: {0}")]
    Rejected(ErrorData),
    #[error("client did not advertise the {0} capability")]
    CapabilityMissing(&'static str),
    #[error("server-initiated traffic is not available on stateless sessions")]
    Unsupported,
    #[error("outbound channel closed")]
    Delivery,
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
    #[error("failed to encode request params: {0}")]
    Encode(String),
}

impl CorrelationError {
    pub(crate) fn cancelled(reason: impl Into<Cow<'static, str>>) -> Self {
        CorrelationError::Cancelled {
            reason: reason.into(),
        }
    }
}

impl From<CorrelationError> for ErrorData {
    fn from(error: CorrelationError) -> Self {
        match error {
            CorrelationError::Timeout { .. } => {
                ErrorData::new(ErrorCode::REQUEST_TIMEOUT, error.to_string(), None)
            }
            CorrelationError::Cancelled { .. } => {
                ErrorData::new(ErrorCode::REQUEST_CANCELLED, error.to_string(), None)
            }
            CorrelationError::Rejected(error) => error,
            CorrelationError::CapabilityMissing(_) | CorrelationError::Unsupported => {
                ErrorData::invalid_request(error.to_string(), None)
            }
            CorrelationError::Delivery
            | CorrelationError::UnexpectedResponse(_)
            | CorrelationError::Encode(_) => {
                ErrorData::internal_error(error.to_string(), None)
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[cfg(feature = "transport-async-rw")]
    #[error("framing error: {0}")]
    Codec(#[from] tokio_util::codec::LinesCodecError),
    #[error("transport closed")]
    Closed,
}

#[derive(Debug, thiserror::Error)]
#[error("invalid value {value:?} for {key}")]
pub struct ConfigError {
    pub key: &'static str,
    pub value: String,
}
