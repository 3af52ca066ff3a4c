use serde::Serialize;
use thiserror::Error;

use crate::conversion::ConversionTransitionError;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CrmError {
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("remote call failed with status {status}: {body}")]
    Remote { status: u16, body: String },
    #[error("remote call did not complete: {0}")]
    Transport(String),
    #[error("unexpected {context} payload: {body}")]
    UnexpectedPayload { context: &'static str, body: String },
    #[error("conversion of record `{record_id}` could not be confirmed after {attempts} attempts: {last_failure}")]
    Conversion { record_id: String, attempts: u32, last_failure: String },
    #[error(transparent)]
    ConversionTransition(#[from] ConversionTransitionError),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("{operation} exceeded its time budget of {budget_ms}ms")]
    Timeout { operation: String, budget_ms: u64 },
}

pub type CrmResult<T> = Result<T, CrmError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Auth,
    Remote,
    Conversion,
    Validation,
    NotFound,
    Timeout,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Remote => "remote",
            Self::Conversion => "conversion",
            Self::Validation => "validation",
            Self::NotFound => "not_found",
            Self::Timeout => "timeout",
        }
    }
}

impl CrmError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Auth(_) => ErrorKind::Auth,
            Self::Remote { .. } | Self::Transport(_) | Self::UnexpectedPayload { .. } => {
                ErrorKind::Remote
            }
            Self::Conversion { .. } | Self::ConversionTransition(_) => ErrorKind::Conversion,
            Self::Validation(_) => ErrorKind::Validation,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Timeout { .. } => ErrorKind::Timeout,
        }
    }

    /// Whether re-running the whole operation later can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Remote { status, .. } => *status == 429 || *status >= 500,
            Self::Transport(_) | Self::Conversion { .. } | Self::Timeout { .. } => true,
            Self::Auth(_)
            | Self::UnexpectedPayload { .. }
            | Self::ConversionTransition(_)
            | Self::Validation(_)
            | Self::NotFound(_) => false,
        }
    }

    pub fn into_operation_error(self, correlation_id: impl Into<String>) -> OperationError {
        OperationError {
            kind: self.kind(),
            message: self.to_string(),
            retryable: self.is_retryable(),
            correlation_id: correlation_id.into(),
        }
    }
}

/// Caller-facing error carried inside the response envelope.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationError {
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
    #[serde(skip)]
    pub correlation_id: String,
}

impl OperationError {
    pub fn user_message(&self) -> &'static str {
        match self.kind {
            ErrorKind::Validation => "The request could not be processed. Check inputs and try again.",
            ErrorKind::NotFound => "No matching record was found.",
            ErrorKind::Auth => "The CRM rejected the configured credentials.",
            ErrorKind::Remote | ErrorKind::Timeout => {
                "The CRM is temporarily unavailable. Please retry shortly."
            }
            ErrorKind::Conversion => {
                "The conversion could not be confirmed. It is safe to retry the operation."
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::errors::{CrmError, ErrorKind};

    #[test]
    fn validation_error_maps_to_validation_kind_with_correlation_id() {
        let error = CrmError::Validation("email is required".to_owned()).into_operation_error("req-1");

        assert_eq!(error.kind, ErrorKind::Validation);
        assert_eq!(error.correlation_id, "req-1");
        assert!(!error.retryable);
        assert_eq!(
            error.user_message(),
            "The request could not be processed. Check inputs and try again."
        );
    }

    #[test]
    fn transport_and_payload_failures_surface_as_remote() {
        assert_eq!(CrmError::Transport("connection reset".to_owned()).kind(), ErrorKind::Remote);
        assert_eq!(
            CrmError::UnexpectedPayload { context: "duplicate conflict", body: "[]".to_owned() }
                .kind(),
            ErrorKind::Remote
        );
    }

    #[test]
    fn server_errors_are_retryable_but_client_errors_are_not() {
        let server = CrmError::Remote { status: 503, body: "unavailable".to_owned() };
        let client = CrmError::Remote { status: 400, body: "MALFORMED_QUERY".to_owned() };

        assert!(server.is_retryable());
        assert!(!client.is_retryable());
        assert!(!CrmError::Auth("invalid_grant".to_owned()).is_retryable());
    }

    #[test]
    fn conversion_error_is_retryable_because_conversion_is_idempotent() {
        let error = CrmError::Conversion {
            record_id: "00Q000000000001AAA".to_owned(),
            attempts: 3,
            last_failure: "ambiguous response".to_owned(),
        };

        assert!(error.is_retryable());
        assert_eq!(error.kind().as_str(), "conversion");
        assert!(error.to_string().contains("after 3 attempts"));
    }
}
