use leadbridge_core::{AuditStatus, OperationError};
use serde::Serialize;
use serde_json::Value;

/// Uniform result of every business operation.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<OperationError>,
    pub correlation_id: String,
}

impl Envelope {
    pub fn ok(data: Value, correlation_id: impl Into<String>) -> Self {
        Self { success: true, data: Some(data), error: None, correlation_id: correlation_id.into() }
    }

    pub fn failed(error: OperationError) -> Self {
        let correlation_id = error.correlation_id.clone();
        Self { success: false, data: None, error: Some(error), correlation_id }
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// How a successful operation ended; decides the audit status.
#[derive(Clone, Debug, PartialEq)]
pub enum Completion {
    Done(Value),
    Skipped(Value),
    Blocked(Value),
}

impl Completion {
    pub fn audit_status(&self) -> AuditStatus {
        match self {
            Self::Done(_) => AuditStatus::Success,
            Self::Skipped(_) => AuditStatus::Skipped,
            Self::Blocked(_) => AuditStatus::Blocked,
        }
    }

    pub fn into_data(self) -> Value {
        match self {
            Self::Done(data) | Self::Skipped(data) | Self::Blocked(data) => data,
        }
    }
}
