use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    Success,
    Skipped,
    Blocked,
    Error,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub entry_id: String,
    pub operation: String,
    pub inputs: Value,
    pub result: Value,
    pub status: AuditStatus,
    pub correlation_id: String,
    pub occurred_at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(
        operation: impl Into<String>,
        inputs: Value,
        result: Value,
        status: AuditStatus,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self {
            entry_id: Uuid::new_v4().to_string(),
            operation: operation.into(),
            inputs,
            result,
            status,
            correlation_id: correlation_id.into(),
            occurred_at: Utc::now(),
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("audit sink failure: {0}")]
pub struct AuditError(pub String);

/// Receives one entry per business operation. Callers treat failures as
/// non-fatal.
pub trait AuditSink: Send + Sync {
    fn emit(&self, entry: AuditEntry) -> Result<(), AuditError>;
}

#[derive(Clone, Default)]
pub struct InMemoryAuditSink {
    entries: Arc<Mutex<Vec<AuditEntry>>>,
}

impl InMemoryAuditSink {
    pub fn entries(&self) -> Vec<AuditEntry> {
        match self.entries.lock() {
            Ok(entries) => entries.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl AuditSink for InMemoryAuditSink {
    fn emit(&self, entry: AuditEntry) -> Result<(), AuditError> {
        match self.entries.lock() {
            Ok(mut entries) => entries.push(entry),
            Err(poisoned) => poisoned.into_inner().push(entry),
        }
        Ok(())
    }
}

/// Writes each entry as a single JSON line on the `audit` tracing target.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn emit(&self, entry: AuditEntry) -> Result<(), AuditError> {
        let line =
            serde_json::to_string(&entry).map_err(|error| AuditError(error.to_string()))?;
        tracing::info!(
            target: "audit",
            event_name = "audit.entry",
            correlation_id = %entry.correlation_id,
            operation = %entry.operation,
            "{line}"
        );
        Ok(())
    }
}
