pub mod audit;
pub mod collaborators;
pub mod config;
pub mod conversion;
pub mod domain;
pub mod errors;

pub use audit::{
    AuditEntry, AuditError, AuditSink, AuditStatus, InMemoryAuditSink, TracingAuditSink,
};
pub use collaborators::{
    CorrelationIdGenerator, CredentialStore, PlaintextCredentialStore, UuidCorrelationIds,
};
pub use config::{AppConfig, ConfigError, ConfigOverrides, LoadOptions, LogFormat};
pub use conversion::{transition, ConversionEvent, ConversionOutcome, ConversionState};
pub use domain::{
    Email, Record, RecordFields, RecordId, RecordStatus, ALREADY_FINALIZED, CLOSED_NOT_CONVERTED,
    RECORD_FIELDS,
};
pub use errors::{CrmError, CrmResult, ErrorKind, OperationError};
