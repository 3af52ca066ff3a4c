pub mod envelope;
pub mod inputs;
pub mod service;

pub use envelope::{Completion, Envelope};
pub use inputs::{
    ConvertRecordInput, CreateRecordInput, DeleteRecordInput, GetRecordInput, ListRecordsInput,
    PlatformStatus, SyncRecordInput, UpdateRecordInput, UpdateStatusInput,
};
pub use service::RecordService;
