pub mod record;

pub use record::{
    Email, Record, RecordFields, RecordId, RecordStatus, ALREADY_FINALIZED, CLOSED_NOT_CONVERTED,
    RECORD_FIELDS,
};
