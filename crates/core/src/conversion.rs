use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::RecordId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConversionState {
    NotConverted,
    Converting,
    Converted,
    Failed,
}

impl ConversionState {
    pub fn initial(is_converted: bool) -> Self {
        if is_converted {
            Self::Converted
        } else {
            Self::NotConverted
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Converted | Self::Failed)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConversionEvent {
    AttemptStarted,
    AttemptFailed,
    RpcConfirmed,
    ReconciledConverted,
    AttemptsExhausted,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ConversionTransitionError {
    #[error("invalid conversion transition from {state:?} using event {event:?}")]
    InvalidTransition { state: ConversionState, event: ConversionEvent },
}

pub fn transition(
    current: ConversionState,
    event: ConversionEvent,
) -> Result<ConversionState, ConversionTransitionError> {
    use ConversionEvent::{
        AttemptFailed, AttemptStarted, AttemptsExhausted, ReconciledConverted, RpcConfirmed,
    };
    use ConversionState::{Converted, Converting, Failed, NotConverted};

    match (current, event) {
        (NotConverted, AttemptStarted) | (Converting, AttemptStarted) => Ok(Converting),
        (Converting, AttemptFailed) => Ok(Converting),
        (Converting, RpcConfirmed) | (Converting, ReconciledConverted) => Ok(Converted),
        (Converting, AttemptsExhausted) => Ok(Failed),
        (state, event) => Err(ConversionTransitionError::InvalidTransition { state, event }),
    }
}

/// Terminal result of driving a record through conversion.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionOutcome {
    pub record_id: RecordId,
    pub status: ConversionState,
    /// True when the record was found already converted, either before any
    /// RPC or during reconciliation.
    pub idempotent: bool,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact_id: Option<String>,
}
