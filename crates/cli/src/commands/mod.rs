pub mod config;
pub mod doctor;
pub mod records;

use leadbridge_service::Envelope;
use serde::Serialize;

pub const EXIT_OPERATION_FAILURE: u8 = 1;
pub const EXIT_CONFIG_FAILURE: u8 = 2;

#[derive(Debug, Clone)]
pub struct CommandResult {
    pub exit_code: u8,
    pub output: String,
}

#[derive(Debug, Serialize)]
struct CommandOutcome {
    command: String,
    status: String,
    error_class: Option<String>,
    message: String,
}

impl CommandResult {
    pub fn failure(
        command: &str,
        error_class: &str,
        message: impl Into<String>,
        exit_code: u8,
    ) -> Self {
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "error".to_string(),
            error_class: Some(error_class.to_string()),
            message: message.into(),
        };
        Self { exit_code, output: serialize_payload(payload) }
    }

    pub fn config_failure(command: &str, message: impl Into<String>) -> Self {
        Self::failure(command, "config_validation", message, EXIT_CONFIG_FAILURE)
    }

    /// Prints the operation envelope as-is; a failed envelope exits with 1.
    pub fn from_envelope(envelope: &Envelope) -> Self {
        let exit_code = if envelope.success { 0 } else { EXIT_OPERATION_FAILURE };
        let output = serde_json::to_string_pretty(&envelope.to_json())
            .unwrap_or_else(|error| format!("{{\"success\":false,\"error\":\"{error}\"}}"));
        Self { exit_code, output }
    }
}

fn serialize_payload(payload: CommandOutcome) -> String {
    serde_json::to_string(&payload).unwrap_or_else(|error| {
        format!(
            "{{\"command\":\"unknown\",\"status\":\"error\",\"error_class\":\"serialization\",\"message\":\"{}\"}}",
            error.to_string().replace('\\', "\\\\").replace('"', "\\\"")
        )
    })
}
