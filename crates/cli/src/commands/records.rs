//! One subcommand per record operation. Each prints the operation envelope.

use std::collections::BTreeMap;
use std::sync::Arc;

use clap::{Args, Subcommand};
use leadbridge_client::CrmClient;
use leadbridge_core::config::{AppConfig, LoadOptions};
use leadbridge_core::{PlaintextCredentialStore, TracingAuditSink, UuidCorrelationIds};
use leadbridge_service::{
    ConvertRecordInput, CreateRecordInput, DeleteRecordInput, GetRecordInput, ListRecordsInput,
    PlatformStatus, RecordService, SyncRecordInput, UpdateRecordInput, UpdateStatusInput,
};
use serde_json::Value;

use super::{CommandResult, EXIT_OPERATION_FAILURE};

#[derive(Debug, Subcommand)]
pub enum RecordCommand {
    #[command(about = "List records, optionally filtered by status or email")]
    ListRecords {
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        email: Option<String>,
        #[arg(long, help = "Page size (default 50, capped at 100)")]
        limit: Option<u32>,
        #[arg(long, help = "Cursor returned as nextCursor by a previous page")]
        cursor: Option<String>,
    },
    #[command(about = "Look up a record by email")]
    GetRecord {
        #[arg(long)]
        email: String,
    },
    #[command(about = "Create a record, merging into an existing one with the same email")]
    CreateRecord(ContactArgs),
    #[command(about = "Update fields on a record found by id or email")]
    UpdateRecord {
        #[arg(long)]
        record_id: Option<String>,
        #[arg(long)]
        email: Option<String>,
        #[arg(
            long = "field",
            value_name = "NAME=VALUE",
            value_parser = parse_field,
            help = "Field to set; VALUE is read as JSON when it parses, else as text"
        )]
        fields: Vec<(String, Value)>,
    },
    #[command(about = "Delete a record by id")]
    DeleteRecord {
        #[arg(long)]
        record_id: String,
    },
    #[command(about = "Apply a scheduling-platform status (scheduled converts the record)")]
    UpdateRecordStatus {
        #[arg(long, value_parser = parse_platform_status)]
        status: PlatformStatus,
        #[arg(long)]
        record_id: Option<String>,
        #[arg(long)]
        email: Option<String>,
    },
    #[command(about = "Update or create a record by email, then apply an optional status")]
    SyncRecord {
        #[command(flatten)]
        contact: ContactArgs,
        #[arg(long, value_parser = parse_platform_status)]
        platform_status: Option<PlatformStatus>,
    },
    #[command(about = "Convert a record, reconciling against the stored record on failure")]
    ConvertRecord {
        #[arg(long)]
        record_id: String,
    },
}

#[derive(Debug, Args)]
pub struct ContactArgs {
    #[arg(long)]
    email: String,
    #[arg(long)]
    last_name: String,
    #[arg(long)]
    first_name: Option<String>,
    #[arg(long)]
    phone: Option<String>,
    #[arg(long)]
    company: Option<String>,
    #[arg(long)]
    source: Option<String>,
}

impl RecordCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ListRecords { .. } => "list-records",
            Self::GetRecord { .. } => "get-record",
            Self::CreateRecord(_) => "create-record",
            Self::UpdateRecord { .. } => "update-record",
            Self::DeleteRecord { .. } => "delete-record",
            Self::UpdateRecordStatus { .. } => "update-record-status",
            Self::SyncRecord { .. } => "sync-record",
            Self::ConvertRecord { .. } => "convert-record",
        }
    }
}

pub async fn run(command: RecordCommand, options: LoadOptions) -> CommandResult {
    let name = command.name();
    let config = match AppConfig::load(options) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::config_failure(
                name,
                format!("config validation failed: {error}"),
            )
        }
    };
    crate::init_logging(&config.logging);

    let client = match CrmClient::from_config(&config, Arc::new(PlaintextCredentialStore)) {
        Ok(client) => client,
        Err(error) => {
            return CommandResult::failure(
                name,
                "client_init",
                error.to_string(),
                EXIT_OPERATION_FAILURE,
            )
        }
    };
    let service = RecordService::from_client(
        &client,
        Arc::new(TracingAuditSink),
        Arc::new(UuidCorrelationIds),
        config.service.operation_timeout(),
    );

    let envelope = match command {
        RecordCommand::ListRecords { status, email, limit, cursor } => {
            service.list_records(ListRecordsInput { status, email, limit, cursor }).await
        }
        RecordCommand::GetRecord { email } => service.get_record(GetRecordInput { email }).await,
        RecordCommand::CreateRecord(contact) => {
            service
                .create_record(CreateRecordInput {
                    email: contact.email,
                    last_name: contact.last_name,
                    first_name: contact.first_name,
                    phone: contact.phone,
                    company: contact.company,
                    source: contact.source,
                })
                .await
        }
        RecordCommand::UpdateRecord { record_id, email, fields } => {
            let fields: BTreeMap<String, Value> = fields.into_iter().collect();
            service.update_record(UpdateRecordInput { record_id, email, fields }).await
        }
        RecordCommand::DeleteRecord { record_id } => {
            service.delete_record(DeleteRecordInput { record_id }).await
        }
        RecordCommand::UpdateRecordStatus { status, record_id, email } => {
            service.update_record_status(UpdateStatusInput { status, record_id, email }).await
        }
        RecordCommand::SyncRecord { contact, platform_status } => {
            service
                .sync_record(SyncRecordInput {
                    email: contact.email,
                    last_name: contact.last_name,
                    first_name: contact.first_name,
                    phone: contact.phone,
                    company: contact.company,
                    source: contact.source,
                    platform_status,
                })
                .await
        }
        RecordCommand::ConvertRecord { record_id } => {
            service.convert_record(ConvertRecordInput { record_id }).await
        }
    };

    CommandResult::from_envelope(&envelope)
}

fn parse_platform_status(raw: &str) -> Result<PlatformStatus, String> {
    PlatformStatus::parse(raw).map_err(|error| error.to_string())
}

fn parse_field(raw: &str) -> Result<(String, Value), String> {
    let (name, value) =
        raw.split_once('=').ok_or_else(|| format!("`{raw}` must look like NAME=VALUE"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("`{raw}` has an empty field name"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((name.to_string(), value))
}
