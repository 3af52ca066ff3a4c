//! Business operations over the CRM client. Every call gets its own
//! correlation id, runs under the operation budget, is mapped once into an
//! [`Envelope`] and is audited before it returns.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use leadbridge_client::{ConversionOrchestrator, CrmClient, RecordFilter, RecordStore};
use leadbridge_core::{
    AuditEntry, AuditSink, AuditStatus, CorrelationIdGenerator, CrmError, CrmResult, Email, Record,
    RecordFields, RecordId, RecordStatus, ALREADY_FINALIZED, CLOSED_NOT_CONVERTED,
};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::envelope::{Completion, Envelope};
use crate::inputs::{
    ConvertRecordInput, CreateRecordInput, DeleteRecordInput, GetRecordInput, ListRecordsInput,
    PlatformStatus, SyncRecordInput, UpdateRecordInput, UpdateStatusInput, DEFAULT_COMPANY,
    DEFAULT_LIST_LIMIT,
};

pub struct RecordService {
    store: Arc<dyn RecordStore>,
    orchestrator: Arc<ConversionOrchestrator>,
    audit: Arc<dyn AuditSink>,
    ids: Arc<dyn CorrelationIdGenerator>,
    operation_timeout: Duration,
}

impl RecordService {
    pub fn new(
        store: Arc<dyn RecordStore>,
        orchestrator: Arc<ConversionOrchestrator>,
        audit: Arc<dyn AuditSink>,
        ids: Arc<dyn CorrelationIdGenerator>,
        operation_timeout: Duration,
    ) -> Self {
        Self { store, orchestrator, audit, ids, operation_timeout }
    }

    pub fn from_client(
        client: &CrmClient,
        audit: Arc<dyn AuditSink>,
        ids: Arc<dyn CorrelationIdGenerator>,
        operation_timeout: Duration,
    ) -> Self {
        Self::new(
            Arc::clone(&client.records),
            Arc::clone(&client.orchestrator),
            audit,
            ids,
            operation_timeout,
        )
    }

    pub async fn list_records(&self, input: ListRecordsInput) -> Envelope {
        let inputs = audit_inputs(&input);
        self.execute("list_records", inputs, self.list_records_inner(input)).await
    }

    pub async fn get_record(&self, input: GetRecordInput) -> Envelope {
        let inputs = audit_inputs(&input);
        self.execute("get_record", inputs, self.get_record_inner(input)).await
    }

    pub async fn create_record(&self, input: CreateRecordInput) -> Envelope {
        let inputs = audit_inputs(&input);
        self.execute("create_record", inputs, self.create_record_inner(input)).await
    }

    pub async fn update_record(&self, input: UpdateRecordInput) -> Envelope {
        let inputs = audit_inputs(&input);
        self.execute("update_record", inputs, self.update_record_inner(input)).await
    }

    pub async fn delete_record(&self, input: DeleteRecordInput) -> Envelope {
        let inputs = audit_inputs(&input);
        self.execute("delete_record", inputs, self.delete_record_inner(input)).await
    }

    pub async fn update_record_status(&self, input: UpdateStatusInput) -> Envelope {
        let inputs = audit_inputs(&input);
        self.execute("update_record_status", inputs, self.update_status_inner(input)).await
    }

    pub async fn sync_record(&self, input: SyncRecordInput) -> Envelope {
        let inputs = audit_inputs(&input);
        self.execute("sync_record", inputs, self.sync_record_inner(input)).await
    }

    pub async fn convert_record(&self, input: ConvertRecordInput) -> Envelope {
        let inputs = audit_inputs(&input);
        self.execute("convert_record", inputs, self.convert_record_inner(input)).await
    }

    async fn execute<F>(&self, operation: &'static str, inputs: Value, work: F) -> Envelope
    where
        F: Future<Output = CrmResult<Completion>>,
    {
        let correlation_id = self.ids.next_id();
        info!(
            event_name = "operation.started",
            operation,
            correlation_id = %correlation_id,
            "operation started"
        );

        let result = match tokio::time::timeout(self.operation_timeout, work).await {
            Ok(result) => result,
            Err(_) => Err(CrmError::Timeout {
                operation: operation.to_string(),
                budget_ms: self.operation_timeout.as_millis() as u64,
            }),
        };

        match result {
            Ok(completion) => {
                let status = completion.audit_status();
                let data = completion.into_data();
                info!(
                    event_name = "operation.completed",
                    operation,
                    correlation_id = %correlation_id,
                    status = ?status,
                    "operation completed"
                );
                self.record_audit(operation, inputs, data.clone(), status, &correlation_id);
                Envelope::ok(data, correlation_id)
            }
            Err(error) => {
                warn!(
                    event_name = "operation.failed",
                    operation,
                    correlation_id = %correlation_id,
                    error_kind = error.kind().as_str(),
                    error = %error,
                    "operation failed"
                );
                let operation_error = error.into_operation_error(correlation_id.clone());
                let result = serde_json::to_value(&operation_error).unwrap_or(Value::Null);
                self.record_audit(operation, inputs, result, AuditStatus::Error, &correlation_id);
                Envelope::failed(operation_error)
            }
        }
    }

    fn record_audit(
        &self,
        operation: &str,
        inputs: Value,
        result: Value,
        status: AuditStatus,
        correlation_id: &str,
    ) {
        let entry = AuditEntry::new(operation, inputs, result, status, correlation_id);
        if let Err(error) = self.audit.emit(entry) {
            warn!(
                event_name = "audit.emit_failed",
                operation,
                correlation_id,
                error = %error,
                "audit sink rejected entry"
            );
        }
    }

    async fn list_records_inner(&self, input: ListRecordsInput) -> CrmResult<Completion> {
        let page = match input.cursor.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
            Some(cursor) => self.store.query_more(cursor).await?,
            None => {
                let mut filter = RecordFilter::new();
                if let Some(email) = input.email.as_deref() {
                    filter = filter.email_eq(&Email::parse(email)?);
                }
                if let Some(status) = input.status.as_deref().map(str::trim) {
                    if status.is_empty() {
                        return Err(CrmError::Validation("status must not be empty".to_string()));
                    }
                    filter = filter.status_eq(&RecordStatus::parse(status));
                }
                let limit = input.limit.unwrap_or(DEFAULT_LIST_LIMIT);
                self.store.query(&filter, limit).await?
            }
        };
        Ok(Completion::Done(serde_json::to_value(&page).unwrap_or(Value::Null)))
    }

    async fn get_record_inner(&self, input: GetRecordInput) -> CrmResult<Completion> {
        let email = Email::parse(&input.email)?;
        let record = self.store.find_by_email(&email).await?;
        Ok(Completion::Done(json!({ "record": record })))
    }

    async fn create_record_inner(&self, input: CreateRecordInput) -> CrmResult<Completion> {
        let email = Email::parse(&input.email)?;
        let fields = RecordFields {
            email: Some(email.as_str().to_string()),
            last_name: Some(input.last_name.trim().to_string()),
            first_name: input.first_name,
            phone: input.phone,
            company: Some(company_or_default(input.company)),
            status: Some(RecordStatus::Contacted),
            lead_source: input.source,
            ..RecordFields::default()
        };
        fields.validate_for_create()?;

        if let Some(existing) = self.store.find_by_email(&email).await? {
            if existing.is_converted {
                return Ok(Completion::Skipped(skipped(&existing.id, true)));
            }
            if existing.is_closed() {
                return Ok(Completion::Blocked(blocked(&existing.id)));
            }
            self.store.update(&existing.id, &fields).await?;
            return Ok(Completion::Done(json!({ "id": existing.id, "duplicate": true })));
        }

        let outcome = self.store.create(&fields).await?;
        if outcome.blocked {
            return Ok(Completion::Blocked(blocked(&outcome.id)));
        }
        let data = serde_json::to_value(&outcome).unwrap_or(Value::Null);
        if outcome.skipped {
            Ok(Completion::Skipped(data))
        } else {
            Ok(Completion::Done(data))
        }
    }

    async fn update_record_inner(&self, input: UpdateRecordInput) -> CrmResult<Completion> {
        let fields = RecordFields::from_map(input.fields)?;
        if fields.is_empty() {
            return Err(CrmError::Validation("at least one field is required".to_string()));
        }
        let record = self.locate(input.record_id.as_deref(), input.email.as_deref()).await?;
        if record.is_converted {
            return Ok(Completion::Skipped(skipped(&record.id, false)));
        }
        self.store.update(&record.id, &fields).await?;
        Ok(Completion::Done(json!({ "updated": true, "recordId": record.id })))
    }

    async fn delete_record_inner(&self, input: DeleteRecordInput) -> CrmResult<Completion> {
        let id = RecordId::parse(&input.record_id)?;
        self.store.delete(&id).await?;
        Ok(Completion::Done(json!({ "deleted": true, "recordId": id })))
    }

    async fn update_status_inner(&self, input: UpdateStatusInput) -> CrmResult<Completion> {
        let record = self.locate(input.record_id.as_deref(), input.email.as_deref()).await?;
        self.apply_status(&record, input.status).await
    }

    async fn sync_record_inner(&self, input: SyncRecordInput) -> CrmResult<Completion> {
        let email = Email::parse(&input.email)?;
        let mut fields = RecordFields {
            last_name: Some(input.last_name.trim().to_string()),
            first_name: input.first_name,
            phone: input.phone,
            company: Some(company_or_default(input.company)),
            lead_source: input.source,
            ..RecordFields::default()
        };
        fields.validate_for_create()?;

        let (record_id, action) = match self.store.find_by_email(&email).await? {
            Some(existing) if existing.is_converted => {
                return Ok(Completion::Skipped(skipped(&existing.id, false)));
            }
            Some(existing) if existing.is_closed() => {
                return Ok(Completion::Blocked(blocked(&existing.id)));
            }
            Some(existing) => {
                self.store.update(&existing.id, &fields).await?;
                (existing.id, "updated")
            }
            None => {
                fields.email = Some(email.as_str().to_string());
                fields.status = Some(RecordStatus::Contacted);
                let outcome = self.store.create(&fields).await?;
                if outcome.blocked {
                    return Ok(Completion::Blocked(blocked(&outcome.id)));
                }
                if outcome.skipped {
                    let data = serde_json::to_value(&outcome).unwrap_or(Value::Null);
                    return Ok(Completion::Skipped(data));
                }
                let action = if outcome.duplicate { "updated" } else { "created" };
                (outcome.id, action)
            }
        };

        let mut data = json!({ "recordId": record_id, "synced": true, "action": action });
        if let Some(status) = input.platform_status {
            let record = self
                .store
                .get(&record_id)
                .await?
                .ok_or_else(|| CrmError::NotFound(format!("record `{record_id}`")))?;
            let applied = self.apply_status(&record, status).await?;
            data["statusUpdate"] = applied.into_data();
        }
        Ok(Completion::Done(data))
    }

    async fn convert_record_inner(&self, input: ConvertRecordInput) -> CrmResult<Completion> {
        let id = RecordId::parse(&input.record_id)?;
        let outcome = self.orchestrator.convert(&id).await?;
        Ok(Completion::Done(serde_json::to_value(&outcome).unwrap_or(Value::Null)))
    }

    async fn apply_status(&self, record: &Record, status: PlatformStatus) -> CrmResult<Completion> {
        if record.is_closed() {
            return Ok(Completion::Blocked(blocked(&record.id)));
        }
        match status {
            PlatformStatus::Scheduled => {
                let outcome = self.orchestrator.convert(&record.id).await?;
                Ok(Completion::Done(json!({
                    "recordId": record.id,
                    "status": "Converted",
                    "conversion": outcome,
                })))
            }
            PlatformStatus::Objected => {
                if record.is_converted {
                    return Ok(Completion::Skipped(skipped(&record.id, false)));
                }
                let fields = RecordFields {
                    status: Some(RecordStatus::NotConverted),
                    ..RecordFields::default()
                };
                self.store.update(&record.id, &fields).await?;
                Ok(Completion::Done(json!({
                    "recordId": record.id,
                    "status": RecordStatus::NotConverted.as_str(),
                })))
            }
        }
    }

    async fn locate(&self, record_id: Option<&str>, email: Option<&str>) -> CrmResult<Record> {
        let record_id = record_id.map(str::trim).filter(|value| !value.is_empty());
        let email = email.map(str::trim).filter(|value| !value.is_empty());
        match (record_id, email) {
            (Some(raw_id), _) => {
                let id = RecordId::parse(raw_id)?;
                self.store
                    .get(&id)
                    .await?
                    .ok_or_else(|| CrmError::NotFound(format!("record `{id}`")))
            }
            (None, Some(raw_email)) => {
                let email = Email::parse(raw_email)?;
                self.store
                    .find_by_email(&email)
                    .await?
                    .ok_or_else(|| CrmError::NotFound(format!("record with email `{email}`")))
            }
            (None, None) => Err(CrmError::Validation("recordId or email is required".to_string())),
        }
    }
}

fn audit_inputs<T: serde::Serialize>(input: &T) -> Value {
    serde_json::to_value(input).unwrap_or(Value::Null)
}

fn company_or_default(company: Option<String>) -> String {
    company
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_COMPANY.to_string())
}

fn skipped(id: &RecordId, duplicate: bool) -> Value {
    let mut data = json!({ "recordId": id, "skipped": true, "reason": ALREADY_FINALIZED });
    if duplicate {
        data["id"] = json!(id);
        data["duplicate"] = json!(true);
    }
    data
}

fn blocked(id: &RecordId) -> Value {
    json!({ "recordId": id, "blocked": true, "reason": CLOSED_NOT_CONVERTED })
}
