use std::sync::Arc;

use async_trait::async_trait;
use leadbridge_core::{
    CrmError, CrmResult, Email, Record, RecordFields, RecordId, ALREADY_FINALIZED,
    CLOSED_NOT_CONVERTED, RECORD_FIELDS,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::dispatch::{ApiRequest, RequestDispatcher};
use crate::soql::{select_statement, RecordFilter};

const DUPLICATES_DETECTED: &str = "DUPLICATES_DETECTED";
const SOBJECT_PATH: &str = "sobjects/Lead";

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryPage {
    pub records: Vec<Record>,
    pub next_cursor: Option<String>,
    pub total_size: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOutcome {
    pub id: RecordId,
    pub duplicate: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub skipped: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub blocked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl CreateOutcome {
    pub fn created(id: RecordId) -> Self {
        Self { id, duplicate: false, skipped: false, blocked: false, reason: None }
    }

    pub fn merged(id: RecordId) -> Self {
        Self { id, duplicate: true, skipped: false, blocked: false, reason: None }
    }

    pub fn finalized(id: RecordId) -> Self {
        Self {
            id,
            duplicate: true,
            skipped: true,
            blocked: false,
            reason: Some(ALREADY_FINALIZED.to_string()),
        }
    }

    /// The duplicate is closed as not converted; nothing was written.
    pub fn blocked(id: RecordId) -> Self {
        Self {
            id,
            duplicate: true,
            skipped: false,
            blocked: true,
            reason: Some(CLOSED_NOT_CONVERTED.to_string()),
        }
    }
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn query(&self, filter: &RecordFilter, limit: u32) -> CrmResult<QueryPage>;
    async fn query_more(&self, cursor: &str) -> CrmResult<QueryPage>;
    async fn find_by_email(&self, email: &Email) -> CrmResult<Option<Record>>;
    async fn get(&self, id: &RecordId) -> CrmResult<Option<Record>>;
    async fn create(&self, fields: &RecordFields) -> CrmResult<CreateOutcome>;
    async fn update(&self, id: &RecordId, fields: &RecordFields) -> CrmResult<()>;
    async fn delete(&self, id: &RecordId) -> CrmResult<()>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    #[serde(default)]
    total_size: u64,
    #[serde(default)]
    records: Vec<Record>,
    #[serde(default)]
    next_records_url: Option<String>,
}

impl From<QueryResponse> for QueryPage {
    fn from(response: QueryResponse) -> Self {
        Self {
            records: response.records,
            next_cursor: response.next_records_url,
            total_size: response.total_size,
        }
    }
}

/// Record store backed by the REST surface.
pub struct RestRecordRepository {
    dispatcher: Arc<RequestDispatcher>,
}

impl RestRecordRepository {
    pub fn new(dispatcher: Arc<RequestDispatcher>) -> Self {
        Self { dispatcher }
    }

    fn record_path(&self, id: &RecordId) -> String {
        self.dispatcher.data_path(&format!("{SOBJECT_PATH}/{}", id.as_str()))
    }

    async fn fetch_page(&self, request: ApiRequest) -> CrmResult<QueryPage> {
        let body = self.dispatcher.dispatch(&request).await?.ok_or_else(|| {
            CrmError::UnexpectedPayload { context: "query", body: String::new() }
        })?;
        let response: QueryResponse = serde_json::from_value(body.clone()).map_err(|_| {
            CrmError::UnexpectedPayload { context: "query", body: body.to_string() }
        })?;
        Ok(response.into())
    }

    async fn resolve_duplicate(
        &self,
        conflict_body: &str,
        fields: &RecordFields,
    ) -> CrmResult<CreateOutcome> {
        let existing = duplicate_record_id(conflict_body)?;
        match self.get(&existing).await? {
            Some(record) if record.is_converted => {
                info!(
                    event_name = "record.create.duplicate_finalized",
                    record_id = %existing,
                    "duplicate matches a converted record; skipping write"
                );
                Ok(CreateOutcome::finalized(existing))
            }
            Some(record) if record.is_closed() => {
                info!(
                    event_name = "record.create.duplicate_closed",
                    record_id = %existing,
                    "duplicate matches a closed record; skipping write"
                );
                Ok(CreateOutcome::blocked(existing))
            }
            _ => {
                self.update(&existing, fields).await?;
                info!(
                    event_name = "record.create.duplicate_merged",
                    record_id = %existing,
                    "duplicate detected; applied fields to existing record"
                );
                Ok(CreateOutcome::merged(existing))
            }
        }
    }
}

#[async_trait]
impl RecordStore for RestRecordRepository {
    async fn query(&self, filter: &RecordFilter, limit: u32) -> CrmResult<QueryPage> {
        let statement = select_statement(filter, limit);
        let request =
            ApiRequest::get(self.dispatcher.data_path("query")).with_query("q", statement);
        self.fetch_page(request).await
    }

    async fn query_more(&self, cursor: &str) -> CrmResult<QueryPage> {
        let prefix = self.dispatcher.data_path("query/");
        let locator = cursor.strip_prefix(prefix.as_str()).unwrap_or_default();
        if locator.is_empty() || !locator.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(CrmError::Validation(format!("`{cursor}` is not a query cursor")));
        }
        self.fetch_page(ApiRequest::get(cursor)).await
    }

    async fn find_by_email(&self, email: &Email) -> CrmResult<Option<Record>> {
        let page = self.query(&RecordFilter::new().email_eq(email), 1).await?;
        Ok(page.records.into_iter().next())
    }

    async fn get(&self, id: &RecordId) -> CrmResult<Option<Record>> {
        let request =
            ApiRequest::get(self.record_path(id)).with_query("fields", RECORD_FIELDS.join(","));
        let response = self.dispatcher.send(&request).await?;
        if response.status == 404 {
            return Ok(None);
        }
        if !response.is_success() {
            return Err(response.into_remote_error());
        }
        let body = response.body.clone();
        let value = response
            .json()?
            .ok_or(CrmError::UnexpectedPayload { context: "record", body: String::new() })?;
        serde_json::from_value(value)
            .map(Some)
            .map_err(|_| CrmError::UnexpectedPayload { context: "record", body })
    }

    async fn create(&self, fields: &RecordFields) -> CrmResult<CreateOutcome> {
        let path = self.dispatcher.data_path(&format!("{SOBJECT_PATH}/"));
        let request = ApiRequest::post(path, fields.to_json());
        let response = self.dispatcher.send(&request).await?;

        if response.status == 400 && response.body.contains(DUPLICATES_DETECTED) {
            warn!(event_name = "record.create.duplicate", "remote reported a duplicate record");
            return self.resolve_duplicate(&response.body, fields).await;
        }
        if !response.is_success() {
            return Err(response.into_remote_error());
        }

        let from_body = response
            .json()
            .ok()
            .flatten()
            .and_then(|body| body.get("id").and_then(Value::as_str).map(str::to_string));
        let from_location = response
            .location
            .as_deref()
            .and_then(|location| location.trim_end_matches('/').rsplit('/').next())
            .map(str::to_string);
        let raw_id = from_body.or(from_location).ok_or_else(|| CrmError::UnexpectedPayload {
            context: "create response",
            body: response.body.clone(),
        })?;
        let id = RecordId::parse(&raw_id).map_err(|_| CrmError::UnexpectedPayload {
            context: "create response",
            body: response.body.clone(),
        })?;

        info!(event_name = "record.created", record_id = %id, "record created");
        Ok(CreateOutcome::created(id))
    }

    async fn update(&self, id: &RecordId, fields: &RecordFields) -> CrmResult<()> {
        let request = ApiRequest::patch(self.record_path(id), fields.to_json());
        self.dispatcher.dispatch(&request).await?;
        info!(event_name = "record.updated", record_id = %id, "record updated");
        Ok(())
    }

    async fn delete(&self, id: &RecordId) -> CrmResult<()> {
        self.dispatcher.dispatch(&ApiRequest::delete(self.record_path(id))).await?;
        info!(event_name = "record.deleted", record_id = %id, "record deleted");
        Ok(())
    }
}

/// Extracts the id of the matching record from a duplicate-rule conflict:
/// `[{errorCode, duplicateResult: {matchResults: [{matchRecords: [{record: {Id}}]}]}}]`.
pub fn duplicate_record_id(body: &str) -> CrmResult<RecordId> {
    let unexpected =
        || CrmError::UnexpectedPayload { context: "duplicate conflict", body: body.to_string() };

    let payload: Value = serde_json::from_str(body).map_err(|_| unexpected())?;
    let errors = payload.as_array().ok_or_else(unexpected)?;
    let conflict = errors
        .iter()
        .find(|error| error.get("errorCode").and_then(Value::as_str) == Some(DUPLICATES_DETECTED))
        .ok_or_else(unexpected)?;

    let raw_id = conflict
        .get("duplicateResult")
        .and_then(|result| result.get("matchResults"))
        .and_then(Value::as_array)
        .and_then(|results| results.first())
        .and_then(|result| result.get("matchRecords"))
        .and_then(Value::as_array)
        .and_then(|records| records.first())
        .and_then(|record| record.get("record"))
        .and_then(|record| record.get("Id"))
        .and_then(Value::as_str)
        .ok_or_else(unexpected)?;

    RecordId::parse(raw_id).map_err(|_| unexpected())
}
