use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use leadbridge_core::{CrmError, CrmResult, Email, Record, RecordFields, RecordId};
use tokio::sync::RwLock;

use crate::repository::{CreateOutcome, QueryPage, RecordStore};
use crate::soql::{RecordFilter, MAX_QUERY_LIMIT};

#[derive(Default)]
struct StoreState {
    records: BTreeMap<String, Record>,
    next_sequence: u64,
}

/// Process-local record store. With duplicate rules enabled, `create` treats
/// an existing email as a duplicate-detection conflict the way the remote
/// does when a matching rule is active.
#[derive(Default)]
pub struct InMemoryRecordStore {
    state: RwLock<StoreState>,
    duplicate_rules: bool,
    writes: AtomicUsize,
}

impl InMemoryRecordStore {
    pub fn with_duplicate_rules() -> Self {
        Self { duplicate_rules: true, ..Self::default() }
    }

    pub async fn insert(&self, record: Record) {
        let mut state = self.state.write().await;
        state.records.insert(record.id.0.clone(), record);
    }

    pub async fn set_converted(&self, id: &RecordId, converted: bool) {
        let mut state = self.state.write().await;
        if let Some(record) = state.records.get_mut(id.as_str()) {
            record.is_converted = converted;
        }
    }

    pub async fn record(&self, id: &RecordId) -> Option<Record> {
        self.state.read().await.records.get(id.as_str()).cloned()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.records.len()
    }

    /// Creates, updates and deletes applied so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn apply(record: &mut Record, fields: &RecordFields) {
        if let Some(email) = fields.email.as_ref() {
            record.email = Some(email.clone());
        }
        if let Some(last_name) = fields.last_name.as_ref() {
            record.last_name = Some(last_name.clone());
        }
        if let Some(first_name) = fields.first_name.as_ref() {
            record.first_name = Some(first_name.clone());
        }
        if let Some(phone) = fields.phone.as_ref() {
            record.phone = Some(phone.clone());
        }
        if let Some(company) = fields.company.as_ref() {
            record.company = Some(company.clone());
        }
        if let Some(status) = fields.status.as_ref() {
            record.status = Some(status.clone());
        }
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn query(&self, filter: &RecordFilter, limit: u32) -> CrmResult<QueryPage> {
        let limit = limit.clamp(1, MAX_QUERY_LIMIT) as usize;
        let state = self.state.read().await;
        let records: Vec<Record> = state
            .records
            .values()
            .filter(|record| filter.matches(record))
            .take(limit)
            .cloned()
            .collect();
        let total_size = records.len() as u64;
        Ok(QueryPage { records, next_cursor: None, total_size })
    }

    async fn query_more(&self, cursor: &str) -> CrmResult<QueryPage> {
        Err(CrmError::Validation(format!("`{cursor}` is not a query cursor")))
    }

    async fn find_by_email(&self, email: &Email) -> CrmResult<Option<Record>> {
        let page = self.query(&RecordFilter::new().email_eq(email), 1).await?;
        Ok(page.records.into_iter().next())
    }

    async fn get(&self, id: &RecordId) -> CrmResult<Option<Record>> {
        Ok(self.record(id).await)
    }

    async fn create(&self, fields: &RecordFields) -> CrmResult<CreateOutcome> {
        let mut state = self.state.write().await;

        if self.duplicate_rules {
            let existing = fields.email.as_deref().and_then(|email| {
                state.records.values_mut().find(|record| record.email.as_deref() == Some(email))
            });
            if let Some(record) = existing {
                if record.is_converted {
                    return Ok(CreateOutcome::finalized(record.id.clone()));
                }
                if record.is_closed() {
                    return Ok(CreateOutcome::blocked(record.id.clone()));
                }
                Self::apply(record, fields);
                self.writes.fetch_add(1, Ordering::SeqCst);
                return Ok(CreateOutcome::merged(record.id.clone()));
            }
        }

        state.next_sequence += 1;
        let id = RecordId(format!("00Q{:015}", state.next_sequence));
        let mut record = Record {
            id: id.clone(),
            email: None,
            first_name: None,
            last_name: None,
            phone: None,
            company: None,
            status: None,
            is_converted: false,
        };
        Self::apply(&mut record, fields);
        state.records.insert(id.0.clone(), record);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(CreateOutcome::created(id))
    }

    async fn update(&self, id: &RecordId, fields: &RecordFields) -> CrmResult<()> {
        let mut state = self.state.write().await;
        let record = state.records.get_mut(id.as_str()).ok_or_else(|| CrmError::Remote {
            status: 404,
            body: format!(r#"[{{"errorCode":"NOT_FOUND","message":"{id}"}}]"#),
        })?;
        Self::apply(record, fields);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self, id: &RecordId) -> CrmResult<()> {
        let mut state = self.state.write().await;
        if state.records.remove(id.as_str()).is_none() {
            return Err(CrmError::Remote {
                status: 404,
                body: format!(r#"[{{"errorCode":"ENTITY_IS_DELETED","message":"{id}"}}]"#),
            });
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
