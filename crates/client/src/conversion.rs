use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use leadbridge_core::config::ConversionConfig;
use leadbridge_core::{
    transition, ConversionEvent, ConversionOutcome, ConversionState, CrmError, CrmResult, RecordId,
};
use tracing::{info, warn};

use crate::repository::RecordStore;
use crate::soap::{ConversionTransport, ConvertResponse};

#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Returns immediately and remembers every requested wait.
#[derive(Clone, Debug, Default)]
pub struct RecordingSleeper {
    waits: Arc<Mutex<Vec<Duration>>>,
}

impl RecordingSleeper {
    pub fn waits(&self) -> Vec<Duration> {
        match self.waits.lock() {
            Ok(waits) => waits.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        match self.waits.lock() {
            Ok(mut waits) => waits.push(duration),
            Err(poisoned) => poisoned.into_inner().push(duration),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_unit: Duration,
    /// Limit on the attempts and their backoff together. Reconciliation
    /// always runs once it is spent.
    pub attempt_budget: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_unit: Duration::from_secs(1),
            attempt_budget: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &ConversionConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff_unit: config.backoff_unit(),
            attempt_budget: config.attempt_budget(),
        }
    }

    /// Wait after the failed attempt with zero-based `attempt_index`:
    /// `backoff_unit * 2^attempt_index`.
    pub fn delay_for(&self, attempt_index: u32) -> Duration {
        self.backoff_unit.saturating_mul(2u32.saturating_pow(attempt_index))
    }
}

/// Drives a record to the converted state through the unreliable RPC,
/// treating the fetched record as the source of truth.
pub struct ConversionOrchestrator {
    store: Arc<dyn RecordStore>,
    transport: Arc<dyn ConversionTransport>,
    sleeper: Arc<dyn Sleeper>,
    policy: RetryPolicy,
}

impl ConversionOrchestrator {
    pub fn new(
        store: Arc<dyn RecordStore>,
        transport: Arc<dyn ConversionTransport>,
        sleeper: Arc<dyn Sleeper>,
        policy: RetryPolicy,
    ) -> Self {
        Self { store, transport, sleeper, policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub async fn convert(&self, record_id: &RecordId) -> CrmResult<ConversionOutcome> {
        let record = self
            .store
            .get(record_id)
            .await?
            .ok_or_else(|| CrmError::NotFound(format!("record `{record_id}`")))?;

        let mut state = ConversionState::initial(record.is_converted);
        if state == ConversionState::Converted {
            info!(
                event_name = "conversion.already_converted",
                record_id = %record_id,
                "record already converted; no RPC issued"
            );
            return Ok(outcome(record_id, state, true, 0, None, None));
        }

        state = self.advance(record_id, state, ConversionEvent::AttemptStarted)?;
        let mut progress = AttemptProgress::default();
        let running = self.attempt(record_id, &mut state, &mut progress);
        let finished = tokio::time::timeout(self.policy.attempt_budget, running).await;
        match finished {
            Ok(Ok(Some(outcome))) => return Ok(outcome),
            Ok(Ok(None)) => {}
            Ok(Err(error)) => return Err(error),
            Err(_) => {
                warn!(
                    event_name = "conversion.budget_exhausted",
                    record_id = %record_id,
                    attempts = progress.attempts,
                    budget_ms = self.policy.attempt_budget.as_millis() as u64,
                    "attempt budget spent; reconciling"
                );
                progress.last_failure = format!(
                    "{}; attempt budget of {}ms exhausted",
                    progress.last_failure,
                    self.policy.attempt_budget.as_millis()
                );
            }
        }

        let AttemptProgress { attempts, mut last_failure } = progress;
        let reconciled = match self.store.get(record_id).await {
            Ok(record) => record.map(|record| record.is_converted).unwrap_or(false),
            Err(error @ CrmError::Auth(_)) => return Err(error),
            Err(error) => {
                last_failure = format!("{last_failure}; reconciliation failed: {error}");
                false
            }
        };

        if reconciled {
            state = self.advance(record_id, state, ConversionEvent::ReconciledConverted)?;
            info!(
                event_name = "conversion.reconciled",
                record_id = %record_id,
                attempts,
                "record found converted during reconciliation"
            );
            return Ok(outcome(record_id, state, true, attempts, None, None));
        }

        self.advance(record_id, state, ConversionEvent::AttemptsExhausted)?;
        Err(CrmError::Conversion { record_id: record_id.to_string(), attempts, last_failure })
    }

    /// Runs the RPC attempts with backoff. `None` means none was confirmed.
    async fn attempt(
        &self,
        record_id: &RecordId,
        state: &mut ConversionState,
        progress: &mut AttemptProgress,
    ) -> CrmResult<Option<ConversionOutcome>> {
        for attempt_index in 0..self.policy.max_attempts {
            let attempt = attempt_index + 1;
            progress.attempts = attempt;
            *state = self.advance(record_id, *state, ConversionEvent::AttemptStarted)?;

            match self.transport.convert(record_id).await {
                Ok(ConvertResponse::Success { account_id, contact_id }) => {
                    *state = self.advance(record_id, *state, ConversionEvent::RpcConfirmed)?;
                    info!(
                        event_name = "conversion.confirmed",
                        record_id = %record_id,
                        attempt,
                        "conversion confirmed by RPC"
                    );
                    return Ok(Some(outcome(
                        record_id, *state, false, attempt, account_id, contact_id,
                    )));
                }
                Ok(response) => progress.last_failure = response.describe(),
                Err(error @ CrmError::Auth(_)) => return Err(error),
                Err(error) => progress.last_failure = error.to_string(),
            }

            *state = self.advance(record_id, *state, ConversionEvent::AttemptFailed)?;
            let delay = self.policy.delay_for(attempt_index);
            warn!(
                event_name = "conversion.attempt_failed",
                record_id = %record_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                failure = %progress.last_failure,
                "conversion attempt failed"
            );
            self.sleeper.sleep(delay).await;
        }
        Ok(None)
    }

    fn advance(
        &self,
        record_id: &RecordId,
        state: ConversionState,
        event: ConversionEvent,
    ) -> CrmResult<ConversionState> {
        let next = transition(state, event)?;
        if next != state {
            info!(
                event_name = "conversion.transition",
                record_id = %record_id,
                from = ?state,
                to = ?next,
                trigger = ?event,
                "conversion state changed"
            );
        }
        Ok(next)
    }
}

struct AttemptProgress {
    attempts: u32,
    last_failure: String,
}

impl Default for AttemptProgress {
    fn default() -> Self {
        Self { attempts: 0, last_failure: String::from("no attempt was made") }
    }
}

fn outcome(
    record_id: &RecordId,
    status: ConversionState,
    idempotent: bool,
    attempts: u32,
    account_id: Option<String>,
    contact_id: Option<String>,
) -> ConversionOutcome {
    ConversionOutcome {
        record_id: record_id.clone(),
        status,
        idempotent,
        attempts,
        account_id,
        contact_id,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use leadbridge_core::{ConversionState, CrmError, CrmResult, Record, RecordId};

    use super::{ConversionOrchestrator, RecordingSleeper, RetryPolicy};
    use crate::memory::InMemoryRecordStore;
    use crate::soap::{ConversionTransport, ConvertResponse};

    /// Replays scripted responses and can flip the record to converted when
    /// a given call arrives, imitating a lost success signal.
    struct ScriptedTransport {
        responses: Mutex<VecDeque<CrmResult<ConvertResponse>>>,
        calls: Mutex<u32>,
        store: Arc<InMemoryRecordStore>,
        convert_on_call: Option<u32>,
    }

    impl ScriptedTransport {
        fn new(
            store: Arc<InMemoryRecordStore>,
            responses: Vec<CrmResult<ConvertResponse>>,
            convert_on_call: Option<u32>,
        ) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                calls: Mutex::new(0),
                store,
                convert_on_call,
            }
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().expect("calls lock")
        }
    }

    #[async_trait]
    impl ConversionTransport for ScriptedTransport {
        async fn convert(&self, record_id: &RecordId) -> CrmResult<ConvertResponse> {
            let call = {
                let mut calls = self.calls.lock().expect("calls lock");
                *calls += 1;
                *calls
            };
            if self.convert_on_call == Some(call) {
                self.store.set_converted(record_id, true).await;
            }
            let next = self.responses.lock().expect("responses lock").pop_front();
            next.unwrap_or_else(|| Ok(ConvertResponse::Ambiguous("script exhausted".into())))
        }
    }

    fn record(id: &RecordId, converted: bool) -> Record {
        Record {
            id: id.clone(),
            email: Some("a@x.com".to_string()),
            first_name: None,
            last_name: Some("Doe".to_string()),
            phone: None,
            company: Some("Individual".to_string()),
            status: None,
            is_converted: converted,
        }
    }

    async fn fixture(
        converted: bool,
        responses: Vec<CrmResult<ConvertResponse>>,
        convert_on_call: Option<u32>,
    ) -> (ConversionOrchestrator, Arc<ScriptedTransport>, RecordingSleeper, RecordId) {
        let id = RecordId("00Q000000000000001".to_string());
        let store = Arc::new(InMemoryRecordStore::default());
        store.insert(record(&id, converted)).await;
        let transport =
            Arc::new(ScriptedTransport::new(Arc::clone(&store), responses, convert_on_call));
        let sleeper = RecordingSleeper::default();
        let orchestrator = ConversionOrchestrator::new(
            store,
            transport.clone(),
            Arc::new(sleeper.clone()),
            RetryPolicy {
                max_attempts: 3,
                backoff_unit: Duration::from_millis(10),
                attempt_budget: Duration::from_secs(5),
            },
        );
        (orchestrator, transport, sleeper, id)
    }

    /// Accepts the call, optionally converts the record, and never replies.
    struct StalledTransport {
        store: Arc<InMemoryRecordStore>,
        converts: bool,
        calls: Mutex<u32>,
    }

    #[async_trait]
    impl ConversionTransport for StalledTransport {
        async fn convert(&self, record_id: &RecordId) -> CrmResult<ConvertResponse> {
            *self.calls.lock().expect("calls lock") += 1;
            if self.converts {
                self.store.set_converted(record_id, true).await;
            }
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(ConvertResponse::Ambiguous("no reply".into()))
        }
    }

    async fn stalled_fixture(
        converts: bool,
    ) -> (ConversionOrchestrator, Arc<StalledTransport>, RecordId) {
        let id = RecordId("00Q000000000000002".to_string());
        let store = Arc::new(InMemoryRecordStore::default());
        store.insert(record(&id, false)).await;
        let transport = Arc::new(StalledTransport {
            store: Arc::clone(&store),
            converts,
            calls: Mutex::new(0),
        });
        let orchestrator = ConversionOrchestrator::new(
            store,
            transport.clone(),
            Arc::new(RecordingSleeper::default()),
            RetryPolicy {
                max_attempts: 3,
                backoff_unit: Duration::from_millis(10),
                attempt_budget: Duration::from_millis(50),
            },
        );
        (orchestrator, transport, id)
    }

    fn failure() -> CrmResult<ConvertResponse> {
        Ok(ConvertResponse::Failure { messages: vec!["UNKNOWN_EXCEPTION".to_string()] })
    }

    #[tokio::test]
    async fn already_converted_record_issues_no_rpc() {
        let (orchestrator, transport, sleeper, id) = fixture(true, vec![], None).await;

        let outcome = orchestrator.convert(&id).await.expect("idempotent outcome");

        assert_eq!(outcome.status, ConversionState::Converted);
        assert!(outcome.idempotent);
        assert_eq!(outcome.attempts, 0);
        assert_eq!(transport.calls(), 0);
        assert!(sleeper.waits().is_empty());
    }

    #[tokio::test]
    async fn explicit_success_on_second_attempt_is_not_idempotent() {
        let success = Ok(ConvertResponse::Success {
            account_id: Some("001000000000001AAA".to_string()),
            contact_id: None,
        });
        let (orchestrator, transport, sleeper, id) =
            fixture(false, vec![failure(), success], None).await;

        let outcome = orchestrator.convert(&id).await.expect("converted");

        assert_eq!(outcome.status, ConversionState::Converted);
        assert!(!outcome.idempotent);
        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.account_id.as_deref(), Some("001000000000001AAA"));
        assert_eq!(transport.calls(), 2);
        assert_eq!(sleeper.waits(), vec![Duration::from_millis(10)]);
    }

    #[tokio::test]
    async fn lost_confirmation_is_recovered_by_reconciliation() {
        let (orchestrator, transport, sleeper, id) = fixture(
            false,
            vec![failure(), Ok(ConvertResponse::Ambiguous("truncated".into())), failure()],
            Some(2),
        )
        .await;

        let outcome = orchestrator.convert(&id).await.expect("reconciled");

        assert_eq!(outcome.status, ConversionState::Converted);
        assert!(outcome.idempotent);
        assert_eq!(transport.calls(), 3);
        assert_eq!(
            sleeper.waits(),
            vec![Duration::from_millis(10), Duration::from_millis(20), Duration::from_millis(40)]
        );
    }

    #[tokio::test]
    async fn exhausted_attempts_without_conversion_fail() {
        let (orchestrator, transport, _sleeper, id) = fixture(
            false,
            vec![failure(), Err(CrmError::Transport("reset".into())), failure()],
            None,
        )
        .await;

        let error = orchestrator.convert(&id).await.expect_err("conversion failure");

        assert!(matches!(
            error,
            CrmError::Conversion { attempts: 3, ref last_failure, .. }
                if last_failure.contains("UNKNOWN_EXCEPTION")
        ));
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test]
    async fn auth_failure_stops_retrying() {
        let (orchestrator, transport, sleeper, id) =
            fixture(false, vec![Err(CrmError::Auth("invalid_grant".into()))], None).await;

        let error = orchestrator.convert(&id).await.expect_err("auth failure");

        assert!(matches!(error, CrmError::Auth(_)));
        assert_eq!(transport.calls(), 1);
        assert!(sleeper.waits().is_empty());
    }

    #[tokio::test]
    async fn unknown_record_is_not_found() {
        let (orchestrator, transport, _sleeper, _id) = fixture(false, vec![], None).await;

        let missing = RecordId("00Q999999999999999".to_string());
        let error = orchestrator.convert(&missing).await.expect_err("missing");

        assert!(matches!(error, CrmError::NotFound(_)));
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn spent_attempt_budget_still_reconciles() {
        let (orchestrator, transport, id) = stalled_fixture(true).await;

        let outcome = orchestrator.convert(&id).await.expect("reconciled after budget");

        assert_eq!(outcome.status, ConversionState::Converted);
        assert!(outcome.idempotent);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(*transport.calls.lock().expect("calls lock"), 1);
    }

    #[tokio::test]
    async fn spent_attempt_budget_without_conversion_fails() {
        let (orchestrator, _transport, id) = stalled_fixture(false).await;

        let error = orchestrator.convert(&id).await.expect_err("conversion failure");

        assert!(matches!(
            error,
            CrmError::Conversion { attempts: 1, ref last_failure, .. }
                if last_failure.contains("attempt budget of 50ms exhausted")
        ));
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let policy = RetryPolicy { backoff_unit: Duration::from_secs(1), ..RetryPolicy::default() };
        let delays: Vec<Duration> = (0..3).map(|index| policy.delay_for(index)).collect();
        assert_eq!(
            delays,
            vec![Duration::from_secs(1), Duration::from_secs(2), Duration::from_secs(4)]
        );
    }
}
