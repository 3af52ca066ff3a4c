pub mod conversion;
pub mod dispatch;
pub mod memory;
pub mod repository;
pub mod soap;
pub mod soql;
pub mod token;

use std::sync::Arc;

use leadbridge_core::config::AppConfig;
use leadbridge_core::{CredentialStore, CrmError, CrmResult};

pub use conversion::{
    ConversionOrchestrator, RecordingSleeper, RetryPolicy, Sleeper, TokioSleeper,
};
pub use dispatch::{ApiRequest, ApiResponse, RequestDispatcher};
pub use memory::InMemoryRecordStore;
pub use repository::{CreateOutcome, QueryPage, RecordStore, RestRecordRepository};
pub use soap::{ConversionTransport, ConvertResponse, SoapConversionTransport};
pub use soql::{RecordFilter, MAX_QUERY_LIMIT};
pub use token::{AccessToken, TokenManager};

/// One explicitly constructed client per process, shared by reference.
#[derive(Clone)]
pub struct CrmClient {
    pub tokens: Arc<TokenManager>,
    pub dispatcher: Arc<RequestDispatcher>,
    pub records: Arc<dyn RecordStore>,
    pub orchestrator: Arc<ConversionOrchestrator>,
}

impl CrmClient {
    pub fn from_config(
        config: &AppConfig,
        credentials: Arc<dyn CredentialStore>,
    ) -> CrmResult<Self> {
        Self::with_sleeper(config, credentials, Arc::new(TokioSleeper))
    }

    pub fn with_sleeper(
        config: &AppConfig,
        credentials: Arc<dyn CredentialStore>,
        sleeper: Arc<dyn Sleeper>,
    ) -> CrmResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.http.timeout())
            .build()
            .map_err(|error| CrmError::Transport(format!("could not build HTTP client: {error}")))?;

        let tokens = Arc::new(TokenManager::new(
            http.clone(),
            &config.salesforce,
            credentials,
            config.auth.token_ttl(),
        ));
        let dispatcher = Arc::new(RequestDispatcher::new(
            http,
            config.salesforce.instance_url.clone(),
            config.salesforce.api_version.clone(),
            Arc::clone(&tokens),
        ));
        let records: Arc<dyn RecordStore> =
            Arc::new(RestRecordRepository::new(Arc::clone(&dispatcher)));
        let transport = Arc::new(SoapConversionTransport::new(
            Arc::clone(&dispatcher),
            config.salesforce.soap_version(),
            &config.conversion,
        ));
        let orchestrator = Arc::new(ConversionOrchestrator::new(
            Arc::clone(&records),
            transport,
            sleeper,
            RetryPolicy::from_config(&config.conversion),
        ));

        Ok(Self { tokens, dispatcher, records, orchestrator })
    }
}
