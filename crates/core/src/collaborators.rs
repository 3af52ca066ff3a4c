//! Seams for the collaborators the client consumes but does not own: secret
//! decryption and correlation-id generation.

use secrecy::SecretString;
use uuid::Uuid;

use crate::errors::CrmError;

/// Turns the configured (possibly encrypted) refresh token into the value
/// sent to the token endpoint.
pub trait CredentialStore: Send + Sync {
    fn decrypt_refresh_token(&self, stored: &SecretString) -> Result<SecretString, CrmError>;
}

/// Used when the refresh token is configured in clear text.
#[derive(Clone, Copy, Debug, Default)]
pub struct PlaintextCredentialStore;

impl CredentialStore for PlaintextCredentialStore {
    fn decrypt_refresh_token(&self, stored: &SecretString) -> Result<SecretString, CrmError> {
        Ok(stored.clone())
    }
}

pub trait CorrelationIdGenerator: Send + Sync {
    fn next_id(&self) -> String;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct UuidCorrelationIds;

impl CorrelationIdGenerator for UuidCorrelationIds {
    fn next_id(&self) -> String {
        Uuid::new_v4().simple().to_string()
    }
}

#[cfg(test)]
mod tests {
    use secrecy::{ExposeSecret, SecretString};

    use super::{
        CorrelationIdGenerator, CredentialStore, PlaintextCredentialStore, UuidCorrelationIds,
    };

    #[test]
    fn plaintext_store_passes_token_through() {
        let stored = SecretString::from("5Aep861-refresh".to_string());
        let token = PlaintextCredentialStore.decrypt_refresh_token(&stored).expect("decrypt");
        assert_eq!(token.expose_secret(), "5Aep861-refresh");
    }

    #[test]
    fn uuid_ids_are_unique_per_call() {
        let ids = UuidCorrelationIds;
        let first = ids.next_id();
        let second = ids.next_id();
        assert_eq!(first.len(), 32);
        assert_ne!(first, second);
    }
}
