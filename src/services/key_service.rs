//! Self-service issuance of trial API keys.

use crate::{
    errors::ServiceResult,
    models::account::{Account, Plan},
    services::metadata_store::MetadataStore,
};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::{RngCore, rngs::OsRng};
use tracing::info;

pub const TRIAL_KEY_PREFIX: &str = "ln_test_";

#[derive(Clone)]
pub struct KeyService {
    metadata: MetadataStore,
}

impl KeyService {
    pub fn new(metadata: MetadataStore) -> Self {
        Self { metadata }
    }

    /// Create a trial account behind a fresh random key.
    pub async fn issue_trial_key(&self) -> ServiceResult<Account> {
        let account = self
            .metadata
            .create_account(&generate_key(), Plan::Trial)
            .await?;
        info!(account = %account.id, "issued trial key");
        Ok(account)
    }
}

/// `ln_test_` + URL-safe base64 of 32 bytes from the OS generator.
fn generate_key() -> String {
    let mut raw = [0u8; 32];
    OsRng.fill_bytes(&mut raw);
    format!("{TRIAL_KEY_PREFIX}{}", URL_SAFE_NO_PAD.encode(raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::metadata_store::testing::memory_store;

    #[test]
    fn test_key_shape() {
        let key = generate_key();
        assert!(key.starts_with(TRIAL_KEY_PREFIX));
        let encoded = &key[TRIAL_KEY_PREFIX.len()..];
        assert_eq!(encoded.len(), 43);
        assert!(encoded.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_'));
        assert_ne!(generate_key(), key);
    }

    #[test]
    fn test_key_carries_32_unstructured_bytes() {
        let decoded: Vec<Vec<u8>> = (0..64)
            .map(|_| {
                let key = generate_key();
                URL_SAFE_NO_PAD.decode(&key[TRIAL_KEY_PREFIX.len()..]).unwrap()
            })
            .collect();
        assert!(decoded.iter().all(|raw| raw.len() == 32));
        // a v4 UUID would pin the version nibble at offsets 6 and 22
        assert!(decoded.iter().any(|raw| raw[6] >> 4 != 4 || raw[22] >> 4 != 4));
    }

    #[tokio::test]
    async fn test_issued_key_authenticates_as_trial() {
        let metadata = memory_store().await;
        let keys = KeyService::new(metadata.clone());
        let account = keys.issue_trial_key().await.unwrap();

        let found = metadata
            .find_account_by_key(&account.api_key)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, account.id);
        assert_eq!(found.plan, Plan::Trial);
    }
}
