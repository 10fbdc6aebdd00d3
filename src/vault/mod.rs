pub mod builtin;

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::dispatch::model_router;
use crate::dispatch::upstream::ProviderClient;
use crate::errors::StoreError;
use crate::models::credential::{key_hint, CredentialStatus, NewCredential, ValidationOutcome};
use crate::models::provider::Provider;
use crate::store::CredentialBackend;
use builtin::VaultCrypto;

/// Per-user, per-provider encrypted API keys.
///
/// Keys are format-checked before anything is encrypted or written, so a
/// rejected key never reaches the backend. Plaintext only leaves this type
/// wrapped in [`Zeroizing`].
pub struct CredentialStore {
    crypto: VaultCrypto,
    backend: Arc<dyn CredentialBackend>,
    client: Arc<ProviderClient>,
}

impl CredentialStore {
    pub fn new(
        crypto: VaultCrypto,
        backend: Arc<dyn CredentialBackend>,
        client: Arc<ProviderClient>,
    ) -> Self {
        Self {
            crypto,
            backend,
            client,
        }
    }

    pub async fn save(&self, user_id: Uuid, provider: Provider, raw_key: &str) -> Result<(), StoreError> {
        let key = raw_key.trim();
        provider.check_key_format(key)?;

        let sealed = self.crypto.seal(key).map_err(|e| {
            tracing::error!(%provider, "failed to encrypt credential: {}", e);
            StoreError::WriteFailed(e.to_string())
        })?;

        let cred = NewCredential {
            user_id,
            provider,
            sealed,
            key_hint: key_hint(key),
        };
        self.backend.upsert_credential(&cred).await.map_err(|e| {
            tracing::error!(%user_id, %provider, "failed to store credential: {}", e);
            StoreError::WriteFailed(e.to_string())
        })?;

        tracing::info!(%user_id, %provider, key = %cred.key_hint, "credential saved");
        Ok(())
    }

    /// Decrypt the stored key for `provider`.
    pub async fn get(&self, user_id: Uuid, provider: Provider) -> Result<Zeroizing<String>, StoreError> {
        let row = self
            .backend
            .get_credential(user_id, provider)
            .await
            .map_err(|e| StoreError::ReadFailed(e.to_string()))?
            .ok_or(StoreError::NotFound { provider })?;

        let sealed = builtin::SealedSecret {
            encrypted_dek: row.encrypted_dek,
            dek_nonce: row.dek_nonce,
            encrypted_secret: row.encrypted_secret,
            secret_nonce: row.secret_nonce,
        };
        self.crypto.open(&sealed).map_err(|e| {
            tracing::warn!(%user_id, %provider, "stored credential could not be opened: {}", e);
            StoreError::DecryptionFailed { provider }
        })
    }

    /// Idempotent: deleting a key that does not exist succeeds.
    pub async fn delete(&self, user_id: Uuid, provider: Provider) -> Result<(), StoreError> {
        let removed = self
            .backend
            .delete_credential(user_id, provider)
            .await
            .map_err(|e| StoreError::WriteFailed(e.to_string()))?;
        if removed {
            tracing::info!(%user_id, %provider, "credential deleted");
        } else {
            tracing::debug!(%user_id, %provider, "delete of missing credential ignored");
        }
        Ok(())
    }

    /// Providers with a stored key, validated or not.
    pub async fn list_configured(&self, user_id: Uuid) -> Result<BTreeSet<Provider>, StoreError> {
        Ok(self
            .list_status(user_id)
            .await?
            .into_iter()
            .map(|s| s.provider)
            .collect())
    }

    pub async fn has_any(&self, user_id: Uuid) -> Result<bool, StoreError> {
        Ok(!self.list_configured(user_id).await?.is_empty())
    }

    pub async fn list_status(&self, user_id: Uuid) -> Result<Vec<CredentialStatus>, StoreError> {
        let rows = self
            .backend
            .list_credentials(user_id)
            .await
            .map_err(|e| StoreError::ReadFailed(e.to_string()))?;

        Ok(rows
            .into_iter()
            .filter_map(|row| match row.provider.parse::<Provider>() {
                Ok(provider) => Some(CredentialStatus {
                    provider,
                    key_hint: row.key_hint,
                    is_active: row.is_active,
                    last_validated_at: row.last_validated_at,
                    last_validation_error: row.last_validation_error,
                    created_at: row.created_at,
                    updated_at: row.updated_at,
                }),
                Err(_) => {
                    tracing::warn!(%user_id, provider = %row.provider, "skipping credential row with unknown provider");
                    None
                }
            })
            .collect())
    }

    pub async fn set_active(&self, user_id: Uuid, provider: Provider) -> Result<(), StoreError> {
        let updated = self
            .backend
            .set_active(user_id, provider)
            .await
            .map_err(|e| StoreError::WriteFailed(e.to_string()))?;
        if !updated {
            return Err(StoreError::NotFound { provider });
        }
        tracing::info!(%user_id, %provider, "active provider changed");
        Ok(())
    }

    pub async fn active_provider(&self, user_id: Uuid) -> Result<Option<Provider>, StoreError> {
        Ok(self
            .list_status(user_id)
            .await?
            .into_iter()
            .find(|s| s.is_active)
            .map(|s| s.provider))
    }

    /// Check the stored key: format first, then one read-only call to the
    /// provider. The outcome is recorded on the row; the key itself is not
    /// touched.
    pub async fn validate(&self, user_id: Uuid, provider: Provider) -> Result<ValidationOutcome, StoreError> {
        let key = self.get(user_id, provider).await?;

        let error = match provider.check_key_format(&key) {
            Err(e) => Some(e.to_string()),
            Ok(()) => self.check_remote(provider, &key).await,
        };

        let checked_at = Utc::now();
        let recorded = self
            .backend
            .record_validation(user_id, provider, checked_at, error.as_deref())
            .await
            .map_err(|e| StoreError::WriteFailed(e.to_string()))?;
        if !recorded {
            // Deleted between the read and the write.
            return Err(StoreError::NotFound { provider });
        }

        match &error {
            None => tracing::info!(%user_id, %provider, "credential validated"),
            Some(e) => tracing::warn!(%user_id, %provider, "credential validation failed: {}", e),
        }

        Ok(ValidationOutcome {
            provider,
            valid: error.is_none(),
            error,
            checked_at,
        })
    }

    /// `None` when the provider accepted the key.
    async fn check_remote(&self, provider: Provider, key: &str) -> Option<String> {
        let call = match model_router::validation_call(provider, self.client.base_url(provider), key) {
            Ok(call) => call,
            Err(_) => return Some("key contains characters that cannot be sent in a header".into()),
        };
        match self.client.send(call).await {
            Ok(reply) if reply.status.is_success() => None,
            Ok(reply) => Some(crate::dispatch::failure_from_reply(provider, &reply).1.to_string()),
            Err(e) => Some(crate::dispatch::transport_error(provider, e).to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UpstreamSettings;
    use crate::errors::ValidationError;
    use crate::store::memory::MemoryStore;

    const MASTER_KEY: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    fn store_with(backend: Arc<MemoryStore>, master_key: &str) -> CredentialStore {
        let client = ProviderClient::new(UpstreamSettings::with_single_base_url("http://127.0.0.1:9")).unwrap();
        CredentialStore::new(VaultCrypto::new(master_key).unwrap(), backend, Arc::new(client))
    }

    #[tokio::test]
    async fn test_save_then_get_roundtrip() {
        let store = store_with(Arc::new(MemoryStore::new()), MASTER_KEY);
        let user = Uuid::new_v4();
        let key = "sk-ant-REDACTED";

        store.save(user, Provider::Anthropic, key).await.unwrap();
        assert_eq!(store.get(user, Provider::Anthropic).await.unwrap().as_str(), key);
    }

    #[tokio::test]
    async fn test_rejected_key_is_not_written() {
        let store = store_with(Arc::new(MemoryStore::new()), MASTER_KEY);
        let user = Uuid::new_v4();

        let err = store.save(user, Provider::Gemini, "sk-not-a-gemini-key").await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidKey(ValidationError::KeyLength { .. } | ValidationError::KeyFormat { .. })));
        assert!(store.list_configured(user).await.unwrap().is_empty());
        assert!(!store.has_any(user).await.unwrap());
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let store = store_with(Arc::new(MemoryStore::new()), MASTER_KEY);
        let err = store.get(Uuid::new_v4(), Provider::OpenAI).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { provider: Provider::OpenAI }));
    }

    #[tokio::test]
    async fn test_rotated_master_key_reports_decryption_failure() {
        let backend = Arc::new(MemoryStore::new());
        let user = Uuid::new_v4();
        store_with(backend.clone(), MASTER_KEY)
            .save(user, Provider::OpenAI, "sk-proj-abcdefghijklmnopqrstuv")
            .await
            .unwrap();

        let rotated = store_with(backend, &"ab".repeat(32));
        let err = rotated.get(user, Provider::OpenAI).await.unwrap_err();
        assert!(matches!(err, StoreError::DecryptionFailed { provider: Provider::OpenAI }));
    }

    #[tokio::test]
    async fn test_delete_twice_is_ok_and_clears_active() {
        let store = store_with(Arc::new(MemoryStore::new()), MASTER_KEY);
        let user = Uuid::new_v4();
        store.save(user, Provider::OpenAI, "sk-proj-abcdefghijklmnopqrstuv").await.unwrap();
        assert_eq!(store.active_provider(user).await.unwrap(), Some(Provider::OpenAI));

        tokio_test::assert_ok!(store.delete(user, Provider::OpenAI).await);
        tokio_test::assert_ok!(store.delete(user, Provider::OpenAI).await);
        assert_eq!(store.active_provider(user).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_active_requires_configured_provider() {
        let store = store_with(Arc::new(MemoryStore::new()), MASTER_KEY);
        let user = Uuid::new_v4();
        store.save(user, Provider::OpenAI, "sk-proj-abcdefghijklmnopqrstuv").await.unwrap();

        let err = store.set_active(user, Provider::Gemini).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { provider: Provider::Gemini }));
        assert_eq!(store.active_provider(user).await.unwrap(), Some(Provider::OpenAI));
    }

    #[tokio::test]
    async fn test_status_never_exposes_the_key() {
        let store = store_with(Arc::new(MemoryStore::new()), MASTER_KEY);
        let user = Uuid::new_v4();
        let key = "sk-proj-abcdefghijklmnopqrstuv";
        store.save(user, Provider::OpenAI, key).await.unwrap();

        let status = store.list_status(user).await.unwrap();
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].key_hint, "…stuv");
        let json = serde_json::to_string(&status).unwrap();
        assert!(!json.contains(key));
    }
}
