use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::provider::Provider;

/// Row to upsert for a (user, provider) pair. Holds ciphertext only.
#[derive(Debug, Clone)]
pub struct NewCredential {
    pub user_id: Uuid,
    pub provider: Provider,
    pub sealed: crate::vault::builtin::SealedSecret,
    pub key_hint: String,
}

/// Full stored row including the envelope-encrypted secret.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CredentialRow {
    pub user_id: Uuid,
    pub provider: String,
    pub encrypted_dek: Vec<u8>,
    pub dek_nonce: Vec<u8>,
    pub encrypted_secret: Vec<u8>,
    pub secret_nonce: Vec<u8>,
    pub key_hint: String,
    pub is_active: bool,
    pub last_validated_at: Option<DateTime<Utc>>,
    pub last_validation_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Credential metadata, safe to show to the owning user.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct CredentialMeta {
    pub provider: String,
    pub key_hint: String,
    pub is_active: bool,
    pub last_validated_at: Option<DateTime<Utc>>,
    pub last_validation_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Typed view of [`CredentialMeta`] returned by the credential store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CredentialStatus {
    pub provider: Provider,
    pub key_hint: String,
    pub is_active: bool,
    pub last_validated_at: Option<DateTime<Utc>>,
    pub last_validation_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Result of a connectivity check against the provider's API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationOutcome {
    pub provider: Provider,
    pub valid: bool,
    pub error: Option<String>,
    pub checked_at: DateTime<Utc>,
}

/// Last four characters, prefixed with an ellipsis.
pub fn key_hint(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    let tail: String = chars[chars.len().saturating_sub(4)..].iter().collect();
    format!("…{}", tail)
}
