//! Storage backends behind the credential store and generation history.
//!
//! Every operation takes the owning user id and never touches another
//! user's rows.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::credential::{CredentialMeta, CredentialRow, NewCredential};
use crate::models::history::{HistoryOutcome, HistoryRow, HistorySummary, NewHistoryEntry};
use crate::models::provider::Provider;

#[async_trait]
pub trait CredentialBackend: Send + Sync {
    /// Insert or overwrite the (user, provider) row. A user's first key
    /// becomes active; re-saving keeps the current active flag and clears
    /// any previous validation result.
    async fn upsert_credential(&self, cred: &NewCredential) -> anyhow::Result<()>;

    async fn get_credential(
        &self,
        user_id: Uuid,
        provider: Provider,
    ) -> anyhow::Result<Option<CredentialRow>>;

    /// Returns whether a row was removed.
    async fn delete_credential(&self, user_id: Uuid, provider: Provider) -> anyhow::Result<bool>;

    async fn list_credentials(&self, user_id: Uuid) -> anyhow::Result<Vec<CredentialMeta>>;

    /// Mark one provider active and clear the flag on the user's other rows.
    /// Returns false when the user has no row for `provider`.
    async fn set_active(&self, user_id: Uuid, provider: Provider) -> anyhow::Result<bool>;

    async fn record_validation(
        &self,
        user_id: Uuid,
        provider: Provider,
        checked_at: DateTime<Utc>,
        error: Option<&str>,
    ) -> anyhow::Result<bool>;
}

#[async_trait]
pub trait HistoryBackend: Send + Sync {
    async fn insert_history(&self, entry: &NewHistoryEntry) -> anyhow::Result<Uuid>;

    async fn complete_history(
        &self,
        user_id: Uuid,
        id: Uuid,
        outcome: &HistoryOutcome,
    ) -> anyhow::Result<bool>;

    /// Newest first.
    async fn list_history(
        &self,
        user_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> anyhow::Result<Vec<HistoryRow>>;

    async fn history_summary(&self, user_id: Uuid) -> anyhow::Result<HistorySummary>;
}
