//! In-process backend for tests and `serve --ephemeral`. Nothing survives a restart.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::models::credential::{CredentialMeta, CredentialRow, NewCredential};
use crate::models::history::{
    CountBucket, HistoryOutcome, HistoryRow, HistoryStatus, HistorySummary, NewHistoryEntry,
};
use crate::models::provider::Provider;

#[derive(Default)]
pub struct MemoryStore {
    credentials: DashMap<(Uuid, Provider), CredentialRow>,
    /// Serializes writes that read other rows before deciding the active flag.
    credential_writes: Mutex<()>,
    history: RwLock<Vec<HistoryRow>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn has_active(&self, user_id: Uuid) -> bool {
        self.credentials
            .iter()
            .any(|e| e.key().0 == user_id && e.value().is_active)
    }
}

fn meta(row: &CredentialRow) -> CredentialMeta {
    CredentialMeta {
        provider: row.provider.clone(),
        key_hint: row.key_hint.clone(),
        is_active: row.is_active,
        last_validated_at: row.last_validated_at,
        last_validation_error: row.last_validation_error.clone(),
        created_at: row.created_at,
        updated_at: row.updated_at,
    }
}

/// Count rows per key, ordered like the SQL backend: count desc, key asc.
fn buckets<'a>(keys: impl Iterator<Item = &'a str>) -> Vec<CountBucket> {
    let mut counts: BTreeMap<&str, i64> = BTreeMap::new();
    for k in keys {
        *counts.entry(k).or_default() += 1;
    }
    let mut out: Vec<CountBucket> = counts
        .into_iter()
        .map(|(key, count)| CountBucket {
            key: key.to_string(),
            count,
        })
        .collect();
    out.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.key.cmp(&b.key)));
    out
}

#[async_trait]
impl super::CredentialBackend for MemoryStore {
    async fn upsert_credential(&self, cred: &NewCredential) -> anyhow::Result<()> {
        let _guard = self.credential_writes.lock().await;
        let now = Utc::now();
        let make_active = !self.has_active(cred.user_id);

        self.credentials
            .entry((cred.user_id, cred.provider))
            .and_modify(|row| {
                row.encrypted_dek = cred.sealed.encrypted_dek.clone();
                row.dek_nonce = cred.sealed.dek_nonce.clone();
                row.encrypted_secret = cred.sealed.encrypted_secret.clone();
                row.secret_nonce = cred.sealed.secret_nonce.clone();
                row.key_hint = cred.key_hint.clone();
                row.last_validated_at = None;
                row.last_validation_error = None;
                row.updated_at = now;
            })
            .or_insert_with(|| CredentialRow {
                user_id: cred.user_id,
                provider: cred.provider.as_str().to_string(),
                encrypted_dek: cred.sealed.encrypted_dek.clone(),
                dek_nonce: cred.sealed.dek_nonce.clone(),
                encrypted_secret: cred.sealed.encrypted_secret.clone(),
                secret_nonce: cred.sealed.secret_nonce.clone(),
                key_hint: cred.key_hint.clone(),
                is_active: make_active,
                last_validated_at: None,
                last_validation_error: None,
                created_at: now,
                updated_at: now,
            });

        Ok(())
    }

    async fn get_credential(
        &self,
        user_id: Uuid,
        provider: Provider,
    ) -> anyhow::Result<Option<CredentialRow>> {
        Ok(self
            .credentials
            .get(&(user_id, provider))
            .map(|r| r.value().clone()))
    }

    async fn delete_credential(&self, user_id: Uuid, provider: Provider) -> anyhow::Result<bool> {
        Ok(self.credentials.remove(&(user_id, provider)).is_some())
    }

    async fn list_credentials(&self, user_id: Uuid) -> anyhow::Result<Vec<CredentialMeta>> {
        let mut rows: Vec<CredentialMeta> = self
            .credentials
            .iter()
            .filter(|e| e.key().0 == user_id)
            .map(|e| meta(e.value()))
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.provider.cmp(&b.provider)));
        Ok(rows)
    }

    async fn set_active(&self, user_id: Uuid, provider: Provider) -> anyhow::Result<bool> {
        let _guard = self.credential_writes.lock().await;
        if !self.credentials.contains_key(&(user_id, provider)) {
            return Ok(false);
        }
        let now = Utc::now();
        for mut entry in self.credentials.iter_mut() {
            let (owner, p) = *entry.key();
            if owner == user_id {
                let row = entry.value_mut();
                row.is_active = p == provider;
                row.updated_at = now;
            }
        }
        Ok(true)
    }

    async fn record_validation(
        &self,
        user_id: Uuid,
        provider: Provider,
        checked_at: DateTime<Utc>,
        error: Option<&str>,
    ) -> anyhow::Result<bool> {
        match self.credentials.get_mut(&(user_id, provider)) {
            Some(mut row) => {
                row.last_validated_at = Some(checked_at);
                row.last_validation_error = error.map(String::from);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[async_trait]
impl super::HistoryBackend for MemoryStore {
    async fn insert_history(&self, entry: &NewHistoryEntry) -> anyhow::Result<Uuid> {
        let id = Uuid::new_v4();
        self.history.write().await.push(HistoryRow {
            id,
            user_id: entry.user_id,
            framework_id: entry.framework_id.clone(),
            framework_name: entry.framework_name.clone(),
            provider: None,
            model_name: None,
            task_description: entry.task_description.clone(),
            prompt_text: None,
            error_message: None,
            error_code: None,
            tone: entry.tone.clone(),
            length: entry.length.clone(),
            vibe_coding: entry.vibe_coding,
            status: HistoryStatus::Pending.as_str().to_string(),
            created_at: Utc::now(),
            completed_at: None,
        });
        Ok(id)
    }

    async fn complete_history(
        &self,
        user_id: Uuid,
        id: Uuid,
        outcome: &HistoryOutcome,
    ) -> anyhow::Result<bool> {
        let mut history = self.history.write().await;
        let row = history.iter_mut().find(|r| {
            r.id == id && r.user_id == user_id && r.status == HistoryStatus::Pending.as_str()
        });
        match row {
            Some(row) => {
                row.status = outcome.status.as_str().to_string();
                row.provider = outcome.provider.clone();
                row.model_name = outcome.model_name.clone();
                row.prompt_text = outcome.prompt_text.clone();
                row.error_message = outcome.error_message.clone();
                row.error_code = outcome.error_code.clone();
                row.completed_at = Some(Utc::now());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_history(
        &self,
        user_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> anyhow::Result<Vec<HistoryRow>> {
        let history = self.history.read().await;
        // Rows are appended in creation order; walk backwards for newest first.
        Ok(history
            .iter()
            .rev()
            .filter(|r| r.user_id == user_id)
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn history_summary(&self, user_id: Uuid) -> anyhow::Result<HistorySummary> {
        let history = self.history.read().await;
        let rows: Vec<&HistoryRow> = history.iter().filter(|r| r.user_id == user_id).collect();

        Ok(HistorySummary {
            total: rows.len() as i64,
            by_framework: buckets(rows.iter().map(|r| r.framework_id.as_str())),
            by_provider: buckets(rows.iter().filter_map(|r| r.provider.as_deref())),
            by_status: buckets(rows.iter().map(|r| r.status.as_str())),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CredentialBackend, HistoryBackend};
    use crate::vault::builtin::SealedSecret;

    fn cred(user_id: Uuid, provider: Provider) -> NewCredential {
        NewCredential {
            user_id,
            provider,
            sealed: SealedSecret {
                encrypted_dek: vec![1],
                dek_nonce: vec![2],
                encrypted_secret: vec![3],
                secret_nonce: vec![4],
            },
            key_hint: "…abcd".into(),
        }
    }

    #[tokio::test]
    async fn test_first_key_becomes_active_only() {
        let store = MemoryStore::new();
        let user = Uuid::new_v4();
        store.upsert_credential(&cred(user, Provider::Gemini)).await.unwrap();
        store.upsert_credential(&cred(user, Provider::OpenAI)).await.unwrap();

        let rows = store.list_credentials(user).await.unwrap();
        let active: Vec<_> = rows.iter().filter(|r| r.is_active).collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].provider, "gemini");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_saves_activate_one() {
        let store = std::sync::Arc::new(MemoryStore::new());
        for _ in 0..200 {
            let user = Uuid::new_v4();
            let tasks: Vec<_> = Provider::ALL
                .into_iter()
                .map(|p| {
                    let store = store.clone();
                    tokio::spawn(async move { store.upsert_credential(&cred(user, p)).await })
                })
                .collect();
            for t in tasks {
                t.await.unwrap().unwrap();
            }

            let rows = store.list_credentials(user).await.unwrap();
            assert_eq!(rows.len(), 3);
            assert_eq!(rows.iter().filter(|r| r.is_active).count(), 1);
        }
    }

    #[tokio::test]
    async fn test_set_active_is_exclusive_and_scoped() {
        let store = MemoryStore::new();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        store.upsert_credential(&cred(alice, Provider::Gemini)).await.unwrap();
        store.upsert_credential(&cred(alice, Provider::Anthropic)).await.unwrap();
        store.upsert_credential(&cred(bob, Provider::Gemini)).await.unwrap();

        assert!(store.set_active(alice, Provider::Anthropic).await.unwrap());
        assert!(!store.set_active(alice, Provider::OpenAI).await.unwrap());

        let alice_rows = store.list_credentials(alice).await.unwrap();
        for r in &alice_rows {
            assert_eq!(r.is_active, r.provider == "anthropic");
        }
        let bob_rows = store.list_credentials(bob).await.unwrap();
        assert!(bob_rows[0].is_active);
    }

    #[tokio::test]
    async fn test_history_summary_groups_per_user() {
        let store = MemoryStore::new();
        let user = Uuid::new_v4();
        let other = Uuid::new_v4();

        for (uid, framework) in [(user, "tag"), (user, "tag"), (user, "ape"), (other, "tag")] {
            store
                .insert_history(&NewHistoryEntry {
                    user_id: uid,
                    framework_id: framework.into(),
                    framework_name: framework.to_uppercase(),
                    task_description: "t".into(),
                    tone: None,
                    length: None,
                    vibe_coding: false,
                })
                .await
                .unwrap();
        }

        let summary = store.history_summary(user).await.unwrap();
        assert_eq!(summary.total, 3);
        assert_eq!(
            summary.by_framework,
            vec![
                CountBucket { key: "tag".into(), count: 2 },
                CountBucket { key: "ape".into(), count: 1 },
            ]
        );
        assert_eq!(summary.by_status, vec![CountBucket { key: "pending".into(), count: 3 }]);
        assert!(summary.by_provider.is_empty());
    }
}
