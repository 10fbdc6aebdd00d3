use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::credential::{CredentialMeta, CredentialRow, NewCredential};
use crate::models::history::{
    CountBucket, HistoryOutcome, HistoryRow, HistoryStatus, HistorySummary, NewHistoryEntry,
};
use crate::models::provider::Provider;

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run pending migrations from the migrations/ directory.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub async fn ping(&self) -> anyhow::Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Upsert one credential row. A new row becomes active only when
    /// `may_activate` is set and the user has no active row yet.
    async fn write_credential(&self, cred: &NewCredential, may_activate: bool) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"INSERT INTO provider_credentials
                   (user_id, provider, encrypted_dek, dek_nonce, encrypted_secret, secret_nonce, key_hint, is_active)
               VALUES ($1, $2, $3, $4, $5, $6, $7,
                   $8 AND NOT EXISTS (SELECT 1 FROM provider_credentials WHERE user_id = $1 AND is_active))
               ON CONFLICT (user_id, provider) DO UPDATE SET
                   encrypted_dek = EXCLUDED.encrypted_dek,
                   dek_nonce = EXCLUDED.dek_nonce,
                   encrypted_secret = EXCLUDED.encrypted_secret,
                   secret_nonce = EXCLUDED.secret_nonce,
                   key_hint = EXCLUDED.key_hint,
                   last_validated_at = NULL,
                   last_validation_error = NULL,
                   updated_at = NOW()"#,
        )
        .bind(cred.user_id)
        .bind(cred.provider.as_str())
        .bind(&cred.sealed.encrypted_dek)
        .bind(&cred.sealed.dek_nonce)
        .bind(&cred.sealed.encrypted_secret)
        .bind(&cred.sealed.secret_nonce)
        .bind(&cred.key_hint)
        .bind(may_activate)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// Partial unique index allowing one active credential per user.
const ONE_ACTIVE_INDEX: &str = "provider_credentials_one_active";

const HISTORY_COLUMNS: &str = "id, user_id, framework_id, framework_name, provider, model_name, task_description, prompt_text, error_message, error_code, tone, length, vibe_coding, status, created_at, completed_at";

#[async_trait]
impl super::CredentialBackend for PgStore {
    async fn upsert_credential(&self, cred: &NewCredential) -> anyhow::Result<()> {
        match self.write_credential(cred, true).await {
            // A concurrent first save claimed the active slot between our
            // NOT EXISTS check and the insert; this row stays inactive.
            Err(sqlx::Error::Database(e)) if e.constraint() == Some(ONE_ACTIVE_INDEX) => {
                tracing::debug!(user_id = %cred.user_id, provider = %cred.provider, "lost race for active provider, saving inactive");
                self.write_credential(cred, false).await?;
            }
            other => other?,
        }
        Ok(())
    }

    async fn get_credential(
        &self,
        user_id: Uuid,
        provider: Provider,
    ) -> anyhow::Result<Option<CredentialRow>> {
        let row = sqlx::query_as::<_, CredentialRow>(
            "SELECT user_id, provider, encrypted_dek, dek_nonce, encrypted_secret, secret_nonce, key_hint, is_active, last_validated_at, last_validation_error, created_at, updated_at FROM provider_credentials WHERE user_id = $1 AND provider = $2"
        )
        .bind(user_id)
        .bind(provider.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    async fn delete_credential(&self, user_id: Uuid, provider: Provider) -> anyhow::Result<bool> {
        let result =
            sqlx::query("DELETE FROM provider_credentials WHERE user_id = $1 AND provider = $2")
                .bind(user_id)
                .bind(provider.as_str())
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_credentials(&self, user_id: Uuid) -> anyhow::Result<Vec<CredentialMeta>> {
        let rows = sqlx::query_as::<_, CredentialMeta>(
            "SELECT provider, key_hint, is_active, last_validated_at, last_validation_error, created_at, updated_at FROM provider_credentials WHERE user_id = $1 ORDER BY created_at ASC"
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn set_active(&self, user_id: Uuid, provider: Provider) -> anyhow::Result<bool> {
        let mut tx = self.pool.begin().await?;

        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM provider_credentials WHERE user_id = $1 AND provider = $2)",
        )
        .bind(user_id)
        .bind(provider.as_str())
        .fetch_one(&mut *tx)
        .await?;

        if !exists {
            tx.rollback().await?;
            return Ok(false);
        }

        // Clear first: the partial unique index allows one active row per user.
        sqlx::query(
            "UPDATE provider_credentials SET is_active = FALSE, updated_at = NOW() WHERE user_id = $1 AND provider <> $2 AND is_active",
        )
        .bind(user_id)
        .bind(provider.as_str())
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE provider_credentials SET is_active = TRUE, updated_at = NOW() WHERE user_id = $1 AND provider = $2",
        )
        .bind(user_id)
        .bind(provider.as_str())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn record_validation(
        &self,
        user_id: Uuid,
        provider: Provider,
        checked_at: DateTime<Utc>,
        error: Option<&str>,
    ) -> anyhow::Result<bool> {
        let result = sqlx::query(
            "UPDATE provider_credentials SET last_validated_at = $3, last_validation_error = $4 WHERE user_id = $1 AND provider = $2",
        )
        .bind(user_id)
        .bind(provider.as_str())
        .bind(checked_at)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl super::HistoryBackend for PgStore {
    async fn insert_history(&self, entry: &NewHistoryEntry) -> anyhow::Result<Uuid> {
        let id = sqlx::query_scalar::<_, Uuid>(
            r#"INSERT INTO generation_history
                   (user_id, framework_id, framework_name, task_description, tone, length, vibe_coding, status)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
               RETURNING id"#,
        )
        .bind(entry.user_id)
        .bind(&entry.framework_id)
        .bind(&entry.framework_name)
        .bind(&entry.task_description)
        .bind(&entry.tone)
        .bind(&entry.length)
        .bind(entry.vibe_coding)
        .bind(HistoryStatus::Pending.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    async fn complete_history(
        &self,
        user_id: Uuid,
        id: Uuid,
        outcome: &HistoryOutcome,
    ) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r#"UPDATE generation_history
               SET status = $3, provider = $4, model_name = $5, prompt_text = $6,
                   error_message = $7, error_code = $8, completed_at = NOW()
               WHERE id = $1 AND user_id = $2 AND status = 'pending'"#,
        )
        .bind(id)
        .bind(user_id)
        .bind(outcome.status.as_str())
        .bind(&outcome.provider)
        .bind(&outcome.model_name)
        .bind(&outcome.prompt_text)
        .bind(&outcome.error_message)
        .bind(&outcome.error_code)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_history(
        &self,
        user_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> anyhow::Result<Vec<HistoryRow>> {
        let sql = format!(
            "SELECT {} FROM generation_history WHERE user_id = $1 ORDER BY created_at DESC LIMIT $2 OFFSET $3",
            HISTORY_COLUMNS
        );
        let rows = sqlx::query_as::<_, HistoryRow>(&sql)
            .bind(user_id)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows)
    }

    async fn history_summary(&self, user_id: Uuid) -> anyhow::Result<HistorySummary> {
        let total = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM generation_history WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        let by_framework = sqlx::query_as::<_, CountBucket>(
            "SELECT framework_id AS key, COUNT(*) AS count FROM generation_history WHERE user_id = $1 GROUP BY framework_id ORDER BY count DESC, key ASC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let by_provider = sqlx::query_as::<_, CountBucket>(
            "SELECT provider AS key, COUNT(*) AS count FROM generation_history WHERE user_id = $1 AND provider IS NOT NULL GROUP BY provider ORDER BY count DESC, key ASC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let by_status = sqlx::query_as::<_, CountBucket>(
            "SELECT status AS key, COUNT(*) AS count FROM generation_history WHERE user_id = $1 GROUP BY status ORDER BY count DESC, key ASC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(HistorySummary {
            total,
            by_framework,
            by_provider,
            by_status,
        })
    }
}
