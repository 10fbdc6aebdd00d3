use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::DispatchError;
use crate::models::generation::{GenerationRequest, GenerationResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryStatus {
    Pending,
    Completed,
    Failed,
}

impl HistoryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryStatus::Pending => "pending",
            HistoryStatus::Completed => "completed",
            HistoryStatus::Failed => "failed",
        }
    }
}

impl FromStr for HistoryStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(HistoryStatus::Pending),
            "completed" => Ok(HistoryStatus::Completed),
            "failed" => Ok(HistoryStatus::Failed),
            other => anyhow::bail!("unknown history status: {}", other),
        }
    }
}

/// A generation about to be dispatched; written with status `pending`.
#[derive(Debug, Clone)]
pub struct NewHistoryEntry {
    pub user_id: Uuid,
    pub framework_id: String,
    pub framework_name: String,
    pub task_description: String,
    pub tone: Option<String>,
    pub length: Option<String>,
    pub vibe_coding: bool,
}

impl NewHistoryEntry {
    pub fn from_request(user_id: Uuid, framework_name: &str, req: &GenerationRequest) -> Self {
        Self {
            user_id,
            framework_id: req.framework_id.clone(),
            framework_name: framework_name.to_string(),
            task_description: req.task_description.clone(),
            tone: req.tone().map(String::from),
            length: req.length().map(String::from),
            vibe_coding: req.vibe_coding,
        }
    }
}

/// Final state of a history row.
#[derive(Debug, Clone)]
pub struct HistoryOutcome {
    pub status: HistoryStatus,
    pub provider: Option<String>,
    pub model_name: Option<String>,
    pub prompt_text: Option<String>,
    pub error_message: Option<String>,
    pub error_code: Option<String>,
}

impl HistoryOutcome {
    pub fn from_result(result: &Result<GenerationResult, DispatchError>) -> Self {
        match result {
            // The dispatcher reports every failure as `Err`.
            Ok(r) => Self {
                status: HistoryStatus::Completed,
                provider: r.provider_used.map(|p| p.as_str().to_string()),
                model_name: r.model_name_used.clone(),
                prompt_text: r.prompt_text.clone(),
                error_message: None,
                error_code: None,
            },
            Err(e) => {
                let failed = GenerationResult::failed("", e);
                Self {
                    status: HistoryStatus::Failed,
                    provider: failed.provider_used.map(|p| p.as_str().to_string()),
                    model_name: failed.model_name_used,
                    prompt_text: None,
                    error_message: failed.error_message,
                    error_code: Some(e.code().to_string()),
                }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct HistoryRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub framework_id: String,
    pub framework_name: String,
    pub provider: Option<String>,
    pub model_name: Option<String>,
    pub task_description: String,
    pub prompt_text: Option<String>,
    pub error_message: Option<String>,
    pub error_code: Option<String>,
    pub tone: Option<String>,
    pub length: Option<String>,
    pub vibe_coding: bool,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct CountBucket {
    pub key: String,
    pub count: i64,
}

/// Per-user history aggregates, computed by the storage backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistorySummary {
    pub total: i64,
    pub by_framework: Vec<CountBucket>,
    pub by_provider: Vec<CountBucket>,
    pub by_status: Vec<CountBucket>,
}
