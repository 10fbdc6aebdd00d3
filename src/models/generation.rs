use serde::{Deserialize, Serialize};

use crate::errors::{DispatchError, ValidationError};
use crate::models::provider::Provider;

/// One user request to generate a prompt. Not persisted on its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub framework_id: String,
    pub task_description: String,
    #[serde(default)]
    pub tone: Option<String>,
    #[serde(default)]
    pub length: Option<String>,
    #[serde(default)]
    pub vibe_coding: bool,
}

impl GenerationRequest {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.task_description.trim().is_empty() {
            return Err(ValidationError::EmptyTaskDescription);
        }
        Ok(())
    }

    /// Tone as it applies to rendering: `None` in vibe mode or when blank.
    pub fn tone(&self) -> Option<&str> {
        effective(self.vibe_coding, self.tone.as_deref())
    }

    /// Length as it applies to rendering: `None` in vibe mode or when blank.
    pub fn length(&self) -> Option<&str> {
        effective(self.vibe_coding, self.length.as_deref())
    }
}

fn effective(vibe_coding: bool, value: Option<&str>) -> Option<&str> {
    if vibe_coding {
        return None;
    }
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Normalized outcome of a generation, whatever provider produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_text: Option<String>,
    pub provider_used: Option<Provider>,
    pub model_name_used: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub framework_id: String,
}

impl GenerationResult {
    pub fn completed(
        framework_id: &str,
        provider: Provider,
        model: &str,
        prompt_text: String,
    ) -> Self {
        Self {
            success: true,
            prompt_text: Some(prompt_text),
            provider_used: Some(provider),
            model_name_used: Some(model.to_string()),
            error_message: None,
            framework_id: framework_id.to_string(),
        }
    }

    pub fn failed(framework_id: &str, err: &DispatchError) -> Self {
        Self {
            success: false,
            prompt_text: None,
            provider_used: err.provider(),
            model_name_used: match err {
                DispatchError::MalformedResponse { model, .. } => Some(model.clone()),
                _ => None,
            },
            error_message: Some(err.to_string()),
            framework_id: framework_id.to_string(),
        }
    }
}
