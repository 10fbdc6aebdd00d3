use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::models::provider::Provider;

/// Bad input shape, detected before any storage or network call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{provider} API key is empty")]
    EmptyKey { provider: Provider },

    #[error("{provider} API key must be between {min} and {max} characters")]
    KeyLength {
        provider: Provider,
        min: usize,
        max: usize,
    },

    #[error("{provider} API key has an unexpected format: {hint}")]
    KeyFormat {
        provider: Provider,
        hint: &'static str,
    },

    #[error("task description must not be empty")]
    EmptyTaskDescription,

    #[error("unknown provider: {0}")]
    UnknownProvider(String),
}

/// Credential store failures. Format rejections are carried separately from
/// storage failures so callers can tell "your key is malformed" apart from
/// "nothing could be saved right now".
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no {provider} credential stored")]
    NotFound { provider: Provider },

    #[error("stored {provider} credential could not be decrypted")]
    DecryptionFailed { provider: Provider },

    #[error("credential write failed: {0}")]
    WriteFailed(String),

    #[error("credential read failed: {0}")]
    ReadFailed(String),

    #[error(transparent)]
    InvalidKey(#[from] ValidationError),
}

/// Outcome kinds of a generation attempt.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("unknown framework: {0}")]
    UnknownFramework(String),

    #[error("no active provider configured")]
    NoActiveProvider,

    #[error("{provider} rejected the API key: {message}")]
    ProviderAuthError { provider: Provider, message: String },

    #[error("{provider} rate limit reached: {message}")]
    ProviderRateLimited {
        provider: Provider,
        message: String,
        retry_after: Option<u64>,
    },

    #[error("{provider} is unavailable: {message}")]
    ProviderUnavailable { provider: Provider, message: String },

    /// A 4xx other than auth, rate limit or unknown model.
    #[error("{provider} rejected the request ({status}): {message}")]
    ProviderRejected {
        provider: Provider,
        status: u16,
        message: String,
    },

    #[error("{provider} returned no generated text for model {model}")]
    MalformedResponse { provider: Provider, model: String },

    #[error("generation cancelled")]
    Cancelled,

    #[error(transparent)]
    Invalid(#[from] ValidationError),

    #[error(transparent)]
    Credential(#[from] StoreError),
}

impl DispatchError {
    /// Stable machine-readable code, also stored on failed history rows.
    pub fn code(&self) -> &'static str {
        match self {
            DispatchError::UnknownFramework(_) => "unknown_framework",
            DispatchError::NoActiveProvider => "no_active_provider",
            DispatchError::ProviderAuthError { .. } => "provider_auth_error",
            DispatchError::ProviderRateLimited { .. } => "provider_rate_limited",
            DispatchError::ProviderUnavailable { .. } => "provider_unavailable",
            DispatchError::ProviderRejected { .. } => "provider_rejected",
            DispatchError::MalformedResponse { .. } => "malformed_response",
            DispatchError::Cancelled => "cancelled",
            DispatchError::Invalid(_) => "validation_error",
            DispatchError::Credential(StoreError::NotFound { .. }) => "credential_not_found",
            DispatchError::Credential(StoreError::DecryptionFailed { .. }) => "decryption_failed",
            DispatchError::Credential(_) => "credential_store_error",
        }
    }

    /// The provider involved, when the failure happened at or after provider selection.
    pub fn provider(&self) -> Option<Provider> {
        match self {
            DispatchError::ProviderAuthError { provider, .. }
            | DispatchError::ProviderRateLimited { provider, .. }
            | DispatchError::ProviderUnavailable { provider, .. }
            | DispatchError::ProviderRejected { provider, .. }
            | DispatchError::MalformedResponse { provider, .. } => Some(*provider),
            DispatchError::Credential(StoreError::NotFound { provider })
            | DispatchError::Credential(StoreError::DecryptionFailed { provider }) => Some(*provider),
            _ => None,
        }
    }
}

/// HTTP-facing error. Every domain error maps to exactly one status and code.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("missing or invalid bearer token")]
    Unauthorized,

    #[error("not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

fn validation_parts(e: &ValidationError) -> (StatusCode, &'static str, &'static str, String) {
    (
        StatusCode::UNPROCESSABLE_ENTITY,
        "invalid_request_error",
        "validation_error",
        e.to_string(),
    )
}

fn store_parts(e: &StoreError) -> (StatusCode, &'static str, &'static str, String) {
    match e {
        StoreError::NotFound { .. } => (
            StatusCode::NOT_FOUND,
            "invalid_request_error",
            "credential_not_found",
            e.to_string(),
        ),
        StoreError::DecryptionFailed { .. } => (
            StatusCode::CONFLICT,
            "credential_error",
            "decryption_failed",
            format!("{}; please re-enter the key", e),
        ),
        StoreError::InvalidKey(v) => validation_parts(v),
        StoreError::WriteFailed(_) | StoreError::ReadFailed(_) => {
            tracing::error!("credential store error: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                "storage_error",
                "credential_store_unavailable",
                "credential storage is temporarily unavailable".to_string(),
            )
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type, code, msg) = match &self {
            AppError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "authentication_error",
                "unauthorized",
                self.to_string(),
            ),
            AppError::NotFound(what) => (
                StatusCode::NOT_FOUND,
                "invalid_request_error",
                "not_found",
                format!("{} not found", what),
            ),
            AppError::Validation(e) => validation_parts(e),
            AppError::Store(e) => store_parts(e),
            AppError::Dispatch(e) => match e {
                DispatchError::Invalid(v) => validation_parts(v),
                DispatchError::Credential(s) => store_parts(s),
                DispatchError::UnknownFramework(_) => (
                    StatusCode::NOT_FOUND,
                    "invalid_request_error",
                    e.code(),
                    e.to_string(),
                ),
                DispatchError::NoActiveProvider => (
                    StatusCode::PRECONDITION_REQUIRED,
                    "configuration_error",
                    e.code(),
                    "configure and activate a provider API key first".to_string(),
                ),
                DispatchError::ProviderAuthError { .. } => (
                    StatusCode::UNAUTHORIZED,
                    "provider_auth_error",
                    e.code(),
                    e.to_string(),
                ),
                DispatchError::ProviderRateLimited { .. } => (
                    StatusCode::TOO_MANY_REQUESTS,
                    "rate_limit_error",
                    e.code(),
                    e.to_string(),
                ),
                DispatchError::ProviderRejected { .. } => (
                    StatusCode::BAD_GATEWAY,
                    "upstream_error",
                    e.code(),
                    e.to_string(),
                ),
                DispatchError::ProviderUnavailable { .. } | DispatchError::MalformedResponse { .. } => (
                    StatusCode::BAD_GATEWAY,
                    "upstream_error",
                    e.code(),
                    e.to_string(),
                ),
                // 499: client closed request
                DispatchError::Cancelled => (
                    StatusCode::from_u16(499).unwrap_or(StatusCode::REQUEST_TIMEOUT),
                    "cancelled",
                    e.code(),
                    e.to_string(),
                ),
            },
            AppError::Internal(e) => {
                tracing::error!("Internal error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "internal_server_error",
                    "internal server error".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": {
                "message": msg,
                "type": error_type,
                "code": code,
            }
        }));

        let mut response = (status, body).into_response();

        // Pass the provider's Retry-After hint through to the caller.
        if let AppError::Dispatch(DispatchError::ProviderRateLimited { retry_after, .. }) = &self {
            let secs = retry_after.unwrap_or(60).to_string();
            if let Ok(value) = axum::http::HeaderValue::from_str(&secs) {
                response.headers_mut().insert("retry-after", value);
            }
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_and_auth_have_distinct_codes() {
        let auth = DispatchError::ProviderAuthError {
            provider: Provider::OpenAI,
            message: "bad key".into(),
        };
        let rl = DispatchError::ProviderRateLimited {
            provider: Provider::OpenAI,
            message: "slow down".into(),
            retry_after: Some(5),
        };
        assert_ne!(auth.code(), rl.code());
        assert_eq!(auth.provider(), Some(Provider::OpenAI));
    }

    #[test]
    fn test_rate_limit_response_carries_retry_after() {
        let err = AppError::Dispatch(DispatchError::ProviderRateLimited {
            provider: Provider::Anthropic,
            message: "too many requests".into(),
            retry_after: Some(7),
        });
        let resp = err.into_response();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(resp.headers().get("retry-after").unwrap(), "7");
    }

    #[test]
    fn test_cancelled_is_not_reported_as_unavailable() {
        let resp = AppError::Dispatch(DispatchError::Cancelled).into_response();
        assert_eq!(resp.status().as_u16(), 499);
    }

    #[test]
    fn test_storage_failure_differs_from_invalid_key() {
        let write = AppError::Store(StoreError::WriteFailed("pool timed out".into())).into_response();
        let invalid = AppError::Store(StoreError::InvalidKey(ValidationError::EmptyKey {
            provider: Provider::Gemini,
        }))
        .into_response();
        assert_eq!(write.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(invalid.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }
}
