//! Provider-specific wire shapes: endpoint, auth headers, request body,
//! response text path, and error classification. Every function matches
//! exhaustively on [`Provider`].

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, InvalidHeaderValue, AUTHORIZATION};
use reqwest::{Method, StatusCode};
use serde_json::{json, Value};

use super::upstream::ProviderCall;
use crate::models::provider::Provider;

pub const SYSTEM_PROMPT: &str = "You are PromptCraft, an expert prompt engineer. Follow the requested framework exactly, keep every labeled section, and return only the finished prompt.";
pub const MAX_OUTPUT_TOKENS: u32 = 2000;
pub const TEMPERATURE: f64 = 0.7;
pub const ANTHROPIC_VERSION: &str = "2023-06-01";

/// How a non-2xx reply should be treated by the fallback loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The model identifier is unknown to the vendor; try the next variant.
    ModelNotFound,
    Auth,
    RateLimited,
    Unavailable,
    Rejected,
}

fn secret_header(value: String) -> Result<HeaderValue, InvalidHeaderValue> {
    let mut v = HeaderValue::from_str(&value)?;
    v.set_sensitive(true);
    Ok(v)
}

fn auth_headers(provider: Provider, api_key: &str) -> Result<HeaderMap, InvalidHeaderValue> {
    let mut headers = HeaderMap::new();
    match provider {
        Provider::OpenAI => {
            headers.insert(AUTHORIZATION, secret_header(format!("Bearer {}", api_key))?);
        }
        Provider::Gemini => {
            headers.insert(
                HeaderName::from_static("x-goog-api-key"),
                secret_header(api_key.to_string())?,
            );
        }
        Provider::Anthropic => {
            headers.insert(
                HeaderName::from_static("x-api-key"),
                secret_header(api_key.to_string())?,
            );
            headers.insert(
                HeaderName::from_static("anthropic-version"),
                HeaderValue::from_static(ANTHROPIC_VERSION),
            );
        }
    }
    Ok(headers)
}

pub fn generation_url(provider: Provider, base_url: &str, model: &str) -> String {
    let base = base_url.trim_end_matches('/');
    match provider {
        Provider::OpenAI => format!("{}/v1/chat/completions", base),
        Provider::Gemini => format!("{}/v1beta/models/{}:generateContent", base, model),
        Provider::Anthropic => format!("{}/v1/messages", base),
    }
}

pub fn generation_body(provider: Provider, model: &str, prompt: &str) -> Value {
    match provider {
        Provider::OpenAI => json!({
            "model": model,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": prompt},
            ],
            "temperature": TEMPERATURE,
            "max_tokens": MAX_OUTPUT_TOKENS,
        }),
        // Gemini carries the model in the URL, not the body.
        Provider::Gemini => json!({
            "systemInstruction": {"parts": [{"text": SYSTEM_PROMPT}]},
            "contents": [{"role": "user", "parts": [{"text": prompt}]}],
            "generationConfig": {
                "temperature": TEMPERATURE,
                "maxOutputTokens": MAX_OUTPUT_TOKENS,
            },
        }),
        Provider::Anthropic => json!({
            "model": model,
            "max_tokens": MAX_OUTPUT_TOKENS,
            "temperature": TEMPERATURE,
            "system": SYSTEM_PROMPT,
            "messages": [{"role": "user", "content": prompt}],
        }),
    }
}

pub fn generation_call(
    provider: Provider,
    base_url: &str,
    model: &str,
    api_key: &str,
    prompt: &str,
) -> Result<ProviderCall, InvalidHeaderValue> {
    Ok(ProviderCall {
        method: Method::POST,
        url: generation_url(provider, base_url, model),
        headers: auth_headers(provider, api_key)?,
        body: Some(generation_body(provider, model, prompt)),
    })
}

/// Cheap read-only call used to check a key: list the available models.
pub fn validation_call(
    provider: Provider,
    base_url: &str,
    api_key: &str,
) -> Result<ProviderCall, InvalidHeaderValue> {
    let base = base_url.trim_end_matches('/');
    let url = match provider {
        Provider::OpenAI => format!("{}/v1/models", base),
        Provider::Gemini => format!("{}/v1beta/models", base),
        Provider::Anthropic => format!("{}/v1/models", base),
    };
    Ok(ProviderCall {
        method: Method::GET,
        url,
        headers: auth_headers(provider, api_key)?,
        body: None,
    })
}

fn collect_text<'a>(parts: impl Iterator<Item = &'a str>) -> Option<String> {
    let text: String = parts.collect();
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Pull the generated text out of a successful response body.
/// `None` when the expected path is absent or holds no text.
pub fn extract_text(provider: Provider, body: &[u8]) -> Option<String> {
    let json: Value = serde_json::from_slice(body).ok()?;
    match provider {
        // choices[0].message.content
        Provider::OpenAI => {
            let content = json
                .get("choices")?
                .as_array()?
                .first()?
                .get("message")?
                .get("content")?
                .as_str()?;
            collect_text(std::iter::once(content))
        }
        // candidates[0].content.parts[*].text
        Provider::Gemini => {
            let parts = json
                .get("candidates")?
                .as_array()?
                .first()?
                .get("content")?
                .get("parts")?
                .as_array()?;
            collect_text(
                parts
                    .iter()
                    .filter_map(|p| p.get("text").and_then(|t| t.as_str())),
            )
        }
        // content[*] where type == "text"
        Provider::Anthropic => {
            let blocks = json.get("content")?.as_array()?;
            collect_text(
                blocks
                    .iter()
                    .filter(|b| b.get("type").and_then(|t| t.as_str()) == Some("text"))
                    .filter_map(|b| b.get("text").and_then(|t| t.as_str())),
            )
        }
    }
}

/// Error details from a vendor error payload.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ErrorDetails {
    pub message: Option<String>,
    /// OpenAI `error.code`, Anthropic `error.type`, Gemini `error.status`.
    pub kind: Option<String>,
    /// Gemini `error.details[*].reason`.
    pub reason: Option<String>,
}

pub fn error_details(provider: Provider, body: &[u8]) -> ErrorDetails {
    let Ok(json) = serde_json::from_slice::<Value>(body) else {
        return ErrorDetails::default();
    };
    let str_at = |v: &Value, key: &str| v.get(key).and_then(|s| s.as_str()).map(String::from);

    match provider {
        // {"error":{"message":"...","type":"...","code":"model_not_found"}}
        Provider::OpenAI => {
            let Some(err) = json.get("error") else {
                return ErrorDetails::default();
            };
            ErrorDetails {
                message: str_at(err, "message"),
                kind: str_at(err, "code").or_else(|| str_at(err, "type")),
                reason: None,
            }
        }
        // {"type":"error","error":{"type":"not_found_error","message":"..."}}
        Provider::Anthropic => {
            let Some(err) = json.get("error") else {
                return ErrorDetails::default();
            };
            ErrorDetails {
                message: str_at(err, "message"),
                kind: str_at(err, "type"),
                reason: None,
            }
        }
        // {"error":{"code":400,"message":"...","status":"INVALID_ARGUMENT","details":[{"reason":"API_KEY_INVALID"}]}}
        // sometimes wrapped in a one-element array
        Provider::Gemini => {
            let err = if let Some(arr) = json.as_array() {
                arr.first().and_then(|e| e.get("error"))
            } else {
                json.get("error")
            };
            let Some(err) = err else {
                return ErrorDetails::default();
            };
            let reason = err
                .get("details")
                .and_then(|d| d.as_array())
                .and_then(|d| d.iter().find_map(|x| str_at(x, "reason")));
            ErrorDetails {
                message: str_at(err, "message"),
                kind: str_at(err, "status"),
                reason,
            }
        }
    }
}

pub fn classify_failure(provider: Provider, status: StatusCode, details: &ErrorDetails) -> FailureKind {
    let kind = details.kind.as_deref().unwrap_or("");
    let message = details.message.as_deref().unwrap_or("").to_ascii_lowercase();

    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return FailureKind::Auth;
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        return FailureKind::RateLimited;
    }
    // 529: Anthropic "overloaded_error"
    if status.is_server_error() || status.as_u16() == 529 {
        return FailureKind::Unavailable;
    }

    match provider {
        Provider::OpenAI => {
            if kind == "model_not_found" || (status == StatusCode::NOT_FOUND && message.contains("model")) {
                return FailureKind::ModelNotFound;
            }
            if kind == "invalid_api_key" {
                return FailureKind::Auth;
            }
        }
        Provider::Gemini => {
            if details.reason.as_deref() == Some("API_KEY_INVALID") || message.contains("api key not valid") {
                return FailureKind::Auth;
            }
            if status == StatusCode::NOT_FOUND || kind == "NOT_FOUND" {
                return FailureKind::ModelNotFound;
            }
        }
        Provider::Anthropic => {
            if kind == "authentication_error" || kind == "permission_error" {
                return FailureKind::Auth;
            }
            if status == StatusCode::NOT_FOUND || kind == "not_found_error" {
                return FailureKind::ModelNotFound;
            }
        }
    }

    FailureKind::Rejected
}
