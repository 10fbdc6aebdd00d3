//! HTTP API tests: the full router over in-memory storage, with provider
//! endpoints mocked by wiremock.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use forge::api::{self, AppState};
use forge::config::{self, Config};
use forge::store::memory::MemoryStore;
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;
use wiremock::matchers::{any, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const MASTER_KEY: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";
const JWT_SECRET: &str = "test-jwt-secret";
const OPENAI_KEY: &str = "sk-proj-abcdefghijklmnopqrstuvwxyz";

fn config_for(base_url: &str) -> Config {
    let base_url = base_url.to_string();
    config::from_lookup(move |key| match key {
        "FORGE_MASTER_KEY" => Some(MASTER_KEY.to_string()),
        "FORGE_JWT_SECRET" => Some(JWT_SECRET.to_string()),
        "FORGE_OPENAI_BASE_URL" | "FORGE_GEMINI_BASE_URL" | "FORGE_ANTHROPIC_BASE_URL" => {
            Some(base_url.clone())
        }
        _ => None,
    })
    .unwrap()
}

fn app(base_url: &str) -> Router {
    let memory = Arc::new(MemoryStore::new());
    let state = AppState::build(config_for(base_url), memory.clone(), memory, None).unwrap();
    api::router(Arc::new(state))
}

fn bearer(user: Uuid) -> String {
    #[derive(serde::Serialize)]
    struct Claims {
        sub: String,
        exp: usize,
    }
    let claims = Claims {
        sub: user.to_string(),
        exp: (chrono::Utc::now().timestamp() + 600) as usize,
    };
    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(JWT_SECRET.as_bytes()),
    )
    .unwrap();
    format!("Bearer {}", token)
}

async fn call(app: &Router, user: Option<Uuid>, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(user) = user {
        builder = builder.header("authorization", bearer(user));
    }
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, json)
}

fn tag_body() -> Value {
    json!({
        "framework_id": "tag",
        "task_description": "Improve checkout conversion by 10%",
        "tone": "casual",
        "length": "medium",
        "vibe_coding": false
    })
}

mod surface_tests {
    use super::*;

    #[tokio::test]
    async fn test_health_needs_no_auth() {
        let app = app("http://127.0.0.1:9");
        let response = app
            .clone()
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-request-id"));
        assert_eq!(response.headers().get("x-content-type-options").unwrap(), "nosniff");
    }

    #[tokio::test]
    async fn test_api_requires_bearer_token() {
        let app = app("http://127.0.0.1:9");
        let (status, body) = call(&app, None, "GET", "/api/v1/frameworks", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["code"], "unauthorized");
    }

    #[tokio::test]
    async fn test_frameworks_listing_and_lookup() {
        let app = app("http://127.0.0.1:9");
        let user = Some(Uuid::new_v4());

        let (status, body) = call(&app, user, "GET", "/api/v1/frameworks", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 9);
        assert!(body[0].get("body_template").is_none());

        let (status, body) = call(&app, user, "GET", "/api/v1/frameworks/roses", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["id"], "roses");

        let (status, _) = call(&app, user, "GET", "/api/v1/frameworks/nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_preview_renders_without_provider() {
        let server = MockServer::start().await;
        Mock::given(any())
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;
        let app = app(&server.uri());

        let (status, body) = call(
            &app,
            Some(Uuid::new_v4()),
            "GET",
            "/api/v1/frameworks/tag/preview?task_description=Ship%20faster&tone=bold&vibe_coding=true",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let rendered = body["body"].as_str().unwrap();
        assert!(rendered.contains("Ship faster"));
        assert!(!rendered.contains("bold"));
        assert!(!rendered.contains("{{"));
    }
}

mod credential_tests {
    use super::*;

    #[tokio::test]
    async fn test_save_list_activate_delete() {
        let app = app("http://127.0.0.1:9");
        let user = Some(Uuid::new_v4());

        let (status, _) = call(&app, user, "PUT", "/api/v1/credentials/openai", Some(json!({"api_key": OPENAI_KEY}))).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, body) = call(&app, user, "GET", "/api/v1/credentials", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"providers": ["openai"], "has_any": true}));

        let (_, body) = call(&app, user, "GET", "/api/v1/credentials/status", None).await;
        assert_eq!(body[0]["provider"], "openai");
        assert_eq!(body[0]["is_active"], true);
        assert_eq!(body[0]["key_hint"], "…wxyz");
        assert!(!body.to_string().contains(OPENAI_KEY));

        let (status, body) = call(&app, user, "POST", "/api/v1/credentials/gemini/activate", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "credential_not_found");

        for _ in 0..2 {
            let (status, _) = call(&app, user, "DELETE", "/api/v1/credentials/openai", None).await;
            assert_eq!(status, StatusCode::NO_CONTENT);
        }
        let (_, body) = call(&app, user, "GET", "/api/v1/credentials", None).await;
        assert_eq!(body["has_any"], false);
    }

    #[tokio::test]
    async fn test_malformed_key_is_unprocessable() {
        let app = app("http://127.0.0.1:9");
        let user = Some(Uuid::new_v4());

        let (status, body) = call(&app, user, "PUT", "/api/v1/credentials/gemini", Some(json!({"api_key": "not-a-key"}))).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"]["code"], "validation_error");

        let (status, _) = call(&app, user, "PUT", "/api/v1/credentials/mistral", Some(json!({"api_key": OPENAI_KEY}))).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let (_, body) = call(&app, user, "GET", "/api/v1/credentials", None).await;
        assert_eq!(body["has_any"], false);
    }
}

mod generation_tests {
    use super::*;

    #[tokio::test]
    async fn test_generate_records_history_and_summary() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"content": "TASK: ... ACTION: ... GOAL: ..."}}]
            })))
            .expect(1)
            .mount(&server)
            .await;
        let app = app(&server.uri());
        let user = Some(Uuid::new_v4());
        call(&app, user, "PUT", "/api/v1/credentials/openai", Some(json!({"api_key": OPENAI_KEY}))).await;

        let (status, body) = call(&app, user, "POST", "/api/v1/generate", Some(tag_body())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["prompt_text"], "TASK: ... ACTION: ... GOAL: ...");
        assert_eq!(body["provider_used"], "openai");
        assert_eq!(body["model_name_used"], "gpt-4o");
        let history_id = body["history_id"].as_str().unwrap().to_string();

        let (_, history) = call(&app, user, "GET", "/api/v1/history", None).await;
        assert_eq!(history[0]["id"], history_id.as_str());
        assert_eq!(history[0]["status"], "completed");
        assert_eq!(history[0]["framework_name"], "TAG");
        assert_eq!(history[0]["tone"], "casual");

        let (status, summary) = call(&app, user, "GET", "/api/v1/analytics/summary", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(summary["total"], 1);
        assert_eq!(summary["by_provider"], json!([{"key": "openai", "count": 1}]));
        assert_eq!(summary["by_status"], json!([{"key": "completed", "count": 1}]));
    }

    /// Unknown frameworks are rejected before anything is recorded.
    #[tokio::test]
    async fn test_unknown_framework_is_not_recorded() {
        let app = app("http://127.0.0.1:9");
        let user = Some(Uuid::new_v4());

        let mut body = tag_body();
        body["framework_id"] = json!("smart");
        let (status, err) = call(&app, user, "POST", "/api/v1/generate", Some(body)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(err["error"]["code"], "unknown_framework");

        let (_, history) = call(&app, user, "GET", "/api/v1/history", None).await;
        assert_eq!(history, json!([]));
    }

    #[tokio::test]
    async fn test_no_active_provider_is_recorded_as_failed() {
        let app = app("http://127.0.0.1:9");
        let user = Some(Uuid::new_v4());

        let (status, err) = call(&app, user, "POST", "/api/v1/generate", Some(tag_body())).await;
        assert_eq!(status, StatusCode::PRECONDITION_REQUIRED);
        assert_eq!(err["error"]["code"], "no_active_provider");

        let (_, history) = call(&app, user, "GET", "/api/v1/history", None).await;
        assert_eq!(history[0]["status"], "failed");
        assert_eq!(history[0]["error_code"], "no_active_provider");
    }

    #[tokio::test]
    async fn test_rate_limit_maps_to_429_with_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(
                ResponseTemplate::new(429)
                    .insert_header("retry-after", "20")
                    .set_body_json(json!({"error": {"message": "Rate limit reached"}})),
            )
            .mount(&server)
            .await;
        let app = app(&server.uri());
        let user = Uuid::new_v4();
        call(&app, Some(user), "PUT", "/api/v1/credentials/openai", Some(json!({"api_key": OPENAI_KEY}))).await;

        let request = Request::builder()
            .method("POST")
            .uri("/api/v1/generate")
            .header("authorization", bearer(user))
            .header("content-type", "application/json")
            .body(Body::from(tag_body().to_string()))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get("retry-after").unwrap(), "20");
    }

    #[tokio::test]
    async fn test_cancel_ends_generation_and_records_it() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_delay(Duration::from_secs(10))
                    .set_body_json(json!({"choices": [{"message": {"content": "too late"}}]})),
            )
            .mount(&server)
            .await;
        let app = app(&server.uri());
        let user = Some(Uuid::new_v4());
        call(&app, user, "PUT", "/api/v1/credentials/openai", Some(json!({"api_key": OPENAI_KEY}))).await;

        let pending = {
            let app = app.clone();
            tokio::spawn(async move { call(&app, user, "POST", "/api/v1/generate", Some(tag_body())).await })
        };

        // Wait for the generation to register before cancelling it.
        let mut cancelled = false;
        for _ in 0..200 {
            let (status, body) = call(&app, user, "POST", "/api/v1/generate/cancel", None).await;
            assert_eq!(status, StatusCode::OK);
            if body["cancelled"] == true {
                cancelled = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(cancelled, "generation never became cancellable");

        let (status, body) = tokio::time::timeout(Duration::from_secs(5), pending)
            .await
            .expect("cancelled generation did not return")
            .unwrap();
        assert_eq!(status.as_u16(), 499);
        assert_eq!(body["error"]["code"], "cancelled");

        let (_, history) = call(&app, user, "GET", "/api/v1/history", None).await;
        assert_eq!(history[0]["status"], "failed");
        assert_eq!(history[0]["error_code"], "cancelled");
        assert!(history[0]["prompt_text"].is_null());
    }

    #[tokio::test]
    async fn test_cancel_without_inflight_generation() {
        let app = app("http://127.0.0.1:9");
        let (status, body) = call(&app, Some(Uuid::new_v4()), "POST", "/api/v1/generate/cancel", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["cancelled"], false);
    }
}
