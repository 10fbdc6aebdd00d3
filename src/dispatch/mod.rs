//! Prompt generation: render a framework, pick the user's active provider,
//! and walk that provider's model variants until one answers.

pub mod model_router;
pub mod upstream;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::{AbortHandle, AbortRegistration, Abortable};
use uuid::Uuid;

use crate::config::Config;
use crate::errors::DispatchError;
use crate::models::framework::{FrameworkRegistry, FrameworkTemplate};
use crate::models::generation::{GenerationRequest, GenerationResult};
use crate::models::provider::Provider;
use crate::store::CredentialBackend;
use crate::vault::builtin::VaultCrypto;
use crate::vault::CredentialStore;
use model_router::FailureKind;
use upstream::{ProviderClient, ProviderReply};

/// Longest vendor error message carried into our own errors.
const MAX_ERROR_MESSAGE_LEN: usize = 300;

/// A validated request with its framework resolved and body rendered.
#[derive(Debug, Clone)]
pub struct PreparedPrompt {
    pub framework: &'static FrameworkTemplate,
    pub body: String,
}

pub struct Dispatcher {
    frameworks: Arc<FrameworkRegistry>,
    credentials: Arc<CredentialStore>,
    client: Arc<ProviderClient>,
}

impl Dispatcher {
    pub fn new(
        frameworks: Arc<FrameworkRegistry>,
        credentials: Arc<CredentialStore>,
        client: Arc<ProviderClient>,
    ) -> Self {
        Self {
            frameworks,
            credentials,
            client,
        }
    }

    pub fn frameworks(&self) -> &FrameworkRegistry {
        &self.frameworks
    }

    /// Validate and render without touching storage or the network.
    pub fn prepare(&self, req: &GenerationRequest) -> Result<PreparedPrompt, DispatchError> {
        req.validate()?;
        let framework = self
            .frameworks
            .get(&req.framework_id)
            .ok_or_else(|| DispatchError::UnknownFramework(req.framework_id.clone()))?;
        Ok(PreparedPrompt {
            framework,
            body: framework.render(req),
        })
    }

    pub async fn generate(
        &self,
        user_id: Uuid,
        req: &GenerationRequest,
        abort: Option<AbortRegistration>,
    ) -> Result<GenerationResult, DispatchError> {
        let prepared = self.prepare(req)?;
        self.dispatch_prepared(user_id, &prepared, abort).await
    }

    /// Resolve the active provider's key and call it. When `abort` fires the
    /// in-flight call is dropped and the outcome is [`DispatchError::Cancelled`].
    pub async fn dispatch_prepared(
        &self,
        user_id: Uuid,
        prepared: &PreparedPrompt,
        abort: Option<AbortRegistration>,
    ) -> Result<GenerationResult, DispatchError> {
        let work = self.call_active_provider(user_id, prepared);
        match abort {
            Some(registration) => match Abortable::new(work, registration).await {
                Ok(result) => result,
                Err(_aborted) => {
                    tracing::info!(%user_id, framework = prepared.framework.id, "generation cancelled");
                    Err(DispatchError::Cancelled)
                }
            },
            None => work.await,
        }
    }

    async fn call_active_provider(
        &self,
        user_id: Uuid,
        prepared: &PreparedPrompt,
    ) -> Result<GenerationResult, DispatchError> {
        let provider = self
            .credentials
            .active_provider(user_id)
            .await?
            .ok_or(DispatchError::NoActiveProvider)?;
        let key = self.credentials.get(user_id, provider).await?;
        self.generate_with_key(provider, &key, prepared).await
    }

    /// Try each model variant in order. Only an unknown-model reply moves on
    /// to the next variant; any other failure ends the attempt.
    pub async fn generate_with_key(
        &self,
        provider: Provider,
        api_key: &str,
        prepared: &PreparedPrompt,
    ) -> Result<GenerationResult, DispatchError> {
        let base_url = self.client.base_url(provider);
        let variants = provider.model_variants();

        for &model in variants {
            let call = model_router::generation_call(provider, base_url, model, api_key, &prepared.body)
                .map_err(|_| DispatchError::ProviderAuthError {
                    provider,
                    message: "stored key contains characters that cannot be sent in a header".into(),
                })?;

            tracing::debug!(%provider, model, framework = prepared.framework.id, "calling provider");
            let reply = self
                .client
                .send(call)
                .await
                .map_err(|e| transport_error(provider, e))?;

            if reply.status.is_success() {
                return match model_router::extract_text(provider, &reply.body) {
                    Some(text) => {
                        tracing::info!(%provider, model, framework = prepared.framework.id, "prompt generated");
                        Ok(GenerationResult::completed(prepared.framework.id, provider, model, text))
                    }
                    None => {
                        tracing::warn!(%provider, model, "provider reply had no text at the expected path");
                        Err(DispatchError::MalformedResponse {
                            provider,
                            model: model.to_string(),
                        })
                    }
                };
            }

            let (kind, err) = failure_from_reply(provider, &reply);
            if kind == FailureKind::ModelNotFound {
                tracing::debug!(%provider, model, "model not available, trying next variant");
                continue;
            }
            tracing::warn!(%provider, model, status = reply.status.as_u16(), code = err.code(), "provider call failed");
            return Err(err);
        }

        Err(DispatchError::ProviderUnavailable {
            provider,
            message: format!("none of the model variants are available ({})", variants.join(", ")),
        })
    }
}

/// Build the credential store and dispatcher once at startup. Both share
/// one provider HTTP client.
pub fn build_services(
    config: &Config,
    backend: Arc<dyn CredentialBackend>,
) -> anyhow::Result<(Arc<CredentialStore>, Dispatcher)> {
    let client = Arc::new(ProviderClient::new(config.upstream.clone())?);
    let crypto = VaultCrypto::new(&config.master_key)?;
    let credentials = Arc::new(CredentialStore::new(crypto, backend, client.clone()));
    let dispatcher = Dispatcher::new(
        Arc::new(FrameworkRegistry::builtin()),
        credentials.clone(),
        client,
    );
    Ok((credentials, dispatcher))
}

/// Map a non-2xx reply to its fallback decision and the error it becomes.
pub(crate) fn failure_from_reply(provider: Provider, reply: &ProviderReply) -> (FailureKind, DispatchError) {
    let details = model_router::error_details(provider, &reply.body);
    let kind = model_router::classify_failure(provider, reply.status, &details);
    let message = details
        .message
        .map(|m| truncate(&m, MAX_ERROR_MESSAGE_LEN))
        .unwrap_or_else(|| format!("HTTP {}", reply.status.as_u16()));

    let err = match kind {
        FailureKind::Auth => DispatchError::ProviderAuthError { provider, message },
        FailureKind::RateLimited => DispatchError::ProviderRateLimited {
            provider,
            message,
            retry_after: reply.retry_after,
        },
        FailureKind::Unavailable => DispatchError::ProviderUnavailable { provider, message },
        FailureKind::ModelNotFound | FailureKind::Rejected => DispatchError::ProviderRejected {
            provider,
            status: reply.status.as_u16(),
            message,
        },
    };
    (kind, err)
}

/// Connect failures, timeouts and broken bodies all mean the provider could
/// not be reached.
pub(crate) fn transport_error(provider: Provider, err: reqwest_middleware::Error) -> DispatchError {
    let message = match &err {
        reqwest_middleware::Error::Reqwest(e) if e.is_timeout() => "request timed out".to_string(),
        reqwest_middleware::Error::Reqwest(e) if e.is_connect() => "could not connect".to_string(),
        other => other.to_string(),
    };
    DispatchError::ProviderUnavailable { provider, message }
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}…", &s[..idx]),
        None => s.to_string(),
    }
}

/// At most one generation in flight per user: starting a new one aborts the
/// previous one.
#[derive(Default)]
pub struct InFlight {
    next_ticket: AtomicU64,
    handles: DashMap<Uuid, (u64, AbortHandle)>,
}

/// Registration for one generation, released with [`InFlight::finish`].
pub struct Ticket {
    pub user_id: Uuid,
    id: u64,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self, user_id: Uuid) -> (Ticket, AbortRegistration) {
        let (handle, registration) = AbortHandle::new_pair();
        let id = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        // One swap: concurrent begins for the same user each abort whatever they displaced.
        if let Some((_, previous)) = self.handles.insert(user_id, (id, handle)) {
            tracing::debug!(%user_id, "superseding in-flight generation");
            previous.abort();
        }
        (Ticket { user_id, id }, registration)
    }

    /// Drop the registration unless a newer generation replaced it.
    pub fn finish(&self, ticket: Ticket) {
        self.handles
            .remove_if(&ticket.user_id, |_, (id, _)| *id == ticket.id);
    }

    /// Abort the user's in-flight generation, if any. Returns whether one was running.
    pub fn cancel(&self, user_id: Uuid) -> bool {
        match self.handles.remove(&user_id) {
            Some((_, (_, handle))) => {
                handle.abort();
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    fn reply(status: u16, body: &str) -> ProviderReply {
        ProviderReply {
            status: StatusCode::from_u16(status).unwrap(),
            retry_after: Some(12),
            body: body.as_bytes().to_vec(),
        }
    }

    #[test]
    fn test_rate_limit_keeps_retry_after() {
        let (kind, err) = failure_from_reply(
            Provider::OpenAI,
            &reply(429, r#"{"error":{"message":"Rate limit reached","type":"requests"}}"#),
        );
        assert_eq!(kind, FailureKind::RateLimited);
        match err {
            DispatchError::ProviderRateLimited { retry_after, message, .. } => {
                assert_eq!(retry_after, Some(12));
                assert_eq!(message, "Rate limit reached");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_auth_is_never_reported_as_rate_limit() {
        let (_, err) = failure_from_reply(
            Provider::Anthropic,
            &reply(401, r#"{"type":"error","error":{"type":"authentication_error","message":"invalid x-api-key"}}"#),
        );
        assert_eq!(err.code(), "provider_auth_error");
    }

    #[test]
    fn test_unparseable_error_body_uses_status() {
        let (kind, err) = failure_from_reply(Provider::Gemini, &reply(503, "<html>down</html>"));
        assert_eq!(kind, FailureKind::Unavailable);
        assert_eq!(err.to_string(), "gemini is unavailable: HTTP 503");
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé…");
        assert_eq!(truncate("ok", 10), "ok");
    }

    #[tokio::test]
    async fn test_new_generation_aborts_previous() {
        let inflight = InFlight::new();
        let user = Uuid::new_v4();

        let (first, reg) = inflight.begin(user);
        let pending = Abortable::new(futures::future::pending::<()>(), reg);
        let (second, _reg2) = inflight.begin(user);

        assert!(pending.await.is_err());
        // The stale ticket must not evict the newer registration.
        inflight.finish(first);
        assert!(inflight.cancel(user));
        inflight.finish(second);
        assert!(!inflight.cancel(user));
    }

    #[test]
    fn test_racing_begins_leave_exactly_one_running() {
        use futures::FutureExt;
        use std::sync::Barrier;

        let inflight = Arc::new(InFlight::new());
        for _ in 0..2000 {
            let user = Uuid::new_v4();
            let barrier = Arc::new(Barrier::new(2));
            let threads: Vec<_> = (0..2)
                .map(|_| {
                    let inflight = inflight.clone();
                    let barrier = barrier.clone();
                    std::thread::spawn(move || {
                        barrier.wait();
                        inflight.begin(user)
                    })
                })
                .collect();

            // An aborted registration resolves at once; a live one stays pending.
            let running = threads
                .into_iter()
                .map(|t| t.join().unwrap().1)
                .map(|reg| Abortable::new(futures::future::pending::<()>(), reg).now_or_never())
                .filter(Option::is_none)
                .count();
            assert_eq!(running, 1);
            assert!(inflight.cancel(user));
        }
    }
}
