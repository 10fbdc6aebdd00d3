/// HTTP client for calls to the provider APIs.
/// Uses reqwest-middleware for transport-level retries and tracing.
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{
    default_on_request_failure, policies::ExponentialBackoff, Retryable, RetryableStrategy,
    RetryTransientMiddleware,
};
use std::time::Duration;

use crate::config::UpstreamSettings;
use crate::models::provider::Provider;

/// A fully built provider request.
#[derive(Debug, Clone)]
pub struct ProviderCall {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Option<serde_json::Value>,
}

/// Raw provider reply: status, Retry-After hint, and the unparsed body.
#[derive(Debug, Clone)]
pub struct ProviderReply {
    pub status: StatusCode,
    pub retry_after: Option<u64>,
    pub body: Vec<u8>,
}

/// Retry only when no response arrived (connect errors, resets, timeouts).
/// Any HTTP status, 429 and 5xx included, goes back to the caller untouched.
struct TransportFailuresOnly;

impl RetryableStrategy for TransportFailuresOnly {
    fn handle(&self, res: &Result<reqwest::Response, reqwest_middleware::Error>) -> Option<Retryable> {
        match res {
            Ok(_) => None,
            Err(e) => default_on_request_failure(e),
        }
    }
}

pub struct ProviderClient {
    client: ClientWithMiddleware,
    settings: UpstreamSettings,
}

impl ProviderClient {
    pub fn new(settings: UpstreamSettings) -> anyhow::Result<Self> {
        let reqwest_client = reqwest::Client::builder()
            .use_rustls_tls()
            .pool_max_idle_per_host(16)
            .timeout(settings.request_timeout)
            .connect_timeout(Duration::from_secs(5))
            .build()?;

        let retry_policy =
            ExponentialBackoff::builder().build_with_max_retries(settings.transient_retries);

        let client = ClientBuilder::new(reqwest_client)
            .with(RetryTransientMiddleware::new_with_policy_and_strategy(
                retry_policy,
                TransportFailuresOnly,
            ))
            .build();

        Ok(Self { client, settings })
    }

    pub fn base_url(&self, provider: Provider) -> &str {
        self.settings.base_url(provider)
    }

    /// Send one request. Transport failures (DNS, connect, timeout) are
    /// returned as `Err`; any HTTP status, including errors, is `Ok`.
    pub async fn send(&self, call: ProviderCall) -> Result<ProviderReply, reqwest_middleware::Error> {
        let mut request = self
            .client
            .request(call.method, &call.url)
            .headers(call.headers);
        if let Some(body) = &call.body {
            request = request
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body.to_string());
        }

        let resp = request.send().await.map_err(|e| {
            tracing::warn!("provider request failed: {}", e);
            e
        })?;

        let status = resp.status();
        let retry_after = resp
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        let body = resp.bytes().await.map_err(reqwest_middleware::Error::from)?;

        Ok(ProviderReply {
            status,
            retry_after,
            body: body.to_vec(),
        })
    }
}
