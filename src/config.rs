use std::time::Duration;

use anyhow::Context;

use crate::models::provider::Provider;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_url: String,
    /// 64 hex chars. Required; there is no fallback key.
    pub master_key: String,
    /// HS256 secret shared with the external identity provider.
    pub jwt_secret: Option<String>,
    pub jwt_audience: Option<String>,
    pub dashboard_origin: String,
    pub upstream: UpstreamSettings,
}

/// Outbound provider settings.
#[derive(Debug, Clone)]
pub struct UpstreamSettings {
    pub openai_base_url: String,
    pub gemini_base_url: String,
    pub anthropic_base_url: String,
    pub request_timeout: Duration,
    /// Transport-level retries inside the HTTP client. Zero keeps each
    /// model variant to a single attempt.
    pub transient_retries: u32,
}

impl UpstreamSettings {
    pub fn base_url(&self, provider: Provider) -> &str {
        match provider {
            Provider::OpenAI => &self.openai_base_url,
            Provider::Gemini => &self.gemini_base_url,
            Provider::Anthropic => &self.anthropic_base_url,
        }
    }

    /// Point every provider at the same base URL (mock servers, local relays).
    pub fn with_single_base_url(base_url: &str) -> Self {
        Self {
            openai_base_url: base_url.to_string(),
            gemini_base_url: base_url.to_string(),
            anthropic_base_url: base_url.to_string(),
            ..Self::default()
        }
    }
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            openai_base_url: Provider::OpenAI.default_base_url().to_string(),
            gemini_base_url: Provider::Gemini.default_base_url().to_string(),
            anthropic_base_url: Provider::Anthropic.default_base_url().to_string(),
            request_timeout: Duration::from_secs(60),
            transient_retries: 0,
        }
    }
}

impl Config {
    pub fn jwt_secret(&self) -> anyhow::Result<&str> {
        self.jwt_secret
            .as_deref()
            .context("FORGE_JWT_SECRET must be set to serve the HTTP API")
    }
}

pub fn load() -> anyhow::Result<Config> {
    dotenvy::dotenv().ok();
    from_lookup(|key| std::env::var(key).ok())
}

/// Build a config from any key lookup. `load` uses the process environment.
pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> anyhow::Result<Config> {
    let master_key = get("FORGE_MASTER_KEY")
        .filter(|v| !v.trim().is_empty())
        .context("FORGE_MASTER_KEY is not set. Generate one with `openssl rand -hex 32`.")?;
    crate::vault::builtin::parse_master_key(&master_key)?;

    let defaults = UpstreamSettings::default();
    let upstream = UpstreamSettings {
        openai_base_url: base_url(&get, "FORGE_OPENAI_BASE_URL", &defaults.openai_base_url)?,
        gemini_base_url: base_url(&get, "FORGE_GEMINI_BASE_URL", &defaults.gemini_base_url)?,
        anthropic_base_url: base_url(
            &get,
            "FORGE_ANTHROPIC_BASE_URL",
            &defaults.anthropic_base_url,
        )?,
        request_timeout: number(&get, "FORGE_REQUEST_TIMEOUT_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.request_timeout),
        transient_retries: number(&get, "FORGE_TRANSIENT_RETRIES")?
            .unwrap_or(defaults.transient_retries),
    };

    Ok(Config {
        port: number(&get, "FORGE_PORT")?.unwrap_or(8080),
        database_url: get("DATABASE_URL")
            .unwrap_or_else(|| "postgres://localhost/promptcraft".into()),
        master_key,
        jwt_secret: get("FORGE_JWT_SECRET").filter(|v| !v.is_empty()),
        jwt_audience: get("FORGE_JWT_AUDIENCE").filter(|v| !v.is_empty()),
        dashboard_origin: get("DASHBOARD_ORIGIN")
            .unwrap_or_else(|| "http://localhost:3000".into()),
        upstream,
    })
}

/// Unset or blank means "use the default"; anything else must parse.
fn number<T>(get: &impl Fn(&str) -> Option<String>, key: &str) -> anyhow::Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    get(key)
        .filter(|v| !v.trim().is_empty())
        .map(|v| {
            v.trim()
                .parse::<T>()
                .with_context(|| format!("{} must be a non-negative integer, got {:?}", key, v))
        })
        .transpose()
}

fn base_url(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: &str,
) -> anyhow::Result<String> {
    let raw = get(key).unwrap_or_else(|| default.to_string());
    let parsed = url::Url::parse(&raw).with_context(|| format!("{} is not a valid URL", key))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        anyhow::bail!("{} must be an http(s) URL, got {}", key, raw);
    }
    Ok(raw.trim_end_matches('/').to_string())
}
