use std::sync::Arc;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};

use crate::auth::{Credential, TokenConfig};
use crate::error::ZaiError;
use crate::http::{RequestMiddleware, ResponseMiddleware};
use crate::retry::RetryConfig;

/// Default Z.ai API base URL
pub const ZAI_DEFAULT_BASE: &str = "https://api.z.ai/api/paas/v4/";
/// Mainland BigModel API base URL
pub const BIGMODEL_BASE: &str = "https://open.bigmodel.cn/api/paas/v4/";
/// Environment variable holding the `id.secret` credential
pub const ENV_API_KEY: &str = "ZAI_API_KEY";
/// Environment variable overriding the base URL
pub const ENV_BASE_URL: &str = "ZAI_BASE_URL";

/// Construction options for [`Client`](crate::Client)
///
/// Every field is optional except `api_key`. Debug output redacts the key via
/// [`SecretString`].
#[derive(Clone, Default)]
pub struct ClientOptions {
    /// `id.secret` credential; required
    pub api_key: Option<SecretString>,
    /// Origin plus path prefix; defaults to [`ZAI_DEFAULT_BASE`]
    pub base_url: Option<String>,
    /// Per-attempt wall clock; ignored when `http_client` is supplied
    pub timeout: Option<Duration>,
    /// Overrides `retry.max_retries`
    pub max_retries: Option<u32>,
    /// Send the raw credential instead of a signed token
    pub disable_token_cache: bool,
    /// Custom transport
    pub http_client: Option<reqwest::Client>,
    /// Subscriber every client call runs under; `None` uses the ambient default
    pub logger: Option<tracing::Dispatch>,
    /// Retry policy; defaults to [`RetryConfig::default`]
    pub retry: Option<RetryConfig>,
    /// Token lifetimes; defaults to [`TokenConfig::default`]
    pub token: Option<TokenConfig>,
    /// Value of the `x-source-channel` header
    pub source_channel: Option<String>,
    /// Run before every attempt, in order
    pub request_middleware: Vec<Arc<dyn RequestMiddleware>>,
    /// Run after every attempt, in order
    pub response_middleware: Vec<Arc<dyn ResponseMiddleware>>,
}

impl std::fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientOptions")
            .field("api_key", &self.api_key)
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .field("max_retries", &self.max_retries)
            .field("disable_token_cache", &self.disable_token_cache)
            .field("http_client", &self.http_client.is_some())
            .field("logger", &self.logger.is_some())
            .field("retry", &self.retry)
            .field("token", &self.token)
            .field("source_channel", &self.source_channel)
            .field("request_middleware", &self.request_middleware.len())
            .field("response_middleware", &self.response_middleware.len())
            .finish()
    }
}

fn env_trimmed(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl ClientOptions {
    /// Options populated from the environment
    ///
    /// Reads:
    /// - `ZAI_API_KEY` for the credential
    /// - `ZAI_BASE_URL` for a custom base URL (defaults to `https://api.z.ai/api/paas/v4/`)
    ///
    /// Values are trimmed; an empty value counts as unset.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            api_key: env_trimmed(ENV_API_KEY).map(SecretString::from),
            base_url: env_trimmed(ENV_BASE_URL),
            ..Self::default()
        }
    }

    /// Base URL to use, falling back to [`ZAI_DEFAULT_BASE`]
    #[must_use]
    pub fn base_url_or_default(&self) -> &str {
        self.base_url
            .as_deref()
            .map(str::trim)
            .filter(|b| !b.is_empty())
            .unwrap_or(ZAI_DEFAULT_BASE)
    }

    /// Retry policy with `max_retries` applied
    #[must_use]
    pub fn effective_retry(&self) -> RetryConfig {
        let mut retry = self.retry.clone().unwrap_or_default();
        if let Some(n) = self.max_retries {
            retry.max_retries = n;
        }
        retry
    }

    /// Parses the configured key.
    ///
    /// # Errors
    ///
    /// Returns [`ZaiError::Config`] if the key is missing, blank, or not `id.secret`.
    pub fn credential(&self) -> Result<Credential, ZaiError> {
        let key = self
            .api_key
            .as_ref()
            .map(|k| k.expose_secret().trim())
            .filter(|k| !k.is_empty())
            .ok_or_else(|| {
                ZaiError::Config(format!(
                    "Missing Z.ai credentials: set {ENV_API_KEY} environment variable"
                ))
            })?;
        Credential::parse(key).map_err(|e| ZaiError::Config(format!("Invalid API key: {e}")))
    }
}
