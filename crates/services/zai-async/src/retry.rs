//! Retry policy and the retrying executor.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use backon::{BackoffBuilder, ExponentialBuilder};
use rand::Rng;
use reqwest::header::{AUTHORIZATION, HeaderMap, RETRY_AFTER};
use reqwest::{Method, Request, Response};
use tokio_util::sync::CancellationToken;

use crate::auth::Authorizer;
use crate::error::ZaiError;
use crate::http::HttpCore;

/// Statuses retried by default for idempotent methods
pub const DEFAULT_RETRYABLE_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];
/// Upper bound on a server-advertised `Retry-After`
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(300);
/// Maximum fraction of the base delay added as jitter
pub const JITTER_FRACTION: f64 = 0.25;

// bytes read from a discarded response before dropping it
const MAX_DRAIN_BYTES: usize = 64 * 1024;

/// Retry policy
///
/// Defaults:
/// - Max retries: 3 (four attempts in total)
/// - Initial backoff: 500ms
/// - Max backoff: 8s
/// - Multiplier: 2.0
/// - Jitter enabled, up to +25% of each delay
/// - Retryable statuses: 429, 500, 502, 503, 504
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_backoff: Duration,
    /// Cap on any single computed delay
    pub max_backoff: Duration,
    /// Growth factor between consecutive delays
    pub multiplier: f32,
    /// Add random jitter to computed delays
    pub jitter: bool,
    /// Statuses that trigger a retry for idempotent methods
    pub retryable_statuses: Vec<u16>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
            multiplier: 2.0,
            jitter: true,
            retryable_statuses: DEFAULT_RETRYABLE_STATUSES.to_vec(),
        }
    }
}

impl RetryConfig {
    /// A policy that never retries
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Checks delay ordering and the multiplier.
    ///
    /// # Errors
    ///
    /// Returns [`ZaiError::Config`] if `max_backoff < initial_backoff` or the
    /// multiplier is below 1 or not finite.
    pub fn validate(&self) -> Result<(), ZaiError> {
        if self.max_backoff < self.initial_backoff {
            return Err(ZaiError::Config(format!(
                "max_backoff ({:?}) must not be below initial_backoff ({:?})",
                self.max_backoff, self.initial_backoff
            )));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(ZaiError::Config(format!(
                "backoff multiplier must be >= 1, got {}",
                self.multiplier
            )));
        }
        Ok(())
    }

    /// Base delay schedule, without jitter; yields `max_retries` delays
    #[must_use]
    pub fn backoff_builder(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.initial_backoff)
            .with_max_delay(self.max_backoff)
            .with_factor(self.multiplier)
            .with_max_times(self.max_retries as usize)
    }

    /// Whether `status` is in the retryable set
    #[must_use]
    pub fn is_retryable_status(&self, status: u16) -> bool {
        self.retryable_statuses.contains(&status)
    }
}

/// Methods whose repetition has no additional effect
#[must_use]
pub fn is_idempotent(method: &Method) -> bool {
    [
        Method::GET,
        Method::HEAD,
        Method::OPTIONS,
        Method::TRACE,
        Method::PUT,
        Method::DELETE,
    ]
    .contains(method)
}

/// Reads `Retry-After` as integer seconds or an HTTP-date.
///
/// Both forms are capped at [`MAX_RETRY_AFTER`]; dates in the past, negative or
/// unparseable values yield `None`.
#[must_use]
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();

    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs).min(MAX_RETRY_AFTER));
    }

    let at = httpdate::parse_http_date(value).ok()?;
    let wait = at.duration_since(SystemTime::now()).ok()?;
    Some(wait.min(MAX_RETRY_AFTER))
}

fn jittered(delay: Duration) -> Duration {
    let frac = rand::thread_rng().gen_range(0.0..=JITTER_FRACTION);
    delay + delay.mul_f64(frac)
}

fn is_transient(e: &ZaiError) -> bool {
    match e {
        ZaiError::Connection(_) | ZaiError::Timeout(_) => true,
        ZaiError::Http(inner) => !inner.is_builder(),
        _ => false,
    }
}

async fn drain(mut response: Response) {
    let mut drained = 0;
    while drained < MAX_DRAIN_BYTES {
        match response.chunk().await {
            Ok(Some(chunk)) => drained += chunk.len(),
            Ok(None) | Err(_) => break,
        }
    }
}

/// Executes requests through [`HttpCore`], retrying transient failures
///
/// Each attempt attaches a fresh `Authorization` header. The final response is
/// returned raw, whatever its status; classification is up to the caller.
#[derive(Debug, Clone)]
pub struct RetryWrapper {
    core: Arc<HttpCore>,
    config: RetryConfig,
    auth: Option<Authorizer>,
}

impl RetryWrapper {
    /// Wraps `core` with `config`
    #[must_use]
    pub const fn new(core: Arc<HttpCore>, config: RetryConfig) -> Self {
        Self {
            core,
            config,
            auth: None,
        }
    }

    /// Attaches an authorizer consulted on every attempt
    #[must_use]
    pub fn with_authorizer(mut self, auth: Authorizer) -> Self {
        self.auth = Some(auth);
        self
    }

    /// The active retry policy
    #[must_use]
    pub const fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// The wrapped core
    #[must_use]
    pub const fn core(&self) -> &Arc<HttpCore> {
        &self.core
    }

    /// Sends `request`, replaying it with `Request::try_clone` when a retry is needed.
    ///
    /// # Errors
    ///
    /// Returns [`ZaiError::Cancelled`] when `cancel` fires, [`ZaiError::NonRetryableBody`]
    /// when a retry is due but the body is a one-shot stream, or the last transport error.
    pub async fn execute(
        &self,
        request: Request,
        cancel: &CancellationToken,
    ) -> Result<Response, ZaiError> {
        let method = request.method().clone();
        let template = request.try_clone();
        let mut first = Some(request);
        let next = move || match first.take() {
            Some(r) => Ok(r),
            None => template
                .as_ref()
                .and_then(Request::try_clone)
                .ok_or(ZaiError::NonRetryableBody),
        };
        self.run(&method, next, cancel).await
    }

    /// Sends requests built by `factory`, called once per attempt.
    ///
    /// Use this when the body cannot be cloned but can be rebuilt.
    ///
    /// # Errors
    ///
    /// As [`execute`](Self::execute), plus any error returned by `factory`.
    pub async fn execute_with<F>(
        &self,
        method: Method,
        factory: F,
        cancel: &CancellationToken,
    ) -> Result<Response, ZaiError>
    where
        F: FnMut() -> Result<Request, ZaiError> + Send,
    {
        self.run(&method, factory, cancel).await
    }

    fn authorize(&self, request: &mut Request) -> Result<(), ZaiError> {
        if let Some(auth) = &self.auth {
            request
                .headers_mut()
                .insert(AUTHORIZATION, auth.header_value()?);
        }
        Ok(())
    }

    fn retry_hint(
        &self,
        method: &Method,
        outcome: &Result<Response, ZaiError>,
    ) -> Option<Option<Duration>> {
        match outcome {
            Ok(resp)
                if is_idempotent(method)
                    && self.config.is_retryable_status(resp.status().as_u16()) =>
            {
                Some(parse_retry_after(resp.headers()))
            }
            Err(e) if is_transient(e) => Some(None),
            _ => None,
        }
    }

    async fn run<F>(
        &self,
        method: &Method,
        mut next_request: F,
        cancel: &CancellationToken,
    ) -> Result<Response, ZaiError>
    where
        F: FnMut() -> Result<Request, ZaiError> + Send,
    {
        let mut backoff = self.config.backoff_builder().build();
        let mut request = next_request()?;
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(ZaiError::Cancelled);
            }
            self.authorize(&mut request)?;

            let outcome = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(ZaiError::Cancelled),
                r = self.core.send(request) => r,
            };

            let Some(hint) = self.retry_hint(method, &outcome) else {
                return outcome;
            };
            let Some(base) = backoff.next() else {
                if attempt > 0 {
                    tracing::warn!(attempt, "retries exhausted");
                }
                return outcome;
            };
            attempt += 1;

            let delay = match hint {
                Some(server) => server,
                None if self.config.jitter => jittered(base),
                None => base,
            };
            let reason = match &outcome {
                Ok(resp) => resp.status().to_string(),
                Err(e) => e.to_string(),
            };

            let replay = next_request();
            if let Ok(resp) = outcome {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => return Err(ZaiError::Cancelled),
                    () = drain(resp) => {}
                }
            }
            request = replay?;

            tracing::debug!(
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                reason = %reason,
                "retrying request"
            );

            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(ZaiError::Cancelled),
                () = tokio::time::sleep(delay) => {}
            }
        }
    }
}
