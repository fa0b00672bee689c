use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{ACCEPT, HeaderMap, HeaderValue};
use reqwest::{Method, Response};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::instrument::WithSubscriber;

use crate::auth::{Authorizer, TokenGenerator};
use crate::config::ClientOptions;
use crate::error::{ZaiError, map_deser};
use crate::http::{
    DEFAULT_SOURCE_CHANNEL, DEFAULT_TIMEOUT, HDR_RAW_RESPONSE, HttpCore, build_http_client,
};
use crate::retry::RetryWrapper;
use crate::stream::Stream;

/// Per-call options
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Cancels the call, including retry sleeps and stream reads
    pub cancel: CancellationToken,
    /// Extra query pairs
    pub query: Vec<(String, String)>,
    /// Extra headers; these win over the client defaults
    pub headers: HeaderMap,
    /// Send `X-Stainless-Raw-Response: true`
    pub raw_response: bool,
    /// Tighter per-attempt timeout
    pub timeout: Option<Duration>,
}

impl RequestOptions {
    /// Options bound to `cancel`
    #[must_use]
    pub fn with_cancel(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            ..Self::default()
        }
    }
}

/// Z.ai API client
///
/// Cheap to clone; clones share the connection pool and token cache.
#[derive(Debug, Clone)]
pub struct Client {
    retry: RetryWrapper,
    tokens: Arc<TokenGenerator>,
    logger: Option<tracing::Dispatch>,
}

impl Client {
    /// Builds a client from explicit options.
    ///
    /// # Errors
    ///
    /// Returns [`ZaiError::Config`] for a missing or malformed key, an unusable base
    /// URL, or an invalid retry or token configuration.
    pub fn new(options: ClientOptions) -> Result<Self, ZaiError> {
        let credential = options.credential()?;

        let retry_config = options.effective_retry();
        retry_config.validate()?;
        let token_config = options.token.unwrap_or_default();
        token_config.validate()?;

        let http = match &options.http_client {
            Some(client) => client.clone(),
            None => build_http_client(options.timeout.unwrap_or(DEFAULT_TIMEOUT))?,
        };
        let mut core = HttpCore::new(
            options.base_url_or_default(),
            http,
            options
                .source_channel
                .as_deref()
                .unwrap_or(DEFAULT_SOURCE_CHANNEL),
        )?;
        for m in &options.request_middleware {
            core.push_request_middleware(Arc::clone(m));
        }
        for m in &options.response_middleware {
            core.push_response_middleware(Arc::clone(m));
        }

        let tokens = Arc::new(TokenGenerator::new(token_config));
        let auth = if options.disable_token_cache {
            tokens.disable_cache();
            Authorizer::Raw(credential)
        } else {
            Authorizer::Signed {
                generator: Arc::clone(&tokens),
                credential,
            }
        };

        Ok(Self {
            retry: RetryWrapper::new(Arc::new(core), retry_config).with_authorizer(auth),
            tokens,
            logger: options.logger,
        })
    }

    /// Builds a client from `ZAI_API_KEY` and `ZAI_BASE_URL`.
    ///
    /// # Errors
    ///
    /// As [`new`](Self::new).
    pub fn from_env() -> Result<Self, ZaiError> {
        Self::new(ClientOptions::from_env())
    }

    /// The HTTP core
    #[must_use]
    pub fn http(&self) -> &HttpCore {
        self.retry.core()
    }

    /// The retrying executor
    #[must_use]
    pub const fn retry(&self) -> &RetryWrapper {
        &self.retry
    }

    /// The shared token generator
    #[must_use]
    pub const fn tokens(&self) -> &Arc<TokenGenerator> {
        &self.tokens
    }

    /// `GET` and decode the JSON response.
    ///
    /// # Errors
    ///
    /// Transport errors, a classified status error for non-2xx, or
    /// [`ZaiError::ResponseValidation`] if a 2xx body does not decode.
    pub async fn get<O: DeserializeOwned>(
        &self,
        path: &str,
        opts: RequestOptions,
    ) -> Result<O, ZaiError> {
        self.scoped(self.call::<(), O>(Method::GET, path, None, opts))
            .await
    }

    /// `DELETE` and decode the JSON response.
    ///
    /// # Errors
    ///
    /// As [`get`](Self::get).
    pub async fn delete<O: DeserializeOwned>(
        &self,
        path: &str,
        opts: RequestOptions,
    ) -> Result<O, ZaiError> {
        self.scoped(self.call::<(), O>(Method::DELETE, path, None, opts))
            .await
    }

    /// `POST` a JSON body and decode the JSON response.
    ///
    /// # Errors
    ///
    /// As [`get`](Self::get).
    pub async fn post<I, O>(&self, path: &str, body: &I, opts: RequestOptions) -> Result<O, ZaiError>
    where
        I: Serialize + ?Sized + Sync,
        O: DeserializeOwned,
    {
        self.scoped(self.call(Method::POST, path, Some(body), opts))
            .await
    }

    /// `PUT` a JSON body and decode the JSON response.
    ///
    /// # Errors
    ///
    /// As [`get`](Self::get).
    pub async fn put<I, O>(&self, path: &str, body: &I, opts: RequestOptions) -> Result<O, ZaiError>
    where
        I: Serialize + ?Sized + Sync,
        O: DeserializeOwned,
    {
        self.scoped(self.call(Method::PUT, path, Some(body), opts))
            .await
    }

    /// `PATCH` a JSON body and decode the JSON response.
    ///
    /// # Errors
    ///
    /// As [`get`](Self::get).
    pub async fn patch<I, O>(&self, path: &str, body: &I, opts: RequestOptions) -> Result<O, ZaiError>
    where
        I: Serialize + ?Sized + Sync,
        O: DeserializeOwned,
    {
        self.scoped(self.call(Method::PATCH, path, Some(body), opts))
            .await
    }

    /// Sends a request through the retry wrapper and returns the raw response.
    ///
    /// The status is not inspected.
    ///
    /// # Errors
    ///
    /// Transport, middleware, cancellation, or body-replay errors.
    pub async fn execute_raw<I>(
        &self,
        method: Method,
        path: &str,
        body: Option<&I>,
        opts: &RequestOptions,
    ) -> Result<Response, ZaiError>
    where
        I: Serialize + ?Sized + Sync,
    {
        self.scoped(self.send(method, path, body, opts)).await
    }

    /// `POST` a JSON body and stream the server-sent events as `T`.
    ///
    /// The request is not retried on status (POST is not idempotent) but transport
    /// errors before the response are.
    ///
    /// # Errors
    ///
    /// Transport errors, or a classified status error if the response is not 2xx.
    pub async fn post_stream<I, T>(
        &self,
        path: &str,
        body: &I,
        mut opts: RequestOptions,
    ) -> Result<Stream<T>, ZaiError>
    where
        I: Serialize + ?Sized + Sync,
        T: DeserializeOwned,
    {
        opts.headers
            .entry(ACCEPT)
            .or_insert(HeaderValue::from_static("text/event-stream"));

        self.scoped(async {
            let response = self.send(Method::POST, path, Some(body), &opts).await?;
            if !response.status().is_success() {
                return Err(classify(response, &opts.cancel).await);
            }
            Ok(Stream::from_response(response, opts.cancel.clone())
                .with_logger(self.logger.clone()))
        })
        .await
    }

    async fn call<I, O>(
        &self,
        method: Method,
        path: &str,
        body: Option<&I>,
        opts: RequestOptions,
    ) -> Result<O, ZaiError>
    where
        I: Serialize + ?Sized + Sync,
        O: DeserializeOwned,
    {
        let response = self.send(method, path, body, &opts).await?;
        if !response.status().is_success() {
            return Err(classify(response, &opts.cancel).await);
        }
        let bytes = read_body(response, &opts.cancel).await?;
        serde_json::from_slice(&bytes).map_err(|e| map_deser(&e, &bytes))
    }

    async fn send<I>(
        &self,
        method: Method,
        path: &str,
        body: Option<&I>,
        opts: &RequestOptions,
    ) -> Result<Response, ZaiError>
    where
        I: Serialize + ?Sized + Sync,
    {
        let mut builder = self
            .http()
            .request(method, path, &opts.query)?
            .headers(opts.headers.clone());
        if let Some(body) = body {
            builder = builder.json(body);
        }
        if opts.raw_response {
            builder = builder.header(HDR_RAW_RESPONSE, HeaderValue::from_static("true"));
        }
        if let Some(timeout) = opts.timeout {
            builder = builder.timeout(timeout);
        }

        let request = builder.build()?;
        self.retry.execute(request, &opts.cancel).await
    }

    async fn scoped<F: Future>(&self, fut: F) -> F::Output {
        match &self.logger {
            Some(dispatch) => fut.with_subscriber(dispatch.clone()).await,
            None => fut.await,
        }
    }
}

async fn read_body(response: Response, cancel: &CancellationToken) -> Result<bytes::Bytes, ZaiError> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(ZaiError::Cancelled),
        r = response.bytes() => r.map_err(ZaiError::from),
    }
}

async fn classify(response: Response, cancel: &CancellationToken) -> ZaiError {
    let status = response.status();
    let headers = response.headers().clone();
    match read_body(response, cancel).await {
        Ok(bytes) => {
            tracing::debug!(status = status.as_u16(), "request failed");
            ZaiError::from_response_parts(status, &headers, &bytes)
        }
        Err(e) => e,
    }
}
