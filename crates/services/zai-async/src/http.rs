//! HTTP core: URL composition, default headers, middleware, and the transport call.
//!
//! Non-2xx responses are returned as-is; classifying them is left to the caller.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use reqwest::{Method, Request, RequestBuilder, Response};
use url::Url;

use crate::error::ZaiError;

/// Header identifying the client family on every request
pub const HDR_SOURCE_CHANNEL: &str = "x-source-channel";
/// Default value of [`HDR_SOURCE_CHANNEL`]
pub const DEFAULT_SOURCE_CHANNEL: &str = "rust-sdk";
/// Opt-in header asking the platform for an unprocessed response
pub const HDR_RAW_RESPONSE: &str = "X-Stainless-Raw-Response";
/// `User-Agent` sent when the caller does not set one
pub const USER_AGENT_VALUE: &str = concat!("zai-async/", env!("CARGO_PKG_VERSION"));

/// Per-attempt wall-clock limit
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);
/// Connect limit
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(8);
/// Idle pooled connections are closed after this long
pub const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
/// Idle pooled connections kept per host
pub const POOL_MAX_IDLE_PER_HOST: usize = 10;

/// Mutates an outgoing request; an error aborts the call
pub trait RequestMiddleware: Send + Sync {
    /// Called before the request is handed to the transport
    ///
    /// # Errors
    ///
    /// Any error aborts the call and is surfaced unchanged.
    fn on_request(&self, request: &mut Request) -> Result<(), ZaiError>;
}

impl<F> RequestMiddleware for F
where
    F: Fn(&mut Request) -> Result<(), ZaiError> + Send + Sync,
{
    fn on_request(&self, request: &mut Request) -> Result<(), ZaiError> {
        self(request)
    }
}

/// Observes a received response; an error closes the body and fails the call
pub trait ResponseMiddleware: Send + Sync {
    /// Called after the transport returns a response
    ///
    /// # Errors
    ///
    /// Any error drops the response and is surfaced unchanged.
    fn on_response(&self, response: &Response) -> Result<(), ZaiError>;
}

impl<F> ResponseMiddleware for F
where
    F: Fn(&Response) -> Result<(), ZaiError> + Send + Sync,
{
    fn on_response(&self, response: &Response) -> Result<(), ZaiError> {
        self(response)
    }
}

/// Builds the default pooled transport.
///
/// # Errors
///
/// Returns [`ZaiError::Config`] if the TLS backend cannot be initialised.
pub fn build_http_client(timeout: Duration) -> Result<reqwest::Client, ZaiError> {
    reqwest::Client::builder()
        .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
        .timeout(timeout)
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
        .build()
        .map_err(|e| ZaiError::Config(format!("failed to build HTTP client: {e}")))
}

/// Shared HTTP substrate for every service call
#[derive(Clone)]
pub struct HttpCore {
    http: reqwest::Client,
    base_url: Url,
    default_headers: HeaderMap,
    request_middleware: Vec<Arc<dyn RequestMiddleware>>,
    response_middleware: Vec<Arc<dyn ResponseMiddleware>>,
}

impl std::fmt::Debug for HttpCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpCore")
            .field("base_url", &self.base_url.as_str())
            .field("default_headers", &self.default_headers)
            .field("request_middleware", &self.request_middleware.len())
            .field("response_middleware", &self.response_middleware.len())
            .finish_non_exhaustive()
    }
}

impl HttpCore {
    /// Creates a core rooted at `base_url`.
    ///
    /// The base path is normalised to a directory (one trailing slash) and any query
    /// or fragment on it is discarded.
    ///
    /// # Errors
    ///
    /// Returns [`ZaiError::Config`] if the URL is not absolute `http(s)` or the source
    /// channel is not a valid header value.
    pub fn new(
        base_url: &str,
        http: reqwest::Client,
        source_channel: &str,
    ) -> Result<Self, ZaiError> {
        let mut base = Url::parse(base_url.trim())
            .map_err(|e| ZaiError::Config(format!("invalid base URL {base_url:?}: {e}")))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(ZaiError::Config(format!(
                "base URL must be http or https, got {:?}",
                base.scheme()
            )));
        }
        base.set_query(None);
        base.set_fragment(None);
        let dir = format!("{}/", base.path().trim_end_matches('/'));
        base.set_path(&dir);

        let mut default_headers = HeaderMap::new();
        default_headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        default_headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        default_headers.insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_VALUE));
        default_headers.insert(
            HeaderName::from_static(HDR_SOURCE_CHANNEL),
            HeaderValue::from_str(source_channel)
                .map_err(|_| ZaiError::Config("Invalid source channel value".into()))?,
        );

        Ok(Self {
            http,
            base_url: base,
            default_headers,
            request_middleware: Vec::new(),
            response_middleware: Vec::new(),
        })
    }

    /// Appends a request middleware; middleware runs in insertion order
    pub fn add_request_middleware<M: RequestMiddleware + 'static>(&mut self, middleware: M) {
        self.push_request_middleware(Arc::new(middleware));
    }

    /// Appends an already shared request middleware
    pub fn push_request_middleware(&mut self, middleware: Arc<dyn RequestMiddleware>) {
        self.request_middleware.push(middleware);
    }

    /// Appends a response middleware; middleware runs in insertion order
    pub fn add_response_middleware<M: ResponseMiddleware + 'static>(&mut self, middleware: M) {
        self.push_response_middleware(Arc::new(middleware));
    }

    /// Appends an already shared response middleware
    pub fn push_response_middleware(&mut self, middleware: Arc<dyn ResponseMiddleware>) {
        self.response_middleware.push(middleware);
    }

    /// The normalised base URL
    #[must_use]
    pub const fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// The underlying transport
    #[must_use]
    pub const fn http_client(&self) -> &reqwest::Client {
        &self.http
    }

    /// Resolves `path` against the base URL.
    ///
    /// Absolute `http(s)://` paths are used verbatim. Otherwise the leading slash is
    /// stripped and the path is appended to the base directory; a `?query` suffix on
    /// `path` becomes the URL's query.
    ///
    /// # Errors
    ///
    /// Returns [`ZaiError::Config`] if an absolute path does not parse.
    pub fn url(&self, path: &str) -> Result<Url, ZaiError> {
        if path.starts_with("http://") || path.starts_with("https://") {
            return Url::parse(path)
                .map_err(|e| ZaiError::Config(format!("invalid request URL {path:?}: {e}")));
        }

        let (path, query) = match path.split_once('?') {
            Some((p, q)) => (p, Some(q)),
            None => (path, None),
        };

        let mut url = self.base_url.clone();
        let joined = format!("{}{}", self.base_url.path(), path.trim_start_matches('/'));
        url.set_path(&joined);
        url.set_query(query.filter(|q| !q.is_empty()));
        Ok(url)
    }

    /// Appends query pairs to `url`; a no-op for an empty list
    pub fn append_query<K, V>(url: &mut Url, pairs: &[(K, V)])
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        if pairs.is_empty() {
            return;
        }
        let mut q = url.query_pairs_mut();
        for (k, v) in pairs {
            q.append_pair(k.as_ref(), v.as_ref());
        }
    }

    /// Starts a request for `path` with `query` attached
    ///
    /// # Errors
    ///
    /// Returns an error if the URL cannot be composed.
    pub fn request<K, V>(
        &self,
        method: Method,
        path: &str,
        query: &[(K, V)],
    ) -> Result<RequestBuilder, ZaiError>
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut url = self.url(path)?;
        Self::append_query(&mut url, query);
        Ok(self.http.request(method, url))
    }

    /// Inserts each default header the map does not already carry
    pub fn apply_default_headers(&self, headers: &mut HeaderMap) {
        for (name, value) in &self.default_headers {
            if !headers.contains_key(name) {
                headers.insert(name.clone(), value.clone());
            }
        }
    }

    /// Runs middleware and performs the network call.
    ///
    /// # Errors
    ///
    /// Returns transport errors (`Connection`, `Timeout`, `Http`) or the first
    /// middleware error. A response rejected by an observer is dropped, closing its body.
    pub async fn send(&self, mut request: Request) -> Result<Response, ZaiError> {
        self.apply_default_headers(request.headers_mut());
        for m in &self.request_middleware {
            m.on_request(&mut request)?;
        }

        tracing::trace!(method = %request.method(), url = %request.url(), "sending request");
        let response = self.http.execute(request).await?;

        for m in &self.response_middleware {
            m.on_response(&response)?;
        }
        Ok(response)
    }
}
