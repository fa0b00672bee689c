//! Typed iterator over a server-sent event stream.
//!
//! [`Stream`] pulls events from an [`SseParser`] on demand and decodes each event's
//! data with a [`Decoder`]. Nothing runs in the background unless
//! [`Stream::into_channel`] is used.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::TryStreamExt;
use serde::de::DeserializeOwned;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::Dispatch;
use tracing::instrument::WithSubscriber;

use crate::error::{ZaiError, map_deser};
use crate::sse::{Parsed, SseParser};

/// Turns one event's data payload into a record
pub trait Decoder<T>: Send + Sync {
    /// Decodes `data`
    ///
    /// # Errors
    ///
    /// Any error is reported through [`Stream::err`] and ends iteration.
    fn decode(&self, data: &[u8]) -> Result<T, ZaiError>;
}

/// Decodes event data as JSON
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonDecoder;

impl<T: DeserializeOwned> Decoder<T> for JsonDecoder {
    fn decode(&self, data: &[u8]) -> Result<T, ZaiError> {
        serde_json::from_slice(data).map_err(|e| map_deser(&e, data))
    }
}

/// Adapts a closure into a [`Decoder`]
#[derive(Debug, Clone, Copy)]
pub struct FnDecoder<F>(pub F);

impl<T, F> Decoder<T> for FnDecoder<F>
where
    F: Fn(&[u8]) -> Result<T, ZaiError> + Send + Sync,
{
    fn decode(&self, data: &[u8]) -> Result<T, ZaiError> {
        (self.0)(data)
    }
}

type BodyReader = Box<dyn AsyncRead + Send + Unpin>;

#[derive(Debug, Default)]
struct Shared {
    closed: AtomicBool,
    close_requested: CancellationToken,
    done: CancellationToken,
}

/// One-shot signal fired on the stream's terminal transition
#[derive(Debug, Clone)]
pub struct DoneSignal(CancellationToken);

impl DoneSignal {
    /// Waits until the stream has terminated
    pub async fn wait(&self) {
        self.0.cancelled().await;
    }

    /// Whether the stream has terminated
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.0.is_cancelled()
    }
}

/// Closes a [`Stream`] from another task
///
/// A `next` pending on the owning task returns `false` with
/// [`ZaiError::StreamClosed`] and releases the body.
#[derive(Debug, Clone)]
pub struct StreamHandle(Arc<Shared>);

impl StreamHandle {
    /// Requests the stream be closed; idempotent
    pub fn close(&self) {
        self.0.closed.store(true, Ordering::Release);
        self.0.close_requested.cancel();
        self.0.done.cancel();
    }

    /// Whether the stream has been closed or has terminated
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.0.closed.load(Ordering::Acquire)
    }
}

/// Typed, single-consumer iterator over an event stream
pub struct Stream<T, D = JsonDecoder> {
    parser: Option<SseParser<BodyReader>>,
    decoder: D,
    current: Option<T>,
    error: Option<ZaiError>,
    latched: bool,
    ended: bool,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    logger: Option<Dispatch>,
}

impl<T, D> std::fmt::Debug for Stream<T, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("open", &self.parser.is_some())
            .field("error", &self.error)
            .field("ended", &self.ended)
            .field("closed", &self.shared.closed.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl<T> Stream<T, JsonDecoder>
where
    T: DeserializeOwned,
{
    /// Streams JSON records from a response body
    #[must_use]
    pub fn from_response(response: reqwest::Response, cancel: CancellationToken) -> Self {
        Self::from_response_with(response, JsonDecoder, cancel)
    }
}

impl<T, D> Stream<T, D>
where
    D: Decoder<T>,
{
    /// Wraps an arbitrary byte source
    pub fn new<R>(reader: R, decoder: D, cancel: CancellationToken) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let reader: BodyReader = Box::new(reader);
        Self {
            parser: Some(SseParser::new(reader)),
            decoder,
            current: None,
            error: None,
            latched: false,
            ended: false,
            shared: Arc::new(Shared::default()),
            cancel,
            logger: None,
        }
    }

    /// Emits this stream's diagnostics to `logger` instead of the global default
    #[must_use]
    pub fn with_logger(mut self, logger: Option<Dispatch>) -> Self {
        self.logger = logger;
        self
    }

    /// Streams records from a response body using `decoder`
    #[must_use]
    pub fn from_response_with(
        response: reqwest::Response,
        decoder: D,
        cancel: CancellationToken,
    ) -> Self {
        let body = response.bytes_stream().map_err(io::Error::other);
        Self::new(StreamReader::new(Box::pin(body)), decoder, cancel)
    }

    /// Advances to the next record.
    ///
    /// Returns `false` once the stream has ended, with [`err`](Self::err) unset after
    /// the `[DONE]` sentinel or EOF and set on close, cancellation, or a read failure.
    /// A decode failure returns `true` with the error in [`err`](Self::err); the
    /// following call returns `false`.
    pub async fn next(&mut self) -> bool {
        match self.logger.clone() {
            Some(dispatch) => self.advance().with_subscriber(dispatch).await,
            None => self.advance().await,
        }
    }

    async fn advance(&mut self) -> bool {
        self.current = None;

        if self.latched {
            return false;
        }
        if self.parser.is_none() || self.shared.closed.load(Ordering::Acquire) {
            if !self.ended && self.error.is_none() {
                self.error = Some(ZaiError::StreamClosed);
            }
            self.finish();
            return false;
        }
        if self.cancel.is_cancelled() {
            self.fail(ZaiError::Cancelled);
            return false;
        }

        loop {
            let cancel = &self.cancel;
            let close_requested = &self.shared.close_requested;
            let Some(parser) = self.parser.as_mut() else {
                return false;
            };

            let parsed = tokio::select! {
                biased;
                () = cancel.cancelled() => Err(ZaiError::Cancelled),
                () = close_requested.cancelled() => Err(ZaiError::StreamClosed),
                r = parser.next_event() => r,
            };

            match parsed {
                Ok(Parsed::Event(event)) => {
                    if event.data.is_empty() {
                        continue;
                    }
                    match self.decoder.decode(event.data.as_bytes()) {
                        Ok(value) => {
                            self.current = Some(value);
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "failed to decode stream event");
                            self.error = Some(e);
                            self.latched = true;
                            self.finish();
                        }
                    }
                    return true;
                }
                Ok(Parsed::Done(_) | Parsed::Eof) => {
                    self.ended = true;
                    self.finish();
                    return false;
                }
                Err(e) => {
                    self.fail(e);
                    return false;
                }
            }
        }
    }

    /// The record decoded by the last successful [`next`](Self::next)
    #[must_use]
    pub const fn current(&self) -> Option<&T> {
        self.current.as_ref()
    }

    /// Takes ownership of the current record
    pub fn take_current(&mut self) -> Option<T> {
        self.current.take()
    }

    /// The error that ended iteration; `None` after a natural end
    #[must_use]
    pub const fn err(&self) -> Option<&ZaiError> {
        self.error.as_ref()
    }

    /// Releases the body; idempotent
    pub fn close(&mut self) {
        self.shared.close_requested.cancel();
        match self.logger.clone() {
            Some(dispatch) => tracing::dispatcher::with_default(&dispatch, || self.finish()),
            None => self.finish(),
        }
    }

    /// Whether the stream has been closed or has terminated
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// A signal fired on the terminal transition
    #[must_use]
    pub fn done(&self) -> DoneSignal {
        DoneSignal(self.shared.done.clone())
    }

    /// A handle that can close this stream from another task
    #[must_use]
    pub fn handle(&self) -> StreamHandle {
        StreamHandle(Arc::clone(&self.shared))
    }

    /// Next record, `Ok(None)` at a natural end.
    ///
    /// # Errors
    ///
    /// Returns the error that ended iteration, on this call and every later one.
    /// [`err`](Self::err) keeps reporting it.
    pub async fn recv(&mut self) -> Result<Option<T>, ZaiError> {
        let advanced = self.next().await;
        if let Some(e) = &self.error {
            return Err(e.clone());
        }
        Ok(if advanced { self.current.take() } else { None })
    }

    /// Drains the stream into a vector.
    ///
    /// # Errors
    ///
    /// Returns the first error; records read before it are discarded.
    pub async fn all(mut self) -> Result<Vec<T>, ZaiError> {
        let mut out = Vec::new();
        while let Some(item) = self.recv().await? {
            out.push(item);
        }
        Ok(out)
    }

    fn fail(&mut self, e: ZaiError) {
        if !matches!(e, ZaiError::Cancelled | ZaiError::StreamClosed) {
            tracing::warn!(error = %e, "event stream failed");
        }
        self.error = Some(e);
        self.finish();
    }

    fn finish(&mut self) {
        if self.parser.take().is_some() {
            tracing::trace!("event stream body released");
        }
        self.shared.closed.store(true, Ordering::Release);
        self.shared.done.cancel();
    }
}

impl<T, D> Stream<T, D>
where
    T: Send + 'static,
    D: Decoder<T> + 'static,
{
    /// Forwards records to a bounded channel from a spawned task.
    ///
    /// The channel closes when iteration ends; an error is delivered as the last item.
    /// Dropping the receiver closes the stream.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    #[must_use]
    pub fn into_channel(mut self, capacity: usize) -> mpsc::Receiver<Result<T, ZaiError>> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        tokio::spawn(async move {
            loop {
                let item = tokio::select! {
                    biased;
                    () = tx.closed() => break,
                    r = self.recv() => r,
                };
                match item {
                    Ok(Some(value)) => {
                        if tx.send(Ok(value)).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        break;
                    }
                }
            }
            self.close();
        });
        rx
    }

    /// Adapts the stream into a [`futures::Stream`] of results
    pub fn into_stream(self) -> impl futures::Stream<Item = Result<T, ZaiError>> + Send {
        futures::stream::unfold(Some(self), |state| async move {
            let mut stream = state?;
            match stream.recv().await {
                Ok(Some(value)) => Some((Ok(value), Some(stream))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }
}

impl<T, D> Drop for Stream<T, D> {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.done.cancel();
    }
}
