#![deny(warnings)]
#![deny(clippy::all)]
#![deny(missing_docs)]

//! Async transport core for the Z.ai / BigModel API: signed tokens, retries, and
//! typed server-sent event streams.
//!
//! ```no_run
//! # async fn run() -> Result<(), zai_async::ZaiError> {
//! use zai_async::prelude::*;
//!
//! let client = Client::from_env()?;
//! let body = serde_json::json!({"model": "glm-4.6", "stream": true, "messages": []});
//! let mut stream = client
//!     .post_stream::<_, serde_json::Value>("/chat/completions", &body, RequestOptions::default())
//!     .await?;
//! while stream.next().await {
//!     if let Some(chunk) = stream.current() {
//!         println!("{chunk}");
//!     }
//! }
//! if let Some(e) = stream.err() {
//!     eprintln!("stream failed: {e}");
//! }
//! # Ok(())
//! # }
//! ```

/// Signed bearer tokens and the token cache
pub mod auth;
/// High-level client
pub mod client;
/// Construction options and environment handling
pub mod config;
/// Error types
pub mod error;
/// URL composition, default headers, middleware
pub mod http;
/// Retry policy and executor
pub mod retry;
/// Server-sent event parser
pub mod sse;
/// Typed event streams
pub mod stream;
/// Test support utilities (for use in tests)
#[doc(hidden)]
pub mod test_support;

pub use crate::auth::{Authorizer, Credential, TokenConfig, TokenGenerator};
pub use crate::client::{Client, RequestOptions};
pub use crate::config::ClientOptions;
pub use crate::error::{ApiErrorObject, CredentialError, ZaiError};
pub use crate::retry::RetryConfig;
pub use crate::stream::{Decoder, JsonDecoder, Stream};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::stream::{DoneSignal, FnDecoder, StreamHandle};
    pub use crate::{
        Client, ClientOptions, Decoder, JsonDecoder, RequestOptions, RetryConfig, Stream,
        ZaiError,
    };
}
