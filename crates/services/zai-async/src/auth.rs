//! Signed bearer tokens for `id.secret` credentials.
//!
//! A [`TokenGenerator`] turns a credential into an HS256 JWS whose header carries
//! the platform's `sign_type: "SIGN"` marker and whose claims are
//! `{api_key, timestamp, exp}` in milliseconds. Tokens are cached per full
//! credential so the HMAC is only recomputed once per cache TTL.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use reqwest::header::HeaderValue;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::{CredentialError, ZaiError};

/// Default lifetime of an issued token
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(210);
/// Default freshness bound of a cache entry
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(180);
/// Default maximum number of cached tokens
pub const DEFAULT_MAX_CACHE_SIZE: usize = 10;
/// Value of the `sign_type` JWS header field
pub const SIGN_TYPE: &str = "SIGN";

type HmacSha256 = Hmac<Sha256>;

/// Lifetimes and bounds for token generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenConfig {
    /// Lifetime written into the `exp` claim
    pub token_ttl: Duration,
    /// How long a cached token is reused; must be shorter than `token_ttl`
    pub cache_ttl: Duration,
    /// Maximum number of credentials cached at once
    pub max_cache_size: usize,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            token_ttl: DEFAULT_TOKEN_TTL,
            cache_ttl: DEFAULT_CACHE_TTL,
            max_cache_size: DEFAULT_MAX_CACHE_SIZE,
        }
    }
}

impl TokenConfig {
    /// Checks the TTL ordering and cache bound.
    ///
    /// # Errors
    ///
    /// Returns [`ZaiError::Config`] if `token_ttl <= cache_ttl` or the cache bound is zero.
    pub fn validate(&self) -> Result<(), ZaiError> {
        if self.token_ttl <= self.cache_ttl {
            return Err(ZaiError::Config(format!(
                "token_ttl ({:?}) must exceed cache_ttl ({:?})",
                self.token_ttl, self.cache_ttl
            )));
        }
        if self.max_cache_size == 0 {
            return Err(ZaiError::Config("max_cache_size must be at least 1".into()));
        }
        Ok(())
    }
}

/// A validated `<id>.<secret>` credential
///
/// Debug output redacts the secret.
#[derive(Clone)]
pub struct Credential {
    raw: SecretString,
    id: String,
    secret: SecretString,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("id", &self.id)
            .field("secret", &"<redacted>")
            .finish()
    }
}

impl Credential {
    /// Splits and validates a credential string.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::Empty`] for an empty string and
    /// [`CredentialError::Invalid`] unless there is exactly one `.` with non-empty sides.
    pub fn parse(raw: &str) -> Result<Self, CredentialError> {
        if raw.is_empty() {
            return Err(CredentialError::Empty);
        }
        let mut parts = raw.split('.');
        let (Some(id), Some(secret), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(CredentialError::Invalid);
        };
        if id.is_empty() || secret.is_empty() {
            return Err(CredentialError::Invalid);
        }
        Ok(Self {
            raw: SecretString::from(raw),
            id: id.to_owned(),
            secret: SecretString::from(secret),
        })
    }

    /// The public key id (left of the `.`)
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The full credential string
    #[must_use]
    pub fn expose(&self) -> &str {
        self.raw.expose_secret()
    }
}

/// Claims carried by an issued token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Credential id
    pub api_key: String,
    /// Issued-at, milliseconds since the epoch
    pub timestamp: i64,
    /// Expiry, milliseconds since the epoch
    pub exp: i64,
}

#[derive(Serialize)]
struct JwsHeader<'a> {
    alg: &'a str,
    sign_type: &'a str,
    typ: &'a str,
}

#[derive(Debug)]
struct CacheEntry {
    token: String,
    created_at: Instant,
    // insertion order; breaks ties between entries created within one clock tick
    seq: u64,
}

/// Issues and caches signed tokens
///
/// All operations take `&self` and are safe to call from many threads; the cache sits
/// behind a reader/writer lock that is never held while signing.
pub struct TokenGenerator {
    config: TokenConfig,
    cache: RwLock<HashMap<String, CacheEntry>>,
    cache_enabled: AtomicBool,
    next_seq: AtomicU64,
}

impl std::fmt::Debug for TokenGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenGenerator")
            .field("config", &self.config)
            .field("size", &self.size())
            .field("cache_enabled", &self.is_cache_enabled())
            .finish()
    }
}

impl Default for TokenGenerator {
    fn default() -> Self {
        Self::new(TokenConfig::default())
    }
}

impl TokenGenerator {
    /// Creates a generator with caching enabled
    #[must_use]
    pub fn new(config: TokenConfig) -> Self {
        Self {
            config,
            cache: RwLock::new(HashMap::new()),
            cache_enabled: AtomicBool::new(true),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Returns the generator's configuration
    #[must_use]
    pub const fn config(&self) -> &TokenConfig {
        &self.config
    }

    /// Returns a bearer token for `credential`, reusing a fresh cached one if present.
    ///
    /// # Errors
    ///
    /// Returns [`ZaiError::Credential`] for malformed input and [`ZaiError::Signing`]
    /// if the token cannot be encoded.
    pub fn generate(&self, credential: &str) -> Result<String, ZaiError> {
        let credential = Credential::parse(credential)?;
        self.generate_for(&credential)
    }

    /// Same as [`generate`](Self::generate) for an already-validated credential.
    ///
    /// # Errors
    ///
    /// Returns [`ZaiError::Signing`] if the token cannot be encoded.
    pub fn generate_for(&self, credential: &Credential) -> Result<String, ZaiError> {
        let caching = self.is_cache_enabled();
        let key = credential.expose();

        if caching && let Some(token) = self.lookup(key) {
            tracing::trace!(api_key = credential.id(), "token cache hit");
            return Ok(token);
        }

        let issued_at = chrono::Utc::now().timestamp_millis();
        let token = sign(credential, issued_at, self.config.token_ttl)?;

        if caching {
            tracing::debug!(api_key = credential.id(), "token cache miss, issued new token");
            self.insert(key, token.clone());
        }
        Ok(token)
    }

    /// Stops reading from and writing to the cache.
    ///
    /// While disabled, an [`Authorizer::Signed`] built on this generator sends the raw
    /// `id.secret` credential instead of a signed token.
    pub fn disable_cache(&self) {
        self.cache_enabled.store(false, Ordering::Release);
    }

    /// Resumes caching
    pub fn enable_cache(&self) {
        self.cache_enabled.store(true, Ordering::Release);
    }

    /// Whether generated tokens are cached
    #[must_use]
    pub fn is_cache_enabled(&self) -> bool {
        self.cache_enabled.load(Ordering::Acquire)
    }

    /// Drops every cached token
    pub fn clear_cache(&self) {
        self.cache.write().clear();
    }

    /// Drops cached tokens older than the cache TTL, returning how many were removed
    pub fn clear_expired(&self) -> usize {
        let ttl = self.config.cache_ttl;
        let mut cache = self.cache.write();
        let before = cache.len();
        cache.retain(|_, e| e.created_at.elapsed() <= ttl);
        before - cache.len()
    }

    /// Number of cached tokens, including expired ones not yet swept
    #[must_use]
    pub fn size(&self) -> usize {
        self.cache.read().len()
    }

    fn lookup(&self, key: &str) -> Option<String> {
        let cache = self.cache.read();
        cache
            .get(key)
            .filter(|e| e.created_at.elapsed() <= self.config.cache_ttl)
            .map(|e| e.token.clone())
    }

    fn insert(&self, key: &str, token: String) {
        let mut cache = self.cache.write();
        if !cache.contains_key(key) {
            while cache.len() >= self.config.max_cache_size {
                let Some(oldest) = cache
                    .iter()
                    .min_by_key(|(_, e)| e.seq)
                    .map(|(k, _)| k.clone())
                else {
                    break;
                };
                cache.remove(&oldest);
            }
        }
        cache.insert(
            key.to_owned(),
            CacheEntry {
                token,
                created_at: Instant::now(),
                seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            },
        );
    }

    #[cfg(test)]
    fn contains(&self, key: &str) -> bool {
        self.cache.read().contains_key(key)
    }
}

fn sign(credential: &Credential, issued_at: i64, ttl: Duration) -> Result<String, ZaiError> {
    let ttl_ms = i64::try_from(ttl.as_millis())
        .map_err(|_| ZaiError::Signing(format!("token ttl {ttl:?} out of range")))?;

    let header = serde_json::to_vec(&JwsHeader {
        alg: "HS256",
        sign_type: SIGN_TYPE,
        typ: "JWT",
    })
    .map_err(|e| ZaiError::Signing(e.to_string()))?;

    let claims = serde_json::to_vec(&Claims {
        api_key: credential.id.clone(),
        timestamp: issued_at,
        exp: issued_at.saturating_add(ttl_ms),
    })
    .map_err(|e| ZaiError::Signing(e.to_string()))?;

    let signing_input = format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(header),
        URL_SAFE_NO_PAD.encode(claims)
    );

    let mut mac = HmacSha256::new_from_slice(credential.secret.expose_secret().as_bytes())
        .map_err(|e| ZaiError::Signing(e.to_string()))?;
    mac.update(signing_input.as_bytes());
    let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

    Ok(format!("{signing_input}.{signature}"))
}

/// Produces the `Authorization` header value for each attempt
#[derive(Debug, Clone)]
pub enum Authorizer {
    /// Sends a signed token from the shared generator, or the raw credential while
    /// its cache is disabled
    Signed {
        /// Shared token generator
        generator: Arc<TokenGenerator>,
        /// Credential to sign for
        credential: Credential,
    },
    /// Sends the raw `id.secret` credential
    Raw(Credential),
}

impl Authorizer {
    /// Builds `Bearer <token>`, marked sensitive so it is not logged by the transport.
    ///
    /// # Errors
    ///
    /// Returns an error if signing fails or the value is not a valid header.
    pub fn header_value(&self) -> Result<HeaderValue, ZaiError> {
        let token = match self {
            Self::Signed {
                generator,
                credential,
            } if generator.is_cache_enabled() => generator.generate_for(credential)?,
            Self::Signed { credential, .. } | Self::Raw(credential) => {
                credential.expose().to_owned()
            }
        };
        let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|_| ZaiError::Config("Invalid authorization header value".into()))?;
        value.set_sensitive(true);
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn short_ttl() -> TokenConfig {
        TokenConfig {
            token_ttl: Duration::from_millis(80),
            cache_ttl: Duration::from_millis(30),
            max_cache_size: DEFAULT_MAX_CACHE_SIZE,
        }
    }

    fn decode_claims(token: &str) -> Claims {
        let payload = token.split('.').nth(1).unwrap();
        serde_json::from_slice(&URL_SAFE_NO_PAD.decode(payload).unwrap()).unwrap()
    }

    #[test]
    fn rejects_malformed_credentials() {
        let g = TokenGenerator::default();
        assert!(matches!(
            g.generate(""),
            Err(ZaiError::Credential(CredentialError::Empty))
        ));
        for bad in ["nodot", ".secret", "id.", ".", "a.b.c", "a..b"] {
            assert!(
                matches!(
                    g.generate(bad),
                    Err(ZaiError::Credential(CredentialError::Invalid))
                ),
                "{bad:?} should be invalid"
            );
        }
    }

    #[test]
    fn token_header_and_claims() {
        let g = TokenGenerator::default();
        let token = g.generate("my-id.my-secret").unwrap();
        let segments: Vec<&str> = token.split('.').collect();
        assert_eq!(segments.len(), 3);

        let header: serde_json::Value =
            serde_json::from_slice(&URL_SAFE_NO_PAD.decode(segments[0]).unwrap()).unwrap();
        assert_eq!(header["alg"], "HS256");
        assert_eq!(header["sign_type"], "SIGN");

        let claims = decode_claims(&token);
        assert_eq!(claims.api_key, "my-id");
        assert_eq!(claims.exp - claims.timestamp, 210_000);

        let mut mac = HmacSha256::new_from_slice(b"my-secret").unwrap();
        mac.update(format!("{}.{}", segments[0], segments[1]).as_bytes());
        let expected = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        assert_eq!(segments[2], expected);
    }

    #[test]
    fn cached_token_is_reused_within_ttl() {
        let g = TokenGenerator::default();
        let a = g.generate("id.secret").unwrap();
        let b = g.generate("id.secret").unwrap();
        assert_eq!(a, b);
        assert_eq!(g.size(), 1);
    }

    #[test]
    fn stale_entry_is_regenerated() {
        let g = TokenGenerator::new(short_ttl());
        let a = g.generate("id.secret").unwrap();
        std::thread::sleep(Duration::from_millis(50));
        let b = g.generate("id.secret").unwrap();
        assert_ne!(a, b);
        assert!(decode_claims(&b).timestamp > decode_claims(&a).timestamp);
        assert_eq!(g.size(), 1);
    }

    #[test]
    fn cache_is_keyed_by_full_credential() {
        let g = TokenGenerator::default();
        g.generate("same-id.secret-one").unwrap();
        g.generate("same-id.secret-two").unwrap();
        assert_eq!(g.size(), 2);
    }

    #[test]
    fn cache_is_bounded_and_evicts_oldest() {
        let g = TokenGenerator::default();
        for i in 0..25 {
            g.generate(&format!("id{i}.secret")).unwrap();
            assert!(g.size() <= DEFAULT_MAX_CACHE_SIZE);
        }
        assert_eq!(g.size(), DEFAULT_MAX_CACHE_SIZE);
        assert!(!g.contains("id0.secret"));
        assert!(!g.contains("id14.secret"));
        assert!(g.contains("id15.secret"));
        assert!(g.contains("id24.secret"));
    }

    #[test]
    fn disabled_cache_is_bypassed() {
        let g = TokenGenerator::default();
        g.disable_cache();
        assert!(!g.is_cache_enabled());
        g.generate("id.secret").unwrap();
        assert_eq!(g.size(), 0);

        g.enable_cache();
        g.generate("id.secret").unwrap();
        assert_eq!(g.size(), 1);

        g.clear_cache();
        assert_eq!(g.size(), 0);
    }

    #[test]
    fn clear_expired_sweeps_stale_entries() {
        let g = TokenGenerator::new(short_ttl());
        g.generate("a.secret").unwrap();
        g.generate("b.secret").unwrap();
        std::thread::sleep(Duration::from_millis(50));
        g.generate("c.secret").unwrap();

        assert_eq!(g.clear_expired(), 2);
        assert_eq!(g.size(), 1);
        assert!(g.contains("c.secret"));
    }

    #[test]
    fn concurrent_callers_share_one_entry() {
        let g = TokenGenerator::default();
        std::thread::scope(|s| {
            for _ in 0..32 {
                s.spawn(|| {
                    assert!(g.generate("shared.secret").is_ok());
                });
            }
        });
        assert_eq!(g.size(), 1);
    }

    #[test]
    fn config_validation() {
        assert!(TokenConfig::default().validate().is_ok());
        let inverted = TokenConfig {
            token_ttl: Duration::from_secs(10),
            cache_ttl: Duration::from_secs(10),
            ..TokenConfig::default()
        };
        assert!(inverted.validate().is_err());
        let empty = TokenConfig {
            max_cache_size: 0,
            ..TokenConfig::default()
        };
        assert!(empty.validate().is_err());
    }

    #[test]
    fn authorizer_raw_and_signed() {
        let credential = Credential::parse("id.secret").unwrap();
        let raw = Authorizer::Raw(credential.clone());
        assert_eq!(raw.header_value().unwrap(), "Bearer id.secret");

        let signed = Authorizer::Signed {
            generator: Arc::new(TokenGenerator::default()),
            credential,
        };
        let value = signed.header_value().unwrap();
        assert!(value.is_sensitive());
        let value = value.to_str().unwrap();
        assert!(value.starts_with("Bearer "));
        assert_eq!(decode_claims(value.trim_start_matches("Bearer ")).api_key, "id");
    }

    #[test]
    fn authorizer_follows_runtime_cache_toggle() {
        let generator = Arc::new(TokenGenerator::default());
        let signed = Authorizer::Signed {
            generator: Arc::clone(&generator),
            credential: Credential::parse("id.secret").unwrap(),
        };

        generator.disable_cache();
        assert_eq!(signed.header_value().unwrap(), "Bearer id.secret");
        assert_eq!(generator.size(), 0);

        generator.enable_cache();
        let value = signed.header_value().unwrap();
        let token = value.to_str().unwrap().trim_start_matches("Bearer ");
        assert_eq!(token.split('.').count(), 3);
        assert_eq!(generator.size(), 1);
    }

    #[test]
    fn credential_debug_redacts_secret() {
        let c = Credential::parse("visible.super-secret").unwrap();
        let s = format!("{c:?}");
        assert!(s.contains("visible"));
        assert!(!s.contains("super-secret"));
    }
}
