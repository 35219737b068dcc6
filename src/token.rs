//! Reputation token storage.
//!
//! A token is a bucket of named counters (ham / spam / probable-spam and
//! friends) stored under a reputation key. Two interchangeable backends
//! produce the same [`TokenValue`] shape:
//!
//! - store-backed: the key (optionally hashed) addresses a server-side hash
//!   read with `HGETALL`; writes go through a registered server-side script
//!   so the additive update, the expiry refresh and the last-modified stamp
//!   land as one atomic batch;
//! - name-resolution-backed: the key is joined with a configured suffix and
//!   looked up as text; the `field=value;field=value` payload parses into
//!   the same counter map. A missing name is a valid empty result, not an
//!   error. This backend is read-only.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use futures::future::BoxFuture;
use sha1::{Digest, Sha1};
use sha2::Sha256;
use tracing::debug;

use crate::dispatch::{DispatchError, Dispatcher, RedisParams};
use crate::script::{ScriptError, ScriptId, ScriptRegistry};
use crate::value::Value;

/// Named counters of one reputation token.
///
/// An empty map is a meaningful result (key present with no counters, or
/// key absent): it still counts as a completed lookup. "No response" is an
/// error, never an empty `TokenValue`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TokenValue {
    counters: HashMap<String, f64>,
}

impl TokenValue {
    pub fn new() -> TokenValue {
        TokenValue::default()
    }

    pub fn with(mut self, field: &str, value: f64) -> TokenValue {
        self.counters.insert(field.to_string(), value);
        self
    }

    pub fn get(&self, field: &str) -> Option<f64> {
        self.counters.get(field).copied()
    }

    pub fn insert(&mut self, field: &str, value: f64) {
        self.counters.insert(field.to_string(), value);
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.counters.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Build from flattened `field, value` pairs, the `HGETALL` reply
    /// shape. Non-numeric values are skipped with a diagnostic.
    pub fn from_pairs(pairs: &[(String, String)]) -> TokenValue {
        let mut token = TokenValue::new();
        for (field, value) in pairs {
            match value.parse::<f64>() {
                Ok(v) => token.insert(field, v),
                Err(_) => debug!(%field, %value, "skipping non-numeric token counter"),
            }
        }
        token
    }

    /// Parse the `field=value;field=value` text encoding.
    pub fn from_text(text: &str) -> TokenValue {
        let mut token = TokenValue::new();
        for part in text.split(';') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            match part.split_once('=') {
                Some((field, value)) if !field.trim().is_empty() => {
                    match value.trim().parse::<f64>() {
                        Ok(v) => token.insert(field.trim(), v),
                        Err(_) => debug!(part, "skipping malformed token counter"),
                    }
                }
                _ => debug!(part, "skipping malformed token counter"),
            }
        }
        token
    }
}

/// Errors of a token lookup or update.
#[derive(Debug)]
pub enum TokenError {
    Dispatch(DispatchError),
    Script(ScriptError),
    Resolve(ResolveError),
    /// Reply arrived in an unexpected shape.
    Decode(String),
    /// The backend does not implement this operation.
    Unsupported(&'static str),
}

impl std::fmt::Display for TokenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenError::Dispatch(e) => write!(f, "{}", e),
            TokenError::Script(e) => write!(f, "{}", e),
            TokenError::Resolve(e) => write!(f, "{}", e),
            TokenError::Decode(msg) => write!(f, "undecodable token reply: {}", msg),
            TokenError::Unsupported(op) => write!(f, "backend does not support {}", op),
        }
    }
}

impl std::error::Error for TokenError {}

impl From<DispatchError> for TokenError {
    fn from(e: DispatchError) -> TokenError {
        TokenError::Dispatch(e)
    }
}

impl From<ScriptError> for TokenError {
    fn from(e: ScriptError) -> TokenError {
        TokenError::Script(e)
    }
}

/// Name-resolution collaborator: a TXT-style text lookup. `Ok(None)` is
/// "name does not exist", distinct from a lookup failure.
pub trait Resolver: Send + Sync {
    fn lookup_txt<'a>(&'a self, name: &'a str)
        -> BoxFuture<'a, Result<Option<String>, ResolveError>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveError(pub String);

impl std::fmt::Display for ResolveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "resolution failed: {}", self.0)
    }
}

impl std::error::Error for ResolveError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha1,
    Sha256,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashEncoding {
    Hex,
    HexUpper,
}

/// Optional one-way transform applied to logical keys before they reach
/// the store or the resolver, keeping raw addresses out of key names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyTransform {
    pub algorithm: HashAlgorithm,
    pub encoding: HashEncoding,
    /// Keep only the first `n` characters of the encoded digest.
    pub truncate: Option<usize>,
}

impl KeyTransform {
    pub fn apply(&self, key: &str) -> String {
        let digest = match self.algorithm {
            HashAlgorithm::Sha1 => {
                let mut hasher = Sha1::new();
                hasher.update(key.as_bytes());
                hasher.finalize().to_vec()
            }
            HashAlgorithm::Sha256 => {
                let mut hasher = Sha256::new();
                hasher.update(key.as_bytes());
                hasher.finalize().to_vec()
            }
        };
        let mut encoded = match self.encoding {
            HashEncoding::Hex => hex::encode(digest),
            HashEncoding::HexUpper => hex::encode_upper(digest),
        };
        if let Some(n) = self.truncate {
            encoded.truncate(n);
        }
        encoded
    }
}

/// Asynchronous token storage, polymorphic over the backing system.
pub trait TokenBackend: Send + Sync {
    /// Read the token under `key`. An absent key yields an empty
    /// `TokenValue`, not an error.
    fn get_token<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<TokenValue, TokenError>>;

    /// Additively merge `values` into the token under `key`. Backends
    /// without a write path return [`TokenError::Unsupported`].
    fn set_token<'a>(
        &'a self,
        key: &'a str,
        values: &'a TokenValue,
    ) -> BoxFuture<'a, Result<(), TokenError>>;
}

/// Atomic token update: stamp last-modified, increment each counter by its
/// delta, and refresh the expiry. `EXPIRE` must come last: on a nonexistent
/// key it is a no-op, so it only takes effect once the writes above have
/// created the key.
const SET_TOKEN_BODY: &str = "\
redis.call('HSET', KEYS[1], 'last', ARGV[2])
for i = 3, #ARGV, 2 do
  redis.call('HINCRBYFLOAT', KEYS[1], ARGV[i], ARGV[i + 1])
end
redis.call('EXPIRE', KEYS[1], ARGV[1])
return 1";

/// Store-backed tokens: hash per key, script-batched writes.
pub struct RedisTokenBackend {
    dispatcher: Arc<Dispatcher>,
    registry: Arc<ScriptRegistry>,
    params: Arc<RedisParams>,
    transform: Option<KeyTransform>,
    expiry_secs: u64,
    set_script: ScriptId,
}

impl RedisTokenBackend {
    /// Registers the update script; requires a running runtime.
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        registry: Arc<ScriptRegistry>,
        params: Arc<RedisParams>,
        transform: Option<KeyTransform>,
        expiry_secs: u64,
    ) -> RedisTokenBackend {
        let set_script = registry.register(SET_TOKEN_BODY, params.clone());
        RedisTokenBackend {
            dispatcher,
            registry,
            params,
            transform,
            expiry_secs,
            set_script,
        }
    }

    fn storage_key(&self, key: &str) -> String {
        let key = match &self.transform {
            Some(t) => t.apply(key),
            None => key.to_string(),
        };
        format!("{}{}", self.params.prefix, key)
    }

    fn now_secs() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

impl TokenBackend for RedisTokenBackend {
    fn get_token<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<TokenValue, TokenError>> {
        Box::pin(async move {
            let storage_key = self.storage_key(key);
            let reply = self
                .dispatcher
                .request(
                    &self.params,
                    Some(&storage_key),
                    false,
                    "HGETALL",
                    vec![storage_key.clone()],
                )
                .await?;
            let pairs = reply
                .as_pairs()
                .ok_or_else(|| TokenError::Decode(format!("{:?}", reply)))?;
            Ok(TokenValue::from_pairs(&pairs))
        })
    }

    fn set_token<'a>(
        &'a self,
        key: &'a str,
        values: &'a TokenValue,
    ) -> BoxFuture<'a, Result<(), TokenError>> {
        Box::pin(async move {
            let storage_key = self.storage_key(key);
            let mut argv = Vec::with_capacity(2 + values.len() * 2);
            argv.push(self.expiry_secs.to_string());
            argv.push(Self::now_secs().to_string());
            for (field, delta) in values.iter() {
                argv.push(field.to_string());
                argv.push(delta.to_string());
            }
            let reply = self
                .registry
                .invoke(self.set_script, vec![storage_key], argv)
                .await?;
            // The update script returns a count; anything else means the
            // wrong script ran.
            if reply.as_f64().is_none() {
                return Err(TokenError::Decode(format!("{:?}", reply)));
            }
            Ok(())
        })
    }
}

/// Name-resolution-backed tokens: read-only text records.
pub struct DnsTokenBackend {
    resolver: Arc<dyn Resolver>,
    suffix: String,
    transform: Option<KeyTransform>,
}

impl DnsTokenBackend {
    pub fn new(
        resolver: Arc<dyn Resolver>,
        suffix: &str,
        transform: Option<KeyTransform>,
    ) -> DnsTokenBackend {
        DnsTokenBackend {
            resolver,
            suffix: suffix.trim_matches('.').to_string(),
            transform,
        }
    }

    fn query_name(&self, key: &str) -> String {
        let key = match &self.transform {
            Some(t) => t.apply(key),
            None => key.to_string(),
        };
        if self.suffix.is_empty() {
            key
        } else {
            format!("{}.{}", key, self.suffix)
        }
    }
}

impl TokenBackend for DnsTokenBackend {
    fn get_token<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<TokenValue, TokenError>> {
        Box::pin(async move {
            let name = self.query_name(key);
            match self.resolver.lookup_txt(&name).await {
                Ok(Some(text)) => Ok(TokenValue::from_text(&text)),
                // Name not found is a valid empty result.
                Ok(None) => Ok(TokenValue::new()),
                Err(e) => Err(TokenError::Resolve(e)),
            }
        })
    }

    fn set_token<'a>(
        &'a self,
        _key: &'a str,
        _values: &'a TokenValue,
    ) -> BoxFuture<'a, Result<(), TokenError>> {
        Box::pin(async move { Err(TokenError::Unsupported("set_token")) })
    }
}
