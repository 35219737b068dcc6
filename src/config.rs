//! Declarative configuration.
//!
//! TOML-deserializable sections that build the runtime objects. A backend
//! section names its servers (with an optional separate write set), the
//! shared request parameters, and optionally how token keys are hashed and
//! where token records live.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::dispatch::RedisParams;
use crate::token::{HashAlgorithm, HashEncoding, KeyTransform};
use crate::upstream::{ReplicaPair, UpstreamSet};

#[derive(Debug)]
pub enum ConfigError {
    Parse(String),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Parse(msg) => write!(f, "configuration parse error: {}", msg),
            ConfigError::Invalid(msg) => write!(f, "invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

/// One logical store backend.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RedisBackendConfig {
    /// `host:port` or `host:port:weight` descriptors, primary first.
    pub servers: Vec<String>,
    /// Distinct write set; empty means writes use `servers` too.
    pub write_servers: Vec<String>,
    pub timeout_ms: u64,
    pub db: Option<String>,
    pub password: Option<String>,
    pub prefix: String,
    pub expand_keys: bool,
}

impl Default for RedisBackendConfig {
    fn default() -> Self {
        RedisBackendConfig {
            servers: Vec::new(),
            write_servers: Vec::new(),
            timeout_ms: 1000,
            db: None,
            password: None,
            prefix: String::new(),
            expand_keys: false,
        }
    }
}

impl RedisBackendConfig {
    pub fn from_toml(input: &str) -> Result<RedisBackendConfig, ConfigError> {
        toml::from_str(input).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Build the immutable request parameters this configuration describes.
    pub fn build(&self) -> Result<Arc<RedisParams>, ConfigError> {
        if self.servers.is_empty() {
            return Err(ConfigError::Invalid("no servers configured".to_string()));
        }
        let read = Arc::new(UpstreamSet::from_addrs(&self.servers));
        let replicas = if self.write_servers.is_empty() {
            ReplicaPair::single(read)
        } else {
            ReplicaPair::new(read, Arc::new(UpstreamSet::from_addrs(&self.write_servers)))
        };
        let mut params = RedisParams::new(replicas);
        params.timeout = Duration::from_millis(self.timeout_ms);
        params.db = self.db.clone();
        params.password = self.password.clone();
        params.prefix = self.prefix.clone();
        params.expand_keys = self.expand_keys;
        Ok(Arc::new(params))
    }
}

/// Key hashing section of a token backend.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HashConfig {
    pub algorithm: ConfigAlgorithm,
    pub encoding: ConfigEncoding,
    pub truncate: Option<usize>,
}

impl Default for HashConfig {
    fn default() -> Self {
        HashConfig {
            algorithm: ConfigAlgorithm::Sha1,
            encoding: ConfigEncoding::Hex,
            truncate: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigAlgorithm {
    Sha1,
    Sha256,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigEncoding {
    Hex,
    Hexupper,
}

impl From<&HashConfig> for KeyTransform {
    fn from(cfg: &HashConfig) -> KeyTransform {
        KeyTransform {
            algorithm: match cfg.algorithm {
                ConfigAlgorithm::Sha1 => HashAlgorithm::Sha1,
                ConfigAlgorithm::Sha256 => HashAlgorithm::Sha256,
            },
            encoding: match cfg.encoding {
                ConfigEncoding::Hex => HashEncoding::Hex,
                ConfigEncoding::Hexupper => HashEncoding::HexUpper,
            },
            truncate: cfg.truncate,
        }
    }
}

/// Token storage section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TokenBackendConfig {
    /// `redis` or `dns`.
    pub backend: BackendKind,
    /// Hash transform for logical keys; absent means raw keys.
    pub hash: Option<HashConfig>,
    /// DNS zone the token records live under (dns backend only).
    pub suffix: String,
    /// Token expiry refreshed by every write (redis backend only).
    pub expiry_secs: u64,
}

impl Default for TokenBackendConfig {
    fn default() -> Self {
        TokenBackendConfig {
            backend: BackendKind::Redis,
            hash: None,
            suffix: String::new(),
            expiry_secs: 86400 * 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Redis,
    Dns,
}

impl TokenBackendConfig {
    pub fn from_toml(input: &str) -> Result<TokenBackendConfig, ConfigError> {
        let cfg: TokenBackendConfig =
            toml::from_str(input).map_err(|e| ConfigError::Parse(e.to_string()))?;
        if cfg.backend == BackendKind::Dns && cfg.suffix.is_empty() {
            return Err(ConfigError::Invalid(
                "dns backend requires a suffix".to_string(),
            ));
        }
        Ok(cfg)
    }

    pub fn key_transform(&self) -> Option<KeyTransform> {
        self.hash.as_ref().map(KeyTransform::from)
    }
}
