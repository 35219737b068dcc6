//! Replica-aware command routing, server-side script lifecycle, and
//! reputation token aggregation for a Redis-like store.
//!
//! The crate sits between a host application and its wire transport: it
//! picks a server out of a read/write replica set, expands `{{field}}`
//! placeholders in key arguments, keeps server-side scripts loaded (and
//! reloads them once on NOSCRIPT), and fans independent token lookups in to
//! a single weighted reputation score.
//!
//! The transport client, the DNS resolver and the feature extractors are
//! external collaborators behind the [`transport::Transport`] and
//! [`token::Resolver`] traits; [`loopback`] provides deterministic
//! in-process doubles for both.

pub mod aggregate;
pub mod config;
pub mod dispatch;
pub mod keys;
pub mod loopback;
pub mod router;
pub mod script;
pub mod template;
pub mod token;
pub mod transport;
pub mod upstream;
pub mod value;

pub use aggregate::{Aggregator, Outcome, ScoreReport, UpdateReport};
pub use config::{RedisBackendConfig, TokenBackendConfig};
pub use dispatch::{DispatchError, Dispatcher, RedisParams};
pub use script::{ScriptError, ScriptId, ScriptRegistry};
pub use template::{TaskMeta, TemplateContext};
pub use token::{DnsTokenBackend, RedisTokenBackend, TokenBackend, TokenValue};
pub use transport::{RedisError, Request, Transport};
pub use upstream::{ReplicaPair, Upstream, UpstreamSet};
pub use value::Value;
