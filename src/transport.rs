//! Transport collaborator contract.
//!
//! The crate never opens sockets or speaks the wire protocol; it hands a
//! fully-described [`Request`] to a [`Transport`] implementation and awaits
//! the decoded reply. A submission either gets rejected up front (no reply
//! will ever arrive) or is accepted and resolves exactly once.

use std::time::Duration;

use futures::future::BoxFuture;

use crate::value::Value;

/// One store request, addressed to a concrete server.
#[derive(Debug, Clone)]
pub struct Request {
    /// `host:port` of the selected upstream.
    pub addr: String,
    /// Operation timeout, enforced by the transport. This layer has no
    /// cancellation path of its own.
    pub timeout: Duration,
    /// Logical database to select before the command, if any.
    pub db: Option<String>,
    /// Authentication credential, if any.
    pub password: Option<String>,
    pub command: String,
    pub args: Vec<String>,
}

/// The transport refused to queue the request; its callback will never run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitError(pub String);

impl std::fmt::Display for SubmitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "request submission failed: {}", self.0)
    }
}

impl std::error::Error for SubmitError {}

/// Failure of an accepted request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedisError {
    /// Error reply from the server, forwarded verbatim.
    Remote(String),
    /// The transport gave up waiting.
    Timeout,
    /// Connection-level failure after acceptance.
    Io(String),
    /// Reply arrived in an unexpected shape.
    Decode(String),
}

impl RedisError {
    /// Server-side "cached script hash unknown" signal. The only remote
    /// error this crate intercepts instead of forwarding.
    pub fn is_noscript(&self) -> bool {
        matches!(self, RedisError::Remote(msg) if msg.trim_start().starts_with("NOSCRIPT"))
    }
}

impl std::fmt::Display for RedisError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RedisError::Remote(msg) => write!(f, "server error: {}", msg),
            RedisError::Timeout => write!(f, "request timed out"),
            RedisError::Io(msg) => write!(f, "connection error: {}", msg),
            RedisError::Decode(msg) => write!(f, "unexpected reply shape: {}", msg),
        }
    }
}

impl std::error::Error for RedisError {}

/// Resolves exactly once per accepted request.
pub type ReplyFuture = BoxFuture<'static, Result<Value, RedisError>>;

/// The wire client. Implementations must resolve the returned future
/// exactly once; rejected submissions must not produce a reply.
pub trait Transport: Send + Sync {
    fn submit(&self, request: Request) -> Result<ReplyFuture, SubmitError>;
}
