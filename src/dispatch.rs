//! Request dispatch.
//!
//! The dispatcher glues the pieces together: pick an upstream
//! ([`crate::router`]), expand templated keys ([`crate::keys`],
//! [`crate::template`]), hand the request to the transport, and report the
//! outcome to the chosen upstream's health counters exactly once, on every
//! completion path.
//!
//! There are two entry points: [`Dispatcher::request_task`] for requests made
//! on behalf of a message (its metadata feeds key templating) and
//! [`Dispatcher::request`] for task-less requests (maintenance, script
//! loads). Both run the same internal path and differ only in the template
//! context, so routing, templating positions and health reporting can never
//! diverge between them.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::keys::key_indexes;
use crate::router;
use crate::template::{expand, TaskMeta, TemplateContext};
use crate::transport::{RedisError, Request, SubmitError, Transport};
use crate::upstream::{ReplicaPair, Upstream};
use crate::value::Value;

/// Shared parameters of every request issued under one logical backend.
/// Immutable after construction.
#[derive(Debug, Clone)]
pub struct RedisParams {
    pub replicas: ReplicaPair,
    pub timeout: Duration,
    pub db: Option<String>,
    pub password: Option<String>,
    /// Prefix applied by key-building callers (the token backend); dispatch
    /// itself never rewrites keys beyond template expansion.
    pub prefix: String,
    /// Run `{{field}}` expansion over the key positions of each command.
    pub expand_keys: bool,
}

impl RedisParams {
    pub fn new(replicas: ReplicaPair) -> RedisParams {
        RedisParams {
            replicas,
            timeout: Duration::from_secs(1),
            db: None,
            password: None,
            prefix: String::new(),
            expand_keys: false,
        }
    }
}

/// Why a dispatch did not produce a reply.
#[derive(Debug)]
pub enum DispatchError {
    /// A required input was missing; nothing was sent.
    MissingParameter(&'static str),
    /// No reachable upstream in the relevant replica set.
    NoUpstream,
    /// The transport refused the submission; no callback will run.
    Rejected(SubmitError),
    /// The request completed with an error (remote, timeout, io, decode).
    Redis(RedisError),
}

impl DispatchError {
    pub fn is_noscript(&self) -> bool {
        matches!(self, DispatchError::Redis(e) if e.is_noscript())
    }
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchError::MissingParameter(what) => {
                write!(f, "missing required parameter: {}", what)
            }
            DispatchError::NoUpstream => write!(f, "no reachable upstream"),
            DispatchError::Rejected(e) => write!(f, "{}", e),
            DispatchError::Redis(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for DispatchError {}

impl From<RedisError> for DispatchError {
    fn from(e: RedisError) -> DispatchError {
        DispatchError::Redis(e)
    }
}

/// Routes commands to upstreams over an injected transport.
pub struct Dispatcher {
    transport: Arc<dyn Transport>,
}

impl Dispatcher {
    pub fn new(transport: Arc<dyn Transport>) -> Dispatcher {
        Dispatcher { transport }
    }

    /// Task-bound request: key templating draws on the task's metadata.
    pub async fn request_task(
        &self,
        task: &TaskMeta,
        params: &RedisParams,
        key: Option<&str>,
        is_write: bool,
        command: &str,
        args: Vec<String>,
    ) -> Result<Value, DispatchError> {
        let mut ctx = TemplateContext::for_task(task);
        self.request_inner(&mut ctx, params, key, is_write, command, args)
            .await
    }

    /// Task-less request: placeholders expand against an empty context, so
    /// the same argument positions are rewritten as in the task-bound path.
    pub async fn request(
        &self,
        params: &RedisParams,
        key: Option<&str>,
        is_write: bool,
        command: &str,
        args: Vec<String>,
    ) -> Result<Value, DispatchError> {
        let mut ctx = TemplateContext::empty();
        self.request_inner(&mut ctx, params, key, is_write, command, args)
            .await
    }

    async fn request_inner(
        &self,
        ctx: &mut TemplateContext<'_>,
        params: &RedisParams,
        key: Option<&str>,
        is_write: bool,
        command: &str,
        mut args: Vec<String>,
    ) -> Result<Value, DispatchError> {
        if command.is_empty() {
            return Err(DispatchError::MissingParameter("command"));
        }
        let upstream = match router::select(&params.replicas, key, is_write) {
            Some(up) => up,
            None => {
                warn!(command, is_write, "no reachable upstream, aborting request");
                return Err(DispatchError::NoUpstream);
            }
        };

        if params.expand_keys {
            for idx in key_indexes(command, &args) {
                let expanded = expand(&args[idx - 1], ctx);
                args[idx - 1] = expanded;
            }
        }

        self.submit_to(&upstream, params, command, args).await
    }

    /// Direct-address path, bypassing selection. Used by the script loader
    /// to broadcast to every member of a replica union. Health reporting is
    /// identical to the routed path.
    pub(crate) async fn request_to(
        &self,
        upstream: &Arc<Upstream>,
        params: &RedisParams,
        command: &str,
        args: Vec<String>,
    ) -> Result<Value, DispatchError> {
        self.submit_to(upstream, params, command, args).await
    }

    async fn submit_to(
        &self,
        upstream: &Arc<Upstream>,
        params: &RedisParams,
        command: &str,
        args: Vec<String>,
    ) -> Result<Value, DispatchError> {
        let request = Request {
            addr: upstream.addr().to_string(),
            timeout: params.timeout,
            db: params.db.clone(),
            password: params.password.clone(),
            command: command.to_string(),
            args,
        };
        debug!(addr = upstream.addr(), command, "submitting request");

        let reply = match self.transport.submit(request) {
            Ok(reply) => reply,
            Err(e) => {
                // Submission never reached the server; the callback will not
                // run, so the failure is reported here.
                upstream.mark_failure();
                warn!(addr = upstream.addr(), error = %e, "transport rejected request");
                return Err(DispatchError::Rejected(e));
            }
        };

        match reply.await {
            Ok(Value::Error(msg)) => {
                // Some transports deliver error replies as values; normalize
                // to the remote-error path.
                upstream.mark_failure();
                Err(DispatchError::Redis(RedisError::Remote(msg)))
            }
            Ok(value) => {
                upstream.mark_success();
                Ok(value)
            }
            Err(e) => {
                upstream.mark_failure();
                Err(DispatchError::Redis(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackTransport;
    use crate::upstream::UpstreamSet;

    fn params(addrs: &[&str]) -> RedisParams {
        let set = Arc::new(UpstreamSet::from_addrs(addrs));
        RedisParams::new(ReplicaPair::single(set))
    }

    fn task() -> TaskMeta {
        TaskMeta {
            from: Some("alice@example.com".to_string()),
            ..TaskMeta::default()
        }
    }

    #[tokio::test]
    async fn empty_command_fails_fast() {
        let transport = LoopbackTransport::new();
        let dispatcher = Dispatcher::new(Arc::new(transport.clone()));
        let err = dispatcher
            .request(&params(&["a"]), None, false, "", vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::MissingParameter("command")));
        assert!(transport.requests().is_empty(), "no request may be sent");
    }

    #[tokio::test]
    async fn empty_replica_set_is_a_routing_error() {
        let transport = LoopbackTransport::new();
        let dispatcher = Dispatcher::new(Arc::new(transport.clone()));
        let err = dispatcher
            .request(&params(&[]), None, false, "PING", vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::NoUpstream));
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn templating_touches_only_key_positions() {
        let transport = LoopbackTransport::new();
        let dispatcher = Dispatcher::new(Arc::new(transport.clone()));
        let mut p = params(&["a"]);
        p.expand_keys = true;

        dispatcher
            .request_task(
                &task(),
                &p,
                None,
                true,
                "SET",
                vec!["rep:{{from_domain}}".to_string(), "{{from_domain}}".to_string()],
            )
            .await
            .unwrap();

        let sent = transport.requests();
        assert_eq!(sent[0].args[0], "rep:example.com");
        // Position 2 is a value, not a key: left untouched.
        assert_eq!(sent[0].args[1], "{{from_domain}}");
    }

    #[tokio::test]
    async fn taskless_expansion_renders_placeholders_empty() {
        let transport = LoopbackTransport::new();
        let dispatcher = Dispatcher::new(Arc::new(transport.clone()));
        let mut p = params(&["a"]);
        p.expand_keys = true;

        dispatcher
            .request(&p, None, false, "GET", vec!["rep:{{from_domain}}".to_string()])
            .await
            .unwrap();
        assert_eq!(transport.requests()[0].args[0], "rep:");
    }

    #[tokio::test]
    async fn expansion_is_off_by_default() {
        let transport = LoopbackTransport::new();
        let dispatcher = Dispatcher::new(Arc::new(transport.clone()));
        dispatcher
            .request_task(
                &task(),
                &params(&["a"]),
                None,
                false,
                "GET",
                vec!["rep:{{from_domain}}".to_string()],
            )
            .await
            .unwrap();
        assert_eq!(transport.requests()[0].args[0], "rep:{{from_domain}}");
    }

    #[tokio::test]
    async fn rejection_marks_the_upstream_failed() {
        let transport = LoopbackTransport::new();
        transport.reject_submissions("a");
        let dispatcher = Dispatcher::new(Arc::new(transport.clone()));
        let p = params(&["a"]);
        let up = p.replicas.read().all_members()[0].clone();

        let err = dispatcher
            .request(&p, None, false, "PING", vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Rejected(_)));
        assert_eq!(up.successes(), 0);
        up.mark_failure(); // one more failure on top of the reported one
        assert!(up.is_alive(), "a single rejection must not kill the member");
    }

    #[tokio::test]
    async fn remote_error_is_forwarded_verbatim() {
        let transport = LoopbackTransport::new();
        transport.fail_address("a", "ERR custom failure");
        let dispatcher = Dispatcher::new(Arc::new(transport.clone()));

        let err = dispatcher
            .request(&params(&["a"]), None, false, "GET", vec!["k".to_string()])
            .await
            .unwrap_err();
        match err {
            DispatchError::Redis(RedisError::Remote(msg)) => {
                assert_eq!(msg, "ERR custom failure")
            }
            other => panic!("expected remote error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn success_reports_to_health_counters() {
        let transport = LoopbackTransport::new();
        let dispatcher = Dispatcher::new(Arc::new(transport.clone()));
        let p = params(&["a"]);
        let up = p.replicas.read().all_members()[0].clone();

        dispatcher
            .request(&p, None, false, "PING", vec![])
            .await
            .unwrap();
        assert_eq!(up.successes(), 1);
    }

    #[tokio::test]
    async fn request_carries_params() {
        let transport = LoopbackTransport::new();
        let dispatcher = Dispatcher::new(Arc::new(transport.clone()));
        let mut p = params(&["a"]);
        p.db = Some("3".to_string());
        p.password = Some("secret".to_string());
        p.timeout = Duration::from_millis(250);

        dispatcher
            .request(&p, None, false, "PING", vec![])
            .await
            .unwrap();
        let sent = transport.requests();
        assert_eq!(sent[0].db.as_deref(), Some("3"));
        assert_eq!(sent[0].password.as_deref(), Some("secret"));
        assert_eq!(sent[0].timeout, Duration::from_millis(250));
    }
}
