//! In-process collaborator doubles.
//!
//! Deterministic in-memory stand-ins for the external transport and
//! resolver, used by this crate's tests and usable by host applications for
//! local development. [`LoopbackTransport`] keeps just enough server
//! behavior to exercise the script lifecycle: it answers `SCRIPT LOAD` with
//! the SHA1 of the body, remembers loaded hashes, and answers `EVALSHA` for
//! unknown hashes with the NOSCRIPT error. Every other command goes to a
//! configurable handler.
//!
//! Fault knobs are per address (submission rejection, blanket error
//! replies, load failures) plus a global gate that holds `SCRIPT LOAD`
//! replies until released, for tests that need callers queued behind an
//! in-flight load cycle.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use sha1::{Digest, Sha1};
use tokio::sync::watch;

use crate::token::{ResolveError, Resolver};
use crate::transport::{RedisError, ReplyFuture, Request, SubmitError, Transport};
use crate::value::Value;

type Handler = Arc<dyn Fn(&Request) -> Result<Value, RedisError> + Send + Sync>;

pub(crate) fn sha1_hex(data: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(data.as_bytes());
    hex::encode(hasher.finalize())
}

struct LoopbackState {
    /// Hashes the simulated servers know; shared by every address.
    scripts: HashSet<String>,
    reject_submit: HashSet<String>,
    fail_all: HashMap<String, String>,
    fail_load: HashSet<String>,
    force_noscript: bool,
    handler: Option<Handler>,
    log: Vec<Request>,
}

/// Scriptable in-memory [`Transport`]. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct LoopbackTransport {
    state: Arc<Mutex<LoopbackState>>,
    load_gate: watch::Sender<bool>,
}

impl LoopbackTransport {
    pub fn new() -> LoopbackTransport {
        let (load_gate, _) = watch::channel(false);
        LoopbackTransport {
            state: Arc::new(Mutex::new(LoopbackState {
                scripts: HashSet::new(),
                reject_submit: HashSet::new(),
                fail_all: HashMap::new(),
                fail_load: HashSet::new(),
                force_noscript: false,
                handler: None,
                log: Vec::new(),
            })),
            load_gate,
        }
    }

    /// Answer data commands with `handler` instead of `Nil`.
    pub fn set_handler<F>(&self, handler: F)
    where
        F: Fn(&Request) -> Result<Value, RedisError> + Send + Sync + 'static,
    {
        self.state.lock().handler = Some(Arc::new(handler));
    }

    /// Refuse submissions addressed to `addr`.
    pub fn reject_submissions(&self, addr: &str) {
        self.state.lock().reject_submit.insert(addr.to_string());
    }

    /// Reply to everything sent to `addr` with the given error.
    pub fn fail_address(&self, addr: &str, error: &str) {
        self.state
            .lock()
            .fail_all
            .insert(addr.to_string(), error.to_string());
    }

    /// Fail `SCRIPT LOAD` on `addr` while leaving other commands alone.
    pub fn fail_script_load(&self, addr: &str) {
        self.state.lock().fail_load.insert(addr.to_string());
    }

    /// Let `SCRIPT LOAD` on `addr` succeed again.
    pub fn allow_script_load(&self, addr: &str) {
        self.state.lock().fail_load.remove(addr);
    }

    /// Answer every `EVALSHA` with NOSCRIPT even for loaded hashes.
    pub fn force_noscript(&self, on: bool) {
        self.state.lock().force_noscript = on;
    }

    /// Drop all loaded scripts, as a server restart or `SCRIPT FLUSH` would.
    pub fn flush_scripts(&self) {
        self.state.lock().scripts.clear();
    }

    pub fn script_is_loaded(&self, hash: &str) -> bool {
        self.state.lock().scripts.contains(hash)
    }

    /// Hold `SCRIPT LOAD` replies until [`Self::release_loads`].
    pub fn hold_loads(&self) {
        self.load_gate.send_replace(true);
    }

    pub fn release_loads(&self) {
        self.load_gate.send_replace(false);
    }

    /// Every submitted request, in submission order (including rejected
    /// ones).
    pub fn requests(&self) -> Vec<Request> {
        self.state.lock().log.clone()
    }

    /// Submitted requests for one command, case-insensitively.
    pub fn requests_for(&self, command: &str) -> Vec<Request> {
        self.state
            .lock()
            .log
            .iter()
            .filter(|r| r.command.eq_ignore_ascii_case(command))
            .cloned()
            .collect()
    }

    /// Decide the reply synchronously; delivery stays asynchronous. The
    /// state lock is released before the handler runs.
    fn reply_for(&self, request: &Request) -> Result<Value, RedisError> {
        let handler = {
            let mut st = self.state.lock();
            if let Some(error) = st.fail_all.get(&request.addr) {
                return Err(RedisError::Remote(error.clone()));
            }
            let command = request.command.to_ascii_uppercase();
            match command.as_str() {
                "SCRIPT"
                    if request.args.first().is_some_and(|a| a.eq_ignore_ascii_case("load")) =>
                {
                    if st.fail_load.contains(&request.addr) {
                        return Err(RedisError::Remote("ERR script load disabled".to_string()));
                    }
                    let body = request.args.get(1).cloned().unwrap_or_default();
                    let hash = sha1_hex(&body);
                    st.scripts.insert(hash.clone());
                    return Ok(Value::Data(hash));
                }
                "EVALSHA" => {
                    let hash = request.args.first().cloned().unwrap_or_default();
                    if st.force_noscript || !st.scripts.contains(&hash) {
                        return Err(RedisError::Remote(
                            "NOSCRIPT No matching script. Please use EVAL.".to_string(),
                        ));
                    }
                    match st.handler.clone() {
                        Some(handler) => handler,
                        // Scripts return values, not status lines; mirror the
                        // update script's `return 1`.
                        None => return Ok(Value::Integer(1)),
                    }
                }
                _ => match st.handler.clone() {
                    Some(handler) => handler,
                    None => return Ok(Value::Nil),
                },
            }
        };
        handler(request)
    }
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for LoopbackTransport {
    fn submit(&self, request: Request) -> Result<ReplyFuture, SubmitError> {
        {
            let mut st = self.state.lock();
            st.log.push(request.clone());
            if st.reject_submit.contains(&request.addr) {
                return Err(SubmitError(format!("{} unreachable", request.addr)));
            }
        }
        let is_load = request.command.eq_ignore_ascii_case("script")
            && request.args.first().is_some_and(|a| a.eq_ignore_ascii_case("load"));
        let mut gate = self.load_gate.subscribe();
        let this = self.clone();
        Ok(Box::pin(async move {
            if is_load {
                while *gate.borrow() {
                    if gate.changed().await.is_err() {
                        break;
                    }
                }
            }
            // Yield once so replies are delivered from the executor, never
            // inline with the submission.
            tokio::task::yield_now().await;
            this.reply_for(&request)
        }))
    }
}

/// In-memory TXT [`Resolver`] table.
#[derive(Clone, Default)]
pub struct LoopbackResolver {
    entries: Arc<Mutex<HashMap<String, String>>>,
    failing: Arc<Mutex<HashSet<String>>>,
}

impl LoopbackResolver {
    pub fn new() -> LoopbackResolver {
        LoopbackResolver::default()
    }

    pub fn add_record(&self, name: &str, text: &str) {
        self.entries.lock().insert(name.to_string(), text.to_string());
    }

    /// Make lookups of `name` fail with a resolver error (as opposed to the
    /// not-found result a missing entry produces).
    pub fn fail_name(&self, name: &str) {
        self.failing.lock().insert(name.to_string());
    }
}

impl Resolver for LoopbackResolver {
    fn lookup_txt<'a>(
        &'a self,
        name: &'a str,
    ) -> futures::future::BoxFuture<'a, Result<Option<String>, ResolveError>> {
        Box::pin(async move {
            if self.failing.lock().contains(name) {
                return Err(ResolveError(format!("lookup of {} failed", name)));
            }
            Ok(self.entries.lock().get(name).cloned())
        })
    }
}
