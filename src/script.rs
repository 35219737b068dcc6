//! Server-side script lifecycle.
//!
//! Scripts are registered once at startup and invoked by id with `EVALSHA`
//! against a server-assigned content hash. The registry owns the per-script
//! state machine:
//!
//! `unloaded` -> `loading` (`in_flight > 0`) -> `loaded` (hash set,
//! `in_flight == 0`) -> `stale` (hash cleared after NOSCRIPT) -> `loading`.
//!
//! Loading broadcasts `SCRIPT LOAD` to every distinct server of the read
//! and write replica union. Every broadcast reply decrements `in_flight`;
//! success records the hash (identical bodies are assumed to hash
//! identically on every server), failure counts against the server's
//! health. When `in_flight` reaches zero the current waiter queue is
//! drained exactly once, in enqueue order, with the final loaded flag;
//! waiters enqueued after the drain starts belong to the next cycle.
//!
//! On NOSCRIPT the cached hash is cleared and the first observer starts
//! exactly one reload cycle; the invocation is replayed once when the cycle
//! completes, and a second NOSCRIPT is surfaced, never retried again.
//!
//! The registry is an explicit object owned by the service root (no process
//! globals); registrations are appended and never removed.

use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::dispatch::{DispatchError, Dispatcher, RedisParams};
use crate::template::TaskMeta;
use crate::value::Value;

/// Index of a registration; stable for the life of the registry.
pub type ScriptId = usize;

#[derive(Debug)]
pub enum ScriptError {
    /// No registration with this id.
    Unknown(ScriptId),
    /// The script is not available on the servers (load pending, failed,
    /// or the replica union is empty).
    NotLoaded,
    Dispatch(DispatchError),
}

impl ScriptError {
    fn is_noscript(&self) -> bool {
        matches!(self, ScriptError::Dispatch(e) if e.is_noscript())
    }
}

impl std::fmt::Display for ScriptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScriptError::Unknown(id) => write!(f, "unknown script id {}", id),
            ScriptError::NotLoaded => write!(f, "script not available"),
            ScriptError::Dispatch(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ScriptError {}

#[derive(Default)]
struct ScriptState {
    /// Server-assigned content hash of the last successful load.
    hash: Option<String>,
    loaded: bool,
    /// Broadcast replies still outstanding in the current load cycle.
    in_flight: usize,
    /// Callers blocked on the current cycle, in enqueue order.
    waiters: Vec<oneshot::Sender<bool>>,
}

struct Script {
    id: ScriptId,
    body: String,
    params: Arc<RedisParams>,
    state: Mutex<ScriptState>,
}

/// Point-in-time view of a registration, for introspection and tests.
#[derive(Debug, Clone)]
pub struct ScriptStatus {
    pub loaded: bool,
    pub in_flight: usize,
    pub queued: usize,
    pub hash: Option<String>,
}

/// Process-wide script registry. Created at startup, passed by handle.
pub struct ScriptRegistry {
    dispatcher: Arc<Dispatcher>,
    scripts: Mutex<Vec<Arc<Script>>>,
}

impl ScriptRegistry {
    pub fn new(dispatcher: Arc<Dispatcher>) -> ScriptRegistry {
        ScriptRegistry {
            dispatcher,
            scripts: Mutex::new(Vec::new()),
        }
    }

    /// Append a registration and start loading it. Requires a running tokio
    /// runtime (the broadcast is spawned).
    pub fn register(&self, body: &str, params: Arc<RedisParams>) -> ScriptId {
        let script = {
            let mut scripts = self.scripts.lock();
            let script = Arc::new(Script {
                id: scripts.len(),
                body: body.to_string(),
                params,
                state: Mutex::new(ScriptState::default()),
            });
            scripts.push(script.clone());
            script
        };
        let id = script.id;
        Self::start_load(self.dispatcher.clone(), script);
        id
    }

    pub fn len(&self) -> usize {
        self.scripts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.scripts.lock().is_empty()
    }

    pub fn status(&self, id: ScriptId) -> Option<ScriptStatus> {
        self.scripts.lock().get(id).map(|s| {
            let st = s.state.lock();
            ScriptStatus {
                loaded: st.loaded,
                in_flight: st.in_flight,
                queued: st.waiters.len(),
                hash: st.hash.clone(),
            }
        })
    }

    fn get(&self, id: ScriptId) -> Option<Arc<Script>> {
        self.scripts.lock().get(id).cloned()
    }

    /// Begin a load cycle unless one is already running.
    fn start_load(dispatcher: Arc<Dispatcher>, script: Arc<Script>) {
        let targets = script.params.replicas.union();
        {
            let mut st = script.state.lock();
            if st.in_flight > 0 {
                return;
            }
            st.loaded = false;
            st.in_flight = targets.len();
            if targets.is_empty() {
                // Nothing to broadcast to: the cycle completes at once,
                // unloaded.
                let waiters = std::mem::take(&mut st.waiters);
                drop(st);
                warn!(id = script.id, "script load with empty replica union");
                for waiter in waiters {
                    let _ = waiter.send(false);
                }
                return;
            }
        }
        debug!(id = script.id, servers = targets.len(), "broadcasting script load");

        tokio::spawn(async move {
            let mut loads = FuturesUnordered::new();
            for upstream in targets {
                let dispatcher = dispatcher.clone();
                let script = script.clone();
                loads.push(async move {
                    let result = dispatcher
                        .request_to(
                            &upstream,
                            &script.params,
                            "SCRIPT",
                            vec!["LOAD".to_string(), script.body.clone()],
                        )
                        .await;
                    (upstream, result)
                });
            }
            while let Some((upstream, result)) = loads.next().await {
                let mut st = script.state.lock();
                st.in_flight -= 1;
                match result {
                    Ok(reply) => match reply.as_str() {
                        Some(hash) => st.hash = Some(hash.to_string()),
                        None => warn!(
                            id = script.id,
                            addr = upstream.addr(),
                            "unexpected script load reply shape"
                        ),
                    },
                    // The dispatcher already counted the failure against
                    // the upstream's health.
                    Err(e) => warn!(
                        id = script.id,
                        addr = upstream.addr(),
                        error = %e,
                        "script load failed"
                    ),
                }
                if st.in_flight == 0 {
                    st.loaded = st.hash.is_some();
                    let loaded = st.loaded;
                    // Take the queue before invoking anything: waiters
                    // arriving from here on belong to the next cycle.
                    let waiters = std::mem::take(&mut st.waiters);
                    drop(st);
                    debug!(
                        id = script.id,
                        loaded,
                        waiters = waiters.len(),
                        "script load cycle complete"
                    );
                    for waiter in waiters {
                        let _ = waiter.send(loaded);
                    }
                }
            }
        });
    }

    /// Wait behind the current (or a freshly started) load cycle. Returns
    /// the loaded flag the cycle ended with.
    async fn wait_loaded(&self, script: &Arc<Script>) -> bool {
        let (rx, start) = {
            let mut st = script.state.lock();
            if st.loaded {
                return true;
            }
            let (tx, rx) = oneshot::channel();
            st.waiters.push(tx);
            (rx, st.in_flight == 0)
        };
        if start {
            // First waiter after an unloaded/stale observation starts the
            // cycle; everyone else only queues.
            Self::start_load(self.dispatcher.clone(), script.clone());
        }
        rx.await.unwrap_or(false)
    }

    /// Task-less invocation: waits for loading when necessary.
    pub async fn invoke(
        &self,
        id: ScriptId,
        keys: Vec<String>,
        args: Vec<String>,
    ) -> Result<Value, ScriptError> {
        let script = self.get(id).ok_or(ScriptError::Unknown(id))?;
        if !self.wait_loaded(&script).await {
            return Err(ScriptError::NotLoaded);
        }
        self.eval_with_retry(&script, None, keys, args).await
    }

    /// Task-bound invocation. A script that is not yet loaded is rejected
    /// immediately instead of suspending the task behind the load cycle; a
    /// NOSCRIPT replay still waits like the task-less path does.
    pub async fn invoke_task(
        &self,
        task: &TaskMeta,
        id: ScriptId,
        keys: Vec<String>,
        args: Vec<String>,
    ) -> Result<Value, ScriptError> {
        let script = self.get(id).ok_or(ScriptError::Unknown(id))?;
        if !script.state.lock().loaded {
            return Err(ScriptError::NotLoaded);
        }
        self.eval_with_retry(&script, Some(task), keys, args).await
    }

    async fn eval_with_retry(
        &self,
        script: &Arc<Script>,
        task: Option<&TaskMeta>,
        keys: Vec<String>,
        args: Vec<String>,
    ) -> Result<Value, ScriptError> {
        match self.eval_once(script, task, keys.clone(), args.clone()).await {
            Err(e) if e.is_noscript() => {
                debug!(id = script.id, "cached script hash rejected, reloading");
                {
                    let mut st = script.state.lock();
                    st.hash = None;
                    st.loaded = false;
                }
                if !self.wait_loaded(script).await {
                    return Err(ScriptError::NotLoaded);
                }
                // Exactly one replay; a second NOSCRIPT goes to the caller.
                self.eval_once(script, task, keys, args).await
            }
            other => other,
        }
    }

    async fn eval_once(
        &self,
        script: &Arc<Script>,
        task: Option<&TaskMeta>,
        keys: Vec<String>,
        args: Vec<String>,
    ) -> Result<Value, ScriptError> {
        let hash = script
            .state
            .lock()
            .hash
            .clone()
            .ok_or(ScriptError::NotLoaded)?;
        let mut argv = Vec::with_capacity(2 + keys.len() + args.len());
        argv.push(hash);
        argv.push(keys.len().to_string());
        let routing = keys.first().cloned();
        argv.extend(keys);
        argv.extend(args);
        let result = match task {
            Some(task) => {
                self.dispatcher
                    .request_task(task, &script.params, routing.as_deref(), true, "EVALSHA", argv)
                    .await
            }
            None => {
                self.dispatcher
                    .request(&script.params, routing.as_deref(), true, "EVALSHA", argv)
                    .await
            }
        };
        result.map_err(ScriptError::Dispatch)
    }
}
