//! Blocking-client transport.
//!
//! The HTTP client itself is abstracted by [`BlockingClient`] so any
//! library can be plugged in. [`ThreadedTransport`] runs each request on a
//! blocking worker pool so the caller never waits; the pool grows with
//! demand and is bounded only by how many requests a session has in
//! flight.
//!
//! [`LoopbackPeer`] is an in-memory remote that understands the handful of
//! endpoints the session engine talks to.

use crate::error::{ReplicationError, ReplicationResult};
use crate::transport::{Completion, Method, RemoteRequest, Transport};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::runtime::{Builder, Runtime};
use tracing::{debug, trace};

/// A synchronous HTTP client.
pub trait BlockingClient: Send + Sync + 'static {
    /// Executes `request` and returns the decoded JSON response.
    ///
    /// Non-2xx answers must be reported as [`ReplicationError::Http`] and
    /// unreachable peers as [`ReplicationError::Transport`].
    fn execute(&self, request: &RemoteRequest) -> ReplicationResult<Value>;
}

impl<C: BlockingClient> BlockingClient for Arc<C> {
    fn execute(&self, request: &RemoteRequest) -> ReplicationResult<Value> {
        (**self).execute(request)
    }
}

/// Runs a [`BlockingClient`] on a worker pool.
pub struct ThreadedTransport<C: BlockingClient> {
    client: Arc<C>,
    runtime: Option<Runtime>,
}

impl<C: BlockingClient> ThreadedTransport<C> {
    /// Creates the transport and its worker pool.
    pub fn new(client: C) -> std::io::Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("docsync-http")
            .enable_all()
            .build()?;
        Ok(Self {
            client: Arc::new(client),
            runtime: Some(runtime),
        })
    }

    /// The wrapped client.
    pub fn client(&self) -> &C {
        &self.client
    }
}

impl<C: BlockingClient> Transport for ThreadedTransport<C> {
    fn send(&self, request: RemoteRequest, completion: Completion) {
        let Some(runtime) = &self.runtime else {
            completion(Err(ReplicationError::Cancelled));
            return;
        };
        let client = Arc::clone(&self.client);
        trace!(method = %request.method, url = %request.url, "dispatching request");
        runtime.spawn_blocking(move || {
            let result = client.execute(&request);
            completion(result);
        });
    }
}

impl<C: BlockingClient> Drop for ThreadedTransport<C> {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

#[derive(Default)]
struct PeerState {
    documents: HashMap<String, Map<String, Value>>,
    revisions: u64,
    user: Option<String>,
    reachable: bool,
    requests: usize,
}

/// An in-memory remote peer.
///
/// Serves `_session`, the `_persona` and `_facebook` login endpoints and
/// `_local/<id>` documents with revision checking. Everything else is 404.
pub struct LoopbackPeer {
    state: Mutex<PeerState>,
    login_user: String,
    root_session: bool,
    accept_logins: bool,
}

impl LoopbackPeer {
    /// Creates a reachable peer with no session.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PeerState {
                reachable: true,
                ..PeerState::default()
            }),
            login_user: "user@example.com".to_string(),
            root_session: true,
            accept_logins: true,
        }
    }

    /// Serves `_session` only below the database, not at the server root.
    pub fn with_db_relative_session(mut self) -> Self {
        self.root_session = false;
        self
    }

    /// Rejects every login attempt with 401.
    pub fn rejecting_logins(mut self) -> Self {
        self.accept_logins = false;
        self
    }

    /// Starts with an authenticated session for `user`.
    pub fn with_session_user(self, user: impl Into<String>) -> Self {
        self.state.lock().user = Some(user.into());
        self
    }

    /// Makes the peer unreachable or reachable again.
    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().reachable = reachable;
    }

    /// Stores a `_local` document as another writer would.
    pub fn put_local(&self, id: &str, mut document: Map<String, Value>) {
        let mut state = self.state.lock();
        state.revisions += 1;
        let rev = format!("0-{}", state.revisions);
        document.insert("_rev".into(), Value::String(rev));
        state.documents.insert(id.to_string(), document);
    }

    /// Reads a `_local` document.
    pub fn local(&self, id: &str) -> Option<Map<String, Value>> {
        self.state.lock().documents.get(id).cloned()
    }

    /// Removes a `_local` document.
    pub fn delete_local(&self, id: &str) {
        self.state.lock().documents.remove(id);
    }

    /// Logged-in user, if any.
    pub fn session_user(&self) -> Option<String> {
        self.state.lock().user.clone()
    }

    /// Number of requests served.
    pub fn request_count(&self) -> usize {
        self.state.lock().requests
    }

    fn session(&self, state: &PeerState, path: &str) -> ReplicationResult<Value> {
        let at_root = path == "/_session";
        if at_root != self.root_session {
            return Err(ReplicationError::http(404, "not_found"));
        }
        Ok(json!({
            "ok": true,
            "userCtx": { "name": state.user, "roles": [] },
        }))
    }

    fn login(&self, state: &mut PeerState, request: &RemoteRequest) -> ReplicationResult<Value> {
        let body = request.body.as_ref().and_then(Value::as_object);
        let credential = body.and_then(|b| b.get("assertion").or_else(|| b.get("access_token")));
        if !self.accept_logins || credential.is_none() {
            return Err(ReplicationError::http(401, "unauthorized"));
        }
        state.user = Some(self.login_user.clone());
        Ok(json!({ "ok": true, "name": self.login_user }))
    }

    fn get_local(&self, state: &PeerState, id: &str) -> ReplicationResult<Value> {
        state
            .documents
            .get(id)
            .map(|doc| Value::Object(doc.clone()))
            .ok_or_else(|| ReplicationError::http(404, "missing"))
    }

    fn put_local_checked(
        &self,
        state: &mut PeerState,
        id: &str,
        body: Option<&Value>,
    ) -> ReplicationResult<Value> {
        let mut document = body
            .and_then(Value::as_object)
            .cloned()
            .ok_or_else(|| ReplicationError::http(400, "bad_request"))?;
        let given = document.get("_rev").and_then(Value::as_str).map(str::to_string);
        let current = state
            .documents
            .get(id)
            .and_then(|d| d.get("_rev"))
            .and_then(Value::as_str)
            .map(str::to_string);

        match (&current, &given) {
            (Some(current), Some(given)) if current == given => {}
            (Some(_), _) => return Err(ReplicationError::http(409, "conflict")),
            (None, Some(_)) => return Err(ReplicationError::http(404, "missing")),
            (None, None) => {}
        }

        state.revisions += 1;
        let rev = format!("0-{}", state.revisions);
        document.insert("_rev".into(), Value::String(rev.clone()));
        state.documents.insert(id.to_string(), document);
        debug!(id, rev = %rev, "stored local document");
        Ok(json!({ "ok": true, "id": format!("_local/{id}"), "rev": rev }))
    }
}

impl Default for LoopbackPeer {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockingClient for LoopbackPeer {
    fn execute(&self, request: &RemoteRequest) -> ReplicationResult<Value> {
        let mut state = self.state.lock();
        if !state.reachable {
            return Err(ReplicationError::transport_retryable("connection refused"));
        }
        state.requests += 1;

        let path = request.path();
        let local_id = path.split_once("/_local/").map(|(_, id)| id.to_string());

        match (request.method, path.as_str(), local_id) {
            (Method::Get, p, _) if p.ends_with("/_session") => self.session(&state, p),
            (Method::Post, p, _) if p.ends_with("/_persona") || p.ends_with("/_facebook") => {
                self.login(&mut state, request)
            }
            (Method::Get, _, Some(id)) => self.get_local(&state, &id),
            (Method::Put, _, Some(id)) => self.put_local_checked(&mut state, &id, request.body.as_ref()),
            _ => Err(ReplicationError::http(404, "not_found")),
        }
    }
}
