//! The replication session engine.
//!
//! A [`Replication`] moves revisions in one direction between the local
//! store and one remote database. Its lifecycle:
//!
//! 1. `start()` assigns a session label and posts the handshake.
//! 2. If the authorizer uses cookie login, `_session` is checked (server
//!    root first, then below the database on 404) and a login is attempted
//!    when nobody is logged in.
//! 3. The checkpoint is resolved to a starting sequence and the strategy's
//!    `begin_replicating` hook runs.
//! 4. Revisions fed through [`Replication::add_to_inbox`] are batched and
//!    handed to the strategy's `process_inbox` hook.
//! 5. A non-continuous replication stops once its inbox is empty and the
//!    task ledger drains. `stop()` makes a continuous one do the same.
//!
//! All state lives behind one mutex that is never held while calling out
//! to the transport, the store, the strategy or listeners. Transport
//! completions, timers and ledger drains are posted to the scheduler before
//! they touch state.

use crate::auth::Authorizer;
use crate::batcher::Batcher;
use crate::checkpoint::{CheckpointManager, PersistAction, PersistOutcome, Resolution};
use crate::config::ReplicationConfig;
use crate::error::{ReplicationError, ReplicationResult};
use crate::ledger::{TaskGuard, TaskLedger};
use crate::manager::next_session_label;
use crate::scheduler::{panic_message, Scheduler, TimerId};
use crate::store::LocalStore;
use crate::transport::{Method, RemoteRequest, Transport};
use docsync_protocol::{checkpoint_id, checkpoint_path, Direction, RemoteUrl, Revision, SessionInfo};
use parking_lot::Mutex;
use serde_json::Value;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Observable state of a replication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationStatus {
    /// Not running.
    Stopped,
    /// Running, but the remote is unreachable or was taken offline.
    Offline,
    /// Running with nothing to do.
    Idle,
    /// Running and transferring.
    Active,
}

impl fmt::Display for ReplicationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ReplicationStatus::Stopped => "stopped",
            ReplicationStatus::Offline => "offline",
            ReplicationStatus::Idle => "idle",
            ReplicationStatus::Active => "active",
        })
    }
}

/// Direction-specific replication logic.
///
/// Hooks run on the scheduler (or on the thread calling `stop()`, for the
/// final inbox flush) and may call back into the replication.
pub trait ReplicationStrategy: Send + Sync {
    /// Starts discovering revisions to transfer, from
    /// [`Replication::last_sequence`] onwards.
    fn begin_replicating(&self, replication: &Replication);

    /// Transfers one batch of revisions.
    fn process_inbox(
        &self,
        replication: &Replication,
        inbox: Vec<Revision>,
    ) -> ReplicationResult<()>;

    /// Creates the remote database if the configuration asks for it.
    fn maybe_create_target(&self, _replication: &Replication) {}

    /// Retries revisions that failed to transfer.
    fn retry(&self, _replication: &Replication) {}
}

/// Handle to a registered change listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&Replication) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEndpoint {
    Root,
    Database,
}

struct State {
    running: bool,
    continuous: bool,
    online: bool,
    active: bool,
    session_id: Option<String>,
    last_error: Option<ReplicationError>,
    completed_changes_count: u64,
    changes_count: u64,
    revisions_failed: u64,
    checkpoint: CheckpointManager,
    checkpoint_id: Option<String>,
    batcher: Option<Batcher<Revision>>,
    store: Option<Arc<dyn LocalStore>>,
    save_pending: bool,
    retry_timer: Option<TimerId>,
    retry_generation: u64,
}

/// Everything a replication is built from.
pub(crate) struct SessionParts {
    pub config: ReplicationConfig,
    pub remote: RemoteUrl,
    pub scheduler: Arc<dyn Scheduler>,
    pub transport: Arc<dyn Transport>,
    pub authorizer: Option<Arc<dyn Authorizer>>,
    pub strategy: Arc<dyn ReplicationStrategy>,
    pub store: Weak<dyn LocalStore>,
}

struct Inner {
    config: ReplicationConfig,
    remote: RemoteUrl,
    scheduler: Arc<dyn Scheduler>,
    transport: Arc<dyn Transport>,
    authorizer: Option<Arc<dyn Authorizer>>,
    strategy: Arc<dyn ReplicationStrategy>,
    store: Weak<dyn LocalStore>,
    ledger: Arc<TaskLedger>,
    state: Mutex<State>,
    listeners: Mutex<Vec<(ListenerId, Listener)>>,
    next_listener: AtomicU64,
}

/// A replication between the local store and one remote database.
///
/// Cloning yields another handle to the same replication. The replication
/// does not keep the local store alive; if the store is gone `start()`
/// does nothing.
#[derive(Clone)]
pub struct Replication {
    inner: Arc<Inner>,
}

impl fmt::Debug for Replication {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Replication")
            .field("remote", &self.inner.remote.as_str())
            .field("direction", &self.inner.config.direction)
            .field("session_id", &state.session_id)
            .field("running", &state.running)
            .finish()
    }
}

impl Replication {
    pub(crate) fn new(parts: SessionParts) -> Self {
        let continuous = parts.config.continuous;
        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let target = weak.clone();
            let scheduler = Arc::clone(&parts.scheduler);
            let ledger = TaskLedger::with_drain_hook(move || {
                let target = target.clone();
                scheduler.post(Box::new(move || {
                    if let Some(inner) = target.upgrade() {
                        Replication { inner }.update_active();
                    }
                }));
            });

            Inner {
                config: parts.config,
                remote: parts.remote,
                scheduler: parts.scheduler,
                transport: parts.transport,
                authorizer: parts.authorizer,
                strategy: parts.strategy,
                store: parts.store,
                ledger: Arc::new(ledger),
                state: Mutex::new(State {
                    running: false,
                    continuous,
                    online: true,
                    active: false,
                    session_id: None,
                    last_error: None,
                    completed_changes_count: 0,
                    changes_count: 0,
                    revisions_failed: 0,
                    checkpoint: CheckpointManager::new(),
                    checkpoint_id: None,
                    batcher: None,
                    store: None,
                    save_pending: false,
                    retry_timer: None,
                    retry_generation: 0,
                }),
                listeners: Mutex::new(Vec::new()),
                next_listener: AtomicU64::new(0),
            }
        });
        Self { inner }
    }

    // ---- lifecycle -------------------------------------------------------

    /// Starts replicating. Does nothing if already running.
    pub fn start(&self) {
        let Some(store) = self.inner.store.upgrade() else {
            warn!(remote = %self.inner.remote, "local store is gone, not starting");
            return;
        };

        let session_id = {
            let mut state = self.inner.state.lock();
            if state.running {
                return;
            }
            let session_id = next_session_label();
            state.session_id = Some(session_id.clone());
            state.running = true;
            state.active = false;
            state.checkpoint.clear_sequence();
            state.checkpoint_id = Some(checkpoint_id(
                &store.private_identity(),
                self.inner.remote.as_str(),
                self.inner.config.direction,
            ));
            state.store = Some(store);
            state.batcher = Some(self.new_inbox());
            session_id
        };

        info!(
            session = %session_id,
            remote = %self.inner.remote,
            direction = %self.inner.config.direction,
            "starting replication"
        );
        self.notify_listeners();
        self.run_later(Duration::ZERO, |this| this.check_session());
    }

    /// Stops replicating. Queued revisions are processed first, and the
    /// replication reports stopped once outstanding requests complete.
    pub fn stop(&self) {
        let (session_id, batcher, retry_timer) = {
            let mut state = self.inner.state.lock();
            if !state.running {
                return;
            }
            state.continuous = false;
            state.retry_generation += 1;
            (
                state.session_id.clone().unwrap_or_default(),
                state.batcher.clone(),
                state.retry_timer.take(),
            )
        };
        info!(session = %session_id, "stopping replication");

        if let Some(id) = retry_timer {
            self.inner.scheduler.cancel(id);
        }
        if let Some(batcher) = batcher {
            batcher.flush_all();
        }

        let outstanding = self.inner.ledger.count();
        if outstanding == 0 {
            self.stopped();
        } else {
            debug!(session = %session_id, outstanding, "waiting for outstanding tasks");
        }
    }

    /// Stops, then starts again.
    ///
    /// If requests are still outstanding when `stop()` returns, the
    /// replication is still running and the start is a no-op.
    pub fn restart(&self) {
        self.stop();
        self.start();
    }

    /// Saves the checkpoint, drops queued revisions and stops. For use
    /// when the local database is closing.
    pub fn database_closing(&self) {
        self.persist_checkpoint();
        let batcher = self.inner.state.lock().batcher.clone();
        if let Some(batcher) = batcher {
            batcher.clear();
        }
        self.stop();
    }

    /// Marks the remote unreachable. Returns false if already offline.
    pub fn go_offline(&self) -> bool {
        {
            let mut state = self.inner.state.lock();
            if !state.online {
                return false;
            }
            state.online = false;
        }
        info!(remote = %self.inner.remote, "going offline");
        self.notify_listeners();
        true
    }

    /// Marks the remote reachable again and, if running, repeats the
    /// handshake. Returns false if already online.
    pub fn go_online(&self) -> bool {
        let running = {
            let mut state = self.inner.state.lock();
            if state.online {
                return false;
            }
            state.online = true;
            if state.running {
                state.checkpoint.clear_sequence();
                state.last_error = None;
            }
            state.running
        };
        info!(remote = %self.inner.remote, "going online");
        if running {
            self.run_later(Duration::ZERO, |this| this.check_session());
        }
        self.notify_listeners();
        true
    }

    fn stopped(&self) {
        let session_id = {
            let mut state = self.inner.state.lock();
            if !state.running {
                return;
            }
            state.running = false;
            state.active = false;
            state.completed_changes_count = 0;
            state.changes_count = 0;
            state.revisions_failed = 0;
            state.last_error = None;
            state.session_id.clone().unwrap_or_default()
        };

        self.persist_checkpoint();
        self.notify_listeners();

        let (batcher, store) = {
            let mut state = self.inner.state.lock();
            (state.batcher.take(), state.store.take())
        };
        drop(batcher);
        drop(store);
        info!(session = %session_id, "replication stopped");
    }

    // ---- handshake -------------------------------------------------------

    fn check_session(&self) {
        if !self.is_running() {
            return;
        }
        match &self.inner.authorizer {
            Some(authorizer) if authorizer.uses_cookie_login() => {
                self.check_session_at(SessionEndpoint::Root)
            }
            _ => self.fetch_remote_checkpoint(),
        }
    }

    fn check_session_at(&self, endpoint: SessionEndpoint) {
        let url = match endpoint {
            SessionEndpoint::Root => self.inner.remote.join_root("/_session"),
            SessionEndpoint::Database => self.inner.remote.join("_session"),
        };
        self.send_request(Method::Get, &url, None, move |this, result| match result {
            Err(err) if err.is_not_found() && endpoint == SessionEndpoint::Root => {
                debug!("no session endpoint at server root, trying database");
                this.check_session_at(SessionEndpoint::Database);
            }
            Err(err) => {
                warn!(error = %err, "session check failed");
                this.set_last_error(Some(err));
                this.fetch_remote_checkpoint();
            }
            Ok(response) => {
                let session = SessionInfo::from_value(&response);
                match session.user_name() {
                    Some(user) => {
                        debug!(user, "active session");
                        this.fetch_remote_checkpoint();
                    }
                    None => {
                        debug!("no active session, logging in");
                        this.login();
                    }
                }
            }
        });
    }

    fn login(&self) {
        let Some(authorizer) = self.inner.authorizer.clone() else {
            self.fetch_remote_checkpoint();
            return;
        };
        let Some(parameters) = authorizer.login_parameters(&self.inner.remote) else {
            debug!("authorizer has no login parameters, skipping login");
            self.fetch_remote_checkpoint();
            return;
        };

        let path = authorizer.login_path(&self.inner.remote);
        debug!(path = %path, "logging in");
        let body = Value::Object(parameters);
        let login_path = path.clone();
        self.send_request(Method::Post, &login_path, Some(body), move |this, result| {
            match result {
                Ok(_) => debug!("logged in"),
                Err(err) => {
                    // Later requests fail on their own if this mattered.
                    warn!(path = %path, error = %err, "login failed");
                    this.set_last_error(Some(err));
                }
            }
            this.fetch_remote_checkpoint();
        });
    }

    // ---- checkpoint ------------------------------------------------------

    fn fetch_remote_checkpoint(&self) {
        let (store, id) = {
            let state = self.inner.state.lock();
            if !state.running {
                return;
            }
            (state.store.clone(), state.checkpoint_id.clone())
        };
        let (Some(store), Some(id)) = (store, id) else {
            return;
        };

        let local = store.last_sequence(self.inner.remote.as_str(), self.inner.config.direction);
        match local {
            None => {
                let resolution = self.inner.state.lock().checkpoint.resolve_without_local();
                self.apply_resolution(resolution);
            }
            Some(local) => {
                debug!(checkpoint = %id, local = %local, "fetching remote checkpoint");
                self.send_request(Method::Get, &checkpoint_path(&id), None, move |this, result| {
                    let resolution = this.inner.state.lock().checkpoint.resolve(&local, result);
                    this.apply_resolution(resolution);
                });
            }
        }
    }

    fn apply_resolution(&self, resolution: Resolution) {
        if !self.is_running() {
            return;
        }
        if let Some(err) = resolution.error {
            self.set_last_error(Some(err));
        }
        if resolution.create_target {
            self.call_strategy("maybe_create_target", |strategy, this| {
                strategy.maybe_create_target(this)
            });
        }
        info!(
            start = resolution.start_sequence.as_deref().unwrap_or(""),
            "beginning replication"
        );
        self.call_strategy("begin_replicating", |strategy, this| {
            strategy.begin_replicating(this)
        });
    }

    /// Advances the replication cursor. Repeats are ignored; changes are
    /// written to the remote checkpoint after a short delay so bursts
    /// coalesce into one write.
    pub fn set_last_sequence(&self, sequence: &str) {
        let arm = {
            let mut state = self.inner.state.lock();
            let arm = state.checkpoint.record_sequence(Some(sequence)) && !state.save_pending;
            if arm {
                state.save_pending = true;
            }
            arm
        };
        if arm {
            let guard = self.begin_task();
            let delay = self.inner.config.checkpoint_save_delay;
            self.run_later(delay, move |this| {
                this.inner.state.lock().save_pending = false;
                this.persist_checkpoint();
                guard.finish();
            });
        }
    }

    fn persist_checkpoint(&self) {
        let (action, store, id) = {
            let mut state = self.inner.state.lock();
            let Some(id) = state.checkpoint_id.clone() else {
                return;
            };
            (state.checkpoint.begin_persist(), state.store.clone(), id)
        };

        let PersistAction::Write { body, sequence } = action else {
            return;
        };
        if let Some(store) = store {
            store.set_last_sequence(&sequence, self.inner.remote.as_str(), self.inner.config.direction);
        }

        debug!(checkpoint = %id, sequence = %sequence, "saving checkpoint");
        let path = checkpoint_path(&id);
        let request_body = body.to_value();
        self.send_request(Method::Put, &path, Some(request_body), move |this, result| {
            let outcome = this.inner.state.lock().checkpoint.complete_persist(body, result);
            this.follow_persist_outcome(outcome);
        });
    }

    fn follow_persist_outcome(&self, outcome: PersistOutcome) {
        match outcome {
            PersistOutcome::Done => {}
            PersistOutcome::PersistAgain => self.persist_checkpoint(),
            PersistOutcome::Refresh => self.refresh_checkpoint(),
            PersistOutcome::Failed {
                error,
                persist_again,
            } => {
                self.set_last_error(Some(error));
                if persist_again {
                    self.persist_checkpoint();
                }
            }
        }
    }

    fn refresh_checkpoint(&self) {
        let Some(id) = self.checkpoint_id() else {
            return;
        };
        debug!(checkpoint = %id, "refreshing remote checkpoint");
        self.send_request(Method::Get, &checkpoint_path(&id), None, |this, result| {
            let outcome = this.inner.state.lock().checkpoint.complete_refresh(result);
            this.follow_persist_outcome(outcome);
        });
    }

    // ---- inbox -----------------------------------------------------------

    fn new_inbox(&self) -> Batcher<Revision> {
        let weak = Arc::downgrade(&self.inner);
        Batcher::new(
            Arc::clone(&self.inner.scheduler),
            self.inner.config.inbox_capacity,
            self.inner.config.processor_delay,
            move |inbox: Vec<Revision>| {
                if let Some(inner) = weak.upgrade() {
                    Replication { inner }.process_inbox(inbox);
                }
            },
        )
    }

    /// Queues a revision for transfer. Ignored unless running.
    pub fn add_to_inbox(&self, revision: Revision) {
        let batcher = self.inner.state.lock().batcher.clone();
        match batcher {
            Some(batcher) => {
                batcher.queue_object(revision);
                self.update_active();
            }
            None => debug!(doc = %revision.doc_id, "not running, dropping revision"),
        }
    }

    fn process_inbox(&self, inbox: Vec<Revision>) {
        let count = inbox.len();
        debug!(count, "processing inbox");
        let strategy = Arc::clone(&self.inner.strategy);
        match catch_unwind(AssertUnwindSafe(|| strategy.process_inbox(self, inbox))) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => self.set_last_error(Some(err)),
            Err(payload) => {
                error!(panic = %panic_message(payload.as_ref()), "inbox processor panicked");
            }
        }
        debug!(
            count,
            last_sequence = self.last_sequence().as_deref().unwrap_or(""),
            "processed inbox"
        );
        self.update_active();
    }

    /// Number of revisions waiting in the inbox.
    pub fn inbox_count(&self) -> usize {
        let batcher = self.inner.state.lock().batcher.clone();
        batcher.map_or(0, |b| b.count())
    }

    // ---- activity --------------------------------------------------------

    fn begin_task(&self) -> TaskGuard {
        let guard = self.inner.ledger.begin();
        self.update_active();
        guard
    }

    fn update_active(&self) {
        let batcher = {
            let state = self.inner.state.lock();
            if !state.running {
                return;
            }
            state.batcher.clone()
        };
        let queued = batcher.map_or(0, |b| b.count());
        let tasks = self.inner.ledger.count();
        let active = queued > 0 || tasks > 0;

        let (continuous, failed) = {
            let mut state = self.inner.state.lock();
            if !state.running || state.active == active {
                return;
            }
            state.active = active;
            (state.continuous, state.last_error.is_some())
        };
        debug!(active, queued, tasks, "activity changed");
        self.notify_listeners();

        if !active {
            if !continuous {
                self.stopped();
            } else if failed {
                self.schedule_retry();
            }
        }
    }

    fn schedule_retry(&self) {
        let (generation, previous) = {
            let mut state = self.inner.state.lock();
            state.retry_generation += 1;
            (state.retry_generation, state.retry_timer.take())
        };
        if let Some(id) = previous {
            self.inner.scheduler.cancel(id);
        }

        let delay = self.inner.config.retry_delay;
        debug!(?delay, "scheduling retry");
        let id = self.run_later(delay, move |this| this.retry_if_ready(generation));

        let mut state = self.inner.state.lock();
        if state.retry_generation == generation {
            state.retry_timer = Some(id);
        }
    }

    fn retry_if_ready(&self, generation: u64) {
        let online = {
            let mut state = self.inner.state.lock();
            if !state.running || state.retry_generation != generation {
                return;
            }
            state.retry_timer = None;
            if state.online {
                state.revisions_failed = 0;
            }
            state.online
        };
        if !online {
            self.schedule_retry();
            return;
        }
        info!("retrying failed transfers");
        self.set_last_error(None);
        self.call_strategy("retry", |strategy, this| strategy.retry(this));
    }

    // ---- requests --------------------------------------------------------

    /// Sends a request to the remote and runs `on_complete` on the
    /// scheduler with the outcome.
    ///
    /// `path` is resolved against the remote database unless it is already
    /// an absolute URL. The request counts as outstanding work until
    /// `on_complete` returns.
    pub fn send_request<F>(&self, method: Method, path: &str, body: Option<Value>, on_complete: F)
    where
        F: FnOnce(&Replication, ReplicationResult<Value>) + Send + 'static,
    {
        let url = if path.contains("://") {
            path.to_string()
        } else {
            self.inner.remote.join(path)
        };
        let mut request =
            RemoteRequest::new(method, url).with_headers(self.inner.config.headers.clone());
        if let Some(body) = body {
            request = request.with_body(body);
        }
        debug!(method = %request.method, url = %request.url, "sending request");

        let guard = self.begin_task();
        let weak = Arc::downgrade(&self.inner);
        let scheduler = Arc::clone(&self.inner.scheduler);
        self.inner.transport.send(
            request,
            Box::new(move |result| {
                scheduler.post(Box::new(move || {
                    if let Some(inner) = weak.upgrade() {
                        on_complete(&Replication { inner }, result);
                    }
                    guard.finish();
                }));
            }),
        );
    }

    fn run_later<F>(&self, delay: Duration, job: F) -> TimerId
    where
        F: FnOnce(&Replication) + Send + 'static,
    {
        let weak = Arc::downgrade(&self.inner);
        self.inner.scheduler.schedule(
            delay,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    job(&Replication { inner });
                }
            }),
        )
    }

    fn call_strategy(&self, hook: &str, f: impl FnOnce(&dyn ReplicationStrategy, &Replication)) {
        let strategy = Arc::clone(&self.inner.strategy);
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| f(strategy.as_ref(), self))) {
            error!(hook, panic = %panic_message(payload.as_ref()), "strategy hook panicked");
        }
    }

    // ---- listeners -------------------------------------------------------

    /// Registers a listener called whenever observable state changes.
    ///
    /// Listeners run synchronously on whichever thread made the change and
    /// must not block.
    pub fn add_change_listener(&self, listener: impl Fn(&Replication) + Send + Sync + 'static) -> ListenerId {
        let id = ListenerId(self.inner.next_listener.fetch_add(1, Ordering::Relaxed));
        let listener: Listener = Arc::new(listener);
        self.inner.listeners.lock().push((id, listener));
        id
    }

    /// Unregisters a listener. Returns false if it was not registered.
    pub fn remove_change_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.inner.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    fn notify_listeners(&self) {
        let listeners: Vec<Listener> = self
            .inner
            .listeners
            .lock()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| listener(self))) {
                error!(panic = %panic_message(payload.as_ref()), "change listener panicked");
            }
        }
    }

    // ---- observable fields -----------------------------------------------

    /// Current status.
    pub fn status(&self) -> ReplicationStatus {
        let state = self.inner.state.lock();
        let unreachable = !state.active
            && state
                .last_error
                .as_ref()
                .is_some_and(ReplicationError::is_connectivity);
        if !state.running {
            ReplicationStatus::Stopped
        } else if !state.online || unreachable {
            ReplicationStatus::Offline
        } else if state.active {
            ReplicationStatus::Active
        } else {
            ReplicationStatus::Idle
        }
    }

    /// Returns true between `start()` and the completion of `stop()`.
    pub fn is_running(&self) -> bool {
        self.inner.state.lock().running
    }

    /// Returns true if the replication keeps running once caught up.
    pub fn is_continuous(&self) -> bool {
        self.inner.state.lock().continuous
    }

    /// Sets whether the replication is continuous. Ignored while running.
    pub fn set_continuous(&self, continuous: bool) {
        let mut state = self.inner.state.lock();
        if state.running {
            warn!("cannot change continuous while running");
            return;
        }
        state.continuous = continuous;
    }

    /// Returns true unless taken offline.
    pub fn is_online(&self) -> bool {
        self.inner.state.lock().online
    }

    /// Current cursor.
    pub fn last_sequence(&self) -> Option<String> {
        self.inner
            .state
            .lock()
            .checkpoint
            .last_sequence()
            .map(str::to_string)
    }

    /// Label of the current (or last) session, e.g. `repl001`.
    pub fn session_id(&self) -> Option<String> {
        self.inner.state.lock().session_id.clone()
    }

    /// Id of the remote checkpoint document, known once started.
    pub fn checkpoint_id(&self) -> Option<String> {
        self.inner.state.lock().checkpoint_id.clone()
    }

    /// The most recent error, until overwritten or the replication stops.
    pub fn last_error(&self) -> Option<ReplicationError> {
        self.inner.state.lock().last_error.clone()
    }

    /// Replaces the last error.
    pub fn set_last_error(&self, error: Option<ReplicationError>) {
        {
            let mut state = self.inner.state.lock();
            if state.last_error == error {
                return;
            }
            if let Some(err) = &error {
                error!(session = state.session_id.as_deref().unwrap_or(""), error = %err, "replication error");
            }
            state.last_error = error;
        }
        self.notify_listeners();
    }

    /// Number of changes transferred so far.
    pub fn completed_changes_count(&self) -> u64 {
        self.inner.state.lock().completed_changes_count
    }

    /// Sets the number of changes transferred so far.
    pub fn set_completed_changes_count(&self, count: u64) {
        {
            let mut state = self.inner.state.lock();
            if state.completed_changes_count == count {
                return;
            }
            state.completed_changes_count = count;
        }
        self.notify_listeners();
    }

    /// Total number of changes known so far.
    pub fn changes_count(&self) -> u64 {
        self.inner.state.lock().changes_count
    }

    /// Sets the total number of changes known so far.
    pub fn set_changes_count(&self, count: u64) {
        {
            let mut state = self.inner.state.lock();
            if state.changes_count == count {
                return;
            }
            state.changes_count = count;
        }
        self.notify_listeners();
    }

    /// Records a revision that failed to transfer.
    pub fn revision_failed(&self) {
        self.inner.state.lock().revisions_failed += 1;
    }

    /// Number of revisions that failed since the last retry.
    pub fn revisions_failed(&self) -> u64 {
        self.inner.state.lock().revisions_failed
    }

    /// Number of outstanding asynchronous operations.
    pub fn pending_tasks(&self) -> i64 {
        self.inner.ledger.count()
    }

    /// The remote database, without query parameters.
    pub fn remote(&self) -> &RemoteUrl {
        &self.inner.remote
    }

    /// Push or pull.
    pub fn direction(&self) -> Direction {
        self.inner.config.direction
    }

    /// The configuration this replication was created with.
    pub fn config(&self) -> &ReplicationConfig {
        &self.inner.config
    }
}
