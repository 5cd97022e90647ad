//! Integration tests for replication sessions against scripted and
//! in-memory remotes.

use docsync_protocol::checkpoint_id;
use docsync_replicator::{
    BlockingClient, Completion, Direction, LocalStore, LoopbackPeer, ManualScheduler, MemoryStore,
    Method, MockTransport, RemoteRequest, Replication, ReplicationConfig, ReplicationError,
    ReplicationManager, ReplicationResult, ReplicationStatus, ReplicationStrategy, Revision,
    Scheduler, ThreadScheduler, ThreadedTransport, Transport,
};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

const REMOTE: &str = "http://example.com/db";
const IDENTITY: &str = "local-db";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A transport that answers from an in-memory peer on the calling thread.
struct PeerTransport {
    peer: Arc<LoopbackPeer>,
}

impl Transport for PeerTransport {
    fn send(&self, request: RemoteRequest, completion: Completion) {
        completion(self.peer.execute(&request));
    }
}

/// Records hook calls and feeds revisions when replication begins.
#[derive(Default)]
struct Recorder {
    begun_at: Mutex<Vec<Option<String>>>,
    created_target: AtomicUsize,
    retries: AtomicUsize,
    batches: Mutex<Vec<Vec<Revision>>>,
    feed: Mutex<Vec<Revision>>,
}

impl Recorder {
    fn feeding(revisions: Vec<Revision>) -> Self {
        Self {
            feed: Mutex::new(revisions),
            ..Self::default()
        }
    }

    fn begun(&self) -> usize {
        self.begun_at.lock().len()
    }
}

impl ReplicationStrategy for Recorder {
    fn begin_replicating(&self, replication: &Replication) {
        self.begun_at.lock().push(replication.last_sequence());
        let feed: Vec<Revision> = self.feed.lock().drain(..).collect();
        for revision in feed {
            replication.add_to_inbox(revision);
        }
    }

    fn process_inbox(&self, replication: &Replication, inbox: Vec<Revision>) -> ReplicationResult<()> {
        for revision in &inbox {
            if let Some(sequence) = &revision.sequence {
                replication.set_last_sequence(sequence);
            }
        }
        replication.set_completed_changes_count(
            replication.completed_changes_count() + inbox.len() as u64,
        );
        self.batches.lock().push(inbox);
        Ok(())
    }

    fn maybe_create_target(&self, _replication: &Replication) {
        self.created_target.fetch_add(1, Ordering::SeqCst);
    }

    fn retry(&self, _replication: &Replication) {
        self.retries.fetch_add(1, Ordering::SeqCst);
    }
}

fn revisions(n: usize) -> Vec<Revision> {
    (1..=n)
        .map(|i| Revision::new(format!("doc{i}"), format!("1-{i}")).with_sequence(i.to_string()))
        .collect()
}

fn checkpoint_url_path(direction: Direction) -> String {
    format!("/db/_local/{}", checkpoint_id(IDENTITY, REMOTE, direction))
}

struct Harness {
    scheduler: Arc<ManualScheduler>,
    transport: Arc<MockTransport>,
    manager: ReplicationManager,
    store: Arc<dyn LocalStore>,
}

impl Harness {
    fn new(store: MemoryStore) -> Self {
        init_tracing();
        let scheduler = Arc::new(ManualScheduler::new());
        let transport = Arc::new(MockTransport::new());
        let manager = ReplicationManager::new(
            Arc::clone(&scheduler) as Arc<dyn Scheduler>,
            Arc::clone(&transport) as Arc<dyn Transport>,
        );
        Self {
            scheduler,
            transport,
            manager,
            store: Arc::new(store),
        }
    }

    fn empty() -> Self {
        Self::new(MemoryStore::new(IDENTITY))
    }

    fn replication(&self, config: ReplicationConfig, strategy: &Arc<Recorder>) -> Replication {
        self.manager
            .replication(config, &self.store, Arc::clone(strategy) as Arc<dyn ReplicationStrategy>)
            .unwrap()
    }
}

fn stop_counter(replication: &Replication) -> Arc<AtomicUsize> {
    let stops = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&stops);
    replication.add_change_listener(move |r| {
        if r.status() == ReplicationStatus::Stopped {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });
    stops
}

#[test]
fn no_local_sequence_skips_remote_fetch() {
    let harness = Harness::empty();
    let strategy = Arc::new(Recorder::default());
    let replication = harness.replication(ReplicationConfig::pull(REMOTE).with_continuous(true), &strategy);

    replication.start();
    harness.scheduler.run_until_idle();

    assert!(harness.transport.requests().is_empty());
    assert_eq!(strategy.created_target.load(Ordering::SeqCst), 1);
    assert_eq!(*strategy.begun_at.lock(), vec![None]);
}

#[test]
fn matching_checkpoint_resumes_from_local_sequence() {
    let harness =
        Harness::new(MemoryStore::new(IDENTITY).with_sequence(REMOTE, Direction::Pull, "5"));
    let path = checkpoint_url_path(Direction::Pull);
    harness
        .transport
        .respond(Method::Get, &path, Ok(json!({"lastSequence": "5", "_rev": "0-1"})));
    let strategy = Arc::new(Recorder::default());
    let replication = harness.replication(ReplicationConfig::pull(REMOTE).with_continuous(true), &strategy);

    replication.start();
    harness.scheduler.run_until_idle();

    assert_eq!(harness.transport.requests_to(Method::Get, &path).len(), 1);
    assert_eq!(*strategy.begun_at.lock(), vec![Some("5".to_string())]);
    assert_eq!(strategy.created_target.load(Ordering::SeqCst), 0);
    assert_eq!(replication.last_sequence().as_deref(), Some("5"));
}

#[test]
fn mismatched_checkpoint_starts_from_scratch() {
    let harness =
        Harness::new(MemoryStore::new(IDENTITY).with_sequence(REMOTE, Direction::Pull, "5"));
    harness.transport.respond(
        Method::Get,
        &checkpoint_url_path(Direction::Pull),
        Ok(json!({"lastSequence": "3", "_rev": "0-1"})),
    );
    let strategy = Arc::new(Recorder::default());
    let replication = harness.replication(ReplicationConfig::pull(REMOTE).with_continuous(true), &strategy);

    replication.start();
    harness.scheduler.run_until_idle();

    assert_eq!(*strategy.begun_at.lock(), vec![None]);
    assert_eq!(replication.last_sequence(), None);
}

#[test]
fn missing_remote_checkpoint_creates_target() {
    let harness =
        Harness::new(MemoryStore::new(IDENTITY).with_sequence(REMOTE, Direction::Push, "5"));
    let strategy = Arc::new(Recorder::default());
    let replication = harness.replication(ReplicationConfig::push(REMOTE).with_continuous(true), &strategy);

    replication.start();
    harness.scheduler.run_until_idle();

    assert_eq!(strategy.created_target.load(Ordering::SeqCst), 1);
    assert_eq!(*strategy.begun_at.lock(), vec![None]);
    assert!(replication.last_error().is_none());
}

#[test]
fn checkpoint_fetch_error_does_not_block_replication() {
    let harness =
        Harness::new(MemoryStore::new(IDENTITY).with_sequence(REMOTE, Direction::Pull, "5"));
    harness.transport.respond(
        Method::Get,
        &checkpoint_url_path(Direction::Pull),
        Err(ReplicationError::http(500, "server error")),
    );
    let strategy = Arc::new(Recorder::default());
    let replication = harness.replication(ReplicationConfig::pull(REMOTE).with_continuous(true), &strategy);

    replication.start();
    harness.scheduler.run_until_idle();

    assert_eq!(strategy.begun(), 1);
    assert_eq!(replication.last_error(), Some(ReplicationError::http(500, "server error")));
}

#[test]
fn stop_waits_for_outstanding_tasks() {
    let harness = Harness::empty();
    let strategy = Arc::new(Recorder::default());
    let replication = harness.replication(ReplicationConfig::pull(REMOTE).with_continuous(true), &strategy);

    replication.start();
    harness.scheduler.run_until_idle();
    let stops = stop_counter(&replication);

    harness.transport.set_deferred(true);
    replication.send_request(Method::Get, "_changes", None, |_, _| {});
    replication.send_request(Method::Get, "_changes", None, |_, _| {});
    assert_eq!(replication.pending_tasks(), 2);

    replication.stop();
    assert!(replication.is_running());
    assert_eq!(replication.status(), ReplicationStatus::Active);

    harness.transport.release_next();
    harness.scheduler.run_until_idle();
    assert!(replication.is_running());

    harness.transport.release_next();
    harness.scheduler.run_until_idle();
    assert!(!replication.is_running());
    assert_eq!(replication.status(), ReplicationStatus::Stopped);
    assert_eq!(stops.load(Ordering::SeqCst), 1);
}

#[test]
fn continuous_session_idles_when_drained() {
    let harness = Harness::empty();
    let strategy = Arc::new(Recorder::default());
    let replication = harness.replication(ReplicationConfig::pull(REMOTE).with_continuous(true), &strategy);

    replication.start();
    harness.scheduler.run_until_idle();
    replication.set_changes_count(5);
    replication.set_completed_changes_count(3);

    harness.transport.set_deferred(true);
    replication.send_request(Method::Get, "_changes", None, |_, _| {});
    assert_eq!(replication.status(), ReplicationStatus::Active);

    harness.transport.release_all();
    harness.scheduler.run_until_idle();

    assert_eq!(replication.status(), ReplicationStatus::Idle);
    assert!(replication.is_running());
    assert_eq!(replication.changes_count(), 5);
    assert_eq!(replication.completed_changes_count(), 3);
}

#[test]
fn one_shot_session_stops_after_transfer() {
    let harness = Harness::empty();
    let path = checkpoint_url_path(Direction::Pull);
    harness
        .transport
        .respond(Method::Put, &path, Ok(json!({"ok": true, "rev": "0-1"})));
    let strategy = Arc::new(Recorder::feeding(revisions(3)));
    let replication = harness.replication(ReplicationConfig::pull(REMOTE), &strategy);

    let statuses = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&statuses);
    replication.add_change_listener(move |r| sink.lock().push(r.status()));

    replication.start();
    harness.scheduler.run_until_idle();
    assert_eq!(strategy.batches.lock().len(), 1);
    assert!(replication.is_running());

    harness.scheduler.advance(Duration::from_secs(2));

    assert!(!replication.is_running());
    assert_eq!(strategy.batches.lock()[0].len(), 3);
    assert_eq!(
        harness.store.last_sequence(REMOTE, Direction::Pull).as_deref(),
        Some("3")
    );
    let puts = harness.transport.requests_to(Method::Put, &path);
    assert_eq!(puts.len(), 1);
    assert_eq!(puts[0].body.as_ref().unwrap()["lastSequence"], "3");

    // Progress counters are reset once stopped.
    assert_eq!(replication.completed_changes_count(), 0);
    let statuses = statuses.lock();
    assert!(statuses.contains(&ReplicationStatus::Active));
    assert_eq!(statuses.last(), Some(&ReplicationStatus::Stopped));
}

#[test]
fn checkpoint_writes_coalesce() {
    let harness = Harness::empty();
    let path = checkpoint_url_path(Direction::Pull);
    harness
        .transport
        .respond(Method::Put, &path, Ok(json!({"ok": true, "rev": "0-1"})));
    let strategy = Arc::new(Recorder::default());
    let replication = harness.replication(ReplicationConfig::pull(REMOTE).with_continuous(true), &strategy);

    replication.start();
    harness.scheduler.run_until_idle();

    for seq in ["1", "2", "3", "3"] {
        replication.set_last_sequence(seq);
    }
    harness.scheduler.advance(Duration::from_millis(1999));
    assert!(harness.transport.requests_to(Method::Put, &path).is_empty());

    harness.scheduler.advance(Duration::from_millis(1));
    let puts = harness.transport.requests_to(Method::Put, &path);
    assert_eq!(puts.len(), 1);
    assert_eq!(puts[0].body.as_ref().unwrap()["lastSequence"], "3");
}

#[test]
fn checkpoint_write_in_flight_defers_the_next_one() {
    let harness = Harness::empty();
    let path = checkpoint_url_path(Direction::Pull);
    harness
        .transport
        .respond_once(Method::Put, &path, Ok(json!({"ok": true, "rev": "0-1"})));
    harness
        .transport
        .respond(Method::Put, &path, Ok(json!({"ok": true, "rev": "0-2"})));
    let strategy = Arc::new(Recorder::default());
    let replication = harness.replication(ReplicationConfig::pull(REMOTE).with_continuous(true), &strategy);

    replication.start();
    harness.scheduler.run_until_idle();
    harness.transport.set_deferred(true);

    replication.set_last_sequence("1");
    harness.scheduler.advance(Duration::from_secs(2));
    assert_eq!(harness.transport.held(), 1);

    replication.set_last_sequence("2");
    replication.set_last_sequence("3");
    harness.scheduler.advance(Duration::from_secs(2));
    // Still only the first write on the wire.
    assert_eq!(harness.transport.held(), 1);

    harness.transport.release_next();
    harness.scheduler.run_until_idle();
    assert_eq!(harness.transport.held(), 1);

    harness.transport.release_all();
    harness.scheduler.run_until_idle();

    let puts = harness.transport.requests_to(Method::Put, &path);
    assert_eq!(puts.len(), 2);
    let second = puts[1].body.as_ref().unwrap();
    assert_eq!(second["lastSequence"], "3");
    assert_eq!(second["_rev"], "0-1");
}

#[test]
fn checkpoint_conflict_refreshes_and_rewrites() {
    let harness = Harness::empty();
    let path = checkpoint_url_path(Direction::Pull);
    harness
        .transport
        .respond_once(Method::Put, &path, Err(ReplicationError::http(409, "conflict")));
    harness
        .transport
        .respond(Method::Put, &path, Ok(json!({"ok": true, "rev": "0-8"})));
    harness.transport.respond(
        Method::Get,
        &path,
        Ok(json!({"lastSequence": "1", "_rev": "0-7", "other": true})),
    );
    let strategy = Arc::new(Recorder::default());
    let replication = harness.replication(ReplicationConfig::pull(REMOTE).with_continuous(true), &strategy);

    replication.start();
    harness.scheduler.run_until_idle();
    replication.set_last_sequence("9");
    harness.scheduler.advance(Duration::from_secs(2));

    assert_eq!(harness.transport.requests_to(Method::Get, &path).len(), 1);
    let puts = harness.transport.requests_to(Method::Put, &path);
    assert_eq!(puts.len(), 2);
    let rewrite = puts[1].body.as_ref().unwrap();
    assert_eq!(rewrite["_rev"], "0-7");
    assert_eq!(rewrite["lastSequence"], "9");
    assert_eq!(rewrite["other"], true);
    assert!(replication.last_error().is_none());
}

#[test]
fn failed_refresh_after_conflict_keeps_checkpoint_moving() {
    let harness = Harness::empty();
    let path = checkpoint_url_path(Direction::Pull);
    harness
        .transport
        .respond_once(Method::Put, &path, Err(ReplicationError::http(409, "conflict")));
    harness
        .transport
        .respond(Method::Put, &path, Ok(json!({"ok": true, "rev": "0-2"})));
    harness
        .transport
        .respond(Method::Get, &path, Err(ReplicationError::http(500, "server error")));
    let strategy = Arc::new(Recorder::default());
    let replication = harness.replication(ReplicationConfig::pull(REMOTE).with_continuous(true), &strategy);

    replication.start();
    harness.scheduler.run_until_idle();
    harness.transport.set_deferred(true);

    replication.set_last_sequence("1");
    harness.scheduler.advance(Duration::from_secs(2));
    assert!(harness.transport.release_next());
    harness.scheduler.run_until_idle();
    assert_eq!(harness.transport.requests_to(Method::Get, &path).len(), 1);

    // Advance while the refresh is still outstanding.
    replication.set_last_sequence("2");
    harness.scheduler.advance(Duration::from_secs(2));
    assert_eq!(harness.transport.requests_to(Method::Put, &path).len(), 1);

    assert!(harness.transport.release_next());
    harness.scheduler.run_until_idle();
    assert_eq!(replication.last_error(), Some(ReplicationError::http(500, "server error")));
    harness.transport.release_all();
    harness.scheduler.run_until_idle();
    assert_eq!(harness.transport.requests_to(Method::Put, &path).len(), 2);

    replication.set_last_sequence("3");
    replication.set_last_sequence("4");
    harness.scheduler.advance(Duration::from_secs(2));
    harness.transport.release_all();
    harness.scheduler.run_until_idle();

    let puts = harness.transport.requests_to(Method::Put, &path);
    assert_eq!(puts.len(), 3);
    assert_eq!(puts[1].body.as_ref().unwrap()["lastSequence"], "2");
    assert_eq!(puts[2].body.as_ref().unwrap()["lastSequence"], "4");
    assert_eq!(
        harness.store.last_sequence(REMOTE, Direction::Pull).as_deref(),
        Some("4")
    );
}

#[test]
fn checkpoint_write_rejected_without_revision_surfaces_error() {
    let harness = Harness::empty();
    let path = checkpoint_url_path(Direction::Pull);
    let strategy = Arc::new(Recorder::default());
    let replication = harness.replication(ReplicationConfig::pull(REMOTE).with_continuous(true), &strategy);

    replication.start();
    harness.scheduler.run_until_idle();

    // Nothing is scripted for the PUT, so the remote answers 404.
    replication.set_last_sequence("1");
    harness.scheduler.advance(Duration::from_secs(2));

    let puts = harness.transport.requests_to(Method::Put, &path);
    assert_eq!(puts.len(), 1);
    assert!(puts[0].body.as_ref().unwrap().get("_rev").is_none());
    assert!(replication.last_error().unwrap().is_not_found());

    // The next advance writes again.
    harness
        .transport
        .respond(Method::Put, &path, Ok(json!({"ok": true, "rev": "0-1"})));
    replication.set_last_sequence("2");
    harness.scheduler.advance(Duration::from_secs(2));
    assert_eq!(harness.transport.requests_to(Method::Put, &path).len(), 2);
}

#[test]
fn checkpoint_against_loopback_peer_survives_foreign_writer() {
    init_tracing();
    let peer = Arc::new(LoopbackPeer::new());
    let scheduler = Arc::new(ManualScheduler::new());
    let manager = ReplicationManager::new(
        Arc::clone(&scheduler) as Arc<dyn Scheduler>,
        Arc::new(PeerTransport {
            peer: Arc::clone(&peer),
        }),
    );
    let store: Arc<dyn LocalStore> = Arc::new(MemoryStore::new(IDENTITY));
    let replication = manager
        .replication(
            ReplicationConfig::pull(REMOTE).with_continuous(true),
            &store,
            Arc::new(Recorder::default()),
        )
        .unwrap();
    let id = checkpoint_id(IDENTITY, REMOTE, Direction::Pull);

    replication.start();
    scheduler.run_until_idle();
    replication.set_last_sequence("1");
    scheduler.advance(Duration::from_secs(2));
    assert_eq!(peer.local(&id).unwrap()["lastSequence"], "1");

    // Someone else rewrites the document, invalidating our revision.
    let mut foreign = peer.local(&id).unwrap();
    foreign.remove("_rev");
    peer.delete_local(&id);
    peer.put_local(&id, foreign);

    replication.set_last_sequence("2");
    scheduler.advance(Duration::from_secs(2));

    assert_eq!(peer.local(&id).unwrap()["lastSequence"], "2");
    assert!(replication.last_error().is_none());
}

#[test]
fn login_failure_still_resolves_checkpoint() {
    init_tracing();
    let peer = Arc::new(LoopbackPeer::new().rejecting_logins());
    let scheduler = Arc::new(ManualScheduler::new());
    let manager = ReplicationManager::new(
        Arc::clone(&scheduler) as Arc<dyn Scheduler>,
        Arc::new(PeerTransport {
            peer: Arc::clone(&peer),
        }),
    );
    let assertion = docsync_replicator::testing::encode_assertion(
        "jo@example.com",
        "http://example.com",
        std::time::SystemTime::now() + Duration::from_secs(600),
    );
    let store: Arc<dyn LocalStore> = Arc::new(MemoryStore::new(IDENTITY));
    let strategy = Arc::new(Recorder::default());
    let replication = manager
        .replication(
            ReplicationConfig::pull(format!("{REMOTE}?personaAssertion={assertion}"))
                .with_continuous(true),
            &store,
            Arc::clone(&strategy) as Arc<dyn ReplicationStrategy>,
        )
        .unwrap();

    replication.start();
    scheduler.run_until_idle();

    // Login was rejected, but replication went ahead anyway.
    assert!(replication.last_error().unwrap().is_unauthorized());
    assert_eq!(strategy.begun(), 1);
    assert_eq!(peer.session_user(), None);
}

#[test]
fn successful_login_precedes_checkpoint_resolution() {
    init_tracing();
    let peer = Arc::new(LoopbackPeer::new());
    let scheduler = Arc::new(ManualScheduler::new());
    let manager = ReplicationManager::new(
        Arc::clone(&scheduler) as Arc<dyn Scheduler>,
        Arc::new(PeerTransport {
            peer: Arc::clone(&peer),
        }),
    );
    let store: Arc<dyn LocalStore> = Arc::new(MemoryStore::new(IDENTITY));
    let strategy = Arc::new(Recorder::default());
    let replication = manager
        .replication(
            ReplicationConfig::push(format!(
                "{REMOTE}?facebookAccessToken=secret&email=jo%40example.com"
            ))
            .with_continuous(true),
            &store,
            Arc::clone(&strategy) as Arc<dyn ReplicationStrategy>,
        )
        .unwrap();

    replication.start();
    scheduler.run_until_idle();

    assert_eq!(peer.session_user().as_deref(), Some("user@example.com"));
    assert_eq!(strategy.begun(), 1);
    assert!(replication.last_error().is_none());
}

#[test]
fn session_check_falls_back_exactly_once() {
    let harness = Harness::empty();
    let strategy = Arc::new(Recorder::default());
    let replication = harness
        .manager
        .replication(
            ReplicationConfig::pull(format!(
                "{REMOTE}?facebookAccessToken=secret&email=jo%40example.com"
            ))
            .with_continuous(true),
            &harness.store,
            Arc::clone(&strategy) as Arc<dyn ReplicationStrategy>,
        )
        .unwrap();

    replication.start();
    harness.scheduler.run_until_idle();

    assert_eq!(harness.transport.requests_to(Method::Get, "/_session").len(), 1);
    assert_eq!(harness.transport.requests_to(Method::Get, "/db/_session").len(), 1);
    assert_eq!(harness.transport.requests().len(), 2);
    assert!(replication.last_error().unwrap().is_not_found());
    assert_eq!(strategy.begun(), 1);
}

#[test]
fn database_relative_session_with_active_user_skips_login() {
    init_tracing();
    let peer = Arc::new(
        LoopbackPeer::new()
            .with_db_relative_session()
            .with_session_user("jo@example.com"),
    );
    let scheduler = Arc::new(ManualScheduler::new());
    let manager = ReplicationManager::new(
        Arc::clone(&scheduler) as Arc<dyn Scheduler>,
        Arc::new(PeerTransport {
            peer: Arc::clone(&peer),
        }),
    );
    let store: Arc<dyn LocalStore> = Arc::new(MemoryStore::new(IDENTITY));
    let strategy = Arc::new(Recorder::default());
    let replication = manager
        .replication(
            ReplicationConfig::pull(format!(
                "{REMOTE}?facebookAccessToken=secret&email=jo%40example.com"
            ))
            .with_continuous(true),
            &store,
            Arc::clone(&strategy) as Arc<dyn ReplicationStrategy>,
        )
        .unwrap();

    replication.start();
    scheduler.run_until_idle();

    // Root strategy (404) and database strategy; no login.
    assert_eq!(peer.request_count(), 2);
    assert_eq!(strategy.begun(), 1);
    assert!(replication.last_error().is_none());
}

#[test]
fn session_labels_are_unique_under_concurrent_starts() {
    let harness = Harness::empty();
    let strategy = Arc::new(Recorder::default());
    let replications: Vec<Replication> = (0..16)
        .map(|_| harness.replication(ReplicationConfig::pull(REMOTE).with_continuous(true), &strategy))
        .collect();

    let handles: Vec<_> = replications
        .iter()
        .cloned()
        .map(|replication| thread::spawn(move || replication.start()))
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let labels: HashSet<String> = replications
        .iter()
        .map(|r| r.session_id().unwrap())
        .collect();
    assert_eq!(labels.len(), 16);
    assert!(labels.iter().all(|label| label.starts_with("repl")));
}

#[test]
fn stopped_resets_counters_and_error() {
    let harness = Harness::empty();
    let strategy = Arc::new(Recorder::default());
    let replication = harness.replication(ReplicationConfig::pull(REMOTE).with_continuous(true), &strategy);

    replication.start();
    harness.scheduler.run_until_idle();
    replication.set_changes_count(10);
    replication.set_completed_changes_count(4);
    replication.set_last_error(Some(ReplicationError::http(500, "boom")));
    let stops = stop_counter(&replication);

    replication.stop();

    assert_eq!(replication.status(), ReplicationStatus::Stopped);
    assert_eq!(replication.changes_count(), 0);
    assert_eq!(replication.completed_changes_count(), 0);
    assert!(replication.last_error().is_none());
    assert_eq!(stops.load(Ordering::SeqCst), 1);
}

#[test]
fn restart_assigns_a_new_session() {
    let harness = Harness::empty();
    let strategy = Arc::new(Recorder::default());
    let replication = harness.replication(ReplicationConfig::pull(REMOTE).with_continuous(true), &strategy);

    replication.start();
    harness.scheduler.run_until_idle();
    let first = replication.session_id();

    replication.restart();
    harness.scheduler.run_until_idle();

    assert!(replication.is_running());
    assert_ne!(replication.session_id(), first);
    assert_eq!(strategy.begun(), 2);
}

#[test]
fn continuous_session_retries_after_errors() {
    let harness = Harness::empty();
    let strategy = Arc::new(Recorder::default());
    let config = ReplicationConfig::pull(REMOTE)
        .with_continuous(true)
        .with_retry_delay(Duration::from_secs(10));
    let replication = harness.replication(config, &strategy);

    replication.start();
    harness.scheduler.run_until_idle();

    replication.send_request(Method::Get, "_changes", None, |r, result| {
        if let Err(err) = result {
            r.revision_failed();
            r.set_last_error(Some(err));
        }
    });
    harness.scheduler.run_until_idle();
    assert_eq!(replication.status(), ReplicationStatus::Idle);
    assert_eq!(replication.revisions_failed(), 1);

    harness.scheduler.advance(Duration::from_secs(9));
    assert_eq!(strategy.retries.load(Ordering::SeqCst), 0);

    harness.scheduler.advance(Duration::from_secs(1));
    assert_eq!(strategy.retries.load(Ordering::SeqCst), 1);
    assert!(replication.last_error().is_none());
    assert_eq!(replication.revisions_failed(), 0);
}

#[test]
fn retry_waits_while_offline() {
    let harness = Harness::empty();
    let strategy = Arc::new(Recorder::default());
    let config = ReplicationConfig::pull(REMOTE)
        .with_continuous(true)
        .with_retry_delay(Duration::from_secs(10));
    let replication = harness.replication(config, &strategy);

    replication.start();
    harness.scheduler.run_until_idle();
    replication.send_request(Method::Get, "_changes", None, |r, result| {
        r.set_last_error(result.err());
    });
    harness.scheduler.run_until_idle();

    replication.go_offline();
    harness.scheduler.advance(Duration::from_secs(10));
    assert_eq!(strategy.retries.load(Ordering::SeqCst), 0);
    assert_eq!(replication.status(), ReplicationStatus::Offline);

    replication.go_online();
    harness.scheduler.advance(Duration::from_secs(10));
    assert_eq!(strategy.retries.load(Ordering::SeqCst), 1);
}

#[test]
fn stop_cancels_pending_retry() {
    let harness = Harness::empty();
    let strategy = Arc::new(Recorder::default());
    let config = ReplicationConfig::pull(REMOTE)
        .with_continuous(true)
        .with_retry_delay(Duration::from_secs(10));
    let replication = harness.replication(config, &strategy);

    replication.start();
    harness.scheduler.run_until_idle();
    replication.send_request(Method::Get, "_changes", None, |r, result| {
        r.set_last_error(result.err());
    });
    harness.scheduler.run_until_idle();

    replication.stop();
    harness.scheduler.advance(Duration::from_secs(60));
    assert_eq!(strategy.retries.load(Ordering::SeqCst), 0);
    assert!(!replication.is_running());
}

#[test]
fn stop_flushes_queued_revisions() {
    let harness = Harness::empty();
    let strategy = Arc::new(Recorder::default());
    let replication = harness.replication(ReplicationConfig::pull(REMOTE).with_continuous(true), &strategy);

    replication.start();
    harness.scheduler.run_until_idle();
    for revision in revisions(4) {
        replication.add_to_inbox(revision);
    }
    assert_eq!(replication.inbox_count(), 4);

    replication.stop();

    let batches = strategy.batches.lock();
    assert_eq!(batches.iter().map(Vec::len).sum::<usize>(), 4);
    assert_eq!(replication.inbox_count(), 0);
}

#[test]
fn database_closing_discards_inbox_and_saves_checkpoint() {
    let harness = Harness::empty();
    let path = checkpoint_url_path(Direction::Pull);
    harness
        .transport
        .respond(Method::Put, &path, Ok(json!({"ok": true, "rev": "0-1"})));
    let strategy = Arc::new(Recorder::default());
    let replication = harness.replication(ReplicationConfig::pull(REMOTE).with_continuous(true), &strategy);

    replication.start();
    harness.scheduler.run_until_idle();
    replication.set_last_sequence("4");
    for revision in revisions(3) {
        replication.add_to_inbox(revision);
    }

    replication.database_closing();
    assert_eq!(
        harness.store.last_sequence(REMOTE, Direction::Pull).as_deref(),
        Some("4")
    );

    harness.scheduler.advance(Duration::from_secs(2));
    assert!(strategy.batches.lock().is_empty());
    assert!(!replication.is_running());
    assert_eq!(harness.transport.requests_to(Method::Put, &path).len(), 1);
}

#[test]
fn unreachable_remote_reads_as_offline() {
    let harness =
        Harness::new(MemoryStore::new(IDENTITY).with_sequence(REMOTE, Direction::Pull, "5"));
    harness.transport.set_unreachable(true);
    let strategy = Arc::new(Recorder::default());
    let replication = harness.replication(ReplicationConfig::pull(REMOTE).with_continuous(true), &strategy);

    replication.start();
    harness.scheduler.run_until_idle();

    assert!(replication.last_error().unwrap().is_connectivity());
    assert_eq!(replication.status(), ReplicationStatus::Offline);
    assert_eq!(strategy.begun(), 1);
}

#[test]
fn threaded_replication_end_to_end() {
    init_tracing();
    let peer = Arc::new(LoopbackPeer::new());
    let scheduler = Arc::new(ThreadScheduler::new("docsync-test").unwrap());
    let transport = ThreadedTransport::new(Arc::clone(&peer)).unwrap();
    let manager = ReplicationManager::new(scheduler, Arc::new(transport));
    let store: Arc<dyn LocalStore> = Arc::new(MemoryStore::new(IDENTITY));
    let strategy = Arc::new(Recorder::feeding(revisions(3)));
    let config = ReplicationConfig::pull(REMOTE)
        .with_processor_delay(Duration::from_millis(10))
        .with_checkpoint_save_delay(Duration::from_millis(10));
    let replication = manager
        .replication(config, &store, Arc::clone(&strategy) as Arc<dyn ReplicationStrategy>)
        .unwrap();

    let (tx, rx) = mpsc::channel();
    replication.add_change_listener(move |r| {
        if r.status() == ReplicationStatus::Stopped {
            let _ = tx.send(());
        }
    });

    replication.start();
    rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let id = checkpoint_id(IDENTITY, REMOTE, Direction::Pull);
    assert_eq!(peer.local(&id).unwrap()["lastSequence"], "3");
    assert_eq!(store.last_sequence(REMOTE, Direction::Pull).as_deref(), Some("3"));
    assert_eq!(strategy.batches.lock().concat().len(), 3);
}
