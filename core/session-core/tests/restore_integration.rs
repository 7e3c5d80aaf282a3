//! End-to-end restore flow against a real SQLite store.

use session_core::{
    ConnectionState, NotRestoredReason, RestoreOutcome, SessionResolver, SessionStore,
    SqliteStore, StoreHealthMonitor, StoreUri,
};
use std::sync::Arc;
use std::thread;
use tempfile::TempDir;

struct Harness {
    _dir: TempDir,
    uri: String,
    store: Arc<SqliteStore>,
    monitor: Arc<StoreHealthMonitor>,
    resolver: SessionResolver,
}

fn harness() -> Harness {
    let dir = TempDir::new().expect("temp dir");
    let uri = StoreUri::File(dir.path().join("sessions.db")).to_string();
    let store = Arc::new(SqliteStore::new());
    let monitor = Arc::new(StoreHealthMonitor::new(store.clone()));
    let resolver = SessionResolver::new(Arc::clone(&monitor), store.clone());
    Harness {
        _dir: dir,
        uri,
        store,
        monitor,
        resolver,
    }
}

#[test]
fn alice_with_stored_token_is_restored() {
    let h = harness();
    assert!(h.monitor.connect(&h.uri));
    h.store.save_session("alice", "tok123").expect("save");

    assert_eq!(
        h.resolver.resolve(Some("alice")),
        RestoreOutcome::Restored {
            identity_key: "alice".to_string()
        }
    );
    let annotation = h.resolver.auto_restore(Some("alice"));
    assert!(annotation.session_restored());
    assert_eq!(annotation.identity_key(), Some("alice"));
}

#[test]
fn whitespace_in_identity_is_significant() {
    let h = harness();
    assert!(h.monitor.connect(&h.uri));
    h.store.save_session("alice ", "tok123").expect("save alice");
    h.store.save_session("bob", "tok456").expect("save bob");

    let annotation = h.resolver.auto_restore(Some("alice "));
    assert!(annotation.session_restored());
    assert_eq!(annotation.identity_key(), Some("alice "));

    assert_eq!(
        h.resolver.resolve(Some(" bob")).reason(),
        Some(NotRestoredReason::NotFound)
    );
    assert!(h.resolver.resolve(Some("bob")).restored());
}

#[test]
fn oversized_ttl_never_expires() {
    let dir = TempDir::new().expect("temp dir");
    let uri = StoreUri::File(dir.path().join("sessions.db")).to_string();
    let ttl = chrono::Duration::try_seconds(10_000_000_000_000).expect("ttl in range");
    let store = Arc::new(SqliteStore::with_ttl(Some(ttl)));
    let monitor = Arc::new(StoreHealthMonitor::new(store.clone()));
    let resolver = SessionResolver::new(Arc::clone(&monitor), store.clone());
    assert!(monitor.connect(&uri));
    store.save_session("alice", "tok123").expect("save");

    assert!(resolver.resolve(Some("alice")).restored());
    assert_eq!(store.prune_expired().expect("prune"), 0);
    assert!(resolver.resolve(Some("alice")).restored());
}

#[test]
fn empty_identity_is_not_restored() {
    let h = harness();
    assert!(h.monitor.connect(&h.uri));
    assert_eq!(
        h.resolver.resolve(Some("")),
        RestoreOutcome::NotRestored { reason: None }
    );
}

#[test]
fn unknown_identity_is_not_found() {
    let h = harness();
    assert!(h.monitor.connect(&h.uri));
    h.store.save_session("alice", "tok123").expect("save");

    let outcome = h.resolver.resolve(Some("mallory"));
    assert_eq!(outcome.reason(), Some(NotRestoredReason::NotFound));
    assert!(!h.resolver.auto_restore(Some("mallory")).session_restored());
}

#[test]
fn bob_is_not_restored_after_store_goes_away() {
    let h = harness();
    assert!(h.monitor.connect(&h.uri));
    h.store.save_session("bob", "tok456").expect("save");
    assert!(h.resolver.resolve(Some("bob")).restored());

    let db_path = StoreUri::parse(&h.uri)
        .expect("parse uri")
        .path()
        .expect("file uri")
        .to_path_buf();
    std::fs::remove_file(&db_path).expect("remove database");

    assert_eq!(h.monitor.probe(), ConnectionState::Disconnected);
    assert_eq!(
        h.resolver.resolve(Some("bob")).reason(),
        Some(NotRestoredReason::StoreUnavailable)
    );
}

#[test]
fn reconnects_after_loss_and_restores_again() {
    let h = harness();
    assert!(h.monitor.connect(&h.uri));
    h.monitor.report_connection_lost("simulated network loss");
    assert!(!h.monitor.is_healthy());

    assert_eq!(h.monitor.probe(), ConnectionState::Connected);
    h.store.save_session("carol", "tok789").expect("save");
    assert!(h.resolver.resolve(Some("carol")).restored());
}

#[test]
fn failed_connect_leaves_resolver_fail_open() {
    let h = harness();
    assert!(!h.monitor.connect("postgres://db.internal/bot"));
    assert_eq!(h.monitor.current_state(), ConnectionState::Disconnected);
    assert_eq!(
        h.resolver.resolve(Some("alice")).reason(),
        Some(NotRestoredReason::StoreUnavailable)
    );
}

#[test]
fn concurrent_resolution_is_consistent() {
    let h = harness();
    assert!(h.monitor.connect(&h.uri));
    h.store.save_session("alice", "tok123").expect("save");

    let resolver = Arc::new(h.resolver);
    let handles: Vec<_> = (0..8)
        .map(|i| {
            let resolver = Arc::clone(&resolver);
            thread::spawn(move || {
                let key = if i % 2 == 0 { "alice" } else { "bob" };
                (key, resolver.resolve(Some(key)))
            })
        })
        .collect();

    for handle in handles {
        let (key, outcome) = handle.join().expect("resolver thread");
        assert_eq!(outcome.restored(), key == "alice");
    }

    let stats = resolver.stats();
    assert_eq!(stats.restored, 4);
    assert_eq!(stats.not_found, 4);
}

#[test]
fn disconnect_releases_store_handle() {
    let h = harness();
    assert!(h.monitor.connect(&h.uri));
    h.monitor.disconnect();
    h.monitor.disconnect();

    assert_eq!(h.monitor.current_state(), ConnectionState::Disconnected);
    assert!(h.store.ping().is_err());
}
