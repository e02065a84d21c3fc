//! Integration tests for full sync sessions.

use proptest::prelude::*;
use parking_lot::Mutex;
use rowsync_engine::{
    rows_for_table, run_in_transaction, ConflictAction, ConflictingSetupAction, HttpTransport,
    InProcessTransport,
    Interceptors, LoopbackClient, RemoteOrchestrator, RetryConfig, RowApplyingAction, ScopeStore,
    StoreError, StoreErrorKind, SyncAgent, SyncError, SyncOptions, SyncProvider, SyncResult,
    SyncSide, SyncStage, SyncState, SyncTransport,
};
use rowsync_memory::{MemoryProvider, CODE_BUSY, CODE_ERROR};
use rowsync_protocol::{
    BatchInfo, ClientScope, ConflictResolutionPolicy, RowState, SessionContext, SetupTable,
    SyncRow, SyncSetup, SyncType, SyncValue,
};
use rowsync_server::{ServerConfig, SyncServer};
use rowsync_testkit::{
    apply_ops, assert_same_rows, category_row, customer_row, policy_strategy, product_row,
    row_ops_strategy, sample_server_db, sample_setup, seed_sample_rows, InProcessAgent, TestClient,
    TestEnv, SCOPE,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use uuid::Uuid;

const TABLES: [&str; 3] = ["customer", "product", "product_category"];

fn ctx(sync_type: SyncType) -> SessionContext {
    SessionContext::new(SCOPE, Uuid::new_v4(), sync_type)
}

fn provision_server(env: &TestEnv) {
    env.server()
        .ensure_scope(&ctx(SyncType::Normal), Some(&sample_setup()), None)
        .unwrap();
}

/// An environment where "alice" already holds the seeded rows.
fn synced_client(policy: ConflictResolutionPolicy) -> (TestEnv, TestClient) {
    let env = TestEnv::with_server_options(|o| o.with_conflict_resolution_policy(policy));
    seed_sample_rows(env.server_db()).unwrap();
    let client = env.client("alice");
    client.agent.synchronize(SyncType::Normal).unwrap();
    (env, client)
}

fn customer_name(db: &MemoryProvider, id: i64) -> Option<SyncValue> {
    db.row("customer", &[SyncValue::Integer(id)])
        .unwrap()
        .map(|row| row[1].clone())
}

/// A server with hooks, outside of [`TestEnv`].
fn server_with(
    dir: &TempDir,
    interceptors: Interceptors,
    policy: ConflictResolutionPolicy,
) -> (MemoryProvider, Arc<RemoteOrchestrator<MemoryProvider>>) {
    let db = sample_server_db("server");
    let options = SyncOptions::new(dir.path().join("server")).with_conflict_resolution_policy(policy);
    let server = RemoteOrchestrator::new(db.clone(), options)
        .unwrap()
        .with_interceptors(interceptors);
    (db, Arc::new(server))
}

/// A server deployment over an existing database, serving `setup` and
/// answering a setup change with `decision`.
fn serving(
    dir: &TempDir,
    db: &MemoryProvider,
    setup: SyncSetup,
    decision: ConflictingSetupAction,
) -> Arc<RemoteOrchestrator<MemoryProvider>> {
    let server = RemoteOrchestrator::new(db.clone(), SyncOptions::new(dir.path().join("server")))
        .unwrap()
        .with_setup(SCOPE, setup)
        .with_interceptors(Interceptors::new().with_conflicting_setup(move |_| decision));
    Arc::new(server)
}

/// An agent over an existing client database, proposing no setup.
fn reconnect(
    dir: &TempDir,
    name: &str,
    db: &MemoryProvider,
    server: &Arc<RemoteOrchestrator<MemoryProvider>>,
) -> InProcessAgent {
    SyncAgent::new(
        db.clone(),
        InProcessTransport::new(Arc::clone(server)),
        SyncOptions::new(dir.path().join(name)),
        SCOPE,
    )
}

fn tracking_tables(db: &MemoryProvider) -> Vec<String> {
    db.summary().tracking.into_iter().map(|(name, _, _)| name).collect()
}

fn client_of(
    dir: &TempDir,
    server: &Arc<RemoteOrchestrator<MemoryProvider>>,
    name: &str,
) -> (MemoryProvider, InProcessAgent) {
    let db = MemoryProvider::new(name);
    let agent = SyncAgent::new(
        db.clone(),
        InProcessTransport::new(Arc::clone(server)),
        SyncOptions::new(dir.path().join(name)),
        SCOPE,
    )
    .with_setup(sample_setup());
    (db, agent)
}

fn read_rows(batch: &BatchInfo, table: &str) -> Vec<SyncRow> {
    rows_for_table(batch, table)
        .unwrap()
        .collect::<SyncResult<_>>()
        .unwrap()
}

#[test]
fn fresh_client_receives_every_row() {
    let env = TestEnv::new();
    for (id, name) in [(1, "Ann"), (2, "Bea"), (3, "Cid")] {
        env.server_db().upsert("customer", customer_row(id, name)).unwrap();
    }
    provision_server(&env);

    let client_scope = ClientScope::new(SCOPE);
    let first = env
        .server()
        .apply_then_get_changes(&ctx(SyncType::Normal), &client_scope, None, None)
        .unwrap();
    let selected = first.changes_selected.table("customer").unwrap();
    assert_eq!(selected.upserts, 3);
    assert_eq!(selected.deletes, 0);
    assert_eq!(first.batch.rows_count, 3);
    let first_rows = read_rows(&first.batch, "customer");

    // Nothing was written in between: same rows, same count.
    let second = env
        .server()
        .apply_then_get_changes(&ctx(SyncType::Normal), &client_scope, None, None)
        .unwrap();
    assert_eq!(second.batch.rows_count, first.batch.rows_count);
    assert_eq!(read_rows(&second.batch, "customer"), first_rows);
}

#[test]
fn client_delete_reaches_server() {
    let (env, alice) = synced_client(ConflictResolutionPolicy::ServerWins);
    assert!(alice.db.delete("customer", &[SyncValue::Integer(1)]).unwrap());

    let summary = alice.agent.synchronize(SyncType::Normal).unwrap();
    let deleted = summary
        .server_changes_applied
        .table("customer", RowState::Deleted)
        .unwrap();
    assert_eq!(deleted.applied, 1);
    assert_eq!(summary.client_changes_selected.total_deletes(), 1);
    assert!(customer_name(env.server_db(), 1).is_none());
}

#[test]
fn small_threshold_splits_the_download() {
    let env = TestEnv::with_server_options(|o| o.with_batch_size_kb(1));
    for id in 1..=200 {
        env.server_db()
            .upsert("customer", customer_row(id, &format!("Customer{id}")))
            .unwrap();
    }
    provision_server(&env);

    let changes = env
        .server()
        .apply_then_get_changes(&ctx(SyncType::Normal), &ClientScope::new(SCOPE), None, None)
        .unwrap();
    let batch = &changes.batch;
    assert!(batch.parts.len() > 1);
    assert!(batch.is_consistent());
    for part in batch.parts.iter().filter(|p| !p.is_last_batch) {
        let size = std::fs::metadata(batch.part_path(part)).unwrap().len();
        assert!(size <= 1024, "part {} is {size} bytes", part.file_name);
    }

    let alice = env.client("alice");
    let summary = alice.agent.synchronize(SyncType::Normal).unwrap();
    assert_eq!(summary.total_changes_downloaded(), 200);
    assert_same_rows(env.server_db(), &alice.db, "customer");
}

#[test]
fn client_cleanup_records_its_floor() {
    let (_env, alice) = synced_client(ConflictResolutionPolicy::ServerWins);
    alice.db.delete("customer", &[SyncValue::Integer(1)]).unwrap();
    alice.agent.synchronize(SyncType::Normal).unwrap();
    alice.db.upsert("customer", customer_row(3, "Cal")).unwrap();
    alice.agent.synchronize(SyncType::Normal).unwrap();

    let local = alice.agent.local();
    let scope = local.ensure_scope(None).unwrap();
    let cleaned = local.delete_metadata(&scope, None).unwrap();
    assert_eq!(cleaned.timestamp, scope.last_sync_timestamp);

    let reloaded = local.ensure_scope(None).unwrap();
    assert_eq!(reloaded.last_cleanup_timestamp, cleaned.timestamp);
    assert!(reloaded.last_cleanup_timestamp > 0);
}

#[test]
fn cleanup_floor_is_the_oldest_client() {
    let env = TestEnv::new();
    provision_server(&env);
    let db = env.server_db();
    for id in [10, 11, 12] {
        db.upsert("customer", customer_row(id, "Gone")).unwrap();
    }

    db.advance_timestamp(98).unwrap();
    db.delete("customer", &[SyncValue::Integer(10)]).unwrap();
    db.delete("customer", &[SyncValue::Integer(11)]).unwrap();
    assert_eq!(db.timestamp(), 100);
    env.client("alice").agent.synchronize(SyncType::Normal).unwrap();

    db.advance_timestamp(199).unwrap();
    db.delete("customer", &[SyncValue::Integer(12)]).unwrap();
    db.advance_timestamp(250).unwrap();
    env.client("bob").agent.synchronize(SyncType::Normal).unwrap();

    let cleaned = env.server().delete_metadata(SCOPE, None).unwrap();
    assert_eq!(cleaned.timestamp, 100);
    assert_eq!(cleaned.rows_cleaned(), 1);

    let mut remaining: Vec<u64> = db
        .tracking_rows("customer_tracking")
        .unwrap()
        .iter()
        .filter(|t| t.is_tombstone)
        .map(|t| t.update_timestamp)
        .collect();
    remaining.sort_unstable();
    assert_eq!(remaining, vec![100, 200]);

    let scope = env.server().load_server_scope(SCOPE, None).unwrap().unwrap();
    assert_eq!(scope.last_cleanup_timestamp, 100);
}

#[test]
fn server_wins_on_both_sides() {
    let (env, alice) = synced_client(ConflictResolutionPolicy::ServerWins);
    env.server_db().upsert("customer", customer_row(1, "Server")).unwrap();
    alice.db.upsert("customer", customer_row(1, "Client")).unwrap();

    let summary = alice.agent.synchronize(SyncType::Normal).unwrap();
    assert_eq!(summary.total_changes_uploaded(), 0);
    assert_eq!(summary.server_changes_applied.total_resolved_conflicts(), 1);
    assert_eq!(summary.client_changes_applied.total_resolved_conflicts(), 0);
    assert_eq!(summary.total_changes_downloaded(), 1);
    assert_eq!(customer_name(env.server_db(), 1), Some("Server".into()));
    assert_same_rows(env.server_db(), &alice.db, "customer");
}

#[test]
fn client_wins_on_both_sides() {
    let (env, alice) = synced_client(ConflictResolutionPolicy::ClientWins);
    env.server_db().upsert("customer", customer_row(1, "Server")).unwrap();
    alice.db.upsert("customer", customer_row(1, "Client")).unwrap();

    let summary = alice.agent.synchronize(SyncType::Normal).unwrap();
    assert_eq!(summary.total_changes_uploaded(), 1);
    assert_eq!(summary.total_changes_downloaded(), 0);
    assert_eq!(summary.total_resolved_conflicts(), 1);
    assert_eq!(customer_name(env.server_db(), 1), Some("Client".into()));
    assert_same_rows(env.server_db(), &alice.db, "customer");
}

#[test]
fn merged_row_is_sent_back() {
    for policy in [
        ConflictResolutionPolicy::ServerWins,
        ConflictResolutionPolicy::ClientWins,
    ] {
        let dir = TempDir::new().unwrap();
        let hooks = Interceptors::new().with_conflict(|conflict, side| {
            assert_eq!(side, SyncSide::Server);
            let mut merged = conflict.remote_row.clone();
            merged.values[1] = "Merged".into();
            ConflictAction::MergeRow(merged)
        });
        let (server_db, server) = server_with(&dir, hooks, policy);
        server_db.upsert("customer", customer_row(1, "Ann")).unwrap();
        let (alice_db, alice) = client_of(&dir, &server, "alice");
        alice.synchronize(SyncType::Normal).unwrap();

        server_db.upsert("customer", customer_row(1, "Server")).unwrap();
        alice_db.upsert("customer", customer_row(1, "Client")).unwrap();
        let summary = alice.synchronize(SyncType::Normal).unwrap();
        assert_eq!(summary.client_changes_applied.total_resolved_conflicts(), 0);

        assert_eq!(customer_name(&server_db, 1), Some("Merged".into()), "{policy:?}");
        assert_eq!(customer_name(&alice_db, 1), Some("Merged".into()), "{policy:?}");
        assert_same_rows(&server_db, &alice_db, "customer");

        let summary = alice.synchronize(SyncType::Normal).unwrap();
        assert_eq!(summary.total_changes_uploaded(), 0);
        assert_eq!(summary.total_changes_downloaded(), 0);
    }
}

#[test]
fn local_write_after_upload_still_conflicts() {
    let dir = TempDir::new().unwrap();
    let alice_db = MemoryProvider::new("alice");
    let armed = Arc::new(AtomicBool::new(false));
    let hooks = Interceptors::new().with_progress({
        let armed = Arc::clone(&armed);
        let alice_db = alice_db.clone();
        move |args| {
            if args.stage == SyncStage::ChangesSelecting && armed.swap(false, Ordering::SeqCst) {
                alice_db.upsert("customer", customer_row(1, "Late")).unwrap();
            }
        }
    });
    let (server_db, server) = server_with(&dir, hooks, ConflictResolutionPolicy::ServerWins);
    server_db.upsert("customer", customer_row(1, "Ann")).unwrap();
    let alice = reconnect(&dir, "alice", &alice_db, &server).with_setup(sample_setup());
    alice.synchronize(SyncType::Normal).unwrap();

    server_db.upsert("customer", customer_row(1, "Server")).unwrap();
    armed.store(true, Ordering::SeqCst);
    let summary = alice.synchronize(SyncType::Normal).unwrap();

    assert_eq!(summary.client_changes_applied.total_resolved_conflicts(), 1);
    assert_eq!(customer_name(&alice_db, 1), Some("Server".into()));
    assert_same_rows(&server_db, &alice_db, "customer");
}

#[test]
fn remote_delete_wins_over_server_update() {
    let (env, alice) = synced_client(ConflictResolutionPolicy::ServerWins);
    env.server_db().upsert("customer", customer_row(1, "Server")).unwrap();
    alice.db.delete("customer", &[SyncValue::Integer(1)]).unwrap();

    let summary = alice.agent.synchronize(SyncType::Normal).unwrap();
    assert_eq!(summary.server_changes_applied.total_resolved_conflicts(), 1);
    assert!(customer_name(env.server_db(), 1).is_none());
    assert!(customer_name(&alice.db, 1).is_none());
}

#[test]
fn local_delete_wins_over_client_update() {
    let (env, alice) = synced_client(ConflictResolutionPolicy::ClientWins);
    env.server_db().delete("customer", &[SyncValue::Integer(1)]).unwrap();
    alice.db.upsert("customer", customer_row(1, "Client")).unwrap();

    let summary = alice.agent.synchronize(SyncType::Normal).unwrap();
    assert_eq!(summary.total_changes_uploaded(), 0);
    assert_eq!(summary.server_changes_applied.total_resolved_conflicts(), 1);
    assert_eq!(summary.client_changes_selected.total_upserts(), 1);
    assert_eq!(summary.total_resolved_conflicts(), 1);
    assert!(customer_name(env.server_db(), 1).is_none());
    assert!(customer_name(&alice.db, 1).is_none());
}

#[test]
fn applied_rows_are_not_echoed() {
    let (env, alice) = synced_client(ConflictResolutionPolicy::ServerWins);
    let bob = env.client("bob");
    bob.agent.synchronize(SyncType::Normal).unwrap();

    alice.db.upsert("customer", customer_row(2, "Bea")).unwrap();
    let summary = alice.agent.synchronize(SyncType::Normal).unwrap();
    assert_eq!(summary.total_changes_uploaded(), 1);
    assert_eq!(summary.total_changes_downloaded(), 0);

    let alice_id = alice.agent.local().ensure_scope(None).unwrap().id;
    let tracking = env.server_db().tracking_rows("customer_tracking").unwrap();
    let bea = tracking
        .iter()
        .find(|t| t.primary_key == vec![SyncValue::Integer(2)])
        .unwrap();
    assert_eq!(bea.update_scope_id, Some(alice_id));

    let summary = bob.agent.synchronize(SyncType::Normal).unwrap();
    assert_eq!(summary.total_changes_downloaded(), 1);

    for agent in [&alice.agent, &bob.agent] {
        let summary = agent.synchronize(SyncType::Normal).unwrap();
        assert_eq!(summary.total_changes_uploaded(), 0);
        assert_eq!(summary.total_changes_downloaded(), 0);
    }
    for table in TABLES {
        assert_same_rows(&alice.db, &bob.db, table);
    }
}

#[test]
fn timestamps_never_decrease() {
    let (env, alice) = synced_client(ConflictResolutionPolicy::ServerWins);
    let mut last = alice.agent.local().ensure_scope(None).unwrap();

    for round in 0..4i64 {
        if round % 2 == 0 {
            alice.db.upsert("customer", customer_row(10 + round, "Local")).unwrap();
        } else {
            env.server_db()
                .upsert("customer", customer_row(20 + round, "Remote"))
                .unwrap();
        }
        let sync_type = if round == 3 {
            SyncType::Reinitialize
        } else {
            SyncType::Normal
        };
        alice.agent.synchronize(sync_type).unwrap();

        let scope = alice.agent.local().ensure_scope(None).unwrap();
        assert!(scope.last_sync_timestamp >= last.last_sync_timestamp);
        assert!(scope.last_server_sync_timestamp >= last.last_server_sync_timestamp);
        assert!(!scope.is_new_scope);
        last = scope;
    }
}

#[test]
fn new_client_starts_from_snapshot() {
    let env = TestEnv::new();
    seed_sample_rows(env.server_db()).unwrap();
    provision_server(&env);
    let snapshot = env.server().create_snapshot(SCOPE, None).unwrap();
    assert_eq!(snapshot.rows_count, 3);

    env.server_db().upsert("customer", customer_row(2, "Bea")).unwrap();

    let alice = env.client("alice");
    let summary = alice.agent.synchronize(SyncType::Normal).unwrap();
    assert_eq!(summary.snapshot_applied.as_ref().unwrap().total_applied(), 3);
    assert_eq!(summary.client_changes_applied.total_applied(), 1);
    for table in TABLES {
        assert_same_rows(env.server_db(), &alice.db, table);
    }

    let scope = alice.agent.local().ensure_scope(None).unwrap();
    assert!(!scope.is_new_scope);
    assert!(scope.last_server_sync_timestamp > snapshot.timestamp);
}

#[test]
fn deletes_after_snapshot_reach_new_client() {
    let env = TestEnv::new();
    seed_sample_rows(env.server_db()).unwrap();
    env.server_db().upsert("customer", customer_row(2, "Bea")).unwrap();
    provision_server(&env);
    let snapshot = env.server().create_snapshot(SCOPE, None).unwrap();
    assert_eq!(snapshot.rows_count, 4);

    env.server_db().delete("customer", &[SyncValue::Integer(1)]).unwrap();

    let alice = env.client("alice");
    let summary = alice.agent.synchronize(SyncType::Normal).unwrap();
    assert_eq!(summary.snapshot_applied.as_ref().unwrap().total_applied(), 4);
    assert_eq!(summary.server_changes_selected.total_deletes(), 1);
    assert!(customer_name(&alice.db, 1).is_none());
    assert_eq!(customer_name(&alice.db, 2), Some("Bea".into()));

    let summary = alice.agent.synchronize(SyncType::Normal).unwrap();
    assert_eq!(summary.total_changes_downloaded(), 0);
    for table in TABLES {
        assert_same_rows(env.server_db(), &alice.db, table);
    }
}

#[test]
fn reinitialize_discards_local_rows() {
    let (env, alice) = synced_client(ConflictResolutionPolicy::ServerWins);
    alice.db.upsert("customer", customer_row(99, "Local")).unwrap();
    env.server_db().upsert("customer", customer_row(2, "Bea")).unwrap();

    let summary = alice.agent.synchronize(SyncType::Reinitialize).unwrap();
    assert_eq!(summary.total_changes_uploaded(), 0);
    assert_eq!(summary.total_changes_downloaded(), 4);
    assert!(customer_name(&alice.db, 99).is_none());
    for table in TABLES {
        assert_same_rows(env.server_db(), &alice.db, table);
    }
}

#[test]
fn reinitialize_with_upload_keeps_local_rows() {
    let (env, alice) = synced_client(ConflictResolutionPolicy::ServerWins);
    alice.db.upsert("customer", customer_row(100, "Local")).unwrap();

    let summary = alice
        .agent
        .synchronize(SyncType::ReinitializeWithUpload)
        .unwrap();
    assert_eq!(summary.total_changes_uploaded(), 1);
    assert_eq!(customer_name(env.server_db(), 100), Some("Local".into()));
    for table in TABLES {
        assert_same_rows(env.server_db(), &alice.db, table);
    }
}

#[test]
fn mixed_transports_converge() {
    let env = TestEnv::new();
    seed_sample_rows(env.server_db()).unwrap();
    let server = Arc::new(SyncServer::with_orchestrator(
        ServerConfig::default(),
        Arc::clone(env.server()),
    ));

    let alice = env.client("alice");
    let bob_db = MemoryProvider::new("bob");
    let bob = SyncAgent::new(
        bob_db.clone(),
        HttpTransport::new(
            "http://localhost:8080",
            LoopbackClient::new(Arc::clone(&server)),
            env.client_batch_directory("bob"),
        ),
        env.client_options("bob"),
        SCOPE,
    );

    alice.agent.synchronize(SyncType::Normal).unwrap();
    alice.db.upsert("customer", customer_row(2, "Bea")).unwrap();
    alice.agent.synchronize(SyncType::Normal).unwrap();

    // Bob proposes no setup and adopts the server's.
    let summary = bob.synchronize(SyncType::Normal).unwrap();
    assert_eq!(summary.total_changes_downloaded(), 4);

    bob_db.upsert("customer", customer_row(3, "Cid")).unwrap();
    bob.synchronize(SyncType::Normal).unwrap();
    let summary = alice.agent.synchronize(SyncType::Normal).unwrap();
    assert_eq!(summary.total_changes_downloaded(), 1);

    for table in TABLES {
        assert_same_rows(&alice.db, &bob_db, table);
        assert_same_rows(env.server_db(), &bob_db, table);
    }
    assert_eq!(server.session_count(), 0);
}

#[test]
fn cancelled_session_is_not_retried() {
    let env = TestEnv::new();
    seed_sample_rows(env.server_db()).unwrap();
    let TestClient { db, agent } = env.client_with("alice", |o| {
        o.with_retry(RetryConfig::new(3).with_initial_delay(Duration::from_millis(1)))
    });

    let token = agent.local().base().cancellation_token().clone();
    let armed = Arc::new(AtomicBool::new(true));
    let agent = agent.with_interceptors(Interceptors::new().with_progress({
        let armed = Arc::clone(&armed);
        move |args| {
            if args.stage == SyncStage::BeginSession && armed.swap(false, Ordering::SeqCst) {
                token.cancel();
            }
        }
    }));

    let err = agent.synchronize_with_retry(SyncType::Normal).unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(agent.state(), SyncState::Error);
    assert_eq!(agent.stats().retries, 0);
    assert_eq!(agent.stats().sessions_failed, 1);
    assert!(db.summary().tables.is_empty());

    // The token is reset when the next session starts.
    let summary = agent.synchronize(SyncType::Normal).unwrap();
    assert_eq!(summary.total_changes_downloaded(), 3);
    assert_eq!(agent.state(), SyncState::Synced);
}

#[test]
fn busy_store_is_retried() {
    let env = TestEnv::new();
    seed_sample_rows(env.server_db()).unwrap();
    let alice = env.client_with("alice", |o| {
        o.with_retry(
            RetryConfig::new(3)
                .with_initial_delay(Duration::from_millis(1))
                .with_jitter(false),
        )
    });

    env.server_db().fail_next_commit(StoreError::new(
        StoreErrorKind::Busy,
        CODE_BUSY,
        "database is locked",
    ));
    let summary = alice.agent.synchronize_with_retry(SyncType::Normal).unwrap();
    assert_eq!(summary.total_changes_downloaded(), 3);

    let stats = alice.agent.stats();
    assert_eq!(stats.retries, 1);
    assert_eq!(stats.sessions_failed, 1);
    assert_eq!(stats.sessions_completed, 1);
    assert!(stats.last_error.is_none());
}

#[test]
fn other_store_errors_fail_at_once() {
    let env = TestEnv::new();
    let alice = env.client_with("alice", |o| {
        o.with_retry(RetryConfig::new(3).with_initial_delay(Duration::from_millis(1)))
    });

    env.server_db().fail_next_commit(StoreError::new(
        StoreErrorKind::Other,
        CODE_ERROR,
        "disk image is malformed",
    ));
    let err = alice.agent.synchronize_with_retry(SyncType::Normal).unwrap_err();
    assert_eq!(err.store_error().map(|e| e.kind), Some(StoreErrorKind::Other));
    assert_eq!(err.stage(), Some(SyncStage::ScopeLoading));
    assert_eq!(alice.agent.stats().retries, 0);
}

#[test]
fn closed_transport_is_fatal() {
    let env = TestEnv::new();
    let alice = env.client("alice");
    alice.agent.transport().close().unwrap();

    let err = alice.agent.synchronize_with_retry(SyncType::Normal).unwrap_err();
    assert!(!err.is_retryable());
    assert_eq!(alice.agent.stats().retries, 0);
}

#[test]
fn conflicting_setup_is_rejected() {
    let env = TestEnv::new();
    env.client("alice").agent.synchronize(SyncType::Normal).unwrap();

    let bob = SyncAgent::new(
        MemoryProvider::new("bob"),
        InProcessTransport::new(Arc::clone(env.server())),
        env.client_options("bob"),
        SCOPE,
    )
    .with_setup(SyncSetup::new(["customer"]));

    let err = bob.synchronize(SyncType::Normal).unwrap_err();
    assert!(matches!(err.root(), SyncError::ConflictingSetup { .. }));
}

#[test]
fn failed_rows_are_counted() {
    let dir = TempDir::new().unwrap();
    let hooks = Interceptors::new().with_row_applying(|args| {
        if args.table_name == "product" && args.side == SyncSide::Server {
            args.row.values[2] = "MISSING".into();
        }
        RowApplyingAction::Apply
    });
    let (server_db, server) = server_with(&dir, hooks, ConflictResolutionPolicy::ServerWins);
    let (alice_db, alice) = client_of(&dir, &server, "alice");
    alice.synchronize(SyncType::Normal).unwrap();

    alice_db
        .upsert("product_category", category_row("BIKES", "Bikes"))
        .unwrap();
    alice_db
        .upsert("product", product_row(1, "Road bike", Some("BIKES"), 999.0))
        .unwrap();
    let summary = alice.synchronize(SyncType::Normal).unwrap();

    let product = summary
        .server_changes_applied
        .table("product", RowState::Upsert)
        .unwrap();
    assert_eq!(product.failed, 1);
    assert_eq!(product.applied, 0);
    assert_eq!(summary.total_failed(), 1);
    assert_eq!(server_db.rows("product_category").unwrap().len(), 1);
    assert!(server_db.rows("product").unwrap().is_empty());
}

#[test]
fn server_history_tracks_each_client() {
    let (env, alice) = synced_client(ConflictResolutionPolicy::ServerWins);
    let bob = env.client("bob");
    bob.agent.synchronize(SyncType::Normal).unwrap();

    let db = env.server_db();
    let store = ScopeStore::new(db.scope_store_builder("scope_info"));
    let history = run_in_transaction(db, None, |c| store.list_history_scopes(c, SCOPE)).unwrap();
    let mut ids: Vec<Uuid> = history.iter().map(|h| h.id).collect();
    ids.sort();
    let mut expected = vec![
        alice.agent.local().ensure_scope(None).unwrap().id,
        bob.agent.local().ensure_scope(None).unwrap().id,
    ];
    expected.sort();
    assert_eq!(ids, expected);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn concurrent_writes_converge(
        policy in policy_strategy(),
        server_ops in row_ops_strategy(5, 12),
        client_ops in row_ops_strategy(5, 12),
    ) {
        let env = TestEnv::with_server_options(|o| o.with_conflict_resolution_policy(policy));
        let alice = env.client("alice");
        alice.agent.synchronize(SyncType::Normal).unwrap();

        apply_ops(env.server_db(), &server_ops).unwrap();
        apply_ops(&alice.db, &client_ops).unwrap();

        alice.agent.synchronize(SyncType::Normal).unwrap();
        prop_assert_eq!(
            env.server_db().rows("customer").unwrap(),
            alice.db.rows("customer").unwrap()
        );

        let summary = alice.agent.synchronize(SyncType::Normal).unwrap();
        prop_assert_eq!(summary.total_changes_uploaded(), 0);
        prop_assert_eq!(summary.total_changes_downloaded(), 0);
    }
}

#[test]
fn client_scope_loads_before_server_ensure() {
    let dir = TempDir::new().unwrap();
    let stages: Arc<Mutex<Vec<(SyncSide, SyncStage)>>> = Arc::default();
    let record = |stages: &Arc<Mutex<Vec<(SyncSide, SyncStage)>>>| {
        let stages = Arc::clone(stages);
        Interceptors::new().with_progress(move |args| stages.lock().push((args.side, args.stage)))
    };
    let (server_db, server) = server_with(&dir, record(&stages), ConflictResolutionPolicy::ServerWins);
    seed_sample_rows(&server_db).unwrap();
    let alice_db = MemoryProvider::new("alice");
    let alice = reconnect(&dir, "alice", &alice_db, &server)
        .with_setup(sample_setup())
        .with_interceptors(record(&stages));

    alice.synchronize(SyncType::Normal).unwrap();

    let stages = stages.lock();
    let first = |side, stage| stages.iter().position(|s| *s == (side, stage)).unwrap();
    let client_loading = first(SyncSide::Client, SyncStage::ScopeLoading);
    let server_loading = first(SyncSide::Server, SyncStage::ScopeLoading);
    let client_provisioning = first(SyncSide::Client, SyncStage::Provisioning);
    assert!(client_loading < server_loading);
    assert!(server_loading < client_provisioning);
}

#[test]
fn continue_migrates_server_then_clients_follow() {
    let dir = TempDir::new().unwrap();
    let server_db = sample_server_db("server");
    seed_sample_rows(&server_db).unwrap();

    let v1 = serving(&dir, &server_db, SyncSetup::new(["customer"]), ConflictingSetupAction::Continue);
    let alice_db = MemoryProvider::new("alice");
    reconnect(&dir, "alice", &alice_db, &v1)
        .synchronize(SyncType::Normal)
        .unwrap();
    assert!(alice_db.rows("product").is_err());

    let v2 = serving(&dir, &server_db, sample_setup(), ConflictingSetupAction::Continue);
    let summary = reconnect(&dir, "alice", &alice_db, &v2)
        .synchronize(SyncType::Normal)
        .unwrap();
    assert_eq!(summary.total_changes_downloaded(), 2);
    for table in TABLES {
        assert_same_rows(&server_db, &alice_db, table);
    }

    let stored = v2.load_server_scope(SCOPE, None).unwrap().unwrap();
    assert_eq!(stored.setup, Some(sample_setup()));
    assert!(tracking_tables(&server_db).contains(&"product_tracking".to_string()));

    let bob_db = MemoryProvider::new("bob");
    let summary = reconnect(&dir, "bob", &bob_db, &v2)
        .synchronize(SyncType::Normal)
        .unwrap();
    assert_eq!(summary.total_changes_downloaded(), 3);
}

#[test]
fn abort_keeps_the_stored_setup() {
    let dir = TempDir::new().unwrap();
    let server_db = sample_server_db("server");
    seed_sample_rows(&server_db).unwrap();

    let v1 = serving(&dir, &server_db, sample_setup(), ConflictingSetupAction::Abort);
    let alice_db = MemoryProvider::new("alice");
    reconnect(&dir, "alice", &alice_db, &v1)
        .synchronize(SyncType::Normal)
        .unwrap();

    let v2 = serving(&dir, &server_db, SyncSetup::new(["customer"]), ConflictingSetupAction::Abort);
    server_db
        .upsert("product", product_row(2, "Helmet", Some("BIKES"), 30.0))
        .unwrap();
    let summary = reconnect(&dir, "alice", &alice_db, &v2)
        .synchronize(SyncType::Normal)
        .unwrap();

    let stored = v2.load_server_scope(SCOPE, None).unwrap().unwrap();
    assert_eq!(stored.setup, Some(sample_setup()));
    assert_eq!(summary.total_changes_downloaded(), 1);
    assert_same_rows(&server_db, &alice_db, "product");
}

#[test]
fn removed_table_stops_tracking() {
    let dir = TempDir::new().unwrap();
    let server_db = sample_server_db("server");
    seed_sample_rows(&server_db).unwrap();

    let v1 = serving(&dir, &server_db, sample_setup(), ConflictingSetupAction::Continue);
    let alice_db = MemoryProvider::new("alice");
    reconnect(&dir, "alice", &alice_db, &v1)
        .synchronize(SyncType::Normal)
        .unwrap();

    let v2 = serving(
        &dir,
        &server_db,
        SyncSetup::new(["product_category", "customer"]),
        ConflictingSetupAction::Continue,
    );
    let alice = reconnect(&dir, "alice", &alice_db, &v2);
    alice.synchronize(SyncType::Normal).unwrap();

    for db in [&server_db, &alice_db] {
        let tracking = tracking_tables(db);
        assert!(!tracking.contains(&"product_tracking".to_string()));
        assert!(tracking.contains(&"customer_tracking".to_string()));
    }
    assert_eq!(alice_db.rows("product").unwrap().len(), 1);

    alice_db
        .upsert("product", product_row(5, "Pump", Some("BIKES"), 12.0))
        .unwrap();
    let summary = alice.synchronize(SyncType::Normal).unwrap();
    assert_eq!(summary.total_changes_uploaded(), 0);
    assert!(server_db.row("product", &[SyncValue::Integer(5)]).unwrap().is_none());
}

#[test]
fn column_changes_alter_client_tables() {
    let dir = TempDir::new().unwrap();
    let server_db = sample_server_db("server");
    seed_sample_rows(&server_db).unwrap();

    let v1 = serving(&dir, &server_db, sample_setup(), ConflictingSetupAction::Continue);
    let alice_db = MemoryProvider::new("alice");
    reconnect(&dir, "alice", &alice_db, &v1)
        .synchronize(SyncType::Normal)
        .unwrap();

    let narrow = sample_setup().with_table(SetupTable::new("customer").with_columns(["id", "name"]));
    let v2 = serving(&dir, &server_db, narrow, ConflictingSetupAction::Continue);
    let alice = reconnect(&dir, "alice", &alice_db, &v2);
    alice.synchronize(SyncType::Normal).unwrap();

    assert!(alice_db.rows("customer").unwrap().iter().all(|r| r.len() == 2));
    assert!(server_db.rows("customer").unwrap().iter().all(|r| r.len() == 3));

    server_db.upsert("customer", customer_row(2, "Bea")).unwrap();
    alice.synchronize(SyncType::Normal).unwrap();
    assert_eq!(
        alice_db.row("customer", &[SyncValue::Integer(2)]).unwrap(),
        Some(vec![SyncValue::Integer(2), "Bea".into()])
    );

    let v3 = serving(&dir, &server_db, sample_setup(), ConflictingSetupAction::Continue);
    reconnect(&dir, "alice", &alice_db, &v3)
        .synchronize(SyncType::Normal)
        .unwrap();
    let rows = alice_db.rows("customer").unwrap();
    assert!(rows.iter().all(|r| r.len() == 3));
    assert_eq!(
        alice_db.row("customer", &[SyncValue::Integer(2)]).unwrap(),
        Some(vec![SyncValue::Integer(2), "Bea".into(), SyncValue::Null])
    );
}

#[test]
fn tracking_affixes_rename_tracking_tables() {
    let dir = TempDir::new().unwrap();
    let server_db = sample_server_db("server");
    seed_sample_rows(&server_db).unwrap();

    let v1 = serving(&dir, &server_db, sample_setup(), ConflictingSetupAction::Continue);
    let alice_db = MemoryProvider::new("alice");
    reconnect(&dir, "alice", &alice_db, &v1)
        .synchronize(SyncType::Normal)
        .unwrap();

    let renamed = sample_setup().with_tracking_affixes("sync_", "_tracking");
    let v2 = serving(&dir, &server_db, renamed, ConflictingSetupAction::Continue);
    let alice = reconnect(&dir, "alice", &alice_db, &v2);
    alice.synchronize(SyncType::Normal).unwrap();

    for db in [&server_db, &alice_db] {
        let tracking = tracking_tables(db);
        assert!(tracking.contains(&"sync_customer_tracking".to_string()));
        assert!(!tracking.contains(&"customer_tracking".to_string()));
    }

    alice_db.upsert("customer", customer_row(7, "Gus")).unwrap();
    let summary = alice.synchronize(SyncType::Normal).unwrap();
    assert_eq!(summary.total_changes_uploaded(), 1);
    assert_eq!(customer_name(&server_db, 7), Some("Gus".into()));
}

#[test]
fn mismatched_affixes_across_scopes_are_rejected() {
    let env = TestEnv::new();
    provision_server(&env);
    let other = SessionContext::new("other", Uuid::new_v4(), SyncType::Normal);

    let prefixed = SyncSetup::new(["customer"]).with_tracking_affixes("other_", "_tracking");
    let err = env.server().ensure_scope(&other, Some(&prefixed), None).unwrap_err();
    assert!(matches!(err.root(), SyncError::ConflictingSetup { .. }));

    let scope = env
        .server()
        .ensure_scope(&other, Some(&SyncSetup::new(["customer"])), None)
        .unwrap();
    assert!(scope.has_schema());
}
