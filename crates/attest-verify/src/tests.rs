use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use attest_cdc::{ChangeEvent, EventHandler, HandlerError, Lsn, Operation, Row};
use attest_hash::{ContentHasher, FieldValue};
use attest_store::WitnessStore;
use chrono::Utc;

use crate::error::{TamperKind, VerifyError};
use crate::guard::{termination_flag, FollowerGuard};
use crate::handler::{TableConfig, WitnessHandler};
use crate::verifier::{LiveTableSource, MerkleVerifier, VerifyReport};
use attest_consensus::FsmObserver;

// -----------------------------------------------------------------------
// Helpers
// -----------------------------------------------------------------------

fn sha256() -> Arc<ContentHasher> {
    Arc::new(ContentHasher::with_defaults("sha256").unwrap())
}

fn row(fields: &[(&str, &str)]) -> Row {
    fields
        .iter()
        .map(|(k, v)| (k.to_string(), FieldValue::Text(v.to_string())))
        .collect()
}

fn insert_event(table: &str, fields: &[(&str, &str)]) -> ChangeEvent {
    let data = row(fields);
    let primary_key: Row = data
        .iter()
        .filter(|(k, _)| k.as_str() == "id")
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    ChangeEvent {
        table_name: table.to_string(),
        operation: Operation::Insert,
        timestamp: Utc::now(),
        new_data: data,
        old_data: Row::new(),
        primary_key,
        lsn: Lsn(0),
    }
}

fn mutation_event(table: &str, operation: Operation, id: &str) -> ChangeEvent {
    let pk = row(&[("id", id)]);
    ChangeEvent {
        table_name: table.to_string(),
        operation,
        timestamp: Utc::now(),
        new_data: Row::new(),
        old_data: pk.clone(),
        primary_key: pk,
        lsn: Lsn(0),
    }
}

struct FakeLiveTable {
    rows: Mutex<Vec<Row>>,
}

impl FakeLiveTable {
    fn new(rows: Vec<Row>) -> Arc<Self> {
        Arc::new(Self {
            rows: Mutex::new(rows),
        })
    }

    fn set(&self, rows: Vec<Row>) {
        *self.rows.lock().unwrap() = rows;
    }
}

#[async_trait]
impl LiveTableSource for FakeLiveTable {
    async fn fetch_rows(&self, _table: &str) -> Result<Vec<Row>, VerifyError> {
        Ok(self.rows.lock().unwrap().clone())
    }
}

fn table(name: &str) -> TableConfig {
    TableConfig {
        name: name.to_string(),
        verify_interval: None,
    }
}

/// Run the handler over a set of inserts, filling the witness store the
/// way steady-state CDC would.
async fn witness_inserts(store: &Arc<WitnessStore>, table_name: &str, rows: &[Row]) {
    let handler = WitnessHandler::new(store.clone(), sha256());
    handler.add_table(table(table_name)).unwrap();

    for r in rows {
        let primary_key: Row = r
            .iter()
            .filter(|(k, _)| k.as_str() == "id")
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let event = ChangeEvent {
            table_name: table_name.to_string(),
            operation: Operation::Insert,
            timestamp: Utc::now(),
            new_data: r.clone(),
            old_data: Row::new(),
            primary_key,
            lsn: Lsn(0),
        };
        handler.handle_change(&event).await.unwrap();
    }
}

// -----------------------------------------------------------------------
// Handler
// -----------------------------------------------------------------------

#[tokio::test]
async fn unprotected_tables_are_ignored() {
    let store = Arc::new(WitnessStore::open_temporary().unwrap());
    let handler = WitnessHandler::new(store.clone(), sha256());
    handler.add_table(table("audit_logs")).unwrap();

    handler
        .handle_change(&insert_event("other_table", &[("id", "1")]))
        .await
        .unwrap();

    assert!(store.latest_hash_entry("other_table").unwrap().is_none());
}

#[tokio::test]
async fn updates_and_deletes_are_tamper_errors() {
    let store = Arc::new(WitnessStore::open_temporary().unwrap());
    let handler = WitnessHandler::new(store.clone(), sha256());
    handler.add_table(table("audit_logs")).unwrap();

    for operation in [Operation::Update, Operation::Delete] {
        let err = handler
            .handle_change(&mutation_event("audit_logs", operation, "1"))
            .await
            .unwrap_err();
        match err {
            HandlerError::Tamper { table, operation: op } => {
                assert_eq!(table, "audit_logs");
                assert_eq!(op, operation.to_string());
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    // Nothing was written.
    assert!(store.latest_hash_entry("audit_logs").unwrap().is_none());
}

#[tokio::test]
async fn inserts_allocate_gap_free_sequences() {
    let store = Arc::new(WitnessStore::open_temporary().unwrap());
    let hasher = sha256();
    let handler = WitnessHandler::new(store.clone(), hasher.clone());
    handler.add_table(table("audit_logs")).unwrap();

    let first = insert_event("audit_logs", &[("id", "1"), ("msg", "hello")]);
    let second = insert_event("audit_logs", &[("id", "2"), ("msg", "world")]);
    handler.handle_change(&first).await.unwrap();
    handler.handle_change(&second).await.unwrap();

    let entries = store.all_hash_entries("audit_logs").unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].sequence_num, 1);
    assert_eq!(entries[0].record_id, "1");
    assert_eq!(entries[0].operation_type, "INSERT");
    assert_eq!(entries[0].data_hash, hasher.hash_record(&first.new_data));
    assert_eq!(entries[1].sequence_num, 2);
}

#[test]
fn hostile_table_names_are_rejected() {
    let store = Arc::new(WitnessStore::open_temporary().unwrap());
    let handler = WitnessHandler::new(store, sha256());

    for name in ["users; DROP TABLE users", "1table", "ta-ble", "", "t\"t"] {
        let err = handler.add_table(table(name)).unwrap_err();
        assert!(matches!(err, VerifyError::InvalidTableName(_)), "{name}");
    }

    for name in ["users", "_private", "Audit_Logs2"] {
        handler.add_table(table(name)).unwrap();
    }
}

// -----------------------------------------------------------------------
// Verifier
// -----------------------------------------------------------------------

#[tokio::test]
async fn clean_table_verifies_and_checkpoints() {
    let store = Arc::new(WitnessStore::open_temporary().unwrap());
    let rows = vec![
        row(&[("id", "1"), ("msg", "hello")]),
        row(&[("id", "2"), ("msg", "world")]),
    ];
    witness_inserts(&store, "audit_logs", &rows).await;

    let live = FakeLiveTable::new(rows);
    let verifier = MerkleVerifier::new(store.clone(), sha256(), live);

    let VerifyReport {
        table,
        merkle_root,
        record_count,
    } = verifier.verify_table("audit_logs").await.unwrap();

    assert_eq!(table, "audit_logs");
    assert_eq!(record_count, 2);
    assert!(!merkle_root.is_empty());

    let checkpoint = store
        .latest_merkle_checkpoint("audit_logs")
        .unwrap()
        .unwrap();
    assert_eq!(checkpoint.merkle_root, merkle_root);
    assert_eq!(checkpoint.sequence_num, 2);
    assert_eq!(checkpoint.record_count, 2);
    assert_eq!(checkpoint.hash_algorithm, "sha256");
    assert_eq!(checkpoint.leaf_map.len(), 2);
    assert!(!checkpoint.internal_nodes.is_empty());
}

#[tokio::test]
async fn modified_rows_are_classified_with_both_hashes() {
    let store = Arc::new(WitnessStore::open_temporary().unwrap());
    let hasher = sha256();
    let original = row(&[("id", "1"), ("msg", "hello")]);
    witness_inserts(&store, "audit_logs", &[original.clone()]).await;

    // The row was rewritten out-of-band.
    let tampered = row(&[("id", "1"), ("msg", "tampered")]);
    let live = FakeLiveTable::new(vec![tampered.clone()]);
    let verifier = MerkleVerifier::new(store.clone(), hasher.clone(), live);

    let err = verifier.verify_table("audit_logs").await.unwrap_err();
    match err {
        VerifyError::Tamper { table, records } => {
            assert_eq!(table, "audit_logs");
            assert_eq!(records.len(), 1);
            assert_eq!(records[0].record_id, "1");
            assert_eq!(records[0].kind, TamperKind::Modified);
            assert_eq!(
                records[0].expected_hash.as_deref(),
                Some(hasher.hash_record(&original).as_str())
            );
            assert_eq!(
                records[0].actual_hash.as_deref(),
                Some(hasher.hash_record(&tampered).as_str())
            );
        }
        other => panic!("unexpected error: {other}"),
    }

    // No checkpoint while divergent.
    assert!(store
        .latest_merkle_checkpoint("audit_logs")
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn phantom_inserts_are_detected_with_empty_witness() {
    let store = Arc::new(WitnessStore::open_temporary().unwrap());
    let live = FakeLiveTable::new(vec![row(&[("id", "99"), ("msg", "x")])]);
    let verifier = MerkleVerifier::new(store, sha256(), live);

    let err = verifier.verify_table("audit_logs").await.unwrap_err();
    match err {
        VerifyError::Tamper { records, .. } => {
            assert_eq!(records.len(), 1);
            assert_eq!(records[0].record_id, "99");
            assert_eq!(records[0].kind, TamperKind::PhantomInsert);
            assert!(records[0].expected_hash.is_none());
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn deleted_rows_are_detected() {
    let store = Arc::new(WitnessStore::open_temporary().unwrap());
    witness_inserts(&store, "audit_logs", &[row(&[("id", "1"), ("msg", "x")])]).await;

    let live = FakeLiveTable::new(Vec::new());
    let verifier = MerkleVerifier::new(store, sha256(), live);

    let err = verifier.verify_table("audit_logs").await.unwrap_err();
    match err {
        VerifyError::Tamper { records, .. } => {
            assert_eq!(records.len(), 1);
            assert_eq!(records[0].record_id, "1");
            assert_eq!(records[0].kind, TamperKind::Deleted);
            assert!(records[0].actual_hash.is_none());
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn timestamp_noise_does_not_trip_verification() {
    // CDC delivered one textual timestamp form; the live read delivers
    // another. Both are excluded from hashing.
    let store = Arc::new(WitnessStore::open_temporary().unwrap());
    witness_inserts(
        &store,
        "audit_logs",
        &[row(&[
            ("id", "1"),
            ("msg", "hello"),
            ("created_at", "2024-01-01T00:00:00Z"),
        ])],
    )
    .await;

    let live = FakeLiveTable::new(vec![row(&[
        ("id", "1"),
        ("msg", "hello"),
        ("created_at", "2024-01-01 00:00:00+00"),
    ])]);
    let verifier = MerkleVerifier::new(store, sha256(), live);

    verifier.verify_table("audit_logs").await.unwrap();
}

#[tokio::test]
async fn checkpointed_verification_matches_full_rebuild() {
    let store = Arc::new(WitnessStore::open_temporary().unwrap());
    let mut rows: Vec<Row> = (1..=20)
        .map(|i| row(&[("id", &i.to_string()), ("msg", &format!("m{i}"))]))
        .collect();
    witness_inserts(&store, "audit_logs", &rows).await;

    let live = FakeLiveTable::new(rows.clone());
    let verifier = MerkleVerifier::new(store.clone(), sha256(), live.clone());

    // First pass writes a checkpoint at sequence 20.
    let first = verifier.verify_table("audit_logs").await.unwrap();
    let checkpoint = store
        .latest_merkle_checkpoint("audit_logs")
        .unwrap()
        .unwrap();
    assert_eq!(checkpoint.sequence_num, 20);

    // Ten more inserts arrive through the normal path.
    let new_rows: Vec<Row> = (21..=30)
        .map(|i| row(&[("id", &i.to_string()), ("msg", &format!("m{i}"))]))
        .collect();
    witness_inserts(&store, "audit_logs", &new_rows).await;
    rows.extend(new_rows);
    live.set(rows);

    // Second pass starts from the checkpoint and reads only the new
    // entries, yet lands on the same root as a full rebuild.
    let second = verifier.verify_table("audit_logs").await.unwrap();
    assert_eq!(second.record_count, 30);
    assert_ne!(second.merkle_root, first.merkle_root);

    let refreshed = store
        .latest_merkle_checkpoint("audit_logs")
        .unwrap()
        .unwrap();
    assert_eq!(refreshed.sequence_num, 30);
    assert_eq!(refreshed.leaf_map.len(), 30);
}

#[tokio::test]
async fn verifier_rejects_hostile_table_names() {
    let store = Arc::new(WitnessStore::open_temporary().unwrap());
    let live = FakeLiveTable::new(Vec::new());
    let verifier = MerkleVerifier::new(store, sha256(), live);

    let err = verifier
        .verify_table("users; DROP TABLE users")
        .await
        .unwrap_err();
    assert!(matches!(err, VerifyError::InvalidTableName(_)));
}

// -----------------------------------------------------------------------
// Follower guard
// -----------------------------------------------------------------------

#[tokio::test]
async fn divergence_sets_flag_and_invokes_shutdown() {
    let store = Arc::new(WitnessStore::open_temporary().unwrap());
    assert!(!termination_flag(&store).unwrap());

    let called = Arc::new(AtomicBool::new(false));
    let called_clone = called.clone();
    let guard = FollowerGuard::new(store.clone(), None, true, move || {
        called_clone.store(true, Ordering::SeqCst);
    });

    guard.on_divergence("audit_logs", 3, "local", "consensus");

    assert!(termination_flag(&store).unwrap());
    assert!(called.load(Ordering::SeqCst));
}

#[tokio::test]
async fn divergence_without_auto_shutdown_keeps_running() {
    let store = Arc::new(WitnessStore::open_temporary().unwrap());
    let called = Arc::new(AtomicBool::new(false));
    let called_clone = called.clone();
    let guard = FollowerGuard::new(store.clone(), None, false, move || {
        called_clone.store(true, Ordering::SeqCst);
    });

    guard.on_divergence("audit_logs", 3, "local", "consensus");

    // The flag is recorded either way; only the shutdown is gated.
    assert!(termination_flag(&store).unwrap());
    assert!(!called.load(Ordering::SeqCst));
}
