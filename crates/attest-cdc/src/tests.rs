use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use attest_hash::FieldValue;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::watch;

use crate::error::{CdcError, HandlerError};
use crate::event::{ChangeEvent, EventHandler, Lsn, Operation};
use crate::manager::{CdcConfig, CdcManager};
use crate::protocol::{
    parse_frame, parse_logical, standby_status_update, LogicalMessage, ReplicationFrame,
    TupleValue,
};
use crate::stream::{ReplicationStream, StreamFactory};

// -----------------------------------------------------------------------
// Wire encoders (the server side of the protocol)
// -----------------------------------------------------------------------

fn put_cstr(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

/// Relation descriptor for a table with text columns; `key` marks the
/// replica-identity columns.
fn relation_msg(id: u32, name: &str, columns: &[(&str, bool)]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(b'R');
    buf.put_u32(id);
    put_cstr(&mut buf, "public");
    put_cstr(&mut buf, name);
    buf.put_u8(b'd');
    buf.put_u16(columns.len() as u16);
    for (column, key) in columns {
        buf.put_u8(u8::from(*key));
        put_cstr(&mut buf, column);
        buf.put_u32(25); // text
        buf.put_i32(-1);
    }
    buf.freeze()
}

fn put_tuple(buf: &mut BytesMut, values: &[Option<&str>]) {
    buf.put_u16(values.len() as u16);
    for value in values {
        match value {
            None => buf.put_u8(b'n'),
            Some(text) => {
                buf.put_u8(b't');
                buf.put_i32(text.len() as i32);
                buf.put_slice(text.as_bytes());
            }
        }
    }
}

fn insert_msg(relation_id: u32, values: &[Option<&str>]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(b'I');
    buf.put_u32(relation_id);
    buf.put_u8(b'N');
    put_tuple(&mut buf, values);
    buf.freeze()
}

fn update_msg(relation_id: u32, old: Option<&[Option<&str>]>, new: &[Option<&str>]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(b'U');
    buf.put_u32(relation_id);
    if let Some(old) = old {
        buf.put_u8(b'O');
        put_tuple(&mut buf, old);
    }
    buf.put_u8(b'N');
    put_tuple(&mut buf, new);
    buf.freeze()
}

fn delete_msg(relation_id: u32, old: &[Option<&str>]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(b'D');
    buf.put_u32(relation_id);
    buf.put_u8(b'K');
    put_tuple(&mut buf, old);
    buf.freeze()
}

fn xlog(wal_start: u64, wal_end: u64, data: &Bytes) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(b'w');
    buf.put_u64(wal_start);
    buf.put_u64(wal_end);
    buf.put_u64(0);
    buf.put_slice(data);
    buf.freeze()
}

fn keepalive(wal_end: u64, reply_requested: bool) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(b'k');
    buf.put_u64(wal_end);
    buf.put_u64(0);
    buf.put_u8(u8::from(reply_requested));
    buf.freeze()
}

// -----------------------------------------------------------------------
// Scripted stream + factory
// -----------------------------------------------------------------------

struct ScriptedStream {
    frames: VecDeque<Bytes>,
    status_updates: Arc<Mutex<Vec<Lsn>>>,
}

#[async_trait]
impl ReplicationStream for ScriptedStream {
    async fn receive(&mut self, _timeout: Duration) -> Result<Option<Bytes>, CdcError> {
        match self.frames.pop_front() {
            Some(frame) => Ok(Some(frame)),
            None => {
                // Idle: behave like a receive timeout.
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(None)
            }
        }
    }

    async fn send_status_update(&mut self, lsn: Lsn) -> Result<(), CdcError> {
        self.status_updates.lock().unwrap().push(lsn);
        Ok(())
    }
}

struct ScriptedFactory {
    scripts: Mutex<VecDeque<Vec<Bytes>>>,
    connects: AtomicUsize,
    status_updates: Arc<Mutex<Vec<Lsn>>>,
}

impl ScriptedFactory {
    fn new(scripts: Vec<Vec<Bytes>>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into_iter().collect()),
            connects: AtomicUsize::new(0),
            status_updates: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

#[async_trait]
impl StreamFactory for &ScriptedFactory {
    type Stream = ScriptedStream;

    async fn connect(&self, _start: Lsn) -> Result<ScriptedStream, CdcError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let frames = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default();
        Ok(ScriptedStream {
            frames: frames.into(),
            status_updates: self.status_updates.clone(),
        })
    }
}

struct RecordingHandler {
    events: Mutex<Vec<ChangeEvent>>,
    fail_next: AtomicBool,
    stop_after: usize,
    shutdown: watch::Sender<bool>,
}

impl RecordingHandler {
    fn new(stop_after: usize, shutdown: watch::Sender<bool>) -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
            fail_next: AtomicBool::new(false),
            stop_after,
            shutdown,
        })
    }

    fn seen(&self) -> Vec<ChangeEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn handle_change(&self, event: &ChangeEvent) -> Result<(), HandlerError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(HandlerError::Other("injected failure".to_string()));
        }

        let mut events = self.events.lock().unwrap();
        events.push(event.clone());
        if events.len() >= self.stop_after {
            let _ = self.shutdown.send(true);
        }
        Ok(())
    }
}

fn test_config() -> CdcConfig {
    CdcConfig {
        host: "localhost".to_string(),
        port: 5432,
        database: "app".to_string(),
        user: "attest".to_string(),
        password: "secret".to_string(),
        slot_name: "attest_1".to_string(),
        publication_name: "attest_publication".to_string(),
    }
}

// -----------------------------------------------------------------------
// Protocol tests
// -----------------------------------------------------------------------

#[test]
fn parses_relation_descriptor() {
    let msg = relation_msg(42, "audit_logs", &[("id", true), ("msg", false)]);

    match parse_logical(&msg).unwrap() {
        LogicalMessage::Relation(rel) => {
            assert_eq!(rel.id, 42);
            assert_eq!(rel.namespace, "public");
            assert_eq!(rel.name, "audit_logs");
            assert_eq!(rel.columns.len(), 2);
            assert!(rel.columns[0].is_key());
            assert_eq!(rel.columns[0].name, "id");
            assert!(!rel.columns[1].is_key());
        }
        other => panic!("unexpected message: {other:?}"),
    }
}

#[test]
fn parses_insert_with_null_and_text_columns() {
    let msg = insert_msg(42, &[Some("1"), None, Some("hello")]);

    match parse_logical(&msg).unwrap() {
        LogicalMessage::Insert { relation_id, new } => {
            assert_eq!(relation_id, 42);
            assert_eq!(
                new.0,
                vec![
                    TupleValue::Text("1".to_string()),
                    TupleValue::Null,
                    TupleValue::Text("hello".to_string()),
                ]
            );
        }
        other => panic!("unexpected message: {other:?}"),
    }
}

#[test]
fn parses_update_with_old_image() {
    let msg = update_msg(7, Some(&[Some("1"), Some("old")]), &[Some("1"), Some("new")]);

    match parse_logical(&msg).unwrap() {
        LogicalMessage::Update {
            relation_id,
            old,
            new,
        } => {
            assert_eq!(relation_id, 7);
            assert_eq!(old.unwrap().0[1], TupleValue::Text("old".to_string()));
            assert_eq!(new.0[1], TupleValue::Text("new".to_string()));
        }
        other => panic!("unexpected message: {other:?}"),
    }
}

#[test]
fn parses_delete_with_key_image() {
    let msg = delete_msg(7, &[Some("9")]);

    match parse_logical(&msg).unwrap() {
        LogicalMessage::Delete { relation_id, old } => {
            assert_eq!(relation_id, 7);
            assert_eq!(old.0, vec![TupleValue::Text("9".to_string())]);
        }
        other => panic!("unexpected message: {other:?}"),
    }
}

#[test]
fn parses_replication_framing() {
    let inner = insert_msg(1, &[Some("x")]);
    let frame = xlog(100, 200, &inner);

    match parse_frame(&frame).unwrap() {
        ReplicationFrame::XLogData {
            wal_start,
            wal_end,
            data,
        } => {
            assert_eq!(wal_start, Lsn(100));
            assert_eq!(wal_end, Lsn(200));
            assert_eq!(data, inner);
        }
        other => panic!("unexpected frame: {other:?}"),
    }

    match parse_frame(&keepalive(300, true)).unwrap() {
        ReplicationFrame::Keepalive {
            wal_end,
            reply_requested,
        } => {
            assert_eq!(wal_end, Lsn(300));
            assert!(reply_requested);
        }
        other => panic!("unexpected frame: {other:?}"),
    }
}

#[test]
fn truncated_messages_error_instead_of_panicking() {
    assert!(parse_frame(&[b'w', 0, 1]).is_err());
    assert!(parse_logical(&[b'R', 0, 0]).is_err());
    assert!(parse_logical(&[b'I', 0, 0, 0, 1, b'N', 0, 1, b't', 0, 0, 0, 9]).is_err());
}

#[test]
fn unknown_logical_messages_are_tolerated() {
    // Origin messages ('O') are skipped, not errors.
    assert!(matches!(
        parse_logical(&[b'O', 1, 2, 3]).unwrap(),
        LogicalMessage::Other(b'O')
    ));
}

#[test]
fn status_update_layout() {
    let frame = standby_status_update(Lsn(0xDEADBEEF), false);
    assert_eq!(frame.len(), 34);
    assert_eq!(frame[0], b'r');
    // write / flush / apply all acknowledge the same position.
    for offset in [1, 9, 17] {
        let lsn = u64::from_be_bytes(frame[offset..offset + 8].try_into().unwrap());
        assert_eq!(lsn, 0xDEADBEEF);
    }
    assert_eq!(frame[33], 0);
}

#[test]
fn lsn_renders_in_postgres_notation() {
    assert_eq!(Lsn(0x1_0000_002A).to_string(), "1/2A");
    assert_eq!(Lsn(0).to_string(), "0/0");
}

// -----------------------------------------------------------------------
// Manager tests
// -----------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn delivers_insert_events_with_primary_key() {
    let relation = relation_msg(42, "audit_logs", &[("id", true), ("msg", false)]);
    let insert = insert_msg(42, &[Some("1"), Some("hello")]);
    let factory = ScriptedFactory::new(vec![vec![
        xlog(10, 20, &relation),
        xlog(20, 30, &insert),
    ]]);

    let (tx, rx) = watch::channel(false);
    let handler = RecordingHandler::new(1, tx);

    let mut manager = CdcManager::new(test_config());
    manager.add_handler(handler.clone());

    let final_lsn = manager.run(&factory, rx).await.unwrap();

    let events = handler.seen();
    assert_eq!(events.len(), 1);
    let event = &events[0];
    assert_eq!(event.table_name, "audit_logs");
    assert_eq!(event.operation, Operation::Insert);
    assert_eq!(
        event.new_data.get("msg"),
        Some(&FieldValue::Text("hello".to_string()))
    );
    assert_eq!(
        event.primary_key.get("id"),
        Some(&FieldValue::Text("1".to_string()))
    );
    assert_eq!(event.record_id(), "1");
    assert_eq!(final_lsn, Lsn(30));
}

#[tokio::test(start_paused = true)]
async fn update_and_delete_events_carry_old_images() {
    let relation = relation_msg(7, "t", &[("id", true), ("v", false)]);
    let update = update_msg(7, Some(&[Some("1"), Some("a")]), &[Some("1"), Some("b")]);
    let delete = delete_msg(7, &[Some("1"), None]);
    let factory = ScriptedFactory::new(vec![vec![
        xlog(1, 2, &relation),
        xlog(2, 3, &update),
        xlog(3, 4, &delete),
    ]]);

    let (tx, rx) = watch::channel(false);
    let handler = RecordingHandler::new(2, tx);

    let mut manager = CdcManager::new(test_config());
    manager.add_handler(handler.clone());
    manager.run(&factory, rx).await.unwrap();

    let events = handler.seen();
    assert_eq!(events.len(), 2);

    assert_eq!(events[0].operation, Operation::Update);
    assert_eq!(
        events[0].old_data.get("v"),
        Some(&FieldValue::Text("a".to_string()))
    );
    assert_eq!(
        events[0].new_data.get("v"),
        Some(&FieldValue::Text("b".to_string()))
    );

    assert_eq!(events[1].operation, Operation::Delete);
    assert!(events[1].new_data.is_empty());
    assert_eq!(
        events[1].primary_key.get("id"),
        Some(&FieldValue::Text("1".to_string()))
    );
}

#[tokio::test(start_paused = true)]
async fn handler_failure_forces_redelivery_from_last_position() {
    let relation = relation_msg(42, "audit_logs", &[("id", true)]);
    let insert = insert_msg(42, &[Some("1")]);

    // Both sessions replay the same events, as a reconnect from an
    // unadvanced position would.
    let script = vec![xlog(10, 20, &relation), xlog(20, 30, &insert)];
    let factory = ScriptedFactory::new(vec![script.clone(), script]);

    let (tx, rx) = watch::channel(false);
    let handler = RecordingHandler::new(1, tx);
    handler.fail_next.store(true, Ordering::SeqCst);

    let mut manager = CdcManager::new(test_config());
    manager.add_handler(handler.clone());
    manager.run(&factory, rx).await.unwrap();

    // First dispatch failed, the stream was reconnected, and the event
    // arrived again.
    assert_eq!(factory.connects.load(Ordering::SeqCst), 2);
    assert_eq!(handler.seen().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn unknown_relation_id_is_an_error() {
    let insert = insert_msg(99, &[Some("1")]);
    let relation = relation_msg(99, "t", &[("id", true)]);

    // First session sends a row before its descriptor; the reconnected
    // session behaves.
    let factory = ScriptedFactory::new(vec![
        vec![xlog(1, 2, &insert)],
        vec![xlog(1, 2, &relation), xlog(2, 3, &insert)],
    ]);

    let (tx, rx) = watch::channel(false);
    let handler = RecordingHandler::new(1, tx);

    let mut manager = CdcManager::new(test_config());
    manager.add_handler(handler.clone());
    manager.run(&factory, rx).await.unwrap();

    assert_eq!(factory.connects.load(Ordering::SeqCst), 2);
    assert_eq!(handler.seen().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn keepalive_with_reply_requested_sends_status_update() {
    let relation = relation_msg(42, "t", &[("id", true)]);
    let insert = insert_msg(42, &[Some("1")]);
    let factory = ScriptedFactory::new(vec![vec![
        xlog(1, 2, &relation),
        xlog(2, 5, &insert),
        keepalive(6, true),
    ]]);

    let (tx, rx) = watch::channel(false);
    // Stop after the insert; the keepalive is processed before the insert
    // triggers shutdown observation only on the next loop turn.
    let handler = RecordingHandler::new(1, tx);

    let mut manager = CdcManager::new(test_config());
    manager.add_handler(handler.clone());
    manager.run(&factory, rx).await.unwrap();

    let updates = factory.status_updates.lock().unwrap().clone();
    assert!(updates.contains(&Lsn(5)), "expected ack at 5, got {updates:?}");
}

#[tokio::test(start_paused = true)]
async fn events_for_unhandled_tables_still_advance() {
    // A handler that ignores the table still succeeds, so the position
    // advances past the event.
    let relation = relation_msg(1, "unprotected", &[("id", true)]);
    let insert = insert_msg(1, &[Some("5")]);
    let factory = ScriptedFactory::new(vec![vec![
        xlog(1, 2, &relation),
        xlog(2, 9, &insert),
    ]]);

    let (tx, rx) = watch::channel(false);
    let handler = RecordingHandler::new(1, tx);

    let mut manager = CdcManager::new(test_config());
    manager.add_handler(handler.clone());
    let final_lsn = manager.run(&factory, rx).await.unwrap();

    assert_eq!(final_lsn, Lsn(9));
}

struct AppendOnlyHandler {
    inner: Arc<RecordingHandler>,
}

#[async_trait]
impl EventHandler for AppendOnlyHandler {
    async fn handle_change(&self, event: &ChangeEvent) -> Result<(), HandlerError> {
        if event.operation != Operation::Insert {
            return Err(HandlerError::Tamper {
                table: event.table_name.clone(),
                operation: event.operation.to_string(),
            });
        }
        self.inner.handle_change(event).await
    }
}

#[tokio::test(start_paused = true)]
async fn tamper_rejections_skip_the_poison_event() {
    let relation = relation_msg(7, "t", &[("id", true), ("v", false)]);
    let poison = update_msg(7, None, &[Some("1"), Some("x")]);
    let insert = insert_msg(7, &[Some("2"), Some("y")]);
    let factory = ScriptedFactory::new(vec![vec![
        xlog(1, 2, &relation),
        xlog(2, 3, &poison),
        xlog(3, 4, &insert),
    ]]);

    let (tx, rx) = watch::channel(false);
    let recorder = RecordingHandler::new(1, tx);

    let mut manager = CdcManager::new(test_config());
    manager.add_handler(Arc::new(AppendOnlyHandler {
        inner: recorder.clone(),
    }));
    let final_lsn = manager.run(&factory, rx).await.unwrap();

    // No reconnect: the tamper event is final, not transient.
    assert_eq!(factory.connects.load(Ordering::SeqCst), 1);
    let events = recorder.seen();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].operation, Operation::Insert);
    assert_eq!(final_lsn, Lsn(4));
}

#[test]
fn composite_primary_keys_render_canonically() {
    let event = ChangeEvent {
        table_name: "t".to_string(),
        operation: Operation::Insert,
        timestamp: chrono::Utc::now(),
        new_data: Default::default(),
        old_data: Default::default(),
        primary_key: [
            ("tenant".to_string(), FieldValue::Text("acme".to_string())),
            ("seq".to_string(), FieldValue::Integer(7)),
        ]
        .into_iter()
        .collect(),
        lsn: Lsn(0),
    };

    assert_eq!(event.record_id(), "seq=7,tenant=acme");
}

#[test]
fn connection_strings_include_replication_parameter() {
    let config = test_config();
    assert!(!config.connection_string().contains("replication"));
    assert!(config
        .replication_connection_string()
        .ends_with("replication=database"));
}
