//! The CDC manager: receive loop, decoding, dispatch, acknowledgment.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use attest_alert::{AlertManager, Severity};
use attest_hash::FieldValue;
use chrono::Utc;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_postgres::NoTls;
use tracing::{debug, error, info, warn};

use crate::error::{CdcError, HandlerError};
use crate::event::{ChangeEvent, EventHandler, Lsn, Operation, Row};
use crate::protocol::{parse_frame, parse_logical, LogicalMessage, Relation, ReplicationFrame,
    Tuple, TupleValue};
use crate::stream::{ReplicationStream, StreamFactory};

/// Per-message receive timeout. A timeout is a no-op tick.
const RECEIVE_TIMEOUT: Duration = Duration::from_secs(10);

/// How often to volunteer a standby status update.
const STATUS_INTERVAL: Duration = Duration::from_secs(10);

/// Backoff ceiling for stream errors.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Connection parameters for the upstream database.
#[derive(Debug, Clone)]
pub struct CdcConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    pub slot_name: String,
    pub publication_name: String,
}

impl CdcConfig {
    /// Plain connection string for SQL-level work.
    pub fn connection_string(&self) -> String {
        format!(
            "host={} port={} dbname={} user={} password={}",
            self.host, self.port, self.database, self.user, self.password,
        )
    }

    /// Connection string carrying the replication startup parameter.
    pub fn replication_connection_string(&self) -> String {
        format!("{} replication=database", self.connection_string())
    }
}

/// Subscribes to the replication stream and feeds decoded events to
/// handlers in registration order.
///
/// Single-threaded cooperative: one receive loop owns the stream. On any
/// receive or dispatch failure the stream is dropped and reconnected from
/// the last durably applied position after exponential backoff, so
/// unacknowledged events are redelivered.
pub struct CdcManager {
    config: CdcConfig,
    handlers: Vec<Arc<dyn EventHandler>>,
    relations: HashMap<u32, Relation>,
    alerts: Option<Arc<AlertManager>>,
    /// Highest position every handler has durably processed.
    applied_lsn: Lsn,
}

impl CdcManager {
    pub fn new(config: CdcConfig) -> Self {
        Self {
            config,
            handlers: Vec::new(),
            relations: HashMap::new(),
            alerts: None,
            applied_lsn: Lsn(0),
        }
    }

    /// Register a handler. Dispatch preserves registration order.
    pub fn add_handler(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    pub fn set_alert_manager(&mut self, alerts: Arc<AlertManager>) {
        self.alerts = Some(alerts);
    }

    /// Resume position for reconnects; zero on first start.
    pub fn set_start_position(&mut self, lsn: Lsn) {
        self.applied_lsn = lsn;
    }

    pub fn applied_lsn(&self) -> Lsn {
        self.applied_lsn
    }

    pub fn config(&self) -> &CdcConfig {
        &self.config
    }

    /// Ensure the named publication exists, creating it over all tables
    /// when absent.
    pub async fn ensure_publication(&self) -> Result<(), CdcError> {
        let (client, connection) =
            tokio_postgres::connect(&self.config.connection_string(), NoTls).await?;
        let task = tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(error = %e, "publication check connection closed");
            }
        });

        let row = client
            .query_one(
                "SELECT EXISTS (SELECT 1 FROM pg_publication WHERE pubname = $1)",
                &[&self.config.publication_name],
            )
            .await?;
        let exists: bool = row.get(0);

        if !exists {
            client
                .execute(
                    &format!(
                        "CREATE PUBLICATION {} FOR ALL TABLES",
                        self.config.publication_name
                    ),
                    &[],
                )
                .await?;
            info!(publication = %self.config.publication_name, "created publication");
        }

        task.abort();
        Ok(())
    }

    /// Run the receive loop until the shutdown signal flips.
    ///
    /// Errors reconnect through `factory` with `min(2^n, 30s)` backoff and
    /// a system alert; a successful receive resets the counter.
    pub async fn run<F: StreamFactory>(
        mut self,
        factory: F,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<Lsn, CdcError> {
        let mut error_count = 0u32;

        'reconnect: loop {
            if *shutdown.borrow() {
                return Ok(self.applied_lsn);
            }

            let mut stream = match factory.connect(self.applied_lsn).await {
                Ok(stream) => stream,
                Err(e) => {
                    error_count += 1;
                    self.report_stream_error(&e, error_count, &mut shutdown).await;
                    continue 'reconnect;
                }
            };

            info!(start = %self.applied_lsn, "replication stream established");
            let mut last_status = Instant::now();

            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            info!("cdc manager stopping");
                            let _ = stream.send_status_update(self.applied_lsn).await;
                            return Ok(self.applied_lsn);
                        }
                    }
                    received = stream.receive(RECEIVE_TIMEOUT) => {
                        match received {
                            Ok(None) => {
                                // Timeout tick; volunteer a status update.
                                if last_status.elapsed() >= STATUS_INTERVAL {
                                    if let Err(e) = stream.send_status_update(self.applied_lsn).await {
                                        error_count += 1;
                                        self.report_stream_error(&e, error_count, &mut shutdown).await;
                                        continue 'reconnect;
                                    }
                                    last_status = Instant::now();
                                }
                            }
                            Ok(Some(frame)) => {
                                match self.process_frame(&mut stream, &frame).await {
                                    Ok(()) => {
                                        error_count = 0;
                                        if last_status.elapsed() >= STATUS_INTERVAL {
                                            let _ = stream.send_status_update(self.applied_lsn).await;
                                            last_status = Instant::now();
                                        }
                                    }
                                    Err(e) => {
                                        error_count += 1;
                                        self.report_stream_error(&e, error_count, &mut shutdown).await;
                                        continue 'reconnect;
                                    }
                                }
                            }
                            Err(e) => {
                                error_count += 1;
                                self.report_stream_error(&e, error_count, &mut shutdown).await;
                                continue 'reconnect;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Decode one frame and dispatch any row event it carries.
    async fn process_frame<S: ReplicationStream>(
        &mut self,
        stream: &mut S,
        frame: &[u8],
    ) -> Result<(), CdcError> {
        match parse_frame(frame)? {
            ReplicationFrame::Keepalive {
                wal_end,
                reply_requested,
            } => {
                debug!(%wal_end, reply_requested, "keepalive");
                if reply_requested {
                    stream.send_status_update(self.applied_lsn).await?;
                }
                Ok(())
            }
            ReplicationFrame::XLogData {
                wal_start,
                wal_end,
                data,
            } => {
                match parse_logical(&data)? {
                    LogicalMessage::Relation(relation) => {
                        debug!(
                            relation_id = relation.id,
                            table = %relation.name,
                            columns = relation.columns.len(),
                            "relation descriptor"
                        );
                        self.relations.insert(relation.id, relation);
                    }
                    LogicalMessage::Insert { relation_id, new } => {
                        let event =
                            self.build_event(relation_id, Operation::Insert, Some(new), None, wal_start)?;
                        self.dispatch_and_advance(event, wal_end).await?;
                    }
                    LogicalMessage::Update {
                        relation_id,
                        old,
                        new,
                    } => {
                        let event =
                            self.build_event(relation_id, Operation::Update, Some(new), old, wal_start)?;
                        self.dispatch_and_advance(event, wal_end).await?;
                    }
                    LogicalMessage::Delete { relation_id, old } => {
                        let event =
                            self.build_event(relation_id, Operation::Delete, None, Some(old), wal_start)?;
                        self.dispatch_and_advance(event, wal_end).await?;
                    }
                    LogicalMessage::Begin { .. } | LogicalMessage::Commit { .. } => {
                        // Transaction markers: the row events carry their own
                        // positions; nothing to do beyond keeping order.
                        self.applied_lsn = self.applied_lsn.max(wal_end);
                    }
                    LogicalMessage::Other(tag) => {
                        debug!(tag, "ignoring logical message");
                    }
                }
                Ok(())
            }
        }
    }

    /// Assemble a `ChangeEvent` from a decoded tuple, resolving the
    /// relation descriptor and extracting the key columns.
    fn build_event(
        &self,
        relation_id: u32,
        operation: Operation,
        new: Option<Tuple>,
        old: Option<Tuple>,
        lsn: Lsn,
    ) -> Result<ChangeEvent, CdcError> {
        let relation = self
            .relations
            .get(&relation_id)
            .ok_or(CdcError::UnknownRelation(relation_id))?;

        let new_data = new.map(|t| tuple_to_row(relation, &t)).unwrap_or_default();
        let old_data = old.map(|t| tuple_to_row(relation, &t)).unwrap_or_default();

        // Key columns come from whichever image carries them.
        let key_source: &Row = if new_data.is_empty() { &old_data } else { &new_data };
        let primary_key: Row = relation
            .columns
            .iter()
            .filter(|c| c.is_key())
            .filter_map(|c| {
                key_source
                    .get(&c.name)
                    .map(|v| (c.name.clone(), v.clone()))
            })
            .collect();

        Ok(ChangeEvent {
            table_name: relation.name.clone(),
            operation,
            timestamp: Utc::now(),
            new_data,
            old_data,
            primary_key,
            lsn,
        })
    }

    /// Dispatch to every handler in registration order; the first error
    /// aborts dispatch for the event.
    ///
    /// Transient handler failures leave the position untouched so the
    /// event is redelivered after reconnect. Tamper rejections are final
    /// (redelivery can never succeed), so the position advances past the
    /// poison event once the detection has been surfaced.
    async fn dispatch_and_advance(
        &mut self,
        event: ChangeEvent,
        wal_end: Lsn,
    ) -> Result<(), CdcError> {
        for handler in &self.handlers {
            match handler.handle_change(&event).await {
                Ok(()) => {}
                Err(e @ HandlerError::Tamper { .. }) => {
                    error!(
                        table = %event.table_name,
                        operation = %event.operation,
                        error = %e,
                        "tamper event rejected; skipping poison event"
                    );
                    self.applied_lsn = self.applied_lsn.max(wal_end);
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        table = %event.table_name,
                        operation = %event.operation,
                        error = %e,
                        "handler aborted dispatch"
                    );
                    return Err(CdcError::Dispatch(e));
                }
            }
        }

        self.applied_lsn = self.applied_lsn.max(wal_end);
        Ok(())
    }

    /// Log, alert, and back off after a stream-level failure.
    async fn report_stream_error(
        &self,
        error: &CdcError,
        error_count: u32,
        shutdown: &mut watch::Receiver<bool>,
    ) {
        let backoff = Duration::from_secs(2u64.saturating_pow(error_count.min(10))).min(MAX_BACKOFF);
        error!(error = %error, attempt = error_count, backoff = ?backoff, "replication receive failed");

        if let Some(alerts) = &self.alerts {
            if let Err(e) = alerts
                .send_system_alert(
                    "Replication Connection Lost",
                    &format!(
                        "Failed to receive replication message: {error}. Retrying in {backoff:?}..."
                    ),
                    Severity::Danger,
                )
                .await
            {
                warn!(error = %e, "failed to deliver system alert");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = shutdown.changed() => {}
        }
    }
}

/// Map tuple values onto column names. Unchanged TOAST values are omitted.
fn tuple_to_row(relation: &Relation, tuple: &Tuple) -> Row {
    let mut row = Row::new();

    for (column, value) in relation.columns.iter().zip(&tuple.0) {
        match value {
            TupleValue::Null => {
                row.insert(column.name.clone(), FieldValue::Null);
            }
            TupleValue::Text(text) => {
                row.insert(column.name.clone(), FieldValue::Text(text.clone()));
            }
            TupleValue::Unchanged => {}
        }
    }

    row
}
