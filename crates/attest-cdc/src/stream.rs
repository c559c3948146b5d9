//! The replication transport seam.
//!
//! [`ReplicationStream`] is what the manager loop consumes; the production
//! implementation speaks the streaming replication protocol over a
//! `copy_both` duplex. Tests substitute scripted streams.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio_postgres::{CopyBothDuplex, NoTls};
use tracing::{debug, info, warn};

use crate::error::CdcError;
use crate::event::Lsn;
use crate::manager::CdcConfig;
use crate::protocol::standby_status_update;

/// Duplicate-object SQLSTATE, returned when the slot already exists.
const DUPLICATE_OBJECT: &str = "42710";

/// One open replication session.
#[async_trait]
pub trait ReplicationStream: Send {
    /// Receive the next raw frame. `Ok(None)` is a timeout tick, not an
    /// error.
    async fn receive(&mut self, timeout: Duration) -> Result<Option<Bytes>, CdcError>;

    /// Send a standby status update acknowledging `lsn`.
    async fn send_status_update(&mut self, lsn: Lsn) -> Result<(), CdcError>;
}

/// Creates replication sessions starting from a given position.
///
/// The manager reconnects through this after stream or dispatch failures,
/// which is what turns "position not advanced" into redelivery.
#[async_trait]
pub trait StreamFactory: Send + Sync {
    type Stream: ReplicationStream;

    async fn connect(&self, start: Lsn) -> Result<Self::Stream, CdcError>;
}

/// Production stream over a `copy_both` duplex on a replication
/// connection.
pub struct PgReplicationStream {
    duplex: Pin<Box<CopyBothDuplex<Bytes>>>,
    _client: tokio_postgres::Client,
    connection_task: tokio::task::JoinHandle<()>,
}

impl PgReplicationStream {
    /// Open a replication connection, ensure the slot exists, and start
    /// streaming from `start`.
    pub async fn connect(config: &CdcConfig, start: Lsn) -> Result<Self, CdcError> {
        let conn_str = config.replication_connection_string();
        let (client, connection) = tokio_postgres::connect(&conn_str, NoTls).await?;

        let connection_task = tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(error = %e, "replication connection closed");
            }
        });

        ensure_slot(&client, &config.slot_name).await?;

        let query = format!(
            "START_REPLICATION SLOT {} LOGICAL {} (proto_version '1', publication_names '{}')",
            config.slot_name, start, config.publication_name,
        );
        debug!(slot = %config.slot_name, %start, "starting replication");

        let duplex = client.copy_both_simple::<Bytes>(&query).await?;

        Ok(Self {
            duplex: Box::pin(duplex),
            _client: client,
            connection_task,
        })
    }
}

impl Drop for PgReplicationStream {
    fn drop(&mut self) {
        self.connection_task.abort();
    }
}

#[async_trait]
impl ReplicationStream for PgReplicationStream {
    async fn receive(&mut self, timeout: Duration) -> Result<Option<Bytes>, CdcError> {
        match tokio::time::timeout(timeout, self.duplex.next()).await {
            Err(_elapsed) => Ok(None),
            Ok(Some(Ok(bytes))) => Ok(Some(bytes)),
            Ok(Some(Err(e))) => Err(CdcError::Connection(e)),
            Ok(None) => Err(CdcError::StreamClosed),
        }
    }

    async fn send_status_update(&mut self, lsn: Lsn) -> Result<(), CdcError> {
        let frame = standby_status_update(lsn, false);
        self.duplex
            .send(frame)
            .await
            .map_err(CdcError::Connection)?;
        Ok(())
    }
}

/// Factory for production streams.
pub struct PgStreamFactory {
    config: CdcConfig,
}

impl PgStreamFactory {
    pub fn new(config: CdcConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl StreamFactory for PgStreamFactory {
    type Stream = PgReplicationStream;

    async fn connect(&self, start: Lsn) -> Result<Self::Stream, CdcError> {
        PgReplicationStream::connect(&self.config, start).await
    }
}

/// Create the replication slot if it does not already exist.
async fn ensure_slot(client: &tokio_postgres::Client, slot_name: &str) -> Result<(), CdcError> {
    let command = format!("CREATE_REPLICATION_SLOT {slot_name} LOGICAL pgoutput");

    match client.simple_query(&command).await {
        Ok(_) => {
            info!(slot = %slot_name, "created replication slot");
            Ok(())
        }
        Err(e) => {
            if e.code().map(|c| c.code()) == Some(DUPLICATE_OBJECT) {
                debug!(slot = %slot_name, "replication slot already exists");
                return Ok(());
            }
            Err(CdcError::Connection(e))
        }
    }
}

/// Drop the replication slot. Used by teardown tooling.
pub async fn drop_slot(config: &CdcConfig) -> Result<(), CdcError> {
    let conn_str = config.replication_connection_string();
    let (client, connection) = tokio_postgres::connect(&conn_str, NoTls).await?;
    let task = tokio::spawn(async move {
        let _ = connection.await;
    });

    let result = client
        .simple_query(&format!("DROP_REPLICATION_SLOT {}", config.slot_name))
        .await
        .map(|_| ())
        .map_err(CdcError::Connection);

    task.abort();
    result
}
