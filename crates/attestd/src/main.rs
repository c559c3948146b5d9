//! `attestd`: the attest daemon.
//!
//! Watches committed changes on protected PostgreSQL tables through
//! logical replication, fingerprints every INSERT into a replicated
//! append-only witness store, and periodically re-hashes the live tables
//! against the witness Merkle tree to detect out-of-band modification.
//!
//! # Usage
//!
//! ```text
//! attestd init   --config attest.yaml     # create the data directory
//! attestd start  --config attest.yaml     # run the node
//! attestd status --config attest.yaml     # show witness state
//! attestd verify audit_logs               # one-shot verification
//! attestd version
//! ```

mod config;
mod telemetry;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info, warn};

use attest_alert::AlertManager;
use attest_cdc::{CdcConfig, CdcManager, PgStreamFactory};
use attest_consensus::{ConsensusNode, LeadershipRotator, NodeConfig};
use attest_hash::ContentHasher;
use attest_store::WitnessStore;
use attest_verify::{
    termination_flag, FollowerGuard, MerkleVerifier, PgLiveTable, TableConfig, WitnessHandler,
};

use config::Config;

/// Total grace period for staged shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "attestd", version, about = "PostgreSQL tamper detection daemon")]
struct Cli {
    /// Path to the YAML config file.
    #[arg(long, global = true, default_value = "attest.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the node's data directory and witness store.
    Init,
    /// Start the node.
    Start,
    /// Show node status and per-table witness state.
    Status,
    /// Verify one table (or every protected table) once.
    Verify {
        /// Table to verify; all protected tables when omitted.
        table: Option<String>,
    },
    /// Print version information.
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Version = cli.command {
        println!("{} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let config = Config::load(&cli.config)?;
    telemetry::init(&config.log.level);

    match cli.command {
        Commands::Init => cmd_init(&config),
        Commands::Start => cmd_start(config).await,
        Commands::Status => cmd_status(&config),
        Commands::Verify { table } => cmd_verify(&config, table).await,
        Commands::Version => unreachable!("handled above"),
    }
}

// -----------------------------------------------------------------------
// attestd init
// -----------------------------------------------------------------------

fn cmd_init(config: &Config) -> Result<()> {
    std::fs::create_dir_all(&config.node.data_dir)
        .context("failed to create data directory")?;

    let db_path = config.node.data_dir.join("attest.db");
    WitnessStore::open(&db_path).context("failed to initialize witness store")?;

    println!("Initialized attest node {}", config.node.id);
    println!("Data directory: {}", config.node.data_dir.display());
    println!("Witness store: {}", db_path.display());
    Ok(())
}

// -----------------------------------------------------------------------
// attestd start
// -----------------------------------------------------------------------

async fn cmd_start(config: Config) -> Result<()> {
    info!(
        node_id = config.node.id,
        data_dir = %config.node.data_dir.display(),
        database = %config.database.database,
        clustered = config.clustered(),
        "starting attestd"
    );

    std::fs::create_dir_all(&config.node.data_dir)
        .context("failed to create data directory")?;

    let store = Arc::new(
        WitnessStore::open(config.node.data_dir.join("attest.db"))
            .context("failed to open witness store")?,
    );

    if termination_flag(&store)? {
        bail!(
            "this node previously self-terminated after diverging from the \
             cluster; wipe its state or clear the flag before restarting"
        );
    }

    let hasher = Arc::new(ContentHasher::new(
        &config.hash.algorithm,
        config.hash.exclude_fields.clone(),
    )?);
    info!(algorithm = hasher.algorithm(), "content hasher ready");

    let alerts = Arc::new(AlertManager::new(
        config.alerts.enabled,
        config.alerts.slack_webhook.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // --- Consensus (clustered nodes only) ---
    let consensus = if config.clustered() {
        let guard_tx = shutdown_tx.clone();
        let guard = Arc::new(FollowerGuard::new(
            store.clone(),
            Some(alerts.clone()),
            config.raft.follower_auto_shutdown,
            move || {
                let _ = guard_tx.send(true);
            },
        ));

        let node = ConsensusNode::start(
            NodeConfig {
                node_id: config.node.id,
                bind_addr: config.node.bind_addr.clone(),
                data_dir: config.node.data_dir.clone(),
                bootstrap: config.node.bootstrap,
                peers: config.node.peers.clone(),
            },
            store.clone(),
            Some(guard),
        )
        .await?;

        let leader = node.wait_for_leader(Duration::from_secs(30)).await?;
        info!(leader, "cluster has a leader");
        Some(Arc::new(node))
    } else {
        info!("running in single-node mode");
        None
    };

    // --- Witness handler ---
    let mut handler = WitnessHandler::new(store.clone(), hasher.clone())
        .with_alerts(alerts.clone());
    if let Some(consensus) = &consensus {
        handler = handler.with_consensus(consensus.clone());
    }
    let handler = Arc::new(handler);

    for table in &config.protected_tables {
        handler.add_table(TableConfig {
            name: table.name.clone(),
            verify_interval: table.parsed_interval()?,
        })?;
    }

    // --- Merkle verifier ---
    let live = Arc::new(PgLiveTable::new(config.database.connection_string()));
    let mut verifier = MerkleVerifier::new(store.clone(), hasher.clone(), live)
        .with_alerts(alerts.clone());
    if let Some(consensus) = &consensus {
        verifier = verifier.with_consensus(consensus.clone());
    }
    for table in &config.protected_tables {
        verifier.add_table(TableConfig {
            name: table.name.clone(),
            verify_interval: table.parsed_interval()?,
        })?;
    }
    let verifier_task = tokio::spawn(Arc::new(verifier).run(shutdown_rx.clone()));

    // --- Leadership rotator ---
    if let (Some(consensus), Some(interval)) = (&consensus, config.raft.transfer_interval()?) {
        let rotator = LeadershipRotator::new(consensus.clone(), interval);
        tokio::spawn(rotator.run(shutdown_rx.clone()));
    }

    // --- CDC consumer ---
    let cdc_config = CdcConfig {
        host: config.database.host.clone(),
        port: config.database.port,
        database: config.database.database.clone(),
        user: config.database.user.clone(),
        password: config.database.password.clone(),
        slot_name: config.slot_name(),
        publication_name: config.database.publication.clone(),
    };

    let mut manager = CdcManager::new(cdc_config.clone());
    manager.set_alert_manager(alerts.clone());
    manager.add_handler(handler.clone());
    manager
        .ensure_publication()
        .await
        .context("failed to ensure publication")?;

    let factory = PgStreamFactory::new(cdc_config);
    let cdc_task = tokio::spawn(manager.run(factory, shutdown_rx.clone()));

    info!("attestd is running; press Ctrl+C to stop");

    // --- Wait for a stop signal (operator or follower guard) ---
    let mut stop_rx = shutdown_rx.clone();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupt received"),
        _ = stop_rx.changed() => warn!("internal shutdown requested"),
    }

    // --- Staged shutdown: CDC, consensus, verifier, store ---
    let _ = shutdown_tx.send(true);
    let shutdown = async {
        match cdc_task.await {
            Ok(Ok(lsn)) => info!(applied = %lsn, "cdc consumer stopped"),
            Ok(Err(e)) => error!(error = %e, "cdc consumer failed"),
            Err(e) => error!(error = %e, "cdc task panicked"),
        }
        if let Some(consensus) = &consensus {
            consensus.shutdown().await;
        }
        let _ = verifier_task.await;
    };

    if tokio::time::timeout(SHUTDOWN_GRACE, shutdown).await.is_err() {
        warn!("shutdown grace period exceeded; exiting anyway");
    }

    info!("attestd stopped");
    Ok(())
}

// -----------------------------------------------------------------------
// attestd status
// -----------------------------------------------------------------------

fn cmd_status(config: &Config) -> Result<()> {
    let store = WitnessStore::open(config.node.data_dir.join("attest.db"))
        .context("failed to open witness store")?;

    println!("Node ID: {}", config.node.id);
    println!("Data directory: {}", config.node.data_dir.display());
    if termination_flag(&store)? {
        println!("WARNING: node self-terminated due to divergence");
    }

    println!("\nProtected tables:");
    for table in &config.protected_tables {
        println!("  - {}", table.name);
        match store.latest_hash_entry(&table.name)? {
            Some(latest) => {
                println!("      latest sequence: {}", latest.sequence_num);
                println!("      latest data hash: {}", latest.data_hash);
            }
            None => println!("      no entries yet"),
        }
        if let Some(checkpoint) = store.latest_merkle_checkpoint(&table.name)? {
            println!(
                "      checkpoint: seq {} / {} records ({})",
                checkpoint.sequence_num, checkpoint.record_count, checkpoint.hash_algorithm,
            );
        }
    }

    Ok(())
}

// -----------------------------------------------------------------------
// attestd verify
// -----------------------------------------------------------------------

async fn cmd_verify(config: &Config, table: Option<String>) -> Result<()> {
    let store = Arc::new(
        WitnessStore::open(config.node.data_dir.join("attest.db"))
            .context("failed to open witness store")?,
    );
    let hasher = Arc::new(ContentHasher::new(
        &config.hash.algorithm,
        config.hash.exclude_fields.clone(),
    )?);
    let alerts = Arc::new(AlertManager::new(
        config.alerts.enabled,
        config.alerts.slack_webhook.clone(),
    ));
    let live = Arc::new(PgLiveTable::new(config.database.connection_string()));

    let mut verifier =
        MerkleVerifier::new(store, hasher, live).with_alerts(alerts);

    let tables: Vec<String> = match table {
        Some(name) => vec![name],
        None => config
            .protected_tables
            .iter()
            .map(|t| t.name.clone())
            .collect(),
    };
    for name in &tables {
        verifier.add_table(TableConfig {
            name: name.clone(),
            verify_interval: None,
        })?;
    }

    let mut failures = 0usize;
    for name in &tables {
        print!("Verifying table: {name} ... ");
        match verifier.verify_table(name).await {
            Ok(report) => {
                println!("OK ({} records, root {})", report.record_count, report.merkle_root);
            }
            Err(e) => {
                println!("FAILED");
                eprintln!("  {e}");
                if let attest_verify::VerifyError::Tamper { records, .. } = &e {
                    for record in records {
                        eprintln!("    - {record}");
                    }
                }
                failures += 1;
            }
        }
    }

    if failures > 0 {
        bail!("{failures} of {} tables failed verification", tables.len());
    }
    Ok(())
}
