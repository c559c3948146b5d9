//! YAML configuration for the attest daemon.
//!
//! `${VAR}` references in the file are expanded from the environment
//! before parsing, so credentials stay out of the config on disk.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration, parsed from YAML.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseSection,
    pub node: NodeSection,
    pub raft: RaftSection,
    pub hash: HashSection,
    pub protected_tables: Vec<ProtectedTable>,
    pub alerts: AlertsSection,
    pub log: LogSection,
}

/// `database:` section, the upstream Postgres.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DatabaseSection {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    /// Publication spanning the protected tables.
    pub publication: String,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 5432,
            database: String::new(),
            user: String::new(),
            password: String::new(),
            publication: "attest_publication".to_string(),
        }
    }
}

impl DatabaseSection {
    pub fn connection_string(&self) -> String {
        format!(
            "host={} port={} dbname={} user={} password={}",
            self.host, self.port, self.database, self.user, self.password,
        )
    }
}

/// `node:` section, identity and cluster membership.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    pub id: u64,
    pub bind_addr: String,
    pub data_dir: PathBuf,
    pub bootstrap: bool,
    /// Peer node id → raft address.
    pub peers: BTreeMap<u64, String>,
}

/// `raft:` section.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RaftSection {
    /// Rotate leadership on this cadence when set (e.g. `"10m"`).
    pub leadership_transfer_interval: Option<String>,
    /// Self-terminate a follower whose history diverges from consensus.
    pub follower_auto_shutdown: bool,
}

impl RaftSection {
    pub fn transfer_interval(&self) -> Result<Option<Duration>> {
        self.leadership_transfer_interval
            .as_deref()
            .map(|raw| {
                humantime::parse_duration(raw)
                    .with_context(|| format!("invalid leadership_transfer_interval: {raw}"))
            })
            .transpose()
    }
}

/// `hash:` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct HashSection {
    pub algorithm: String,
    /// Field names excluded from record hashing.
    pub exclude_fields: Vec<String>,
}

impl Default for HashSection {
    fn default() -> Self {
        Self {
            algorithm: "sha256".to_string(),
            exclude_fields: attest_hash::DEFAULT_EXCLUDED_FIELDS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// One `protected_tables:` entry.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ProtectedTable {
    pub name: String,
    /// Verification cadence (e.g. `"5m"`); omit for the default.
    pub verify_interval: Option<String>,
}

impl ProtectedTable {
    pub fn parsed_interval(&self) -> Result<Option<Duration>> {
        self.verify_interval
            .as_deref()
            .map(|raw| {
                humantime::parse_duration(raw)
                    .with_context(|| format!("invalid verify_interval for {}: {raw}", self.name))
            })
            .transpose()
    }
}

/// `alerts:` section.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct AlertsSection {
    pub enabled: bool,
    pub slack_webhook: String,
}

/// `log:` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LogSection {
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load and validate a config file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config = Self::from_yaml(&raw)?;
        Ok(config)
    }

    /// Parse config from a YAML string.
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let expanded = expand_env(raw);
        let config: Config = serde_yaml::from_str(&expanded).context("failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.database.host.is_empty() {
            bail!("database.host is required");
        }
        if self.database.database.is_empty() {
            bail!("database.database is required");
        }
        if self.database.user.is_empty() {
            bail!("database.user is required");
        }
        if self.node.id == 0 {
            bail!("node.id is required and must be non-zero");
        }
        if self.node.data_dir.as_os_str().is_empty() {
            bail!("node.data_dir is required");
        }
        if (!self.node.peers.is_empty() || self.node.bootstrap) && self.node.bind_addr.is_empty() {
            bail!("node.bind_addr is required for clustered nodes");
        }

        if !attest_hash::ALGORITHMS.contains(&self.hash.algorithm.as_str()) {
            bail!(
                "invalid hash algorithm: {} (valid options: {})",
                self.hash.algorithm,
                attest_hash::ALGORITHMS.join(", "),
            );
        }

        for table in &self.protected_tables {
            table.parsed_interval()?;
        }
        self.raft.transfer_interval()?;

        Ok(())
    }

    /// Replication slot name for this node.
    pub fn slot_name(&self) -> String {
        format!("attest_{}", self.node.id)
    }

    /// Whether this node participates in a cluster.
    pub fn clustered(&self) -> bool {
        !self.node.peers.is_empty() || self.node.bootstrap
    }
}

/// Expand `${VAR}` references from the environment. Unset variables
/// expand to the empty string.
fn expand_env(raw: &str) -> String {
    let pattern = regex::Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("static regex");
    pattern
        .replace_all(raw, |captures: &regex::Captures<'_>| {
            std::env::var(&captures[1]).unwrap_or_default()
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
database:
  host: localhost
  port: 5433
  database: app
  user: attest
  password: secret
node:
  id: 1
  bind_addr: "127.0.0.1:7000"
  data_dir: /var/lib/attest
  bootstrap: true
  peers:
    2: "127.0.0.1:7001"
    3: "127.0.0.1:7002"
raft:
  leadership_transfer_interval: 10m
  follower_auto_shutdown: true
hash:
  algorithm: blake3
protected_tables:
  - name: audit_logs
    verify_interval: 5m
  - name: payments
alerts:
  enabled: true
  slack_webhook: https://hooks.slack.com/services/T/B/X
log:
  level: debug
"#;

    #[test]
    fn parses_full_config() {
        let config = Config::from_yaml(FULL).unwrap();

        assert_eq!(config.database.host, "localhost");
        assert_eq!(config.database.port, 5433);
        assert_eq!(config.database.publication, "attest_publication");
        assert_eq!(config.node.id, 1);
        assert!(config.node.bootstrap);
        assert_eq!(config.node.peers.len(), 2);
        assert_eq!(
            config.raft.transfer_interval().unwrap(),
            Some(Duration::from_secs(600))
        );
        assert!(config.raft.follower_auto_shutdown);
        assert_eq!(config.hash.algorithm, "blake3");
        assert_eq!(config.protected_tables.len(), 2);
        assert_eq!(
            config.protected_tables[0].parsed_interval().unwrap(),
            Some(Duration::from_secs(300))
        );
        assert!(config.protected_tables[1].parsed_interval().unwrap().is_none());
        assert!(config.alerts.enabled);
        assert_eq!(config.log.level, "debug");
        assert_eq!(config.slot_name(), "attest_1");
        assert!(config.clustered());
    }

    #[test]
    fn minimal_single_node_config() {
        let config = Config::from_yaml(
            r#"
database:
  host: localhost
  database: app
  user: attest
node:
  id: 7
  data_dir: /tmp/attest
"#,
        )
        .unwrap();

        assert_eq!(config.database.port, 5432);
        assert_eq!(config.hash.algorithm, "sha256");
        assert_eq!(
            config.hash.exclude_fields,
            vec!["created_at".to_string(), "updated_at".to_string()]
        );
        assert!(!config.clustered());
        assert_eq!(config.slot_name(), "attest_7");
    }

    #[test]
    fn missing_required_fields_fail() {
        for (yaml, needle) in [
            ("node:\n  id: 1\n  data_dir: /tmp", "database.host"),
            (
                "database:\n  host: h\n  database: d\n  user: u\nnode:\n  data_dir: /tmp",
                "node.id",
            ),
            (
                "database:\n  host: h\n  database: d\n  user: u\nnode:\n  id: 1",
                "node.data_dir",
            ),
        ] {
            let err = Config::from_yaml(yaml).unwrap_err().to_string();
            assert!(err.contains(needle), "expected {needle} in: {err}");
        }
    }

    #[test]
    fn unknown_hash_algorithm_fails() {
        let err = Config::from_yaml(
            r#"
database:
  host: h
  database: d
  user: u
node:
  id: 1
  data_dir: /tmp
hash:
  algorithm: md5
"#,
        )
        .unwrap_err()
        .to_string();
        assert!(err.contains("invalid hash algorithm"));
    }

    #[test]
    fn invalid_interval_fails() {
        let err = Config::from_yaml(
            r#"
database:
  host: h
  database: d
  user: u
node:
  id: 1
  data_dir: /tmp
protected_tables:
  - name: t
    verify_interval: not-a-duration
"#,
        )
        .unwrap_err()
        .to_string();
        assert!(err.contains("verify_interval"));
    }

    #[test]
    fn clustered_node_requires_bind_addr() {
        let err = Config::from_yaml(
            r#"
database:
  host: h
  database: d
  user: u
node:
  id: 1
  data_dir: /tmp
  bootstrap: true
"#,
        )
        .unwrap_err()
        .to_string();
        assert!(err.contains("bind_addr"));
    }

    #[test]
    fn env_references_are_expanded() {
        std::env::set_var("ATTEST_TEST_PASSWORD", "hunter2");
        let config = Config::from_yaml(
            r#"
database:
  host: h
  database: d
  user: u
  password: ${ATTEST_TEST_PASSWORD}
node:
  id: 1
  data_dir: /tmp
"#,
        )
        .unwrap();
        assert_eq!(config.database.password, "hunter2");
    }
}
