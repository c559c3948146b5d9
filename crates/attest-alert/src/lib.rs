//! Alert delivery to a Slack-compatible webhook.
//!
//! Three call shapes: tamper alerts, hash-chain-broken alerts, and system
//! alerts. Delivery failures must never mask detection: callers log the
//! returned error and move on.

use std::time::Duration;

use chrono::Utc;
use serde::Serialize;

/// Errors from alert delivery.
#[derive(Debug, thiserror::Error)]
pub enum AlertError {
    #[error("failed to send alert: {0}")]
    Http(#[from] reqwest::Error),

    #[error("webhook returned status {0}")]
    Status(u16),
}

/// Alert severity, mapped to attachment colors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Good,
    Warning,
    Danger,
}

impl Severity {
    fn color(self) -> &'static str {
        match self {
            Severity::Good => "good",
            Severity::Warning => "warning",
            Severity::Danger => "danger",
        }
    }
}

#[derive(Serialize)]
struct SlackMessage {
    text: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    attachments: Vec<SlackAttachment>,
}

#[derive(Serialize)]
struct SlackAttachment {
    color: String,
    title: String,
    fields: Vec<SlackField>,
    footer: String,
    ts: i64,
}

#[derive(Serialize)]
struct SlackField {
    title: String,
    value: String,
    short: bool,
}

fn field(title: &str, value: impl Into<String>, short: bool) -> SlackField {
    SlackField {
        title: title.to_string(),
        value: value.into(),
        short,
    }
}

/// Webhook-backed alert manager. Disabled instances swallow every call.
pub struct AlertManager {
    enabled: bool,
    webhook_url: String,
    client: reqwest::Client,
}

impl AlertManager {
    pub fn new(enabled: bool, webhook_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();

        Self {
            enabled,
            webhook_url: webhook_url.into(),
            client,
        }
    }

    /// A disabled manager, for wiring when alerts are not configured.
    pub fn disabled() -> Self {
        Self::new(false, "")
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled && !self.webhook_url.is_empty()
    }

    /// Tamper alert: a specific record diverged from the witness history.
    pub async fn send_tamper_alert(
        &self,
        table_name: &str,
        operation: &str,
        record_id: &str,
        details: &str,
    ) -> Result<(), AlertError> {
        let msg = SlackMessage {
            text: "🚨 *TAMPERING DETECTED*".to_string(),
            attachments: vec![SlackAttachment {
                color: Severity::Danger.color().to_string(),
                title: "Database Tampering Alert".to_string(),
                fields: vec![
                    field("Table", table_name, true),
                    field("Operation", operation, true),
                    field("Record ID", record_id, true),
                    field("Details", details, false),
                ],
                footer: "attest tamper detection".to_string(),
                ts: Utc::now().timestamp(),
            }],
        };

        self.post(&msg).await
    }

    /// Hash-chain-broken alert: witness history disagrees with itself.
    pub async fn send_chain_broken_alert(
        &self,
        table_name: &str,
        sequence_num: u64,
        expected_hash: &str,
        actual_hash: &str,
    ) -> Result<(), AlertError> {
        let msg = SlackMessage {
            text: "🚨 *HASH CHAIN INTEGRITY VIOLATION*".to_string(),
            attachments: vec![SlackAttachment {
                color: Severity::Danger.color().to_string(),
                title: "Hash Chain Broken".to_string(),
                fields: vec![
                    field("Table", table_name, true),
                    field("Sequence", sequence_num.to_string(), true),
                    field("Expected Hash", expected_hash, false),
                    field("Actual Hash", actual_hash, false),
                ],
                footer: "attest tamper detection".to_string(),
                ts: Utc::now().timestamp(),
            }],
        };

        self.post(&msg).await
    }

    /// System alert: operational events (replication loss, divergence).
    pub async fn send_system_alert(
        &self,
        title: &str,
        message: &str,
        severity: Severity,
    ) -> Result<(), AlertError> {
        let msg = SlackMessage {
            text: format!("🚨 *SYSTEM ALERT: {title}*"),
            attachments: vec![SlackAttachment {
                color: severity.color().to_string(),
                title: title.to_string(),
                fields: vec![field("Message", message, false)],
                footer: "attest system monitor".to_string(),
                ts: Utc::now().timestamp(),
            }],
        };

        self.post(&msg).await
    }

    async fn post(&self, msg: &SlackMessage) -> Result<(), AlertError> {
        if !self.is_enabled() {
            return Ok(());
        }

        let response = self
            .client
            .post(&self.webhook_url)
            .json(msg)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(AlertError::Status(status.as_u16()));
        }

        Ok(())
    }
}
