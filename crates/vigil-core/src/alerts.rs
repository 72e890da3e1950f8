//! Alert message model and producer-side queue deposit.
//!
//! Alerts are an immutable JSON payload dropped into a directory-based
//! mailbox. Producers write into `journal/` under a content hash, then
//! rename into `pending/`, so the single consumer never observes a
//! half-written message. The consumer side lives in the engine crate.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::AlertsConfig;
use crate::error::{Error, Result};

/// One alert message: an ordered map of string fields.
///
/// Kept as a flat map rather than a fixed struct because producers attach
/// arbitrary context (url, dictionary, scope, severity, ...).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AlertMessage(pub BTreeMap<String, String>);

impl AlertMessage {
    pub fn new(message: impl Into<String>) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert("message".to_string(), message.into());
        Self(fields)
    }

    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Stamp the current wall-clock time into the payload.
    fn stamp(&mut self, now: SystemTime) {
        let secs = now
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        self.0.insert("timestamp".to_string(), format!("{secs:.6}"));
    }
}

/// Deposit an alert into the pending queue.
///
/// Creates `journal/`, `pending/` and `archive/` as needed, writes the
/// JSON payload (newline-terminated, so plain shell monitors print it
/// cleanly) into the journal under its SHA-256 content hash, then moves
/// it into `pending/` for the consumer. Returns the queue entry name.
pub fn deposit(config: &AlertsConfig, mut alert: AlertMessage) -> Result<String> {
    deposit_at(config, &mut alert, SystemTime::now())
}

fn deposit_at(config: &AlertsConfig, alert: &mut AlertMessage, now: SystemTime) -> Result<String> {
    let journal = config.journal_dir();
    let pending = config.pending_dir();
    let archive = config.archive_dir();
    for dir in [&journal, &pending, &archive] {
        std::fs::create_dir_all(dir)?;
    }

    alert.stamp(now);
    let mut payload = serde_json::to_string(alert)?;
    payload.push('\n');

    let name = hex::encode(Sha256::digest(payload.as_bytes()));
    let journal_path = journal.join(&name);
    std::fs::write(&journal_path, &payload)?;

    // Written fully, now make it visible to the consumer.
    rename_into(&journal_path, &pending.join(&name))?;
    debug!(entry = %name, "Deposited alert into pending queue");
    Ok(name)
}

fn rename_into(from: &Path, to: &Path) -> Result<()> {
    std::fs::rename(from, to).map_err(|e| {
        Error::Alert(format!(
            "Failed to move {} to {}: {}",
            from.display(),
            to.display(),
            e
        ))
    })
}
