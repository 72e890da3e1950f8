//! Alert queue consumer.
//!
//! The mailbox is a directory tree: producers deposit fully written
//! files into `pending/` (via a journal-then-rename on their side), the
//! single consumer appends each entry to the append-only `log` and
//! moves it into `archive/`. Archive entries are never deleted.
//!
//! There is no inotify path; a short fixed poll is the liveness
//! mechanism, matching the mailbox's best-effort FIFO semantics.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use tracing::{debug, info, warn};

use vigil_core::config::AlertsConfig;

#[derive(Debug, Clone)]
pub struct AlertConsumer {
    config: AlertsConfig,
}

impl AlertConsumer {
    pub fn new(config: AlertsConfig) -> Self {
        Self { config }
    }

    fn ensure_dirs(&self) -> Result<(), ConsumerError> {
        for dir in [
            self.config.pending_dir(),
            self.config.archive_dir(),
            self.config.journal_dir(),
        ] {
            std::fs::create_dir_all(&dir)
                .map_err(|e| ConsumerError::Io { path: dir, source: e })?;
        }
        Ok(())
    }

    /// Drain the pending directory once, in listing order. Returns the
    /// number of alerts consumed.
    ///
    /// A file that vanishes between enumeration and read was consumed
    /// by a racing actor already and is skipped, not an error.
    pub fn drain_once(&self) -> Result<usize, ConsumerError> {
        let pending = self.config.pending_dir();
        let entries = std::fs::read_dir(&pending).map_err(|e| ConsumerError::Io {
            path: pending.clone(),
            source: e,
        })?;
        let mut names: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .collect();
        names.sort();

        let mut drained = 0;
        for path in names {
            let content = match std::fs::read_to_string(&path) {
                Ok(content) => content,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!(entry = %path.display(), "Pending alert vanished, skipping");
                    continue;
                }
                Err(e) => return Err(ConsumerError::Io { path, source: e }),
            };

            self.append_to_log(&content)?;

            let Some(name) = path.file_name() else {
                continue;
            };
            let archived = self.config.archive_dir().join(name);
            match std::fs::rename(&path, &archived) {
                Ok(()) => {
                    drained += 1;
                    debug!(entry = %archived.display(), "Alert archived");
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(ConsumerError::Io { path, source: e }),
            }
        }
        if drained > 0 {
            info!(drained, "Drained alert queue");
        }
        Ok(drained)
    }

    fn append_to_log(&self, content: &str) -> Result<(), ConsumerError> {
        let log_path = self.config.log_path();
        let mut log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(|e| ConsumerError::Io {
                path: log_path.clone(),
                source: e,
            })?;
        log.write_all(content.as_bytes())
            .map_err(|e| ConsumerError::Io {
                path: log_path,
                source: e,
            })
    }

    /// Run the consumer loop until interrupted.
    pub async fn run(&self) -> Result<(), ConsumerError> {
        self.ensure_dirs()?;
        info!(
            pending = %self.config.pending_dir().display(),
            interval_secs = self.config.poll_interval_secs,
            "Alert consumer started"
        );
        loop {
            if let Err(e) = self.drain_once() {
                // Transient mailbox trouble; the next tick retries.
                warn!(error = %e, "Alert drain failed");
            }
            tokio::select! {
                () = tokio::time::sleep(self.config.poll_interval()) => {}
                result = tokio::signal::ctrl_c() => {
                    result.map_err(|e| ConsumerError::Io {
                        path: PathBuf::new(),
                        source: e,
                    })?;
                    info!("Alert consumer stopping");
                    return Ok(());
                }
            }
        }
    }
}

/// Errors from the alert mailbox.
#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error("Alert mailbox I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use vigil_core::alerts::{AlertMessage, deposit};

    fn config(dir: &tempfile::TempDir) -> AlertsConfig {
        AlertsConfig {
            alerts_root: dir.path().to_path_buf(),
            poll_interval_secs: 1,
        }
    }

    #[test]
    fn drains_pending_into_log_and_archive() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = config(&dir);
        let consumer = AlertConsumer::new(config.clone());
        consumer.ensure_dirs().unwrap();

        std::fs::write(config.pending_dir().join("a"), "alpha\n").unwrap();
        std::fs::write(config.pending_dir().join("b"), "beta\n").unwrap();

        assert_eq!(consumer.drain_once().unwrap(), 2);

        let log = std::fs::read_to_string(config.log_path()).unwrap();
        assert_eq!(log, "alpha\nbeta\n");
        assert!(config.archive_dir().join("a").exists());
        assert!(config.archive_dir().join("b").exists());
        assert_eq!(
            std::fs::read_dir(config.pending_dir()).unwrap().count(),
            0
        );
    }

    #[test]
    fn each_alert_is_logged_exactly_once() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = config(&dir);
        let consumer = AlertConsumer::new(config.clone());
        consumer.ensure_dirs().unwrap();

        for n in 0..5 {
            std::fs::write(config.pending_dir().join(format!("alert-{n}")), format!("line {n}\n"))
                .unwrap();
        }
        assert_eq!(consumer.drain_once().unwrap(), 5);
        // Second drain finds nothing; the log is unchanged.
        assert_eq!(consumer.drain_once().unwrap(), 0);

        let log = std::fs::read_to_string(config.log_path()).unwrap();
        for n in 0..5 {
            assert_eq!(log.matches(&format!("line {n}")).count(), 1);
        }
        // Archive entries survive subsequent drains.
        assert_eq!(std::fs::read_dir(config.archive_dir()).unwrap().count(), 5);
    }

    #[test]
    fn concurrent_deposits_are_logged_exactly_once() {
        use std::time::{Duration, Instant};

        let dir = tempfile::TempDir::new().unwrap();
        let config = config(&dir);
        let consumer = AlertConsumer::new(config.clone());
        consumer.ensure_dirs().unwrap();

        // Producer races the drain loop deposit by deposit.
        let producer_config = config.clone();
        let producer = std::thread::spawn(move || {
            for n in 0..20 {
                let alert = AlertMessage::new(format!("racing alert {n}"));
                deposit(&producer_config, alert).unwrap();
                std::thread::sleep(Duration::from_millis(1));
            }
        });

        let mut drained = 0;
        let deadline = Instant::now() + Duration::from_secs(30);
        while drained < 20 && Instant::now() < deadline {
            drained += consumer.drain_once().unwrap();
            std::thread::sleep(Duration::from_millis(1));
        }
        producer.join().unwrap();
        drained += consumer.drain_once().unwrap();
        assert_eq!(drained, 20);

        let log = std::fs::read_to_string(config.log_path()).unwrap();
        for n in 0..20 {
            // Trailing quote pins the full field value.
            let needle = format!("racing alert {n}\"");
            assert_eq!(log.matches(&needle).count(), 1, "needle: {needle}");
        }
        assert_eq!(std::fs::read_dir(config.archive_dir()).unwrap().count(), 20);
    }

    #[test]
    fn consumes_producer_deposits() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = config(&dir);
        let consumer = AlertConsumer::new(config.clone());
        consumer.ensure_dirs().unwrap();

        let alert = AlertMessage::new("host 10.0.0.1 exposed").with("type", "vulnscan");
        deposit(&config, alert).unwrap();

        assert_eq!(consumer.drain_once().unwrap(), 1);
        let log = std::fs::read_to_string(config.log_path()).unwrap();
        assert!(log.contains("host 10.0.0.1 exposed"));
        assert!(log.ends_with('\n'));
    }

    #[test]
    fn empty_mailbox_is_not_an_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let consumer = AlertConsumer::new(config(&dir));
        consumer.ensure_dirs().unwrap();
        assert_eq!(consumer.drain_once().unwrap(), 0);
    }
}
