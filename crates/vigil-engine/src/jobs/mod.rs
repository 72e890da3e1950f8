//! Job identity, filesystem store and per-job locks.

pub mod lock;
pub mod store;

pub use lock::{LockError, LockManager};
pub use store::{JobStore, RunDir, StoreError};

use std::fmt;
use std::str::FromStr;

/// Stable, opaque identifier of a job.
///
/// Used verbatim as a directory name under the jobs root, so path
/// separators and relative components are rejected at construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobId(String);

impl JobId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for JobId {
    type Err = InvalidJobId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(InvalidJobId::Empty);
        }
        if s == "." || s == ".." || s.contains('/') || s.contains('\\') || s.contains('\0') {
            return Err(InvalidJobId::BadCharacters(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Rejected job identifiers. These are admission errors: no run is
/// created and the caller is told synchronously.
#[derive(Debug, thiserror::Error)]
pub enum InvalidJobId {
    #[error("Job ID is empty")]
    Empty,

    #[error("Job ID contains path components: {0:?}")]
    BadCharacters(String),
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_ids() {
        assert_eq!("42".parse::<JobId>().unwrap().as_str(), "42");
        assert_eq!("nightly-nmap".parse::<JobId>().unwrap().as_str(), "nightly-nmap");
    }

    #[test]
    fn rejects_path_components() {
        assert!("".parse::<JobId>().is_err());
        assert!("..".parse::<JobId>().is_err());
        assert!("a/b".parse::<JobId>().is_err());
        assert!("a\\b".parse::<JobId>().is_err());
    }
}
