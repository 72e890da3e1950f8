//! Target-list normalization.
//!
//! Classifies raw target entries (IP address, CIDR, URL, domain, email,
//! file hash) and produces the canonical newline-delimited target list a
//! scan tool consumes. A declared parser kind (`host`, `url`) controls
//! which entry classes are admitted; everything else is dropped with a
//! warning.

use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use tracing::warn;

use crate::error::{Error, Result};

#[allow(clippy::unwrap_used)]
static DETECTOR_IPADDRESS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}$").unwrap()
});

#[allow(clippy::unwrap_used)]
static DETECTOR_CIDR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}/\d{1,2}$").unwrap()
});

#[allow(clippy::unwrap_used)]
static DETECTOR_SHA256: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Fa-f0-9]{64}$").unwrap()
});

#[allow(clippy::unwrap_used)]
static DETECTOR_MD5: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Fa-f0-9]{32}$").unwrap()
});

#[allow(clippy::unwrap_used)]
static DETECTOR_DOMAIN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9]([A-Za-z0-9-]{0,61}[A-Za-z0-9])?(\.[A-Za-z0-9]([A-Za-z0-9-]{0,61}[A-Za-z0-9])?)+$")
        .unwrap()
});

#[allow(clippy::unwrap_used)]
static DETECTOR_EMAIL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9.+-]+@[A-Za-z0-9.-]+\.[a-zA-Z]*$").unwrap()
});

/// Classification of a single target entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    Addr,
    Cidr,
    Url,
    Domain,
    Email,
    FileHash,
    Unknown,
}

/// Classify one raw entry.
pub fn detect(entry: &str) -> TargetKind {
    if DETECTOR_IPADDRESS.is_match(entry) {
        return TargetKind::Addr;
    }
    if DETECTOR_CIDR.is_match(entry) {
        return TargetKind::Cidr;
    }
    if entry.to_lowercase().starts_with("http") {
        return TargetKind::Url;
    }
    if DETECTOR_EMAIL.is_match(entry) {
        return TargetKind::Email;
    }
    if is_domain(entry) {
        return TargetKind::Domain;
    }
    if DETECTOR_SHA256.is_match(entry) || DETECTOR_MD5.is_match(entry) {
        return TargetKind::FileHash;
    }
    TargetKind::Unknown
}

/// Domain check: label syntax plus a non-numeric top-level label, so bare
/// dotted numbers never classify as domains.
fn is_domain(entry: &str) -> bool {
    if !DETECTOR_DOMAIN.is_match(entry) {
        return false;
    }
    entry
        .rsplit('.')
        .next()
        .is_some_and(|tld| !tld.chars().all(|c| c.is_ascii_digit()))
}

/// Declared parser kind for a job's input, naming the target classes the
/// downstream tool accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserKind {
    /// Host-oriented tools: IP addresses, CIDR ranges, domains.
    Host,
    /// URL-oriented tools: http/https endpoints only.
    Url,
}

impl ParserKind {
    /// Whether an entry of the given class is admitted by this kind.
    pub const fn admits(self, kind: TargetKind) -> bool {
        match self {
            Self::Host => matches!(
                kind,
                TargetKind::Addr | TargetKind::Cidr | TargetKind::Domain
            ),
            Self::Url => matches!(kind, TargetKind::Url),
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::Url => "url",
        }
    }
}

impl FromStr for ParserKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "host" => Ok(Self::Host),
            "url" => Ok(Self::Url),
            other => Err(Error::Targets(format!("Unknown parser kind: {other}"))),
        }
    }
}

impl std::fmt::Display for ParserKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalize a raw target list: trim, drop blanks and `#` comments,
/// drop entries the parser kind does not admit, and de-duplicate while
/// preserving first-seen order.
pub fn normalize(raw: &str, kind: ParserKind) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for line in raw.lines() {
        let entry = line.trim();
        if entry.is_empty() || entry.starts_with('#') {
            continue;
        }
        let class = detect(entry);
        if !kind.admits(class) {
            warn!(entry, ?class, parser_kind = %kind, "Dropping entry not admitted by parser kind");
            continue;
        }
        if seen.insert(entry.to_string()) {
            out.push(entry.to_string());
        }
    }
    out
}
