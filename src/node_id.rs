//! Validation of sender node identifiers.
//!
//! Every place in Thrall that turns a sender id into a filesystem path, a SQL
//! parameter, or a log tag goes through [`NodePrefix`] first. Nothing else is
//! allowed to touch `from_node` directly for those purposes — see the
//! invariant in the data model: no classification ever uses `from_node`
//! beyond the validated 16-hex prefix.

use std::fmt;

pub const PREFIX_LEN: usize = 16;

/// A validated, lowercase, exactly-16-character hex prefix of a sender id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodePrefix(String);

impl NodePrefix {
    /// Validates and extracts the 16-hex-char prefix of a raw sender id.
    ///
    /// Returns `None` for anything shorter than 16 chars or containing a
    /// non-hex character in its first 16 — this is the one gate the rest of
    /// the system relies on for path and query safety.
    pub fn from_raw(raw: &str) -> Option<Self> {
        if raw.len() < PREFIX_LEN {
            return None;
        }
        let prefix: String = raw.chars().take(PREFIX_LEN).collect();
        if prefix.len() != PREFIX_LEN {
            return None;
        }
        if !prefix.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        Some(Self(prefix.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodePrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A breaker target is either a validated node prefix or the literal string
/// `global`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BreakerTarget {
    Global,
    Sender(NodePrefix),
}

impl BreakerTarget {
    pub fn parse(raw: &str) -> Option<Self> {
        if raw == "global" {
            return Some(BreakerTarget::Global);
        }
        // A breaker target file name is the bare prefix already, not a
        // longer raw sender id, so it must be exactly 16 hex chars.
        if raw.len() == PREFIX_LEN && raw.chars().all(|c| c.is_ascii_hexdigit()) {
            return Some(BreakerTarget::Sender(NodePrefix(raw.to_ascii_lowercase())));
        }
        None
    }

    pub fn file_stem(&self) -> String {
        match self {
            BreakerTarget::Global => "global".to_string(),
            BreakerTarget::Sender(p) => p.to_string(),
        }
    }
}

impl fmt::Display for BreakerTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.file_stem())
    }
}
