//! Breaker files: a per-sender (or global) block that suppresses all
//! downstream processing until it expires. Persisted as
//! `breakers/<target>.json`, one writer at a time from the event loop;
//! readers tolerate concurrent deletion (file-missing is a legitimate
//! outcome, not an error).

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::node_id::BreakerTarget;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Breaker {
    #[serde(rename = "type")]
    pub breaker_type: String,
    pub target: String,
    pub reason: String,
    pub tripped_at: DateTime<Utc>,
    pub trip_count: u32,
    pub auto_expire_seconds: u64,
    pub expires_at: DateTime<Utc>,
}

impl Breaker {
    pub fn new(target: &BreakerTarget, reason: &str, auto_expire_seconds: u64, now: DateTime<Utc>) -> Self {
        Self {
            breaker_type: "loop".to_string(),
            target: target.to_string(),
            reason: reason.to_string(),
            tripped_at: now,
            trip_count: 1,
            auto_expire_seconds,
            expires_at: now + chrono::Duration::seconds(auto_expire_seconds as i64),
        }
    }

    /// Strictly-after semantics: a breaker read exactly at `expires_at` is
    /// still active (§8 boundary behavior).
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        now <= self.expires_at
    }
}

pub struct BreakerStore {
    dir: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum BreakerError {
    #[error("invalid breaker target")]
    InvalidTarget,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BreakerStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn path_for(&self, target: &BreakerTarget) -> PathBuf {
        self.dir.join(format!("{}.json", target.file_stem()))
    }

    /// Read a breaker by raw target string. Rejects anything that doesn't
    /// validate as `global` or a 16-hex prefix before it ever becomes a
    /// path — the security invariant this module exists to enforce.
    pub fn read(&self, raw_target: &str) -> Result<Option<Breaker>, BreakerError> {
        let target = BreakerTarget::parse(raw_target).ok_or(BreakerError::InvalidTarget)?;
        self.read_validated(&target)
    }

    pub fn read_validated(&self, target: &BreakerTarget) -> Result<Option<Breaker>, BreakerError> {
        let path = self.path_for(target);
        match fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str::<Breaker>(&text) {
                Ok(breaker) => Ok(Some(breaker)),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "breaker file invalid json, skipping");
                    Ok(None)
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(BreakerError::Io(e)),
        }
    }

    pub fn write(&self, breaker: &Breaker) -> Result<(), BreakerError> {
        let target = BreakerTarget::parse(&breaker.target).ok_or(BreakerError::InvalidTarget)?;
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(&target);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(breaker)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn remove(&self, target: &BreakerTarget) -> Result<(), BreakerError> {
        let path = self.path_for(target);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BreakerError::Io(e)),
        }
    }

    /// Returns the active breaker (global or matching sender prefix) that
    /// should block this sender right now, if any. Expired breakers found
    /// along the way are deleted, per the error-handling policy table.
    pub fn active_for(
        &self,
        sender: Option<&crate::node_id::NodePrefix>,
        now: DateTime<Utc>,
    ) -> Result<Option<Breaker>, BreakerError> {
        if let Some(global) = self.read_validated(&BreakerTarget::Global)? {
            if global.is_active(now) {
                return Ok(Some(global));
            }
            self.remove(&BreakerTarget::Global)?;
        }
        if let Some(prefix) = sender {
            let target = BreakerTarget::Sender(prefix.clone());
            if let Some(breaker) = self.read_validated(&target)? {
                if breaker.is_active(now) {
                    return Ok(Some(breaker));
                }
                self.remove(&target)?;
            }
        }
        Ok(None)
    }

    pub fn list_dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node_id::NodePrefix;

    fn store() -> (tempfile::TempDir, BreakerStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = BreakerStore::new(dir.path().join("breakers"));
        (dir, store)
    }

    #[test]
    fn rejects_path_traversal_target() {
        let (_dir, store) = store();
        assert!(matches!(
            store.read("../../etc/passwd"),
            Err(BreakerError::InvalidTarget)
        ));
    }

    #[test]
    fn write_then_read_round_trips() {
        let (_dir, store) = store();
        let target = BreakerTarget::Sender(NodePrefix::from_raw("6f5185865618575fdead").unwrap());
        let breaker = Breaker::new(&target, "loop_threshold_exceeded", 3600, Utc::now());
        store.write(&breaker).unwrap();
        let got = store.read(&target.file_stem()).unwrap().unwrap();
        assert_eq!(got.trip_count, 1);
        assert_eq!(got.auto_expire_seconds, 3600);
    }

    #[test]
    fn missing_file_is_none_not_error() {
        let (_dir, store) = store();
        let target = BreakerTarget::Sender(NodePrefix::from_raw("6f5185865618575fdead").unwrap());
        assert!(store.read_validated(&target).unwrap().is_none());
    }

    #[test]
    fn invalid_json_is_skipped_and_logged() {
        let (_dir, store) = store();
        fs::create_dir_all(store.list_dir()).unwrap();
        fs::write(store.list_dir().join("6f5185865618575f.json"), b"{not json").unwrap();
        assert!(store.read("6f5185865618575f").unwrap().is_none());
    }

    #[test]
    fn expiry_is_strict_boundary() {
        let target = BreakerTarget::Sender(NodePrefix::from_raw("6f5185865618575fdead").unwrap());
        let now = Utc::now();
        let breaker = Breaker::new(&target, "x", 3600, now - chrono::Duration::seconds(3599));
        assert!(breaker.is_active(now));
        let expired = Breaker::new(&target, "x", 3600, now - chrono::Duration::seconds(3601));
        assert!(!expired.is_active(now));
    }

    #[test]
    fn active_for_cleans_up_expired_global_breaker() {
        let (_dir, store) = store();
        let expired = Breaker::new(
            &BreakerTarget::Global,
            "x",
            1,
            Utc::now() - chrono::Duration::seconds(10),
        );
        store.write(&expired).unwrap();
        assert!(store.active_for(None, Utc::now()).unwrap().is_none());
        assert!(store
            .read_validated(&BreakerTarget::Global)
            .unwrap()
            .is_none());
    }
}
