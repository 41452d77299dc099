//! Store: the single process-wide SQLite database plus the on-disk breaker
//! files and event log. All mutation happens from the event-loop thread; the
//! inference worker never touches this module directly — it returns a value
//! the engine persists.

pub mod breaker;
pub mod context;
pub mod eventlog;
pub mod journal;

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::Connection;

use crate::error::Result;

pub use breaker::{Breaker, BreakerStore};
pub use context::ContextRow;
pub use eventlog::EventLog;
pub use journal::JournalRow;

pub struct Store {
    conn: Mutex<Connection>,
    pub breakers: BreakerStore,
    pub event_log: EventLog,
}

impl Store {
    pub fn open(plugin_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(plugin_dir)?;
        let conn = Connection::open(plugin_dir.join("thrall.db"))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            breakers: BreakerStore::new(plugin_dir.join("breakers")),
            event_log: EventLog::new(plugin_dir.join("thrall.log")),
        })
    }

    /// In-memory store for tests; mirrors the schema but never touches disk.
    pub fn open_in_memory(breakers_dir: PathBuf, log_path: PathBuf) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            breakers: BreakerStore::new(breakers_dir),
            event_log: EventLog::new(log_path),
        })
    }

    pub fn insert_journal_row(&self, row: &JournalRow) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        journal::insert(&conn, row)
    }

    pub fn prune_journal(&self, now: chrono::DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        journal::prune(&conn, now)
    }

    pub fn journal_last(&self, pipeline: &str) -> Result<Option<JournalRow>> {
        let conn = self.conn.lock().unwrap();
        journal::last(&conn, pipeline)
    }

    pub fn classifications_drop_count_since(
        &self,
        sender_prefix: &str,
        since: chrono::DateTime<Utc>,
    ) -> Result<u32> {
        let conn = self.conn.lock().unwrap();
        journal::drop_count_since(&conn, sender_prefix, since)
    }

    pub fn set_context(&self, row: &ContextRow) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        context::upsert(&conn, row)
    }

    pub fn get_context(&self, session_id: &str, key: &str, now: chrono::DateTime<Utc>) -> Result<Option<ContextRow>> {
        let conn = self.conn.lock().unwrap();
        context::get(&conn, session_id, key, now)
    }

    pub fn get_context_all(&self, session_id: &str, now: chrono::DateTime<Utc>) -> Result<Vec<ContextRow>> {
        let conn = self.conn.lock().unwrap();
        context::get_all(&conn, session_id, now)
    }

    pub fn clear_context(&self, session_id: &str) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        context::clear(&conn, session_id)
    }

    pub fn prune_context(&self, now: chrono::DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        context::prune(&conn, now)
    }

    pub fn cache_get(&self, cache_key: &str, now: chrono::DateTime<Utc>) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT eval_result_json FROM thrall_cache WHERE cache_key = ?1 AND expires_at > ?2",
        )?;
        let mut rows = stmt.query(rusqlite::params![cache_key, now.to_rfc3339()])?;
        if let Some(row) = rows.next()? {
            Ok(Some(row.get(0)?))
        } else {
            Ok(None)
        }
    }

    pub fn cache_set(
        &self,
        cache_key: &str,
        eval_result_json: &str,
        expires_at: chrono::DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO thrall_cache (cache_key, eval_result_json, expires_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(cache_key) DO UPDATE SET eval_result_json = excluded.eval_result_json, expires_at = excluded.expires_at",
            rusqlite::params![cache_key, eval_result_json, expires_at.to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn cooldown_active(&self, cooldown_key: &str, now: chrono::DateTime<Utc>) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT 1 FROM thrall_cooldown WHERE cooldown_key = ?1 AND expires_at > ?2")?;
        Ok(stmt.exists(rusqlite::params![cooldown_key, now.to_rfc3339()])?)
    }

    pub fn cooldown_set(&self, cooldown_key: &str, expires_at: chrono::DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO thrall_cooldown (cooldown_key, expires_at) VALUES (?1, ?2)
             ON CONFLICT(cooldown_key) DO UPDATE SET expires_at = excluded.expires_at",
            rusqlite::params![cooldown_key, expires_at.to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn flag_get(&self, key: &str, now: chrono::DateTime<Utc>) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT value FROM thrall_flags WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)")?;
        let mut rows = stmt.query(rusqlite::params![key, now.to_rfc3339()])?;
        if let Some(row) = rows.next()? {
            Ok(Some(row.get(0)?))
        } else {
            Ok(None)
        }
    }

    pub fn flag_set(
        &self,
        key: &str,
        value: &str,
        expires_at: Option<chrono::DateTime<Utc>>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO thrall_flags (key, value, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at",
            rusqlite::params![key, value, expires_at.map(|t| t.to_rfc3339())],
        )?;
        Ok(())
    }
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS thrall_journal (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            ts TEXT NOT NULL,
            pipeline TEXT NOT NULL,
            session_id TEXT,
            from_prefix TEXT,
            envelope_json TEXT NOT NULL,
            filter_json TEXT,
            eval_type TEXT NOT NULL,
            eval_result_json TEXT,
            action_name TEXT,
            action_trace_json TEXT,
            wall_ms INTEGER NOT NULL,
            mode TEXT NOT NULL,
            reviewed INTEGER NOT NULL DEFAULT 0,
            correction_json TEXT,
            ttl_expires TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_journal_ttl ON thrall_journal(ttl_expires);
        CREATE INDEX IF NOT EXISTS idx_journal_pipeline ON thrall_journal(pipeline, ts);
        CREATE INDEX IF NOT EXISTS idx_journal_from_prefix ON thrall_journal(from_prefix, ts);

        CREATE VIEW IF NOT EXISTS thrall_classifications AS
            SELECT * FROM thrall_journal WHERE pipeline = 'mail-triage';

        CREATE TABLE IF NOT EXISTS thrall_context (
            session_id TEXT NOT NULL,
            key TEXT NOT NULL,
            value TEXT NOT NULL,
            created_at TEXT NOT NULL,
            expires_at TEXT,
            PRIMARY KEY (session_id, key)
        );

        CREATE TABLE IF NOT EXISTS thrall_prompts (
            name TEXT PRIMARY KEY,
            version INTEGER NOT NULL,
            template_text TEXT NOT NULL,
            model_ref TEXT NOT NULL,
            hash TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            pushed_by TEXT,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS thrall_cache (
            cache_key TEXT PRIMARY KEY,
            eval_result_json TEXT NOT NULL,
            expires_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS thrall_cooldown (
            cooldown_key TEXT PRIMARY KEY,
            expires_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS thrall_flags (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            expires_at TEXT
        );
        "#,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> Store {
        let dir = tempfile::tempdir().unwrap();
        Store::open_in_memory(dir.path().join("breakers"), dir.path().join("thrall.log")).unwrap()
    }

    #[test]
    fn schema_creates_without_error() {
        let _ = test_store();
    }

    #[test]
    fn cache_roundtrip_respects_expiry() {
        let store = test_store();
        let now = Utc::now();
        store
            .cache_set("k1", "{\"action\":\"wake\"}", now + chrono::Duration::seconds(60))
            .unwrap();
        assert!(store.cache_get("k1", now).unwrap().is_some());
        assert!(store
            .cache_get("k1", now + chrono::Duration::seconds(120))
            .unwrap()
            .is_none());
    }

    #[test]
    fn cooldown_roundtrip() {
        let store = test_store();
        let now = Utc::now();
        assert!(!store.cooldown_active("c1", now).unwrap());
        store
            .cooldown_set("c1", now + chrono::Duration::seconds(30))
            .unwrap();
        assert!(store.cooldown_active("c1", now).unwrap());
        assert!(!store
            .cooldown_active("c1", now + chrono::Duration::seconds(60))
            .unwrap());
    }

    #[test]
    fn flag_roundtrip_with_no_expiry() {
        let store = test_store();
        let now = Utc::now();
        assert!(store.flag_get("knock:abc", now).unwrap().is_none());
        store.flag_set("knock:abc", "1", None).unwrap();
        assert_eq!(store.flag_get("knock:abc", now).unwrap(), Some("1".into()));
    }
}
