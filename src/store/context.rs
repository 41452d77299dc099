//! Session-scoped key/value context rows. Primary key `(session_id, key)`;
//! writes overwrite, and `get`/`get_all` exclude rows whose `expires_at` has
//! passed as of the caller's `now` (a row past its TTL but not yet swept by
//! `prune` must not be visible to a read).

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextRow {
    pub session_id: String,
    pub key: String,
    pub value: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

pub fn upsert(conn: &Connection, row: &ContextRow) -> Result<()> {
    conn.execute(
        "INSERT INTO thrall_context (session_id, key, value, created_at, expires_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(session_id, key) DO UPDATE SET
            value = excluded.value,
            created_at = excluded.created_at,
            expires_at = excluded.expires_at",
        params![
            row.session_id,
            row.key,
            row.value,
            row.created_at.to_rfc3339(),
            row.expires_at.map(|t| t.to_rfc3339()),
        ],
    )?;
    Ok(())
}

fn row_from_sql(row: &rusqlite::Row) -> rusqlite::Result<ContextRow> {
    let created_raw: String = row.get("created_at")?;
    let expires_raw: Option<String> = row.get("expires_at")?;
    Ok(ContextRow {
        session_id: row.get("session_id")?,
        key: row.get("key")?,
        value: row.get("value")?,
        created_at: DateTime::parse_from_rfc3339(&created_raw)
            .unwrap()
            .with_timezone(&Utc),
        expires_at: expires_raw.map(|s| DateTime::parse_from_rfc3339(&s).unwrap().with_timezone(&Utc)),
    })
}

pub fn get(conn: &Connection, session_id: &str, key: &str, now: DateTime<Utc>) -> Result<Option<ContextRow>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM thrall_context WHERE session_id = ?1 AND key = ?2
         AND (expires_at IS NULL OR expires_at >= ?3)",
    )?;
    let mut rows = stmt.query(params![session_id, key, now.to_rfc3339()])?;
    match rows.next()? {
        Some(r) => Ok(Some(row_from_sql(r)?)),
        None => Ok(None),
    }
}

pub fn get_all(conn: &Connection, session_id: &str, now: DateTime<Utc>) -> Result<Vec<ContextRow>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM thrall_context WHERE session_id = ?1
         AND (expires_at IS NULL OR expires_at >= ?2)",
    )?;
    let rows = stmt
        .query_map(params![session_id, now.to_rfc3339()], row_from_sql)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn clear(conn: &Connection, session_id: &str) -> Result<usize> {
    let affected = conn.execute(
        "DELETE FROM thrall_context WHERE session_id = ?1",
        params![session_id],
    )?;
    Ok(affected)
}

pub fn prune(conn: &Connection, now: DateTime<Utc>) -> Result<usize> {
    let affected = conn.execute(
        "DELETE FROM thrall_context WHERE expires_at IS NOT NULL AND expires_at < ?1",
        params![now.to_rfc3339()],
    )?;
    Ok(affected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    #[test]
    fn write_then_overwrite_same_key() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            Store::open_in_memory(dir.path().join("breakers"), dir.path().join("thrall.log")).unwrap();
        let now = Utc::now();
        store
            .set_context(&ContextRow {
                session_id: "sess-A".into(),
                key: "last_error".into(),
                value: "timeout".into(),
                created_at: now,
                expires_at: None,
            })
            .unwrap();
        store
            .set_context(&ContextRow {
                session_id: "sess-A".into(),
                key: "last_error".into(),
                value: "rate_limited".into(),
                created_at: now,
                expires_at: None,
            })
            .unwrap();
        let got = store.get_context("sess-A", "last_error", now).unwrap().unwrap();
        assert_eq!(got.value, "rate_limited");
        assert_eq!(store.get_context_all("sess-A", now).unwrap().len(), 1);
    }

    #[test]
    fn prune_removes_only_expired() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            Store::open_in_memory(dir.path().join("breakers"), dir.path().join("thrall.log")).unwrap();
        let now = Utc::now();
        store
            .set_context(&ContextRow {
                session_id: "s".into(),
                key: "a".into(),
                value: "1".into(),
                created_at: now,
                expires_at: Some(now - chrono::Duration::seconds(1)),
            })
            .unwrap();
        store
            .set_context(&ContextRow {
                session_id: "s".into(),
                key: "b".into(),
                value: "2".into(),
                created_at: now,
                expires_at: None,
            })
            .unwrap();
        let pruned = store.prune_context(now).unwrap();
        assert_eq!(pruned, 1);
        assert_eq!(store.get_context_all("s", now).unwrap().len(), 1);
    }

    #[test]
    fn expired_row_is_excluded_from_reads_before_prune_runs() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            Store::open_in_memory(dir.path().join("breakers"), dir.path().join("thrall.log")).unwrap();
        let now = Utc::now();
        store
            .set_context(&ContextRow {
                session_id: "s".into(),
                key: "stale".into(),
                value: "old".into(),
                created_at: now,
                expires_at: Some(now - chrono::Duration::seconds(1)),
            })
            .unwrap();
        store
            .set_context(&ContextRow {
                session_id: "s".into(),
                key: "fresh".into(),
                value: "new".into(),
                created_at: now,
                expires_at: None,
            })
            .unwrap();
        assert!(store.get_context("s", "stale", now).unwrap().is_none());
        assert!(store.get_context("s", "fresh", now).unwrap().is_some());
        let all = store.get_context_all("s", now).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].key, "fresh");
    }

    #[test]
    fn clear_context_deletes_whole_session() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            Store::open_in_memory(dir.path().join("breakers"), dir.path().join("thrall.log")).unwrap();
        let now = Utc::now();
        store
            .set_context(&ContextRow {
                session_id: "s".into(),
                key: "a".into(),
                value: "1".into(),
                created_at: now,
                expires_at: None,
            })
            .unwrap();
        store.clear_context("s").unwrap();
        assert!(store.get_context_all("s", now).unwrap().is_empty());
    }
}
