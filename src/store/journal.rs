//! Append-only journal table: one row per envelope processed by a recipe,
//! doubling as the audit log and the regression dataset. Pruned by
//! `ttl_expires`, never by age directly.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{EvalType, Mode};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalRow {
    #[serde(default)]
    pub id: Option<i64>,
    pub ts: DateTime<Utc>,
    pub pipeline: String,
    pub session_id: Option<String>,
    pub from_prefix: Option<String>,
    pub envelope_json: serde_json::Value,
    pub filter_json: Option<serde_json::Value>,
    pub eval_type: EvalType,
    pub eval_result_json: Option<serde_json::Value>,
    pub action_name: Option<String>,
    pub action_trace_json: Option<serde_json::Value>,
    pub wall_ms: i64,
    pub mode: Mode,
    pub reviewed: i8,
    pub correction_json: Option<serde_json::Value>,
    pub ttl_expires: DateTime<Utc>,
}

pub fn insert(conn: &Connection, row: &JournalRow) -> Result<i64> {
    conn.execute(
        "INSERT INTO thrall_journal
            (ts, pipeline, session_id, from_prefix, envelope_json, filter_json, eval_type,
             eval_result_json, action_name, action_trace_json, wall_ms, mode, reviewed,
             correction_json, ttl_expires)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
        params![
            row.ts.to_rfc3339(),
            row.pipeline,
            row.session_id,
            row.from_prefix,
            row.envelope_json.to_string(),
            row.filter_json.as_ref().map(|v| v.to_string()),
            serde_json::to_string(&row.eval_type).unwrap(),
            row.eval_result_json.as_ref().map(|v| v.to_string()),
            row.action_name,
            row.action_trace_json.as_ref().map(|v| v.to_string()),
            row.wall_ms,
            serde_json::to_string(&row.mode).unwrap(),
            row.reviewed,
            row.correction_json.as_ref().map(|v| v.to_string()),
            row.ttl_expires.to_rfc3339(),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn prune(conn: &Connection, now: DateTime<Utc>) -> Result<usize> {
    let affected = conn.execute(
        "DELETE FROM thrall_journal WHERE ttl_expires < ?1",
        params![now.to_rfc3339()],
    )?;
    Ok(affected)
}

fn row_from_sql(row: &rusqlite::Row) -> rusqlite::Result<JournalRow> {
    let eval_type_raw: String = row.get("eval_type")?;
    let mode_raw: String = row.get("mode")?;
    let envelope_raw: String = row.get("envelope_json")?;
    let filter_raw: Option<String> = row.get("filter_json")?;
    let eval_result_raw: Option<String> = row.get("eval_result_json")?;
    let action_trace_raw: Option<String> = row.get("action_trace_json")?;
    let correction_raw: Option<String> = row.get("correction_json")?;
    let ts_raw: String = row.get("ts")?;
    let ttl_raw: String = row.get("ttl_expires")?;
    Ok(JournalRow {
        id: row.get("id")?,
        ts: DateTime::parse_from_rfc3339(&ts_raw)
            .unwrap()
            .with_timezone(&Utc),
        pipeline: row.get("pipeline")?,
        session_id: row.get("session_id")?,
        from_prefix: row.get("from_prefix")?,
        envelope_json: serde_json::from_str(&envelope_raw).unwrap(),
        filter_json: filter_raw.map(|s| serde_json::from_str(&s).unwrap()),
        eval_type: serde_json::from_str(&eval_type_raw).unwrap(),
        eval_result_json: eval_result_raw.map(|s| serde_json::from_str(&s).unwrap()),
        action_name: row.get("action_name")?,
        action_trace_json: action_trace_raw.map(|s| serde_json::from_str(&s).unwrap()),
        wall_ms: row.get("wall_ms")?,
        mode: serde_json::from_str(&mode_raw).unwrap(),
        reviewed: row.get("reviewed")?,
        correction_json: correction_raw.map(|s| serde_json::from_str(&s).unwrap()),
        ttl_expires: DateTime::parse_from_rfc3339(&ttl_raw)
            .unwrap()
            .with_timezone(&Utc),
    })
}

pub fn last(conn: &Connection, pipeline: &str) -> Result<Option<JournalRow>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM thrall_journal WHERE pipeline = ?1 ORDER BY id DESC LIMIT 1",
    )?;
    let row = stmt
        .query_row(params![pipeline], row_from_sql)
        .optional()?;
    Ok(row)
}

pub fn drop_count_since(
    conn: &Connection,
    sender_prefix: &str,
    since: DateTime<Utc>,
) -> Result<u32> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM thrall_classifications
         WHERE from_prefix = ?1 AND ts > ?2 AND json_extract(action_trace_json, '$.final_action') = 'drop'",
        params![sender_prefix, since.to_rfc3339()],
        |r| r.get(0),
    )?;
    Ok(count as u32)
}
