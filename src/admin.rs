//! Prompt Management Interface (§4.9): list/get/load operations against the
//! `thrall_prompts` table, consumed as a plain async skill function rather
//! than a network service (the cockpit and its transport are out of scope
//! here). Reload is wired through a callback registered at construction,
//! not a pointer back into the Config Loader.

use rusqlite::{params, OptionalExtension};

use crate::error::{Result, ThrallError};
use crate::types::Prompt;

/// Required in any prompt pushed through this interface — mirrors the
/// Config Loader's body-text validation but for the trust-tier binding
/// every live prompt is expected to carry.
const TIER_BINDING_PLACEHOLDER: &str = "{{filter.tier}}";

pub struct PromptAdmin<'a> {
    conn: &'a rusqlite::Connection,
    on_reload: Box<dyn Fn() + Send + Sync + 'a>,
}

#[derive(Debug, Clone)]
pub struct PromptSummary {
    pub name: String,
    pub version: u32,
    pub active: bool,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl<'a> PromptAdmin<'a> {
    pub fn new(conn: &'a rusqlite::Connection, on_reload: impl Fn() + Send + Sync + 'a) -> Self {
        Self {
            conn,
            on_reload: Box::new(on_reload),
        }
    }

    pub fn list(&self) -> Result<Vec<PromptSummary>> {
        let mut stmt = self
            .conn
            .prepare("SELECT name, version, active, updated_at FROM thrall_prompts ORDER BY name")?;
        let rows = stmt
            .query_map([], |row| {
                let updated_raw: String = row.get("updated_at")?;
                Ok(PromptSummary {
                    name: row.get("name")?,
                    version: row.get("version")?,
                    active: row.get::<_, i64>("active")? != 0,
                    updated_at: chrono::DateTime::parse_from_rfc3339(&updated_raw)
                        .unwrap()
                        .with_timezone(&chrono::Utc),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn get(&self, name: &str) -> Result<Option<Prompt>> {
        let mut stmt = self
            .conn
            .prepare("SELECT name, version, template_text, model_ref, hash FROM thrall_prompts WHERE name = ?1 AND active = 1")?;
        let prompt = stmt
            .query_row(params![name], |row| {
                Ok(Prompt {
                    name: row.get("name")?,
                    version: row.get("version")?,
                    template_text: row.get("template_text")?,
                    model_ref: row.get("model_ref")?,
                    hash: row.get("hash")?,
                })
            })
            .optional()?;
        Ok(prompt)
    }

    /// Pushes a new version of a prompt and triggers a registry reload.
    /// Rejects content missing the `{tier}` binding before it ever reaches
    /// the database.
    pub fn load(&self, name: &str, template_text: &str, model_ref: &str, pushed_by: &str) -> Result<()> {
        if !template_text.contains(TIER_BINDING_PLACEHOLDER) {
            return Err(ThrallError::Action {
                step: "prompt_load".to_string(),
                reason: format!("template for '{name}' is missing the {TIER_BINDING_PLACEHOLDER} binding"),
            });
        }
        let hash = Prompt::compute_hash(template_text);
        let now = chrono::Utc::now();
        let next_version: u32 = self
            .conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) + 1 FROM thrall_prompts WHERE name = ?1",
                params![name],
                |r| r.get(0),
            )
            .unwrap_or(1);

        self.conn.execute(
            "INSERT INTO thrall_prompts (name, version, template_text, model_ref, hash, active, pushed_by, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?7)
             ON CONFLICT(name) DO UPDATE SET
                version = excluded.version,
                template_text = excluded.template_text,
                model_ref = excluded.model_ref,
                hash = excluded.hash,
                active = 1,
                pushed_by = excluded.pushed_by,
                updated_at = excluded.updated_at",
            params![name, next_version, template_text, model_ref, hash, pushed_by, now.to_rfc3339()],
        )?;

        (self.on_reload)();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn conn() -> rusqlite::Connection {
        let c = rusqlite::Connection::open_in_memory().unwrap();
        c.execute_batch(
            "CREATE TABLE thrall_prompts (
                name TEXT PRIMARY KEY,
                version INTEGER NOT NULL,
                template_text TEXT NOT NULL,
                model_ref TEXT NOT NULL,
                hash TEXT NOT NULL,
                active INTEGER NOT NULL DEFAULT 1,
                pushed_by TEXT,
                updated_at TEXT NOT NULL
            );",
        )
        .unwrap();
        c
    }

    #[test]
    fn rejects_template_missing_tier_binding() {
        let c = conn();
        let admin = PromptAdmin::new(&c, || {});
        let err = admin.load("triage", "no binding here {{envelope.body_text}}", "m1", "admin").unwrap_err();
        assert!(matches!(err, ThrallError::Action { .. }));
    }

    #[test]
    fn load_then_get_round_trips_and_triggers_reload() {
        let c = conn();
        let reloads = AtomicUsize::new(0);
        let admin = PromptAdmin::new(&c, || {
            reloads.fetch_add(1, Ordering::SeqCst);
        });
        admin.load("triage", "classify: {{envelope.body_text}} tier={{filter.tier}}", "m1", "admin").unwrap();
        let got = admin.get("triage").unwrap().unwrap();
        assert_eq!(got.version, 1);
        assert_eq!(reloads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reload_bumps_version_and_keeps_single_active_row() {
        let c = conn();
        let admin = PromptAdmin::new(&c, || {});
        admin.load("triage", "v1 tier={{filter.tier}}", "m1", "admin").unwrap();
        admin.load("triage", "v2 tier={{filter.tier}}", "m1", "admin").unwrap();
        let got = admin.get("triage").unwrap().unwrap();
        assert_eq!(got.version, 2);
        assert_eq!(admin.list().unwrap().len(), 1);
    }

    #[test]
    fn list_reports_all_prompts() {
        let c = conn();
        let admin = PromptAdmin::new(&c, || {});
        admin.load("a", "x tier={{filter.tier}}", "m1", "admin").unwrap();
        admin.load("b", "y tier={{filter.tier}}", "m1", "admin").unwrap();
        assert_eq!(admin.list().unwrap().len(), 2);
    }
}
