//! Action Executor (§4.7): runs a named action's ordered step list. Template
//! resolution runs on every string field before execution; on any step
//! failure the remaining steps abort and the error is both logged and
//! stored in the trace.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::host::PluginContext;
use crate::node_id::NodePrefix;
use crate::store::{ContextRow, Store};
use crate::template::{self, TemplateContext};
use crate::types::ActionStep;

#[derive(Debug, Clone, Serialize)]
pub struct StepTrace {
    pub step: String,
    pub would_execute: bool,
    pub ok: bool,
    pub detail: Option<String>,
    pub error: Option<String>,
    /// Template keys that resolved to empty string for this step (§4.4).
    pub diagnostics: Vec<String>,
}

pub struct ActionOutcome {
    pub trace: Vec<StepTrace>,
    pub aborted: bool,
    /// Set when a `trigger` step ran — the engine re-enters the pipeline
    /// with this synthetic envelope, bounded to a recursion depth of 3.
    pub pending_trigger: Option<(String, HashMap<String, String>)>,
}

struct CompileBuffer {
    entries: Vec<String>,
    created_at: DateTime<Utc>,
}

pub struct ActionExecutor {
    buffers: Mutex<HashMap<String, CompileBuffer>>,
    artifacts_dir: std::path::PathBuf,
    cockpit_url: Option<String>,
    http_client: reqwest::Client,
}

const COMPILE_FLUSH_MAX_AGE_SECONDS: i64 = 3600;

impl ActionExecutor {
    pub fn new(artifacts_dir: std::path::PathBuf, cockpit_url: Option<String>) -> Self {
        Self {
            buffers: Mutex::new(HashMap::new()),
            artifacts_dir,
            cockpit_url,
            http_client: reqwest::Client::new(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn execute(
        &self,
        steps: &[ActionStep],
        manual_mode: bool,
        template_ctx: &TemplateContext,
        store: &Store,
        host: &dyn PluginContext,
        envelope_from: Option<&str>,
        session_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> ActionOutcome {
        let mut trace = Vec::with_capacity(steps.len());
        let mut aborted = false;
        let mut pending_trigger = None;

        for step in steps {
            if manual_mode {
                trace.push(StepTrace {
                    step: step.name().to_string(),
                    would_execute: true,
                    ok: true,
                    detail: Some("mode=manual, not executed".to_string()),
                    error: None,
                    diagnostics: Vec::new(),
                });
                continue;
            }

            let result = self
                .run_step(step, template_ctx, store, host, envelope_from, session_id, now)
                .await;
            match result {
                Ok(StepRunOk::Plain(detail, diagnostics)) => {
                    trace.push(StepTrace {
                        step: step.name().to_string(),
                        would_execute: false,
                        ok: true,
                        detail,
                        error: None,
                        diagnostics,
                    });
                }
                Ok(StepRunOk::Trigger(pipeline, fields, diagnostics)) => {
                    trace.push(StepTrace {
                        step: step.name().to_string(),
                        would_execute: false,
                        ok: true,
                        detail: Some(format!("triggered '{pipeline}'")),
                        error: None,
                        diagnostics,
                    });
                    pending_trigger = Some((pipeline, fields));
                }
                Err(e) => {
                    host.log(&format!("action step '{}' failed: {e}", step.name()));
                    trace.push(StepTrace {
                        step: step.name().to_string(),
                        would_execute: false,
                        ok: false,
                        detail: None,
                        error: Some(e.clone()),
                        diagnostics: Vec::new(),
                    });
                    aborted = true;
                    break;
                }
            }
        }

        ActionOutcome {
            trace,
            aborted,
            pending_trigger,
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_step(
        &self,
        step: &ActionStep,
        template_ctx: &TemplateContext,
        store: &Store,
        host: &dyn PluginContext,
        envelope_from: Option<&str>,
        session_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<StepRunOk, String> {
        match step {
            ActionStep::Log { message } => {
                let resolved = template::resolve(message, template_ctx);
                host.log(&resolved.text);
                let node_tag = envelope_from.and_then(NodePrefix::from_raw);
                store
                    .event_log
                    .append("log", node_tag.as_ref().map(|p| p.as_str()), &resolved.text)
                    .map_err(|e| e.to_string())?;
                Ok(StepRunOk::Plain(Some(resolved.text), resolved.diagnostics))
            }
            ActionStep::Drop => Ok(StepRunOk::Plain(None, Vec::new())),
            ActionStep::Compile {
                buffer,
                summon_threshold,
                summon_keywords,
            } => {
                let body = template_ctx
                    .envelope
                    .get("body_text")
                    .cloned()
                    .unwrap_or_default();
                let should_flush = self.append_to_buffer(buffer, &body, *summon_threshold, summon_keywords, now)?;
                if should_flush {
                    self.flush_buffer(buffer, now)?;
                    Ok(StepRunOk::Plain(Some(format!("buffer '{buffer}' flushed")), Vec::new()))
                } else {
                    Ok(StepRunOk::Plain(Some(format!("appended to buffer '{buffer}'")), Vec::new()))
                }
            }
            ActionStep::Summon { note } => {
                let (body, diagnostics) = match note {
                    Some(n) => {
                        let resolved = template::resolve(n, template_ctx);
                        (resolved.text, resolved.diagnostics)
                    }
                    None => ("thrall: envelope summoned".to_string(), Vec::new()),
                };
                host.send_mail(host.node_id(), "thrall_summon", &body, session_id, true)
                    .await?;
                Ok(StepRunOk::Plain(Some(body), diagnostics))
            }
            ActionStep::Reply { template } => {
                let resolved = template::resolve(template, template_ctx);
                let to = envelope_from.ok_or_else(|| "reply step with no from_node on envelope".to_string())?;
                host.send_mail(to, "thrall_reply", &resolved.text, session_id, false)
                    .await?;
                Ok(StepRunOk::Plain(Some(resolved.text), resolved.diagnostics))
            }
            ActionStep::Act {
                skill,
                input,
                error_buffer,
            } => {
                let (resolved_input, diag) = template::resolve_map(input, template_ctx);
                match self.call_cockpit(skill, &resolved_input, host).await {
                    Ok(()) => Ok(StepRunOk::Plain(Some(format!("called skill '{skill}'")), diag)),
                    Err(e) => {
                        if let Some(buf) = error_buffer {
                            let _ = self.append_to_buffer(buf, &e, None, &[], now);
                        }
                        Err(e)
                    }
                }
            }
            ActionStep::SetContext {
                key,
                value,
                ttl_seconds,
            } => {
                let session = session_id.ok_or_else(|| "set_context requires a session_id".to_string())?;
                let resolved = template::resolve(value, template_ctx);
                store
                    .set_context(&ContextRow {
                        session_id: session.to_string(),
                        key: key.clone(),
                        value: resolved.text,
                        created_at: now,
                        expires_at: ttl_seconds.map(|s| now + chrono::Duration::seconds(s as i64)),
                    })
                    .map_err(|e| e.to_string())?;
                Ok(StepRunOk::Plain(None, resolved.diagnostics))
            }
            ActionStep::ClearContext => {
                let session = session_id.ok_or_else(|| "clear_context requires a session_id".to_string())?;
                store.clear_context(session).map_err(|e| e.to_string())?;
                Ok(StepRunOk::Plain(None, Vec::new()))
            }
            ActionStep::SetFlag {
                key,
                value,
                ttl_seconds,
            } => {
                let resolved = template::resolve(value, template_ctx);
                store
                    .flag_set(
                        key,
                        &resolved.text,
                        ttl_seconds.map(|s| now + chrono::Duration::seconds(s as i64)),
                    )
                    .map_err(|e| e.to_string())?;
                Ok(StepRunOk::Plain(None, resolved.diagnostics))
            }
            ActionStep::Trigger { pipeline, fields } => {
                let (resolved, diag) = template::resolve_map(fields, template_ctx);
                Ok(StepRunOk::Trigger(pipeline.clone(), resolved, diag))
            }
        }
    }

    fn append_to_buffer(
        &self,
        buffer: &str,
        body: &str,
        summon_threshold: Option<usize>,
        summon_keywords: &[String],
        now: DateTime<Utc>,
    ) -> Result<bool, String> {
        let mut buffers = self.buffers.lock().unwrap();
        let entry = buffers.entry(buffer.to_string()).or_insert_with(|| CompileBuffer {
            entries: Vec::new(),
            created_at: now,
        });
        entry.entries.push(body.to_string());

        let time_flush = (now - entry.created_at).num_seconds() > COMPILE_FLUSH_MAX_AGE_SECONDS;
        let size_flush = summon_threshold.map(|t| entry.entries.len() >= t).unwrap_or(false);
        let keyword_flush = summon_keywords.iter().any(|kw| body.to_lowercase().contains(&kw.to_lowercase()));
        Ok(time_flush || size_flush || keyword_flush)
    }

    fn flush_buffer(&self, buffer: &str, now: DateTime<Utc>) -> Result<(), String> {
        let mut buffers = self.buffers.lock().unwrap();
        let Some(entry) = buffers.remove(buffer) else {
            return Ok(());
        };
        std::fs::create_dir_all(&self.artifacts_dir).map_err(|e| e.to_string())?;
        let filename = format!("{buffer}-{}.md", now.timestamp());
        let path = self.artifacts_dir.join(&filename);
        let tmp = path.with_extension("md.tmp");
        let mut content = format!("# compiled buffer: {buffer}\n\n");
        for (i, e) in entry.entries.iter().enumerate() {
            content.push_str(&format!("{}. {}\n", i + 1, e));
        }
        std::fs::write(&tmp, content).map_err(|e| e.to_string())?;
        std::fs::rename(&tmp, &path).map_err(|e| e.to_string())?;
        Ok(())
    }

    async fn call_cockpit(
        &self,
        skill: &str,
        input: &HashMap<String, String>,
        host: &dyn PluginContext,
    ) -> Result<(), String> {
        let url = self
            .cockpit_url
            .clone()
            .ok_or_else(|| "no cockpit_url configured".to_string())?;
        let token = host.vault_get("cockpit_token").unwrap_or_default();
        let body = serde_json::json!({ "skill": skill, "input": input });
        let response = self
            .http_client
            .post(url)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            return Err(format!("cockpit call returned {}", response.status()));
        }
        Ok(())
    }
}

enum StepRunOk {
    Plain(Option<String>, Vec<String>),
    Trigger(String, HashMap<String, String>, Vec<String>),
}
