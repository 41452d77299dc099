//! Pipeline Engine (§4.1): `TRIGGER → FILTER → EVALUATE → ACTION`, one
//! envelope through every enabled recipe whose trigger matches, in lexical
//! file-name order. A failure in one recipe is logged and the engine moves
//! on to the next recipe; it never aborts the whole envelope.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::action::ActionExecutor;
use crate::config::ThrallConfig;
use crate::config_loader::Registry;
use crate::error::Result;
use crate::evaluator::hotwire;
use crate::evaluator::llm::{EvalOutcome as LlmOutcome, LlmEvaluator};
use crate::filter::{cache_key, FilterDecision, FilterOutcome, FilterStage};
use crate::host::PluginContext;
use crate::loop_guard::LoopGuard;
use crate::node_id::NodePrefix;
use crate::store::{JournalRow, Store};
use crate::template::TemplateContext;
use crate::types::{Envelope, EvalType, Evaluate, Mode, Recipe};

const MAX_TRIGGER_DEPTH: u8 = 3;

fn filter_decision_tag(decision: &FilterDecision) -> &'static str {
    match decision {
        FilterDecision::Pass => "pass",
        FilterDecision::Skip(_) => "skip",
        FilterDecision::Drop(_) => "drop",
        FilterDecision::Bypass(_) => "bypass",
    }
}

/// A `Drop`/`Skip` reason from the breaker pre-gate (`filter.rs`'s step 1,
/// `"breaker_active:<breaker reason>"`) maps to a distinguishing
/// `action_name` so journal consumers can tell a loop-guard-tripped breaker
/// apart from any other breaker without parsing `eval_result_json`.
fn breaker_drop_action_name(reason: &str) -> Option<String> {
    let breaker_reason = reason.strip_prefix("breaker_active:")?;
    if breaker_reason == crate::loop_guard::LOOP_BREAKER_REASON {
        Some("loop_blocked".to_string())
    } else {
        Some("breaker_blocked".to_string())
    }
}

pub struct Pipeline {
    config: ThrallConfig,
    store: Store,
    filter_stage: FilterStage,
    llm: LlmEvaluator,
    loop_guard: LoopGuard,
    actions: ActionExecutor,
    /// Overall wall-clock budget for one recipe run: `queue_timeout +
    /// inference_timeout + action_timeout` (§5). Exceeding it aborts the run
    /// at the next cooperative point and journals a `run_timeout` row.
    run_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub recipe: String,
    pub journal_id: i64,
    pub eval_type: EvalType,
    pub action_name: Option<String>,
    pub breaker_tripped: bool,
}

/// Result of [`Pipeline::dryrun`]: Filter + Evaluate only, no action runs and
/// nothing is journaled.
#[derive(Debug, Clone)]
pub struct DryrunOutcome {
    pub recipe: String,
    pub decision: FilterDecision,
    pub eval_type: EvalType,
    pub action_name: Option<String>,
}

impl Pipeline {
    pub fn new(config: ThrallConfig, store: Store, llm: LlmEvaluator, artifacts_dir: std::path::PathBuf) -> Self {
        let loop_guard = LoopGuard::new(
            config.loop_threshold,
            config.loop_threshold_sessionless,
            config.knock_threshold,
            config.max_counter_entries,
        );
        let filter_stage = FilterStage::new(config.max_counter_entries);
        let actions = ActionExecutor::new(artifacts_dir, config.cockpit_url.clone());
        let run_timeout = llm.queue_timeout() + llm.inference_timeout() + Duration::from_secs_f64(config.action_timeout_seconds);
        Self {
            config,
            store,
            filter_stage,
            llm,
            loop_guard,
            actions,
            run_timeout,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Marks `sender` solicited within `session_key` — called by the host
    /// when it sends mail to a peer outside of a recipe-driven reply (e.g.
    /// the agent core speaking first), so the Loop Guard doubles that
    /// sender's effective wake threshold for the reply it's expecting back.
    pub fn record_outbound_send(&self, sender: &NodePrefix, session_key: &str, now: DateTime<Utc>) {
        self.loop_guard.record_send(sender, session_key, now);
    }

    pub async fn handle_envelope(
        &self,
        envelope: Envelope,
        registry: &Arc<Registry>,
        host: &dyn PluginContext,
        now: DateTime<Utc>,
    ) -> Result<Vec<RunOutcome>> {
        let mut outcomes = Vec::new();
        for recipe in &registry.recipes {
            if !recipe.enabled || recipe.trigger.kind() != envelope.trigger_kind() {
                continue;
            }
            if !recipe.trigger.matches(&envelope) {
                continue;
            }
            match self
                .run_recipe(recipe, &envelope, registry, host, now, 0, None)
                .await
            {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => host.log(&format!("recipe '{}' failed: {e}", recipe.name)),
            }
        }
        Ok(outcomes)
    }

    /// Re-runs Filter + Evaluate for one recipe against a live context
    /// snapshot, without executing actions or writing a journal row. Used to
    /// replay a past envelope and see what Thrall would decide today.
    pub async fn dryrun(
        &self,
        recipe: &Recipe,
        envelope: &Envelope,
        registry: &Arc<Registry>,
        now: DateTime<Utc>,
    ) -> Result<DryrunOutcome> {
        let prompt_hash = match &recipe.evaluate {
            Evaluate::Llm { prompt, .. } => registry.prompt(prompt).map(|p| p.hash.clone()),
            Evaluate::Hotwire { .. } => None,
        };
        let filter_outcome = self.filter_stage.evaluate(
            &recipe.filter,
            &registry.trust_tiers,
            &self.store,
            envelope,
            prompt_hash.as_deref(),
            now,
        )?;
        let template_ctx = self.build_template_context(envelope, &filter_outcome, None);
        let (eval_type, action_name, _json) = match &filter_outcome.decision {
            FilterDecision::Drop(reason) | FilterDecision::Skip(reason) => {
                (EvalType::Skip, breaker_drop_action_name(reason), Some(serde_json::json!({ "reason": reason })))
            }
            FilterDecision::Bypass(action) => (EvalType::Bypass, Some(action.clone()), None),
            FilterDecision::Pass => {
                if let Some(cached) = &filter_outcome.cached_eval {
                    let action = cached.get("action").and_then(|v| v.as_str()).map(|s| s.to_string());
                    (EvalType::Cache, action, Some(cached.clone()))
                } else {
                    self.run_evaluate(recipe, registry, envelope, &template_ctx, prompt_hash.as_deref(), &filter_outcome, now)
                        .await?
                }
            }
        };
        Ok(DryrunOutcome {
            recipe: recipe.name.clone(),
            decision: filter_outcome.decision,
            eval_type,
            action_name,
        })
    }

    fn build_template_context(
        &self,
        envelope: &Envelope,
        filter_outcome: &FilterOutcome,
        extra_context: Option<&HashMap<String, String>>,
    ) -> TemplateContext {
        let mut context = filter_outcome.context_fields.clone();
        if let Some(extra) = extra_context {
            context.extend(extra.clone());
        }
        TemplateContext {
            envelope: envelope.template_fields(),
            context,
            filter: HashMap::from([("tier".to_string(), filter_outcome.tier.to_string())]),
            ..Default::default()
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_evaluate(
        &self,
        recipe: &Recipe,
        registry: &Arc<Registry>,
        envelope: &Envelope,
        template_ctx: &TemplateContext,
        prompt_hash: Option<&str>,
        filter_outcome: &FilterOutcome,
        now: DateTime<Utc>,
    ) -> Result<(EvalType, Option<String>, Option<serde_json::Value>)> {
        match &recipe.evaluate {
            Evaluate::Hotwire { ruleset } => {
                let Some(set) = registry.hotwire_set(ruleset) else {
                    return Ok((EvalType::Error, None, Some(serde_json::json!({ "reason": "unknown hotwire ruleset" }))));
                };
                let outcome = hotwire::evaluate(set, envelope);
                Ok((
                    EvalType::Hotwire,
                    Some(outcome.action.clone()),
                    Some(serde_json::json!({ "action": outcome.action, "reason": outcome.reason })),
                ))
            }
            Evaluate::Llm {
                prompt,
                model: _,
                fallback_action,
            } => {
                let Some(prompt_entry) = registry.prompt(prompt) else {
                    return Ok((
                        EvalType::Error,
                        Some(fallback_action.clone()),
                        Some(serde_json::json!({ "reason": "unknown prompt" })),
                    ));
                };
                let resolved_prompt = crate::template::resolve(&prompt_entry.template_text, template_ctx);
                let system_prompt = resolved_prompt.text;
                let prompt_diagnostics = resolved_prompt.diagnostics;
                let user_text = envelope.body_text().unwrap_or_default().to_string();
                let valid_actions: std::collections::HashSet<String> = recipe.actions.keys().cloned().collect();

                let outcome = self
                    .llm
                    .classify(system_prompt, user_text, &valid_actions, fallback_action)
                    .await;

                match outcome {
                    LlmOutcome::Success {
                        action,
                        reason,
                        extra,
                        raw_response,
                    } => {
                        if let (Some(ttl), Some(hash)) = (recipe.filter.cache_ttl_seconds, prompt_hash) {
                            if let Some(body) = envelope.body_text() {
                                let key = cache_key(hash, filter_outcome.tier, body);
                                let payload = serde_json::json!({ "action": action, "reason": reason });
                                let _ = self.store.cache_set(&key, &payload.to_string(), now + chrono::Duration::seconds(ttl as i64));
                            }
                        }
                        Ok((
                            EvalType::Llm,
                            Some(action.clone()),
                            Some(serde_json::json!({
                                "action": action,
                                "reason": reason,
                                "extra": extra,
                                "raw_response": raw_response,
                                "prompt_diagnostics": prompt_diagnostics,
                            })),
                        ))
                    }
                    LlmOutcome::Fallback {
                        fallback_action,
                        reason,
                        journal_tag,
                        raw_response,
                    } => Ok((
                        EvalType::Error,
                        Some(fallback_action),
                        Some(serde_json::json!({
                            "reason": reason,
                            "journal_tag": journal_tag,
                            "raw_response": raw_response,
                            "prompt_diagnostics": prompt_diagnostics,
                        })),
                    )),
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_recipe(
        &self,
        recipe: &Recipe,
        envelope: &Envelope,
        registry: &Arc<Registry>,
        host: &dyn PluginContext,
        now: DateTime<Utc>,
        depth: u8,
        extra_context: Option<&HashMap<String, String>>,
    ) -> Result<RunOutcome> {
        let started = Instant::now();
        let sender_prefix = envelope.from_prefix();

        let inner = self.run_recipe_inner(recipe, envelope, registry, host, now, extra_context, &sender_prefix, started);
        let (outcome, pending_trigger) = match tokio::time::timeout(self.run_timeout, inner).await {
            Ok(result) => result?,
            Err(_elapsed) => {
                let wall_ms = started.elapsed().as_millis() as i64;
                let row = JournalRow {
                    id: None,
                    ts: now,
                    pipeline: recipe.name.clone(),
                    session_id: envelope.session_id().map(|s| s.to_string()),
                    from_prefix: sender_prefix.as_ref().map(|p| p.to_string()),
                    envelope_json: serde_json::to_value(envelope)?,
                    filter_json: None,
                    eval_type: EvalType::Error,
                    eval_result_json: Some(serde_json::json!({
                        "reason": "pipeline run exceeded its wall-clock budget",
                        "journal_tag": "run_timeout",
                    })),
                    action_name: Some("run_timeout".to_string()),
                    action_trace_json: Some(serde_json::json!({ "final_action": "run_timeout" })),
                    wall_ms,
                    mode: recipe.mode,
                    reviewed: if recipe.mode == Mode::Automated { 1 } else { 0 },
                    correction_json: None,
                    ttl_expires: now + chrono::Duration::days(self.config.classification_ttl_days as i64),
                };
                let journal_id = self.store.insert_journal_row(&row)?;
                host.log(&format!("recipe '{}' exceeded its run timeout", recipe.name));
                (
                    RunOutcome {
                        recipe: recipe.name.clone(),
                        journal_id,
                        eval_type: EvalType::Error,
                        action_name: Some("run_timeout".to_string()),
                        breaker_tripped: false,
                    },
                    None,
                )
            }
        };

        if let Some((target_pipeline, fields)) = pending_trigger {
            if depth < MAX_TRIGGER_DEPTH {
                if let Some(target_recipe) = registry.recipes.iter().find(|r| r.name == target_pipeline) {
                    Box::pin(self.run_recipe(target_recipe, envelope, registry, host, now, depth + 1, Some(&fields))).await?;
                } else {
                    host.log(&format!("trigger step referenced unknown recipe '{target_pipeline}'"));
                }
            } else {
                host.log(&format!("trigger recursion depth exceeded for '{target_pipeline}'"));
            }
        }

        Ok(outcome)
    }

    /// The Filter → Evaluate → Action body of a single recipe run, wrapped by
    /// [`run_recipe`] in the overall per-run timeout. Returns the outcome plus
    /// any pending `trigger` step so the caller can recurse outside the
    /// timeout window (the recursive child run gets its own budget).
    #[allow(clippy::too_many_arguments)]
    async fn run_recipe_inner(
        &self,
        recipe: &Recipe,
        envelope: &Envelope,
        registry: &Arc<Registry>,
        host: &dyn PluginContext,
        now: DateTime<Utc>,
        extra_context: Option<&HashMap<String, String>>,
        sender_prefix: &Option<NodePrefix>,
        started: Instant,
    ) -> Result<(RunOutcome, Option<(String, HashMap<String, String>)>)> {
        let prompt_hash = match &recipe.evaluate {
            Evaluate::Llm { prompt, .. } => registry.prompt(prompt).map(|p| p.hash.clone()),
            Evaluate::Hotwire { .. } => None,
        };

        let filter_outcome = self.filter_stage.evaluate(
            &recipe.filter,
            &registry.trust_tiers,
            &self.store,
            envelope,
            prompt_hash.as_deref(),
            now,
        )?;
        let template_ctx = self.build_template_context(envelope, &filter_outcome, extra_context);

        let (eval_type, mut action_name, eval_result_json) = match &filter_outcome.decision {
            FilterDecision::Drop(reason) | FilterDecision::Skip(reason) => {
                (EvalType::Skip, breaker_drop_action_name(reason), Some(serde_json::json!({ "reason": reason })))
            }
            FilterDecision::Bypass(action) => (EvalType::Bypass, Some(action.clone()), None),
            FilterDecision::Pass => {
                if let Some(cached) = &filter_outcome.cached_eval {
                    let action = cached.get("action").and_then(|v| v.as_str()).map(|s| s.to_string());
                    (EvalType::Cache, action, Some(cached.clone()))
                } else {
                    self.run_evaluate(recipe, registry, envelope, &template_ctx, prompt_hash.as_deref(), &filter_outcome, now)
                        .await?
                }
            }
        };

        let mut breaker_tripped = false;
        let mut pending_trigger = None;
        let mut final_action_tag = "drop".to_string();

        let action_trace_json = match &action_name {
            None => serde_json::json!({ "final_action": "drop" }),
            Some(name) => match recipe.actions.get(name) {
                None => {
                    host.log(&format!("recipe '{}' references unknown action '{name}'", recipe.name));
                    serde_json::json!({ "final_action": "drop", "error": "unknown action" })
                }
                Some(steps) => {
                    let outcome = self
                        .actions
                        .execute(
                            steps,
                            recipe.mode == Mode::Manual,
                            &template_ctx,
                            &self.store,
                            host,
                            envelope.from_node(),
                            envelope.session_id(),
                            now,
                        )
                        .await;

                    if let Some(last) = outcome.trace.last() {
                        final_action_tag = last.step.clone();
                    }
                    pending_trigger = outcome.pending_trigger.clone();

                    let wake_or_reply = outcome
                        .trace
                        .iter()
                        .any(|t| !t.would_execute && t.ok && (t.step == "summon" || t.step == "reply"));
                    if wake_or_reply {
                        if let Some(prefix) = sender_prefix {
                            let trip = self.loop_guard.record_wake_and_check(
                                prefix,
                                envelope.session_id(),
                                envelope.session_key(),
                                now,
                            );
                            if trip.tripped {
                                if let Ok(breaker) = self.loop_guard.trip_breaker(&self.store, prefix, now) {
                                    breaker_tripped = true;
                                    action_name = Some("loop_blocked".to_string());
                                    let _ = host
                                        .send_mail(
                                            host.node_id(),
                                            "thrall_breaker_tripped",
                                            &format!("breaker tripped for {prefix}: {}", breaker.reason),
                                            envelope.session_id(),
                                            true,
                                        )
                                        .await;
                                }
                            }
                        }
                    }
                    if let Some(to) = recipe.filter.cooldown_key.as_deref() {
                        if let Some(seconds) = recipe.filter.cooldown_seconds {
                            let _ = self.store.cooldown_set(to, now + chrono::Duration::seconds(seconds as i64));
                        }
                    }

                    serde_json::json!({
                        "final_action": final_action_tag,
                        "action_name": name,
                        "steps": outcome.trace,
                        "aborted": outcome.aborted,
                    })
                }
            },
        };

        if final_action_tag == "drop" {
            if let Some(prefix) = sender_prefix {
                let _ = self.loop_guard.check_knock_pattern(&self.store, prefix, now);
            }
        }

        let wall_ms = started.elapsed().as_millis() as i64;
        let filter_json = Some(serde_json::json!({
            "tier": filter_outcome.tier.to_string(),
            "decision": filter_decision_tag(&filter_outcome.decision),
        }));
        let row = JournalRow {
            id: None,
            ts: now,
            pipeline: recipe.name.clone(),
            session_id: envelope.session_id().map(|s| s.to_string()),
            from_prefix: sender_prefix.as_ref().map(|p| p.to_string()),
            envelope_json: serde_json::to_value(envelope)?,
            filter_json,
            eval_type,
            eval_result_json,
            action_name: action_name.clone(),
            action_trace_json: Some(action_trace_json),
            wall_ms,
            mode: recipe.mode,
            reviewed: if recipe.mode == Mode::Automated { 1 } else { 0 },
            correction_json: None,
            ttl_expires: now + chrono::Duration::days(self.config.classification_ttl_days as i64),
        };
        let journal_id = self.store.insert_journal_row(&row)?;

        Ok((
            RunOutcome {
                recipe: recipe.name.clone(),
                journal_id,
                eval_type,
                action_name,
                breaker_tripped,
            },
            pending_trigger,
        ))
    }
}
