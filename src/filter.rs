//! Filter Stage (§4.5): trust bypass, rate-limit, cooldown, result cache,
//! context stitch, evaluated in a fixed order where the first match wins.
//! Cooldown/rate-limit/cache read-then-write pairs never cross an `.await`
//! (§5 suspension-point rule), so this stage stays entirely synchronous.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::lru::BoundedLru;
use crate::node_id::NodePrefix;
use crate::store::Store;
use crate::types::{Envelope, FilterConfig, TrustTier, TrustTiers};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterDecision {
    Pass,
    Skip(String),
    Drop(String),
    Bypass(String),
}

pub struct FilterOutcome {
    pub decision: FilterDecision,
    pub tier: TrustTier,
    pub cached_eval: Option<serde_json::Value>,
    pub context_fields: HashMap<String, String>,
}

pub struct FilterStage {
    rate_counters: Mutex<BoundedLru<String, VecDeque<DateTime<Utc>>>>,
}

impl FilterStage {
    pub fn new(max_counter_entries: usize) -> Self {
        Self {
            rate_counters: Mutex::new(BoundedLru::new(max_counter_entries)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn evaluate(
        &self,
        recipe_filter: &FilterConfig,
        trust_tiers: &TrustTiers,
        store: &Store,
        envelope: &Envelope,
        prompt_hash: Option<&str>,
        now: DateTime<Utc>,
    ) -> crate::error::Result<FilterOutcome> {
        let sender_prefix = envelope.from_prefix();
        let tier = sender_prefix
            .as_ref()
            .map(|p| trust_tiers.resolve(p))
            .unwrap_or(TrustTier::Unknown);

        // 1. Breaker check.
        if let Ok(Some(breaker)) = store.breakers.active_for(sender_prefix.as_ref(), now) {
            return Ok(FilterOutcome {
                decision: FilterDecision::Drop(format!("breaker_active:{}", breaker.reason)),
                tier,
                cached_eval: None,
                context_fields: HashMap::new(),
            });
        }

        // 2. Trust bypass.
        if recipe_filter.trust_bypass && tier == TrustTier::Team {
            let action = recipe_filter
                .bypass_action
                .clone()
                .unwrap_or_else(|| "bypass".to_string());
            return Ok(FilterOutcome {
                decision: FilterDecision::Bypass(action),
                tier,
                cached_eval: None,
                context_fields: HashMap::new(),
            });
        }

        // 3. Cooldown.
        if let Some(cooldown_key) = &recipe_filter.cooldown_key {
            if store.cooldown_active(cooldown_key, now)? {
                return Ok(FilterOutcome {
                    decision: FilterDecision::Drop("cooldown".to_string()),
                    tier,
                    cached_eval: None,
                    context_fields: HashMap::new(),
                });
            }
        }

        // 4. Rate limit — the event is recorded regardless of outcome.
        if let (Some(max), Some(window_seconds)) =
            (recipe_filter.rate_limit_max, recipe_filter.rate_limit_window_seconds)
        {
            if let Some(prefix) = &sender_prefix {
                let exceeded = self.record_and_check_rate(prefix, max, window_seconds, now);
                if exceeded {
                    let action = recipe_filter
                        .rate_limit_action
                        .clone()
                        .unwrap_or_else(|| "bypass".to_string());
                    return Ok(FilterOutcome {
                        decision: FilterDecision::Bypass(action),
                        tier,
                        cached_eval: None,
                        context_fields: HashMap::new(),
                    });
                }
            }
        }

        // 5. Cache.
        let mut cached_eval = None;
        if let (Some(ttl), Some(hash)) = (recipe_filter.cache_ttl_seconds, prompt_hash) {
            let _ = ttl;
            if let Some(body) = envelope.body_text() {
                let key = cache_key(hash, tier, body);
                cached_eval = store.cache_get(&key, now)?.and_then(|s| serde_json::from_str(&s).ok());
            }
        }

        // 6. Context stitch.
        let mut context_fields = HashMap::new();
        if let Some(session_id) = envelope.session_id() {
            for row in store.get_context_all(session_id, now)? {
                context_fields.insert(row.key, row.value);
            }
        }

        Ok(FilterOutcome {
            decision: FilterDecision::Pass,
            tier,
            cached_eval,
            context_fields,
        })
    }

    fn record_and_check_rate(
        &self,
        prefix: &NodePrefix,
        max: u32,
        window_seconds: u64,
        now: DateTime<Utc>,
    ) -> bool {
        let mut counters = self.rate_counters.lock().unwrap();
        let entry = counters.entry_or_insert_with(prefix.to_string(), VecDeque::new);
        entry.push_back(now);
        while let Some(front) = entry.front() {
            if (now - *front).num_seconds() > window_seconds as i64 {
                entry.pop_front();
            } else {
                break;
            }
        }
        entry.len() as u32 > max
    }
}

/// `sha256(prompt_hash | tier | sha256(body_text))`, truncated to 32 hex
/// chars — the cache is keyed by what the LLM would actually see.
pub fn cache_key(prompt_hash: &str, tier: TrustTier, body_text: &str) -> String {
    let body_hash = hex::encode(Sha256::digest(body_text.as_bytes()));
    let composite = format!("{prompt_hash}|{tier}|{body_hash}");
    hex::encode(Sha256::digest(composite.as_bytes()))[..32].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mail(from: &str, body: &str, session: Option<&str>) -> Envelope {
        Envelope::Mail {
            from_node: from.to_string(),
            to_node: "b".repeat(16),
            msg_type: "chat".into(),
            body_text: body.into(),
            body_json: None,
            session_id: session.map(|s| s.to_string()),
            message_id: None,
        }
    }

    fn test_store() -> Store {
        let dir = tempfile::tempdir().unwrap();
        Store::open_in_memory(dir.path().join("breakers"), dir.path().join("thrall.log")).unwrap()
    }

    #[test]
    fn breaker_active_drops_before_anything_else() {
        let store = test_store();
        let now = Utc::now();
        let prefix = NodePrefix::from_raw("6f5185865618575fdead").unwrap();
        let breaker = crate::store::Breaker::new(
            &crate::node_id::BreakerTarget::Sender(prefix.clone()),
            "x",
            3600,
            now,
        );
        store.breakers.write(&breaker).unwrap();
        let stage = FilterStage::new(1000);
        let outcome = stage
            .evaluate(
                &FilterConfig::default(),
                &TrustTiers::default(),
                &store,
                &mail("6f5185865618575fdead", "hello", None),
                None,
                now,
            )
            .unwrap();
        assert_eq!(outcome.decision, FilterDecision::Drop("breaker_active:x".into()));
    }

    #[test]
    fn team_trust_bypass_short_circuits() {
        let store = test_store();
        let tiers = TrustTiers {
            team: vec!["ad8d21d81a497993".into()],
            known: vec![],
        };
        let filter_cfg = FilterConfig {
            trust_bypass: true,
            bypass_action: Some("wake".into()),
            ..Default::default()
        };
        let stage = FilterStage::new(1000);
        let outcome = stage
            .evaluate(
                &filter_cfg,
                &tiers,
                &store,
                &mail("ad8d21d81a497993dead", "anything", None),
                None,
                Utc::now(),
            )
            .unwrap();
        assert_eq!(outcome.decision, FilterDecision::Bypass("wake".into()));
    }

    #[test]
    fn cooldown_drops_until_expired() {
        let store = test_store();
        let now = Utc::now();
        store.cooldown_set("cool:a", now + chrono::Duration::seconds(60)).unwrap();
        let filter_cfg = FilterConfig {
            cooldown_key: Some("cool:a".into()),
            ..Default::default()
        };
        let stage = FilterStage::new(1000);
        let outcome = stage
            .evaluate(&filter_cfg, &TrustTiers::default(), &store, &mail(&"0".repeat(16), "x", None), None, now)
            .unwrap();
        assert_eq!(outcome.decision, FilterDecision::Drop("cooldown".into()));
    }

    #[test]
    fn rate_limit_bypasses_after_exceeding_window_max() {
        let store = test_store();
        let now = Utc::now();
        let filter_cfg = FilterConfig {
            rate_limit_max: Some(2),
            rate_limit_window_seconds: Some(60),
            rate_limit_action: Some("throttled".into()),
            ..Default::default()
        };
        let stage = FilterStage::new(1000);
        let from = "1".repeat(16);
        for _ in 0..2 {
            let o = stage
                .evaluate(&filter_cfg, &TrustTiers::default(), &store, &mail(&from, "x", None), None, now)
                .unwrap();
            assert_eq!(o.decision, FilterDecision::Pass);
        }
        let third = stage
            .evaluate(&filter_cfg, &TrustTiers::default(), &store, &mail(&from, "x", None), None, now)
            .unwrap();
        assert_eq!(third.decision, FilterDecision::Bypass("throttled".into()));
    }

    #[test]
    fn cache_hit_returns_cached_eval_result() {
        let store = test_store();
        let now = Utc::now();
        let key = cache_key("abc123", TrustTier::Known, "hello world");
        store
            .cache_set(&key, r#"{"action":"wake","reason":"cached"}"#, now + chrono::Duration::seconds(60))
            .unwrap();
        let tiers = TrustTiers {
            known: vec!["1".repeat(16)],
            team: vec![],
        };
        let filter_cfg = FilterConfig {
            cache_ttl_seconds: Some(60),
            ..Default::default()
        };
        let stage = FilterStage::new(1000);
        let outcome = stage
            .evaluate(
                &filter_cfg,
                &tiers,
                &store,
                &mail(&"1".repeat(16), "hello world", None),
                Some("abc123"),
                now,
            )
            .unwrap();
        assert_eq!(outcome.decision, FilterDecision::Pass);
        assert!(outcome.cached_eval.is_some());
    }

    #[test]
    fn context_stitch_injects_session_rows() {
        let store = test_store();
        let now = Utc::now();
        store
            .set_context(&crate::store::ContextRow {
                session_id: "sess-A".into(),
                key: "last_error".into(),
                value: "timeout".into(),
                created_at: now,
                expires_at: None,
            })
            .unwrap();
        let stage = FilterStage::new(1000);
        let outcome = stage
            .evaluate(
                &FilterConfig::default(),
                &TrustTiers::default(),
                &store,
                &mail(&"1".repeat(16), "x", Some("sess-A")),
                None,
                now,
            )
            .unwrap();
        assert_eq!(outcome.context_fields.get("last_error"), Some(&"timeout".to_string()));
    }
}
