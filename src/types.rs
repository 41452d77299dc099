//! Core domain types: envelopes, recipes, prompts, and the tagged step/stage
//! sum types that replace source-side duck typing.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::node_id::NodePrefix;

/// An immutable record of one trigger event. Built once at trigger time and
/// never mutated afterward; context-stitch and template resolution read it,
/// they don't write it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Envelope {
    Mail {
        from_node: String,
        to_node: String,
        msg_type: String,
        body_text: String,
        #[serde(default)]
        body_json: Option<serde_json::Value>,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        message_id: Option<String>,
    },
    Tick {
        tick: u64,
        peer_count: u32,
        uptime_s: u64,
    },
}

impl Envelope {
    pub fn trigger_kind(&self) -> TriggerKind {
        match self {
            Envelope::Mail { .. } => TriggerKind::OnMail,
            Envelope::Tick { .. } => TriggerKind::OnTick,
        }
    }

    pub fn from_node(&self) -> Option<&str> {
        match self {
            Envelope::Mail { from_node, .. } => Some(from_node),
            Envelope::Tick { .. } => None,
        }
    }

    pub fn from_prefix(&self) -> Option<NodePrefix> {
        self.from_node().and_then(NodePrefix::from_raw)
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            Envelope::Mail { session_id, .. } => session_id.as_deref(),
            Envelope::Tick { .. } => None,
        }
    }

    /// Key used by counters that are keyed per session, falling back to the
    /// literal string `"default"` when the envelope carries no session.
    pub fn session_key(&self) -> &str {
        self.session_id().unwrap_or("default")
    }

    pub fn body_text(&self) -> Option<&str> {
        match self {
            Envelope::Mail { body_text, .. } => Some(body_text),
            Envelope::Tick { .. } => None,
        }
    }

    pub fn msg_type(&self) -> Option<&str> {
        match self {
            Envelope::Mail { msg_type, .. } => Some(msg_type),
            Envelope::Tick { .. } => None,
        }
    }

    /// Renders the envelope as a flat `namespace.key` map for the template
    /// resolver's `envelope.*` namespace.
    pub fn template_fields(&self) -> HashMap<String, String> {
        let mut out = HashMap::new();
        match self {
            Envelope::Mail {
                from_node,
                to_node,
                msg_type,
                body_text,
                session_id,
                message_id,
                ..
            } => {
                out.insert("from_node".into(), from_node.clone());
                out.insert("to_node".into(), to_node.clone());
                out.insert("msg_type".into(), msg_type.clone());
                out.insert("body_text".into(), body_text.clone());
                out.insert(
                    "session_id".into(),
                    session_id.clone().unwrap_or_default(),
                );
                out.insert(
                    "message_id".into(),
                    message_id.clone().unwrap_or_default(),
                );
            }
            Envelope::Tick {
                tick,
                peer_count,
                uptime_s,
            } => {
                out.insert("tick".into(), tick.to_string());
                out.insert("peer_count".into(), peer_count.to_string());
                out.insert("uptime_s".into(), uptime_s.to_string());
            }
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    OnMail,
    OnTick,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum Trigger {
    OnMail {
        #[serde(default)]
        msg_types: Vec<String>,
    },
    OnTick,
}

impl Trigger {
    pub fn kind(&self) -> TriggerKind {
        match self {
            Trigger::OnMail { .. } => TriggerKind::OnMail,
            Trigger::OnTick => TriggerKind::OnTick,
        }
    }

    /// Trigger-specific match against an arrived envelope, beyond the
    /// trigger-kind check the engine already performed.
    pub fn matches(&self, envelope: &Envelope) -> bool {
        match (self, envelope) {
            (Trigger::OnMail { msg_types }, Envelope::Mail { msg_type, .. }) => {
                msg_types.is_empty() || msg_types.iter().any(|m| m == msg_type)
            }
            (Trigger::OnTick, Envelope::Tick { .. }) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Manual,
    Supervised,
    Automated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustTier {
    Team,
    Known,
    Unknown,
}

impl std::fmt::Display for TrustTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TrustTier::Team => "team",
            TrustTier::Known => "known",
            TrustTier::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilterConfig {
    #[serde(default)]
    pub trust_bypass: bool,
    #[serde(default)]
    pub bypass_action: Option<String>,
    #[serde(default)]
    pub cooldown_key: Option<String>,
    #[serde(default)]
    pub cooldown_seconds: Option<u64>,
    #[serde(default)]
    pub rate_limit_max: Option<u32>,
    #[serde(default)]
    pub rate_limit_window_seconds: Option<u64>,
    #[serde(default)]
    pub rate_limit_action: Option<String>,
    #[serde(default)]
    pub cache_ttl_seconds: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HotwireRule {
    pub field: String,
    pub pattern: String,
    pub action: String,
    /// Human-readable explanation recorded on the journal row when this
    /// rule fires. Falls back to a generic "field matched" message.
    #[serde(default)]
    pub reason: Option<String>,
}

/// A named set of hotwire rules loaded from `hotwires/<name>.toml`;
/// recipes reference it by `name` rather than embedding rules inline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HotwireSet {
    pub name: String,
    pub rules: Vec<HotwireRule>,
    pub default_action: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum Evaluate {
    Llm {
        prompt: String,
        model: String,
        fallback_action: String,
    },
    Hotwire {
        ruleset: String,
    },
}

/// One step of a named action's ordered step list (§4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum ActionStep {
    Log {
        message: String,
    },
    Drop,
    Compile {
        buffer: String,
        #[serde(default)]
        summon_threshold: Option<usize>,
        #[serde(default)]
        summon_keywords: Vec<String>,
    },
    Summon {
        #[serde(default)]
        note: Option<String>,
    },
    Reply {
        template: String,
    },
    Act {
        skill: String,
        #[serde(default)]
        input: HashMap<String, String>,
        #[serde(default)]
        error_buffer: Option<String>,
    },
    SetContext {
        key: String,
        value: String,
        #[serde(default)]
        ttl_seconds: Option<u64>,
    },
    ClearContext,
    SetFlag {
        key: String,
        value: String,
        #[serde(default)]
        ttl_seconds: Option<u64>,
    },
    Trigger {
        pipeline: String,
        #[serde(default)]
        fields: HashMap<String, String>,
    },
}

impl ActionStep {
    pub fn name(&self) -> &'static str {
        match self {
            ActionStep::Log { .. } => "log",
            ActionStep::Drop => "drop",
            ActionStep::Compile { .. } => "compile",
            ActionStep::Summon { .. } => "summon",
            ActionStep::Reply { .. } => "reply",
            ActionStep::Act { .. } => "act",
            ActionStep::SetContext { .. } => "set_context",
            ActionStep::ClearContext => "clear_context",
            ActionStep::SetFlag { .. } => "set_flag",
            ActionStep::Trigger { .. } => "trigger",
        }
    }

    /// Actions that wake the local agent or send to a peer are what the
    /// Loop/Breaker Guard counts (§4.8).
    pub fn is_wake_or_reply(&self) -> bool {
        matches!(self, ActionStep::Summon { .. } | ActionStep::Reply { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Recipe {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub mode: Mode,
    pub trigger: Trigger,
    #[serde(default)]
    pub filter: FilterConfig,
    pub evaluate: Evaluate,
    pub actions: HashMap<String, Vec<ActionStep>>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Prompt {
    pub name: String,
    pub version: u32,
    pub template_text: String,
    pub model_ref: String,
    #[serde(default)]
    pub hash: String,
}

/// A model descriptor from `models/*.toml`. The model *runtime* itself is an
/// external collaborator (§1); this is only the narrow description the
/// Config Loader validates and the LLM Evaluator binds a prompt against.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelDescriptor {
    pub name: String,
    pub backend: String,
    #[serde(default)]
    pub path: Option<String>,
}

pub const SUPPORTED_MODEL_BACKENDS: &[&str] = &["gguf", "echo"];

impl Prompt {
    /// SHA-256 of `template_text`, truncated to 16 hex chars, matching the
    /// hash recorded with every classification that used this prompt.
    pub fn compute_hash(template_text: &str) -> String {
        use sha2::{Digest, Sha256};
        let digest = Sha256::digest(template_text.as_bytes());
        hex::encode(digest)[..16].to_string()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrustTiers {
    pub team: Vec<String>,
    pub known: Vec<String>,
}

impl TrustTiers {
    /// Longest-prefix match, ties broken by tier order `team > known`.
    pub fn resolve(&self, prefix: &NodePrefix) -> TrustTier {
        let best = |list: &[String]| -> Option<usize> {
            list.iter()
                .filter(|p| prefix.as_str().starts_with(p.as_str()))
                .map(|p| p.len())
                .max()
        };
        let team_best = best(&self.team);
        let known_best = best(&self.known);
        match (team_best, known_best) {
            (Some(t), Some(k)) if k > t => TrustTier::Known,
            (Some(_), _) => TrustTier::Team,
            (None, Some(_)) => TrustTier::Known,
            (None, None) => TrustTier::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvalType {
    Llm,
    Hotwire,
    Cache,
    Bypass,
    Skip,
    Error,
}
