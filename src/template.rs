//! Expands `{{namespace.key}}` placeholders against the envelope, the
//! stitched context, the LLM evaluation result, and the filter decision.
//!
//! No expression language, no conditionals — straight substitution. A
//! missing key becomes an empty string plus a diagnostic line in the trace;
//! it never aborts resolution.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;

/// Flat `key -> value` maps for each namespace the resolver understands.
/// `journal` is populated ahead of time by the caller (it is backed by a SQL
/// lookup and resolution itself stays synchronous).
#[derive(Debug, Clone, Default)]
pub struct TemplateContext {
    pub envelope: HashMap<String, String>,
    pub context: HashMap<String, String>,
    pub llm: HashMap<String, String>,
    pub filter: HashMap<String, String>,
    pub journal: HashMap<String, String>,
}

impl TemplateContext {
    fn namespace(&self, name: &str) -> Option<&HashMap<String, String>> {
        match name {
            "envelope" => Some(&self.envelope),
            "context" => Some(&self.context),
            "llm" => Some(&self.llm),
            "filter" => Some(&self.filter),
            "journal" => Some(&self.journal),
            _ => None,
        }
    }
}

pub struct Resolved {
    pub text: String,
    pub diagnostics: Vec<String>,
}

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{([a-zA-Z_][a-zA-Z0-9_]*)\.([a-zA-Z_][a-zA-Z0-9_]*)\}\}").unwrap())
}

pub fn resolve(template: &str, ctx: &TemplateContext) -> Resolved {
    let mut diagnostics = Vec::new();
    let re = placeholder_re();
    let text = re
        .replace_all(template, |caps: &regex::Captures| {
            let namespace = &caps[1];
            let key = &caps[2];
            match ctx.namespace(namespace).and_then(|m| m.get(key)) {
                Some(value) => value.clone(),
                None => {
                    diagnostics.push(format!("missing template key {namespace}.{key}"));
                    String::new()
                }
            }
        })
        .into_owned();
    Resolved { text, diagnostics }
}

/// Resolve every string field of a flat `key -> value` map (used for `act`
/// step input and similar), returning the resolved map plus any diagnostics.
pub fn resolve_map(
    fields: &HashMap<String, String>,
    ctx: &TemplateContext,
) -> (HashMap<String, String>, Vec<String>) {
    let mut out = HashMap::with_capacity(fields.len());
    let mut diagnostics = Vec::new();
    for (k, v) in fields {
        let resolved = resolve(v, ctx);
        diagnostics.extend(resolved.diagnostics);
        out.insert(k.clone(), resolved.text);
    }
    (out, diagnostics)
}
