//! Hotwire Evaluator: static field-regex rules that short-circuit the LLM.
//! First matching rule wins; otherwise the ruleset's `default_action` fires.

use regex::Regex;

use crate::types::{Envelope, EvalType, HotwireSet};

#[derive(Debug, Clone)]
pub struct EvalOutcome {
    pub eval_type: EvalType,
    pub action: String,
    pub reason: String,
}

fn field_value<'a>(envelope: &'a Envelope, field: &str) -> Option<&'a str> {
    match field {
        "body_text" => envelope.body_text(),
        "msg_type" => envelope.msg_type(),
        "from_node" => envelope.from_node(),
        _ => None,
    }
}

pub fn evaluate(ruleset: &HotwireSet, envelope: &Envelope) -> EvalOutcome {
    for rule in &ruleset.rules {
        let Some(value) = field_value(envelope, &rule.field) else {
            continue;
        };
        // Validated at config-load time; a bad pattern here would be a
        // loader bug, not a runtime condition to recover from.
        let re = Regex::new(&rule.pattern).expect("hotwire regex validated at load time");
        if re.is_match(value) {
            let reason = rule
                .reason
                .clone()
                .unwrap_or_else(|| format!("hotwire rule matched field '{}'", rule.field));
            return EvalOutcome {
                eval_type: EvalType::Hotwire,
                action: rule.action.clone(),
                reason,
            };
        }
    }
    EvalOutcome {
        eval_type: EvalType::Hotwire,
        action: ruleset.default_action.clone(),
        reason: "no hotwire rule matched".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::HotwireRule;

    fn mail(body: &str) -> Envelope {
        Envelope::Mail {
            from_node: "a".repeat(16),
            to_node: "b".repeat(16),
            msg_type: "chat".into(),
            body_text: body.into(),
            body_json: None,
            session_id: None,
            message_id: None,
        }
    }

    #[test]
    fn first_matching_rule_wins() {
        let set = HotwireSet {
            name: "spam".into(),
            default_action: "keep".into(),
            rules: vec![
                HotwireRule {
                    field: "body_text".into(),
                    pattern: "(?i)viagra".into(),
                    action: "drop_spam".into(),
                    reason: None,
                },
                HotwireRule {
                    field: "body_text".into(),
                    pattern: "(?i)hey".into(),
                    action: "drop_casual".into(),
                    reason: None,
                },
            ],
        };
        let outcome = evaluate(&set, &mail("hey, viagra deals"));
        assert_eq!(outcome.action, "drop_spam");
    }

    #[test]
    fn falls_through_to_default_action() {
        let set = HotwireSet {
            name: "spam".into(),
            default_action: "keep".into(),
            rules: vec![HotwireRule {
                field: "body_text".into(),
                pattern: "(?i)viagra".into(),
                action: "drop_spam".into(),
                reason: None,
            }],
        };
        let outcome = evaluate(&set, &mail("let's meet tomorrow"));
        assert_eq!(outcome.action, "keep");
        assert_eq!(outcome.eval_type, EvalType::Hotwire);
    }
}
