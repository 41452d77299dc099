//! LLM Evaluator (§4.6): a lazily-initialised model singleton consumed
//! through a narrow `classify(system, user) -> json` contract, serialized
//! through a 1-permit semaphore so only one inference ever runs at once,
//! offloaded to a worker thread so the event loop stays responsive.

use std::collections::HashSet;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::sync::Semaphore;

const RAW_RESPONSE_PREVIEW_CHARS: usize = 200;

/// The narrow contract the binary language-model runtime is consumed
/// through (§1). This is a pure function — two strings in, a parsed result
/// out — with no visibility into Thrall's shared state, matching the
/// cross-thread isolation design note (§9).
pub trait InferenceBackend: Send + Sync {
    fn classify(&self, system_prompt: &str, user_text: &str) -> Result<String, String>;
}

/// Stand-in backend used by tests and by callers with no model configured.
/// Unconditionally returns a fixed JSON document.
pub struct EchoBackend {
    pub response: String,
}

impl InferenceBackend for EchoBackend {
    fn classify(&self, _system_prompt: &str, _user_text: &str) -> Result<String, String> {
        Ok(self.response.clone())
    }
}

#[derive(Debug, Clone)]
pub enum EvalOutcome {
    Success {
        action: String,
        reason: String,
        extra: serde_json::Map<String, serde_json::Value>,
        raw_response: String,
    },
    Fallback {
        fallback_action: String,
        reason: String,
        journal_tag: Option<String>,
        raw_response: Option<String>,
    },
}

pub struct LlmEvaluator {
    backend: OnceLock<Arc<dyn InferenceBackend>>,
    backend_factory: Box<dyn Fn() -> Arc<dyn InferenceBackend> + Send + Sync>,
    init_lock: tokio::sync::Mutex<()>,
    semaphore: Arc<Semaphore>,
    queue_timeout: Duration,
    inference_timeout: Duration,
    healthy: std::sync::atomic::AtomicBool,
}

impl LlmEvaluator {
    pub fn new(
        backend_factory: impl Fn() -> Arc<dyn InferenceBackend> + Send + Sync + 'static,
        queue_timeout: Duration,
        inference_timeout: Duration,
    ) -> Self {
        Self {
            backend: OnceLock::new(),
            backend_factory: Box::new(backend_factory),
            init_lock: tokio::sync::Mutex::new(()),
            semaphore: Arc::new(Semaphore::new(1)),
            queue_timeout,
            inference_timeout,
            healthy: std::sync::atomic::AtomicBool::new(true),
        }
    }

    pub fn healthy(&self) -> bool {
        self.healthy.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn queue_timeout(&self) -> Duration {
        self.queue_timeout
    }

    pub fn inference_timeout(&self) -> Duration {
        self.inference_timeout
    }

    /// Lazily initializes the backend on first call; concurrent first
    /// callers wait on `init_lock` rather than each constructing one.
    async fn backend(&self) -> Arc<dyn InferenceBackend> {
        if let Some(b) = self.backend.get() {
            return b.clone();
        }
        let _guard = self.init_lock.lock().await;
        if let Some(b) = self.backend.get() {
            return b.clone();
        }
        let built = (self.backend_factory)();
        let _ = self.backend.set(built.clone());
        built
    }

    pub async fn classify(
        &self,
        system_prompt: String,
        user_text: String,
        valid_actions: &HashSet<String>,
        fallback_action: &str,
    ) -> EvalOutcome {
        let permit = match tokio::time::timeout(self.queue_timeout, self.semaphore.acquire()).await {
            Ok(Ok(permit)) => permit,
            _ => {
                tracing::warn!("llm evaluator queue timeout, falling back");
                return EvalOutcome::Fallback {
                    fallback_action: fallback_action.to_string(),
                    reason: "queue timeout waiting for inference slot".to_string(),
                    journal_tag: Some("queue_full".to_string()),
                    raw_response: None,
                };
            }
        };

        let backend = self.backend().await;
        let result = tokio::time::timeout(
            self.inference_timeout,
            tokio::task::spawn_blocking(move || backend.classify(&system_prompt, &user_text)),
        )
        .await;
        drop(permit);

        match result {
            Err(_elapsed) => {
                EvalOutcome::Fallback {
                    fallback_action: fallback_action.to_string(),
                    reason: "inference timed out".to_string(),
                    journal_tag: Some("inference_timeout".to_string()),
                    raw_response: None,
                }
            }
            Ok(Err(join_error)) => {
                self.healthy.store(false, std::sync::atomic::Ordering::SeqCst);
                EvalOutcome::Fallback {
                    fallback_action: fallback_action.to_string(),
                    reason: format!("inference worker panicked: {join_error}"),
                    journal_tag: None,
                    raw_response: None,
                }
            }
            Ok(Ok(Err(backend_error))) => EvalOutcome::Fallback {
                fallback_action: fallback_action.to_string(),
                reason: truncate(&backend_error, RAW_RESPONSE_PREVIEW_CHARS),
                journal_tag: None,
                raw_response: Some(truncate(&backend_error, RAW_RESPONSE_PREVIEW_CHARS)),
            },
            Ok(Ok(Ok(raw))) => self.parse_response(raw, valid_actions, fallback_action),
        }
    }

    fn parse_response(
        &self,
        raw: String,
        valid_actions: &HashSet<String>,
        fallback_action: &str,
    ) -> EvalOutcome {
        let cleaned = strip_fenced_code_markers(&raw);
        let parsed: Result<serde_json::Value, _> = serde_json::from_str(&cleaned);
        let value = match parsed {
            Ok(v) => v,
            Err(e) => {
                return EvalOutcome::Fallback {
                    fallback_action: fallback_action.to_string(),
                    reason: truncate(&format!("malformed JSON: {e}"), RAW_RESPONSE_PREVIEW_CHARS),
                    journal_tag: None,
                    raw_response: Some(truncate(&raw, RAW_RESPONSE_PREVIEW_CHARS)),
                };
            }
        };
        let Some(obj) = value.as_object() else {
            return EvalOutcome::Fallback {
                fallback_action: fallback_action.to_string(),
                reason: "response JSON is not an object".to_string(),
                journal_tag: None,
                raw_response: Some(truncate(&raw, RAW_RESPONSE_PREVIEW_CHARS)),
            };
        };
        let action = match obj.get("action").and_then(|v| v.as_str()) {
            Some(a) => a.to_string(),
            None => {
                return EvalOutcome::Fallback {
                    fallback_action: fallback_action.to_string(),
                    reason: "response JSON missing 'action'".to_string(),
                    journal_tag: None,
                    raw_response: Some(truncate(&raw, RAW_RESPONSE_PREVIEW_CHARS)),
                };
            }
        };
        if !valid_actions.contains(&action) {
            return EvalOutcome::Fallback {
                fallback_action: fallback_action.to_string(),
                reason: format!("unrecognised action '{action}'"),
                journal_tag: None,
                raw_response: Some(truncate(&raw, RAW_RESPONSE_PREVIEW_CHARS)),
            };
        }
        let reason = obj
            .get("reason")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let mut extra = obj.clone();
        extra.remove("action");
        extra.remove("reason");
        EvalOutcome::Success {
            action,
            reason,
            extra,
            raw_response: truncate(&raw, RAW_RESPONSE_PREVIEW_CHARS),
        }
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

/// Strips leading/trailing ``` fences (optionally tagged, e.g. ```json)
/// before a JSON payload, for backends that don't support structured output
/// constraints.
fn strip_fenced_code_markers(s: &str) -> String {
    let trimmed = s.trim();
    if let Some(rest) = trimmed.strip_prefix("```") {
        let rest = rest.trim_start_matches("json").trim_start();
        if let Some(body) = rest.strip_suffix("```") {
            return body.trim().to_string();
        }
        return rest.trim().to_string();
    }
    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn valid_actions() -> HashSet<String> {
        ["wake", "drop", "compile"].iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn successful_classification_parses_action_and_reason() {
        let evaluator = LlmEvaluator::new(
            || {
                Arc::new(EchoBackend {
                    response: r#"{"action":"wake","reason":"looks urgent"}"#.to_string(),
                })
            },
            Duration::from_secs(5),
            Duration::from_secs(5),
        );
        let outcome = evaluator
            .classify("sys".into(), "user".into(), &valid_actions(), "compile")
            .await;
        match outcome {
            EvalOutcome::Success { action, reason, .. } => {
                assert_eq!(action, "wake");
                assert_eq!(reason, "looks urgent");
            }
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn fenced_code_markers_are_stripped_before_parsing() {
        let evaluator = LlmEvaluator::new(
            || {
                Arc::new(EchoBackend {
                    response: "```json\n{\"action\":\"drop\",\"reason\":\"spam\"}\n```".to_string(),
                })
            },
            Duration::from_secs(5),
            Duration::from_secs(5),
        );
        let outcome = evaluator
            .classify("sys".into(), "user".into(), &valid_actions(), "compile")
            .await;
        assert!(matches!(outcome, EvalOutcome::Success { action, .. } if action == "drop"));
    }

    #[tokio::test]
    async fn malformed_json_falls_back() {
        let evaluator = LlmEvaluator::new(
            || Arc::new(EchoBackend { response: "not json at all".to_string() }),
            Duration::from_secs(5),
            Duration::from_secs(5),
        );
        let outcome = evaluator
            .classify("sys".into(), "user".into(), &valid_actions(), "compile")
            .await;
        match outcome {
            EvalOutcome::Fallback { fallback_action, reason, .. } => {
                assert_eq!(fallback_action, "compile");
                assert!(reason.contains("malformed JSON"));
            }
            other => panic!("expected fallback, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unrecognised_action_falls_back() {
        let evaluator = LlmEvaluator::new(
            || {
                Arc::new(EchoBackend {
                    response: r#"{"action":"nuke","reason":"x"}"#.to_string(),
                })
            },
            Duration::from_secs(5),
            Duration::from_secs(5),
        );
        let outcome = evaluator
            .classify("sys".into(), "user".into(), &valid_actions(), "compile")
            .await;
        assert!(matches!(outcome, EvalOutcome::Fallback { .. }));
    }

    #[tokio::test]
    async fn second_concurrent_caller_times_out_on_the_queue() {
        struct SlowBackend;
        impl InferenceBackend for SlowBackend {
            fn classify(&self, _s: &str, _u: &str) -> Result<String, String> {
                std::thread::sleep(Duration::from_millis(300));
                Ok(r#"{"action":"wake","reason":"slow"}"#.to_string())
            }
        }
        let evaluator = Arc::new(LlmEvaluator::new(
            || Arc::new(SlowBackend),
            Duration::from_millis(50),
            Duration::from_secs(5),
        ));

        let e1 = evaluator.clone();
        let first = tokio::spawn(async move {
            e1.classify("sys".into(), "user".into(), &valid_actions(), "compile").await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        let second_outcome = evaluator
            .classify("sys".into(), "user".into(), &valid_actions(), "compile")
            .await;

        match second_outcome {
            EvalOutcome::Fallback { journal_tag, .. } => {
                assert_eq!(journal_tag.as_deref(), Some("queue_full"));
            }
            other => panic!("expected queue_full fallback, got {other:?}"),
        }
        let first_outcome = first.await.unwrap();
        assert!(matches!(first_outcome, EvalOutcome::Success { .. }));
    }
}
