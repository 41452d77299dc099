//! Thrall: an edge-resident message-classification guard embedded in a
//! peer-to-peer agent node. Consumes the host's plugin contract
//! ([`host::PluginContext`]) and turns every arrived envelope into at most
//! one journaled decision per matching recipe.

pub mod action;
pub mod admin;
pub mod config;
pub mod config_loader;
pub mod error;
pub mod evaluator;
pub mod filter;
pub mod host;
pub mod loop_guard;
pub mod lru;
pub mod node_id;
pub mod pipeline;
pub mod store;
pub mod template;
pub mod types;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use config::ThrallConfig;
use config_loader::ConfigLoader;
use error::Result;
use evaluator::llm::{EchoBackend, InferenceBackend, LlmEvaluator};
use host::PluginContext;
use pipeline::{Pipeline, RunOutcome};
use store::Store;
use types::Envelope;

/// The plugin entry point: owns the config loader, the store, and the
/// pipeline engine, and is what the host's `on_mail_received`/`on_tick`
/// callbacks are wired to.
pub struct Thrall {
    loader: ConfigLoader,
    pipeline: Pipeline,
}

impl Thrall {
    /// Loads `plugin.toml` and the `recipes/`/`prompts/`/`models/`/`hotwires/`
    /// directories under `plugin_dir`, opens the SQLite store there, and
    /// builds the pipeline. `backend_factory` constructs the inference
    /// backend lazily on first classification — pass a constructor for the
    /// real model runtime in production, [`EchoBackend`] in tests.
    pub fn init(
        plugin_dir: &Path,
        backend_factory: impl Fn() -> Arc<dyn InferenceBackend> + Send + Sync + 'static,
    ) -> Result<Self> {
        let config = ThrallConfig::load(plugin_dir)?;
        let store = Store::open(plugin_dir)?;
        let loader = ConfigLoader::new(plugin_dir);
        loader.load()?;

        let llm = LlmEvaluator::new(
            backend_factory,
            Duration::from_secs_f64(config.queue_timeout_seconds),
            Duration::from_secs_f64(config.queue_timeout_seconds * 2.0),
        );
        let artifacts_dir = config.artifacts_dir(plugin_dir);
        let pipeline = Pipeline::new(config, store, llm, artifacts_dir);

        Ok(Self { loader, pipeline })
    }

    /// Test/demo constructor: an in-memory store and the [`EchoBackend`].
    pub fn init_for_tests(plugin_dir: &Path) -> Result<Self> {
        Self::init(plugin_dir, || {
            Arc::new(EchoBackend {
                response: r#"{"action":"wake","reason":"echo"}"#.to_string(),
            })
        })
    }

    pub fn store(&self) -> &Store {
        self.pipeline.store()
    }

    /// Reloads the registry if the `thrall.reload` sentinel was touched
    /// since the last load. Call this from `on_tick`.
    pub fn reload_if_touched(&self) -> Result<bool> {
        Ok(self.loader.reload_if_touched()?)
    }

    /// Entry point for the host's `on_mail_received`/`on_tick` callbacks.
    pub async fn handle_envelope(&self, envelope: Envelope, host: &dyn PluginContext) -> Result<Vec<RunOutcome>> {
        let registry = self.loader.registry();
        let now = chrono::Utc::now();
        self.pipeline.handle_envelope(envelope, &registry, host, now).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullHost {
        dir: std::path::PathBuf,
    }

    #[async_trait::async_trait]
    impl PluginContext for NullHost {
        async fn send_mail(
            &self,
            _to_node: &str,
            _msg_type: &str,
            _body: &str,
            _session_id: Option<&str>,
            _system: bool,
        ) -> std::result::Result<(), String> {
            Ok(())
        }
        fn log(&self, _line: &str) {}
        fn plugin_dir(&self) -> &Path {
            &self.dir
        }
        fn vault_get(&self, _key: &str) -> Option<String> {
            None
        }
        fn node_id(&self) -> &str {
            "self-node-0000000000000000"
        }
    }

    #[tokio::test]
    async fn empty_plugin_dir_processes_mail_with_no_matching_recipes() {
        let dir = tempfile::tempdir().unwrap();
        let thrall = Thrall::init_for_tests(dir.path()).unwrap();
        let host = NullHost { dir: dir.path().to_path_buf() };
        let outcomes = thrall
            .handle_envelope(
                Envelope::Mail {
                    from_node: "a".repeat(16),
                    to_node: "b".repeat(16),
                    msg_type: "chat".into(),
                    body_text: "hi".into(),
                    body_json: None,
                    session_id: None,
                    message_id: None,
                },
                &host,
            )
            .await
            .unwrap();
        assert!(outcomes.is_empty());
    }
}
