//! The host plugin contract (§6) — consumed, not implemented here. The host
//! node's plugin framework delivers `on_mail_received`/`on_tick` and hands
//! Thrall one of these at startup; everything it does to the outside world
//! (sending mail, logging, reading the vault) goes through it.

use std::path::Path;

use async_trait::async_trait;

#[async_trait]
pub trait PluginContext: Send + Sync {
    /// Send mail to another node (or, for system mail, typically this
    /// node's own id). `system` marks internal notices like breaker trips.
    async fn send_mail(
        &self,
        to_node: &str,
        msg_type: &str,
        body: &str,
        session_id: Option<&str>,
        system: bool,
    ) -> Result<(), String>;

    fn log(&self, line: &str);

    fn plugin_dir(&self) -> &Path;

    fn vault_get(&self, key: &str) -> Option<String>;

    fn node_id(&self) -> &str;
}
