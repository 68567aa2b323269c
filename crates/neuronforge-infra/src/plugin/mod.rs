//! Plugin registry: named plugins exposing actions to `plugin_action` steps.
//!
//! [`PluginRegistry`] implements the core [`PluginExecutor`] port, so the
//! engine never sees individual plugins. Registration is concurrent
//! (`DashMap`) and a plugin can be replaced while runs are in flight; a call
//! already dispatched keeps the instance it started with.

pub mod builtin;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use dashmap::DashMap;
use neuronforge_core::workflow::capability::{PluginCall, PluginExecutor, PluginInfo};
use neuronforge_types::error::PluginError;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub use builtin::register_builtin_plugins;

// ---------------------------------------------------------------------------
// Plugin trait
// ---------------------------------------------------------------------------

/// A named bundle of actions.
pub trait Plugin: Send + Sync {
    /// Registry key (`mock_email`, `log`, ...).
    fn key(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// Action names accepted by [`Plugin::invoke`].
    fn actions(&self) -> Vec<String>;

    fn invoke(
        &self,
        action: &str,
        params: &Value,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<Value, PluginError>> + Send;
}

/// Object-safe mirror of [`Plugin`] for storage in the registry.
trait PluginDyn: Send + Sync {
    fn description_dyn(&self) -> &str;
    fn actions_dyn(&self) -> Vec<String>;
    fn invoke_boxed<'a>(
        &'a self,
        action: &'a str,
        params: &'a Value,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<Value, PluginError>> + Send + 'a>>;
}

impl<T: Plugin> PluginDyn for T {
    fn description_dyn(&self) -> &str {
        self.description()
    }

    fn actions_dyn(&self) -> Vec<String> {
        self.actions()
    }

    fn invoke_boxed<'a>(
        &'a self,
        action: &'a str,
        params: &'a Value,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<Value, PluginError>> + Send + 'a>> {
        Box::pin(self.invoke(action, params, cancel))
    }
}

// ---------------------------------------------------------------------------
// PluginRegistry
// ---------------------------------------------------------------------------

/// Thread-safe map of plugin key to plugin.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    plugins: Arc<DashMap<String, Arc<dyn PluginDyn>>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin under its key, replacing any previous one.
    pub fn register<P: Plugin + 'static>(&self, plugin: P) {
        let key = plugin.key().to_string();
        info!(plugin = %key, actions = ?plugin.actions(), "registered plugin");
        self.plugins.insert(key, Arc::new(plugin));
    }

    /// Remove a plugin. Returns whether one was registered.
    pub fn unregister(&self, key: &str) -> bool {
        self.plugins.remove(key).is_some()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.plugins.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    fn lookup(&self, key: &str) -> Result<Arc<dyn PluginDyn>, PluginError> {
        self.plugins
            .get(key)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| PluginError::InvalidParams(format!("unknown plugin '{key}'")))
    }
}

impl PluginExecutor for PluginRegistry {
    async fn execute(&self, call: &PluginCall, cancel: CancellationToken) -> Result<Value, PluginError> {
        // Clone the Arc out so no map guard is held across the await.
        let plugin = self.lookup(&call.plugin)?;
        if !plugin.actions_dyn().iter().any(|a| a == &call.action) {
            return Err(PluginError::InvalidParams(format!(
                "plugin '{}' has no action '{}'",
                call.plugin, call.action
            )));
        }

        debug!(plugin = %call.plugin, action = %call.action, user_id = %call.user_id, "invoking plugin");
        plugin.invoke_boxed(&call.action, &call.params, cancel).await
    }

    fn plugins(&self) -> Vec<PluginInfo> {
        let mut infos: Vec<PluginInfo> = self
            .plugins
            .iter()
            .map(|entry| PluginInfo {
                key: entry.key().clone(),
                description: entry.value().description_dyn().to_string(),
                actions: entry.value().actions_dyn(),
            })
            .collect();
        infos.sort_by(|a, b| a.key.cmp(&b.key));
        infos
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("plugins", &self.plugins.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Upper;

    impl Plugin for Upper {
        fn key(&self) -> &str {
            "text"
        }

        fn description(&self) -> &str {
            "string helpers"
        }

        fn actions(&self) -> Vec<String> {
            vec!["upper".into()]
        }

        async fn invoke(&self, _action: &str, params: &Value, _cancel: CancellationToken) -> Result<Value, PluginError> {
            let text = params["text"]
                .as_str()
                .ok_or_else(|| PluginError::InvalidParams("'text' must be a string".into()))?;
            Ok(json!(text.to_uppercase()))
        }
    }

    fn call(plugin: &str, action: &str, params: Value) -> PluginCall {
        PluginCall {
            user_id: "tester".into(),
            plugin: plugin.into(),
            action: action.into(),
            params,
        }
    }

    #[tokio::test]
    async fn dispatches_to_registered_plugin() {
        let registry = PluginRegistry::new();
        registry.register(Upper);

        let out = registry
            .execute(&call("text", "upper", json!({"text": "hi"})), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out, json!("HI"));
    }

    #[tokio::test]
    async fn unknown_plugin_and_action_are_invalid_params() {
        let registry = PluginRegistry::new();
        registry.register(Upper);

        let err = registry
            .execute(&call("nope", "upper", json!({})), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::InvalidParams(ref m) if m.contains("unknown plugin")));

        let err = registry
            .execute(&call("text", "lower", json!({})), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::InvalidParams(ref m) if m.contains("no action 'lower'")));
    }

    #[test]
    fn listing_is_sorted_and_unregister_works() {
        let registry = PluginRegistry::new();
        registry.register(Upper);
        register_builtin_plugins(&registry);

        let keys: Vec<String> = registry.plugins().into_iter().map(|p| p.key).collect();
        assert_eq!(keys, vec!["log", "mock_email", "text"]);

        assert!(registry.unregister("text"));
        assert!(!registry.contains("text"));
        assert_eq!(registry.len(), 2);
    }
}
