//! Shared application state for command handlers.

use std::path::Path;

use neuronforge_core::workflow::capability::{BoxAiCapability, BoxExecutionHooks, BoxPluginExecutor};
use neuronforge_core::workflow::executor::WorkflowEngine;
use neuronforge_infra::ai::UnconfiguredAi;
use neuronforge_infra::config::{CONFIG_FILE_NAME, apply_process_env, load_engine_config};
use neuronforge_infra::hooks::TracingHooks;
use neuronforge_infra::plugin::{PluginRegistry, register_builtin_plugins};
use neuronforge_types::config::EngineConfig;

pub struct AppState {
    pub config: EngineConfig,
    pub registry: PluginRegistry,
    pub engine: WorkflowEngine,
}

impl AppState {
    /// Load config (file, then `NEURONFORGE_*` overrides) and wire the engine
    /// to the built-in plugins and tracing hooks.
    pub async fn init(config_path: Option<&Path>) -> Self {
        let path = config_path.unwrap_or_else(|| Path::new(CONFIG_FILE_NAME));
        let config = apply_process_env(load_engine_config(path).await);
        tracing::debug!(?config, "engine config loaded");

        let registry = PluginRegistry::new();
        register_builtin_plugins(&registry);

        let engine = WorkflowEngine::new(
            config.clone(),
            BoxPluginExecutor::new(registry.clone()),
            BoxAiCapability::new(UnconfiguredAi),
        )
        .with_hooks(BoxExecutionHooks::new(TracingHooks::new()));

        Self {
            config,
            registry,
            engine,
        }
    }
}
