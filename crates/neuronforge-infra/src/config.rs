//! Engine configuration loading.
//!
//! `neuronforge.toml` is optional: a missing or malformed file falls back to
//! defaults with a warning. `NEURONFORGE_*` variables are applied on top.

use std::path::Path;

use neuronforge_types::config::EngineConfig;
use thiserror::Error;
use tracing::{debug, warn};

/// Default file name looked up in the working directory.
pub const CONFIG_FILE_NAME: &str = "neuronforge.toml";

const ENV_PREFIX: &str = "NEURONFORGE_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Parse a TOML document into an [`EngineConfig`].
pub fn parse_engine_config(text: &str) -> Result<EngineConfig, ConfigError> {
    Ok(toml::from_str(text)?)
}

/// Load the config at `path`, or defaults if it cannot be read or parsed.
pub async fn load_engine_config(path: &Path) -> EngineConfig {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            debug!("No config found at {}, using defaults", path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            warn!("Failed to read {}: {err}, using defaults", path.display());
            return EngineConfig::default();
        }
    };

    match parse_engine_config(&content) {
        Ok(config) => config,
        Err(err) => {
            warn!("Failed to parse {}: {err}, using defaults", path.display());
            EngineConfig::default()
        }
    }
}

/// Apply `NEURONFORGE_*` overrides read through `lookup`.
///
/// Recognized: `MAX_PARALLEL_STEPS`, `CONTINUE_ON_ERROR`,
/// `WORKFLOW_TIMEOUT_SECS`, `STEP_TIMEOUT_SECS`, `MAX_CHECKPOINTS` (`none`
/// keeps every checkpoint), `USER_ID`. Unparseable values are ignored with a
/// warning.
pub fn apply_env_overrides(mut config: EngineConfig, lookup: impl Fn(&str) -> Option<String>) -> EngineConfig {
    let get = |name: &str| lookup(&format!("{ENV_PREFIX}{name}")).map(|v| v.trim().to_string());

    if let Some(value) = get("MAX_PARALLEL_STEPS") {
        match value.parse::<usize>() {
            Ok(n) if n > 0 => config.max_parallel_steps = n,
            _ => ignored("MAX_PARALLEL_STEPS", &value),
        }
    }
    if let Some(value) = get("CONTINUE_ON_ERROR") {
        match parse_bool(&value) {
            Some(flag) => config.continue_on_error = flag,
            None => ignored("CONTINUE_ON_ERROR", &value),
        }
    }
    if let Some(value) = get("WORKFLOW_TIMEOUT_SECS") {
        match value.parse() {
            Ok(secs) => config.workflow_timeout_secs = secs,
            Err(_) => ignored("WORKFLOW_TIMEOUT_SECS", &value),
        }
    }
    if let Some(value) = get("STEP_TIMEOUT_SECS") {
        match value.parse() {
            Ok(secs) => config.step_timeout_secs = secs,
            Err(_) => ignored("STEP_TIMEOUT_SECS", &value),
        }
    }
    if let Some(value) = get("MAX_CHECKPOINTS") {
        if value.eq_ignore_ascii_case("none") {
            config.max_checkpoints = None;
        } else {
            match value.parse() {
                Ok(n) => config.max_checkpoints = Some(n),
                Err(_) => ignored("MAX_CHECKPOINTS", &value),
            }
        }
    }
    if let Some(value) = get("USER_ID").filter(|v| !v.is_empty()) {
        config.user_id = value;
    }

    config
}

/// [`apply_env_overrides`] against the process environment.
pub fn apply_process_env(config: EngineConfig) -> EngineConfig {
    apply_env_overrides(config, |name| std::env::var(name).ok())
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn ignored(name: &str, value: &str) {
    warn!("Ignoring {ENV_PREFIX}{name}={value:?}: not a valid value");
}
