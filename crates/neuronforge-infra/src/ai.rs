//! Placeholder AI capability for setups without a model provider.

use tokio_util::sync::CancellationToken;

use neuronforge_core::workflow::capability::{AiCapability, AiRequest, AiResponse};
use neuronforge_types::error::AiError;

/// Fails every request with a model error.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnconfiguredAi;

impl AiCapability for UnconfiguredAi {
    async fn run(&self, _request: &AiRequest, _cancel: CancellationToken) -> Result<AiResponse, AiError> {
        Err(AiError::ModelError("no AI provider is configured".to_string()))
    }
}
