//! Built-in plugins available without any configuration.
//!
//! - `mock_email`: `fetch` returns a fixed inbox, `send` pretends to send.
//! - `log`: `log` writes its params to the tracing log and echoes them.

use neuronforge_types::error::PluginError;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{Plugin, PluginRegistry};

/// Register every built-in plugin with its default settings.
pub fn register_builtin_plugins(registry: &PluginRegistry) {
    registry.register(MockEmailPlugin::with_sample_inbox());
    registry.register(LogPlugin);
}

// ---------------------------------------------------------------------------
// mock_email
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct MockEmailPlugin {
    messages: Vec<Value>,
}

impl MockEmailPlugin {
    pub fn new(messages: Vec<Value>) -> Self {
        Self { messages }
    }

    /// A small inbox mixing invoices with other mail.
    pub fn with_sample_inbox() -> Self {
        Self::new(vec![
            json!({"id": 1, "from": "billing@acme.test", "subject": "Invoice #1042", "body": "Amount due: 120.00", "unread": true}),
            json!({"id": 2, "from": "team@example.test", "subject": "Standup notes", "body": "See attached.", "unread": false}),
            json!({"id": 3, "from": "ap@globex.test", "subject": "INVOICE 77 overdue", "body": "Please pay 980.50", "unread": true}),
        ])
    }

    fn send(params: &Value) -> Result<Value, PluginError> {
        let to = params
            .get("to")
            .and_then(Value::as_str)
            .ok_or_else(|| PluginError::InvalidParams("send needs a 'to' address".into()))?;
        let subject = params.get("subject").and_then(Value::as_str).unwrap_or_default();
        let body = params.get("body").and_then(Value::as_str).unwrap_or_default();
        Ok(json!({
            "sent": true,
            "to": to,
            "subject": subject,
            "body_len": body.chars().count(),
        }))
    }
}

impl Plugin for MockEmailPlugin {
    fn key(&self) -> &str {
        "mock_email"
    }

    fn description(&self) -> &str {
        "In-memory mailbox for trying workflows"
    }

    fn actions(&self) -> Vec<String> {
        vec!["fetch".into(), "send".into()]
    }

    async fn invoke(&self, action: &str, params: &Value, _cancel: CancellationToken) -> Result<Value, PluginError> {
        match action {
            "fetch" => Ok(json!({
                "messages": self.messages,
                "count": self.messages.len(),
            })),
            "send" => Self::send(params),
            other => Err(PluginError::InvalidParams(format!("mock_email has no action '{other}'"))),
        }
    }
}

// ---------------------------------------------------------------------------
// log
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub struct LogPlugin;

impl Plugin for LogPlugin {
    fn key(&self) -> &str {
        "log"
    }

    fn description(&self) -> &str {
        "Write params to the log"
    }

    fn actions(&self) -> Vec<String> {
        vec!["log".into()]
    }

    async fn invoke(&self, _action: &str, params: &Value, _cancel: CancellationToken) -> Result<Value, PluginError> {
        info!(target: "neuronforge::plugin::log", params = %params, "workflow log");
        Ok(json!({ "logged": params }))
    }
}
