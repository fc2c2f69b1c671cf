//! External collaborator seams
//!
//! アービタはハードウェアに直接触れない。検証済みコマンドは `CommandSink` に、
//! 監査・テレメトリイベントは `EventSink` に渡される。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::grant::AccessGrant;
use crate::permission::CommandKind;
use crate::security::AuditEntry;

/// A command routed through a grant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub kind: CommandKind,
    /// 数値パラメータ（設定値・出力レベルなど）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl Command {
    pub fn new(kind: CommandKind) -> Self {
        Self {
            kind,
            value: None,
            params: serde_json::Value::Null,
        }
    }

    pub fn read() -> Self {
        Self::new(CommandKind::Read)
    }

    pub fn query() -> Self {
        Self::new(CommandKind::Query)
    }

    pub fn write(value: f64) -> Self {
        Self::new(CommandKind::Write).with_value(value)
    }

    pub fn actuate(value: f64) -> Self {
        Self::new(CommandKind::Actuate).with_value(value)
    }

    pub fn control(value: f64) -> Self {
        Self::new(CommandKind::Control).with_value(value)
    }

    pub fn with_value(mut self, value: f64) -> Self {
        self.value = Some(value);
        self
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }
}

/// Result reported by the command sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    pub success: bool,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl CommandResult {
    pub fn ok(data: serde_json::Value) -> Self {
        Self {
            success: true,
            data,
        }
    }
}

/// 検証済みコマンドを実際のドライバへ渡す外部シンク
#[async_trait]
pub trait CommandSink: Send + Sync {
    async fn execute(
        &self,
        grant: &AccessGrant,
        command: &Command,
    ) -> std::result::Result<CommandResult, String>;
}

/// 監査エントリのテレメトリ出力先
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, entry: &AuditEntry);
}

/// Forwards audit entries to `tracing` under the `arbiter::audit` target.
#[derive(Debug, Default, Clone)]
pub struct TracingEventSink;

#[async_trait]
impl EventSink for TracingEventSink {
    async fn emit(&self, entry: &AuditEntry) {
        info!(
            target: "arbiter::audit",
            sequence = entry.sequence,
            kind = %entry.kind,
            zone = entry.zone.as_deref().unwrap_or("-"),
            plugin_id = entry.plugin_id.as_deref().unwrap_or("-"),
            payload = %entry.payload,
            "audit"
        );
    }
}

/// Sink that accepts every command without touching hardware.
#[derive(Debug, Default, Clone)]
pub struct NullCommandSink;

#[async_trait]
impl CommandSink for NullCommandSink {
    async fn execute(
        &self,
        _grant: &AccessGrant,
        command: &Command,
    ) -> std::result::Result<CommandResult, String> {
        Ok(CommandResult::ok(serde_json::json!({
            "kind": command.kind,
            "value": command.value,
        })))
    }
}
