//! Error types for the capability arbiter.
//!
//! すべての拒否は呼び出し元に `Result` で返され、監査ログに記録される。
//! どのエラーもプロセス全体を停止させない。

use std::time::Duration;

use thiserror::Error;

use crate::conflict::{ConflictStrategy, Decision};
use crate::grant::GrantId;
use crate::permission::PermissionLevel;

/// Result type alias for arbiter operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for arbiter operations
#[derive(Debug, Error)]
pub enum Error {
    /// マニフェスト検証失敗（登録は一切適用されない）
    #[error("Manifest invalid: {0}")]
    ManifestInvalid(#[from] ManifestError),

    /// レート制限超過（リトライ可能）
    #[error("Rate limited: plugin {plugin_id} at {level} ({reason}), retry after {retry_after:?}")]
    RateLimited {
        plugin_id: String,
        level: PermissionLevel,
        reason: RateLimitReason,
        retry_after: Duration,
    },

    /// デバイスIDが別ゾーンに束縛済み
    #[error("Namespace conflict: device {device_id} is bound to zone {bound_zone}, not {requested_zone}")]
    NamespaceConflict {
        device_id: String,
        bound_zone: String,
        requested_zone: String,
    },

    /// コマンド制約違反（グラント自体は有効なまま）
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// Grant not found (expired, revoked or never issued)
    #[error("Grant not found: {0}")]
    GrantNotFound(GrantId),

    /// Plugin not registered
    #[error("Plugin not found: {0}")]
    PluginNotFound(String),

    /// Device not registered
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Device exists but does not expose the capability
    #[error("Capability {capability} not found on device {device_id}")]
    CapabilityNotFound {
        device_id: String,
        capability: String,
    },

    /// 宣言された権限を超える要求（権限昇格のブロック）
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// 競合解決の結果、要求が拒否された
    #[error("Conflict on {resource} resolved as {decision} by {strategy} strategy")]
    ConflictDenied {
        resource: String,
        decision: Decision,
        strategy: ConflictStrategy,
    },

    /// 戦略が判断を下せなかった（リゾルバ内部でフォールバックされる）
    #[error("No decision: {0}")]
    NoDecision(String),

    /// 他のプラグインが依存しているため削除できない
    #[error("Plugin {plugin_id} is a dependency of {dependents:?}")]
    DependencyInUse {
        plugin_id: String,
        dependents: Vec<String>,
    },

    /// Command sink failure
    #[error("Command sink error: {0}")]
    CommandSink(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Arbiter has been shut down
    #[error("Arbiter is shutting down")]
    ShuttingDown,

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// 呼び出し元が待機後に再試行できるエラーか
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::RateLimited { .. })
    }
}

/// マニフェスト拒否の具体的な理由
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ManifestError {
    #[error("plugin id {0:?} does not match ^[a-z0-9_]+$")]
    InvalidId(String),

    #[error("version {0:?} is not a semantic version")]
    InvalidVersion(String),

    #[error("version {version} is below the minimum {minimum}")]
    VersionTooLow { version: String, minimum: String },

    #[error("dependency {0} is not registered")]
    MissingDependency(String),

    #[error("plugin cannot depend on itself")]
    SelfDependency,

    #[error("permission declaration {0:?} is malformed")]
    InvalidPermission(String),

    #[error("integrity hash mismatch: expected {expected}, computed {computed}")]
    IntegrityMismatch { expected: String, computed: String },

    #[error("signature required in hardened mode")]
    MissingSignature,

    #[error("signature verification failed: {0}")]
    InvalidSignature(String),

    #[error("public key is not in the trusted key set")]
    UntrustedKey,
}

/// レート制限の拒否理由
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitReason {
    /// ペナルティ期間中
    Penalized,
    /// ウィンドウ内の予算を使い切った（ペナルティ開始）
    BudgetExhausted,
    /// 直近1秒のバースト上限
    Burst,
}

impl std::fmt::Display for RateLimitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RateLimitReason::Penalized => write!(f, "penalty active"),
            RateLimitReason::BudgetExhausted => write!(f, "window budget exhausted"),
            RateLimitReason::Burst => write!(f, "burst limit"),
        }
    }
}
