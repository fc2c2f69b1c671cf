//! Arbiter configuration
//!
//! デフォルト値 → TOML ファイル → 環境変数 の順に上書きされる。

mod loader;
mod types;

pub use loader::ConfigLoader;
pub use types::{
    ArbiterConfig, AuditConfig, BlackoutWindow, CommandConstraints, ConflictConfig,
    ConsensusConfig, ConstraintConfig, ConstraintOverrides, LevelTable, RateLimitConfig,
    RateLimitPolicy, ValidatorConfig, ValueRange,
};
