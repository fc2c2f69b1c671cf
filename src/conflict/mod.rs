//! Conflict resolution
//!
//! 要求されたリソースが既に保持されている場合に、設定された戦略で判断を下す。
//! 戦略が判断できない場合は priority 戦略にフォールバックし、リソースキーが
//! 判断なしのまま残ることはない。

pub mod consensus;
mod resolver;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use consensus::{
    ConsensusKey, ConsensusOutcome, ConsensusResolver, ConsensusResult, VoteInput, VoteRole,
};
pub use resolver::ConflictResolver;

use crate::capability::HealthBucket;
use crate::grant::ResourceKey;
use crate::permission::PermissionLevel;

/// 競合解決戦略
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// 権限レベル → 優先度 → 要求時刻の順で比較
    #[default]
    Priority,
    /// 保持側は期限まで保持（要求側が上位レベルの場合を除く）
    Temporal,
    /// 劣化したリソースには読み取り系のみ
    HealthBased,
    /// ゾーンをまたぐ要求はフェデレーション時のみ
    ZoneLocal,
    /// 周波数領域の重み付き投票
    Consensus,
}

impl fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConflictStrategy::Priority => "priority",
            ConflictStrategy::Temporal => "temporal",
            ConflictStrategy::HealthBased => "health_based",
            ConflictStrategy::ZoneLocal => "zone_local",
            ConflictStrategy::Consensus => "consensus",
        };
        f.write_str(name)
    }
}

impl FromStr for ConflictStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "priority" => Ok(ConflictStrategy::Priority),
            "temporal" => Ok(ConflictStrategy::Temporal),
            "health_based" => Ok(ConflictStrategy::HealthBased),
            "zone_local" => Ok(ConflictStrategy::ZoneLocal),
            "consensus" => Ok(ConflictStrategy::Consensus),
            other => Err(format!("unknown conflict strategy: {}", other)),
        }
    }
}

/// 競合の判断
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// 保持側を取り消し、要求側に発行
    Grant,
    /// 保持側を共有に格下げし、要求側に共有グラントを発行
    Share,
    /// 要求側を拒否
    Deny,
    /// 判断できない
    NoConsensus,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Decision::Grant => "grant",
            Decision::Share => "share",
            Decision::Deny => "deny",
            Decision::NoConsensus => "no_consensus",
        };
        f.write_str(name)
    }
}

/// 競合の当事者
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contender {
    pub plugin_id: String,
    pub level: PermissionLevel,
    pub priority: u8,
    /// 要求（保持側は発行）時刻
    pub requested_at: DateTime<Utc>,
    /// プラグインの所属ゾーン
    pub zone: Option<String>,
    /// FEDERATE 権限を宣言しているか
    pub can_federate: bool,
    /// 投票強度 [0, 1]
    pub vote: f64,
    pub confidence: f64,
}

/// 競合解決の入力
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictContext {
    pub resource: ResourceKey,
    /// リソースの所有ゾーン
    pub resource_zone: String,
    pub health: HealthBucket,
    pub requester: Contender,
    /// 最も強い競合グラントの保持者
    pub holder: Contender,
    /// コンセンサス戦略のみで使用
    pub bystanders: Vec<Contender>,
}

/// 競合解決の結果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    /// 最終的な判断
    pub decision: Decision,
    /// 最終判断を下した戦略
    pub strategy: ConflictStrategy,
    /// 最初に選択された戦略
    pub requested_strategy: ConflictStrategy,
    /// 選択された戦略が priority に判断を委ねたか
    pub deferred: bool,
    /// 戦略の失敗によるフォールバック理由
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback: Option<String>,
    /// コンセンサスに投入した符号付き投票（保持側・傍観者を含む）
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub consensus_inputs: Vec<VoteInput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consensus: Option<ConsensusResult>,
    pub cache_hit: bool,
}
