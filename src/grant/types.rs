//! Grant Types
//!
//! アクセスグラントとロック規律の定義

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::CommandConstraints;
use crate::permission::PermissionLevel;

/// グラントID
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GrantId(pub Uuid);

impl GrantId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for GrantId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for GrantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// ロック規律
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockType {
    /// 競合しない（監視のみ）
    None,
    /// 共有ロック同士は共存できる
    Shared,
    /// 排他ロック
    Exclusive,
    /// 期限まで保持される排他ロック（競合時は temporal 戦略で判断）
    Temporal,
    /// 優先度で奪い合う排他ロック（競合時は priority 戦略で判断）
    Priority,
}

impl LockType {
    /// 要求レベルから既定のロックを導出
    pub fn default_for(level: PermissionLevel) -> Self {
        match level {
            PermissionLevel::Monitor => LockType::None,
            PermissionLevel::Read => LockType::Shared,
            _ => LockType::Exclusive,
        }
    }

    pub fn is_exclusive(self) -> bool {
        matches!(
            self,
            LockType::Exclusive | LockType::Temporal | LockType::Priority
        )
    }

    /// 同じリソースキー上で共存できるか
    pub fn is_compatible_with(self, other: LockType) -> bool {
        match (self, other) {
            (LockType::None, _) | (_, LockType::None) => true,
            (LockType::Shared, LockType::Shared) => true,
            _ => false,
        }
    }
}

impl fmt::Display for LockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LockType::None => "none",
            LockType::Shared => "shared",
            LockType::Exclusive => "exclusive",
            LockType::Temporal => "temporal",
            LockType::Priority => "priority",
        };
        f.write_str(name)
    }
}

impl FromStr for LockType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(LockType::None),
            "shared" => Ok(LockType::Shared),
            "exclusive" => Ok(LockType::Exclusive),
            "temporal" => Ok(LockType::Temporal),
            "priority" => Ok(LockType::Priority),
            other => Err(format!("unknown lock type: {}", other)),
        }
    }
}

/// リソースキー（名前空間付きデバイスID + ケイパビリティ種別）
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceKey {
    pub device_id: String,
    pub capability_type: String,
}

impl ResourceKey {
    pub fn new(device_id: impl Into<String>, capability_type: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            capability_type: capability_type.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.device_id, self.capability_type)
    }
}

/// アクセスグラント
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessGrant {
    /// グラントID
    pub id: GrantId,
    /// 所有プラグイン
    pub plugin_id: String,
    /// 対象デバイス（`zone:device`）
    pub device_id: String,
    /// デバイスの所有ゾーン
    pub zone: String,
    /// ケイパビリティ種別
    pub capability_type: String,
    /// 権限レベル
    pub permission: PermissionLevel,
    /// 要求時の優先度
    pub priority: u8,
    /// ロック規律
    pub lock: LockType,
    /// 発行時点の制約スナップショット
    pub constraints: CommandConstraints,
    /// 発行時刻
    pub issued_at: DateTime<Utc>,
    /// 有効期限（None なら明示的な取り消しまで）
    pub expires_at: Option<DateTime<Utc>>,
    /// コマンド実行回数
    pub usage_count: u64,
    /// 最終使用時刻
    pub last_used: Option<DateTime<Utc>>,
    /// コンセンサスでの保持側の投票強度 [0, 1]
    pub vote: f64,
    /// 投票の信頼度 [0, 1]
    pub vote_confidence: f64,
}

impl AccessGrant {
    pub fn resource_key(&self) -> ResourceKey {
        ResourceKey::new(self.device_id.clone(), self.capability_type.clone())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires| expires <= now)
    }

    /// 競合時の強さ（レベル、次に優先度）
    pub fn strength(&self) -> (PermissionLevel, u8) {
        (self.permission, self.priority)
    }
}
