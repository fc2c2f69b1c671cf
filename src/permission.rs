//! Permission hierarchy
//!
//! 権限レベルは全順序を持ち、優先度比較と制約選択の唯一の基準となる。
//! 値はプロセスの生存期間中固定。

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ManifestError;

/// 権限レベル（MONITOR < READ < ... < FEDERATE）
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum PermissionLevel {
    /// 状態の監視のみ
    Monitor = 1,
    /// センサー値の読み取り
    Read = 2,
    /// 設定値の書き込み
    Write = 3,
    /// アクチュエータの駆動
    Actuate = 4,
    /// デバイスの制御
    Control = 5,
    /// 排他的な占有
    Exclusive = 6,
    /// ゾーン間フェデレーション
    Federate = 7,
}

impl PermissionLevel {
    /// 宣言順のすべてのレベル
    pub const ALL: [PermissionLevel; 7] = [
        PermissionLevel::Monitor,
        PermissionLevel::Read,
        PermissionLevel::Write,
        PermissionLevel::Actuate,
        PermissionLevel::Control,
        PermissionLevel::Exclusive,
        PermissionLevel::Federate,
    ];

    /// 最上位レベルのランク
    pub const MAX_RANK: u8 = 7;

    pub fn rank(self) -> u8 {
        self as u8
    }

    pub fn from_rank(rank: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|level| level.rank() == rank)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PermissionLevel::Monitor => "monitor",
            PermissionLevel::Read => "read",
            PermissionLevel::Write => "write",
            PermissionLevel::Actuate => "actuate",
            PermissionLevel::Control => "control",
            PermissionLevel::Exclusive => "exclusive",
            PermissionLevel::Federate => "federate",
        }
    }
}

impl fmt::Display for PermissionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PermissionLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|level| level.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown permission level: {}", s))
    }
}

/// Any capability type
pub const WILDCARD_CAPABILITY: &str = "*";

/// Capability-scoped permission declaration, written `capability:level`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PermissionDecl {
    pub capability: String,
    pub level: PermissionLevel,
}

impl PermissionDecl {
    pub fn new(capability: impl Into<String>, level: PermissionLevel) -> Self {
        Self {
            capability: capability.into(),
            level,
        }
    }

    /// 指定ケイパビリティに適用されるか（`*` はすべてに一致）
    pub fn covers(&self, capability: &str) -> bool {
        self.capability == WILDCARD_CAPABILITY || self.capability == capability
    }
}

impl fmt::Display for PermissionDecl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.capability, self.level)
    }
}

impl FromStr for PermissionDecl {
    type Err = ManifestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (capability, level) = s
            .rsplit_once(':')
            .ok_or_else(|| ManifestError::InvalidPermission(s.to_string()))?;
        if capability.is_empty() {
            return Err(ManifestError::InvalidPermission(s.to_string()));
        }
        let level = level
            .parse()
            .map_err(|_| ManifestError::InvalidPermission(s.to_string()))?;
        Ok(Self::new(capability, level))
    }
}

impl TryFrom<String> for PermissionDecl {
    type Error = ManifestError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PermissionDecl> for String {
    fn from(decl: PermissionDecl) -> Self {
        decl.to_string()
    }
}

/// The closed set of operations a command may perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandKind {
    Query,
    Read,
    Write,
    Actuate,
    Control,
}

impl CommandKind {
    pub const ALL: [CommandKind; 5] = [
        CommandKind::Query,
        CommandKind::Read,
        CommandKind::Write,
        CommandKind::Actuate,
        CommandKind::Control,
    ];

    /// このコマンド種別に必要な最低権限レベル
    pub fn min_level(self) -> PermissionLevel {
        match self {
            CommandKind::Query => PermissionLevel::Monitor,
            CommandKind::Read => PermissionLevel::Read,
            CommandKind::Write => PermissionLevel::Write,
            CommandKind::Actuate => PermissionLevel::Actuate,
            CommandKind::Control => PermissionLevel::Control,
        }
    }

    /// 読み取り系コマンド（critical 状態でも通過できる）
    pub fn is_read_type(self) -> bool {
        matches!(self, CommandKind::Query | CommandKind::Read)
    }

    /// 指定レベルで実行可能なコマンド種別
    pub fn permitted_at(level: PermissionLevel) -> Vec<CommandKind> {
        Self::ALL
            .iter()
            .copied()
            .filter(|kind| kind.min_level() <= level)
            .collect()
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommandKind::Query => "query",
            CommandKind::Read => "read",
            CommandKind::Write => "write",
            CommandKind::Actuate => "actuate",
            CommandKind::Control => "control",
        };
        f.write_str(name)
    }
}
