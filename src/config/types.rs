use chrono::NaiveTime;
use serde::{Deserialize, Serialize};

use crate::conflict::ConflictStrategy;
use crate::error::{Error, Result};
use crate::logging::LogConfig;
use crate::permission::{CommandKind, PermissionLevel};

/// Main arbiter configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ArbiterConfig {
    /// Manifest validation settings
    pub validator: ValidatorConfig,

    /// Capability-request rate limits
    pub rate_limits: RateLimitConfig,

    /// Per-level command constraints
    pub constraints: ConstraintConfig,

    /// Conflict resolution settings
    pub conflict: ConflictConfig,

    /// Consensus resolver settings
    pub consensus: ConsensusConfig,

    /// Audit log settings
    pub audit: AuditConfig,

    /// Logging configuration
    pub logging: LogConfig,
}

impl ArbiterConfig {
    /// Reject values the arbiter cannot operate with
    pub fn validate(&self) -> Result<()> {
        self.rate_limits.validate("rate_limits")?;
        self.constraints.validate()?;
        self.consensus.validate()?;

        if self.audit.capacity == 0 {
            return Err(Error::Config("audit.capacity must be positive".to_string()));
        }
        if crate::manifest::parse_version(&self.validator.min_version).is_none() {
            return Err(Error::Config(format!(
                "validator.min_version {:?} is not a semantic version",
                self.validator.min_version
            )));
        }
        Ok(())
    }
}

/// One value per permission level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelTable<T> {
    pub monitor: T,
    pub read: T,
    pub write: T,
    pub actuate: T,
    pub control: T,
    pub exclusive: T,
    pub federate: T,
}

impl<T> LevelTable<T> {
    /// Build a table by evaluating `f` for every level
    pub fn from_fn(mut f: impl FnMut(PermissionLevel) -> T) -> Self {
        Self {
            monitor: f(PermissionLevel::Monitor),
            read: f(PermissionLevel::Read),
            write: f(PermissionLevel::Write),
            actuate: f(PermissionLevel::Actuate),
            control: f(PermissionLevel::Control),
            exclusive: f(PermissionLevel::Exclusive),
            federate: f(PermissionLevel::Federate),
        }
    }

    pub fn get(&self, level: PermissionLevel) -> &T {
        match level {
            PermissionLevel::Monitor => &self.monitor,
            PermissionLevel::Read => &self.read,
            PermissionLevel::Write => &self.write,
            PermissionLevel::Actuate => &self.actuate,
            PermissionLevel::Control => &self.control,
            PermissionLevel::Exclusive => &self.exclusive,
            PermissionLevel::Federate => &self.federate,
        }
    }

    pub fn get_mut(&mut self, level: PermissionLevel) -> &mut T {
        match level {
            PermissionLevel::Monitor => &mut self.monitor,
            PermissionLevel::Read => &mut self.read,
            PermissionLevel::Write => &mut self.write,
            PermissionLevel::Actuate => &mut self.actuate,
            PermissionLevel::Control => &mut self.control,
            PermissionLevel::Exclusive => &mut self.exclusive,
            PermissionLevel::Federate => &mut self.federate,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (PermissionLevel, &T)> {
        PermissionLevel::ALL
            .iter()
            .map(move |level| (*level, self.get(*level)))
    }
}

/// マニフェスト検証設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    /// 受け入れる最小バージョン
    pub min_version: String,
    /// 署名必須モード（欠落・不正な署名はフォールバックなしで拒否）
    pub hardened: bool,
    /// 信頼する Ed25519 公開鍵（base64）。空なら鍵の出所は問わない
    pub trusted_keys: Vec<String>,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            min_version: "0.1.0".to_string(),
            hardened: false,
            trusted_keys: Vec::new(),
        }
    }
}

/// レベルごとのレート制限ポリシー
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    /// ウィンドウあたりの最大リクエスト数
    pub requests_per_minute: u32,
    /// 直近1秒あたりの最大リクエスト数
    pub burst_size: u32,
    /// 予算超過時のペナルティ期間（秒）
    pub penalty_secs: u64,
}

impl RateLimitPolicy {
    pub const fn new(requests_per_minute: u32, burst_size: u32, penalty_secs: u64) -> Self {
        Self {
            requests_per_minute,
            burst_size,
            penalty_secs,
        }
    }

    /// 上位レベルほど予算が小さく、ペナルティが長い
    pub fn default_for(level: PermissionLevel) -> Self {
        match level {
            PermissionLevel::Monitor => Self::new(120, 20, 5),
            PermissionLevel::Read => Self::new(100, 15, 10),
            PermissionLevel::Write => Self::new(60, 10, 15),
            PermissionLevel::Actuate => Self::new(30, 5, 30),
            PermissionLevel::Control => Self::new(10, 2, 60),
            PermissionLevel::Exclusive => Self::new(5, 1, 120),
            PermissionLevel::Federate => Self::new(10, 2, 90),
        }
    }
}

/// スライディングウィンドウ型レート制限設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// 有効/無効
    pub enabled: bool,
    /// ウィンドウ長（秒）
    pub window_secs: u64,
    /// レベルごとのポリシー
    pub levels: LevelTable<RateLimitPolicy>,
}

impl RateLimitConfig {
    fn validate(&self, section: &str) -> Result<()> {
        if self.window_secs == 0 {
            return Err(Error::Config(format!(
                "{}.window_secs must be positive",
                section
            )));
        }
        for (level, policy) in self.levels.iter() {
            if policy.requests_per_minute == 0 || policy.burst_size == 0 {
                return Err(Error::Config(format!(
                    "{}.levels.{} must allow at least one request",
                    section, level
                )));
            }
        }
        Ok(())
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_secs: 60,
            levels: LevelTable::from_fn(RateLimitPolicy::default_for),
        }
    }
}

/// Inclusive numeric range for command values
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValueRange {
    pub min: f64,
    pub max: f64,
}

impl ValueRange {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn clamp(&self, value: f64) -> f64 {
        value.clamp(self.min, self.max)
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }

    /// 両方の範囲に収まる部分（重ならなければ None）
    pub fn intersect(&self, other: &ValueRange) -> Option<ValueRange> {
        let min = self.min.max(other.min);
        let max = self.max.min(other.max);
        (min <= max).then_some(ValueRange { min, max })
    }
}

/// Time-of-day window (UTC) during which commands are refused.
/// `start > end` wraps past midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlackoutWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl BlackoutWindow {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, time: NaiveTime) -> bool {
        if self.start <= self.end {
            time >= self.start && time < self.end
        } else {
            time >= self.start || time < self.end
        }
    }
}

/// コマンド制約（レベルごと、グラント発行時にスナップショットされる）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandConstraints {
    /// コマンド用レート制限（ケイパビリティ要求とは別）
    pub rate: RateLimitPolicy,
    /// 値のクランプ範囲
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_range: Option<ValueRange>,
    /// 許可されたコマンド種別
    pub allowed_commands: Vec<CommandKind>,
    /// 時間帯による禁止ウィンドウ
    #[serde(default)]
    pub blackout_windows: Vec<BlackoutWindow>,
}

impl CommandConstraints {
    pub fn default_for(level: PermissionLevel) -> Self {
        let rate = match level {
            PermissionLevel::Monitor => RateLimitPolicy::new(600, 50, 5),
            PermissionLevel::Read => RateLimitPolicy::new(300, 30, 5),
            PermissionLevel::Write => RateLimitPolicy::new(120, 10, 10),
            PermissionLevel::Actuate => RateLimitPolicy::new(60, 5, 15),
            PermissionLevel::Control => RateLimitPolicy::new(30, 3, 30),
            PermissionLevel::Exclusive => RateLimitPolicy::new(20, 2, 60),
            PermissionLevel::Federate => RateLimitPolicy::new(20, 2, 60),
        };
        let value_range = match level {
            PermissionLevel::Monitor | PermissionLevel::Read => None,
            PermissionLevel::Write | PermissionLevel::Actuate => Some(ValueRange::new(0.0, 100.0)),
            _ => Some(ValueRange::new(-1000.0, 1000.0)),
        };
        Self {
            rate,
            value_range,
            allowed_commands: CommandKind::permitted_at(level),
            blackout_windows: Vec::new(),
        }
    }

    /// 要求側の制約で絞り込む（広げることはできない）
    pub fn narrowed_by(&self, overrides: &ConstraintOverrides) -> Self {
        let mut narrowed = self.clone();

        if let Some(requested) = overrides.value_range {
            narrowed.value_range = match self.value_range {
                Some(current) => Some(current.intersect(&requested).unwrap_or_else(|| {
                    let pinned = requested.min.clamp(current.min, current.max);
                    ValueRange::new(pinned, pinned)
                })),
                None => Some(requested),
            };
        }

        if let Some(ref commands) = overrides.allowed_commands {
            narrowed
                .allowed_commands
                .retain(|kind| commands.contains(kind));
        }

        narrowed
    }
}

/// 要求時に指定できる制約の絞り込み
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConstraintOverrides {
    pub value_range: Option<ValueRange>,
    pub allowed_commands: Option<Vec<CommandKind>>,
}

/// コマンド制約エンジン設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConstraintConfig {
    /// コマンド用レート制限のウィンドウ長（秒）
    pub window_secs: u64,
    /// レベルごとの制約
    pub levels: LevelTable<CommandConstraints>,
}

impl ConstraintConfig {
    fn validate(&self) -> Result<()> {
        if self.window_secs == 0 {
            return Err(Error::Config(
                "constraints.window_secs must be positive".to_string(),
            ));
        }
        for (level, constraints) in self.levels.iter() {
            if let Some(range) = constraints.value_range {
                if range.min.is_nan() || range.max.is_nan() || range.min > range.max {
                    return Err(Error::Config(format!(
                        "constraints.levels.{}.value_range is empty",
                        level
                    )));
                }
            }
            if constraints.rate.requests_per_minute == 0 || constraints.rate.burst_size == 0 {
                return Err(Error::Config(format!(
                    "constraints.levels.{}.rate must allow at least one command",
                    level
                )));
            }
        }
        Ok(())
    }
}

impl Default for ConstraintConfig {
    fn default() -> Self {
        Self {
            window_secs: 60,
            levels: LevelTable::from_fn(CommandConstraints::default_for),
        }
    }
}

/// 競合解決設定
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConflictConfig {
    /// 使用する戦略
    pub strategy: ConflictStrategy,
}

/// 周波数領域コンセンサス設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    /// これ未満のコヒーレンスは no_consensus
    pub coherence_threshold: f64,
    /// これを超えるコンセンサス値は grant
    pub grant_threshold: f64,
    /// これを超えるコンセンサス値は share
    pub share_threshold: f64,
    /// 信号ベクトル長
    pub signal_length: usize,
    /// 支配ビン周辺のコヒーレンス窓（±ビン数）
    pub coherence_window: usize,
    /// 参加させる傍観プラグインの上限
    pub max_bystanders: usize,
    pub requester_weight: f64,
    pub holder_weight: f64,
    pub bystander_weight: f64,
    /// 要求に信頼度が指定されていない場合の既定値
    pub default_confidence: f64,
    /// 傍観プラグインの信頼度
    pub bystander_confidence: f64,
    /// これ未満の信頼度の参加者は dissenter として報告
    pub min_confidence: f64,
    /// 結果キャッシュの有効期間（秒）
    pub cache_ttl_secs: u64,
    /// no_consensus の場合に priority 戦略へ委譲するか
    pub defer_to_priority: bool,
}

impl ConsensusConfig {
    fn validate(&self) -> Result<()> {
        let unit = [
            ("coherence_threshold", self.coherence_threshold),
            ("default_confidence", self.default_confidence),
            ("bystander_confidence", self.bystander_confidence),
            ("min_confidence", self.min_confidence),
        ];
        for (name, value) in unit {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::Config(format!(
                    "consensus.{} must be within [0, 1], got {}",
                    name, value
                )));
            }
        }
        if !(-1.0..=1.0).contains(&self.grant_threshold)
            || !(-1.0..=1.0).contains(&self.share_threshold)
            || self.share_threshold > self.grant_threshold
        {
            return Err(Error::Config(
                "consensus thresholds must satisfy -1 <= share <= grant <= 1".to_string(),
            ));
        }
        let min_length = 2 * 3 * PermissionLevel::MAX_RANK as usize + 2;
        if self.signal_length < min_length {
            return Err(Error::Config(format!(
                "consensus.signal_length must be at least {}",
                min_length
            )));
        }
        if [self.requester_weight, self.holder_weight, self.bystander_weight]
            .iter()
            .any(|w| !w.is_finite() || *w < 0.0)
        {
            return Err(Error::Config(
                "consensus weights must be finite and non-negative".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            coherence_threshold: 0.6,
            grant_threshold: 0.3,
            share_threshold: 0.0,
            signal_length: 64,
            coherence_window: 3,
            max_bystanders: 8,
            requester_weight: 1.0,
            holder_weight: 1.0,
            bystander_weight: 0.5,
            default_confidence: 0.8,
            bystander_confidence: 0.5,
            min_confidence: 0.5,
            cache_ttl_secs: 300,
            defer_to_priority: true,
        }
    }
}

/// 監査ログ設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// リングバッファ容量（古いものから破棄）
    pub capacity: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self { capacity: 10_000 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        ArbiterConfig::default().validate().unwrap();
    }

    #[test]
    fn test_stricter_levels_get_smaller_budgets() {
        let limits = RateLimitConfig::default();
        let control = limits.levels.get(PermissionLevel::Control);
        let read = limits.levels.get(PermissionLevel::Read);
        let exclusive = limits.levels.get(PermissionLevel::Exclusive);
        assert!(control.requests_per_minute < read.requests_per_minute);
        assert!(exclusive.requests_per_minute < control.requests_per_minute);
        assert!(exclusive.penalty_secs > read.penalty_secs);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = ArbiterConfig::default();
        config.consensus.coherence_threshold = 1.5;
        assert!(config.validate().is_err());

        let mut config = ArbiterConfig::default();
        config.audit.capacity = 0;
        assert!(config.validate().is_err());

        let mut config = ArbiterConfig::default();
        config.validator.min_version = "one".to_string();
        assert!(config.validate().is_err());

        let mut config = ArbiterConfig::default();
        config.consensus.signal_length = 8;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_blackout_window_wraps_midnight() {
        let window = BlackoutWindow::new(
            NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(6, 0, 0).unwrap(),
        );
        assert!(window.contains(NaiveTime::from_hms_opt(23, 30, 0).unwrap()));
        assert!(window.contains(NaiveTime::from_hms_opt(5, 59, 0).unwrap()));
        assert!(!window.contains(NaiveTime::from_hms_opt(12, 0, 0).unwrap()));
    }

    #[test]
    fn test_overrides_only_narrow() {
        let base = CommandConstraints::default_for(PermissionLevel::Actuate);
        let narrowed = base.narrowed_by(&ConstraintOverrides {
            value_range: Some(ValueRange::new(-50.0, 40.0)),
            allowed_commands: Some(vec![CommandKind::Read, CommandKind::Control]),
        });
        assert_eq!(narrowed.value_range, Some(ValueRange::new(0.0, 40.0)));
        // Control is not permitted at ACTUATE, so it cannot be added back
        assert_eq!(narrowed.allowed_commands, vec![CommandKind::Read]);
    }

    #[test]
    fn test_level_table_lookup() {
        let table = LevelTable::from_fn(|level| level.rank());
        for level in PermissionLevel::ALL {
            assert_eq!(*table.get(level), level.rank());
        }
    }
}
