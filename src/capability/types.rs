//! Capability Registry Types
//!
//! デバイスケイパビリティの登録情報とヘルス閾値バケット

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// ヘルススコアの閾値バケット
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthBucket {
    /// スコア 0.9 以上
    Healthy,
    /// スコア 0.7 以上
    Warning,
    /// スコア 0.5 以上
    Degraded,
    /// それ未満
    Critical,
}

impl HealthBucket {
    pub fn from_score(score: f64) -> Self {
        if score >= 0.9 {
            HealthBucket::Healthy
        } else if score >= 0.7 {
            HealthBucket::Warning
        } else if score >= 0.5 {
            HealthBucket::Degraded
        } else {
            HealthBucket::Critical
        }
    }

    /// degraded または critical
    pub fn is_impaired(self) -> bool {
        matches!(self, HealthBucket::Degraded | HealthBucket::Critical)
    }
}

impl fmt::Display for HealthBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HealthBucket::Healthy => "healthy",
            HealthBucket::Warning => "warning",
            HealthBucket::Degraded => "degraded",
            HealthBucket::Critical => "critical",
        };
        f.write_str(name)
    }
}

/// 登録時に宣言するケイパビリティ
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilitySpec {
    /// ケイパビリティ種別（valve, pump, temperature など）
    pub capability_type: String,
    /// 通信プロトコル（i2c, gpio, modbus など）
    pub protocol: String,
    /// バスアドレス
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    /// ピン番号
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pin: Option<u32>,
}

impl CapabilitySpec {
    pub fn new(capability_type: impl Into<String>, protocol: impl Into<String>) -> Self {
        Self {
            capability_type: capability_type.into(),
            protocol: protocol.into(),
            address: None,
            pin: None,
        }
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn with_pin(mut self, pin: u32) -> Self {
        self.pin = Some(pin);
        self
    }
}

/// Capability registration stored under a namespaced device id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityRegistration {
    /// `zone:device` 形式のデバイスID
    pub device_id: String,
    /// 所有ゾーン
    pub zone: String,
    pub capability_type: String,
    pub protocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pin: Option<u32>,
    /// ヘルススコア [0, 1]
    pub health: f64,
    /// 最終更新時刻
    pub updated_at: DateTime<Utc>,
}

impl CapabilityRegistration {
    pub fn health_bucket(&self) -> HealthBucket {
        HealthBucket::from_score(self.health)
    }
}

/// ヘルス更新の結果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthTransition {
    /// `zone:device` 形式のデバイスID
    pub device_id: String,
    pub zone: String,
    pub old_score: f64,
    pub new_score: f64,
    pub old: HealthBucket,
    pub new: HealthBucket,
}

impl HealthTransition {
    pub fn changed(&self) -> bool {
        self.old != self.new
    }

    /// バケットが変わり、新しいバケットが degraded/critical
    pub fn requires_revocation(&self) -> bool {
        self.changed() && self.new.is_impaired()
    }
}
