//! Capability Registry
//!
//! ゾーン単位で名前空間化されたデバイスケイパビリティのカタログ。
//! プレーンなデバイスIDは最初に登録されたゾーンに生涯束縛される。

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::types::{CapabilityRegistration, CapabilitySpec, HealthBucket, HealthTransition};
use crate::error::{Error, Result};

/// 名前空間の区切り文字
pub const NAMESPACE_SEPARATOR: char = ':';

/// Read side of the registry consumed by the arbiter.
#[async_trait]
pub trait CapabilityCatalog: Send + Sync {
    /// デバイスID（プレーンまたは `zone:device`）とケイパビリティ種別から登録情報を解決
    async fn resolve(&self, device_id: &str, capability_type: &str)
        -> Option<CapabilityRegistration>;

    /// デバイスの現在のヘルススコア
    async fn health(&self, device_id: &str) -> Option<f64>;
}

#[derive(Debug)]
struct DeviceEntry {
    zone: String,
    health: f64,
    updated_at: DateTime<Utc>,
    capabilities: BTreeMap<String, CapabilitySpec>,
}

impl DeviceEntry {
    fn registration(&self, plain_id: &str, spec: &CapabilitySpec) -> CapabilityRegistration {
        CapabilityRegistration {
            device_id: namespaced(&self.zone, plain_id),
            zone: self.zone.clone(),
            capability_type: spec.capability_type.clone(),
            protocol: spec.protocol.clone(),
            address: spec.address.clone(),
            pin: spec.pin,
            health: self.health,
            updated_at: self.updated_at,
        }
    }
}

fn namespaced(zone: &str, plain_id: &str) -> String {
    format!("{}{}{}", zone, NAMESPACE_SEPARATOR, plain_id)
}

fn validate_segment(kind: &str, value: &str) -> Result<()> {
    if value.is_empty() || value.contains(NAMESPACE_SEPARATOR) {
        return Err(Error::InvalidInput(format!(
            "{} {:?} must be non-empty and must not contain '{}'",
            kind, value, NAMESPACE_SEPARATOR
        )));
    }
    Ok(())
}

/// 名前空間付きケイパビリティレジストリ
#[derive(Debug, Default)]
pub struct CapabilityRegistry {
    devices: RwLock<HashMap<String, DeviceEntry>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// デバイスを登録する
    ///
    /// # 引数
    /// * `device_id` - プレーンなデバイスID、または `zone:device`
    /// * `zone` - 所有ゾーン
    /// * `capabilities` - 宣言するケイパビリティ（同じゾーンでの再登録はマージされる）
    ///
    /// 戻り値は名前空間付きデバイスID。
    pub async fn register(
        &self,
        device_id: &str,
        zone: &str,
        capabilities: Vec<CapabilitySpec>,
    ) -> Result<String> {
        validate_segment("zone", zone)?;
        let plain_id = match device_id.split_once(NAMESPACE_SEPARATOR) {
            Some((prefix, rest)) if prefix == zone => rest,
            Some((prefix, _)) => {
                return Err(Error::NamespaceConflict {
                    device_id: device_id.to_string(),
                    bound_zone: prefix.to_string(),
                    requested_zone: zone.to_string(),
                })
            }
            None => device_id,
        };
        validate_segment("device id", plain_id)?;
        for spec in &capabilities {
            validate_segment("capability type", &spec.capability_type)?;
        }

        let mut devices = self.devices.write().await;
        let now = Utc::now();
        match devices.get_mut(plain_id) {
            Some(entry) if entry.zone != zone => {
                warn!(
                    device_id = plain_id,
                    bound_zone = %entry.zone,
                    requested_zone = zone,
                    "Device already bound to another zone"
                );
                Err(Error::NamespaceConflict {
                    device_id: plain_id.to_string(),
                    bound_zone: entry.zone.clone(),
                    requested_zone: zone.to_string(),
                })
            }
            Some(entry) => {
                for spec in capabilities {
                    entry
                        .capabilities
                        .insert(spec.capability_type.clone(), spec);
                }
                entry.updated_at = now;
                debug!(
                    device_id = plain_id,
                    zone,
                    capabilities = entry.capabilities.len(),
                    "Merged device capabilities"
                );
                Ok(namespaced(zone, plain_id))
            }
            None => {
                let entry = DeviceEntry {
                    zone: zone.to_string(),
                    health: 1.0,
                    updated_at: now,
                    capabilities: capabilities
                        .into_iter()
                        .map(|spec| (spec.capability_type.clone(), spec))
                        .collect(),
                };
                info!(
                    device_id = plain_id,
                    zone,
                    capabilities = entry.capabilities.len(),
                    "Device registered"
                );
                devices.insert(plain_id.to_string(), entry);
                Ok(namespaced(zone, plain_id))
            }
        }
    }

    /// ヘルススコアを更新し、閾値バケットの遷移を返す
    ///
    /// スコアは [0, 1] にクランプされる。
    pub async fn update_health(&self, device_id: &str, score: f64) -> Result<HealthTransition> {
        if score.is_nan() {
            return Err(Error::InvalidInput(format!(
                "health score for {} is NaN",
                device_id
            )));
        }
        let score = score.clamp(0.0, 1.0);

        let mut devices = self.devices.write().await;
        let (plain_id, entry) = Self::lookup_mut(&mut devices, device_id)?;
        let old_score = entry.health;
        entry.health = score;
        entry.updated_at = Utc::now();

        let transition = HealthTransition {
            device_id: namespaced(&entry.zone, &plain_id),
            zone: entry.zone.clone(),
            old_score,
            new_score: score,
            old: HealthBucket::from_score(old_score),
            new: HealthBucket::from_score(score),
        };
        if transition.changed() {
            info!(
                device_id = %transition.device_id,
                old = %transition.old,
                new = %transition.new,
                "Health bucket changed"
            );
        }
        Ok(transition)
    }

    /// デバイスIDを `zone:device` 形式に正規化
    pub async fn namespaced_id(&self, device_id: &str) -> Result<String> {
        let devices = self.devices.read().await;
        let (plain_id, entry) = Self::lookup(&devices, device_id)?;
        Ok(namespaced(&entry.zone, plain_id))
    }

    pub async fn zone_of(&self, device_id: &str) -> Option<String> {
        let devices = self.devices.read().await;
        Self::lookup(&devices, device_id)
            .ok()
            .map(|(_, entry)| entry.zone.clone())
    }

    /// デバイスのケイパビリティ種別（ソート済み）
    pub async fn capability_types(&self, device_id: &str) -> Result<Vec<String>> {
        let devices = self.devices.read().await;
        let (_, entry) = Self::lookup(&devices, device_id)?;
        Ok(entry.capabilities.keys().cloned().collect())
    }

    pub async fn health_bucket(&self, device_id: &str) -> Option<HealthBucket> {
        self.health(device_id).await.map(HealthBucket::from_score)
    }

    /// 登録済みデバイス数
    pub async fn device_count(&self) -> usize {
        self.devices.read().await.len()
    }

    fn lookup<'a>(
        devices: &'a HashMap<String, DeviceEntry>,
        device_id: &'a str,
    ) -> Result<(&'a str, &'a DeviceEntry)> {
        let (zone, plain_id) = match device_id.split_once(NAMESPACE_SEPARATOR) {
            Some((zone, plain_id)) => (Some(zone), plain_id),
            None => (None, device_id),
        };
        match devices.get(plain_id) {
            Some(entry) if zone.map_or(true, |zone| zone == entry.zone) => Ok((plain_id, entry)),
            _ => Err(Error::DeviceNotFound(device_id.to_string())),
        }
    }

    fn lookup_mut<'a>(
        devices: &'a mut HashMap<String, DeviceEntry>,
        device_id: &str,
    ) -> Result<(String, &'a mut DeviceEntry)> {
        let (zone, plain_id) = match device_id.split_once(NAMESPACE_SEPARATOR) {
            Some((zone, plain_id)) => (Some(zone), plain_id),
            None => (None, device_id),
        };
        match devices.get_mut(plain_id) {
            Some(entry) if zone.map_or(true, |zone| zone == entry.zone) => {
                Ok((plain_id.to_string(), entry))
            }
            _ => Err(Error::DeviceNotFound(device_id.to_string())),
        }
    }
}

#[async_trait]
impl CapabilityCatalog for CapabilityRegistry {
    async fn resolve(
        &self,
        device_id: &str,
        capability_type: &str,
    ) -> Option<CapabilityRegistration> {
        let devices = self.devices.read().await;
        let (plain_id, entry) = Self::lookup(&devices, device_id).ok()?;
        entry
            .capabilities
            .get(capability_type)
            .map(|spec| entry.registration(plain_id, spec))
    }

    async fn health(&self, device_id: &str) -> Option<f64> {
        let devices = self.devices.read().await;
        Self::lookup(&devices, device_id)
            .ok()
            .map(|(_, entry)| entry.health)
    }
}
