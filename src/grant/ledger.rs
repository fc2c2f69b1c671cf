//! Grant Ledger
//!
//! 有効なグラントの集合。リソースキーごとのスロットを `tokio::sync::Mutex` で直列化し、
//! 異なるキーへの操作は並行に進む。期限切れのグラントはスロットのロック下で遅延回収される。

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::debug;

use super::types::{AccessGrant, GrantId, LockType, ResourceKey};

/// 1つのリソースキー上のグラント
#[derive(Debug)]
pub struct ResourceSlot {
    key: ResourceKey,
    grants: Vec<AccessGrant>,
}

impl ResourceSlot {
    fn new(key: ResourceKey) -> Self {
        Self {
            key,
            grants: Vec::new(),
        }
    }

    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    pub fn grants(&self) -> &[AccessGrant] {
        &self.grants
    }

    pub fn is_empty(&self) -> bool {
        self.grants.is_empty()
    }

    /// 要求ロックと共存できないグラント
    pub fn conflicting(&self, lock: LockType) -> Vec<&AccessGrant> {
        self.grants
            .iter()
            .filter(|grant| !grant.lock.is_compatible_with(lock))
            .collect()
    }

    pub fn exclusive_count(&self) -> usize {
        self.grants.iter().filter(|g| g.lock.is_exclusive()).count()
    }
}

#[derive(Debug, Clone)]
struct GrantLocation {
    key: ResourceKey,
    plugin_id: String,
}

/// グラント台帳
#[derive(Debug, Default)]
pub struct GrantLedger {
    slots: RwLock<HashMap<ResourceKey, Arc<Mutex<ResourceSlot>>>>,
    index: RwLock<HashMap<GrantId, GrantLocation>>,
}

impl GrantLedger {
    pub fn new() -> Self {
        Self::default()
    }

    async fn slot(&self, key: &ResourceKey) -> Arc<Mutex<ResourceSlot>> {
        if let Some(slot) = self.slots.read().await.get(key) {
            return slot.clone();
        }
        self.slots
            .write()
            .await
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(ResourceSlot::new(key.clone()))))
            .clone()
    }

    /// リソースキーのスロットをロックする（到着順に待機）
    pub async fn lock_slot(&self, key: &ResourceKey) -> OwnedMutexGuard<ResourceSlot> {
        self.slot(key).await.lock_owned().await
    }

    /// 複数のスロットをキー順にロックする
    pub async fn lock_slots(&self, keys: &[ResourceKey]) -> Vec<OwnedMutexGuard<ResourceSlot>> {
        let mut keys = keys.to_vec();
        keys.sort();
        keys.dedup();

        let mut guards = Vec::with_capacity(keys.len());
        for key in &keys {
            guards.push(self.lock_slot(key).await);
        }
        guards
    }

    /// スロットにグラントを追加
    pub async fn issue(&self, slot: &mut ResourceSlot, grant: AccessGrant) {
        self.index.write().await.insert(
            grant.id,
            GrantLocation {
                key: slot.key.clone(),
                plugin_id: grant.plugin_id.clone(),
            },
        );
        debug!(grant_id = %grant.id, resource = %slot.key, lock = %grant.lock, "Grant issued");
        slot.grants.push(grant);
    }

    /// スロットからグラントを削除
    pub async fn remove(&self, slot: &mut ResourceSlot, id: GrantId) -> Option<AccessGrant> {
        let position = slot.grants.iter().position(|grant| grant.id == id)?;
        let grant = slot.grants.remove(position);
        self.index.write().await.remove(&id);
        Some(grant)
    }

    /// 条件に一致するグラントをまとめて削除
    pub async fn remove_where(
        &self,
        slot: &mut ResourceSlot,
        predicate: impl Fn(&AccessGrant) -> bool,
    ) -> Vec<AccessGrant> {
        let (removed, kept): (Vec<_>, Vec<_>) =
            std::mem::take(&mut slot.grants).into_iter().partition(|g| predicate(g));
        slot.grants = kept;
        if !removed.is_empty() {
            let mut index = self.index.write().await;
            for grant in &removed {
                index.remove(&grant.id);
            }
        }
        removed
    }

    /// 排他グラントを共有ロックに格下げ
    pub fn downgrade(slot: &mut ResourceSlot, id: GrantId) -> bool {
        match slot.grants.iter_mut().find(|grant| grant.id == id) {
            Some(grant) if grant.lock != LockType::Shared => {
                grant.lock = LockType::Shared;
                true
            }
            _ => false,
        }
    }

    /// 期限切れのグラントを回収
    pub async fn reap_expired(
        &self,
        slot: &mut ResourceSlot,
        now: DateTime<Utc>,
    ) -> Vec<AccessGrant> {
        self.remove_where(slot, |grant| grant.is_expired_at(now))
            .await
    }

    async fn location(&self, id: GrantId) -> Option<GrantLocation> {
        self.index.read().await.get(&id).cloned()
    }

    /// 有効なグラントを取得（期限切れなら回収して None）
    ///
    /// 戻り値の 2 番目は回収された期限切れグラント。
    pub async fn get(
        &self,
        id: GrantId,
        now: DateTime<Utc>,
    ) -> (Option<AccessGrant>, Vec<AccessGrant>) {
        let Some(location) = self.location(id).await else {
            return (None, Vec::new());
        };
        let mut slot = self.lock_slot(&location.key).await;
        let expired = self.reap_expired(&mut slot, now).await;
        let grant = slot.grants.iter().find(|grant| grant.id == id).cloned();
        (grant, expired)
    }

    /// グラントを取り消す（存在しなければ None）
    pub async fn revoke(&self, id: GrantId) -> Option<AccessGrant> {
        let location = self.location(id).await?;
        let mut slot = self.lock_slot(&location.key).await;
        self.remove(&mut slot, id).await
    }

    /// 使用回数と最終使用時刻を更新
    pub async fn record_usage(&self, id: GrantId, now: DateTime<Utc>) -> Option<u64> {
        let location = self.location(id).await?;
        let mut slot = self.lock_slot(&location.key).await;
        let grant = slot.grants.iter_mut().find(|grant| grant.id == id)?;
        grant.usage_count += 1;
        grant.last_used = Some(now);
        Some(grant.usage_count)
    }

    /// プラグインが保持するグラントID
    pub async fn grant_ids_for_plugin(&self, plugin_id: &str) -> Vec<GrantId> {
        let mut ids: Vec<GrantId> = self
            .index
            .read()
            .await
            .iter()
            .filter(|(_, location)| location.plugin_id == plugin_id)
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    /// プラグインが保持するグラント
    pub async fn grants_for_plugin(&self, plugin_id: &str) -> Vec<AccessGrant> {
        let keys: Vec<ResourceKey> = {
            let index = self.index.read().await;
            let mut keys: Vec<ResourceKey> = index
                .values()
                .filter(|location| location.plugin_id == plugin_id)
                .map(|location| location.key.clone())
                .collect();
            keys.sort();
            keys.dedup();
            keys
        };

        let mut grants = Vec::new();
        for key in keys {
            let slot = self.lock_slot(&key).await;
            grants.extend(
                slot.grants
                    .iter()
                    .filter(|grant| grant.plugin_id == plugin_id)
                    .cloned(),
            );
        }
        grants
    }

    /// デバイス上のグラント
    pub async fn grants_for_device(&self, device_id: &str) -> Vec<AccessGrant> {
        let mut grants = Vec::new();
        for slot in self.slots_where(|key| key.device_id == device_id).await {
            let slot = slot.lock().await;
            grants.extend(slot.grants.iter().cloned());
        }
        grants
    }

    /// すべてのスロットから期限切れグラントを回収
    pub async fn reap_all_expired(&self, now: DateTime<Utc>) -> Vec<AccessGrant> {
        let mut expired = Vec::new();
        for slot in self.slots_where(|_| true).await {
            let mut slot = slot.lock_owned().await;
            expired.extend(self.reap_expired(&mut slot, now).await);
        }
        expired
    }

    /// すべてのグラントを取り消す（停止時）
    pub async fn drain(&self) -> Vec<AccessGrant> {
        let mut drained = Vec::new();
        for slot in self.slots_where(|_| true).await {
            let mut slot = slot.lock_owned().await;
            drained.extend(self.remove_where(&mut slot, |_| true).await);
        }
        drained
    }

    /// 空で誰も参照していないスロットを削除
    pub async fn prune_empty_slots(&self) -> usize {
        let mut slots = self.slots.write().await;
        let before = slots.len();
        // 書き込みロック中は新しい参照が増えないので、参照数 1 なら安全に削除できる
        slots.retain(|_, slot| {
            Arc::strong_count(slot) > 1 || slot.try_lock().map_or(true, |s| !s.is_empty())
        });
        before - slots.len()
    }

    /// 有効なグラント数
    pub async fn len(&self) -> usize {
        self.index.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn slots_where(
        &self,
        filter: impl Fn(&ResourceKey) -> bool,
    ) -> Vec<Arc<Mutex<ResourceSlot>>> {
        let slots = self.slots.read().await;
        let mut matching: Vec<(&ResourceKey, &Arc<Mutex<ResourceSlot>>)> =
            slots.iter().filter(|(key, _)| filter(key)).collect();
        matching.sort_by(|a, b| a.0.cmp(b.0));
        matching.into_iter().map(|(_, slot)| slot.clone()).collect()
    }
}
