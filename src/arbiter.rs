//! Capability Arbiter
//!
//! プラグイン登録、ケイパビリティ要求、コマンド転送、ヘルス更新の入口。
//! すべての状態は `Arbiter` インスタンスが所有し、プロセス全体のシングルトンは持たない。
//!
//! ロック順序: リソーススロット → レジストリ／台帳インデックス。
//! レジストリのロックを保持したままスロットのロックを取得することはない。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::capability::{
    CapabilityCatalog, CapabilityRegistration, CapabilityRegistry, CapabilitySpec, HealthBucket,
    HealthTransition,
};
use crate::config::{ArbiterConfig, ConstraintOverrides};
use crate::conflict::{
    ConflictContext, ConflictResolver, ConflictStrategy, Contender, Decision, Resolution,
};
use crate::constraint::ConstraintEngine;
use crate::error::{Error, Result};
use crate::grant::{AccessGrant, GrantId, GrantLedger, LockType, ResourceKey, ResourceSlot};
use crate::manifest::{ManifestValidator, PluginManifest};
use crate::permission::PermissionLevel;
use crate::security::{AuditEntry, AuditEvent, AuditEventKind, AuditLog, AuditQuery, RateLimiter};
use crate::sinks::{Command, CommandResult, CommandSink, EventSink, NullCommandSink, TracingEventSink};

/// ケイパビリティ要求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityRequest {
    pub plugin_id: String,
    /// プレーンまたは `zone:device`
    pub device_id: String,
    pub capability_type: String,
    pub permission: PermissionLevel,
    /// 0..=255
    pub priority: u8,
    /// グラントの有効期間（None なら明示的な取り消しまで）
    pub duration: Option<Duration>,
    /// ロック規律の上書き（None ならレベルから導出）
    pub lock: Option<LockType>,
    /// コンセンサスでの投票強度 [0, 1]
    pub vote: f64,
    /// 投票の信頼度（None なら設定の既定値）
    pub confidence: Option<f64>,
    /// 制約の絞り込み
    pub constraints: ConstraintOverrides,
}

impl CapabilityRequest {
    pub fn new(
        plugin_id: impl Into<String>,
        device_id: impl Into<String>,
        capability_type: impl Into<String>,
        permission: PermissionLevel,
    ) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            device_id: device_id.into(),
            capability_type: capability_type.into(),
            permission,
            priority: 0,
            duration: None,
            lock: None,
            vote: 1.0,
            confidence: None,
            constraints: ConstraintOverrides::default(),
        }
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn lock(mut self, lock: LockType) -> Self {
        self.lock = Some(lock);
        self
    }

    pub fn vote(mut self, vote: f64, confidence: f64) -> Self {
        self.vote = vote;
        self.confidence = Some(confidence);
        self
    }

    pub fn constraints(mut self, constraints: ConstraintOverrides) -> Self {
        self.constraints = constraints;
        self
    }
}

/// コマンド転送の結果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandOutcome {
    pub grant_id: GrantId,
    pub result: CommandResult,
    /// 実際に送られた値
    pub value: Option<f64>,
    /// クランプ前の値
    pub clamped_from: Option<f64>,
    pub usage_count: u64,
}

/// メンテナンス実行結果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceReport {
    pub expired_grants: usize,
    pub pruned_consensus_entries: usize,
    pub pruned_rate_windows: usize,
    pub pruned_slots: usize,
}

/// Arbiter の構築
pub struct ArbiterBuilder {
    config: ArbiterConfig,
    command_sink: Option<Arc<dyn CommandSink>>,
    event_sink: Option<Arc<dyn EventSink>>,
}

impl ArbiterBuilder {
    pub fn new(config: ArbiterConfig) -> Self {
        Self {
            config,
            command_sink: None,
            event_sink: None,
        }
    }

    pub fn command_sink(mut self, sink: Arc<dyn CommandSink>) -> Self {
        self.command_sink = Some(sink);
        self
    }

    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = Some(sink);
        self
    }

    pub fn build(self) -> Result<Arbiter> {
        let config = self.config;
        config.validate()?;

        let validator = ManifestValidator::new(config.validator.clone())?;
        let event_sink = self
            .event_sink
            .unwrap_or_else(|| Arc::new(TracingEventSink));
        let audit = AuditLog::new(config.audit.capacity).with_sink(event_sink);

        info!(
            strategy = %config.conflict.strategy,
            hardened = config.validator.hardened,
            audit_capacity = config.audit.capacity,
            "Capability arbiter created"
        );

        Ok(Arbiter {
            validator,
            plugins: RwLock::new(HashMap::new()),
            request_limiter: RateLimiter::new(config.rate_limits.clone()),
            registry: CapabilityRegistry::new(),
            ledger: GrantLedger::new(),
            resolver: ConflictResolver::new(config.conflict.strategy, config.consensus.clone()),
            constraints: ConstraintEngine::new(&config.constraints),
            audit,
            command_sink: self
                .command_sink
                .unwrap_or_else(|| Arc::new(NullCommandSink)),
            shutting_down: AtomicBool::new(false),
            config,
        })
    }
}

/// ケイパビリティアービタ
pub struct Arbiter {
    config: ArbiterConfig,
    validator: ManifestValidator,
    plugins: RwLock<HashMap<String, Arc<PluginManifest>>>,
    request_limiter: RateLimiter,
    registry: CapabilityRegistry,
    ledger: GrantLedger,
    resolver: ConflictResolver,
    constraints: ConstraintEngine,
    audit: AuditLog,
    command_sink: Arc<dyn CommandSink>,
    shutting_down: AtomicBool,
}

impl std::fmt::Debug for Arbiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arbiter")
            .field("config", &self.config)
            .field("shutting_down", &self.shutting_down.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

fn grant_payload(grant: &AccessGrant, reason: &str) -> serde_json::Value {
    json!({
        "grant_id": grant.id,
        "resource": grant.resource_key().to_string(),
        "permission": grant.permission,
        "lock": grant.lock,
        "reason": reason,
    })
}

fn grant_event(kind: AuditEventKind, grant: &AccessGrant, reason: &str) -> AuditEvent {
    AuditEvent::new(kind, grant_payload(grant, reason))
        .zone(Some(grant.zone.clone()))
        .plugin(grant.plugin_id.clone())
}

impl Arbiter {
    /// 既定のシンクで作成
    pub fn new(config: ArbiterConfig) -> Result<Self> {
        ArbiterBuilder::new(config).build()
    }

    pub fn builder(config: ArbiterConfig) -> ArbiterBuilder {
        ArbiterBuilder::new(config)
    }

    pub fn config(&self) -> &ArbiterConfig {
        &self.config
    }

    /// ケイパビリティカタログ（読み取り側）
    pub fn catalog(&self) -> &dyn CapabilityCatalog {
        &self.registry
    }

    pub fn audit_log(&self) -> &AuditLog {
        &self.audit
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shutting_down.load(Ordering::SeqCst) {
            Err(Error::ShuttingDown)
        } else {
            Ok(())
        }
    }

    async fn record(&self, event: AuditEvent) -> AuditEntry {
        self.audit.record(event).await
    }

    async fn flush(&self, events: Vec<AuditEvent>) {
        for event in events {
            self.audit.record(event).await;
        }
    }

    // ---- プラグイン ----

    /// プラグインを登録（または置き換え）する
    ///
    /// 検証に失敗した場合は何も変更されない。成功時はレート制限カウンタを初期化し、
    /// 新しい宣言を超える既存グラントを取り消す。
    pub async fn register_plugin(&self, manifest: PluginManifest) -> Result<()> {
        self.ensure_running()?;
        let plugin_id = manifest.plugin_id.clone();
        let zone = manifest.zone.clone();
        let version = manifest.version.clone();

        let outcome = {
            let mut plugins = self.plugins.write().await;
            let validation = self
                .validator
                .validate(&manifest, |dependency| plugins.contains_key(dependency));
            match validation {
                Ok(()) => {
                    let manifest = Arc::new(manifest);
                    let previous = plugins.insert(plugin_id.clone(), manifest.clone());
                    Ok((manifest, previous))
                }
                Err(reason) => Err(reason),
            }
        };

        let (manifest, previous) = match outcome {
            Ok(registered) => registered,
            Err(reason) => {
                warn!(plugin_id = %plugin_id, reason = %reason, "Manifest rejected");
                self.record(
                    AuditEvent::new(
                        AuditEventKind::ManifestRejected,
                        json!({ "reason": reason.to_string(), "version": version }),
                    )
                    .zone(zone)
                    .plugin(plugin_id),
                )
                .await;
                return Err(reason.into());
            }
        };

        self.request_limiter.reset_plugin(&plugin_id).await;
        self.constraints.reset_plugin(&plugin_id).await;

        // 宣言が狭まった場合、超過したグラントを取り消す
        let mut revoked = Vec::new();
        if previous.is_some() {
            for grant in self.ledger.grants_for_plugin(&plugin_id).await {
                let allowed = manifest.effective_level(&grant.capability_type);
                if allowed.map_or(true, |level| grant.permission > level) {
                    if let Some(grant) = self.ledger.revoke(grant.id).await {
                        revoked.push(grant);
                    }
                }
            }
        }
        for grant in &revoked {
            self.record(grant_event(
                AuditEventKind::GrantRevoked,
                grant,
                "permission_narrowed",
            ))
            .await;
        }

        info!(
            plugin_id = %plugin_id,
            version = %manifest.version,
            replaced = previous.is_some(),
            "Plugin registered"
        );
        self.record(
            AuditEvent::new(
                AuditEventKind::PluginRegistered,
                json!({
                    "version": manifest.version,
                    "replaced": previous.is_some(),
                    "permissions": manifest.permissions().map(|p| p.to_string()).collect::<Vec<_>>(),
                    "revoked_grants": revoked.len(),
                }),
            )
            .zone(manifest.zone.clone())
            .plugin(plugin_id),
        )
        .await;
        Ok(())
    }

    /// プラグインを登録解除し、すべてのグラントを取り消す
    pub async fn deregister_plugin(&self, plugin_id: &str) -> Result<()> {
        self.ensure_running()?;
        let manifest = {
            let mut plugins = self.plugins.write().await;
            if !plugins.contains_key(plugin_id) {
                return Err(Error::PluginNotFound(plugin_id.to_string()));
            }
            let mut dependents: Vec<String> = plugins
                .values()
                .filter(|m| m.plugin_id != plugin_id && m.dependencies.iter().any(|d| d == plugin_id))
                .map(|m| m.plugin_id.clone())
                .collect();
            if !dependents.is_empty() {
                dependents.sort();
                return Err(Error::DependencyInUse {
                    plugin_id: plugin_id.to_string(),
                    dependents,
                });
            }
            plugins.remove(plugin_id)
        };

        let mut revoked = 0;
        for id in self.ledger.grant_ids_for_plugin(plugin_id).await {
            if let Some(grant) = self.ledger.revoke(id).await {
                revoked += 1;
                self.record(grant_event(AuditEventKind::GrantRevoked, &grant, "deregistered"))
                    .await;
            }
        }
        self.request_limiter.reset_plugin(plugin_id).await;
        self.constraints.reset_plugin(plugin_id).await;

        info!(plugin_id, revoked, "Plugin deregistered");
        self.record(
            AuditEvent::new(
                AuditEventKind::PluginDeregistered,
                json!({ "revoked_grants": revoked }),
            )
            .zone(manifest.and_then(|m| m.zone.clone()))
            .plugin(plugin_id),
        )
        .await;
        Ok(())
    }

    pub async fn manifest(&self, plugin_id: &str) -> Option<Arc<PluginManifest>> {
        self.plugins.read().await.get(plugin_id).cloned()
    }

    /// 登録済みプラグインID（ソート済み）
    pub async fn plugin_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.plugins.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    // ---- デバイス ----

    /// デバイスを登録する。戻り値は `zone:device` 形式のID
    pub async fn register_device(
        &self,
        device_id: &str,
        zone: &str,
        capabilities: Vec<CapabilitySpec>,
    ) -> Result<String> {
        self.ensure_running()?;
        let declared: Vec<String> = capabilities
            .iter()
            .map(|spec| spec.capability_type.clone())
            .collect();
        match self.registry.register(device_id, zone, capabilities).await {
            Ok(namespaced) => {
                self.record(
                    AuditEvent::new(
                        AuditEventKind::DeviceRegistered,
                        json!({ "device_id": namespaced, "capabilities": declared }),
                    )
                    .zone(Some(zone)),
                )
                .await;
                Ok(namespaced)
            }
            Err(Error::NamespaceConflict {
                device_id,
                bound_zone,
                requested_zone,
            }) => {
                warn!(%device_id, %bound_zone, %requested_zone, "Device namespace conflict");
                self.record(
                    AuditEvent::new(
                        AuditEventKind::NamespaceConflict,
                        json!({
                            "device_id": device_id,
                            "bound_zone": bound_zone,
                            "requested_zone": requested_zone,
                        }),
                    )
                    .zone(Some(requested_zone.clone())),
                )
                .await;
                Err(Error::NamespaceConflict {
                    device_id,
                    bound_zone,
                    requested_zone,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// ヘルススコアを更新する
    ///
    /// デバイスの全スロットをキー順にロックしてから更新するため、劣化中のバケットに対して
    /// グラントが発行されることはない。新しいバケットが degraded/critical に変わった場合、
    /// READ を超えるグラントをすべて取り消す。
    pub async fn update_device_health(
        &self,
        device_id: &str,
        score: f64,
    ) -> Result<HealthTransition> {
        self.ensure_running()?;
        let device = self.registry.namespaced_id(device_id).await?;
        let keys: Vec<ResourceKey> = self
            .registry
            .capability_types(&device)
            .await?
            .into_iter()
            .map(|capability| ResourceKey::new(device.clone(), capability))
            .collect();

        let mut slots = self.ledger.lock_slots(&keys).await;
        let transition = self.registry.update_health(&device, score).await?;

        let mut events = Vec::new();
        if transition.changed() {
            events.push(
                AuditEvent::new(
                    AuditEventKind::HealthTransition,
                    json!({
                        "device_id": transition.device_id,
                        "old": transition.old,
                        "new": transition.new,
                        "old_score": transition.old_score,
                        "new_score": transition.new_score,
                    }),
                )
                .zone(Some(transition.zone.clone())),
            );
        }

        if transition.requires_revocation() {
            let mut revoked = Vec::new();
            for slot in slots.iter_mut() {
                revoked.extend(
                    self.ledger
                        .remove_where(slot, |grant| grant.permission > PermissionLevel::Read)
                        .await,
                );
            }
            for grant in &revoked {
                events.push(grant_event(AuditEventKind::GrantRevoked, grant, "health"));
            }
            warn!(
                device_id = %transition.device_id,
                bucket = %transition.new,
                revoked = revoked.len(),
                "Health degraded, revoked grants above READ"
            );
            events.push(
                AuditEvent::new(
                    AuditEventKind::HealthRevocation,
                    json!({
                        "device_id": transition.device_id,
                        "bucket": transition.new,
                        "revoked": revoked.iter().map(|g| g.id).collect::<Vec<_>>(),
                    }),
                )
                .zone(Some(transition.zone.clone())),
            );
        }
        drop(slots);

        self.flush(events).await;
        Ok(transition)
    }

    pub async fn device_health(&self, device_id: &str) -> Option<(f64, HealthBucket)> {
        let score = self.registry.health(device_id).await?;
        Some((score, HealthBucket::from_score(score)))
    }

    // ---- グラント ----

    /// ケイパビリティを要求し、グラントIDを返す
    ///
    /// 拒否はすべて監査ログに残る。権限・レート・競合による拒否はそれぞれの
    /// イベントで、それ以外は `RequestRejected` で記録される。
    pub async fn request_capability(&self, request: CapabilityRequest) -> Result<GrantId> {
        let plugin_id = request.plugin_id.clone();
        let device_id = request.device_id.clone();
        let capability = request.capability_type.clone();
        let permission = request.permission;

        let result = self.try_request(request).await;
        if let Err(ref e) = result {
            if !Self::audited_rejection(e) {
                debug!(plugin_id = %plugin_id, error = %e, "Capability request rejected");
                let zone = self.manifest(&plugin_id).await.and_then(|m| m.zone.clone());
                self.record(
                    AuditEvent::new(
                        AuditEventKind::RequestRejected,
                        json!({
                            "device_id": device_id,
                            "capability": capability,
                            "requested": permission,
                            "error": e.to_string(),
                        }),
                    )
                    .zone(zone)
                    .plugin(plugin_id),
                )
                .await;
            }
        }
        result
    }

    /// 専用のイベントで記録済みの拒否
    fn audited_rejection(error: &Error) -> bool {
        matches!(
            error,
            Error::PermissionDenied(_) | Error::RateLimited { .. } | Error::ConflictDenied { .. }
        )
    }

    async fn try_request(&self, request: CapabilityRequest) -> Result<GrantId> {
        self.ensure_running()?;
        let manifest = self
            .manifest(&request.plugin_id)
            .await
            .ok_or_else(|| Error::PluginNotFound(request.plugin_id.clone()))?;
        Self::validate_request(&request)?;

        // 宣言を超える権限は要求できない
        let declared = manifest.effective_level(&request.capability_type);
        if declared.map_or(true, |level| request.permission > level) {
            let reason = format!(
                "{} requested {} on {} but declared {}",
                request.plugin_id,
                request.permission,
                request.capability_type,
                declared.map_or_else(|| "nothing".to_string(), |l| l.to_string())
            );
            warn!(plugin_id = %request.plugin_id, %reason, "Permission escalation blocked");
            self.record(
                AuditEvent::new(
                    AuditEventKind::PermissionDenied,
                    json!({
                        "device_id": request.device_id,
                        "capability": request.capability_type,
                        "requested": request.permission,
                        "declared": declared,
                    }),
                )
                .zone(manifest.zone.clone())
                .plugin(request.plugin_id.clone()),
            )
            .await;
            return Err(Error::PermissionDenied(reason));
        }

        if let Err(e) = self
            .request_limiter
            .check(&request.plugin_id, request.permission)
            .await
        {
            self.record_rate_limit(&e, "request", manifest.zone.clone()).await;
            return Err(e);
        }

        let registration = match self
            .registry
            .resolve(&request.device_id, &request.capability_type)
            .await
        {
            Some(registration) => registration,
            None => {
                let device_id = self.registry.namespaced_id(&request.device_id).await?;
                return Err(Error::CapabilityNotFound {
                    device_id,
                    capability: request.capability_type.clone(),
                });
            }
        };

        let lock = match request.lock {
            Some(LockType::None) if request.permission > PermissionLevel::Monitor => {
                return Err(Error::InvalidInput(format!(
                    "lock none is only available at monitor level, not {}",
                    request.permission
                )));
            }
            Some(LockType::Temporal) if request.duration.is_none() => {
                return Err(Error::InvalidInput(
                    "temporal lock requires a duration".to_string(),
                ));
            }
            Some(lock) => lock,
            None => LockType::default_for(request.permission),
        };

        let mut events = Vec::new();
        let result = self
            .arbitrate(&request, &manifest, &registration, lock, &mut events)
            .await;
        self.flush(events).await;
        result
    }

    fn validate_request(request: &CapabilityRequest) -> Result<()> {
        if !request.vote.is_finite() || !(0.0..=1.0).contains(&request.vote.abs()) {
            return Err(Error::InvalidInput(format!(
                "vote must be within [-1, 1], got {}",
                request.vote
            )));
        }
        if let Some(confidence) = request.confidence {
            if !(0.0..=1.0).contains(&confidence) {
                return Err(Error::InvalidInput(format!(
                    "confidence must be within [0, 1], got {}",
                    confidence
                )));
            }
        }
        if let Some(range) = request.constraints.value_range {
            if range.min.is_nan() || range.max.is_nan() || range.min > range.max {
                return Err(Error::InvalidInput(format!(
                    "value range [{}, {}] is empty",
                    range.min, range.max
                )));
            }
        }
        if request.duration.is_some_and(|d| d.is_zero()) {
            return Err(Error::InvalidInput("duration must be positive".to_string()));
        }
        Ok(())
    }

    /// スロットのロック下で発行・競合解決を行う
    async fn arbitrate(
        &self,
        request: &CapabilityRequest,
        manifest: &PluginManifest,
        registration: &CapabilityRegistration,
        lock: LockType,
        events: &mut Vec<AuditEvent>,
    ) -> Result<GrantId> {
        let key = ResourceKey::new(
            registration.device_id.clone(),
            request.capability_type.clone(),
        );
        let mut slot = self.ledger.lock_slot(&key).await;
        let now = Utc::now();

        for grant in self.ledger.reap_expired(&mut slot, now).await {
            events.push(grant_event(AuditEventKind::GrantExpired, &grant, "expired"));
        }

        // スロットのロック取得後にヘルスを読む
        let health = self
            .registry
            .health_bucket(&registration.device_id)
            .await
            .unwrap_or_else(|| registration.health_bucket());

        if health.is_impaired() && request.permission > PermissionLevel::Read {
            warn!(
                resource = %key,
                plugin_id = %request.plugin_id,
                %health,
                "Request above READ refused on impaired device"
            );
            events.push(
                AuditEvent::new(
                    AuditEventKind::PermissionDenied,
                    json!({
                        "resource": key.to_string(),
                        "requested": request.permission,
                        "health": health,
                        "reason": "device_health",
                    }),
                )
                .zone(Some(registration.zone.clone()))
                .plugin(request.plugin_id.clone()),
            );
            return Err(Error::ConflictDenied {
                resource: key.to_string(),
                decision: Decision::Deny,
                strategy: ConflictStrategy::HealthBased,
            });
        }

        let grant = self.build_grant(request, registration, lock, now)?;

        let (own, others): (Vec<AccessGrant>, Vec<AccessGrant>) = slot
            .conflicting(lock)
            .into_iter()
            .cloned()
            .partition(|g| g.plugin_id == request.plugin_id);

        let Some(holder) = others.iter().max_by_key(|g| g.strength()).cloned() else {
            return Ok(self.issue(&mut slot, grant, &own, events).await);
        };

        let strategy = match holder.lock {
            LockType::Temporal => ConflictStrategy::Temporal,
            LockType::Priority => ConflictStrategy::Priority,
            _ => self.resolver.strategy().await,
        };
        let context = self
            .conflict_context(request, manifest, registration, &holder, health, strategy, now)
            .await;
        let resolution = self.resolver.resolve(&context, Some(strategy)).await;

        let share_blocked = resolution.decision == Decision::Share
            && others.iter().any(|g| g.permission >= PermissionLevel::Exclusive);

        if let Some(ref reason) = resolution.fallback {
            events.push(
                AuditEvent::new(
                    AuditEventKind::ResolverFallback,
                    json!({
                        "resource": key.to_string(),
                        "strategy": resolution.requested_strategy,
                        "reason": reason,
                    }),
                )
                .zone(Some(registration.zone.clone()))
                .plugin(request.plugin_id.clone()),
            );
        }
        events.push(self.decision_event(&key, &context, &resolution, share_blocked));

        info!(
            resource = %key,
            requester = %request.plugin_id,
            holder = %holder.plugin_id,
            decision = %resolution.decision,
            strategy = %resolution.strategy,
            "Conflict decision"
        );

        let denied = |decision| Error::ConflictDenied {
            resource: key.to_string(),
            decision,
            strategy: resolution.strategy,
        };

        match resolution.decision {
            Decision::Grant => {
                for previous in &others {
                    if let Some(removed) = self.ledger.remove(&mut slot, previous.id).await {
                        events.push(grant_event(
                            AuditEventKind::GrantRevoked,
                            &removed,
                            "preempted",
                        ));
                    }
                }
                Ok(self.issue(&mut slot, grant, &own, events).await)
            }
            Decision::Share if share_blocked => {
                debug!(resource = %key, "Share impossible, holder granted at exclusive level");
                Err(denied(Decision::Deny))
            }
            Decision::Share => {
                for previous in others.iter().filter(|g| g.lock.is_exclusive()) {
                    if GrantLedger::downgrade(&mut slot, previous.id) {
                        events.push(grant_event(
                            AuditEventKind::GrantDowngraded,
                            previous,
                            "shared",
                        ));
                    }
                }
                let mut grant = grant;
                grant.lock = LockType::Shared;
                Ok(self.issue(&mut slot, grant, &own, events).await)
            }
            decision @ (Decision::Deny | Decision::NoConsensus) => Err(denied(decision)),
        }
    }

    /// グラントを発行する（要求側自身の競合グラントは置き換える）
    async fn issue(
        &self,
        slot: &mut ResourceSlot,
        grant: AccessGrant,
        superseded: &[AccessGrant],
        events: &mut Vec<AuditEvent>,
    ) -> GrantId {
        for previous in superseded {
            if let Some(removed) = self.ledger.remove(slot, previous.id).await {
                events.push(grant_event(
                    AuditEventKind::GrantRevoked,
                    &removed,
                    "superseded",
                ));
            }
        }

        let id = grant.id;
        info!(
            grant_id = %id,
            plugin_id = %grant.plugin_id,
            resource = %slot.key(),
            permission = %grant.permission,
            lock = %grant.lock,
            "Grant issued"
        );
        let mut event = grant_event(AuditEventKind::GrantIssued, &grant, "issued");
        event.payload["expires_at"] = json!(grant.expires_at);
        events.push(event);
        self.ledger.issue(slot, grant).await;
        id
    }

    fn build_grant(
        &self,
        request: &CapabilityRequest,
        registration: &CapabilityRegistration,
        lock: LockType,
        now: DateTime<Utc>,
    ) -> Result<AccessGrant> {
        let expires_at = match request.duration {
            Some(duration) => {
                let duration = chrono::Duration::from_std(duration)
                    .map_err(|e| Error::InvalidInput(format!("duration: {}", e)))?;
                let expires_at = now.checked_add_signed(duration).ok_or_else(|| {
                    Error::InvalidInput(format!(
                        "duration of {}s exceeds the representable expiry",
                        duration.num_seconds()
                    ))
                })?;
                Some(expires_at)
            }
            None => None,
        };
        let constraints = self
            .config
            .constraints
            .levels
            .get(request.permission)
            .narrowed_by(&request.constraints);

        Ok(AccessGrant {
            id: GrantId::new(),
            plugin_id: request.plugin_id.clone(),
            device_id: registration.device_id.clone(),
            zone: registration.zone.clone(),
            capability_type: request.capability_type.clone(),
            permission: request.permission,
            priority: request.priority,
            lock,
            constraints,
            issued_at: now,
            expires_at,
            usage_count: 0,
            last_used: None,
            vote: request.vote.abs(),
            vote_confidence: request
                .confidence
                .unwrap_or(self.config.consensus.default_confidence),
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn conflict_context(
        &self,
        request: &CapabilityRequest,
        manifest: &PluginManifest,
        registration: &CapabilityRegistration,
        holder: &AccessGrant,
        health: HealthBucket,
        strategy: ConflictStrategy,
        now: DateTime<Utc>,
    ) -> ConflictContext {
        let plugins = self.plugins.read().await;
        let holder_manifest = plugins.get(&holder.plugin_id);

        let bystanders = if strategy == ConflictStrategy::Consensus {
            let mut candidates: Vec<&Arc<PluginManifest>> = plugins
                .values()
                .filter(|m| m.plugin_id != request.plugin_id && m.plugin_id != holder.plugin_id)
                .filter(|m| m.permissions().any(|p| p.covers(&request.capability_type)))
                .collect();
            candidates.sort_by(|a, b| a.plugin_id.cmp(&b.plugin_id));
            candidates
                .into_iter()
                .take(self.config.consensus.max_bystanders)
                .filter_map(|m| {
                    let level = m.effective_level(&request.capability_type)?;
                    Some(Contender {
                        plugin_id: m.plugin_id.clone(),
                        level,
                        priority: 0,
                        requested_at: now,
                        zone: m.zone.clone(),
                        can_federate: m.can_federate(),
                        vote: 1.0,
                        confidence: self.config.consensus.bystander_confidence,
                    })
                })
                .collect()
        } else {
            Vec::new()
        };

        ConflictContext {
            resource: ResourceKey::new(
                registration.device_id.clone(),
                request.capability_type.clone(),
            ),
            resource_zone: registration.zone.clone(),
            health,
            requester: Contender {
                plugin_id: request.plugin_id.clone(),
                level: request.permission,
                priority: request.priority,
                requested_at: now,
                zone: manifest.zone.clone(),
                can_federate: manifest.can_federate(),
                vote: request.vote.abs(),
                confidence: request
                    .confidence
                    .unwrap_or(self.config.consensus.default_confidence),
            },
            holder: Contender {
                plugin_id: holder.plugin_id.clone(),
                level: holder.permission,
                priority: holder.priority,
                requested_at: holder.issued_at,
                zone: holder_manifest.and_then(|m| m.zone.clone()),
                can_federate: holder_manifest.is_some_and(|m| m.can_federate()),
                vote: holder.vote,
                confidence: holder.vote_confidence,
            },
            bystanders,
        }
    }

    fn decision_event(
        &self,
        key: &ResourceKey,
        context: &ConflictContext,
        resolution: &Resolution,
        share_blocked: bool,
    ) -> AuditEvent {
        AuditEvent::new(
            AuditEventKind::ConflictDecision,
            json!({
                "resource": key.to_string(),
                "decision": resolution.decision,
                "strategy": resolution.strategy,
                "requested_strategy": resolution.requested_strategy,
                "deferred": resolution.deferred,
                "share_blocked": share_blocked,
                "cache_hit": resolution.cache_hit,
                "health": context.health,
                "requester": context.requester,
                "holder": context.holder,
                "bystanders": context.bystanders,
                "consensus_inputs": resolution.consensus_inputs,
                "consensus": resolution.consensus,
            }),
        )
        .zone(Some(context.resource_zone.clone()))
        .plugin(context.requester.plugin_id.clone())
    }

    async fn record_rate_limit(&self, error: &Error, scope: &str, zone: Option<String>) {
        if let Error::RateLimited {
            plugin_id,
            level,
            reason,
            retry_after,
        } = error
        {
            self.record(
                AuditEvent::new(
                    AuditEventKind::RateLimitTripped,
                    json!({
                        "scope": scope,
                        "level": level,
                        "reason": reason.to_string(),
                        "retry_after_ms": retry_after.as_millis() as u64,
                    }),
                )
                .zone(zone)
                .plugin(plugin_id.clone()),
            )
            .await;
        }
    }

    /// グラントを取り消す。未知のIDでは何もしない
    pub async fn revoke(&self, grant_id: GrantId) -> bool {
        match self.ledger.revoke(grant_id).await {
            Some(grant) => {
                info!(grant_id = %grant_id, plugin_id = %grant.plugin_id, "Grant revoked");
                self.record(grant_event(AuditEventKind::GrantRevoked, &grant, "explicit"))
                    .await;
                true
            }
            None => {
                debug!(grant_id = %grant_id, "Revoke of unknown grant ignored");
                false
            }
        }
    }

    /// 有効なグラントを取得（期限切れは回収される）
    pub async fn grant(&self, grant_id: GrantId) -> Option<AccessGrant> {
        let (grant, expired) = self.ledger.get(grant_id, Utc::now()).await;
        for expired in &expired {
            self.record(grant_event(AuditEventKind::GrantExpired, expired, "expired"))
                .await;
        }
        grant
    }

    pub async fn grants_for_plugin(&self, plugin_id: &str) -> Vec<AccessGrant> {
        self.ledger.grants_for_plugin(plugin_id).await
    }

    pub async fn grants_for_device(&self, device_id: &str) -> Vec<AccessGrant> {
        match self.registry.namespaced_id(device_id).await {
            Ok(device) => self.ledger.grants_for_device(&device).await,
            Err(_) => Vec::new(),
        }
    }

    // ---- コマンド ----

    /// グラント経由でコマンドを転送する
    pub async fn route_command(&self, grant_id: GrantId, command: Command) -> Result<CommandOutcome> {
        let kind = command.kind;
        let result = self.try_route(grant_id, command).await;
        if let Err(ref e @ (Error::GrantNotFound(_) | Error::ShuttingDown)) = result {
            debug!(grant_id = %grant_id, error = %e, "Command rejected");
            self.record(AuditEvent::new(
                AuditEventKind::CommandRejected,
                json!({
                    "grant_id": grant_id,
                    "command": kind,
                    "error": e.to_string(),
                }),
            ))
            .await;
        }
        result
    }

    async fn try_route(&self, grant_id: GrantId, command: Command) -> Result<CommandOutcome> {
        self.ensure_running()?;
        let now = Utc::now();
        let grant = self
            .grant(grant_id)
            .await
            .ok_or(Error::GrantNotFound(grant_id))?;

        let health = self
            .registry
            .health_bucket(&grant.device_id)
            .await
            .unwrap_or(HealthBucket::Critical);

        let validated = match self.constraints.check(&grant, &command, health, now).await {
            Ok(validated) => validated,
            Err(e) => {
                match &e {
                    Error::RateLimited { .. } => {
                        self.record_rate_limit(&e, "command", Some(grant.zone.clone()))
                            .await
                    }
                    _ => {
                        warn!(grant_id = %grant_id, error = %e, "Command rejected");
                        let mut event =
                            grant_event(AuditEventKind::ConstraintViolation, &grant, "constraint");
                        event.payload["command"] = json!(command.kind);
                        event.payload["violation"] = json!(e.to_string());
                        self.record(event).await;
                    }
                }
                return Err(e);
            }
        };

        let executed = self
            .command_sink
            .execute(&grant, &validated.command)
            .await;

        let usage_count = self
            .ledger
            .record_usage(grant_id, Utc::now())
            .await
            .unwrap_or(grant.usage_count + 1);

        let mut event = grant_event(AuditEventKind::CommandRouted, &grant, "routed");
        event.payload["command"] = json!(validated.command.kind);
        event.payload["value"] = json!(validated.command.value);
        event.payload["clamped_from"] = json!(validated.clamped_from);
        event.payload["success"] = json!(executed.as_ref().map_or(false, |r| r.success));
        self.record(event).await;

        let result = executed.map_err(Error::CommandSink)?;
        debug!(grant_id = %grant_id, usage_count, "Command routed");
        Ok(CommandOutcome {
            grant_id,
            result,
            value: validated.command.value,
            clamped_from: validated.clamped_from,
            usage_count,
        })
    }

    // ---- 監査・戦略 ----

    pub async fn query_audit(&self, query: &AuditQuery) -> Vec<AuditEntry> {
        self.audit.query(query).await
    }

    pub async fn conflict_strategy(&self) -> ConflictStrategy {
        self.resolver.strategy().await
    }

    pub async fn set_conflict_strategy(&self, strategy: ConflictStrategy) {
        self.resolver.set_strategy(strategy).await;
    }

    // ---- ライフサイクル ----

    /// 期限切れグラントの回収とキャッシュ・カウンタの整理
    pub async fn run_maintenance(&self) -> MaintenanceReport {
        let expired = self.ledger.reap_all_expired(Utc::now()).await;
        for grant in &expired {
            self.record(grant_event(AuditEventKind::GrantExpired, grant, "expired"))
                .await;
        }

        let now = Instant::now();
        let report = MaintenanceReport {
            expired_grants: expired.len(),
            pruned_consensus_entries: self.resolver.consensus().prune_expired(now).await,
            pruned_rate_windows: self.request_limiter.prune_idle(now).await
                + self.constraints.prune_idle(now).await,
            pruned_slots: self.ledger.prune_empty_slots().await,
        };
        debug!(?report, "Maintenance pass finished");
        report
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// すべてのグラントを取り消し、以後の変更操作を拒否する
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let drained = self.ledger.drain().await;
        for grant in &drained {
            self.record(grant_event(AuditEventKind::GrantRevoked, grant, "shutdown"))
                .await;
        }
        info!(revoked = drained.len(), "Capability arbiter shut down");
        self.record(AuditEvent::new(
            AuditEventKind::Shutdown,
            json!({ "revoked_grants": drained.len() }),
        ))
        .await;
    }
}
