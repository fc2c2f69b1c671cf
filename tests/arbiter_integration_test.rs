//! Arbiter Integration Tests
//!
//! 公開APIを通したエンドツーエンドのテスト

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::Mutex;

use capability_arbiter::capability::CapabilitySpec;
use capability_arbiter::config::{ArbiterConfig, ConstraintOverrides, ValueRange};
use capability_arbiter::conflict::{ConflictStrategy, Decision};
use capability_arbiter::grant::{AccessGrant, LockType};
use capability_arbiter::manifest::PluginManifest;
use capability_arbiter::permission::{CommandKind, PermissionLevel};
use capability_arbiter::security::{AuditEventKind, AuditQuery};
use capability_arbiter::sinks::{Command, CommandResult, CommandSink};
use capability_arbiter::{Arbiter, CapabilityRequest, Error, HealthBucket};

/// 受け取ったコマンドを記録するシンク
#[derive(Default)]
struct RecordingSink {
    commands: Mutex<Vec<Command>>,
}

#[async_trait]
impl CommandSink for RecordingSink {
    async fn execute(
        &self,
        _grant: &AccessGrant,
        command: &Command,
    ) -> Result<CommandResult, String> {
        self.commands.lock().await.push(command.clone());
        Ok(CommandResult::ok(serde_json::json!({ "accepted": true })))
    }
}

/// 常に失敗するシンク
struct FailingSink;

#[async_trait]
impl CommandSink for FailingSink {
    async fn execute(
        &self,
        _grant: &AccessGrant,
        _command: &Command,
    ) -> Result<CommandResult, String> {
        Err("modbus timeout".to_string())
    }
}

fn plugin(id: &str, capability: &str, level: PermissionLevel) -> PluginManifest {
    PluginManifest::new(id, id, "1.0.0", "integration")
        .with_permission(capability, level)
        .with_permission("*", PermissionLevel::Monitor)
}

async fn greenhouse() -> Arbiter {
    let arbiter = Arbiter::new(ArbiterConfig::default()).expect("arbiter");
    arbiter
        .register_device(
            "valve1",
            "zone1",
            vec![
                CapabilitySpec::new("valve", "gpio").with_pin(17),
                CapabilitySpec::new("flow", "i2c").with_address("0x48"),
            ],
        )
        .await
        .expect("device");
    arbiter
}

#[tokio::test]
async fn test_end_to_end_priority_then_consensus() {
    let arbiter = greenhouse().await;
    arbiter
        .register_plugin(plugin("plugin_a", "valve", PermissionLevel::Control))
        .await
        .unwrap();
    arbiter
        .register_plugin(plugin("plugin_b", "valve", PermissionLevel::Actuate))
        .await
        .unwrap();

    // A: CONTROL → 排他ロック
    let a_grant = arbiter
        .request_capability(
            CapabilityRequest::new("plugin_a", "valve1", "valve", PermissionLevel::Control)
                .priority(50)
                .vote(1.0, 0.9),
        )
        .await
        .unwrap();
    let held = arbiter.grant(a_grant).await.unwrap();
    assert_eq!(held.lock, LockType::Exclusive);
    assert_eq!(held.device_id, "zone1:valve1");

    // priority: 優先度が高くても権限レベルで A が勝つ
    let request_b = || {
        CapabilityRequest::new("plugin_b", "zone1:valve1", "valve", PermissionLevel::Actuate)
            .priority(200)
            .vote(1.0, 0.95)
    };
    let err = arbiter.request_capability(request_b()).await.unwrap_err();
    assert!(matches!(
        err,
        Error::ConflictDenied {
            decision: Decision::Deny,
            strategy: ConflictStrategy::Priority,
            ..
        }
    ));
    assert!(arbiter.grant(a_grant).await.is_some());

    // consensus: 結果は文書化された写像に従う
    arbiter
        .set_conflict_strategy(ConflictStrategy::Consensus)
        .await;
    let outcome = arbiter.request_capability(request_b()).await;

    let decisions = arbiter
        .query_audit(&AuditQuery::kinds([AuditEventKind::ConflictDecision]))
        .await;
    let last = decisions.last().unwrap();
    let consensus = &last.payload["consensus"];
    let coherence = consensus["coherence"].as_f64().unwrap();
    let value = consensus["consensus_value"].as_f64().unwrap();
    assert_eq!(consensus["participants"], 2);
    // 投入された符号付きの投票
    let inputs = last.payload["consensus_inputs"].as_array().unwrap();
    assert_eq!(inputs.len(), 2);
    assert_eq!(inputs[0]["role"], "requester");
    assert_eq!(inputs[0]["vote"], 1.0);
    assert_eq!(inputs[1]["role"], "holder");
    assert_eq!(inputs[1]["plugin_id"], "plugin_a");
    assert_eq!(inputs[1]["vote"], -1.0);

    let config = arbiter.config().consensus.clone();
    let granted = coherence > config.coherence_threshold && value > config.grant_threshold;
    if granted {
        let b_grant = outcome.unwrap();
        assert!(arbiter.grant(a_grant).await.is_none());
        assert_eq!(arbiter.grant(b_grant).await.unwrap().plugin_id, "plugin_b");
    } else {
        assert!(outcome.is_err());
        assert!(arbiter.grant(a_grant).await.is_some());
    }
    // この入力ではコヒーレンスが閾値を下回り、priority に委譲される
    assert!(coherence < config.coherence_threshold);
    assert_eq!(last.payload["deferred"], true);
    assert_eq!(last.payload["decision"], "deny");
}

#[tokio::test]
async fn test_consensus_grant_revokes_holder() {
    let arbiter = greenhouse().await;
    arbiter
        .set_conflict_strategy(ConflictStrategy::Consensus)
        .await;
    arbiter
        .register_plugin(plugin("plugin_a", "valve", PermissionLevel::Control))
        .await
        .unwrap();
    arbiter
        .register_plugin(plugin("plugin_b", "valve", PermissionLevel::Actuate))
        .await
        .unwrap();

    let a_grant = arbiter
        .request_capability(
            CapabilityRequest::new("plugin_a", "valve1", "valve", PermissionLevel::Control)
                .priority(50)
                .vote(0.2, 0.5),
        )
        .await
        .unwrap();

    // 支配ビン 4 (ACTUATE) → 4/7 > 0.3、コヒーレンス ≈ 0.81
    let b_grant = arbiter
        .request_capability(
            CapabilityRequest::new("plugin_b", "valve1", "valve", PermissionLevel::Actuate)
                .priority(200)
                .vote(1.0, 0.95),
        )
        .await
        .unwrap();

    assert!(arbiter.grant(a_grant).await.is_none());
    let granted = arbiter.grant(b_grant).await.unwrap();
    assert_eq!(granted.lock, LockType::Exclusive);

    let decision = arbiter
        .query_audit(&AuditQuery::kinds([AuditEventKind::ConflictDecision]))
        .await;
    let consensus = &decision[0].payload["consensus"];
    assert_eq!(consensus["decision"], "grant");
    assert_eq!(consensus["dominant_index"], 4);
    assert!(consensus["coherence"].as_f64().unwrap() > 0.6);

    let revoked = arbiter
        .query_audit(
            &AuditQuery::kinds([AuditEventKind::GrantRevoked]).plugin("plugin_a"),
        )
        .await;
    assert_eq!(revoked.len(), 1);
    assert_eq!(revoked[0].payload["reason"], "preempted");
}

#[tokio::test]
async fn test_namespace_isolation() {
    let arbiter = Arbiter::new(ArbiterConfig::default()).unwrap();
    let id = arbiter
        .register_device(
            "pump1",
            "greenhouse_a",
            vec![CapabilitySpec::new("pump", "modbus")],
        )
        .await
        .unwrap();
    assert_eq!(id, "greenhouse_a:pump1");

    let err = arbiter
        .register_device(
            "pump1",
            "greenhouse_b",
            vec![CapabilitySpec::new("pump", "modbus")],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NamespaceConflict { .. }));

    // 同じゾーンでの再登録はマージされる
    arbiter
        .register_device(
            "pump1",
            "greenhouse_a",
            vec![CapabilitySpec::new("pressure", "i2c")],
        )
        .await
        .unwrap();
    arbiter
        .register_plugin(plugin("irrigation", "pressure", PermissionLevel::Read))
        .await
        .unwrap();
    assert!(arbiter
        .request_capability(CapabilityRequest::new(
            "irrigation",
            "pump1",
            "pressure",
            PermissionLevel::Read
        ))
        .await
        .is_ok());

    let conflicts = arbiter
        .query_audit(&AuditQuery::kinds([AuditEventKind::NamespaceConflict]))
        .await;
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].zone.as_deref(), Some("greenhouse_b"));
}

#[tokio::test]
async fn test_health_revocation_keeps_read_grant() {
    let arbiter = greenhouse().await;
    arbiter
        .register_plugin(plugin("reader", "flow", PermissionLevel::Read))
        .await
        .unwrap();
    arbiter
        .register_plugin(plugin("controller", "valve", PermissionLevel::Control))
        .await
        .unwrap();

    let read = arbiter
        .request_capability(CapabilityRequest::new(
            "reader",
            "valve1",
            "flow",
            PermissionLevel::Read,
        ))
        .await
        .unwrap();
    let control = arbiter
        .request_capability(CapabilityRequest::new(
            "controller",
            "valve1",
            "valve",
            PermissionLevel::Control,
        ))
        .await
        .unwrap();

    let transition = arbiter.update_device_health("valve1", 0.2).await.unwrap();
    assert_eq!(transition.old, HealthBucket::Healthy);
    assert_eq!(transition.new, HealthBucket::Critical);

    assert!(arbiter.grant(read).await.is_some());
    assert!(arbiter.grant(control).await.is_none());
    assert!(matches!(
        arbiter
            .route_command(control, Command::control(1.0))
            .await
            .unwrap_err(),
        Error::GrantNotFound(_)
    ));

    let summary = arbiter
        .query_audit(&AuditQuery::kinds([AuditEventKind::HealthRevocation]))
        .await;
    assert_eq!(summary.len(), 1);
    assert_eq!(summary[0].payload["revoked"].as_array().unwrap().len(), 1);

    // critical 中の READ グラントは読み取りのみ転送できる
    assert!(arbiter.route_command(read, Command::read()).await.is_ok());
}

#[tokio::test]
async fn test_health_without_bucket_change_revokes_nothing() {
    let arbiter = greenhouse().await;
    arbiter
        .register_plugin(plugin("controller", "valve", PermissionLevel::Control))
        .await
        .unwrap();
    let control = arbiter
        .request_capability(CapabilityRequest::new(
            "controller",
            "valve1",
            "valve",
            PermissionLevel::Control,
        ))
        .await
        .unwrap();

    arbiter.update_device_health("zone1:valve1", 0.95).await.unwrap();
    assert!(arbiter.grant(control).await.is_some());
    assert!(arbiter
        .query_audit(&AuditQuery::kinds([AuditEventKind::HealthTransition]))
        .await
        .is_empty());
    assert_eq!(
        arbiter.device_health("valve1").await,
        Some((0.95, HealthBucket::Healthy))
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_exclusivity_under_concurrent_requests() {
    let arbiter = Arc::new(greenhouse().await);
    for i in 0..8 {
        arbiter
            .register_plugin(plugin(&format!("writer_{}", i), "valve", PermissionLevel::Write))
            .await
            .unwrap();
    }

    let tasks = (0..8u8).map(|i| {
        let arbiter = arbiter.clone();
        tokio::spawn(async move {
            arbiter
                .request_capability(
                    CapabilityRequest::new(
                        format!("writer_{}", i),
                        "valve1",
                        "valve",
                        PermissionLevel::Write,
                    )
                    .priority(i * 10),
                )
                .await
        })
    });
    let results: Vec<_> = join_all(tasks)
        .await
        .into_iter()
        .map(|joined| joined.expect("task"))
        .collect();
    assert!(results.iter().any(|r| r.is_ok()));

    let active = arbiter.grants_for_device("valve1").await;
    let exclusive: Vec<_> = active
        .iter()
        .filter(|g| g.capability_type == "valve" && g.lock.is_exclusive())
        .collect();
    assert_eq!(exclusive.len(), 1);
    assert!(arbiter.audit_log().verify_chain().await.is_ok());
}

#[tokio::test]
async fn test_route_command_applies_constraints() {
    let sink = Arc::new(RecordingSink::default());
    let arbiter = Arbiter::builder(ArbiterConfig::default())
        .command_sink(sink.clone())
        .build()
        .unwrap();
    arbiter
        .register_device("pump1", "zone1", vec![CapabilitySpec::new("pump", "modbus")])
        .await
        .unwrap();
    arbiter
        .register_plugin(plugin("dosing", "pump", PermissionLevel::Actuate))
        .await
        .unwrap();

    let grant = arbiter
        .request_capability(
            CapabilityRequest::new("dosing", "pump1", "pump", PermissionLevel::Actuate)
                .constraints(ConstraintOverrides {
                    value_range: Some(ValueRange::new(10.0, 50.0)),
                    allowed_commands: Some(vec![CommandKind::Read, CommandKind::Actuate]),
                }),
        )
        .await
        .unwrap();

    // 値域外はクランプされて送られる
    let outcome = arbiter
        .route_command(grant, Command::actuate(80.0))
        .await
        .unwrap();
    assert_eq!(outcome.value, Some(50.0));
    assert_eq!(outcome.clamped_from, Some(80.0));
    assert_eq!(outcome.usage_count, 1);
    assert!(outcome.result.success);

    // 絞り込みで外されたコマンド種別
    let err = arbiter
        .route_command(grant, Command::write(20.0))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ConstraintViolation(_)));
    // 違反後もグラントは有効
    let still = arbiter.grant(grant).await.unwrap();
    assert_eq!(still.usage_count, 1);
    assert!(still.last_used.is_some());

    let sent = sink.commands.lock().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].value, Some(50.0));

    let violations = arbiter
        .query_audit(&AuditQuery::kinds([AuditEventKind::ConstraintViolation]))
        .await;
    assert_eq!(violations.len(), 1);
}

#[tokio::test]
async fn test_sink_failure_is_reported() {
    let arbiter = Arbiter::builder(ArbiterConfig::default())
        .command_sink(Arc::new(FailingSink))
        .build()
        .unwrap();
    arbiter
        .register_device("pump1", "zone1", vec![CapabilitySpec::new("pump", "modbus")])
        .await
        .unwrap();
    arbiter
        .register_plugin(plugin("dosing", "pump", PermissionLevel::Write))
        .await
        .unwrap();
    let grant = arbiter
        .request_capability(CapabilityRequest::new(
            "dosing",
            "pump1",
            "pump",
            PermissionLevel::Write,
        ))
        .await
        .unwrap();

    let err = arbiter
        .route_command(grant, Command::write(5.0))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::CommandSink(ref reason) if reason.contains("timeout")));
    assert!(arbiter.grant(grant).await.is_some());
}

#[tokio::test]
async fn test_escalation_and_unknown_targets() {
    let arbiter = greenhouse().await;
    arbiter
        .register_plugin(plugin("observer", "valve", PermissionLevel::Read))
        .await
        .unwrap();

    let err = arbiter
        .request_capability(CapabilityRequest::new(
            "observer",
            "valve1",
            "valve",
            PermissionLevel::Exclusive,
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PermissionDenied(_)));
    assert!(arbiter.grants_for_plugin("observer").await.is_empty());

    // ワイルドカードで MONITOR は許可される
    let monitor = arbiter
        .request_capability(CapabilityRequest::new(
            "observer",
            "valve1",
            "flow",
            PermissionLevel::Monitor,
        ))
        .await
        .unwrap();
    assert_eq!(arbiter.grant(monitor).await.unwrap().lock, LockType::None);

    assert!(matches!(
        arbiter
            .request_capability(CapabilityRequest::new(
                "observer",
                "valve9",
                "valve",
                PermissionLevel::Read
            ))
            .await
            .unwrap_err(),
        Error::DeviceNotFound(_)
    ));
    assert!(matches!(
        arbiter
            .request_capability(CapabilityRequest::new(
                "observer",
                "valve1",
                "heater",
                PermissionLevel::Monitor
            ))
            .await
            .unwrap_err(),
        Error::CapabilityNotFound { .. }
    ));
    assert!(matches!(
        arbiter
            .request_capability(CapabilityRequest::new(
                "ghost",
                "valve1",
                "valve",
                PermissionLevel::Read
            ))
            .await
            .unwrap_err(),
        Error::PluginNotFound(_)
    ));
}

#[tokio::test]
async fn test_request_rate_limit_is_retryable() {
    let arbiter = greenhouse().await;
    arbiter
        .register_plugin(plugin("burst", "valve", PermissionLevel::Control))
        .await
        .unwrap();

    // CONTROL のバースト上限は 2
    let mut limited = None;
    for _ in 0..5 {
        if let Err(e) = arbiter
            .request_capability(CapabilityRequest::new(
                "burst",
                "valve1",
                "valve",
                PermissionLevel::Control,
            ))
            .await
        {
            limited = Some(e);
            break;
        }
    }
    let err = limited.expect("rate limit should trip");
    assert!(err.is_retryable());
    assert_eq!(
        arbiter
            .query_audit(&AuditQuery::kinds([AuditEventKind::RateLimitTripped]))
            .await
            .len(),
        1
    );
}

#[tokio::test]
async fn test_expired_grant_is_reaped_lazily() {
    let arbiter = greenhouse().await;
    arbiter
        .register_plugin(plugin("short", "valve", PermissionLevel::Write))
        .await
        .unwrap();
    arbiter
        .register_plugin(plugin("long", "valve", PermissionLevel::Write))
        .await
        .unwrap();

    let short = arbiter
        .request_capability(
            CapabilityRequest::new("short", "valve1", "valve", PermissionLevel::Write)
                .priority(255)
                .duration(Duration::from_millis(30)),
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;

    // 期限切れの保持者とは競合しない
    let long = arbiter
        .request_capability(
            CapabilityRequest::new("long", "valve1", "valve", PermissionLevel::Write).priority(1),
        )
        .await
        .unwrap();
    assert!(arbiter.grant(short).await.is_none());
    assert!(arbiter.grant(long).await.is_some());
    assert!(arbiter
        .query_audit(&AuditQuery::kinds([AuditEventKind::ConflictDecision]))
        .await
        .is_empty());
    assert_eq!(
        arbiter
            .query_audit(&AuditQuery::kinds([AuditEventKind::GrantExpired]))
            .await
            .len(),
        1
    );
}

#[tokio::test]
async fn test_independent_arbiters_side_by_side() {
    let zone1 = greenhouse().await;
    let zone2 = greenhouse().await;
    zone1
        .register_plugin(plugin("ctl", "valve", PermissionLevel::Control))
        .await
        .unwrap();

    assert!(zone1.manifest("ctl").await.is_some());
    assert!(zone2.manifest("ctl").await.is_none());
    zone1.shutdown().await;
    assert!(zone2
        .register_plugin(plugin("ctl", "valve", PermissionLevel::Control))
        .await
        .is_ok());
}

#[tokio::test]
async fn test_revoke_is_idempotent() {
    let arbiter = greenhouse().await;
    arbiter
        .register_plugin(plugin("ctl", "valve", PermissionLevel::Control))
        .await
        .unwrap();
    let grant = arbiter
        .request_capability(CapabilityRequest::new(
            "ctl",
            "valve1",
            "valve",
            PermissionLevel::Control,
        ))
        .await
        .unwrap();

    assert!(arbiter.revoke(grant).await);
    assert!(!arbiter.revoke(grant).await);
    let revoked = arbiter
        .query_audit(&AuditQuery::kinds([AuditEventKind::GrantRevoked]))
        .await;
    assert_eq!(revoked.len(), 1);
}

#[tokio::test]
async fn test_unrepresentable_duration_is_rejected() {
    let arbiter = greenhouse().await;
    arbiter
        .register_plugin(plugin("ctl", "valve", PermissionLevel::Write))
        .await
        .unwrap();

    let err = arbiter
        .request_capability(
            CapabilityRequest::new("ctl", "valve1", "valve", PermissionLevel::Write)
                .duration(Duration::from_secs(10_000_000_000_000)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));
    assert!(arbiter.grants_for_device("valve1").await.is_empty());

    // スロットは解放されている
    assert!(arbiter
        .request_capability(
            CapabilityRequest::new("ctl", "valve1", "valve", PermissionLevel::Write)
                .duration(Duration::from_secs(3600)),
        )
        .await
        .is_ok());
    assert_eq!(
        arbiter
            .query_audit(&AuditQuery::kinds([AuditEventKind::RequestRejected]))
            .await
            .len(),
        1
    );
}

#[tokio::test]
async fn test_every_rejection_is_audited() {
    let arbiter = greenhouse().await;
    arbiter
        .register_plugin(plugin("ctl", "valve", PermissionLevel::Control))
        .await
        .unwrap();

    let rejected = [
        CapabilityRequest::new("ghost", "valve1", "valve", PermissionLevel::Read),
        CapabilityRequest::new("ctl", "valve9", "valve", PermissionLevel::Read),
        CapabilityRequest::new("ctl", "valve1", "heater", PermissionLevel::Monitor),
        CapabilityRequest::new("ctl", "valve1", "valve", PermissionLevel::Read).vote(1.5, 0.5),
    ];
    for request in rejected {
        assert!(arbiter.request_capability(request).await.is_err());
    }

    let entries = arbiter
        .query_audit(&AuditQuery::kinds([AuditEventKind::RequestRejected]))
        .await;
    assert_eq!(entries.len(), 4);
    assert_eq!(entries[0].plugin_id.as_deref(), Some("ghost"));
    assert!(entries[0].payload["error"]
        .as_str()
        .unwrap()
        .contains("ghost"));

    // 取り消し済みグラントへのコマンド
    let grant = arbiter
        .request_capability(CapabilityRequest::new(
            "ctl",
            "valve1",
            "valve",
            PermissionLevel::Control,
        ))
        .await
        .unwrap();
    assert!(arbiter.revoke(grant).await);
    assert!(matches!(
        arbiter
            .route_command(grant, Command::control(1.0))
            .await
            .unwrap_err(),
        Error::GrantNotFound(_)
    ));

    let commands = arbiter
        .query_audit(&AuditQuery::kinds([AuditEventKind::CommandRejected]))
        .await;
    assert_eq!(commands.len(), 1);
    assert_eq!(commands[0].payload["grant_id"], serde_json::json!(grant));
    assert!(arbiter.audit_log().verify_chain().await.is_ok());
}

#[tokio::test]
async fn test_impaired_device_refuses_grants_above_read() {
    let arbiter = greenhouse().await;
    arbiter
        .register_plugin(plugin("controller", "valve", PermissionLevel::Control))
        .await
        .unwrap();
    arbiter.update_device_health("valve1", 0.1).await.unwrap();

    let err = arbiter
        .request_capability(CapabilityRequest::new(
            "controller",
            "valve1",
            "valve",
            PermissionLevel::Control,
        ))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::ConflictDenied {
            decision: Decision::Deny,
            strategy: ConflictStrategy::HealthBased,
            ..
        }
    ));
    let denied = arbiter
        .query_audit(&AuditQuery::kinds([AuditEventKind::PermissionDenied]))
        .await;
    assert_eq!(denied.len(), 1);
    assert_eq!(denied[0].payload["reason"], "device_health");

    // READ は許可され、同じバケット内の更新後も READ を超えるグラントはない
    let read = arbiter
        .request_capability(CapabilityRequest::new(
            "controller",
            "valve1",
            "valve",
            PermissionLevel::Read,
        ))
        .await
        .unwrap();
    arbiter.update_device_health("valve1", 0.2).await.unwrap();
    assert!(arbiter.grant(read).await.is_some());
    assert!(arbiter
        .grants_for_device("valve1")
        .await
        .iter()
        .all(|g| g.permission <= PermissionLevel::Read));

    // 回復後は再び CONTROL を取得できる
    arbiter.update_device_health("valve1", 0.95).await.unwrap();
    assert!(arbiter
        .request_capability(CapabilityRequest::new(
            "controller",
            "valve1",
            "valve",
            PermissionLevel::Control,
        ))
        .await
        .is_ok());
}
