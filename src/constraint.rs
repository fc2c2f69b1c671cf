//! Constraint Engine
//!
//! グラント経由で送られるすべてのコマンドに、レート・値域・コマンド種別・
//! 時間帯・ヘルス下限の制約を順に適用する。どれか1つでも違反すればコマンドは送られない。

use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::capability::HealthBucket;
use crate::config::{ConstraintConfig, LevelTable, RateLimitPolicy};
use crate::error::{Error, Result};
use crate::grant::AccessGrant;
use crate::permission::PermissionLevel;
use crate::security::RateLimiter;
use crate::sinks::Command;

/// 制約を通過したコマンド
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatedCommand {
    /// 値はクランプ済み
    pub command: Command,
    /// クランプ前の値（クランプされた場合のみ）
    pub clamped_from: Option<f64>,
}

/// コマンド制約エンジン
#[derive(Debug)]
pub struct ConstraintEngine {
    limiter: RateLimiter,
}

impl ConstraintEngine {
    pub fn new(config: &ConstraintConfig) -> Self {
        let policies: LevelTable<RateLimitPolicy> =
            LevelTable::from_fn(|level| config.levels.get(level).rate);
        Self {
            limiter: RateLimiter::with_window(
                std::time::Duration::from_secs(config.window_secs),
                policies,
            ),
        }
    }

    /// コマンドを検証する
    ///
    /// # 引数
    /// * `grant` - 有効なグラント（制約はグラントのスナップショットを使用）
    /// * `command` - 送信予定のコマンド
    /// * `health` - デバイスの現在のヘルスバケット
    /// * `now` - 時間帯判定に使う現在時刻（UTC）
    pub async fn check(
        &self,
        grant: &AccessGrant,
        command: &Command,
        health: HealthBucket,
        now: DateTime<Utc>,
    ) -> Result<ValidatedCommand> {
        self.check_at(grant, command, health, now, Instant::now())
            .await
    }

    pub async fn check_at(
        &self,
        grant: &AccessGrant,
        command: &Command,
        health: HealthBucket,
        now: DateTime<Utc>,
        instant: Instant,
    ) -> Result<ValidatedCommand> {
        let constraints = &grant.constraints;

        // (a) コマンド用レート制限
        self.limiter
            .check_with_policy(&grant.plugin_id, grant.permission, &constraints.rate, instant)
            .await?;

        // (b) 値のクランプ
        let mut validated = command.clone();
        let mut clamped_from = None;
        if let Some(value) = command.value {
            if value.is_nan() {
                return Err(Error::ConstraintViolation(format!(
                    "{} command value is NaN",
                    command.kind
                )));
            }
            if let Some(range) = constraints.value_range {
                let clamped = range.clamp(value);
                if clamped != value {
                    debug!(
                        grant_id = %grant.id,
                        value,
                        clamped,
                        "Command value clamped"
                    );
                    clamped_from = Some(value);
                    validated.value = Some(clamped);
                }
            }
        }

        // (c) コマンド種別のホワイトリスト
        if !constraints.allowed_commands.contains(&command.kind)
            || grant.permission < command.kind.min_level()
        {
            return Err(Error::ConstraintViolation(format!(
                "{} command is not allowed at {} level",
                command.kind, grant.permission
            )));
        }

        // (d) 時間帯による禁止
        let time = now.time();
        if let Some(window) = constraints
            .blackout_windows
            .iter()
            .find(|window| window.contains(time))
        {
            return Err(Error::ConstraintViolation(format!(
                "commands are blocked between {} and {} UTC",
                window.start, window.end
            )));
        }

        // (e) ヘルス下限
        match health {
            HealthBucket::Critical if !command.kind.is_read_type() => {
                return Err(Error::ConstraintViolation(format!(
                    "device health is critical, {} commands are blocked",
                    command.kind
                )));
            }
            HealthBucket::Degraded if command.kind.min_level() >= PermissionLevel::Actuate => {
                return Err(Error::ConstraintViolation(format!(
                    "device health is degraded, {} commands are blocked",
                    command.kind
                )));
            }
            _ => {}
        }

        Ok(ValidatedCommand {
            command: validated,
            clamped_from,
        })
    }

    /// プラグインのコマンド用カウンタを初期化
    pub async fn reset_plugin(&self, plugin_id: &str) {
        self.limiter.reset_plugin(plugin_id).await;
    }

    pub async fn prune_idle(&self, now: Instant) -> usize {
        self.limiter.prune_idle(now).await
    }
}
