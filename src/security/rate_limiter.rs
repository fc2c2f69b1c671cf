use crate::config::{LevelTable, RateLimitConfig, RateLimitPolicy};
use crate::error::{Error, RateLimitReason, Result};
use crate::permission::PermissionLevel;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

/// バースト判定の時間幅
const BURST_WINDOW: Duration = Duration::from_secs(1);

/// (プラグイン, 権限レベル) ごとのスライディングウィンドウ + バースト + ペナルティ
#[derive(Debug)]
pub struct RateLimiter {
    enabled: bool,
    window: Duration,
    policies: LevelTable<RateLimitPolicy>,
    windows: RwLock<HashMap<LimiterKey, Arc<Mutex<WindowState>>>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct LimiterKey {
    plugin_id: String,
    level: PermissionLevel,
}

#[derive(Debug, Default)]
struct WindowState {
    timestamps: VecDeque<Instant>,
    penalty_until: Option<Instant>,
}

/// 現在のウィンドウ状態（デバッグ・監査用）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowStatus {
    pub in_window: usize,
    pub penalized: bool,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            enabled: config.enabled,
            window: Duration::from_secs(config.window_secs),
            policies: config.levels,
            windows: RwLock::new(HashMap::new()),
        }
    }

    /// ウィンドウ長を直接指定して作成
    pub fn with_window(window: Duration, policies: LevelTable<RateLimitPolicy>) -> Self {
        Self {
            enabled: true,
            window,
            policies,
            windows: RwLock::new(HashMap::new()),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn policy(&self, level: PermissionLevel) -> &RateLimitPolicy {
        self.policies.get(level)
    }

    /// リクエストの実行許可をチェック
    pub async fn check(&self, plugin_id: &str, level: PermissionLevel) -> Result<()> {
        self.check_at(plugin_id, level, Instant::now()).await
    }

    pub async fn check_at(
        &self,
        plugin_id: &str,
        level: PermissionLevel,
        now: Instant,
    ) -> Result<()> {
        let policy = *self.policies.get(level);
        self.check_with_policy(plugin_id, level, &policy, now).await
    }

    /// レベル既定値ではなく明示的なポリシーでチェック（グラントごとの制約用）
    pub async fn check_with_policy(
        &self,
        plugin_id: &str,
        level: PermissionLevel,
        policy: &RateLimitPolicy,
        now: Instant,
    ) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        let state = self.state_for(plugin_id, level).await;
        let mut state = state.lock().await;

        // ウィンドウ外のタイムスタンプを削除
        while let Some(oldest) = state.timestamps.front() {
            if now.saturating_duration_since(*oldest) >= self.window {
                state.timestamps.pop_front();
            } else {
                break;
            }
        }

        let limited = |reason, retry_after| Error::RateLimited {
            plugin_id: plugin_id.to_string(),
            level,
            reason,
            retry_after,
        };

        if let Some(until) = state.penalty_until {
            if until > now {
                return Err(limited(RateLimitReason::Penalized, until - now));
            }
            state.penalty_until = None;
        }

        if state.timestamps.len() >= policy.requests_per_minute as usize {
            let penalty = Duration::from_secs(policy.penalty_secs);
            state.penalty_until = Some(now + penalty);
            warn!(
                plugin_id,
                level = %level,
                penalty_secs = policy.penalty_secs,
                "Rate limit budget exhausted, entering penalty"
            );
            return Err(limited(RateLimitReason::BudgetExhausted, penalty));
        }

        let in_last_second: Vec<Instant> = state
            .timestamps
            .iter()
            .rev()
            .take_while(|ts| now.saturating_duration_since(**ts) < BURST_WINDOW)
            .copied()
            .collect();
        if in_last_second.len() >= policy.burst_size as usize {
            // 最も古いバースト内リクエストが1秒の窓から外れるまで
            let retry_after = in_last_second
                .last()
                .map(|oldest| BURST_WINDOW.saturating_sub(now.saturating_duration_since(*oldest)))
                .unwrap_or(BURST_WINDOW);
            debug!(plugin_id, level = %level, "Burst limit reached");
            return Err(limited(RateLimitReason::Burst, retry_after));
        }

        state.timestamps.push_back(now);
        Ok(())
    }

    /// プラグインのカウンタをすべて初期化（再登録・登録解除時）
    pub async fn reset_plugin(&self, plugin_id: &str) {
        let mut windows = self.windows.write().await;
        windows.retain(|key, _| key.plugin_id != plugin_id);
    }

    /// 現在のウィンドウ状態を取得
    pub async fn status(&self, plugin_id: &str, level: PermissionLevel) -> Option<WindowStatus> {
        self.status_at(plugin_id, level, Instant::now()).await
    }

    pub async fn status_at(
        &self,
        plugin_id: &str,
        level: PermissionLevel,
        now: Instant,
    ) -> Option<WindowStatus> {
        let key = LimiterKey {
            plugin_id: plugin_id.to_string(),
            level,
        };
        let state = self.windows.read().await.get(&key).cloned()?;
        let state = state.lock().await;
        Some(WindowStatus {
            in_window: state
                .timestamps
                .iter()
                .filter(|ts| now.saturating_duration_since(**ts) < self.window)
                .count(),
            penalized: state.penalty_until.is_some_and(|until| until > now),
        })
    }

    /// 空になった状態を削除し、削除数を返す（メンテナンスジョブ用）
    pub async fn prune_idle(&self, now: Instant) -> usize {
        let mut windows = self.windows.write().await;
        let before = windows.len();
        let window = self.window;
        windows.retain(|_, state| match state.try_lock() {
            Ok(state) => {
                let active = state
                    .timestamps
                    .back()
                    .is_some_and(|ts| now.saturating_duration_since(*ts) < window);
                let penalized = state.penalty_until.is_some_and(|until| until > now);
                active || penalized
            }
            // 使用中の状態は残す
            Err(_) => true,
        });
        before - windows.len()
    }

    async fn state_for(&self, plugin_id: &str, level: PermissionLevel) -> Arc<Mutex<WindowState>> {
        let key = LimiterKey {
            plugin_id: plugin_id.to_string(),
            level,
        };
        if let Some(state) = self.windows.read().await.get(&key) {
            return state.clone();
        }
        self.windows
            .write()
            .await
            .entry(key)
            .or_default()
            .clone()
    }
}
