//! Background maintenance
//!
//! 期限切れグラントの回収、コンセンサスキャッシュとレートカウンタの整理を定期実行する。
//! 要求処理はこのジョブに依存しない（期限切れは要求時にも遅延回収される）。

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::arbiter::Arbiter;

/// 定期メンテナンスジョブのハンドル
#[derive(Debug)]
pub struct MaintenanceJob {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl MaintenanceJob {
    /// ジョブを開始する
    ///
    /// # 引数
    /// * `arbiter` - 対象のアービタ
    /// * `period` - 実行間隔
    pub fn spawn(arbiter: Arc<Arbiter>, period: Duration) -> Self {
        let token = CancellationToken::new();
        let child = token.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // 最初の tick は即座に完了する
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = ticker.tick() => {
                        if arbiter.is_shutting_down() {
                            debug!("Arbiter is shutting down, maintenance stopped");
                            break;
                        }
                        let report = arbiter.run_maintenance().await;
                        if report.expired_grants > 0 {
                            info!(expired = report.expired_grants, "Expired grants reaped");
                        }
                    }
                }
            }
        });

        info!(period_ms = period.as_millis() as u64, "Maintenance job started");
        Self { token, handle }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// ジョブを停止し、終了を待つ
    pub async fn shutdown(self) {
        self.token.cancel();
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Maintenance job terminated abnormally");
        }
        info!("Maintenance job stopped");
    }
}
