//! 重绑定后台任务

use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::RebinderShared;

pub(super) struct RebindWorker {
    shared: Arc<RebinderShared>,
    shutdown: CancellationToken,
}

impl RebindWorker {
    pub(super) fn new(shared: Arc<RebinderShared>, shutdown: CancellationToken) -> Self {
        Self { shared, shutdown }
    }

    /// Tick until cancelled; the first tick fires immediately.
    pub(super) async fn run(self) {
        tracing::info!("AutoRebinder started");

        let mut interval = tokio::time::interval(self.shared.config.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => {
                    // 取消时直接丢弃进行中的一轮，状态只在 RPC 返回后同步更新
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = self.shared.tick() => {}
                    }
                }
            }
        }

        self.shared.state.lock().await.entries.clear();
        tracing::info!("AutoRebinder stopped");
    }
}
