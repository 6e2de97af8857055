//! 后台任务监管
//!
//! 每个弹性组件 (重绑定器、回退日志) 拥有一个后台任务。任务被包装以捕获
//! panic，停止时先发取消信号，再在超时内等待退出，超时则强制中止。

use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A spawned background worker and its cancellation token
#[derive(Debug)]
pub struct BackgroundTask {
    name: &'static str,
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl BackgroundTask {
    /// Spawn `future` on the current runtime.
    ///
    /// The future is expected to watch `shutdown` itself.
    pub fn spawn<F>(name: &'static str, shutdown: CancellationToken, future: F) -> Self
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let wrapped_future = async move {
            let result: Result<(), Box<dyn std::any::Any + Send>> =
                AssertUnwindSafe(future).catch_unwind().await;
            if let Err(panic_info) = result {
                let panic_msg: String = if let Some(s) = panic_info.downcast_ref::<&str>() {
                    (*s).to_string()
                } else if let Some(s) = panic_info.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "Unknown panic".to_string()
                };
                tracing::error!(task = %name, panic = %panic_msg, "Background task panicked");
            }
        };

        let handle = tokio::spawn(wrapped_future);
        tracing::debug!(task = %name, "Spawned background task");
        Self {
            name,
            shutdown,
            handle,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Request shutdown and wait up to `timeout` for the task to exit.
    ///
    /// Returns false if the task had to be aborted.
    pub async fn stop(self, timeout: Duration) -> bool {
        self.shutdown.cancel();
        let abort = self.handle.abort_handle();
        match tokio::time::timeout(timeout, self.handle).await {
            Ok(Ok(())) => {
                tracing::debug!(task = %self.name, "Task completed");
                true
            }
            Ok(Err(e)) if e.is_cancelled() => true,
            Ok(Err(e)) => {
                tracing::error!(task = %self.name, error = ?e, "Task failed");
                true
            }
            Err(_) => {
                tracing::warn!(task = %self.name, ?timeout, "Task did not stop in time, aborting");
                abort.abort();
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cooperative_stop() {
        let token = CancellationToken::new();
        let child = token.clone();
        let task = BackgroundTask::spawn("test", token, async move {
            child.cancelled().await;
        });
        assert!(task.stop(Duration::from_secs(1)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_task_is_aborted() {
        let task = BackgroundTask::spawn("stuck", CancellationToken::new(), async {
            std::future::pending::<()>().await;
        });
        assert!(!task.stop(Duration::from_millis(100)).await);
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let task = BackgroundTask::spawn("panics", CancellationToken::new(), async {
            panic!("boom");
        });
        tokio::task::yield_now().await;
        assert!(task.stop(Duration::from_secs(1)).await);
    }
}
