//! 日志投递后台任务 - 远程优先，失败回退本地文件，重连后重放

use shared::{ErrorClass, LogEvent, Severity};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{Delivery, LoggerShared};

pub(super) struct LogWorker {
    shared: Arc<LoggerShared>,
    shutdown: CancellationToken,
}

impl LogWorker {
    pub(super) fn new(shared: Arc<LoggerShared>, shutdown: CancellationToken) -> Self {
        Self { shared, shutdown }
    }

    pub(super) async fn run(self) {
        tracing::info!("FallbackLogger started");
        let shared = &self.shared;
        let mut rx = shared.rx.lock().await;

        loop {
            let next = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                next = tokio::time::timeout(shared.config.poll_interval, rx.recv()) => next,
            };

            match next {
                Ok(Some(event)) => shared.deliver(event).await,
                Ok(None) => break,
                // 空闲时也尝试重连，以便尽早重放积压的本地文件
                Err(_) => shared.idle().await,
            }
        }

        // 队列中剩余事件写入本地
        let mut delivery = shared.delivery.lock().await;
        while let Ok(event) = rx.try_recv() {
            shared.write_local(&mut delivery, &event);
        }
        delivery.store.close();
        delivery.remote = None;
        tracing::info!("FallbackLogger stopped");
    }
}

impl LoggerShared {
    async fn deliver(&self, event: LogEvent) {
        let mut delivery = self.delivery.lock().await;

        if self.forced_local.load(Ordering::Acquire) {
            delivery.remote = None;
        } else if delivery.remote.is_none() {
            self.try_connect(&mut delivery).await;
        }

        if let Some(remote) = delivery.remote.clone() {
            match remote.log_single(&event).await {
                Ok(()) => {
                    self.counters.remote_writes.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(e) => {
                    delivery.remote = None;
                    self.counters.fallbacks.fetch_add(1, Ordering::Relaxed);
                    if e.is_connection_lost() {
                        self.resolver.cache().evict(&self.config.collector_binding);
                    }
                    tracing::warn!("Remote logging failed, falling back to local file: {e}");
                    if self.config.verbose_warnings {
                        self.emit_fallback_warning(&e.to_string());
                    }
                }
            }
        }

        self.write_local(&mut delivery, &event);
    }

    async fn idle(&self) {
        if self.forced_local.load(Ordering::Acquire) {
            return;
        }
        let mut delivery = self.delivery.lock().await;
        if delivery.remote.is_none() {
            self.try_connect(&mut delivery).await;
        }
    }

    /// Throttled connection attempt. On success the local backlog is
    /// replayed before the connection is used for live events.
    async fn try_connect(&self, delivery: &mut Delivery) {
        let now = Instant::now();
        if delivery
            .last_attempt
            .is_some_and(|at| now.duration_since(at) < self.config.reconnect_throttle)
        {
            return;
        }
        delivery.last_attempt = Some(now);

        let Some(remote) = self
            .resolver
            .make_client_proxy(
                &*self.factory,
                &self.config.collector_binding,
                self.config.proxy_wait,
                false,
                false,
            )
            .await
        else {
            return;
        };

        match delivery.store.spool(&*remote).await {
            Ok(0) => {}
            Ok(sent) => {
                self.counters.spooled.fetch_add(sent, Ordering::Relaxed);
                tracing::info!(sent, "Replayed local log files to remote collector");
            }
            Err(e) => {
                tracing::warn!("Replay of local log files failed: {e}");
                if e.is_connection_lost() {
                    self.resolver.cache().evict(&self.config.collector_binding);
                    return;
                }
            }
        }

        tracing::info!(binding = %self.config.collector_binding, "Connected to remote log collector");
        delivery.remote = Some(remote);
    }

    fn write_local(&self, delivery: &mut Delivery, event: &LogEvent) {
        match delivery.store.write(event) {
            Ok(()) => {
                self.counters.local_writes.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.count_drop();
                tracing::error!("Local log write failed, event lost: {e}");
            }
        }
    }

    /// Pushed through the normal queue without waiting, so the consumer
    /// never blocks on its own queue.
    fn emit_fallback_warning(&self, reason: &str) {
        let warning = LogEvent::new(
            Severity::Warn,
            format!("Remote logging unavailable, using local fallback: {reason}"),
        )
        .with_class(ErrorClass::LostConnection)
        .with_process(self.config.process_name.clone())
        .with_location(file!(), line!());

        if self.try_enqueue(warning).is_err() {
            self.count_drop();
        }
    }
}
