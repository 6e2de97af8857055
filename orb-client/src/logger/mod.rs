//! 持久化回退日志
//!
//! Producers push [`LogEvent`]s into a bounded queue; one background task
//! delivers them to the remote log collector. While the collector is
//! unreachable events go to rolling local files, which are replayed (oldest
//! first, newest three files only) as soon as a connection is made again.
//!
//! Queue overflow is lossy on purpose: a producer retries briefly and then
//! drops the event, counting it in [`LoggerStats::dropped`].

mod layer;
mod local_file;
mod worker;

pub use layer::FallbackLayer;
pub use local_file::{LOCAL_LOG_EXTENSION, LocalLogStore};

use parking_lot::Mutex as SyncMutex;
use serde::Serialize;
use shared::{LogEvent, Severity};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::LoggerConfig;
use crate::error::{OrbError, OrbResult};
use crate::resolver::Resolver;
use crate::rpc::{LogCollector, ProxyFactory};
use crate::tasks::BackgroundTask;
use worker::LogWorker;

/// Counters operators can poll to detect silent loss
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoggerStats {
    /// Events discarded because the queue stayed full
    pub dropped: u64,
    /// Times remote delivery failed and the logger fell back to disk
    pub fallbacks: u64,
    pub local_writes: u64,
    pub remote_writes: u64,
    /// Events replayed from local files
    pub spooled: u64,
}

#[derive(Debug, Default)]
struct Counters {
    dropped: AtomicU64,
    fallbacks: AtomicU64,
    local_writes: AtomicU64,
    remote_writes: AtomicU64,
    spooled: AtomicU64,
}

/// Connection state, owned by whoever holds the lock. The background task
/// holds it while handling an event, so acquiring it means the task is idle.
struct Delivery {
    remote: Option<Arc<dyn LogCollector>>,
    last_attempt: Option<Instant>,
    store: LocalLogStore,
}

struct LoggerShared {
    config: LoggerConfig,
    resolver: Arc<Resolver>,
    factory: Arc<dyn ProxyFactory<dyn LogCollector>>,
    tx: mpsc::Sender<LogEvent>,
    rx: Mutex<mpsc::Receiver<LogEvent>>,
    delivery: Mutex<Delivery>,
    forced_local: AtomicBool,
    counters: Counters,
}

impl LoggerShared {
    /// Single non-blocking enqueue attempt
    fn try_enqueue(&self, event: LogEvent) -> Result<(), LogEvent> {
        match self.tx.try_send(event) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(event))
            | Err(mpsc::error::TrySendError::Closed(event)) => Err(event),
        }
    }

    fn count_drop(&self) {
        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
    }
}

/// Handle to the fallback logger. Cheap to clone.
#[derive(Clone)]
pub struct FallbackLogger {
    shared: Arc<LoggerShared>,
    task: Arc<SyncMutex<Option<BackgroundTask>>>,
}

impl fmt::Debug for FallbackLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FallbackLogger")
            .field("process", &self.shared.config.process_name)
            .field("forced_local", &self.is_forced_local())
            .field("stats", &self.stats())
            .finish()
    }
}

impl FallbackLogger {
    pub fn new(
        config: LoggerConfig,
        resolver: Arc<Resolver>,
        factory: Arc<dyn ProxyFactory<dyn LogCollector>>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let store = LocalLogStore::new(&config);
        Self {
            shared: Arc::new(LoggerShared {
                config,
                resolver,
                factory,
                tx,
                rx: Mutex::new(rx),
                delivery: Mutex::new(Delivery {
                    remote: None,
                    last_attempt: None,
                    store,
                }),
                forced_local: AtomicBool::new(false),
                counters: Counters::default(),
            }),
            task: Arc::new(SyncMutex::new(None)),
        }
    }

    pub fn config(&self) -> &LoggerConfig {
        &self.shared.config
    }

    /// Start the delivery task. A second call is a no-op.
    pub fn start(&self) {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let shutdown = CancellationToken::new();
        let worker = LogWorker::new(self.shared.clone(), shutdown.clone());
        *task = Some(BackgroundTask::spawn("fallback_logger", shutdown, worker.run()));
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop the delivery task. Events still queued are written locally.
    pub async fn stop(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.stop(self.shared.config.shutdown_timeout).await;
        }
    }

    /// Queue an event, retrying briefly while the queue is full.
    ///
    /// Blocks the calling thread for at most `enqueue_retries` ×
    /// `enqueue_retry_delay`; use [`log_async`](Self::log_async) from async
    /// code.
    pub fn log(&self, event: LogEvent) {
        let mut event = event;
        for _ in 0..self.shared.config.enqueue_retries {
            match self.shared.try_enqueue(event) {
                Ok(()) => return,
                Err(back) => event = back,
            }
            std::thread::sleep(self.shared.config.enqueue_retry_delay);
        }
        if self.shared.try_enqueue(event).is_err() {
            self.shared.count_drop();
        }
    }

    /// [`log`](Self::log) without blocking the runtime
    pub async fn log_async(&self, event: LogEvent) {
        let mut event = event;
        for _ in 0..self.shared.config.enqueue_retries {
            match self.shared.try_enqueue(event) {
                Ok(()) => return,
                Err(back) => event = back,
            }
            tokio::time::sleep(self.shared.config.enqueue_retry_delay).await;
        }
        if self.shared.try_enqueue(event).is_err() {
            self.shared.count_drop();
        }
    }

    /// One attempt, no waiting. Returns false if the event was dropped.
    pub fn try_log(&self, event: LogEvent) -> bool {
        match self.shared.try_enqueue(event) {
            Ok(()) => true,
            Err(_) => {
                self.shared.count_drop();
                false
            }
        }
    }

    /// Events waiting in the queue
    pub fn queued(&self) -> usize {
        self.shared.tx.max_capacity() - self.shared.tx.capacity()
    }

    /// Pin the logger to local files, or release it.
    ///
    /// Pinning waits for the delivery task to go idle before dropping the
    /// remote connection. If it does not within `idle_wait`, a `Timeout` is
    /// returned; the task still drops the connection before its next
    /// delivery.
    pub async fn force_local(&self, local_only: bool) -> OrbResult<()> {
        self.shared.forced_local.store(local_only, Ordering::Release);
        if !local_only {
            return Ok(());
        }

        match tokio::time::timeout(self.shared.config.idle_wait, self.shared.delivery.lock()).await {
            Ok(mut delivery) => {
                if delivery.remote.take().is_some() {
                    tracing::info!("Remote logging disabled, writing locally");
                }
                Ok(())
            }
            Err(_) => Err(OrbError::Timeout("fallback logger did not go idle".into())),
        }
    }

    pub fn is_forced_local(&self) -> bool {
        self.shared.forced_local.load(Ordering::Acquire)
    }

    /// Whether a remote collector connection is currently held
    pub async fn is_connected(&self) -> bool {
        self.shared.delivery.lock().await.remote.is_some()
    }

    pub fn stats(&self) -> LoggerStats {
        let c = &self.shared.counters;
        LoggerStats {
            dropped: c.dropped.load(Ordering::Relaxed),
            fallbacks: c.fallbacks.load(Ordering::Relaxed),
            local_writes: c.local_writes.load(Ordering::Relaxed),
            remote_writes: c.remote_writes.load(Ordering::Relaxed),
            spooled: c.spooled.load(Ordering::Relaxed),
        }
    }

    /// `tracing_subscriber` layer that feeds this logger
    pub fn layer(&self) -> FallbackLayer {
        FallbackLayer::new(self.clone())
    }

    /// Convenience for `log(LogEvent::new(..))` with this logger's process name
    pub fn log_message(&self, severity: Severity, message: impl Into<String>) {
        self.log(LogEvent::new(severity, message).with_process(self.shared.config.process_name.clone()));
    }
}
