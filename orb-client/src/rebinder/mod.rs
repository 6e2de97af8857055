//! 自动重绑定器
//!
//! Keeps this process's exported objects bound in the name server. Entries
//! are registered here and a single background task binds them, renews
//! their leases, rebinds everything after a name server restart and evicts
//! entries that keep failing.
//!
//! # 锁约定
//!
//! One async mutex guards the entry list and is held across the batched
//! RPC of a pass, so `register` waits while a pass is in flight. Stopping
//! never takes that mutex before the task has exited.

mod lease;
mod pass;
mod worker;

pub use lease::LeaseState;

use parking_lot::Mutex as SyncMutex;
use serde::Serialize;
use shared::binding::EXTRA_ATTR_COUNT;
use shared::{BindingRecord, Cookie, EndpointId};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::RebinderConfig;
use crate::error::{OrbError, OrbResult};
use crate::resolver::Resolver;
use crate::tasks::BackgroundTask;
use worker::RebindWorker;

/// A registered binding and its lease
#[derive(Debug, Clone)]
struct RebindEntry {
    record: BindingRecord,
    lease: LeaseState,
}

/// State guarded by the list mutex
#[derive(Debug)]
struct RebindState {
    /// Sorted ascending by next renewal, unbound first
    entries: Vec<RebindEntry>,
    last_cookie: Cookie,
    last_contact: Instant,
    last_error: Option<String>,
}

/// Why an entry was dropped from the list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "failures", rename_all = "snake_case")]
pub enum RemovalReason {
    /// The path names a scope
    NotATerminal,
    /// Consecutive bind failures exceeded the limit
    TooManyFailures(u32),
}

impl fmt::Display for RemovalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemovalReason::NotATerminal => write!(f, "path is a scope, not a terminal binding"),
            RemovalReason::TooManyFailures(n) => write!(f, "{n} consecutive bind failures"),
        }
    }
}

/// One entry of the removal trail
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemovalRecord {
    pub path: String,
    pub reason: RemovalReason,
    /// UTC milliseconds
    pub at: i64,
}

/// Read-only view of a registered binding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingSnapshot {
    pub path: String,
    pub description: String,
    pub extras: [String; EXTRA_ATTR_COUNT],
    pub next_renewal: Option<Instant>,
    pub error_count: u32,
}

impl BindingSnapshot {
    pub fn is_bound(&self) -> bool {
        self.next_renewal.is_some()
    }
}

/// 统计计数
#[derive(Debug, Default)]
struct Counters {
    passes: AtomicU64,
    full_rebinds: AtomicU64,
    binds_ok: AtomicU64,
    renewals_ok: AtomicU64,
    failed_rebinds: AtomicU64,
    removals: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RebinderStats {
    pub passes: u64,
    pub full_rebinds: u64,
    pub binds_ok: u64,
    pub renewals_ok: u64,
    pub failed_rebinds: u64,
    pub removals: u64,
}

/// Shared between the public handle and the background task
struct RebinderShared {
    config: RebinderConfig,
    resolver: Arc<Resolver>,
    state: Mutex<RebindState>,
    removals: SyncMutex<VecDeque<RemovalRecord>>,
    counters: Counters,
}

impl RebinderShared {
    fn record_removal(&self, path: String, reason: RemovalReason) {
        tracing::warn!(path = %path, %reason, "Binding removed from auto-rebind list");
        self.counters.removals.fetch_add(1, Ordering::Relaxed);

        let mut removals = self.removals.lock();
        if removals.len() >= self.config.removal_log_capacity.max(1) {
            removals.pop_front();
        }
        removals.push_back(RemovalRecord {
            path,
            reason,
            at: shared::util::now_millis(),
        });
    }
}

/// Handle to the auto-rebinder
pub struct AutoRebinder {
    shared: Arc<RebinderShared>,
    task: SyncMutex<Option<BackgroundTask>>,
}

impl fmt::Debug for AutoRebinder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AutoRebinder")
            .field("running", &self.is_running())
            .finish()
    }
}

impl AutoRebinder {
    pub fn new(resolver: Arc<Resolver>, config: RebinderConfig) -> Self {
        Self {
            shared: Arc::new(RebinderShared {
                config,
                resolver,
                state: Mutex::new(RebindState {
                    entries: Vec::new(),
                    last_cookie: Cookie::UNKNOWN,
                    last_contact: Instant::now(),
                    last_error: None,
                }),
                removals: SyncMutex::new(VecDeque::new()),
                counters: Counters::default(),
            }),
            task: SyncMutex::new(None),
        }
    }

    /// Start the background task. A second call is a no-op.
    pub fn start(&self) {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let shutdown = CancellationToken::new();
        let worker = RebindWorker::new(self.shared.clone(), shutdown.clone());
        *task = Some(BackgroundTask::spawn("auto_rebinder", shutdown, worker.run()));
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Request shutdown, join with a timeout, then clear the list.
    pub async fn stop(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.stop(self.shared.config.shutdown_timeout).await;
        }
        self.shared.state.lock().await.entries.clear();
    }

    /// Run one pass now, on the calling task.
    pub async fn tick(&self) {
        self.shared.tick().await;
    }

    /// Register an exported object. It is bound on the next pass.
    pub async fn register(
        &self,
        endpoint: EndpointId,
        full_path: &str,
        description: &str,
    ) -> OrbResult<()> {
        self.register_with_extras(endpoint, full_path, description, Default::default())
            .await
    }

    pub async fn register_with_extras(
        &self,
        endpoint: EndpointId,
        full_path: &str,
        description: &str,
        extras: [String; EXTRA_ATTR_COUNT],
    ) -> OrbResult<()> {
        let record = BindingRecord::new(full_path, description, endpoint)?.with_extras(extras);

        let mut state = self.shared.state.lock().await;
        if state.entries.iter().any(|e| e.record.path_matches(full_path)) {
            return Err(OrbError::AlreadyRegistered(full_path.to_string()));
        }
        // 插入队首，下一次 tick 无需排序即可看到
        state.entries.insert(
            0,
            RebindEntry {
                record,
                lease: LeaseState::default(),
            },
        );
        tracing::debug!(path = full_path, "Binding registered for auto-rebind");
        Ok(())
    }

    /// Remove a registration. Returns whether it was present.
    pub async fn deregister(&self, full_path: &str, error_if_missing: bool) -> OrbResult<bool> {
        let mut state = self.shared.state.lock().await;
        let before = state.entries.len();
        state.entries.retain(|e| !e.record.path_matches(full_path));
        let removed = state.entries.len() != before;

        if !removed && error_if_missing {
            return Err(OrbError::BindingNotFound(full_path.to_string()));
        }
        Ok(removed)
    }

    /// Change extra attribute `index` (1 based) and push it to the name
    /// server right away. The push is best effort; a failure is corrected
    /// by the next rebind.
    pub async fn update_attribute(&self, full_path: &str, index: usize, value: &str) -> OrbResult<()> {
        if !(1..=EXTRA_ATTR_COUNT).contains(&index) {
            return Err(OrbError::BadAttributeIndex(index));
        }

        {
            let mut state = self.shared.state.lock().await;
            let entry = state
                .entries
                .iter_mut()
                .find(|e| e.record.path_matches(full_path))
                .ok_or_else(|| OrbError::BindingNotFound(full_path.to_string()))?;
            entry.record.extras[index - 1] = value.to_string();
        }

        if let Err(e) = self.push_attribute(full_path, index, value).await {
            tracing::warn!(path = full_path, index, "Could not push attribute update: {e}");
        }
        Ok(())
    }

    async fn push_attribute(&self, full_path: &str, index: usize, value: &str) -> OrbResult<()> {
        let resolver = &self.shared.resolver;
        let ns = resolver.name_server(Duration::ZERO).await?;
        ns.update_extra_attr(full_path, index, value)
            .await
            .map_err(|e| resolver.note_failure(e))
    }

    /// Deregister each path and remove its binding from the name server.
    ///
    /// Local removal always happens. Name server removal is best effort per
    /// path; only failing to reach the name server at all is reported.
    pub async fn unbind_objects(&self, paths: &[&str]) -> OrbResult<()> {
        for path in paths {
            self.deregister(path, false).await?;
        }

        let resolver = &self.shared.resolver;
        let ns = resolver.name_server(Duration::ZERO).await?;
        for path in paths {
            match ns.remove_binding(path).await {
                Ok(()) => tracing::debug!(path, "Binding removed from name server"),
                Err(e) if e.is_connection_lost() => return Err(resolver.note_failure(e)),
                Err(e) => tracing::debug!(path, "Could not remove binding: {e}"),
            }
        }
        Ok(())
    }

    pub async fn bindings(&self) -> Vec<BindingSnapshot> {
        let state = self.shared.state.lock().await;
        state
            .entries
            .iter()
            .map(|e| BindingSnapshot {
                path: e.record.full_path(),
                description: e.record.description.clone(),
                extras: e.record.extras.clone(),
                next_renewal: e.lease.next_renewal(),
                error_count: e.lease.error_count(),
            })
            .collect()
    }

    pub async fn binding(&self, full_path: &str) -> Option<BindingSnapshot> {
        self.bindings()
            .await
            .into_iter()
            .find(|b| b.path.eq_ignore_ascii_case(full_path))
    }

    pub async fn len(&self) -> usize {
        self.shared.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Cookie this rebinder believes the name server has
    pub async fn last_cookie(&self) -> Cookie {
        self.shared.state.lock().await.last_cookie
    }

    /// Most recent removals, oldest first
    pub fn removal_log(&self) -> Vec<RemovalRecord> {
        self.shared.removals.lock().iter().cloned().collect()
    }

    pub fn stats(&self) -> RebinderStats {
        let c = &self.shared.counters;
        RebinderStats {
            passes: c.passes.load(Ordering::Relaxed),
            full_rebinds: c.full_rebinds.load(Ordering::Relaxed),
            binds_ok: c.binds_ok.load(Ordering::Relaxed),
            renewals_ok: c.renewals_ok.load(Ordering::Relaxed),
            failed_rebinds: c.failed_rebinds.load(Ordering::Relaxed),
            removals: c.removals.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ObjectRefCache;
    use crate::config::ResolverConfig;
    use crate::memory::{InMemoryNameServer, MemoryFactory};

    fn rebinder(ns: &Arc<InMemoryNameServer>, config: RebinderConfig) -> AutoRebinder {
        let resolver = Resolver::new(
            ResolverConfig::default(),
            Arc::new(ObjectRefCache::new()),
            Arc::new(MemoryFactory::new(ns.clone())),
        );
        AutoRebinder::new(Arc::new(resolver), config)
    }

    fn ep() -> EndpointId {
        EndpointId::new_instance("If", "host", 3000)
    }

    #[tokio::test]
    async fn test_register_validates_and_rejects_duplicates() {
        let ns = Arc::new(InMemoryNameServer::new());
        let rb = rebinder(&ns, RebinderConfig::default());

        assert!(matches!(
            rb.register(ep(), "noscope", "x").await,
            Err(OrbError::BadBindingPath(_))
        ));
        rb.register(ep(), "/Svc/A", "a").await.unwrap();
        assert!(matches!(
            rb.register(ep(), "/svc/a", "dup").await,
            Err(OrbError::AlreadyRegistered(_))
        ));
        assert_eq!(rb.len().await, 1);
    }

    #[tokio::test]
    async fn test_register_inserts_at_front_unbound() {
        let ns = Arc::new(InMemoryNameServer::new());
        let rb = rebinder(&ns, RebinderConfig::default());
        rb.register(ep(), "/Svc/A", "a").await.unwrap();
        rb.tick().await;
        rb.register(ep(), "/Svc/B", "b").await.unwrap();

        let bindings = rb.bindings().await;
        assert_eq!(bindings[0].path, "/Svc/B");
        assert!(!bindings[0].is_bound());
        assert!(bindings[1].is_bound());
    }

    #[tokio::test]
    async fn test_deregister_missing() {
        let ns = Arc::new(InMemoryNameServer::new());
        let rb = rebinder(&ns, RebinderConfig::default());
        assert!(!rb.deregister("/Svc/None", false).await.unwrap());
        assert!(matches!(
            rb.deregister("/Svc/None", true).await,
            Err(OrbError::BindingNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_update_attribute_pushes_to_server() {
        let ns = Arc::new(InMemoryNameServer::new());
        let rb = rebinder(&ns, RebinderConfig::default());
        rb.register(ep(), "/Svc/A", "a").await.unwrap();
        rb.tick().await;

        rb.update_attribute("/Svc/A", 2, "v2").await.unwrap();
        assert_eq!(rb.binding("/Svc/A").await.unwrap().extras[1], "v2");
        assert_eq!(ns.binding("/Svc/A").unwrap().extras[1], "v2");

        assert!(matches!(
            rb.update_attribute("/Svc/A", 0, "x").await,
            Err(OrbError::BadAttributeIndex(0))
        ));
        assert!(matches!(
            rb.update_attribute("/Svc/A", 5, "x").await,
            Err(OrbError::BadAttributeIndex(5))
        ));
    }

    #[tokio::test]
    async fn test_update_attribute_tolerates_unreachable_server() {
        let ns = Arc::new(InMemoryNameServer::new());
        let rb = rebinder(&ns, RebinderConfig::default());
        rb.register(ep(), "/Svc/A", "a").await.unwrap();
        ns.set_available(false);

        // 推送失败只记录日志
        rb.update_attribute("/Svc/A", 1, "v1").await.unwrap();
        assert_eq!(rb.binding("/Svc/A").await.unwrap().extras[0], "v1");
    }

    #[tokio::test]
    async fn test_unbind_objects() {
        let ns = Arc::new(InMemoryNameServer::new());
        let rb = rebinder(&ns, RebinderConfig::default());
        rb.register(ep(), "/Svc/A", "a").await.unwrap();
        rb.register(ep(), "/Svc/B", "b").await.unwrap();
        rb.tick().await;
        assert_eq!(ns.binding_count(), 2);

        rb.unbind_objects(&["/Svc/A", "/Svc/Missing"]).await.unwrap();
        assert!(!ns.is_bound("/Svc/A"));
        assert!(ns.is_bound("/Svc/B"));
        assert_eq!(rb.len().await, 1);
    }

    #[tokio::test]
    async fn test_start_stop_clears_list() {
        let ns = Arc::new(InMemoryNameServer::new());
        let rb = rebinder(&ns, RebinderConfig::default());
        rb.register(ep(), "/Svc/A", "a").await.unwrap();

        rb.start();
        assert!(rb.is_running());
        rb.stop().await;
        assert!(!rb.is_running());
        assert!(rb.is_empty().await);
    }

    #[test]
    fn test_removal_reason_json() {
        assert_eq!(
            serde_json::to_value(RemovalReason::TooManyFailures(11)).unwrap(),
            serde_json::json!({ "reason": "too_many_failures", "failures": 11 })
        );
        assert_eq!(
            serde_json::to_value(RemovalReason::NotATerminal).unwrap(),
            serde_json::json!({ "reason": "not_a_terminal" })
        );
    }
}
