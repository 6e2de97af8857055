//! 对象引用缓存 - 绑定路径到 EndpointId 的进程级映射，以及名称服务器 cookie

use dashmap::DashMap;
use shared::util::path_key;
use shared::{Cookie, EndpointId};
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide map of resolved bindings plus the name server epoch cookie.
///
/// Any component may flush it; everything holding endpoints obtained from it
/// has to tolerate that.
#[derive(Debug, Default)]
pub struct ObjectRefCache {
    entries: DashMap<String, EndpointId>,
    cookie: AtomicU64,
}

impl ObjectRefCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, path: &str) -> Option<EndpointId> {
        self.entries.get(&path_key(path)).map(|e| e.value().clone())
    }

    pub fn store(&self, path: &str, endpoint: EndpointId) {
        self.entries.insert(path_key(path), endpoint);
    }

    /// Returns whether an entry was removed
    pub fn evict(&self, path: &str) -> bool {
        self.entries.remove(&path_key(path)).is_some()
    }

    /// Drop every cached binding
    pub fn flush(&self) {
        let count = self.entries.len();
        self.entries.clear();
        if count > 0 {
            tracing::debug!(count, "Object reference cache flushed");
        }
    }

    /// Feed a cookie from a name server reply.
    ///
    /// A value different from the stored one flushes everything. Returns
    /// true in that case.
    pub fn check_cookie(&self, cookie: Cookie) -> bool {
        if !cookie.is_known() {
            return false;
        }
        let previous = Cookie(self.cookie.swap(cookie.0, Ordering::AcqRel));
        if previous == cookie {
            return false;
        }
        if previous.is_known() {
            tracing::info!(old = %previous, new = %cookie, "Name server cookie changed");
        }
        self.flush();
        true
    }

    /// Most recent cookie seen by any component
    pub fn last_cookie(&self) -> Cookie {
        Cookie(self.cookie.load(Ordering::Acquire))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
