//! 内存实现 - 进程内名称服务器、日志收集器、配置存储 (用于测试和单进程部署)

use async_trait::async_trait;
use parking_lot::Mutex;
use shared::rpc::{ExistsReply, GetObjectReply, RebindReply, RenewReply, UpdateReply, VersionedObject};
use shared::util::path_key;
use shared::{BindingRecord, Cookie, EndpointId, LogEvent, RebindResult};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use crate::error::{OrbError, OrbResult};
use crate::rpc::{ConfigStore, LogCollector, NAME_SERVER_INTERFACE, NameServer, ProxyFactory};

fn fresh_cookie(previous: Cookie) -> Cookie {
    loop {
        let value: u64 = rand::random();
        if value != 0 && value != previous.0 {
            return Cookie(value);
        }
    }
}

/// Reachability switch plus a "fail the next N calls" counter
#[derive(Debug)]
struct Faults {
    available: AtomicBool,
    fail_next: AtomicU32,
}

impl Faults {
    fn new() -> Self {
        Self {
            available: AtomicBool::new(true),
            fail_next: AtomicU32::new(0),
        }
    }

    fn check(&self, what: &str) -> OrbResult<()> {
        if !self.available.load(Ordering::Acquire) {
            return Err(OrbError::TransportLost(format!("{what} is down")));
        }
        if self
            .fail_next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(OrbError::TransportLost(format!("{what} dropped the connection")));
        }
        Ok(())
    }

    fn check_connect(&self, what: &str) -> OrbResult<()> {
        if self.available.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(OrbError::ServerUnavailable(what.to_string()))
        }
    }
}

#[derive(Debug)]
struct NsState {
    cookie: Cookie,
    bindings: HashMap<String, BindingRecord>,
    scopes: HashSet<String>,
    failing_paths: HashSet<String>,
    forced_mismatches: u32,
    rebind_calls: Vec<Vec<String>>,
    renew_calls: Vec<Vec<String>>,
}

impl NsState {
    fn add_scope_chain(&mut self, scope: &str) {
        let mut current = scope;
        while !current.is_empty() {
            self.scopes.insert(path_key(current));
            match current.rfind('/') {
                Some(idx) => current = &current[..idx],
                None => break,
            }
        }
    }

    fn mismatch(&mut self, cookie: Cookie) -> bool {
        if self.forced_mismatches > 0 {
            self.forced_mismatches -= 1;
            return true;
        }
        cookie != self.cookie
    }
}

/// In-process name server
#[derive(Debug)]
pub struct InMemoryNameServer {
    state: Mutex<NsState>,
    faults: Faults,
    get_object_calls: AtomicU64,
}

impl Default for InMemoryNameServer {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryNameServer {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(NsState {
                cookie: fresh_cookie(Cookie::UNKNOWN),
                bindings: HashMap::new(),
                scopes: HashSet::new(),
                failing_paths: HashSet::new(),
                forced_mismatches: 0,
                rebind_calls: Vec::new(),
                renew_calls: Vec::new(),
            }),
            faults: Faults::new(),
            get_object_calls: AtomicU64::new(0),
        }
    }

    pub fn cookie(&self) -> Cookie {
        self.state.lock().cookie
    }

    /// Simulate a restart: all bindings lost, new cookie
    pub fn restart(&self) {
        let mut state = self.state.lock();
        state.bindings.clear();
        state.scopes.clear();
        state.cookie = fresh_cookie(state.cookie);
    }

    pub fn set_available(&self, available: bool) {
        self.faults.available.store(available, Ordering::Release);
    }

    /// The next `count` calls fail with a lost connection
    pub fn fail_next_calls(&self, count: u32) {
        self.faults.fail_next.store(count, Ordering::Release);
    }

    /// Binding this path reports `Exception` until cleared
    pub fn fail_binding(&self, path: &str) {
        self.state.lock().failing_paths.insert(path_key(path));
    }

    pub fn clear_failing_bindings(&self) {
        self.state.lock().failing_paths.clear();
    }

    /// The next `count` batched calls report a cookie mismatch
    pub fn force_mismatch(&self, count: u32) {
        self.state.lock().forced_mismatches = count;
    }

    pub fn add_scope(&self, path: &str) {
        self.state.lock().add_scope_chain(path);
    }

    /// Bind without a client, as another process would
    pub fn bind_direct(&self, record: BindingRecord) {
        let mut state = self.state.lock();
        state.add_scope_chain(&record.scope);
        state.bindings.insert(path_key(&record.full_path()), record);
    }

    /// Drop a binding as if its lease expired
    pub fn expire(&self, path: &str) {
        self.state.lock().bindings.remove(&path_key(path));
    }

    pub fn binding(&self, path: &str) -> Option<BindingRecord> {
        self.state.lock().bindings.get(&path_key(path)).cloned()
    }

    pub fn is_bound(&self, path: &str) -> bool {
        self.binding(path).is_some()
    }

    pub fn binding_count(&self) -> usize {
        self.state.lock().bindings.len()
    }

    /// Paths sent with each `rebind_objects` call, in call order
    pub fn rebind_calls(&self) -> Vec<Vec<String>> {
        self.state.lock().rebind_calls.clone()
    }

    /// Paths sent with each `renew_leases` call, in call order
    pub fn renew_calls(&self) -> Vec<Vec<String>> {
        self.state.lock().renew_calls.clone()
    }

    pub fn get_object_calls(&self) -> u64 {
        self.get_object_calls.load(Ordering::Acquire)
    }
}

#[async_trait]
impl NameServer for InMemoryNameServer {
    async fn get_object(&self, path: &str) -> OrbResult<GetObjectReply> {
        self.faults.check("name server")?;
        self.get_object_calls.fetch_add(1, Ordering::AcqRel);
        let state = self.state.lock();
        Ok(GetObjectReply {
            endpoint: state.bindings.get(&path_key(path)).map(|r| r.endpoint.clone()),
            cookie: state.cookie,
        })
    }

    async fn rebind_objects(&self, records: &[BindingRecord], cookie: Cookie) -> OrbResult<RebindReply> {
        self.faults.check("name server")?;
        let mut state = self.state.lock();
        state
            .rebind_calls
            .push(records.iter().map(BindingRecord::full_path).collect());

        if state.mismatch(cookie) {
            return Ok(RebindReply {
                in_sync: false,
                cookie: state.cookie,
                results: Vec::new(),
            });
        }

        let results = records
            .iter()
            .map(|record| {
                let key = path_key(&record.full_path());
                if state.scopes.contains(&key) {
                    RebindResult::NotATerminal
                } else if state.failing_paths.contains(&key) {
                    RebindResult::Exception
                } else {
                    state.add_scope_chain(&record.scope);
                    state.bindings.insert(key, record.clone());
                    RebindResult::Success
                }
            })
            .collect();

        Ok(RebindReply {
            in_sync: true,
            cookie: state.cookie,
            results,
        })
    }

    async fn renew_leases(&self, paths: &[String], cookie: Cookie) -> OrbResult<RenewReply> {
        self.faults.check("name server")?;
        let mut state = self.state.lock();
        state.renew_calls.push(paths.to_vec());

        if state.mismatch(cookie) {
            return Ok(RenewReply {
                in_sync: false,
                cookie: state.cookie,
                results: Vec::new(),
            });
        }

        let results = paths
            .iter()
            .map(|p| {
                let key = path_key(p);
                state.bindings.contains_key(&key) && !state.failing_paths.contains(&key)
            })
            .collect();
        Ok(RenewReply {
            in_sync: true,
            cookie: state.cookie,
            results,
        })
    }

    async fn query_cookie(&self) -> OrbResult<Cookie> {
        self.faults.check("name server")?;
        Ok(self.cookie())
    }

    async fn update_extra_attr(&self, path: &str, index: usize, value: &str) -> OrbResult<()> {
        self.faults.check("name server")?;
        if !(1..=shared::binding::EXTRA_ATTR_COUNT).contains(&index) {
            return Err(OrbError::Rpc(format!("bad extra index {index}")));
        }
        let mut state = self.state.lock();
        let record = state
            .bindings
            .get_mut(&path_key(path))
            .ok_or_else(|| OrbError::NotFound(path.to_string()))?;
        record.extras[index - 1] = value.to_string();
        Ok(())
    }

    async fn remove_binding(&self, path: &str) -> OrbResult<()> {
        self.faults.check("name server")?;
        self.state
            .lock()
            .bindings
            .remove(&path_key(path))
            .map(|_| ())
            .ok_or_else(|| OrbError::NotFound(path.to_string()))
    }

    async fn binding_exists(&self, path: &str) -> OrbResult<ExistsReply> {
        self.faults.check("name server")?;
        let state = self.state.lock();
        Ok(ExistsReply {
            exists: state.bindings.contains_key(&path_key(path)),
            cookie: state.cookie,
        })
    }

    async fn scope_exists(&self, path: &str) -> OrbResult<ExistsReply> {
        self.faults.check("name server")?;
        let state = self.state.lock();
        Ok(ExistsReply {
            exists: path == "/" || state.scopes.contains(&path_key(path)),
            cookie: state.cookie,
        })
    }
}

/// In-process log collector that records what it receives
#[derive(Debug)]
pub struct InMemoryLogCollector {
    endpoint: EndpointId,
    events: Mutex<Vec<LogEvent>>,
    faults: Faults,
    /// Accept this many more events, then go down
    remaining: Mutex<Option<usize>>,
}

impl InMemoryLogCollector {
    pub fn new(endpoint: EndpointId) -> Self {
        Self {
            endpoint,
            events: Mutex::new(Vec::new()),
            faults: Faults::new(),
            remaining: Mutex::new(None),
        }
    }

    pub fn endpoint(&self) -> &EndpointId {
        &self.endpoint
    }

    pub fn events(&self) -> Vec<LogEvent> {
        self.events.lock().clone()
    }

    pub fn messages(&self) -> Vec<String> {
        self.events.lock().iter().map(|e| e.message.clone()).collect()
    }

    pub fn set_available(&self, available: bool) {
        self.faults.available.store(available, Ordering::Release);
    }

    pub fn fail_after(&self, count: usize) {
        *self.remaining.lock() = Some(count);
    }
}

#[async_trait]
impl LogCollector for InMemoryLogCollector {
    async fn log_single(&self, event: &LogEvent) -> OrbResult<()> {
        self.faults.check("log collector")?;
        {
            let mut remaining = self.remaining.lock();
            match remaining.as_mut() {
                Some(0) => {
                    *remaining = None;
                    self.set_available(false);
                    return Err(OrbError::TransportLost("log collector went away".into()));
                }
                Some(n) => *n -= 1,
                None => {}
            }
        }
        self.events.lock().push(event.clone());
        Ok(())
    }
}

/// In-process versioned key/value store
#[derive(Debug)]
pub struct InMemoryConfigStore {
    endpoint: EndpointId,
    objects: Mutex<HashMap<String, VersionedObject>>,
    faults: Faults,
}

impl InMemoryConfigStore {
    pub fn new(endpoint: EndpointId) -> Self {
        Self {
            endpoint,
            objects: Mutex::new(HashMap::new()),
            faults: Faults::new(),
        }
    }

    pub fn endpoint(&self) -> &EndpointId {
        &self.endpoint
    }

    /// Bytes exactly as stored, bypassing any client-side decryption
    pub fn raw(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().get(key).map(|o| o.bytes.clone())
    }

    pub fn set_available(&self, available: bool) {
        self.faults.available.store(available, Ordering::Release);
    }

    pub fn fail_next_calls(&self, count: u32) {
        self.faults.fail_next.store(count, Ordering::Release);
    }
}

#[async_trait]
impl ConfigStore for InMemoryConfigStore {
    async fn read_object(&self, key: &str) -> OrbResult<Option<VersionedObject>> {
        self.faults.check("config store")?;
        Ok(self.objects.lock().get(key).cloned())
    }

    async fn add_or_update(&self, key: &str, version: u64, bytes: &[u8]) -> OrbResult<UpdateReply> {
        self.faults.check("config store")?;
        let mut objects = self.objects.lock();
        let current = objects.get(key).map(|o| o.version).unwrap_or(0);
        if current != version {
            return Ok(UpdateReply {
                ok: false,
                version: current,
            });
        }
        let version = current + 1;
        objects.insert(
            key.to_string(),
            VersionedObject {
                bytes: bytes.to_vec(),
                version,
            },
        );
        Ok(UpdateReply { ok: true, version })
    }

    async fn delete_object(&self, key: &str) -> OrbResult<bool> {
        self.faults.check("config store")?;
        Ok(self.objects.lock().remove(key).is_some())
    }
}

/// Hands out the shared in-process instance as a proxy.
///
/// Construction fails when the target is down or when the endpoint names a
/// different instance, which is how a stale cached endpoint shows up.
#[derive(Debug)]
pub struct MemoryFactory<T> {
    target: Arc<T>,
}

impl<T> MemoryFactory<T> {
    pub fn new(target: Arc<T>) -> Self {
        Self { target }
    }

    pub fn target(&self) -> &Arc<T> {
        &self.target
    }
}

#[async_trait]
impl ProxyFactory<dyn NameServer> for MemoryFactory<InMemoryNameServer> {
    async fn connect(&self, endpoint: &EndpointId) -> OrbResult<Arc<dyn NameServer>> {
        if endpoint.interface_id != NAME_SERVER_INTERFACE {
            return Err(OrbError::Rpc(format!("{endpoint} is not a name server")));
        }
        self.target.faults.check_connect(&endpoint.addr())?;
        Ok(self.target.clone())
    }
}

#[async_trait]
impl ProxyFactory<dyn LogCollector> for MemoryFactory<InMemoryLogCollector> {
    async fn connect(&self, endpoint: &EndpointId) -> OrbResult<Arc<dyn LogCollector>> {
        self.target.faults.check_connect(&endpoint.addr())?;
        if *endpoint != self.target.endpoint {
            return Err(OrbError::ServerUnavailable(format!("no such object {endpoint}")));
        }
        Ok(self.target.clone())
    }
}

#[async_trait]
impl ProxyFactory<dyn ConfigStore> for MemoryFactory<InMemoryConfigStore> {
    async fn connect(&self, endpoint: &EndpointId) -> OrbResult<Arc<dyn ConfigStore>> {
        self.target.faults.check_connect(&endpoint.addr())?;
        if *endpoint != self.target.endpoint {
            return Err(OrbError::ServerUnavailable(format!("no such object {endpoint}")));
        }
        Ok(self.target.clone())
    }
}
