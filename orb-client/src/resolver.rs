//! 解析器 - 绑定路径到代理，名称服务器引导，未注册服务的有界轮询

use parking_lot::RwLock;
use shared::EndpointId;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::cache::ObjectRefCache;
use crate::config::ResolverConfig;
use crate::error::{OrbError, OrbResult};
use crate::rpc::{NAME_SERVER_BINDING, NAME_SERVER_INSTANCE, NAME_SERVER_INTERFACE, NameServer, ProxyFactory};

/// Resolves binding paths to live endpoints through the name server.
///
/// Runs on the caller's task. Only "valid reply, not there yet" is retried;
/// connection failures flush the cache and surface immediately.
pub struct Resolver {
    config: ResolverConfig,
    cache: Arc<ObjectRefCache>,
    ns_factory: Arc<dyn ProxyFactory<dyn NameServer>>,
    ns_addr: RwLock<(String, u16)>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (host, port) = self.name_server_addr();
        f.debug_struct("Resolver")
            .field("name_server", &format!("{host}:{port}"))
            .field("cached", &self.cache.len())
            .finish()
    }
}

impl Resolver {
    pub fn new(
        config: ResolverConfig,
        cache: Arc<ObjectRefCache>,
        ns_factory: Arc<dyn ProxyFactory<dyn NameServer>>,
    ) -> Self {
        let ns_addr = RwLock::new((config.ns_host.clone(), config.ns_port));
        Self {
            config,
            cache,
            ns_factory,
            ns_addr,
            shutdown: CancellationToken::new(),
        }
    }

    /// Interrupt retry sleeps with an externally owned token
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn cache(&self) -> &Arc<ObjectRefCache> {
        &self.cache
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Abort any in-progress retry sleep
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn name_server_addr(&self) -> (String, u16) {
        self.ns_addr.read().clone()
    }

    /// Point at a different name server. Everything cached is dropped.
    pub fn set_name_server_addr(&self, host: impl Into<String>, port: u16) {
        *self.ns_addr.write() = (host.into(), port);
        self.cache.flush();
    }

    /// The name server cannot be looked up through itself; its endpoint is
    /// assembled from the configured address and the fixed instance id.
    pub fn name_server_endpoint(&self) -> EndpointId {
        let (host, port) = self.name_server_addr();
        EndpointId::new(NAME_SERVER_INTERFACE, NAME_SERVER_INSTANCE, host, port)
    }

    /// Sleep unless shutdown is requested first. Returns false if interrupted.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    pub(crate) fn note_failure(&self, err: OrbError) -> OrbError {
        if err.is_connection_lost() {
            self.cache.flush();
        }
        err
    }

    /// Connect to the name server, proving connectivity by fetching its
    /// cookie. A zero `wait` selects the configured default.
    pub async fn name_server(&self, wait: Duration) -> OrbResult<Arc<dyn NameServer>> {
        let wait = if wait.is_zero() {
            self.config.name_server_wait
        } else {
            wait
        };

        if let Some(endpoint) = self.cache.lookup(NAME_SERVER_BINDING) {
            match self.ns_factory.connect(&endpoint).await {
                Ok(proxy) => return Ok(proxy),
                Err(e) => {
                    tracing::debug!("Cached name server endpoint rejected: {e}");
                    self.cache.evict(NAME_SERVER_BINDING);
                }
            }
        }

        let endpoint = self.name_server_endpoint();
        let deadline = Instant::now() + wait;
        let last_err = loop {
            let err = match self.connect_name_server(&endpoint).await {
                Ok(proxy) => {
                    self.cache.store(NAME_SERVER_BINDING, endpoint.clone());
                    return Ok(proxy);
                }
                Err(e) => e,
            };

            let left = deadline.saturating_duration_since(Instant::now());
            if left < self.config.min_remaining {
                break err;
            }
            if !self.pause(left.min(self.config.retry_interval)).await {
                break err;
            }
        };

        self.cache.flush();
        if last_err.is_connection_lost() {
            tracing::warn!(
                host = %endpoint.host,
                port = endpoint.port,
                "Name server not available: {last_err}"
            );
            return Err(OrbError::NameServerUnavailable {
                host: endpoint.host,
                port: endpoint.port,
            });
        }
        Err(last_err)
    }

    async fn connect_name_server(&self, endpoint: &EndpointId) -> OrbResult<Arc<dyn NameServer>> {
        let proxy = self.ns_factory.connect(endpoint).await?;
        let cookie = proxy.query_cookie().await?;
        self.cache.check_cookie(cookie);
        Ok(proxy)
    }

    /// Cache-first resolution of `path`.
    ///
    /// `Ok(None)` means the name server answered but the binding did not
    /// show up before the deadline (or at once, with `quick_test`).
    pub async fn lookup(
        &self,
        path: &str,
        wait: Duration,
        quick_test: bool,
    ) -> OrbResult<Option<EndpointId>> {
        if let Some(endpoint) = self.cache.lookup(path) {
            return Ok(Some(endpoint));
        }
        self.lookup_remote(path, wait, quick_test).await
    }

    /// Like [`lookup`](Self::lookup) but absence is an error
    pub async fn resolve(&self, path: &str, wait: Duration) -> OrbResult<EndpointId> {
        self.lookup(path, wait, false)
            .await?
            .ok_or_else(|| OrbError::NotFound(path.to_string()))
    }

    /// Ask the name server directly, bypassing the cache for the read.
    pub async fn lookup_remote(
        &self,
        path: &str,
        wait: Duration,
        quick_test: bool,
    ) -> OrbResult<Option<EndpointId>> {
        let wait = if wait.is_zero() {
            self.config.default_lookup_wait
        } else {
            wait
        };
        let deadline = Instant::now() + wait;
        let ns = self.name_server(self.config.name_server_wait).await?;

        let mut attempt = 0u32;
        let reply = loop {
            attempt += 1;
            let reply = ns
                .get_object(path)
                .await
                .map_err(|e| self.note_failure(e))?;
            self.cache.check_cookie(reply.cookie);

            if reply.found() || quick_test {
                break reply;
            }

            let left = deadline.saturating_duration_since(Instant::now());
            if left < self.config.min_remaining {
                break reply;
            }
            tracing::trace!(path, attempt, "Binding not present yet, polling");
            if !self.pause(left.min(self.config.retry_interval)).await {
                break reply;
            }
        };

        match reply.endpoint {
            Some(endpoint) => {
                self.cache.store(path, endpoint.clone());
                Ok(Some(endpoint))
            }
            None => Ok(None),
        }
    }

    /// Build a typed proxy for `path`.
    ///
    /// Tries the cache first unless `no_cache`; a cached endpoint that the
    /// factory rejects is evicted and resolution falls back to the name
    /// server. Never fails: `None` covers every way of not getting a proxy.
    pub async fn make_client_proxy<P>(
        &self,
        factory: &dyn ProxyFactory<P>,
        path: &str,
        wait: Duration,
        no_cache: bool,
        quick_test: bool,
    ) -> Option<Arc<P>>
    where
        P: ?Sized + Send + Sync,
    {
        let wait = if wait.is_zero() {
            self.config.default_proxy_wait
        } else {
            wait
        };

        if !no_cache && let Some(endpoint) = self.cache.lookup(path) {
            match factory.connect(&endpoint).await {
                Ok(proxy) => return Some(proxy),
                Err(e) => {
                    tracing::debug!(path, "Cached endpoint rejected, re-resolving: {e}");
                    self.cache.evict(path);
                }
            }
        }

        let endpoint = match self.lookup_remote(path, wait, quick_test).await {
            Ok(Some(endpoint)) => endpoint,
            Ok(None) => return None,
            Err(e) => {
                tracing::debug!(path, "Could not resolve binding: {e}");
                return None;
            }
        };

        match factory.connect(&endpoint).await {
            Ok(proxy) => Some(proxy),
            Err(e) => {
                tracing::debug!(path, "Could not connect to {endpoint}: {e}");
                self.cache.evict(path);
                None
            }
        }
    }

    /// Whether a terminal binding exists at `path`
    pub async fn binding_exists(&self, path: &str) -> OrbResult<bool> {
        shared::split_binding_path(path)?;
        let ns = self.name_server(Duration::ZERO).await?;
        let reply = ns
            .binding_exists(path)
            .await
            .map_err(|e| self.note_failure(e))?;
        self.cache.check_cookie(reply.cookie);
        Ok(reply.exists)
    }

    /// Whether a scope exists at `path`
    pub async fn scope_exists(&self, path: &str) -> OrbResult<bool> {
        shared::binding::validate_scope_path(path)?;
        let ns = self.name_server(Duration::ZERO).await?;
        let reply = ns
            .scope_exists(path)
            .await
            .map_err(|e| self.note_failure(e))?;
        self.cache.check_cookie(reply.cookie);
        Ok(reply.exists)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryLogCollector, InMemoryNameServer, MemoryFactory};
    use crate::rpc::{LOG_COLLECTOR_INTERFACE, LogCollector};
    use shared::{BindingRecord, Cookie};

    fn resolver(ns: &Arc<InMemoryNameServer>) -> Resolver {
        Resolver::new(
            ResolverConfig::default(),
            Arc::new(ObjectRefCache::new()),
            Arc::new(MemoryFactory::new(ns.clone())),
        )
    }

    #[tokio::test]
    async fn test_bootstrap_seeds_cookie() {
        let ns = Arc::new(InMemoryNameServer::new());
        let resolver = resolver(&ns);

        resolver.name_server(Duration::ZERO).await.unwrap();
        assert_eq!(resolver.cache().last_cookie(), ns.cookie());
        assert!(resolver.cache().lookup(NAME_SERVER_BINDING).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bootstrap_unavailable() {
        let ns = Arc::new(InMemoryNameServer::new());
        ns.set_available(false);
        let resolver = resolver(&ns);
        resolver.cache().store("/a/b", EndpointId::new("If", "1", "h", 1));

        let err = resolver.name_server(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, OrbError::NameServerUnavailable { port: crate::config::DEFAULT_NS_PORT, .. }));
        // 引导失败时清空缓存
        assert!(resolver.cache().is_empty());
    }

    #[tokio::test]
    async fn test_quick_test_returns_immediately() {
        let ns = Arc::new(InMemoryNameServer::new());
        let resolver = resolver(&ns);

        let found = resolver
            .lookup("/Svc/Missing", Duration::from_secs(30), true)
            .await
            .unwrap();
        assert!(found.is_none());
        assert_eq!(ns.get_object_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_until_deadline() {
        let ns = Arc::new(InMemoryNameServer::new());
        let resolver = resolver(&ns);

        let started = Instant::now();
        let found = resolver
            .lookup("/Svc/Missing", Duration::from_secs(2), false)
            .await
            .unwrap();
        assert!(found.is_none());
        assert!(started.elapsed() >= Duration::from_millis(1950));
        // 500ms 上限的间隔轮询: 0, 500, 1000, 1500 以及截止前的最后一次
        assert!(ns.get_object_calls() >= 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_sees_late_registration() {
        let ns = Arc::new(InMemoryNameServer::new());
        let resolver = Arc::new(resolver(&ns));
        let ep = EndpointId::new_instance("If", "host", 4000);

        let ns2 = ns.clone();
        let ep2 = ep.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(700)).await;
            ns2.bind_direct(BindingRecord::new("/Svc/Late", "late", ep2).unwrap());
        });

        let found = resolver
            .lookup("/Svc/Late", Duration::from_secs(5), false)
            .await
            .unwrap();
        assert_eq!(found, Some(ep));
    }

    #[tokio::test]
    async fn test_transport_loss_flushes_and_propagates() {
        let ns = Arc::new(InMemoryNameServer::new());
        let resolver = resolver(&ns);
        resolver.name_server(Duration::ZERO).await.unwrap();
        resolver.cache().store("/a/b", EndpointId::new("If", "1", "h", 1));

        ns.fail_next_calls(1);
        let err = resolver
            .lookup_remote("/Svc/Thing", Duration::from_secs(5), false)
            .await
            .unwrap_err();
        assert!(err.is_connection_lost());
        assert!(resolver.cache().lookup("/a/b").is_none());
    }

    #[tokio::test]
    async fn test_cookie_change_invalidates_cache() {
        let ns = Arc::new(InMemoryNameServer::new());
        let resolver = resolver(&ns);
        let ep = EndpointId::new_instance("If", "host", 4000);
        ns.bind_direct(BindingRecord::new("/Svc/A", "a", ep.clone()).unwrap());

        assert_eq!(
            resolver.lookup("/Svc/A", Duration::ZERO, true).await.unwrap(),
            Some(ep)
        );
        resolver.cache().store("/Svc/Other", EndpointId::new("If", "9", "h", 1));

        ns.restart();
        let old = resolver.cache().last_cookie();
        // 重启后任意一次成功调用都会带回新 cookie
        assert!(!resolver.binding_exists("/Svc/A").await.unwrap());
        assert_ne!(resolver.cache().last_cookie(), old);
        assert!(resolver.cache().lookup("/Svc/A").is_none());
        assert!(resolver.cache().lookup("/Svc/Other").is_none());
        assert_ne!(resolver.cache().last_cookie(), Cookie::UNKNOWN);
    }

    #[tokio::test]
    async fn test_make_client_proxy_evicts_stale_cache() {
        let ns = Arc::new(InMemoryNameServer::new());
        let resolver = resolver(&ns);
        let collector = Arc::new(InMemoryLogCollector::new(EndpointId::new_instance(
            LOG_COLLECTOR_INTERFACE,
            "host",
            5000,
        )));
        ns.bind_direct(
            BindingRecord::new("/Svc/Log", "log", collector.endpoint().clone()).unwrap(),
        );
        // 缓存里是一个过期的实例
        resolver.name_server(Duration::ZERO).await.unwrap();
        resolver.cache().store(
            "/Svc/Log",
            EndpointId::new_instance(LOG_COLLECTOR_INTERFACE, "host", 5000),
        );

        let factory = MemoryFactory::new(collector.clone());
        let proxy: Option<Arc<dyn LogCollector>> = resolver
            .make_client_proxy(&factory, "/Svc/Log", Duration::ZERO, false, true)
            .await;
        assert!(proxy.is_some());
        assert_eq!(
            resolver.cache().lookup("/Svc/Log"),
            Some(collector.endpoint().clone())
        );
    }

    #[tokio::test]
    async fn test_make_client_proxy_absent_is_none() {
        let ns = Arc::new(InMemoryNameServer::new());
        let resolver = resolver(&ns);
        let collector = Arc::new(InMemoryLogCollector::new(EndpointId::new_instance(
            LOG_COLLECTOR_INTERFACE,
            "host",
            5000,
        )));
        let factory = MemoryFactory::new(collector);
        let proxy: Option<Arc<dyn LogCollector>> = resolver
            .make_client_proxy(&factory, "/Svc/Nope", Duration::ZERO, true, true)
            .await;
        assert!(proxy.is_none());
    }

    #[tokio::test]
    async fn test_bad_paths_rejected_before_rpc() {
        let ns = Arc::new(InMemoryNameServer::new());
        let resolver = resolver(&ns);
        assert!(matches!(
            resolver.binding_exists("/nope").await,
            Err(OrbError::BadBindingPath(_))
        ));
        assert!(matches!(
            resolver.scope_exists("relative").await,
            Err(OrbError::BadBindingPath(_))
        ));
    }
}
