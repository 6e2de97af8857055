//! 客户端上下文 - 一个进程一个实例，持有缓存、解析器与各后台组件

use parking_lot::Mutex;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::cache::ObjectRefCache;
use crate::config::OrbConfig;
use crate::kv::VersionedKvClient;
use crate::logger::FallbackLogger;
use crate::rebinder::AutoRebinder;
use crate::resolver::Resolver;
use crate::rpc::{ConfigStore, LogCollector, NameServer, ProxyFactory};

/// Process-wide client context.
///
/// Built once at startup and passed to whatever needs name resolution,
/// binding upkeep or remote logging. Components are created on first use.
pub struct OrbFacility {
    config: OrbConfig,
    resolver: Arc<Resolver>,
    shutdown: CancellationToken,
    rebinder: Mutex<Option<Arc<AutoRebinder>>>,
    logger: Mutex<Option<FallbackLogger>>,
}

impl std::fmt::Debug for OrbFacility {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrbFacility")
            .field("resolver", &self.resolver)
            .field("rebinder", &self.rebinder.lock().is_some())
            .field("logger", &self.logger.lock().is_some())
            .finish()
    }
}

impl OrbFacility {
    pub fn new(config: OrbConfig, ns_factory: Arc<dyn ProxyFactory<dyn NameServer>>) -> Self {
        let shutdown = CancellationToken::new();
        let resolver = Resolver::new(config.resolver.clone(), Arc::new(ObjectRefCache::new()), ns_factory)
            .with_shutdown(shutdown.child_token());

        tracing::info!(
            host = %config.resolver.ns_host,
            port = config.resolver.ns_port,
            "ORB client facility created"
        );
        Self {
            config,
            resolver: Arc::new(resolver),
            shutdown,
            rebinder: Mutex::new(None),
            logger: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &OrbConfig {
        &self.config
    }

    pub fn resolver(&self) -> &Arc<Resolver> {
        &self.resolver
    }

    pub fn cache(&self) -> &Arc<ObjectRefCache> {
        self.resolver.cache()
    }

    /// The rebinder, created on first call but not started
    pub fn rebinder(&self) -> Arc<AutoRebinder> {
        self.rebinder
            .lock()
            .get_or_insert_with(|| {
                Arc::new(AutoRebinder::new(self.resolver.clone(), self.config.rebinder.clone()))
            })
            .clone()
    }

    /// The rebinder, started
    pub fn start_rebinder(&self) -> Arc<AutoRebinder> {
        let rebinder = self.rebinder();
        rebinder.start();
        rebinder
    }

    /// Create (once) and start the fallback logger.
    ///
    /// `factory` is only used the first time; later calls return the
    /// existing logger, restarting it if it was stopped.
    pub fn start_logger(&self, factory: Arc<dyn ProxyFactory<dyn LogCollector>>) -> FallbackLogger {
        let logger = self
            .logger
            .lock()
            .get_or_insert_with(|| FallbackLogger::new(self.config.logger.clone(), self.resolver.clone(), factory))
            .clone();
        logger.start();
        logger
    }

    pub fn logger(&self) -> Option<FallbackLogger> {
        self.logger.lock().clone()
    }

    /// A KV client sharing this facility's cache
    pub fn kv_client(&self, factory: Arc<dyn ProxyFactory<dyn ConfigStore>>) -> VersionedKvClient {
        VersionedKvClient::new(self.config.kv.clone(), self.resolver.clone(), factory)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Stop the rebinder, interrupt resolver waits, then stop the logger so
    /// it records everything up to the end.
    pub async fn shutdown(&self) {
        let rebinder = self.rebinder.lock().clone();
        if let Some(rebinder) = rebinder {
            rebinder.stop().await;
        }

        self.shutdown.cancel();

        let logger = self.logger.lock().clone();
        if let Some(logger) = logger {
            logger.stop().await;
        }
        tracing::info!("ORB client facility shut down");
    }
}
