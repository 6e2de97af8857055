//! 集成测试公共工具

#![allow(dead_code)]

use orb_client::config::{CONFIG_STORE_BINDING, LOG_COLLECTOR_BINDING};
use orb_client::memory::{InMemoryConfigStore, InMemoryLogCollector, InMemoryNameServer, MemoryFactory};
use orb_client::rpc::{CONFIG_STORE_INTERFACE, LOG_COLLECTOR_INTERFACE};
use orb_client::{BindingRecord, EndpointId, ObjectRefCache, Resolver, ResolverConfig};
use std::sync::Arc;
use std::time::Duration;

/// In-process name server with a log collector and a config store bound
pub struct Services {
    pub ns: Arc<InMemoryNameServer>,
    pub collector: Arc<InMemoryLogCollector>,
    pub store: Arc<InMemoryConfigStore>,
}

impl Services {
    pub fn new() -> Self {
        let services = Self {
            ns: Arc::new(InMemoryNameServer::new()),
            collector: Arc::new(InMemoryLogCollector::new(EndpointId::new_instance(
                LOG_COLLECTOR_INTERFACE,
                "collector-host",
                13510,
            ))),
            store: Arc::new(InMemoryConfigStore::new(EndpointId::new_instance(
                CONFIG_STORE_INTERFACE,
                "store-host",
                13511,
            ))),
        };
        services.publish();
        services
    }

    /// (Re)bind the collector and the store, e.g. after a restart
    pub fn publish(&self) {
        self.ns.bind_direct(
            BindingRecord::new(LOG_COLLECTOR_BINDING, "log collector", self.collector.endpoint().clone()).unwrap(),
        );
        self.ns.bind_direct(
            BindingRecord::new(CONFIG_STORE_BINDING, "config store", self.store.endpoint().clone()).unwrap(),
        );
    }

    pub fn resolver(&self) -> Arc<Resolver> {
        Arc::new(Resolver::new(
            ResolverConfig::default(),
            Arc::new(ObjectRefCache::new()),
            Arc::new(MemoryFactory::new(self.ns.clone())),
        ))
    }

    pub fn collector_factory(&self) -> Arc<MemoryFactory<InMemoryLogCollector>> {
        Arc::new(MemoryFactory::new(self.collector.clone()))
    }

    pub fn store_factory(&self) -> Arc<MemoryFactory<InMemoryConfigStore>> {
        Arc::new(MemoryFactory::new(self.store.clone()))
    }
}

pub fn endpoint(port: u16) -> EndpointId {
    EndpointId::new_instance("test.Service", "svc-host", port)
}

/// Poll `check` every 20ms until it holds, panicking after `limit`
pub async fn wait_until<F>(limit: Duration, what: &str, mut check: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + limit;
    while !check() {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
