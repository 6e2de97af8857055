//! Resilient Client Example
//!
//! Runs every component against in-process collaborators:
//! 1. Registers two objects with the auto-rebinder
//! 2. Restarts the name server and watches the bindings come back
//! 3. Logs while the collector is down, then replays on reconnect
//! 4. Does an optimistic update through the versioned KV client
//!
//! Run: cargo run --example resilient_client

use orb_client::config::{CONFIG_STORE_BINDING, LOG_COLLECTOR_BINDING};
use orb_client::memory::{InMemoryConfigStore, InMemoryLogCollector, InMemoryNameServer, MemoryFactory};
use orb_client::rpc::{CONFIG_STORE_INTERFACE, LOG_COLLECTOR_INTERFACE};
use orb_client::{
    BindingRecord, EndpointId, LoggerConfig, OrbConfig, OrbFacility, RebinderConfig, ScopeKey,
    Severity,
};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    let log_dir = tempfile::tempdir()?;
    let config = OrbConfig::from_env()?
        .with_rebinder(
            RebinderConfig::default()
                .with_tick_interval(Duration::from_millis(200))
                .with_lease_threshold(Duration::from_secs(2)),
        )
        .with_logger(
            LoggerConfig::new("resilient_client", log_dir.path())
                .with_reconnect_throttle(Duration::from_millis(200)),
        );

    // In-process stand-ins for the remote services
    let ns = Arc::new(InMemoryNameServer::new());
    let collector = Arc::new(InMemoryLogCollector::new(EndpointId::new_instance(
        LOG_COLLECTOR_INTERFACE,
        "localhost",
        13510,
    )));
    let store = Arc::new(InMemoryConfigStore::new(EndpointId::new_instance(
        CONFIG_STORE_INTERFACE,
        "localhost",
        13511,
    )));
    let publish_services = |ns: &InMemoryNameServer| -> anyhow::Result<()> {
        ns.bind_direct(BindingRecord::new(LOG_COLLECTOR_BINDING, "log collector", collector.endpoint().clone())?);
        ns.bind_direct(BindingRecord::new(CONFIG_STORE_BINDING, "config store", store.endpoint().clone())?);
        Ok(())
    };
    publish_services(&ns)?;

    let facility = OrbFacility::new(config, Arc::new(MemoryFactory::new(ns.clone())));
    let logger = facility.start_logger(Arc::new(MemoryFactory::new(collector.clone())));
    orb_client::logging::init_logger_with_fallback("info", &logger, tracing::Level::INFO)?;

    // 1. Auto-rebind
    let rebinder = facility.start_rebinder();
    rebinder
        .register(EndpointId::new_instance("demo.Echo", "localhost", 4000), "/Demo/Echo", "echo service")
        .await?;
    rebinder
        .register(EndpointId::new_instance("demo.Clock", "localhost", 4001), "/Demo/Clock", "clock service")
        .await?;
    tokio::time::sleep(Duration::from_millis(500)).await;
    println!("bound after start: echo={} clock={}", ns.is_bound("/Demo/Echo"), ns.is_bound("/Demo/Clock"));

    // 2. Name server restart
    ns.restart();
    publish_services(&ns)?;
    tokio::time::sleep(Duration::from_secs(3)).await;
    println!("bound after restart: echo={} clock={}", ns.is_bound("/Demo/Echo"), ns.is_bound("/Demo/Clock"));
    println!("rebinder stats: {:?}", rebinder.stats());

    // 3. Fallback logging
    collector.set_available(false);
    for i in 0..5 {
        logger.log_message(Severity::Info, format!("written while collector is down #{i}"));
    }
    tokio::time::sleep(Duration::from_millis(500)).await;
    collector.set_available(true);
    tokio::time::sleep(Duration::from_secs(1)).await;
    println!("logger stats: {:?}", logger.stats());
    println!("collector received {} events", collector.events().len());

    // 4. Versioned KV
    let kv = facility
        .kv_client(Arc::new(MemoryFactory::new(store.clone())))
        .with_key(ScopeKey::generate());
    kv.add_encrypted_scope("/Demo/Secrets")?;

    let mut version = 0;
    kv.add_or_update("/Demo/Secrets/token", &mut version, b"s3cr3t").await?;
    let mut stale = 0;
    let accepted = kv.add_or_update("/Demo/Secrets/token", &mut stale, b"other").await?;
    println!("stale update accepted={accepted}, current version={stale}");
    if let Some((bytes, version)) = kv.read_object("/Demo/Secrets/token").await? {
        println!("read back v{version}: {}", String::from_utf8_lossy(&bytes));
    }

    facility.shutdown().await;
    Ok(())
}
