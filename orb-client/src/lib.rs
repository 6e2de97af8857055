//! Orb Client - 分布式对象客户端的容错层
//!
//! Keeps a client process working while the name server, the log collector
//! or the config store come and go:
//!
//! - [`Resolver`] turns binding paths into endpoints through a cookie-checked cache
//! - [`AutoRebinder`] keeps exported objects bound and their leases renewed
//! - [`FallbackLogger`] ships log events remotely and spills to local files
//! - [`VersionedKvClient`] does optimistic versioned reads and writes
//!
//! [`OrbFacility`] wires them together around one cache and one shutdown token.

pub mod cache;
pub mod config;
pub mod error;
pub mod facility;
pub mod kv;
pub mod logger;
pub mod logging;
pub mod memory;
pub mod rebinder;
pub mod resolver;
pub mod rpc;
pub mod tasks;

pub use cache::ObjectRefCache;
pub use config::{KvConfig, LoggerConfig, OrbConfig, RebinderConfig, ResolverConfig};
pub use error::{OrbError, OrbResult};
pub use facility::OrbFacility;
pub use kv::{ScopeKey, VersionedKvClient};
pub use logger::{FallbackLayer, FallbackLogger, LoggerStats};
pub use rebinder::{AutoRebinder, BindingSnapshot, RebinderStats, RemovalReason, RemovalRecord};
pub use resolver::Resolver;
pub use rpc::{ConfigStore, LogCollector, NameServer, ProxyFactory};

// Re-export shared types for convenience
pub use shared::{BindingRecord, Cookie, EndpointId, LogEvent, Severity};
