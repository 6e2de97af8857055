//! 远程接口抽象 - 名称服务器、日志收集器、配置存储，以及代理工厂

use async_trait::async_trait;
use shared::rpc::{ExistsReply, GetObjectReply, RebindReply, RenewReply, UpdateReply, VersionedObject};
use shared::{BindingRecord, Cookie, EndpointId, LogEvent};
use std::fmt::Debug;
use std::sync::Arc;

use crate::error::OrbResult;

/// Interface id of the name server
pub const NAME_SERVER_INTERFACE: &str = "DA7622D8FE9D1744-8BBD12DB0DD8ABF3";

/// Fixed instance id the name server always exports itself under
pub const NAME_SERVER_INSTANCE: &str = "0D9B7B5F0E3A4E1C-A51D6E8C2B7F9034";

/// Faux cache binding under which the name server endpoint is remembered
pub const NAME_SERVER_BINDING: &str = "/Orb/NameServer/Proxy";

pub const LOG_COLLECTOR_INTERFACE: &str = "orb.LogCollector";
pub const CONFIG_STORE_INTERFACE: &str = "orb.ConfigStore";

/// Name server calls consumed by the resolver and the rebinder.
///
/// Implementations map connection failures to
/// [`OrbError::TransportLost`](crate::OrbError::TransportLost) or
/// [`OrbError::ServerUnavailable`](crate::OrbError::ServerUnavailable) so
/// callers can tell them apart from application errors.
#[async_trait]
pub trait NameServer: Send + Sync + Debug {
    async fn get_object(&self, path: &str) -> OrbResult<GetObjectReply>;

    /// Bind or re-bind a batch. Results are positional.
    async fn rebind_objects(&self, records: &[BindingRecord], cookie: Cookie) -> OrbResult<RebindReply>;

    /// Renew leases of already-bound paths. Results are positional.
    async fn renew_leases(&self, paths: &[String], cookie: Cookie) -> OrbResult<RenewReply>;

    async fn query_cookie(&self) -> OrbResult<Cookie>;

    /// `index` is 1 based
    async fn update_extra_attr(&self, path: &str, index: usize, value: &str) -> OrbResult<()>;

    async fn remove_binding(&self, path: &str) -> OrbResult<()>;

    async fn binding_exists(&self, path: &str) -> OrbResult<ExistsReply>;

    async fn scope_exists(&self, path: &str) -> OrbResult<ExistsReply>;
}

/// Remote log sink
#[async_trait]
pub trait LogCollector: Send + Sync + Debug {
    async fn log_single(&self, event: &LogEvent) -> OrbResult<()>;
}

/// Versioned key/value store
#[async_trait]
pub trait ConfigStore: Send + Sync + Debug {
    async fn read_object(&self, key: &str) -> OrbResult<Option<VersionedObject>>;

    /// Version 0 creates. A stale version leaves the value untouched and
    /// reports `ok = false` with the current version.
    async fn add_or_update(&self, key: &str, version: u64, bytes: &[u8]) -> OrbResult<UpdateReply>;

    /// Returns whether the key existed
    async fn delete_object(&self, key: &str) -> OrbResult<bool>;
}

/// Builds a typed proxy for an endpoint.
///
/// This is the seam to the transport: construction either yields a usable
/// handle or fails, in which case a cached endpoint is considered stale.
#[async_trait]
pub trait ProxyFactory<P: ?Sized + Send + Sync>: Send + Sync {
    async fn connect(&self, endpoint: &EndpointId) -> OrbResult<Arc<P>>;
}
