//! Reply payloads of the name server and config store calls
//!
//! Batched replies are positional: `results[i]` answers request item `i`.
//! When `in_sync` is false the server's cookie differed from the one the
//! caller sent, nothing was applied and `results` must be ignored.

use serde::{Deserialize, Serialize};

use crate::binding::RebindResult;
use crate::types::{Cookie, EndpointId};

/// `GetObject(path)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetObjectReply {
    pub endpoint: Option<EndpointId>,
    pub cookie: Cookie,
}

impl GetObjectReply {
    pub fn found(&self) -> bool {
        self.endpoint.is_some()
    }
}

/// `RebindObjects(records, cookie)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebindReply {
    pub in_sync: bool,
    pub cookie: Cookie,
    pub results: Vec<RebindResult>,
}

/// `RenewLeases(paths, cookie)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenewReply {
    pub in_sync: bool,
    pub cookie: Cookie,
    pub results: Vec<bool>,
}

/// `BindingExists(path)` / `ScopeExists(path)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExistsReply {
    pub exists: bool,
    pub cookie: Cookie,
}

/// Stored value plus its optimistic-concurrency version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedObject {
    pub bytes: Vec<u8>,
    pub version: u64,
}

/// `AddOrUpdate(key, version, bytes)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateReply {
    /// False when the supplied version was stale
    pub ok: bool,
    pub version: u64,
}
