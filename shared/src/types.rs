//! Core identity types: epoch cookies and endpoint ids

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// 名称服务器纪元 cookie
///
/// Opaque 64-bit value handed out by the name server with every reply. Only
/// equality is meaningful: a different value means the server lost its state
/// and everything cached against the old value is stale. Zero is reserved
/// for "unknown".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cookie(pub u64);

impl Cookie {
    /// Sentinel for "we have not synchronised with the server yet"
    pub const UNKNOWN: Cookie = Cookie(0);

    pub fn is_known(&self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016X}", self.0)
    }
}

/// Identifies one remote object instance.
///
/// Immutable once resolved and freely cloned; nobody owns the remote side
/// through it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointId {
    /// Interface (contract) the object implements
    pub interface_id: String,
    /// Unique id of this particular instance
    pub instance_id: String,
    pub host: String,
    pub port: u16,
}

impl EndpointId {
    pub fn new(
        interface_id: impl Into<String>,
        instance_id: impl Into<String>,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            interface_id: interface_id.into(),
            instance_id: instance_id.into(),
            host: host.into(),
            port,
        }
    }

    /// New endpoint with a freshly generated instance id
    pub fn new_instance(interface_id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self::new(interface_id, Uuid::new_v4().simple().to_string(), host, port)
    }

    /// `host:port` of the server hosting the object
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}:{} ({})",
            self.interface_id, self.host, self.port, self.instance_id
        )
    }
}
