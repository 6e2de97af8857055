//! Failure taxonomy of the resilience layer
//!
//! Every concrete error maps onto one of these kinds; the kind decides the
//! reaction (evict, retry, resync, drop), not the concrete error.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Connection-level failure. Cached proxies and cache entries are
    /// discarded; never retried by the call that saw it.
    TransportLost,
    /// Valid reply, entity absent. Retried until the caller's deadline
    /// unless in quick-test mode.
    NotFound,
    /// Cookie disagreement. Forces a full resync.
    StateMismatch,
    /// Path is a scope, never bindable. Evicted once, never retried.
    PermanentMisconfiguration,
    /// Bounded queue full. Event dropped and counted.
    Overload,
}

impl FailureKind {
    /// Whether the reaction to this failure includes discarding connections
    pub fn evicts_connection(&self) -> bool {
        matches!(self, FailureKind::TransportLost)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::TransportLost => write!(f, "transport_lost"),
            FailureKind::NotFound => write!(f, "not_found"),
            FailureKind::StateMismatch => write!(f, "state_mismatch"),
            FailureKind::PermanentMisconfiguration => write!(f, "permanent_misconfiguration"),
            FailureKind::Overload => write!(f, "overload"),
        }
    }
}
