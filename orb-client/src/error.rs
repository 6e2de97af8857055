//! ORB client error types

use shared::FailureKind;
use shared::binding::BindingPathError;
use shared::frame::FrameError;
use thiserror::Error;

/// ORB client error type
#[derive(Debug, Error)]
pub enum OrbError {
    /// Could not connect to the target server at all
    #[error("Server not available: {0}")]
    ServerUnavailable(String),

    /// Connection died while a call was in flight
    #[error("Connection lost: {0}")]
    TransportLost(String),

    /// Bootstrap of the name server proxy failed
    #[error("Name server not available at {host}:{port}")]
    NameServerUnavailable { host: String, port: u16 },

    /// Valid reply, entity absent
    #[error("Not found: {0}")]
    NotFound(String),

    /// Server cookie disagreed with ours
    #[error("Name server state mismatch")]
    StateMismatch,

    /// Path is a scope, not a terminal binding
    #[error("Not a terminal binding: {0}")]
    NotATerminal(String),

    #[error("Invalid binding path: {0}")]
    BadBindingPath(#[from] BindingPathError),

    #[error("Binding already registered: {0}")]
    AlreadyRegistered(String),

    #[error("Binding not registered: {0}")]
    BindingNotFound(String),

    /// Extra attribute index outside 1..=4
    #[error("Bad extra attribute index: {0}")]
    BadAttributeIndex(usize),

    #[error("Timed out: {0}")]
    Timeout(String),

    /// Server raised an application-level error
    #[error("Remote error: {0}")]
    Rpc(String),

    #[error("Encryption error: {0}")]
    Crypto(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Local log error: {0}")]
    Frame(#[from] FrameError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl OrbError {
    /// Failure kind that drives the resilience reaction, if any
    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            OrbError::ServerUnavailable(_)
            | OrbError::TransportLost(_)
            | OrbError::NameServerUnavailable { .. } => Some(FailureKind::TransportLost),
            OrbError::NotFound(_) => Some(FailureKind::NotFound),
            OrbError::StateMismatch => Some(FailureKind::StateMismatch),
            OrbError::NotATerminal(_) => Some(FailureKind::PermanentMisconfiguration),
            _ => None,
        }
    }

    /// True when the underlying connection is gone and cached handles must go
    pub fn is_connection_lost(&self) -> bool {
        self.kind().is_some_and(|k| k.evicts_connection())
    }
}

/// Result type for ORB client operations
pub type OrbResult<T> = Result<T, OrbError>;
