//! Shared types for the ORB client resilience layer
//!
//! 名称服务器、日志收集器、配置存储的客户端与服务端共用的数据模型：
//! endpoint ids, binding records, epoch cookies, log events and the
//! framed on-disk format used by the local fallback log.

pub mod binding;
pub mod error;
pub mod frame;
pub mod log_event;
pub mod rpc;
pub mod types;
pub mod util;

// Re-exports
pub use serde::{Deserialize, Serialize};

pub use binding::{BindingPathError, BindingRecord, RebindResult, split_binding_path};
pub use error::FailureKind;
pub use log_event::{ErrorClass, LogEvent, Severity};
pub use types::{Cookie, EndpointId};
