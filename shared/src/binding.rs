//! 绑定记录与绑定路径解析
//!
//! A binding maps a `/scope/name` path in the name server to an
//! [`EndpointId`]. Paths are compared case-insensitively everywhere.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::types::EndpointId;

/// Number of free-form attributes a binding carries
pub const EXTRA_ATTR_COUNT: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BindingPathError {
    #[error("Binding path is empty")]
    Empty,

    #[error("Binding path '{0}' must not end with a separator")]
    TrailingSeparator(String),

    #[error("Binding path '{0}' has no scope")]
    NoScope(String),

    #[error("Scope path '{0}' must start with a separator")]
    NotRooted(String),

    #[error("Path '{0}' contains an empty component")]
    EmptyComponent(String),
}

/// Split a full binding path into `(scope, name)`.
///
/// The last separator has to sit at offset 2 or later so both parts are
/// non-empty and the scope is at least `/x`.
pub fn split_binding_path(path: &str) -> Result<(&str, &str), BindingPathError> {
    if path.is_empty() {
        return Err(BindingPathError::Empty);
    }
    if path.ends_with('/') {
        return Err(BindingPathError::TrailingSeparator(path.to_string()));
    }
    match path.rfind('/') {
        Some(idx) if idx >= 2 => Ok((&path[..idx], &path[idx + 1..])),
        _ => Err(BindingPathError::NoScope(path.to_string())),
    }
}

/// Validate a scope path such as `/Services/Logging`.
pub fn validate_scope_path(path: &str) -> Result<(), BindingPathError> {
    if path.is_empty() {
        return Err(BindingPathError::Empty);
    }
    if !path.starts_with('/') {
        return Err(BindingPathError::NotRooted(path.to_string()));
    }
    if path.len() > 1 && path.ends_with('/') {
        return Err(BindingPathError::TrailingSeparator(path.to_string()));
    }
    if path.len() > 1 && path[1..].split('/').any(str::is_empty) {
        return Err(BindingPathError::EmptyComponent(path.to_string()));
    }
    Ok(())
}

/// One name server entry as registered by its owning process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingRecord {
    pub scope: String,
    pub name: String,
    pub description: String,
    pub extras: [String; EXTRA_ATTR_COUNT],
    pub endpoint: EndpointId,
}

impl BindingRecord {
    /// Build a record from a full path, validating it.
    pub fn new(
        full_path: &str,
        description: impl Into<String>,
        endpoint: EndpointId,
    ) -> Result<Self, BindingPathError> {
        let (scope, name) = split_binding_path(full_path)?;
        Ok(Self {
            scope: scope.to_string(),
            name: name.to_string(),
            description: description.into(),
            extras: Default::default(),
            endpoint,
        })
    }

    pub fn with_extras(mut self, extras: [String; EXTRA_ATTR_COUNT]) -> Self {
        self.extras = extras;
        self
    }

    /// `scope/name`
    pub fn full_path(&self) -> String {
        format!("{}/{}", self.scope, self.name)
    }

    pub fn path_matches(&self, path: &str) -> bool {
        self.full_path().eq_ignore_ascii_case(path)
    }
}

/// Per-entry outcome of a batched rebind call, positional with the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RebindResult {
    /// Bound (or re-bound) and leased
    Success,
    /// Server-side failure for this entry, worth retrying
    Exception,
    /// Path names a scope, never bindable
    NotATerminal,
}

impl fmt::Display for RebindResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RebindResult::Success => write!(f, "success"),
            RebindResult::Exception => write!(f, "exception"),
            RebindResult::NotATerminal => write!(f, "not_a_terminal"),
        }
    }
}
