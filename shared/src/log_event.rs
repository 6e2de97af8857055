//! 日志事件
//!
//! Produced by arbitrary application threads, immutable once built. The
//! same value is sent to the remote collector and framed into local
//! fallback files.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::util::now_millis;

/// Severity, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Trace,
    Info,
    Warn,
    Failed,
    ProcessFatal,
    SystemFatal,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Trace => write!(f, "trace"),
            Severity::Info => write!(f, "info"),
            Severity::Warn => write!(f, "warn"),
            Severity::Failed => write!(f, "failed"),
            Severity::ProcessFatal => write!(f, "process_fatal"),
            Severity::SystemFatal => write!(f, "system_fatal"),
        }
    }
}

/// Coarse classification of what went wrong
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    #[default]
    None,
    AppStatus,
    CantDo,
    Internal,
    LostConnection,
    NotFound,
    OutOfResources,
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
    pub severity: Severity,
    pub error_class: ErrorClass,
    pub host: String,
    pub process: String,
    pub thread: String,
    pub file: String,
    pub line: u32,
    pub message: String,
    /// UTC milliseconds
    pub timestamp: i64,
}

impl LogEvent {
    /// Event stamped with the current host, process, thread and time
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            severity,
            error_class: ErrorClass::None,
            host: local_host_name(),
            process: current_process_name(),
            thread: current_thread_name(),
            file: String::new(),
            line: 0,
            message: message.into(),
            timestamp: now_millis(),
        }
    }

    pub fn with_class(mut self, class: ErrorClass) -> Self {
        self.error_class = class;
        self
    }

    pub fn with_location(mut self, file: impl Into<String>, line: u32) -> Self {
        self.file = file.into();
        self.line = line;
        self
    }

    pub fn with_process(mut self, process: impl Into<String>) -> Self {
        self.process = process.into();
        self
    }
}

impl fmt::Display for LogEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}/{}/{} {}:{} {}",
            self.severity, self.host, self.process, self.thread, self.file, self.line, self.message
        )
    }
}

/// Executable stem, or `process` if it cannot be determined
pub fn current_process_name() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "process".to_string())
}

fn current_thread_name() -> String {
    let thread = std::thread::current();
    match thread.name() {
        Some(name) => name.to_string(),
        None => format!("{:?}", thread.id()),
    }
}

fn local_host_name() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}
