//! Logging setup and the sink for supervised node output

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Severity of a forwarded log record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl LogLevel {
    /// Parses an upper-case severity token as printed by node binaries
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "INFO" => Some(LogLevel::Info),
            "WARN" => Some(LogLevel::Warn),
            "ERROR" => Some(LogLevel::Error),
            "FATAL" => Some(LogLevel::Fatal),
            _ => None,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Fatal => "fatal",
        };
        f.write_str(label)
    }
}

/// Installs the global fmt subscriber; `RUST_LOG` overrides the default filter
pub fn init() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("node_fleet=info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Forwards one line of node output, tagged with the node name
pub fn emit_node_line(node: &str, level: LogLevel, message: &str) {
    match level {
        LogLevel::Debug => debug!(node = %node, "{}", message),
        LogLevel::Info => info!(node = %node, "{}", message),
        LogLevel::Warn => warn!(node = %node, "{}", message),
        LogLevel::Error => error!(node = %node, "{}", message),
        LogLevel::Fatal => error!(node = %node, fatal = true, "{}", message),
    }
}
