//! Normalization of node stdout/stderr into leveled log lines
//!
//! Node binaries print lines such as
//! `2023-04-05T12:00:00.123Z	INFO	piecestore	upload started`, terminated by
//! either `\n` or `\r`. Each line loses its leading timestamp, and a leading
//! severity token (if any) becomes the log level.

use std::sync::LazyLock;

use regex::Regex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

use crate::logging::{self, LogLevel};

static OFFSET_TIMESTAMP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9]+-[0-9]+-[0-9]+T[0-9]+:[0-9]+:[0-9]+(?:\.[0-9]+)?[+-][0-9]+(?::[0-9]+)?")
        .unwrap()
});

static ZULU_TIMESTAMP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9]+-[0-9]+-[0-9]+T[0-9]+:[0-9]+:[0-9]+\.[0-9]+Z").unwrap()
});

static LEVEL_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(INFO|WARN|ERROR|FATAL)\b").unwrap());

/// One normalized output line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeLine {
    pub level: LogLevel,
    pub message: String,
}

/// Strips timestamp and severity from `raw`; blank lines yield `None`
pub fn normalize(raw: &str, default_level: LogLevel) -> Option<NodeLine> {
    let mut line = raw.trim();
    for timestamp in [&*OFFSET_TIMESTAMP, &*ZULU_TIMESTAMP] {
        if let Some(found) = timestamp.find(line) {
            line = line[found.end()..].trim();
        }
    }

    if line.is_empty() {
        return None;
    }

    let (level, message) = match LEVEL_TOKEN.find(line) {
        Some(token) => (
            LogLevel::from_token(token.as_str()).unwrap_or(default_level),
            line[token.end()..].trim(),
        ),
        None => (default_level, line),
    };

    Some(NodeLine {
        level,
        message: message.to_string(),
    })
}

/// Longest line kept in memory; longer output is forwarded in pieces
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Reassembles lines from arbitrarily chunked output
#[derive(Debug, Default)]
pub struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    /// Feeds a chunk and returns every line it completed
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in chunk {
            if byte == b'\n' || byte == b'\r' {
                if !self.pending.is_empty() {
                    lines.push(String::from_utf8_lossy(&self.pending).into_owned());
                    self.pending.clear();
                }
            } else {
                self.pending.push(byte);
                if self.pending.len() >= MAX_LINE_BYTES {
                    lines.push(String::from_utf8_lossy(&self.pending).into_owned());
                    self.pending.clear();
                }
            }
        }
        lines
    }

    /// Returns the unterminated tail, if any
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(line)
    }
}

/// Reads `stream` until EOF and forwards every line to the log sink
pub async fn forward_lines<R>(mut stream: R, node: String, default_level: LogLevel)
where
    R: AsyncRead + Unpin,
{
    let mut splitter = LineSplitter::default();
    let mut buf = vec![0u8; 8 * 1024];

    loop {
        match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                for line in splitter.push(&buf[..n]) {
                    emit(&node, &line, default_level);
                }
            }
            Err(e) => {
                debug!(node = %node, "output stream closed: {}", e);
                break;
            }
        }
    }

    if let Some(line) = splitter.finish() {
        emit(&node, &line, default_level);
    }
}

fn emit(node: &str, raw: &str, default_level: LogLevel) {
    if let Some(line) = normalize(raw, default_level) {
        logging::emit_node_line(node, line.level, &line.message);
    }
}
