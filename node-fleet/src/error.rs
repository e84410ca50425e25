//! Error taxonomy for the fleet supervisor
//!
//! Every subsystem returns its own error enum; the binary wraps them with
//! `anyhow` context at the composition root.

use std::path::PathBuf;

use crate::version::Version;

/// Failures while asking the remote authority for the suggested version
#[derive(Debug, thiserror::Error)]
pub enum VersionError {
    #[error("version authority unavailable: {0}")]
    Unavailable(String),
}

/// Failures while acquiring a binary artifact.
///
/// Variants carry rendered messages so a single in-flight acquisition can
/// hand the same error to every waiting caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ArtifactError {
    #[error("failed to download version {version}: {reason}")]
    Download { version: Version, reason: String },
    #[error("failed to extract version {version}: {reason}")]
    Extract { version: Version, reason: String },
    #[error("unsupported platform: {os}/{arch}")]
    UnsupportedPlatform { os: String, arch: String },
    #[error("invalid version string: {0:?}")]
    InvalidVersion(String),
}

/// Failures of a single supervised node
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("{node}: invalid config path or config.yaml malformed ({path}): {reason}")]
    ConfigLoad {
        node: String,
        path: PathBuf,
        reason: String,
    },
    #[error("{node}: setup did not complete: {reason}")]
    SetupFailed { node: String, reason: String },
    #[error("{node}: failed to spawn process: {source}")]
    Spawn {
        node: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
}

/// Failures of the fleet configuration file
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("cannot write {path}: {reason}")]
    Write { path: PathBuf, reason: String },
}
