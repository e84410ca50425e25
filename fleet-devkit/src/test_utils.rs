/*!
Test harness pieces for fleet-level tests

- `RecordingNode` implements `NodeControl` and writes every call into a
  journal shared by the whole fleet, stamped with tokio time so paused-clock
  tests can assert on stagger delays
- `MemoryVersionStore` keeps the adopted version in memory
- `write_script` drops an executable shell script posing as a node binary
*/

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use node_fleet::platform::{Platform, DEFAULT_DOWNLOAD_URL_TEMPLATE};
use node_fleet::{
    ArtifactCache, CacheSettings, ConfigError, Distribution, NodeControl, NodeError, NodePhase,
    NodeStatus, Version, VersionStore,
};

/// Installs a test subscriber once; later calls are no-ops
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "node_fleet=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

/// Cache rooted at `root` using linux/amd64 naming and family `storagenode`
pub fn fleet_cache(root: &Path, distribution: Arc<dyn Distribution>) -> ArtifactCache {
    let settings = CacheSettings {
        binary_dir: root.join("binaries"),
        family: "storagenode".into(),
        url_template: DEFAULT_DOWNLOAD_URL_TEMPLATE.into(),
        temp_dir: root.join("tmp"),
    };
    ArtifactCache::with_platform(settings, Platform::resolve("linux", "x86_64"), distribution)
}

/// Writes an executable `/bin/sh` script
#[cfg(unix)]
pub fn write_script(path: &Path, body: &str) -> Result<PathBuf> {
    use std::os::unix::fs::PermissionsExt;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, format!("#!/bin/sh\n{body}\n"))?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))?;
    Ok(path.to_path_buf())
}

/// One call observed by a [`RecordingNode`] or [`MemoryVersionStore`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeCall {
    Init,
    Start(String),
    Stop,
    Persist(String),
}

pub type Journal = Arc<Mutex<Vec<(String, NodeCall, Instant)>>>;

/// `NodeControl` double that records instead of spawning
pub struct RecordingNode {
    name: String,
    journal: Journal,
    version: Mutex<Version>,
    initialized: Mutex<bool>,
    running: Mutex<bool>,
    fail_init: bool,
    fail_start_on: Mutex<Option<Version>>,
}

impl RecordingNode {
    pub fn new(name: &str, version: Version, journal: &Journal) -> Self {
        Self {
            name: name.to_string(),
            journal: journal.clone(),
            version: Mutex::new(version),
            initialized: Mutex::new(false),
            running: Mutex::new(false),
            fail_init: false,
            fail_start_on: Mutex::new(None),
        }
    }

    /// init() fails as if setup exited non-zero
    pub fn failing_init(mut self) -> Self {
        self.fail_init = true;
        self
    }

    /// start() fails whenever the node is set to `version`
    pub fn fail_start_on(&self, version: Version) {
        *self.fail_start_on.lock() = Some(version);
    }

    pub fn is_running(&self) -> bool {
        *self.running.lock()
    }

    pub fn current_version(&self) -> Version {
        self.version.lock().clone()
    }

    fn record(&self, call: NodeCall) {
        self.journal.lock().push((self.name.clone(), call, Instant::now()));
    }
}

#[async_trait]
impl NodeControl for RecordingNode {
    fn name(&self) -> &str {
        &self.name
    }

    async fn init(&self) -> Result<(), NodeError> {
        self.record(NodeCall::Init);
        if self.fail_init {
            return Err(NodeError::SetupFailed {
                node: self.name.clone(),
                reason: "exit status: 1".into(),
            });
        }
        *self.initialized.lock() = true;
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        *self.initialized.lock()
    }

    async fn start(&self) -> Result<(), NodeError> {
        let version = self.current_version();
        self.record(NodeCall::Start(version.to_string()));
        if self.fail_start_on.lock().as_ref() == Some(&version) {
            return Err(NodeError::Spawn {
                node: self.name.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "binary missing"),
            });
        }
        *self.running.lock() = true;
        Ok(())
    }

    async fn stop(&self) {
        self.record(NodeCall::Stop);
        *self.running.lock() = false;
    }

    fn set_version(&self, version: Version) {
        *self.version.lock() = version;
    }

    fn status(&self) -> NodeStatus {
        NodeStatus {
            name: self.name.clone(),
            phase: if self.is_running() {
                NodePhase::Running
            } else {
                NodePhase::Stopped
            },
            version: self.current_version(),
            initialized: self.is_initialized(),
            pid: None,
            restart_attempts: 0,
            console_address: None,
        }
    }
}

/// In-memory `VersionStore`, optionally refusing writes
pub struct MemoryVersionStore {
    journal: Journal,
    persisted: Mutex<Option<Version>>,
    read_only: Mutex<bool>,
}

impl MemoryVersionStore {
    pub fn new(initial: Option<Version>, journal: &Journal) -> Self {
        Self {
            journal: journal.clone(),
            persisted: Mutex::new(initial),
            read_only: Mutex::new(false),
        }
    }

    pub fn set_read_only(&self, read_only: bool) {
        *self.read_only.lock() = read_only;
    }

    pub fn persisted(&self) -> Option<Version> {
        self.persisted.lock().clone()
    }
}

#[async_trait]
impl VersionStore for MemoryVersionStore {
    async fn persist_version(&self, version: &Version) -> Result<(), ConfigError> {
        self.journal
            .lock()
            .push(("store".into(), NodeCall::Persist(version.to_string()), Instant::now()));
        if *self.read_only.lock() {
            return Err(ConfigError::Write {
                path: "memory".into(),
                reason: "read-only".into(),
            });
        }
        *self.persisted.lock() = Some(version.clone());
        Ok(())
    }
}

/// Calls without timestamps
pub fn calls(journal: &Journal) -> Vec<(String, NodeCall)> {
    journal
        .lock()
        .iter()
        .map(|(name, call, _)| (name.clone(), call.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_recording_node_journals_calls() {
        let journal = Journal::default();
        let node = RecordingNode::new("n1", Version::new("1.0.0").unwrap(), &journal);

        node.init().await.unwrap();
        node.start().await.unwrap();
        assert!(node.is_running());
        node.stop().await;

        assert_eq!(
            calls(&journal),
            vec![
                ("n1".to_string(), NodeCall::Init),
                ("n1".to_string(), NodeCall::Start("1.0.0".into())),
                ("n1".to_string(), NodeCall::Stop),
            ]
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_write_script_is_executable() {
        use std::os::unix::fs::PermissionsExt;

        let temp = tempfile::tempdir().unwrap();
        let path = write_script(&temp.path().join("bin/node"), "exit 0").unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0o111);
    }
}
