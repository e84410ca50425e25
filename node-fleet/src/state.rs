//! Node identity and mutable runtime state

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;

use crate::version::Version;

pub type Shared<T> = Arc<Mutex<T>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}

/// Static identity of one supervised node, fixed at startup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSpec {
    pub name: String,
    pub config_dir: PathBuf,
    pub enabled: bool,
    /// Appended to the `run` invocation
    pub extra_args: Vec<String>,
}

impl NodeSpec {
    /// The node's own configuration file, written by `setup`
    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("config.yaml")
    }

    pub fn identity_dir(&self) -> PathBuf {
        self.config_dir.join("identity")
    }
}

/// Lifecycle phase of a supervised node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodePhase {
    Stopped,
    Starting,
    Running,
    Restarting,
}

/// Handle on the live process; dropping it never kills the process
#[derive(Debug)]
pub(crate) struct ActiveProcess {
    pub pid: Option<u32>,
    /// Asks the watcher task to terminate the process
    pub stop_tx: oneshot::Sender<()>,
    /// Resolves once the process has exited
    pub exited_rx: oneshot::Receiver<()>,
}

/// Mutable state owned by one supervisor
#[derive(Debug)]
pub(crate) struct NodeRuntimeState {
    pub version: Version,
    pub phase: NodePhase,
    pub stop_requested: bool,
    pub initialized: bool,
    pub active: Option<ActiveProcess>,
    /// Bumped on every successful launch; stale watchers compare against it
    pub generation: u64,
    /// Bumped by every launch attempt and every stop; a launch whose epoch
    /// moved on while it was spawning discards its process
    pub launch_epoch: u64,
    /// Consecutive unexpected exits since the last stable run
    pub restart_attempts: u32,
    pub node_config: Option<serde_yaml::Value>,
}

impl NodeRuntimeState {
    pub fn new(version: Version) -> Self {
        Self {
            version,
            phase: NodePhase::Stopped,
            stop_requested: true,
            initialized: false,
            active: None,
            generation: 0,
            launch_epoch: 0,
            restart_attempts: 0,
            node_config: None,
        }
    }

    pub fn console_address(&self) -> Option<String> {
        let config = self.node_config.as_ref()?;
        config
            .get("console.address")
            .or_else(|| config.get("console")?.get("address"))
            .and_then(|v| v.as_str())
            .map(str::to_string)
    }
}

/// Point-in-time view of a node, for logs and tests
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeStatus {
    pub name: String,
    pub phase: NodePhase,
    pub version: Version,
    pub initialized: bool,
    pub pid: Option<u32>,
    pub restart_attempts: u32,
    pub console_address: Option<String>,
}
