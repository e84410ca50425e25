//! Fleet coordination and rolling updates
//!
//! The [`FleetCoordinator`] owns every node of the fleet in configuration
//! order. It starts them at boot and, for each [`VersionUpdate`] received
//! from the poller, restarts them one after the other on the new version:
//! stop, reassign, settle, start, then wait the stagger delay before the
//! next node. Nodes already running the new version are left alone, and a
//! node that fails to start is put back on its previous version. The new
//! version is persisted only once every node made it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::error::{ConfigError, NodeError};
use crate::policy::RolloutFailurePolicy;
use crate::state::{NodePhase, NodeStatus};
use crate::version::Version;

/// Pause between stopping a node and starting it again
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(1);

/// Lifecycle operations the coordinator needs from a supervised node
#[async_trait]
pub trait NodeControl: Send + Sync {
    fn name(&self) -> &str;
    async fn init(&self) -> Result<(), NodeError>;
    fn is_initialized(&self) -> bool;
    async fn start(&self) -> Result<(), NodeError>;
    async fn stop(&self);
    fn set_version(&self, version: Version);
    fn status(&self) -> NodeStatus;
}

/// Durable storage for the adopted version
#[async_trait]
pub trait VersionStore: Send + Sync {
    async fn persist_version(&self, version: &Version) -> Result<(), ConfigError>;
}

/// New-version event; the coordinator answers on `ack` when the rollout ends
#[derive(Debug)]
pub struct VersionUpdate {
    pub version: Version,
    pub ack: oneshot::Sender<RolloutOutcome>,
}

impl VersionUpdate {
    pub fn new(version: Version) -> (Self, oneshot::Receiver<RolloutOutcome>) {
        let (ack, outcome) = oneshot::channel();
        (Self { version, ack }, outcome)
    }
}

/// Result of one rollout
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RolloutOutcome {
    /// Every node restarted and the version was persisted
    Persisted {
        version: Version,
        restarted: Vec<String>,
    },
    /// The version was already adopted; no node was touched
    AlreadyAdopted(Version),
    /// A node failed and the sequence stopped there
    Aborted {
        version: Version,
        failed: String,
        restarted: Vec<String>,
        /// Failed nodes running their previous version again
        reverted: Vec<String>,
    },
    /// The sequence went on past failed nodes; nothing was persisted
    Incomplete {
        version: Version,
        failed: Vec<String>,
        restarted: Vec<String>,
        /// Failed nodes running their previous version again
        reverted: Vec<String>,
    },
    /// Every node restarted but the version could not be written
    PersistFailed { version: Version, reason: String },
}

impl RolloutOutcome {
    /// Whether the version is now the persisted one
    pub fn is_adopted(&self) -> bool {
        matches!(
            self,
            RolloutOutcome::Persisted { .. } | RolloutOutcome::AlreadyAdopted(_)
        )
    }
}

/// Pacing of fleet starts and rollouts
#[derive(Debug, Clone, Copy)]
pub struct RolloutSettings {
    /// Delay between two consecutive nodes; `None` means no delay
    pub stagger: Option<Duration>,
    pub settle: Duration,
    pub failure_policy: RolloutFailurePolicy,
}

impl Default for RolloutSettings {
    fn default() -> Self {
        Self {
            stagger: None,
            settle: DEFAULT_SETTLE_DELAY,
            failure_policy: RolloutFailurePolicy::default(),
        }
    }
}

impl RolloutSettings {
    fn stagger(&self) -> Option<Duration> {
        self.stagger.filter(|d| !d.is_zero())
    }
}

/// Owner of the fleet and of the adopted version
pub struct FleetCoordinator {
    nodes: Vec<Arc<dyn NodeControl>>,
    store: Arc<dyn VersionStore>,
    settings: RolloutSettings,
    adopted: Option<Version>,
}

impl FleetCoordinator {
    pub fn new(
        nodes: Vec<Arc<dyn NodeControl>>,
        store: Arc<dyn VersionStore>,
        adopted: Option<Version>,
        settings: RolloutSettings,
    ) -> Self {
        Self {
            nodes,
            store,
            settings,
            adopted,
        }
    }

    pub fn adopted(&self) -> Option<&Version> {
        self.adopted.as_ref()
    }

    pub fn snapshot(&self) -> Vec<NodeStatus> {
        self.nodes.iter().map(|n| n.status()).collect()
    }

    /// Initializes every node; failures exclude the node and are not retried.
    ///
    /// Returns the number of initialized nodes.
    pub async fn initialize(&self) -> usize {
        let mut ready = 0;
        for node in &self.nodes {
            match node.init().await {
                Ok(()) => ready += 1,
                Err(e) => error!("{} excluded from the fleet: {}", node.name(), e),
            }
        }
        ready
    }

    /// Starts every initialized node in order, staggered when configured
    pub async fn start_all(&self) {
        let ready = self.ready_nodes();
        let last = ready.len().saturating_sub(1);

        for (index, node) in ready.iter().enumerate() {
            if let Err(e) = node.start().await {
                error!("{} failed to start: {}", node.name(), e);
            }
            if index < last {
                if let Some(stagger) = self.settings.stagger() {
                    tokio::time::sleep(stagger).await;
                }
            }
        }

        info!("All nodes have been started");
        debug!("Fleet status: {:?}", self.snapshot());
    }

    /// Restarts the fleet on `version`, persisting it when every node made it
    pub async fn rollout(&mut self, version: Version) -> RolloutOutcome {
        if self.adopted.as_ref() == Some(&version) {
            debug!("Version {} already adopted, nothing to roll out", version);
            return RolloutOutcome::AlreadyAdopted(version);
        }

        let ready = self.ready_nodes();
        let last = ready.len().saturating_sub(1);
        let mut restarted = Vec::new();
        let mut failed = Vec::new();
        let mut reverted = Vec::new();

        for (index, node) in ready.iter().enumerate() {
            let status = node.status();
            if status.version == version && status.phase == NodePhase::Running {
                debug!("{} already runs {}", node.name(), version);
                restarted.push(node.name().to_string());
                continue;
            }

            info!("Restarting {} to update to {}", node.name(), version);
            node.stop().await;
            node.set_version(version.clone());
            tokio::time::sleep(self.settings.settle).await;

            match node.start().await {
                Ok(()) => restarted.push(node.name().to_string()),
                Err(e) => {
                    error!("{} failed to restart on {}: {}", node.name(), version, e);
                    if revert(node.as_ref(), &status.version, &version).await {
                        reverted.push(node.name().to_string());
                    }
                    match self.settings.failure_policy {
                        RolloutFailurePolicy::Abort => {
                            warn!("Rollout of {} aborted at {}", version, node.name());
                            return RolloutOutcome::Aborted {
                                version,
                                failed: node.name().to_string(),
                                restarted,
                                reverted,
                            };
                        }
                        RolloutFailurePolicy::Continue => failed.push(node.name().to_string()),
                    }
                }
            }

            if index < last {
                if let Some(stagger) = self.settings.stagger() {
                    tokio::time::sleep(stagger).await;
                }
            }
        }

        if !failed.is_empty() {
            warn!("Rollout of {} incomplete, failed nodes: {:?}", version, failed);
            return RolloutOutcome::Incomplete {
                version,
                failed,
                restarted,
                reverted,
            };
        }

        match self.store.persist_version(&version).await {
            Ok(()) => {
                info!("Fleet updated to {}", version);
                self.adopted = Some(version.clone());
                debug!("Fleet status: {:?}", self.snapshot());
                RolloutOutcome::Persisted { version, restarted }
            }
            Err(e) => {
                error!("Failed to persist version {}: {}", version, e);
                RolloutOutcome::PersistFailed {
                    version,
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Handles update events until the channel closes
    pub async fn run(&mut self, updates: &mut mpsc::Receiver<VersionUpdate>) {
        while let Some(update) = updates.recv().await {
            let outcome = self.rollout(update.version).await;
            if update.ack.send(outcome).is_err() {
                debug!("Rollout outcome dropped, poller gone");
            }
        }
    }

    /// Stops every node, initialized or not
    pub async fn shutdown(&self) {
        info!("Stopping all nodes ..");
        for node in &self.nodes {
            node.stop().await;
        }
    }

    fn ready_nodes(&self) -> Vec<Arc<dyn NodeControl>> {
        self.nodes
            .iter()
            .filter(|n| n.is_initialized())
            .cloned()
            .collect()
    }
}

/// Puts a node that failed on `target` back on `previous`
async fn revert(node: &dyn NodeControl, previous: &Version, target: &Version) -> bool {
    if previous == target {
        return false;
    }

    warn!("Reverting {} to {}", node.name(), previous);
    node.set_version(previous.clone());
    match node.start().await {
        Ok(()) => true,
        Err(e) => {
            error!("{} failed to come back on {}: {}", node.name(), previous, e);
            false
        }
    }
}
