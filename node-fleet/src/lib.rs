//! node-fleet - supervisor for a fleet of local storage node processes
//!
//! - Discovers the suggested node version from a remote authority
//! - Downloads and caches one binary per version
//! - Spawns, watches and restarts one process per configured node
//! - Rolls new versions out node by node, persisting them once complete

pub mod artifacts;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod logging;
pub mod output;
pub mod platform;
pub mod policy;
pub mod poller;
pub mod state;
pub mod supervisor;
pub mod version;

pub use artifacts::{ArtifactCache, ArtifactProvider, CacheSettings, Distribution, HttpDistribution, RetentionPolicy};
pub use config::{ConfigLoad, ConfigStore, FleetConfig};
pub use coordinator::{FleetCoordinator, NodeControl, RolloutOutcome, RolloutSettings, VersionStore, VersionUpdate};
pub use error::{ArtifactError, ConfigError, NodeError, VersionError};
pub use poller::{Poller, TickOutcome};
pub use state::{NodePhase, NodeSpec, NodeStatus};
pub use supervisor::NodeSupervisor;
pub use version::{HttpVersionSource, Version, VersionSource};
