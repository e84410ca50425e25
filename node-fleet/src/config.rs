//! Fleet configuration file
//!
//! Handles:
//! - Loading `node-fleet.yaml` (path from `NODE_FLEET_CONFIG`)
//! - Writing a default file on first launch
//! - Persisting the adopted version atomically (temp file + rename)

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::artifacts::RetentionPolicy;
use crate::coordinator::{RolloutSettings, VersionStore, DEFAULT_SETTLE_DELAY};
use crate::error::ConfigError;
use crate::platform::DEFAULT_DOWNLOAD_URL_TEMPLATE;
use crate::policy::{RestartPolicyConfig, RolloutFailurePolicy};
use crate::state::NodeSpec;
use crate::version::Version;

pub const DEFAULT_CONFIG_FILE: &str = "node-fleet.yaml";
pub const DEFAULT_VERSION_URL: &str = "https://version.storj.io";
pub const DEFAULT_FAMILY: &str = "storagenode";
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5 * 60;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetConfig {
    pub binary_directory: PathBuf,
    #[serde(default)]
    pub version: Option<Version>,
    #[serde(default = "default_true")]
    pub automatic_updates: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stagger_delay_secs: Option<u64>,
    #[serde(default)]
    pub rollout_failure_policy: RolloutFailurePolicy,
    #[serde(default)]
    pub restart_policy: RestartPolicyConfig,
    #[serde(default)]
    pub retention: RetentionPolicy,
    #[serde(default)]
    pub updates: UpdateSourceConfig,
    pub nodes: Vec<NodeConfig>,
}

/// Where versions and binaries come from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpdateSourceConfig {
    pub family: String,
    pub version_url: String,
    pub download_url_template: String,
    pub poll_interval_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeConfig {
    pub name: String,
    pub config_dir: PathBuf,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_args: Vec<String>,
}

fn default_true() -> bool {
    true
}

impl Default for UpdateSourceConfig {
    fn default() -> Self {
        Self {
            family: DEFAULT_FAMILY.to_string(),
            version_url: DEFAULT_VERSION_URL.to_string(),
            download_url_template: DEFAULT_DOWNLOAD_URL_TEMPLATE.to_string(),
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
        }
    }
}

impl Default for FleetConfig {
    fn default() -> Self {
        let base = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        let node_dir = if cfg!(windows) {
            PathBuf::from(r"C:\Program Files\Storj\Storage Node")
        } else {
            base.join("storj").join("storagenode")
        };

        Self {
            binary_directory: base.join("node-fleet").join("binaries"),
            version: None,
            automatic_updates: true,
            stagger_delay_secs: None,
            rollout_failure_policy: RolloutFailurePolicy::default(),
            restart_policy: RestartPolicyConfig::default(),
            retention: RetentionPolicy::default(),
            updates: UpdateSourceConfig::default(),
            nodes: vec![NodeConfig {
                name: "Node 01".to_string(),
                config_dir: node_dir,
                disabled: false,
                extra_args: Vec::new(),
            }],
        }
    }
}

impl FleetConfig {
    /// Node identities in configuration order
    pub fn node_specs(&self) -> Vec<NodeSpec> {
        self.nodes
            .iter()
            .map(|node| NodeSpec {
                name: node.name.clone(),
                config_dir: node.config_dir.clone(),
                enabled: !node.disabled,
                extra_args: node.extra_args.clone(),
            })
            .collect()
    }

    pub fn rollout_settings(&self) -> RolloutSettings {
        RolloutSettings {
            stagger: self
                .stagger_delay_secs
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            settle: DEFAULT_SETTLE_DELAY,
            failure_policy: self.rollout_failure_policy,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.updates.poll_interval_secs.max(1))
    }
}

/// Config file location: `NODE_FLEET_CONFIG` or `node-fleet.yaml`
pub fn config_path() -> PathBuf {
    std::env::var_os("NODE_FLEET_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
}

/// Result of opening the configuration
pub enum ConfigLoad {
    Loaded(ConfigStore),
    /// No file existed; a default one was written there
    Created(PathBuf),
}

/// The loaded configuration and its backing file
#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
    config: Mutex<FleetConfig>,
}

impl ConfigStore {
    /// Reads the file, writing the default configuration if it is missing
    pub async fn load(path: impl AsRef<Path>) -> Result<ConfigLoad, ConfigError> {
        let path = path.as_ref().to_path_buf();

        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                write_yaml(&path, &FleetConfig::default()).await?;
                info!("Default config written to {}", path.display());
                return Ok(ConfigLoad::Created(path));
            }
            Err(source) => return Err(ConfigError::Read { path, source }),
        };

        let config: FleetConfig = serde_yaml::from_str(&content)
            .map_err(|source| ConfigError::Parse {
                path: path.clone(),
                source,
            })?;

        Ok(ConfigLoad::Loaded(Self::new(path, config)))
    }

    pub fn new(path: PathBuf, config: FleetConfig) -> Self {
        Self {
            path,
            config: Mutex::new(config),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> FleetConfig {
        self.config.lock().clone()
    }

    pub fn version(&self) -> Option<Version> {
        self.config.lock().version.clone()
    }

    /// Writes `version` into the file; no-op when it is already stored
    pub async fn update_version(&self, version: &Version) -> Result<(), ConfigError> {
        let mut updated = self.snapshot();
        if updated.version.as_ref() == Some(version) {
            return Ok(());
        }
        updated.version = Some(version.clone());

        write_yaml(&self.path, &updated).await?;
        *self.config.lock() = updated;
        info!("Updated version to {}", version);
        Ok(())
    }
}

#[async_trait]
impl VersionStore for ConfigStore {
    async fn persist_version(&self, version: &Version) -> Result<(), ConfigError> {
        self.update_version(version).await
    }
}

/// Serializes `config` next to `path`, then renames it over `path`
async fn write_yaml(path: &Path, config: &FleetConfig) -> Result<(), ConfigError> {
    let write_error = |reason: String| ConfigError::Write {
        path: path.to_path_buf(),
        reason,
    };

    let yaml = serde_yaml::to_string(config).map_err(|e| write_error(e.to_string()))?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| DEFAULT_CONFIG_FILE.to_string());
    let temp = path.with_file_name(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4()));

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| write_error(e.to_string()))?;
    }

    let written = async {
        tokio::fs::write(&temp, yaml).await?;
        tokio::fs::rename(&temp, path).await
    }
    .await;

    if let Err(e) = written {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(write_error(e.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
binaryDirectory: /var/lib/node-fleet/binaries
version: 1.76.2
automaticUpdates: true
staggerDelaySecs: 120
rolloutFailurePolicy: continue
nodes:
  - name: Node 01
    configDir: /srv/node01
  - name: Node 02
    configDir: /srv/node02
    disabled: true
    extraArgs: ["--log.level", "debug"]
"#;

    async fn store_with(content: &str) -> (tempfile::TempDir, ConfigStore) {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("node-fleet.yaml");
        tokio::fs::write(&path, content).await.unwrap();
        match ConfigStore::load(&path).await.unwrap() {
            ConfigLoad::Loaded(store) => (temp, store),
            ConfigLoad::Created(_) => panic!("config should have been loaded"),
        }
    }

    #[tokio::test]
    async fn test_load_sample() {
        let (_temp, store) = store_with(SAMPLE).await;
        let config = store.snapshot();

        assert_eq!(config.version, Some(Version::new("1.76.2").unwrap()));
        assert_eq!(config.rollout_failure_policy, RolloutFailurePolicy::Continue);
        assert_eq!(config.restart_policy, RestartPolicyConfig::default());
        assert_eq!(config.updates, UpdateSourceConfig::default());
        assert_eq!(config.rollout_settings().stagger, Some(Duration::from_secs(120)));
        assert_eq!(config.poll_interval(), Duration::from_secs(300));

        let specs = config.node_specs();
        assert_eq!(specs.len(), 2);
        assert!(specs[0].enabled);
        assert!(!specs[1].enabled);
        assert_eq!(specs[1].extra_args, vec!["--log.level", "debug"]);
    }

    #[tokio::test]
    async fn test_missing_file_writes_default() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("nested").join("node-fleet.yaml");

        let loaded = ConfigStore::load(&path).await.unwrap();
        assert!(matches!(loaded, ConfigLoad::Created(ref p) if p == &path));

        match ConfigStore::load(&path).await.unwrap() {
            ConfigLoad::Loaded(store) => {
                let config = store.snapshot();
                assert_eq!(config.version, None);
                assert!(config.automatic_updates);
                assert_eq!(config.nodes.len(), 1);
            }
            ConfigLoad::Created(_) => panic!("default config should be readable"),
        }
    }

    #[tokio::test]
    async fn test_malformed_file_is_parse_error() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("node-fleet.yaml");
        tokio::fs::write(&path, "nodes: [").await.unwrap();

        let err = ConfigStore::load(&path).await.err().unwrap();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[tokio::test]
    async fn test_persist_version_is_durable() {
        let (temp, store) = store_with(SAMPLE).await;
        let next = Version::new("1.77.0").unwrap();

        store.persist_version(&next).await.unwrap();

        assert_eq!(store.version(), Some(next.clone()));
        let reloaded = match ConfigStore::load(store.path()).await.unwrap() {
            ConfigLoad::Loaded(store) => store.snapshot(),
            ConfigLoad::Created(_) => panic!("config vanished"),
        };
        assert_eq!(reloaded.version, Some(next));
        assert_eq!(reloaded.nodes.len(), 2);
        assert_eq!(reloaded.stagger_delay_secs, Some(120));

        let leftovers: Vec<_> = std::fs::read_dir(temp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| n.ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_update_version_keeps_retention_readable() {
        let content = format!("{SAMPLE}retention:\n  keepLatest: 2\n");
        let (_temp, store) = store_with(&content).await;
        assert_eq!(store.snapshot().retention, RetentionPolicy::KeepLatest(2));

        store
            .update_version(&Version::new("1.77.0").unwrap())
            .await
            .unwrap();

        let written = std::fs::read_to_string(store.path()).unwrap();
        assert!(written.contains("keepLatest: 2"));
        assert!(!written.contains("!keepLatest"));
        let reloaded = match ConfigStore::load(store.path()).await.unwrap() {
            ConfigLoad::Loaded(store) => store.snapshot(),
            ConfigLoad::Created(_) => panic!("config vanished"),
        };
        assert_eq!(reloaded.retention, RetentionPolicy::KeepLatest(2));
    }

    #[tokio::test]
    async fn test_persist_failure_keeps_memory_state() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("missing-dir-is-a-file");
        std::fs::write(&path, b"").unwrap();
        let store = ConfigStore::new(path.join("node-fleet.yaml"), FleetConfig::default());

        let err = store
            .persist_version(&Version::new("1.0.0").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::Write { .. }));
        assert_eq!(store.version(), None);
    }
}
