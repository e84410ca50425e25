//! Binary artifact cache
//!
//! Guarantees that a runnable binary exists for a version at a deterministic
//! path inside the binary directory:
//! - Cache hit: existence check only
//! - Cache miss: download the release archive to a private temp file,
//!   extract the single executable entry next to its final path, rename it
//!   into place
//! - Concurrent acquisitions of one version share a single in-flight download
//!
//! Nothing here ever evicts a binary implicitly; see [`ArtifactCache::prune`].

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::ArtifactError;
use crate::platform::Platform;
use crate::version::Version;

type Flight = Shared<BoxFuture<'static, Result<PathBuf, ArtifactError>>>;

/// Anything able to hand out the binary path for a version
#[async_trait]
pub trait ArtifactProvider: Send + Sync {
    async fn ensure(&self, version: &Version) -> Result<PathBuf, ArtifactError>;
}

/// Transport to the binary distribution host
#[async_trait]
pub trait Distribution: Send + Sync {
    /// Writes the archive found at `url` into `dest`
    async fn download(&self, url: &str, version: &Version, dest: &Path)
        -> Result<(), ArtifactError>;
}

/// How many cached binaries survive a prune
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RetentionRepr", into = "RetentionRepr")]
pub enum RetentionPolicy {
    /// Never delete anything
    #[default]
    KeepAll,
    /// Keep the N most recently written binaries plus every binary in use
    KeepLatest(usize),
}

/// On-disk shape: `keepAll` or `{keepLatest: N}`, never a YAML tag
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RetentionRepr {
    Named(RetentionName),
    Latest {
        #[serde(rename = "keepLatest")]
        keep_latest: usize,
    },
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
enum RetentionName {
    KeepAll,
}

impl From<RetentionRepr> for RetentionPolicy {
    fn from(repr: RetentionRepr) -> Self {
        match repr {
            RetentionRepr::Named(RetentionName::KeepAll) => RetentionPolicy::KeepAll,
            RetentionRepr::Latest { keep_latest } => RetentionPolicy::KeepLatest(keep_latest),
        }
    }
}

impl From<RetentionPolicy> for RetentionRepr {
    fn from(policy: RetentionPolicy) -> Self {
        match policy {
            RetentionPolicy::KeepAll => RetentionRepr::Named(RetentionName::KeepAll),
            RetentionPolicy::KeepLatest(keep_latest) => RetentionRepr::Latest { keep_latest },
        }
    }
}

/// Longest wait for response headers or for the next body chunk
pub const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Downloads release archives over HTTPS
pub struct HttpDistribution {
    client: reqwest::Client,
    stall_timeout: Duration,
}

impl HttpDistribution {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .user_agent(concat!("node-fleet/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        Self {
            client,
            stall_timeout: DEFAULT_STALL_TIMEOUT,
        }
    }

    pub fn with_stall_timeout(mut self, stall_timeout: Duration) -> Self {
        self.stall_timeout = stall_timeout;
        self
    }
}

impl Default for HttpDistribution {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Distribution for HttpDistribution {
    async fn download(
        &self,
        url: &str,
        version: &Version,
        dest: &Path,
    ) -> Result<(), ArtifactError> {
        let failed = |reason: String| ArtifactError::Download {
            version: version.clone(),
            reason,
        };
        let stalled = |_: tokio::time::error::Elapsed| {
            failed(format!("no data received for {:?}", self.stall_timeout))
        };

        let mut response = tokio::time::timeout(self.stall_timeout, self.client.get(url).send())
            .await
            .map_err(stalled)?
            .map_err(|e| failed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(failed(format!("{url} answered {}", response.status())));
        }

        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| failed(format!("cannot create {}: {e}", dest.display())))?;

        while let Some(chunk) = tokio::time::timeout(self.stall_timeout, response.chunk())
            .await
            .map_err(stalled)?
            .map_err(|e| failed(e.to_string()))?
        {
            file.write_all(&chunk)
                .await
                .map_err(|e| failed(e.to_string()))?;
        }
        file.flush().await.map_err(|e| failed(e.to_string()))?;
        file.sync_all().await.map_err(|e| failed(e.to_string()))?;

        Ok(())
    }
}

/// Where and how binaries are cached
#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub binary_dir: PathBuf,
    pub family: String,
    pub url_template: String,
    /// Private scratch directory for archives in transit
    pub temp_dir: PathBuf,
}

struct CacheInner {
    settings: CacheSettings,
    platform: Result<Platform, ArtifactError>,
    distribution: Arc<dyn Distribution>,
    inflight: Mutex<HashMap<Version, Flight>>,
}

/// Version-keyed binary cache shared by every node
#[derive(Clone)]
pub struct ArtifactCache {
    inner: Arc<CacheInner>,
}

impl ArtifactCache {
    /// Cache for the running platform
    pub fn new(settings: CacheSettings, distribution: Arc<dyn Distribution>) -> Self {
        Self::with_platform(settings, Platform::current(), distribution)
    }

    /// Cache with an explicit platform mapping (an `Err` makes every miss fail)
    pub fn with_platform(
        settings: CacheSettings,
        platform: Result<Platform, ArtifactError>,
        distribution: Arc<dyn Distribution>,
    ) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                settings,
                platform,
                distribution,
                inflight: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn binary_dir(&self) -> &Path {
        &self.inner.settings.binary_dir
    }

    /// Deterministic location of the binary for `version`
    pub fn binary_path(&self, version: &Version) -> Result<PathBuf, ArtifactError> {
        self.inner.binary_path(version)
    }

    /// Returns the binary path for `version`, acquiring it first if needed
    pub async fn ensure(&self, version: &Version) -> Result<PathBuf, ArtifactError> {
        let path = self.binary_path(version)?;
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(path);
        }

        let flight = {
            let mut inflight = self.inner.inflight.lock();
            inflight
                .entry(version.clone())
                .or_insert_with(|| {
                    let inner = Arc::clone(&self.inner);
                    let version = version.clone();
                    async move { inner.acquire(version).await }.boxed().shared()
                })
                .clone()
        };

        flight.await
    }

    /// Deletes cached binaries of this family that `policy` does not retain.
    ///
    /// The `N` most recently modified binaries are kept, ranked over every
    /// binary of the family, and so is every binary for a version in
    /// `in_use`. Returns the removed paths.
    pub async fn prune(
        &self,
        policy: RetentionPolicy,
        in_use: &[Version],
    ) -> std::io::Result<Vec<PathBuf>> {
        let RetentionPolicy::KeepLatest(keep) = policy else {
            return Ok(Vec::new());
        };

        let protected: HashSet<String> = in_use
            .iter()
            .filter_map(|v| self.binary_path(v).ok())
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .collect();

        let prefix = format!("{}-", self.inner.settings.family);
        let mut candidates: Vec<(SystemTime, String, PathBuf)> = Vec::new();
        let mut entries = tokio::fs::read_dir(self.binary_dir()).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with(&prefix) {
                continue;
            }
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            candidates.push((modified, name, entry.path()));
        }

        candidates.sort_by(|a, b| b.0.cmp(&a.0));
        let expired = candidates
            .into_iter()
            .skip(keep)
            .filter(|(_, name, _)| !protected.contains(name));

        let mut removed = Vec::new();
        for (_, _, path) in expired {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    info!("Pruned cached binary {}", path.display());
                    removed.push(path);
                }
                Err(e) => warn!("Failed to prune {}: {}", path.display(), e),
            }
        }
        Ok(removed)
    }
}

#[async_trait]
impl ArtifactProvider for ArtifactCache {
    async fn ensure(&self, version: &Version) -> Result<PathBuf, ArtifactError> {
        ArtifactCache::ensure(self, version).await
    }
}

impl CacheInner {
    fn binary_path(&self, version: &Version) -> Result<PathBuf, ArtifactError> {
        let platform = self.platform.clone()?;
        Ok(self
            .settings
            .binary_dir
            .join(platform.binary_name(&self.settings.family, version)))
    }

    async fn acquire(self: Arc<Self>, version: Version) -> Result<PathBuf, ArtifactError> {
        let result = self.download_and_install(&version).await;
        self.inflight.lock().remove(&version);
        result
    }

    async fn download_and_install(&self, version: &Version) -> Result<PathBuf, ArtifactError> {
        let platform = self.platform.clone()?;
        let final_path = self.binary_path(version)?;
        if tokio::fs::try_exists(&final_path).await.unwrap_or(false) {
            return Ok(final_path);
        }

        info!("Downloading version {} ..", version);
        let io_failed = |reason: String| ArtifactError::Download {
            version: version.clone(),
            reason,
        };
        create_private_dir(&self.settings.temp_dir)
            .await
            .map_err(|e| io_failed(format!("temp dir: {e}")))?;
        create_private_dir(&self.settings.binary_dir)
            .await
            .map_err(|e| io_failed(format!("binary dir: {e}")))?;

        let family = &self.settings.family;
        let archive_path = self.settings.temp_dir.join(format!(
            "{family}-{version}-{}.zip",
            uuid::Uuid::new_v4()
        ));
        let url = platform.download_url(&self.settings.url_template, family, version);

        let result = match self.distribution.download(&url, version, &archive_path).await {
            Ok(()) => {
                install_entry(
                    &archive_path,
                    &platform.archive_entry_name(family),
                    &final_path,
                    version,
                )
                .await
            }
            Err(e) => {
                debug!("Failed downloading version {}", version);
                Err(e)
            }
        };

        if let Err(e) = tokio::fs::remove_file(&archive_path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove {}: {}", archive_path.display(), e);
            }
        }

        result.map(|()| {
            debug!("Finished downloading version {}", version);
            final_path
        })
    }
}

/// Extracts `entry` from the archive to a hidden sibling of `final_path`,
/// then renames it into place
async fn install_entry(
    archive: &Path,
    entry: &str,
    final_path: &Path,
    version: &Version,
) -> Result<(), ArtifactError> {
    let failed = |reason: String| ArtifactError::Extract {
        version: version.clone(),
        reason,
    };

    let dir = final_path
        .parent()
        .ok_or_else(|| failed("binary path has no parent".into()))?;
    let staging = dir.join(format!(".{}.partial", uuid::Uuid::new_v4()));

    let archive_owned = archive.to_path_buf();
    let entry_owned = entry.to_string();
    let staging_owned = staging.clone();
    let extracted = tokio::task::spawn_blocking(move || {
        extract_entry(&archive_owned, &entry_owned, &staging_owned)
    })
    .await
    .map_err(|e| failed(format!("extraction task: {e}")))
    .and_then(|r| r.map_err(failed));

    let installed = match extracted {
        Ok(()) => tokio::fs::rename(&staging, final_path)
            .await
            .map_err(|e| failed(format!("cannot move binary into place: {e}"))),
        Err(e) => {
            debug!("Failed to extract binary for version {}", version);
            Err(e)
        }
    };

    if installed.is_err() {
        let _ = tokio::fs::remove_file(&staging).await;
    }
    installed
}

fn extract_entry(archive: &Path, entry: &str, staging: &Path) -> Result<(), String> {
    let file = std::fs::File::open(archive).map_err(|e| format!("cannot open archive: {e}"))?;
    let mut zip = zip::ZipArchive::new(file).map_err(|e| format!("unreadable archive: {e}"))?;
    let mut source = zip
        .by_name(entry)
        .map_err(|_| format!("archive has no entry named {entry}"))?;

    let mut out =
        std::fs::File::create(staging).map_err(|e| format!("cannot create binary: {e}"))?;
    std::io::copy(&mut source, &mut out).map_err(|e| format!("cannot write binary: {e}"))?;
    out.sync_all().map_err(|e| format!("cannot sync binary: {e}"))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(staging, std::fs::Permissions::from_mode(0o755))
            .map_err(|e| format!("cannot mark binary executable: {e}"))?;
    }

    Ok(())
}

/// Creates a directory (and parents) readable by owner and group only
pub(crate) async fn create_private_dir(path: &Path) -> std::io::Result<()> {
    let mut builder = tokio::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    builder.mode(0o770);
    builder.create(path).await
}
