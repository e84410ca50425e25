/*!
In-memory release distribution and version authority

`MockDistribution` serves a zip archive built in memory and records every
download it was asked for. `MockVersionSource` answers with whatever version
the test last set.
*/

use std::io::{Cursor, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;

use node_fleet::{ArtifactError, Distribution, Version, VersionError, VersionSource};

/// Builds a zip archive holding `entries` as (name, body) pairs
pub fn zip_archive(entries: &[(&str, &[u8])]) -> Result<Vec<u8>> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (name, body) in entries {
        writer.start_file(*name, zip::write::SimpleFileOptions::default())?;
        writer.write_all(body)?;
    }
    Ok(writer.finish()?.into_inner())
}

#[derive(Default)]
struct DistributionState {
    archive: Vec<u8>,
    failure: Option<String>,
    delay: Option<Duration>,
    downloads: Vec<(String, Version)>,
}

/// Distribution double serving one archive for every version
#[derive(Clone, Default)]
pub struct MockDistribution {
    state: Arc<Mutex<DistributionState>>,
}

impl MockDistribution {
    pub fn new(archive: Vec<u8>) -> Self {
        let distribution = Self::default();
        distribution.state.lock().archive = archive;
        distribution
    }

    /// Archive containing a single `storagenode` entry with `body`
    pub fn storagenode(body: &[u8]) -> Result<Self> {
        Ok(Self::new(zip_archive(&[("storagenode", body)])?))
    }

    /// Every following download fails with `reason`
    pub fn fail_with(&self, reason: impl Into<String>) {
        self.state.lock().failure = Some(reason.into());
    }

    pub fn recover(&self) {
        self.state.lock().failure = None;
    }

    /// Every following download takes `delay` before writing the archive
    pub fn set_delay(&self, delay: Duration) {
        self.state.lock().delay = Some(delay);
    }

    pub fn download_count(&self) -> usize {
        self.state.lock().downloads.len()
    }

    /// (url, version) of every download so far
    pub fn downloads(&self) -> Vec<(String, Version)> {
        self.state.lock().downloads.clone()
    }
}

#[async_trait]
impl Distribution for MockDistribution {
    async fn download(&self, url: &str, version: &Version, dest: &Path) -> Result<(), ArtifactError> {
        let (delay, failure, archive) = {
            let mut state = self.state.lock();
            state.downloads.push((url.to_string(), version.clone()));
            (state.delay, state.failure.clone(), state.archive.clone())
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(reason) = failure {
            return Err(ArtifactError::Download {
                version: version.clone(),
                reason,
            });
        }

        tokio::fs::write(dest, archive)
            .await
            .map_err(|e| ArtifactError::Download {
                version: version.clone(),
                reason: e.to_string(),
            })
    }
}

/// Version authority double
#[derive(Clone, Default)]
pub struct MockVersionSource {
    suggested: Arc<Mutex<Option<Version>>>,
    queries: Arc<Mutex<usize>>,
}

impl MockVersionSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn suggesting(version: &str) -> Result<Self> {
        let source = Self::new();
        source.suggest(version)?;
        Ok(source)
    }

    pub fn suggest(&self, version: &str) -> Result<()> {
        *self.suggested.lock() = Some(Version::new(version)?);
        Ok(())
    }

    /// Makes the authority unreachable
    pub fn go_offline(&self) {
        *self.suggested.lock() = None;
    }

    pub fn query_count(&self) -> usize {
        *self.queries.lock()
    }
}

#[async_trait]
impl VersionSource for MockVersionSource {
    async fn suggested_version(&self) -> Result<Version, VersionError> {
        *self.queries.lock() += 1;
        self.suggested
            .lock()
            .clone()
            .ok_or_else(|| VersionError::Unavailable("version authority offline".into()))
    }
}
