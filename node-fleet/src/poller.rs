//! Periodic suggested-version polling
//!
//! Every tick asks the [`VersionSource`] for the suggested version. A new
//! version is downloaded first; only when its binary is in the cache is a
//! single [`VersionUpdate`] sent to the coordinator. The poller then waits
//! for the rollout outcome, so two rollouts never overlap.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::artifacts::{ArtifactCache, RetentionPolicy};
use crate::coordinator::{RolloutOutcome, VersionUpdate};
use crate::version::{Version, VersionSource};

/// What one tick did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// The version authority could not be queried
    Unavailable,
    /// The suggested version is the one already known
    Unchanged,
    /// The new version's binary could not be acquired; no event was sent
    AcquisitionFailed(Version),
    /// The coordinator is gone
    Closed,
    /// An update was sent and the rollout finished
    RolledOut(RolloutOutcome),
}

pub struct Poller {
    source: Arc<dyn VersionSource>,
    cache: ArtifactCache,
    updates: mpsc::Sender<VersionUpdate>,
    interval: Duration,
    retention: RetentionPolicy,
    latest: Option<Version>,
}

impl Poller {
    /// `latest` is the version the fleet currently runs
    pub fn new(
        source: Arc<dyn VersionSource>,
        cache: ArtifactCache,
        updates: mpsc::Sender<VersionUpdate>,
        interval: Duration,
        latest: Option<Version>,
    ) -> Self {
        Self {
            source,
            cache,
            updates,
            interval,
            retention: RetentionPolicy::KeepAll,
            latest,
        }
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    pub fn latest(&self) -> Option<&Version> {
        self.latest.as_ref()
    }

    /// Ticks every interval, the first one an interval from now, until the
    /// coordinator goes away
    pub async fn run(mut self) {
        let start = tokio::time::Instant::now() + self.interval;
        let mut ticker = tokio::time::interval_at(start, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if self.tick().await == TickOutcome::Closed {
                debug!("Update channel closed, poller exiting");
                return;
            }
        }
    }

    /// One polling round
    pub async fn tick(&mut self) -> TickOutcome {
        let suggested = match self.source.suggested_version().await {
            Ok(version) => version,
            Err(e) => {
                warn!("Failed to retrieve suggested version: {}", e);
                return TickOutcome::Unavailable;
            }
        };

        if self.latest.as_ref() == Some(&suggested) {
            return TickOutcome::Unchanged;
        }
        info!("New version detected: {}", suggested);

        if let Err(e) = self.cache.ensure(&suggested).await {
            error!("Failed to update to {}: {}", suggested, e);
            return TickOutcome::AcquisitionFailed(suggested);
        }

        let (update, outcome) = VersionUpdate::new(suggested.clone());
        if self.updates.send(update).await.is_err() {
            return TickOutcome::Closed;
        }
        let previous = self.latest.replace(suggested.clone());

        let Ok(outcome) = outcome.await else {
            return TickOutcome::Closed;
        };

        if outcome.is_adopted() {
            self.prune(&suggested).await;
        } else {
            warn!("Version {} not adopted, retrying next tick", suggested);
            self.latest = previous;
        }
        TickOutcome::RolledOut(outcome)
    }

    async fn prune(&self, adopted: &Version) {
        match self
            .cache
            .prune(self.retention, std::slice::from_ref(adopted))
            .await
        {
            Ok(removed) if !removed.is_empty() => {
                info!("Pruned {} cached binaries", removed.len())
            }
            Ok(_) => {}
            Err(e) => warn!("Failed to prune cached binaries: {}", e),
        }
    }
}
