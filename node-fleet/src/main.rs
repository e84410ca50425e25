//! node-fleet binary - composition root
//!
//! Loads the configuration, adopts a version, starts every node, then
//! hands new versions from the poller to the coordinator until Ctrl-C or
//! SIGTERM, at which point every node is stopped.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::sync::mpsc;
use tracing::{error, info};

use node_fleet::config::{self, ConfigLoad, ConfigStore};
use node_fleet::logging;
use node_fleet::{
    ArtifactCache, CacheSettings, FleetCoordinator, HttpDistribution, HttpVersionSource,
    NodeControl, NodeSupervisor, Poller, VersionSource,
};

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    logging::init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    info!("node-fleet {} starting ..", env!("CARGO_PKG_VERSION"));

    let path = config::config_path();
    let store = match ConfigStore::load(&path)
        .await
        .with_context(|| format!("Failed to load {}", path.display()))?
    {
        ConfigLoad::Loaded(store) => Arc::new(store),
        ConfigLoad::Created(path) => {
            info!("Default config written to {}, edit it and start again", path.display());
            return Ok(());
        }
    };
    let config = store.snapshot();

    let cache = ArtifactCache::new(
        CacheSettings {
            binary_dir: config.binary_directory.clone(),
            family: config.updates.family.clone(),
            url_template: config.updates.download_url_template.clone(),
            temp_dir: std::env::temp_dir().join("node-fleet"),
        },
        Arc::new(HttpDistribution::new()),
    );
    let source: Arc<dyn VersionSource> = Arc::new(HttpVersionSource::new(
        config.updates.version_url.clone(),
        config.updates.family.clone(),
    ));

    if config.automatic_updates {
        adopt_suggested(source.as_ref(), &cache, &store).await?;
    }

    let Some(version) = store.version() else {
        bail!("No version adopted yet and none could be acquired, cannot start any node");
    };
    if let Err(e) = cache.ensure(&version).await {
        error!("Failed to acquire binary for version {}: {}", version, e);
    }

    let restart_policy = config.restart_policy.build();
    let nodes: Vec<Arc<dyn NodeControl>> = config
        .node_specs()
        .into_iter()
        .filter(|spec| spec.enabled)
        .map(|spec| {
            Arc::new(NodeSupervisor::new(
                spec,
                version.clone(),
                Arc::new(cache.clone()),
                restart_policy.clone(),
            )) as Arc<dyn NodeControl>
        })
        .collect();
    let total = nodes.len();

    let mut coordinator = FleetCoordinator::new(
        nodes,
        store.clone(),
        Some(version.clone()),
        config.rollout_settings(),
    );
    let ready = coordinator.initialize().await;
    info!("{}/{} nodes initialized", ready, total);
    coordinator.start_all().await;

    let (updates_tx, mut updates_rx) = mpsc::channel(1);
    if config.automatic_updates {
        let poller = Poller::new(
            source,
            cache.clone(),
            updates_tx.clone(),
            config.poll_interval(),
            Some(version),
        )
        .with_retention(config.retention);
        tokio::spawn(poller.run());
    } else {
        info!("Automatic updates disabled");
    }

    tokio::select! {
        _ = coordinator.run(&mut updates_rx) => {}
        _ = shutdown_signal() => info!("Shutdown requested"),
    }

    coordinator.shutdown().await;
    drop(updates_tx);
    info!("All nodes stopped, bye");
    Ok(())
}

/// Startup adoption of the suggested version. Only a failure to persist it
/// is fatal; the stored version stays in use otherwise.
async fn adopt_suggested(
    source: &dyn VersionSource,
    cache: &ArtifactCache,
    store: &ConfigStore,
) -> Result<()> {
    let suggested = match source.suggested_version().await {
        Ok(version) => version,
        Err(e) => {
            error!("Failed to retrieve suggested version: {}", e);
            return Ok(());
        }
    };

    if let Err(e) = cache.ensure(&suggested).await {
        error!("Failed to update to {}: {}", suggested, e);
        return Ok(());
    }

    store
        .update_version(&suggested)
        .await
        .with_context(|| format!("Failed to persist version {suggested}"))
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                error!("Cannot listen for SIGTERM: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
