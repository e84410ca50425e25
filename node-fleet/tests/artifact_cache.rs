//! Artifact cache behaviour seen from the outside: idempotence, single
//! flight under concurrency, shared failures and pruning.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use fleet_devkit::{fleet_cache, init_test_logging, MockDistribution};
use futures::future::join_all;
use node_fleet::{ArtifactError, RetentionPolicy, Version};

fn v(raw: &str) -> Version {
    Version::new(raw).unwrap()
}

#[tokio::test]
async fn test_ensure_is_idempotent() {
    init_test_logging();
    let temp = tempfile::tempdir().unwrap();
    let distribution = MockDistribution::storagenode(b"#!/bin/sh\n").unwrap();
    let cache = fleet_cache(temp.path(), Arc::new(distribution.clone()));

    let first = cache.ensure(&v("1.2.3")).await.unwrap();
    let second = cache.ensure(&v("1.2.3")).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(distribution.download_count(), 1);
    assert_eq!(
        distribution.downloads()[0].0,
        "https://github.com/storj/storj/releases/download/v1.2.3/storagenode_linux_amd64.zip"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_ensure_downloads_once() {
    init_test_logging();
    let temp = tempfile::tempdir().unwrap();
    let distribution = MockDistribution::storagenode(b"#!/bin/sh\n").unwrap();
    distribution.set_delay(Duration::from_millis(200));
    let cache = fleet_cache(temp.path(), Arc::new(distribution.clone()));

    let waiters = (0..8).map(|_| {
        let cache = cache.clone();
        tokio::spawn(async move { cache.ensure(&v("2.0.0")).await })
    });
    let paths: Vec<_> = join_all(waiters)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    assert_eq!(distribution.download_count(), 1);
    assert!(paths.iter().all(|p| p == &paths[0]));
    assert_eq!(std::fs::read(&paths[0]).unwrap(), b"#!/bin/sh\n");
}

#[tokio::test]
async fn test_concurrent_waiters_share_a_failure_and_the_next_call_retries() {
    let temp = tempfile::tempdir().unwrap();
    let distribution = MockDistribution::storagenode(b"bin").unwrap();
    distribution.set_delay(Duration::from_millis(100));
    distribution.fail_with("connection reset");
    let cache = fleet_cache(temp.path(), Arc::new(distribution.clone()));

    let version = v("3.0.0");
    let results = join_all((0..4).map(|_| cache.ensure(&version))).await;

    assert_eq!(distribution.download_count(), 1);
    for result in &results {
        assert_eq!(
            result,
            &Err(ArtifactError::Download {
                version: version.clone(),
                reason: "connection reset".into(),
            })
        );
    }
    assert!(!cache.binary_path(&version).unwrap().exists());

    distribution.recover();
    cache.ensure(&version).await.unwrap();
    assert_eq!(distribution.download_count(), 2);
}

#[tokio::test]
async fn test_prune_keeps_the_newest_and_the_version_in_use() {
    let temp = tempfile::tempdir().unwrap();
    let distribution = MockDistribution::storagenode(b"bin").unwrap();
    let cache = fleet_cache(temp.path(), Arc::new(distribution));

    for (raw, age) in [("1.0.0", 300), ("1.1.0", 200), ("1.2.0", 100)] {
        let path = cache.ensure(&v(raw)).await.unwrap();
        std::fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(SystemTime::now() - Duration::from_secs(age))
            .unwrap();
    }
    std::fs::write(cache.binary_dir().join("unrelated.txt"), b"keep me").unwrap();

    let removed = cache
        .prune(RetentionPolicy::KeepLatest(1), &[v("1.0.0")])
        .await
        .unwrap();

    assert_eq!(removed, vec![cache.binary_path(&v("1.1.0")).unwrap()]);
    assert!(cache.binary_path(&v("1.0.0")).unwrap().exists());
    assert!(cache.binary_path(&v("1.2.0")).unwrap().exists());
    assert!(cache.binary_dir().join("unrelated.txt").exists());
}
