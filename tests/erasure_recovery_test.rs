//! Shard-loss recovery through the full stack: artifacts uploaded over
//! HTTP keep downloading after up to m shard files disappear from disk.

mod common;

use axum::http::StatusCode;
use common::*;
use std::path::PathBuf;

/// Directory of the single artifact stored under `{tenant}/{repo}`.
fn sole_artifact_dir(platform: &TestPlatform, repo: &str) -> PathBuf {
    let base = platform
        .state
        .config
        .storage
        .base_path
        .join(tenant().as_str())
        .join(repo);
    let mut dirs: Vec<PathBuf> = std::fs::read_dir(&base)
        .unwrap()
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    assert_eq!(dirs.len(), 1, "expected exactly one artifact in {base:?}");
    dirs.remove(0)
}

#[tokio::test]
async fn download_survives_loss_of_m_shards() {
    let platform = platform();
    hosted_repo(&platform, "maven-releases", depot::tenant::EcosystemType::Maven);

    let payload = random_bytes(10_000, 42);
    let response = put(
        &platform,
        "/maven2/org/acme/app/2.0/app-2.0.jar",
        payload.clone(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);

    // Default coding is (k=4, m=2): six shard files plus the metadata.
    let dir = sole_artifact_dir(&platform, "maven-releases");
    assert!(dir.join("metadata.json").is_file());
    for i in 0..6 {
        assert!(dir.join(format!("shard-{i}.bin")).is_file());
    }

    std::fs::remove_file(dir.join("shard-0.bin")).unwrap();
    std::fs::remove_file(dir.join("shard-3.bin")).unwrap();

    let response = get(&platform, "/maven2/org/acme/app/2.0/app-2.0.jar").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, payload);
}

#[tokio::test]
async fn download_fails_past_parity_budget() {
    let platform = platform();
    hosted_repo(&platform, "maven-releases", depot::tenant::EcosystemType::Maven);

    let response = put(
        &platform,
        "/maven2/org/acme/app/3.0/app-3.0.jar",
        random_bytes(5_000, 9),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let dir = sole_artifact_dir(&platform, "maven-releases");
    for i in [0usize, 3, 5] {
        std::fs::remove_file(dir.join(format!("shard-{i}.bin"))).unwrap();
    }

    let response = get(&platform, "/maven2/org/acme/app/3.0/app-3.0.jar").await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = body_json(response).await;
    assert!(body["error"]
        .as_str()
        .unwrap()
        .contains("insufficient shards"));
}

#[tokio::test]
async fn tampered_shard_is_detected() {
    let platform = platform();
    hosted_repo(&platform, "maven-releases", depot::tenant::EcosystemType::Maven);

    put(
        &platform,
        "/maven2/org/acme/app/4.0/app-4.0.jar",
        random_bytes(5_000, 11),
    )
    .await;

    let dir = sole_artifact_dir(&platform, "maven-releases");
    std::fs::write(dir.join("shard-1.bin"), b"tampered shard contents").unwrap();

    let response = get(&platform, "/maven2/org/acme/app/4.0/app-4.0.jar").await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = body_json(response).await;
    assert!(body["error"].as_str().unwrap().contains("shard 1"));
}
