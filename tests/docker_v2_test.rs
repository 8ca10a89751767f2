//! Docker Registry v2 flow: blob upload session, manifest put, digest
//! headers.

mod common;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use common::*;
use depot::storage::sha256_hex;
use depot::tenant::EcosystemType;

async fn push_blob(platform: &TestPlatform, image: &str, content: &[u8]) -> String {
    // Start an upload session.
    let response = send(
        platform,
        Request::builder()
            .method("POST")
            .uri(format!("/v2/{image}/blobs/uploads/"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let location = response
        .headers()
        .get(header::LOCATION)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(location.starts_with(&format!("/v2/{image}/blobs/uploads/")));

    // Upload the layer bytes, then finalize with the digest.
    let response = send(
        platform,
        Request::builder()
            .method("PATCH")
            .uri(location.clone())
            .body(Body::from(content.to_vec()))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(
        response
            .headers()
            .get(header::RANGE)
            .unwrap()
            .to_str()
            .unwrap(),
        format!("0-{}", content.len() - 1)
    );

    let digest = format!("sha256:{}", sha256_hex(content));
    let response = send(
        platform,
        Request::builder()
            .method("PUT")
            .uri(format!("{location}?digest={digest}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(
        response
            .headers()
            .get("Docker-Content-Digest")
            .unwrap()
            .to_str()
            .unwrap(),
        digest
    );
    digest
}

#[tokio::test]
async fn version_probe_advertises_registry_v2() {
    let platform = platform();
    hosted_repo(&platform, "docker-local", EcosystemType::Oci);

    let response = get(&platform, "/v2/").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("Docker-Distribution-API-Version")
            .unwrap()
            .to_str()
            .unwrap(),
        "registry/2.0"
    );
}

#[tokio::test]
async fn manifest_and_blob_round_trip() {
    let platform = platform();
    hosted_repo(&platform, "docker-local", EcosystemType::Oci);

    let layer = random_bytes(2048, 3);
    let config = br#"{"architecture":"amd64"}"#.to_vec();
    let layer_digest = push_blob(&platform, "repo1", &layer).await;
    let config_digest = push_blob(&platform, "repo1", &config).await;

    let manifest = serde_json::to_vec(&serde_json::json!({
        "schemaVersion": 2,
        "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
        "config": {
            "mediaType": "application/vnd.docker.container.image.v1+json",
            "digest": config_digest,
            "size": config.len(),
        },
        "layers": [{
            "mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip",
            "digest": layer_digest,
            "size": layer.len(),
        }],
    }))
    .unwrap();
    let manifest_digest = format!("sha256:{}", sha256_hex(&manifest));

    let response = send(
        &platform,
        Request::builder()
            .method("PUT")
            .uri("/v2/repo1/manifests/v1")
            .header(
                header::CONTENT_TYPE,
                "application/vnd.docker.distribution.manifest.v2+json",
            )
            .body(Body::from(manifest.clone()))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);

    // Manifest comes back byte-identical with its digest header.
    let response = get(&platform, "/v2/repo1/manifests/v1").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("Docker-Content-Digest")
            .unwrap()
            .to_str()
            .unwrap(),
        manifest_digest
    );
    assert_eq!(body_bytes(response).await, manifest);

    // Blob downloads verify content addressing.
    let response = get(&platform, &format!("/v2/repo1/blobs/{layer_digest}")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, layer);

    // Tag list reflects the pushed tag.
    let response = get(&platform, "/v2/repo1/tags/list").await;
    let body = body_json(response).await;
    assert_eq!(body["name"], "repo1");
    assert_eq!(body["tags"], serde_json::json!(["v1"]));
}

#[tokio::test]
async fn digest_mismatch_is_rejected() {
    let platform = platform();
    hosted_repo(&platform, "docker-local", EcosystemType::Oci);

    let response = send(
        &platform,
        Request::builder()
            .method("POST")
            .uri("/v2/repo1/blobs/uploads/")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    let location = response
        .headers()
        .get(header::LOCATION)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();

    let wrong_digest = format!("sha256:{}", sha256_hex(b"different bytes"));
    let response = send(
        &platform,
        Request::builder()
            .method("PUT")
            .uri(format!("{location}?digest={wrong_digest}"))
            .body(Body::from(&b"actual bytes"[..]))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert!(body["error"].as_str().unwrap().contains("digest"));
}

#[tokio::test]
async fn slashed_image_names_are_supported() {
    let platform = platform();
    hosted_repo(&platform, "docker-local", EcosystemType::Oci);

    let blob = b"layer for nested name".to_vec();
    let digest = push_blob(&platform, "library/nginx", &blob).await;

    let response = get(&platform, &format!("/v2/library/nginx/blobs/{digest}")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, blob);
}
