//! Chunked upload flow over the HTTP surface: out-of-order parts, then
//! completion producing an artifact with the whole-payload checksum.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::*;
use depot::storage::sha256_hex;

async fn initiate(platform: &TestPlatform, total_size: u64, chunk_size: u64) -> serde_json::Value {
    let response = send(
        platform,
        Request::builder()
            .method("POST")
            .uri("/api/v1/artifacts/upload/initiate")
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::to_vec(&serde_json::json!({
                    "repo": "generic-local",
                    "name": "dataset",
                    "version": "2024.1",
                    "total_size": total_size,
                    "chunk_size": chunk_size,
                }))
                .unwrap(),
            ))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    body_json(response).await
}

#[tokio::test]
async fn out_of_order_chunked_upload_completes() {
    let platform = platform();

    // 100 KiB in 32 KiB chunks: four chunks, the last short.
    let total = 100 * 1024usize;
    let chunk = 32 * 1024usize;
    let payload = random_bytes(total, 77);

    let init = initiate(&platform, total as u64, chunk as u64).await;
    assert_eq!(init["total_chunks"], 4);
    let id = init["upload_id"].as_str().unwrap().to_string();

    for index in [0usize, 2, 3, 1] {
        let start = index * chunk;
        let end = (start + chunk).min(total);
        let response = send(
            &platform,
            Request::builder()
                .method("POST")
                .uri(format!("/api/v1/artifacts/upload/{id}/parts?chunk={index}"))
                .body(Body::from(payload[start..end].to_vec()))
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    // Progress reports completeness before the final call.
    let response = get(&platform, &format!("/api/v1/artifacts/upload/{id}/progress")).await;
    let progress = body_json(response).await;
    assert_eq!(progress["received_chunks"], 4);
    assert_eq!(progress["complete"], true);

    let response = send(
        &platform,
        Request::builder()
            .method("POST")
            .uri(format!("/api/v1/artifacts/upload/{id}/complete"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = body_json(response).await;
    assert_eq!(body["size"], total as u64);
    assert_eq!(body["checksum"], sha256_hex(&payload));

    // The session is gone once completed.
    let response = get(&platform, &format!("/api/v1/artifacts/upload/{id}/progress")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn wrong_sized_chunk_is_rejected() {
    let platform = platform();
    let init = initiate(&platform, 64 * 1024, 32 * 1024).await;
    let id = init["upload_id"].as_str().unwrap();

    let response = send(
        &platform,
        Request::builder()
            .method("POST")
            .uri(format!("/api/v1/artifacts/upload/{id}/parts?chunk=0"))
            .body(Body::from(vec![0u8; 1000]))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn chunk_index_out_of_range_is_rejected() {
    let platform = platform();
    let init = initiate(&platform, 64 * 1024, 32 * 1024).await;
    let id = init["upload_id"].as_str().unwrap();

    let response = send(
        &platform,
        Request::builder()
            .method("POST")
            .uri(format!("/api/v1/artifacts/upload/{id}/parts?chunk=2"))
            .body(Body::from(vec![0u8; 32 * 1024]))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn foreign_tenant_cannot_touch_session() {
    let platform = platform();
    let init = initiate(&platform, 32 * 1024, 32 * 1024).await;
    let id = init["upload_id"].as_str().unwrap();

    let response = send(
        &platform,
        Request::builder()
            .method("POST")
            .uri(format!("/api/v1/artifacts/upload/{id}/parts?chunk=0"))
            .header("X-Tenant-ID", "intruder")
            .body(Body::from(vec![0u8; 32 * 1024]))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}
