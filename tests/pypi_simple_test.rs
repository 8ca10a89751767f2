//! PEP 503 behavior over the HTTP surface: normalized names share one
//! index page and file links carry stored checksums.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::*;
use depot::storage::sha256_hex;
use depot::tenant::EcosystemType;

fn multipart_upload(
    boundary: &str,
    name: &str,
    filename: &str,
    content: &[u8],
) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(
        format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"name\"\r\n\r\n{name}\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(
        format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"content\"; filename=\"{filename}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(content);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    body
}

async fn upload(platform: &TestPlatform, name: &str, filename: &str, content: &[u8]) {
    let boundary = "depot-test-boundary";
    let response = send(
        platform,
        Request::builder()
            .method("POST")
            .uri("/pypi/")
            .header(
                "content-type",
                format!("multipart/form-data; boundary={boundary}"),
            )
            .body(Body::from(multipart_upload(boundary, name, filename, content)))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
}

#[tokio::test]
async fn normalized_names_share_one_simple_page() {
    let platform = platform();
    hosted_repo(&platform, "pypi-local", EcosystemType::Pypi);

    let wheel = random_bytes(2000, 1);
    let sdist = random_bytes(3000, 2);
    upload(&platform, "My_Pkg", "My_Pkg-1.0-py3-none-any.whl", &wheel).await;
    upload(&platform, "my-pkg", "my-pkg-1.1.tar.gz", &sdist).await;

    // Root index lists a single normalized entry.
    let response = get(&platform, "/simple/").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("text/html"));
    let root = String::from_utf8(body_bytes(response).await).unwrap();
    assert_eq!(root.matches("<a href=").count(), 1);
    assert!(root.contains("/simple/my-pkg/"));

    // Any spelling of the name resolves to the same page with both files.
    for spelling in ["my-pkg", "My_Pkg", "MY.PKG"] {
        let response = get(&platform, &format!("/simple/{spelling}/")).await;
        assert_eq!(response.status(), StatusCode::OK, "spelling {spelling}");
        let page = String::from_utf8(body_bytes(response).await).unwrap();
        assert!(page.contains("pypi:repository-version"));
        assert!(page.contains("My_Pkg-1.0-py3-none-any.whl"));
        assert!(page.contains("my-pkg-1.1.tar.gz"));
        assert!(page.contains(&format!("#sha256={}", sha256_hex(&wheel))));
        assert!(page.contains(&format!("#sha256={}", sha256_hex(&sdist))));
    }
}

#[tokio::test]
async fn linked_files_download_with_stored_bytes() {
    let platform = platform();
    hosted_repo(&platform, "pypi-local", EcosystemType::Pypi);

    let sdist = random_bytes(1500, 8);
    upload(&platform, "sample", "sample-0.3.tar.gz", &sdist).await;

    let response = get(&platform, "/pypi/packages/sample/sample-0.3.tar.gz").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, sdist);
}

#[tokio::test]
async fn unknown_project_page_is_404() {
    let platform = platform();
    hosted_repo(&platform, "pypi-local", EcosystemType::Pypi);

    let response = get(&platform, "/simple/no-such-project/").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
