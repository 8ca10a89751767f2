//! Request middleware: tenant resolution, bearer authentication, policy
//! checks, and request ids.
//!
//! Tenant context comes from `X-Tenant-ID`, then `X-Tenant-Slug`, then the
//! first label of the Host header; the first recognized value wins and
//! `default` applies when none is present. When an auth secret is
//! configured every non-excluded request must carry a valid HS256 bearer
//! token. Mutating requests additionally pass through the external policy
//! service when it is enabled.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{header, HeaderValue, Method};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use uuid::Uuid;

use super::AppState;
use crate::error::DepotError;
use crate::policy::PolicyInput;
use crate::tenant::{TenantContext, TenantId};

pub const REQUEST_ID_HEADER: &str = "X-Request-ID";
const TENANT_ID_HEADER: &str = "X-Tenant-ID";
const TENANT_SLUG_HEADER: &str = "X-Tenant-Slug";

/// Paths reachable without a bearer token.
const AUTH_EXCLUDED: [&str; 2] = ["/api/v1/health", "/v2/"];

#[derive(Debug, Deserialize)]
struct TokenClaims {
    sub: String,
    #[serde(default)]
    tenant: Option<String>,
    #[allow(dead_code)]
    exp: u64,
}

fn header_str<'a>(request: &'a Request, name: &str) -> Option<&'a str> {
    request
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Tenant slug from the Host subdomain, e.g. `acme.depot.example` → `acme`.
fn subdomain_tenant(request: &Request) -> Option<String> {
    let host = header_str(request, header::HOST.as_str())?;
    let host = host.split(':').next()?;
    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() >= 3 {
        Some(labels[0].to_string())
    } else {
        None
    }
}

fn bearer_token(request: &Request) -> Option<&str> {
    header_str(request, header::AUTHORIZATION.as_str())?.strip_prefix("Bearer ")
}

/// Combined context middleware: request id, tenant, auth, policy.
pub async fn context_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Response {
    let request_id = header_str(&request, REQUEST_ID_HEADER)
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let path = request.uri().path().to_string();
    let mut subject = None;

    // Authentication.
    let mut token_tenant = None;
    if let Some(secret) = &state.config.auth_secret {
        let excluded = AUTH_EXCLUDED.iter().any(|p| path == *p);
        if !excluded {
            let Some(token) = bearer_token(&request) else {
                return DepotError::Forbidden("missing bearer token".into()).into_response();
            };
            let key = DecodingKey::from_secret(secret.as_bytes());
            match decode::<TokenClaims>(token, &key, &Validation::new(Algorithm::HS256)) {
                Ok(data) => {
                    subject = Some(data.claims.sub);
                    token_tenant = data.claims.tenant;
                }
                Err(err) => {
                    return DepotError::Forbidden(format!("invalid token: {err}"))
                        .into_response();
                }
            }
        }
    }

    // Tenant resolution; a token-scoped tenant overrides headers.
    let raw_tenant = token_tenant
        .or_else(|| header_str(&request, TENANT_ID_HEADER).map(|s| s.to_string()))
        .or_else(|| header_str(&request, TENANT_SLUG_HEADER).map(|s| s.to_string()))
        .or_else(|| subdomain_tenant(&request))
        .unwrap_or_else(|| "default".to_string());
    let tenant = match TenantId::new(raw_tenant) {
        Ok(tenant) => tenant,
        Err(err) => return err.into_response(),
    };

    // Policy decision for mutating requests.
    if state.policy.enabled()
        && matches!(
            *request.method(),
            Method::PUT | Method::POST | Method::DELETE | Method::PATCH
        )
    {
        let input = PolicyInput {
            tenant: tenant.to_string(),
            subject: subject.clone(),
            action: request.method().to_string(),
            path: path.clone(),
        };
        match state.policy.allow(&input).await {
            Ok(true) => {}
            Ok(false) => {
                return DepotError::Forbidden("denied by policy".into()).into_response()
            }
            Err(err) => return err.into_response(),
        }
    }

    request
        .extensions_mut()
        .insert(TenantContext { tenant, subject });

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn request_with_host(host: &str) -> Request {
        Request::builder()
            .uri("/maven2/a/b/1/b-1.jar")
            .header(header::HOST, host)
            .body(Body::empty())
            .unwrap()
    }

    #[test]
    fn subdomain_extraction_needs_three_labels() {
        assert_eq!(
            subdomain_tenant(&request_with_host("acme.depot.example")),
            Some("acme".to_string())
        );
        assert_eq!(
            subdomain_tenant(&request_with_host("acme.depot.example:8080")),
            Some("acme".to_string())
        );
        assert_eq!(subdomain_tenant(&request_with_host("localhost:8080")), None);
        assert_eq!(subdomain_tenant(&request_with_host("depot.example")), None);
    }

    #[test]
    fn bearer_extraction() {
        let request = Request::builder()
            .uri("/")
            .header(header::AUTHORIZATION, "Bearer abc.def.ghi")
            .body(Body::empty())
            .unwrap();
        assert_eq!(bearer_token(&request), Some("abc.def.ghi"));

        let request = Request::builder()
            .uri("/")
            .header(header::AUTHORIZATION, "Basic dXNlcjpwYXNz")
            .body(Body::empty())
            .unwrap();
        assert_eq!(bearer_token(&request), None);
    }
}
