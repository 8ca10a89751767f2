//! Policy decisions via an external OPA service.
//!
//! The platform never evaluates policy itself: when enabled, mutating
//! requests are described to OPA's data API and the boolean `result` is
//! honored. When disabled every decision allows. An unreachable OPA is
//! logged and treated as allow so a policy-service outage does not take
//! artifact serving down with it.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::PolicySettings;
use crate::error::Result;

/// Input document sent to OPA.
#[derive(Debug, Clone, Serialize)]
pub struct PolicyInput {
    pub tenant: String,
    pub subject: Option<String>,
    /// HTTP method of the request being decided.
    pub action: String,
    pub path: String,
}

#[derive(Debug, Serialize)]
struct OpaRequest<'a> {
    input: &'a PolicyInput,
}

#[derive(Debug, Deserialize)]
struct OpaResponse {
    #[serde(default)]
    result: bool,
}

pub struct PolicyClient {
    enabled: bool,
    url: Option<String>,
    client: reqwest::Client,
}

impl PolicyClient {
    pub fn new(settings: &PolicySettings) -> Self {
        Self {
            enabled: settings.enabled && settings.url.is_some(),
            url: settings.url.clone(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .unwrap_or_default(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// `Ok(true)` when the request may proceed.
    pub async fn allow(&self, input: &PolicyInput) -> Result<bool> {
        if !self.enabled {
            return Ok(true);
        }
        let url = self.url.as_deref().expect("enabled implies url");

        match self
            .client
            .post(url)
            .json(&OpaRequest { input })
            .send()
            .await
        {
            Ok(response) => match response.json::<OpaResponse>().await {
                Ok(decision) => Ok(decision.result),
                Err(err) => {
                    tracing::warn!(error = %err, "unparseable OPA response, allowing");
                    Ok(true)
                }
            },
            Err(err) => {
                tracing::warn!(error = %err, "OPA unreachable, allowing");
                Ok(true)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_policy_allows_everything() {
        let client = PolicyClient::new(&PolicySettings {
            enabled: false,
            url: None,
        });
        let allowed = client
            .allow(&PolicyInput {
                tenant: "acme".into(),
                subject: None,
                action: "PUT".into(),
                path: "/maven2/a/b".into(),
            })
            .await
            .unwrap();
        assert!(allowed);
    }

    #[tokio::test]
    async fn enabled_without_url_stays_disabled() {
        let client = PolicyClient::new(&PolicySettings {
            enabled: true,
            url: None,
        });
        assert!(!client.enabled());
    }
}
