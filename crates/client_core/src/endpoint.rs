use std::{fmt, time::Duration};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Deserialize;
use url::Url;
use uuid::Uuid;

use crate::{config::ClientSettings, error::EndpointError};

const CLIENT_ID_SUFFIX_LEN: usize = 9;
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-session identifier: `<unix millis>_<random suffix>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientId(String);

impl ClientId {
    pub fn generate() -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!(
            "{}_{}",
            Utc::now().timestamp_millis(),
            &suffix[..CLIENT_ID_SUFFIX_LEN]
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Accepts bare hosts and `host:port`, including bracketed IPv6 literals.
pub fn is_loopback_host(host: &str) -> bool {
    let host = host.trim().to_ascii_lowercase();
    let hostname = if let Some(rest) = host.strip_prefix('[') {
        rest.split(']').next().unwrap_or_default()
    } else if host.matches(':').count() == 1 {
        host.split(':').next().unwrap_or_default()
    } else {
        host.as_str()
    };
    hostname.is_empty()
        || hostname == "localhost"
        || hostname == "::1"
        || hostname.starts_with("127.")
}

/// Loopback page hosts talk to the local development backend, everything else
/// to the production origin.
pub fn resolve_backend_origin(settings: &ClientSettings) -> &str {
    if is_loopback_host(&settings.page_host) {
        settings.local_origin.trim_end_matches('/')
    } else {
        settings.production_origin.trim_end_matches('/')
    }
}

pub fn websocket_url(origin: &str, client_id: &ClientId) -> Result<Url, EndpointError> {
    let origin = origin.trim().trim_end_matches('/');
    let ws_origin = if let Some(rest) = origin.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = origin.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        return Err(EndpointError::UnsupportedScheme(origin.to_string()));
    };

    let raw = format!("{ws_origin}/ws/{client_id}");
    Url::parse(&raw).map_err(|source| EndpointError::InvalidOrigin {
        origin: origin.to_string(),
        source,
    })
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct HealthStatus {
    pub status: String,
    #[serde(default)]
    pub timestamp: Option<String>,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        self.status.eq_ignore_ascii_case("healthy")
    }
}

pub async fn probe_health(origin: &str) -> Result<HealthStatus> {
    let url = format!("{}/api/health", origin.trim_end_matches('/'));
    let client = reqwest::Client::builder()
        .timeout(HEALTH_TIMEOUT)
        .build()
        .context("failed to build http client")?;
    let status = client
        .get(&url)
        .send()
        .await
        .with_context(|| format!("health check request failed: {url}"))?
        .error_for_status()?
        .json::<HealthStatus>()
        .await
        .context("malformed health check response")?;
    Ok(status)
}
