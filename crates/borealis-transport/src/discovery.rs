//! Hub discovery over HTTP

use serde::{Deserialize, Serialize};
use tracing::debug;

use borealis_core::{EntityId, SyncError, SyncResult};

/// A hub advertised by the discovery endpoint
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub id: EntityId,
    pub readable_name: String,
}

/// Client for the discovery endpoint
#[derive(Clone, Debug)]
pub struct DiscoveryClient {
    endpoint: String,
    http: reqwest::Client,
}

impl DiscoveryClient {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self::with_client(endpoint, reqwest::Client::new())
    }

    pub fn with_client(endpoint: impl Into<String>, http: reqwest::Client) -> Self {
        DiscoveryClient {
            endpoint: endpoint.into().trim_end_matches('/').to_owned(),
            http,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.endpoint, path)
    }

    /// `GET /servers`
    pub async fn list_servers(&self) -> SyncResult<Vec<ServerInfo>> {
        let url = self.url("servers");
        debug!(%url, "listing servers");

        let servers = self
            .http
            .get(&url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| SyncError::Transport(format!("GET {url} failed: {e}")))?
            .json::<Vec<ServerInfo>>()
            .await
            .map_err(|e| SyncError::Protocol(format!("bad server list: {e}")))?;

        Ok(servers)
    }
}
