//! Chrome debug-port discovery
//!
//! Chrome exposes a small HTTP API next to the WebSocket endpoint. This
//! module fetches the browser-level debugger URL and the list of open page
//! tabs, filtering out DevTools and extension targets.

use crate::error::{Result, TransportError};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, instrument};

/// Default Chrome remote debugging port.
pub const DEFAULT_DEBUG_PORT: u16 = 9222;

const HTTP_TIMEOUT: Duration = Duration::from_secs(2);

/// One open browser tab as reported by `/json/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChromeTab {
    /// Target id
    pub id: String,
    /// Tab title
    #[serde(default)]
    pub title: String,
    /// Current URL
    #[serde(default)]
    pub url: String,
    /// Target type (`page`, `iframe`, ...)
    #[serde(default, rename = "type")]
    pub target_type: String,
    /// Per-tab WebSocket debugger URL, when available
    #[serde(default)]
    pub web_socket_debugger_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VersionInfo {
    web_socket_debugger_url: Option<String>,
}

/// Fetch the browser-level WebSocket debugger URL from `/json/version`.
#[instrument]
pub async fn debugger_ws_url(port: u16) -> Result<String> {
    let url = format!("http://localhost:{port}/json/version");
    let client = reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;
    let info: VersionInfo = client
        .get(&url)
        .send()
        .await
        .map_err(|e| TransportError::ConnectFailed(format!("{url}: {e}")))?
        .error_for_status()
        .map_err(|e| TransportError::ConnectFailed(e.to_string()))?
        .json()
        .await
        .map_err(|e| TransportError::ConnectFailed(format!("bad /json/version body: {e}")))?;

    let ws_url = info
        .web_socket_debugger_url
        .ok_or_else(|| TransportError::ConnectFailed("no webSocketDebuggerUrl in /json/version".into()))?;
    debug!("Debugger URL: {}", ws_url);
    Ok(ws_url)
}

/// List open page tabs via `/json/list`, excluding DevTools frontends.
#[instrument]
pub async fn list_tabs(port: u16) -> Result<Vec<ChromeTab>> {
    let url = format!("http://localhost:{port}/json/list");
    let client = reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;
    let tabs: Vec<ChromeTab> = client
        .get(&url)
        .send()
        .await
        .map_err(|e| TransportError::ConnectFailed(format!("{url}: {e}")))?
        .error_for_status()
        .map_err(|e| TransportError::ConnectFailed(e.to_string()))?
        .json()
        .await
        .map_err(|e| TransportError::ConnectFailed(format!("bad /json/list body: {e}")))?;

    let pages: Vec<ChromeTab> = tabs
        .into_iter()
        .filter(|t| t.target_type == "page" && !t.url.starts_with("devtools://"))
        .collect();
    debug!("Found {} page tabs", pages.len());
    Ok(pages)
}
