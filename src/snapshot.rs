//! Live snapshot capture
//!
//! Composes an immutable [`DomSnapshot`] from an attached CDP session:
//! document structure via an outerHTML evaluation and the rendered
//! appearance via `Page.captureScreenshot`, issued back-to-back against the
//! same target. No caching; every call observes the page fresh.

use crate::cdp::CdpSession;
use crate::dom::DomSnapshot;
use crate::error::{Result, TransportError};
use base64::Engine;
use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, instrument};

/// Builds snapshots from a live session.
pub struct SnapshotProvider;

impl SnapshotProvider {
    /// Capture the attached page's structure and screenshot.
    ///
    /// Transport failures propagate unchanged; the caller decides capture
    /// frequency and retry policy.
    #[instrument(skip(session))]
    pub async fn capture(session: &CdpSession) -> Result<DomSnapshot> {
        let html = session
            .evaluate("document.documentElement.outerHTML")
            .await?
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| {
                TransportError::MalformedResponse("outerHTML did not evaluate to a string".into())
            })?;
        let url = session
            .evaluate("window.location.href")
            .await?
            .as_str()
            .unwrap_or("about:blank")
            .to_string();

        let shot = session
            .send_to_target("Page.captureScreenshot", json!({ "format": "png" }))
            .await?;
        let encoded = shot
            .get("data")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                TransportError::MalformedResponse("captureScreenshot without data".into())
            })?;
        let screenshot = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| {
                TransportError::MalformedResponse(format!("undecodable screenshot: {e}"))
            })?;

        debug!(
            "Captured snapshot of {} ({} html chars, {} screenshot bytes)",
            url,
            html.len(),
            screenshot.len()
        );
        Ok(DomSnapshot::from_parts(&html, &url, screenshot, Utc::now()))
    }
}
