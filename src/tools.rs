//! Tool surface exposed to the reasoning agent
//!
//! The finite set of capabilities the selection loop can execute: query a
//! selector, describe a node, look at the screenshot, finalize, abandon.
//! Every non-terminal result is size-bounded before it is returned so loop
//! history grows sub-linearly in document size.

use crate::dom::{truncate_chars, DomSnapshot};
use crate::error::SelectionError;
use crate::selection::{CandidateState, SelectorCandidate};
use base64::Engine;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Maximum matched-node samples returned per query.
pub const MAX_SAMPLES: usize = 5;
/// Maximum characters of text per sample.
pub const MAX_SAMPLE_TEXT: usize = 150;

/// A bounded view of one matched node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchSample {
    /// Tag name of the matched element
    pub tag: String,
    /// Truncated text content
    pub text: String,
    /// Structural locator usable with `describe_node`
    pub locator: String,
}

/// Result of testing a selector against the snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    /// The selector that was tested
    pub selector: String,
    /// Total number of matched nodes
    pub count: usize,
    /// Bounded sample of matches (≤ [`MAX_SAMPLES`])
    pub samples: Vec<MatchSample>,
}

impl QueryResult {
    /// One-line summary for loop history.
    pub fn summary(&self) -> String {
        let preview = self
            .samples
            .iter()
            .map(|s| format!("<{}> {}", s.tag, truncate_chars(&s.text, 40)))
            .collect::<Vec<_>>()
            .join(" | ");
        format!("{} matches for '{}': {}", self.count, self.selector, preview)
    }
}

/// Bounded summary of a single node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSummary {
    /// Tag name
    pub tag: String,
    /// Attribute name → value
    pub attributes: std::collections::BTreeMap<String, String>,
    /// Truncated own text
    pub text: String,
    /// Tags of direct children, in order
    pub child_tags: Vec<String>,
    /// The locator that was described
    pub locator: String,
}

impl NodeSummary {
    /// One-line summary for loop history.
    pub fn summary(&self) -> String {
        format!(
            "<{}> children=[{}] text='{}'",
            self.tag,
            self.child_tags.join(","),
            truncate_chars(&self.text, 60)
        )
    }
}

/// Reference to the captured screenshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageRef {
    /// Image format (always `png`)
    pub format: String,
    /// Raw byte length
    pub byte_len: usize,
    /// Base64-encoded image data
    pub data: String,
}

/// The tool surface over one immutable snapshot.
///
/// Pure with respect to the snapshot: the same call always returns the same
/// bounded result, which keeps loop runs replayable.
pub struct ToolSurface<'a> {
    snapshot: &'a DomSnapshot,
}

impl<'a> ToolSurface<'a> {
    /// Create a tool surface over a snapshot.
    pub fn new(snapshot: &'a DomSnapshot) -> Self {
        Self { snapshot }
    }

    /// The snapshot these tools observe.
    pub fn snapshot(&self) -> &DomSnapshot {
        self.snapshot
    }

    /// Test a selector: match count plus a bounded sample of matches.
    pub fn query_selector(&self, selector: &str) -> Result<QueryResult, SelectionError> {
        let parsed = Selector::parse(selector)
            .map_err(|_| SelectionError::InvalidSelector(selector.to_string()))?;
        let document = Html::parse_document(&self.snapshot.html);

        let mut count = 0usize;
        let mut samples = Vec::new();
        for element in document.select(&parsed) {
            count += 1;
            if samples.len() < MAX_SAMPLES {
                samples.push(MatchSample {
                    tag: element.value().name().to_lowercase(),
                    text: truncate_chars(&element_text(element), MAX_SAMPLE_TEXT),
                    locator: locator_for(element),
                });
            }
        }

        debug!("query_selector('{}') -> {} matches", selector, count);
        Ok(QueryResult {
            selector: selector.to_string(),
            count,
            samples,
        })
    }

    /// Describe one node by its structural locator.
    pub fn describe_node(&self, locator: &str) -> Result<NodeSummary, SelectionError> {
        let node = self
            .snapshot
            .find_by_locator(locator)
            .ok_or_else(|| SelectionError::UnknownLocator(locator.to_string()))?;
        Ok(NodeSummary {
            tag: node.tag.clone(),
            attributes: node.attributes.clone(),
            text: truncate_chars(&node.text, MAX_SAMPLE_TEXT),
            child_tags: node.children.iter().map(|c| c.tag.clone()).collect(),
            locator: locator.to_string(),
        })
    }

    /// Return the snapshot's screenshot as a base64 image reference.
    pub fn capture_screenshot(&self) -> ImageRef {
        let data = base64::engine::general_purpose::STANDARD.encode(&self.snapshot.screenshot);
        ImageRef {
            format: "png".to_string(),
            byte_len: self.snapshot.screenshot.len(),
            data,
        }
    }

    /// Commit to a selector. Rejects selectors matching zero nodes; the
    /// caller's session state is untouched on rejection.
    pub fn finalize(&self, selector: &str) -> Result<SelectorCandidate, SelectionError> {
        let result = self.query_selector(selector)?;
        if result.count == 0 {
            return Err(SelectionError::ZeroMatch(selector.to_string()));
        }
        Ok(SelectorCandidate {
            selector: selector.to_string(),
            match_count: result.count,
            samples: result
                .samples
                .iter()
                .map(|s| s.text.clone())
                .collect(),
            state: CandidateState::Accepted,
        })
    }

    /// Outer HTML of up to `limit` nodes matched by `selector`.
    ///
    /// Feeds the codegen loop's self-test; not exposed as an agent action.
    pub fn matched_html(&self, selector: &str, limit: usize) -> Result<Vec<String>, SelectionError> {
        let parsed = Selector::parse(selector)
            .map_err(|_| SelectionError::InvalidSelector(selector.to_string()))?;
        let document = Html::parse_document(&self.snapshot.html);
        Ok(document
            .select(&parsed)
            .take(limit)
            .map(|el| el.html())
            .collect())
    }
}

fn element_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Compute the structural locator of a live element by walking its
/// ancestors, mirroring the paths produced in `dom::build_tree`.
fn locator_for(element: ElementRef<'_>) -> String {
    let mut segments = Vec::new();
    let mut current = Some(element);
    while let Some(el) = current {
        let tag = el.value().name().to_lowercase();
        let parent = el
            .parent()
            .and_then(ElementRef::wrap);
        match parent {
            Some(parent_el) => {
                let position = parent_el
                    .child_elements()
                    .take_while(|sibling| sibling.id() != el.id())
                    .filter(|sibling| sibling.value().name().eq_ignore_ascii_case(&tag))
                    .count()
                    + 1;
                segments.push(format!("{tag}:nth-of-type({position})"));
                current = Some(parent_el);
            }
            None => {
                segments.push(tag);
                current = None;
            }
        }
    }
    segments.reverse();
    segments.join(" > ")
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"
        <html><body>
            <article class="post"><h2>First post</h2><span class="by">ann</span></article>
            <article class="post"><h2>Second post</h2><span class="by">bob</span></article>
            <article class="post"><h2>Third post</h2><span class="by">cyn</span></article>
            <footer>fin</footer>
        </body></html>
    "#;

    fn snapshot() -> DomSnapshot {
        DomSnapshot::from_html(PAGE, "https://example.com/feed")
    }

    #[test]
    fn test_query_counts_and_bounds_samples() {
        let snap = snapshot();
        let tools = ToolSurface::new(&snap);
        let result = tools.query_selector("article.post").unwrap();
        assert_eq!(result.count, 3);
        assert_eq!(result.samples.len(), 3);
        assert!(result.samples[0].text.starts_with("First post"));

        let spans = tools.query_selector("span").unwrap();
        assert!(spans.samples.len() <= MAX_SAMPLES);
    }

    #[test]
    fn test_query_invalid_selector() {
        let snap = snapshot();
        let tools = ToolSurface::new(&snap);
        assert!(matches!(
            tools.query_selector("[["),
            Err(SelectionError::InvalidSelector(_))
        ));
    }

    #[test]
    fn test_sample_locators_resolve_via_describe() {
        let snap = snapshot();
        let tools = ToolSurface::new(&snap);
        let result = tools.query_selector("article.post").unwrap();
        let locator = &result.samples[1].locator;
        let summary = tools.describe_node(locator).unwrap();
        assert_eq!(summary.tag, "article");
        assert_eq!(summary.child_tags, vec!["h2", "span"]);
    }

    #[test]
    fn test_describe_unknown_locator() {
        let snap = snapshot();
        let tools = ToolSurface::new(&snap);
        assert!(matches!(
            tools.describe_node("html > body:nth-of-type(1) > nav:nth-of-type(1)"),
            Err(SelectionError::UnknownLocator(_))
        ));
    }

    #[test]
    fn test_finalize_zero_match_guard() {
        let snap = snapshot();
        let tools = ToolSurface::new(&snap);
        assert!(matches!(
            tools.finalize(".does-not-exist"),
            Err(SelectionError::ZeroMatch(_))
        ));
    }

    #[test]
    fn test_finalize_accepts_with_count() {
        let snap = snapshot();
        let tools = ToolSurface::new(&snap);
        let candidate = tools.finalize("article.post").unwrap();
        assert_eq!(candidate.match_count, 3);
        assert_eq!(candidate.state, CandidateState::Accepted);
        assert!(!candidate.samples.is_empty());
    }

    #[test]
    fn test_matched_html_limit() {
        let snap = snapshot();
        let tools = ToolSurface::new(&snap);
        let fragments = tools.matched_html("article.post", 2).unwrap();
        assert_eq!(fragments.len(), 2);
        assert!(fragments[0].contains("First post"));
    }

    #[test]
    fn test_screenshot_ref_over_snapshot_bytes() {
        let snap = DomSnapshot::from_parts(PAGE, "https://example.com", vec![1, 2, 3], chrono::Utc::now());
        let tools = ToolSurface::new(&snap);
        let image = tools.capture_screenshot();
        assert_eq!(image.format, "png");
        assert_eq!(image.byte_len, 3);
        assert_eq!(image.data, "AQID");
    }
}
