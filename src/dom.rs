//! Immutable document model
//!
//! This module builds a fixed, explicitly-traversed tree of [`DomNode`]s from
//! raw HTML, plus the [`DomSnapshot`] that pairs the tree with a screenshot
//! and capture timestamp. Nodes are never mutated after construction; a new
//! snapshot is built per observation.

use chrono::{DateTime, Utc};
use scraper::{ElementRef, Html};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single element in the document tree.
///
/// Attributes are stored in a sorted map (keys unique), children keep
/// document order, and `locator` is a structural CSS path that re-identifies
/// this node within the snapshot it was built from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomNode {
    /// Lowercase tag name
    pub tag: String,
    /// Attribute name → value
    pub attributes: BTreeMap<String, String>,
    /// Child elements in document order
    pub children: Vec<DomNode>,
    /// Whitespace-collapsed text directly inside this element (not descendants)
    pub text: String,
    /// Structural path, e.g. `html > body:nth-of-type(1) > div:nth-of-type(2)`
    pub locator: String,
}

impl DomNode {
    /// Depth-first lookup of a node by its locator path.
    pub fn find_by_locator(&self, locator: &str) -> Option<&DomNode> {
        if self.locator == locator {
            return Some(self);
        }
        // Locators are prefix-structured, so prune branches early.
        for child in &self.children {
            if locator.starts_with(&child.locator) {
                if let Some(found) = child.find_by_locator(locator) {
                    return Some(found);
                }
            }
        }
        None
    }

    /// Total number of elements in this subtree (including self).
    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(DomNode::node_count).sum::<usize>()
    }

    /// Concatenated text of this element and all descendants.
    pub fn deep_text(&self) -> String {
        let mut parts = Vec::new();
        self.collect_text(&mut parts);
        parts.join(" ")
    }

    fn collect_text(&self, out: &mut Vec<String>) {
        if !self.text.is_empty() {
            out.push(self.text.clone());
        }
        for child in &self.children {
            child.collect_text(out);
        }
    }
}

/// An immutable capture of a document at one point in time.
#[derive(Debug, Clone)]
pub struct DomSnapshot {
    /// URL the document was captured from
    pub url: String,
    /// Raw HTML as retrieved from the page
    pub html: String,
    /// Root of the structured tree (the `<html>` element)
    pub root: DomNode,
    /// Screenshot bytes (PNG), empty when capture was skipped
    pub screenshot: Vec<u8>,
    /// Capture timestamp
    pub captured_at: DateTime<Utc>,
}

impl DomSnapshot {
    /// Build a snapshot from static HTML, without a screenshot.
    ///
    /// Used by tests and the debug entry point; the live path composes the
    /// same structure in `snapshot::SnapshotProvider`.
    pub fn from_html(html: &str, url: &str) -> Self {
        Self::from_parts(html, url, Vec::new(), Utc::now())
    }

    /// Build a snapshot from its raw parts.
    pub fn from_parts(
        html: &str,
        url: &str,
        screenshot: Vec<u8>,
        captured_at: DateTime<Utc>,
    ) -> Self {
        let root = build_tree(html);
        Self {
            url: url.to_string(),
            html: html.to_string(),
            root,
            screenshot,
            captured_at,
        }
    }

    /// Find a node anywhere in the snapshot by locator.
    pub fn find_by_locator(&self, locator: &str) -> Option<&DomNode> {
        self.root.find_by_locator(locator)
    }
}

/// Parse HTML into an immutable [`DomNode`] tree rooted at `<html>`.
pub fn build_tree(html: &str) -> DomNode {
    let document = Html::parse_document(html);
    let root = document.root_element();
    convert_element(root, "html")
}

fn convert_element(element: ElementRef<'_>, locator: &str) -> DomNode {
    let value = element.value();
    let tag = value.name().to_lowercase();

    let mut attributes = BTreeMap::new();
    for (name, val) in value.attrs() {
        attributes.insert(name.to_string(), val.to_string());
    }

    // Own text: direct text children only, whitespace collapsed.
    let mut own_text = String::new();
    for child in element.children() {
        if let Some(text) = child.value().as_text() {
            let trimmed = text.trim();
            if !trimmed.is_empty() {
                if !own_text.is_empty() {
                    own_text.push(' ');
                }
                own_text.push_str(&collapse_whitespace(trimmed));
            }
        }
    }

    // Children with nth-of-type positions matching CSS semantics.
    let mut tag_counts: BTreeMap<String, usize> = BTreeMap::new();
    let mut children = Vec::new();
    for child in element.children() {
        if let Some(child_ref) = ElementRef::wrap(child) {
            let child_tag = child_ref.value().name().to_lowercase();
            let position = tag_counts
                .entry(child_tag.clone())
                .and_modify(|n| *n += 1)
                .or_insert(1);
            let child_locator = format!("{locator} > {child_tag}:nth-of-type({position})");
            children.push(convert_element(child_ref, &child_locator));
        }
    }

    DomNode {
        tag,
        attributes,
        children,
        text: own_text,
        locator: locator.to_string(),
    }
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Truncate a string to at most `max_chars` characters, appending an
/// ellipsis marker when anything was cut. Always splits on a char boundary.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let truncated: String = text.chars().take(max_chars).collect();
    format!("{truncated}…")
}
