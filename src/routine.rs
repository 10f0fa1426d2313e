//! Declarative extraction routines and their pure interpreter
//!
//! An [`ExtractionRoutine`] maps output field names to small selector/source
//! rules. The interpreter applies a routine to matched document nodes without
//! any code execution: given the same routine and document it always produces
//! the same record sequence. Per-node failures drop only that node's record.

use crate::error::ExtractionError;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// One extracted record: field name → value.
pub type Record = BTreeMap<String, String>;

/// Where a field's value comes from within the matched node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldSource {
    /// Concatenated text content
    Text,
    /// Inner HTML of the element
    Html,
    /// A named attribute's value
    Attribute(String),
}

/// A single field rule: an optional selector scoped to the matched node,
/// plus the value source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldRule {
    /// CSS selector evaluated relative to the matched node; `None` targets
    /// the matched node itself
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    /// Value source for the field
    pub source: FieldSource,
}

impl FieldRule {
    /// Rule extracting the text of the first descendant matching `selector`.
    pub fn text(selector: &str) -> Self {
        Self {
            selector: Some(selector.to_string()),
            source: FieldSource::Text,
        }
    }

    /// Rule extracting an attribute of the first descendant matching `selector`.
    pub fn attribute(selector: &str, attribute: &str) -> Self {
        Self {
            selector: Some(selector.to_string()),
            source: FieldSource::Attribute(attribute.to_string()),
        }
    }

    /// Rule targeting the matched node itself.
    pub fn own(source: FieldSource) -> Self {
        Self {
            selector: None,
            source,
        }
    }
}

/// A reusable, AI-free extraction routine.
///
/// Field order is fixed by the sorted map so serialized output and extracted
/// records are stable across runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionRoutine {
    /// Output field name → rule
    pub fields: BTreeMap<String, FieldRule>,
}

impl ExtractionRoutine {
    /// Create an empty routine.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a field rule, returning self for chaining.
    pub fn with_field(mut self, name: &str, rule: FieldRule) -> Self {
        self.fields.insert(name.to_string(), rule);
        self
    }

    /// Whether the routine defines any fields at all.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Apply `routine` to every node matched by `selector` in `html`.
///
/// Pure and total: an unparsable selector or zero matches yield an empty
/// sequence, never an error. A per-node failure is logged and that node's
/// record omitted; remaining nodes are still processed.
pub fn execute(selector: &str, routine: &ExtractionRoutine, html: &str) -> Vec<Record> {
    let parsed = match Selector::parse(selector) {
        Ok(s) => s,
        Err(e) => {
            warn!("Unparsable routine selector '{}': {:?}", selector, e);
            return Vec::new();
        }
    };

    let document = Html::parse_document(html);
    let mut records = Vec::new();
    for (index, element) in document.select(&parsed).enumerate() {
        match apply_to_element(routine, element) {
            Ok(record) => records.push(record),
            Err(e) => {
                warn!("Skipping node {} for selector '{}': {}", index + 1, selector, e);
            }
        }
    }
    debug!(
        "Executed routine over {} records (selector '{}')",
        records.len(),
        selector
    );
    records
}

/// Apply `routine` to a standalone HTML fragment (one matched node's outer
/// HTML). Used by the codegen self-test.
pub fn execute_on_fragment(
    routine: &ExtractionRoutine,
    fragment_html: &str,
) -> Result<Record, ExtractionError> {
    let fragment = Html::parse_fragment(fragment_html);
    let root = fragment
        .root_element()
        .child_elements()
        .next()
        .ok_or_else(|| {
            ExtractionError::FragmentFailed("fragment contains no element".to_string())
        })?;
    apply_to_element(routine, root)
}

/// Apply a routine to one matched element, building its record.
pub fn apply_to_element(
    routine: &ExtractionRoutine,
    element: ElementRef<'_>,
) -> Result<Record, ExtractionError> {
    let mut record = Record::new();
    for (field, rule) in &routine.fields {
        let target = match &rule.selector {
            Some(selector) => {
                let parsed = Selector::parse(selector).map_err(|_| {
                    ExtractionError::InvalidFieldSelector {
                        field: field.clone(),
                        selector: selector.clone(),
                    }
                })?;
                element.select(&parsed).next()
            }
            None => Some(element),
        };

        // A rule that matches nothing produces an empty value, not an error.
        let value = match target {
            Some(el) => extract_value(el, &rule.source),
            None => String::new(),
        };
        record.insert(field.clone(), value);
    }
    Ok(record)
}

fn extract_value(element: ElementRef<'_>, source: &FieldSource) -> String {
    match source {
        FieldSource::Text => element
            .text()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" "),
        FieldSource::Html => element.inner_html(),
        FieldSource::Attribute(name) => element
            .value()
            .attr(name)
            .unwrap_or_default()
            .to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const POSTS: &str = r#"
        <html><body>
            <article><h2>First</h2><a href="/a">more</a></article>
            <article><h2>Second</h2><a href="/b">more</a></article>
            <article><h2>Third</h2></article>
        </body></html>
    "#;

    fn title_link_routine() -> ExtractionRoutine {
        ExtractionRoutine::new()
            .with_field("title", FieldRule::text("h2"))
            .with_field("link", FieldRule::attribute("a", "href"))
    }

    #[test]
    fn test_execute_per_node_records() {
        let records = execute("article", &title_link_routine(), POSTS);
        assert_eq!(records.len(), 3);
        assert_eq!(records[0]["title"], "First");
        assert_eq!(records[1]["link"], "/b");
        // No <a> in the third article: empty value, record still present.
        assert_eq!(records[2]["link"], "");
    }

    #[test]
    fn test_execute_no_match_is_empty_not_error() {
        let records = execute(".absent", &title_link_routine(), POSTS);
        assert!(records.is_empty());
    }

    #[test]
    fn test_execute_bad_selector_is_empty() {
        let records = execute(":::", &title_link_routine(), POSTS);
        assert!(records.is_empty());
    }

    #[test]
    fn test_invalid_field_selector_drops_node_only() {
        let routine = ExtractionRoutine::new()
            .with_field("broken", FieldRule::text("[["));
        let records = execute("article", &routine, POSTS);
        // Every node fails the same way, so everything is dropped but nothing panics.
        assert!(records.is_empty());
    }

    #[test]
    fn test_execute_on_fragment() {
        let record = execute_on_fragment(
            &title_link_routine(),
            "<article><h2>Solo</h2><a href=\"/s\">x</a></article>",
        )
        .expect("fragment should parse");
        assert_eq!(record["title"], "Solo");
        assert_eq!(record["link"], "/s");
    }

    #[test]
    fn test_fragment_without_element_fails() {
        let result = execute_on_fragment(&title_link_routine(), "just text, no element");
        assert!(matches!(result, Err(ExtractionError::FragmentFailed(_))));
    }

    #[test]
    fn test_own_source_rules() {
        let routine = ExtractionRoutine::new()
            .with_field("body", FieldRule::own(FieldSource::Text))
            .with_field("id", FieldRule::own(FieldSource::Attribute("id".into())));
        let record =
            execute_on_fragment(&routine, "<p id=\"p1\">hello <b>there</b></p>").unwrap();
        assert_eq!(record["body"], "hello there");
        assert_eq!(record["id"], "p1");
    }

    #[test]
    fn test_determinism() {
        let a = execute("article", &title_link_routine(), POSTS);
        let b = execute("article", &title_link_routine(), POSTS);
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }

    #[test]
    fn test_routine_serde_round_trip() {
        let routine = title_link_routine();
        let json = serde_json::to_string_pretty(&routine).unwrap();
        assert!(json.contains("\"attribute\": \"href\""));
        let back: ExtractionRoutine = serde_json::from_str(&json).unwrap();
        assert_eq!(back, routine);
    }
}
