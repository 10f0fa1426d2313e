//! parsekit - agent-driven parser synthesis and deterministic execution
//!
//! This crate turns a natural-language extraction goal against a live web
//! page into a reusable, AI-free parser, then executes persisted parsers
//! deterministically against arbitrary documents.
//!
//! # Architecture
//!
//! ```text
//! CDP Transport ──▶ Snapshot Provider ──▶ Tool Surface
//!                                              │
//!                      Reasoning Agent ◀──▶ Selection Loop ──▶ selector
//!                                              │
//!                                         Codegen Loop ──▶ routine
//!                                              │
//!                                       Parser Registry ──▶ Runtime ──▶ records
//! ```
//!
//! Authoring is non-deterministic (an external reasoning agent drives the
//! loops); execution is pure: [`parse`] resolves a versioned definition for
//! a URL and applies its declarative routine, returning the same records for
//! the same inputs every time.
//!
//! # Quick start (run time)
//!
//! ```rust,no_run
//! use parsekit::registry::ParserRegistry;
//!
//! let registry = ParserRegistry::load(std::path::Path::new("parsers"))?;
//! let records = parsekit::parse(&registry, "https://example.com/thread/1", "<html>…</html>");
//! for record in records {
//!     println!("{:?}", record);
//! }
//! # Ok::<(), parsekit::Error>(())
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod agent;
pub mod cdp;
pub mod codegen;
pub mod dom;
pub mod error;
pub mod registry;
pub mod routine;
pub mod selection;
pub mod snapshot;
pub mod tools;

// Re-exports for convenience
pub use agent::{AgentAction, ReasoningAgent};
pub use cdp::CdpSession;
pub use codegen::CodegenLoop;
pub use dom::{DomNode, DomSnapshot};
pub use error::{Error, Result};
pub use registry::{ParserDefinition, ParserRegistry};
pub use routine::{ExtractionRoutine, Record};
pub use selection::{CancelToken, SelectionLoop};
pub use snapshot::SnapshotProvider;
pub use tools::ToolSurface;

use tracing::debug;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Parse structured records from a document using the registered parser for
/// its URL.
///
/// Resolves the best definition via [`ParserRegistry::resolve`] and executes
/// its routine. Returns an empty sequence when nothing resolves or when the
/// selector matches nothing; run-time failures never propagate as errors.
pub fn parse(registry: &ParserRegistry, url: &str, html: &str) -> Vec<Record> {
    match registry.resolve(url) {
        Some(definition) => {
            debug!(
                "Resolved parser for '{}': {} v{}",
                url, definition.domain, definition.version
            );
            routine::execute(&definition.selector, &definition.routine, html)
        }
        None => {
            debug!("No parser resolved for '{}'", url);
            Vec::new()
        }
    }
}

/// Debug/test entry point: run a candidate definition against one example
/// document without touching the registry.
pub fn parse_with_definition(definition: &ParserDefinition, html: &str) -> Vec<Record> {
    routine::execute(&definition.selector, &definition.routine, html)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{NewDefinition, Provenance};
    use crate::routine::FieldRule;

    const HTML: &str = r#"
        <html><body>
            <article><h2>One</h2></article>
            <article><h2>Two</h2></article>
        </body></html>
    "#;

    fn register_sample(registry: &ParserRegistry) {
        registry
            .register(NewDefinition {
                domain: "example.com".to_string(),
                path_pattern: None,
                selector: "article".to_string(),
                routine: ExtractionRoutine::new().with_field("title", FieldRule::text("h2")),
                provenance: Provenance::Manual,
            })
            .unwrap();
    }

    #[test]
    fn test_parse_resolves_and_executes() {
        let registry = ParserRegistry::in_memory();
        register_sample(&registry);
        let records = parse(&registry, "https://example.com/feed", HTML);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["title"], "One");
    }

    #[test]
    fn test_parse_unresolved_is_empty() {
        let registry = ParserRegistry::in_memory();
        register_sample(&registry);
        assert!(parse(&registry, "https://other.org/", HTML).is_empty());
    }

    #[test]
    fn test_parse_is_deterministic() {
        let registry = ParserRegistry::in_memory();
        register_sample(&registry);
        let a = serde_json::to_vec(&parse(&registry, "https://example.com/", HTML)).unwrap();
        let b = serde_json::to_vec(&parse(&registry, "https://example.com/", HTML)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_parse_with_definition_skips_registry() {
        let registry = ParserRegistry::in_memory();
        register_sample(&registry);
        let definition = registry.resolve("https://example.com/").unwrap();
        let records = parse_with_definition(&definition, HTML);
        assert_eq!(records.len(), 2);
    }
}
