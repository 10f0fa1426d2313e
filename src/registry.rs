//! Versioned parser definition registry
//!
//! Durable store of [`ParserDefinition`]s keyed by domain and optional path
//! pattern. Lookup is deterministic and total; writes publish a fresh
//! copy-on-write snapshot so concurrent readers never observe a partial
//! update. Persistence is one human-diffable JSON file per domain, written
//! atomically (tmp + rename). Corrupt files are skipped with a warning and
//! never block resolution for other domains.

use crate::error::{Error, RegistryError, Result};
use crate::routine::ExtractionRoutine;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use url::Url;

/// How a definition came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    /// Produced by the synthesis pipeline
    Generated,
    /// Authored by hand
    Manual,
}

/// A persisted, versioned extraction parser.
///
/// Immutable once registered; edits create a new version under the same
/// (domain, path pattern) key, superseding but never deleting the old one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParserDefinition {
    /// Normalized domain (lowercase, `www.` stripped)
    pub domain: String,
    /// Optional path pattern (`/thread/*`); `None` is the domain default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_pattern: Option<String>,
    /// The selector identifying repeated content nodes
    pub selector: String,
    /// The extraction routine applied per matched node
    pub routine: ExtractionRoutine,
    /// When this version was registered
    pub created_at: DateTime<Utc>,
    /// Version counter, unique per (domain, path pattern) key
    pub version: u32,
    /// Generated vs manual
    pub provenance: Provenance,
}

/// A definition as submitted for registration, before the registry assigns
/// version and timestamp.
#[derive(Debug, Clone)]
pub struct NewDefinition {
    /// Target domain (any case, `www.` allowed; normalized on register)
    pub domain: String,
    /// Optional path pattern
    pub path_pattern: Option<String>,
    /// Selector string
    pub selector: String,
    /// Extraction routine
    pub routine: ExtractionRoutine,
    /// Generated vs manual
    pub provenance: Provenance,
}

/// Per-domain persisted document: every version ever registered, in
/// registration order.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DomainFile {
    domain: String,
    definitions: Vec<ParserDefinition>,
}

/// Immutable registry state, swapped atomically on every write.
#[derive(Debug, Default)]
struct RegistrySnapshot {
    domains: BTreeMap<String, Vec<Arc<ParserDefinition>>>,
}

/// The parser registry.
///
/// Safe for concurrent readers at all times; writers serialize among
/// themselves and publish new state as a whole-snapshot swap.
pub struct ParserRegistry {
    state: RwLock<Arc<RegistrySnapshot>>,
    dir: Option<PathBuf>,
    load_warnings: Vec<RegistryError>,
}

impl ParserRegistry {
    /// Create an empty, non-persistent registry.
    pub fn in_memory() -> Self {
        Self {
            state: RwLock::new(Arc::new(RegistrySnapshot::default())),
            dir: None,
            load_warnings: Vec::new(),
        }
    }

    /// Load a registry backed by a directory of per-domain JSON files.
    ///
    /// The directory is created if missing. Corrupt or unreadable files are
    /// skipped with a warning (inspect via [`ParserRegistry::load_warnings`])
    /// and do not prevent other domains from loading.
    #[instrument]
    pub fn load(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;

        let mut domains: BTreeMap<String, Vec<Arc<ParserDefinition>>> = BTreeMap::new();
        let mut load_warnings = Vec::new();

        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_domain_file(&path) {
                Ok(file) => {
                    let domain = normalize_domain(&file.domain);
                    let defs = domains.entry(domain).or_default();
                    for def in file.definitions {
                        defs.push(Arc::new(def));
                    }
                }
                Err(e) => {
                    warn!("Skipping corrupt parser file {}: {}", path.display(), e);
                    load_warnings.push(RegistryError::CorruptDefinition {
                        path: path.display().to_string(),
                        message: e.to_string(),
                    });
                }
            }
        }

        let total: usize = domains.values().map(Vec::len).sum();
        info!(
            "Loaded {} parser definitions across {} domains from {}",
            total,
            domains.len(),
            dir.display()
        );

        Ok(Self {
            state: RwLock::new(Arc::new(RegistrySnapshot { domains })),
            dir: Some(dir.to_path_buf()),
            load_warnings,
        })
    }

    /// Warnings collected while loading (corrupt files that were skipped).
    pub fn load_warnings(&self) -> &[RegistryError] {
        &self.load_warnings
    }

    /// Number of definitions currently held, all versions included.
    pub fn len(&self) -> usize {
        self.state.read().domains.values().map(Vec::len).sum()
    }

    /// Whether the registry holds no definitions.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register a definition, assigning the next version for its
    /// (domain, path pattern) key.
    ///
    /// Persists the domain file (when backed by a directory) before the new
    /// snapshot is published, so readers observe either the previous or the
    /// new state, never a mix.
    #[instrument(skip(self, new), fields(domain = %new.domain))]
    pub fn register(&self, new: NewDefinition) -> Result<Arc<ParserDefinition>> {
        if new.selector.trim().is_empty() {
            return Err(RegistryError::InvalidDefinition("empty selector".into()).into());
        }
        if new.routine.is_empty() {
            return Err(RegistryError::InvalidDefinition("routine has no fields".into()).into());
        }
        let domain = normalize_domain(&new.domain);
        if domain.is_empty() {
            return Err(RegistryError::InvalidDefinition("empty domain".into()).into());
        }

        let mut state = self.state.write();

        let next_version = state
            .domains
            .get(&domain)
            .map(|defs| {
                defs.iter()
                    .filter(|d| d.path_pattern == new.path_pattern)
                    .map(|d| d.version)
                    .max()
                    .unwrap_or(0)
            })
            .unwrap_or(0)
            + 1;

        let definition = Arc::new(ParserDefinition {
            domain: domain.clone(),
            path_pattern: new.path_pattern,
            selector: new.selector,
            routine: new.routine,
            created_at: Utc::now(),
            version: next_version,
            provenance: new.provenance,
        });

        // Copy-on-write: build the successor snapshot aside, persist, then swap.
        let mut domains = state.domains.clone();
        domains
            .entry(domain.clone())
            .or_default()
            .push(Arc::clone(&definition));

        if let Some(dir) = &self.dir {
            let file = DomainFile {
                domain: domain.clone(),
                definitions: domains[&domain].iter().map(|d| (**d).clone()).collect(),
            };
            write_domain_file(dir, &file).map_err(|e| RegistryError::PersistFailed {
                domain: domain.clone(),
                message: e.to_string(),
            })?;
        }

        *state = Arc::new(RegistrySnapshot { domains });
        debug!(
            "Registered parser for '{}' v{} (pattern: {:?})",
            domain, definition.version, definition.path_pattern
        );
        Ok(definition)
    }

    /// Resolve the best definition for a URL, or `None`.
    ///
    /// Domain match first, then the most specific matching path pattern,
    /// falling back to the domain default (no pattern); ties broken by
    /// highest version. Deterministic for a given registry snapshot.
    pub fn resolve(&self, url: &str) -> Option<Arc<ParserDefinition>> {
        let parsed = Url::parse(url).ok()?;
        let host = normalize_domain(parsed.host_str()?);
        let path = parsed.path();

        let snapshot = Arc::clone(&self.state.read());
        let defs = snapshot.domains.get(&host)?;

        let best_pattern = defs
            .iter()
            .filter(|d| {
                d.path_pattern
                    .as_deref()
                    .is_some_and(|p| glob_match(p, path))
            })
            .max_by_key(|d| {
                (
                    pattern_specificity(d.path_pattern.as_deref().unwrap_or_default()),
                    d.version,
                    d.path_pattern.clone(),
                )
            });
        if let Some(found) = best_pattern {
            return Some(Arc::clone(found));
        }

        defs.iter()
            .filter(|d| d.path_pattern.is_none())
            .max_by_key(|d| d.version)
            .map(Arc::clone)
    }

    /// All definitions for a domain, every version, in registration order.
    pub fn definitions_for(&self, domain: &str) -> Vec<Arc<ParserDefinition>> {
        let domain = normalize_domain(domain);
        self.state
            .read()
            .domains
            .get(&domain)
            .map(|defs| defs.to_vec())
            .unwrap_or_default()
    }

    /// All definitions across every domain, ordered by domain.
    pub fn definitions(&self) -> Vec<Arc<ParserDefinition>> {
        self.state
            .read()
            .domains
            .values()
            .flat_map(|defs| defs.iter().cloned())
            .collect()
    }
}

/// Lowercase the domain and strip a leading `www.`.
pub fn normalize_domain(domain: &str) -> String {
    let lower = domain.trim().to_lowercase();
    lower.strip_prefix("www.").unwrap_or(&lower).to_string()
}

/// Literal length of a pattern, ignoring wildcards. Longer means more specific.
fn pattern_specificity(pattern: &str) -> usize {
    pattern.chars().filter(|c| *c != '*').count()
}

/// Wildcard path matching: `*` matches any run of characters.
///
/// A pattern without `*` must match the path exactly; otherwise segments
/// anchor at the start and end unless the pattern begins/ends with `*`.
pub fn glob_match(pattern: &str, path: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == path;
    }
    let parts: Vec<&str> = pattern.split('*').collect();
    let mut pos = 0usize;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        match path[pos..].find(part) {
            None => return false,
            Some(idx) => {
                if i == 0 && idx != 0 {
                    return false;
                }
                pos += idx + part.len();
            }
        }
    }
    if !pattern.ends_with('*') {
        if let Some(last) = parts.last() {
            if !last.is_empty() && !path.ends_with(last) {
                return false;
            }
        }
    }
    true
}

/// Filename slug for a domain (`news.example.com` → `news-example-com`).
fn domain_slug(domain: &str) -> String {
    let re = Regex::new(r"[^a-z0-9-]+").expect("static regex");
    re.replace_all(&domain.to_lowercase(), "-")
        .trim_matches('-')
        .to_string()
}

fn read_domain_file(path: &Path) -> Result<DomainFile> {
    let content = std::fs::read_to_string(path)?;
    let file: DomainFile = serde_json::from_str(&content)?;
    if file.domain.trim().is_empty() {
        return Err(Error::Registry(RegistryError::InvalidDefinition(
            "domain file with empty domain".into(),
        )));
    }
    Ok(file)
}

/// Path of the file holding `domain`'s definitions.
///
/// Slugs are lossy (`news.example.com` and `news-example.com` share one),
/// so a slug owned by a different domain gets a numeric suffix instead of
/// being overwritten. Probing is deterministic: the same domain always
/// lands on the same file.
fn domain_file_path(dir: &Path, domain: &str) -> PathBuf {
    let slug = domain_slug(domain);
    for attempt in 0u32.. {
        let name = if attempt == 0 {
            format!("{slug}.json")
        } else {
            format!("{slug}-{}.json", attempt + 1)
        };
        let path = dir.join(name);
        if !path.exists() {
            return path;
        }
        if let Ok(existing) = read_domain_file(&path) {
            if normalize_domain(&existing.domain) == domain {
                return path;
            }
        }
    }
    unreachable!("probe sequence is unbounded")
}

fn write_domain_file(dir: &Path, file: &DomainFile) -> Result<()> {
    let target = domain_file_path(dir, &file.domain);
    let tmp = target.with_extension("json.tmp");
    let content = serde_json::to_string_pretty(file)?;
    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, &target)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routine::FieldRule;

    fn sample_routine() -> ExtractionRoutine {
        ExtractionRoutine::new().with_field("title", FieldRule::text("h2"))
    }

    fn new_def(domain: &str, pattern: Option<&str>) -> NewDefinition {
        NewDefinition {
            domain: domain.to_string(),
            path_pattern: pattern.map(str::to_string),
            selector: "article".to_string(),
            routine: sample_routine(),
            provenance: Provenance::Generated,
        }
    }

    #[test]
    fn test_versions_increment_per_key() {
        let registry = ParserRegistry::in_memory();
        let v1 = registry.register(new_def("example.com", None)).unwrap();
        let v2 = registry.register(new_def("example.com", None)).unwrap();
        let other = registry
            .register(new_def("example.com", Some("/thread/*")))
            .unwrap();
        assert_eq!(v1.version, 1);
        assert_eq!(v2.version, 2);
        // Different (domain, pattern) key starts its own counter.
        assert_eq!(other.version, 1);
        // History kept: all three versions present.
        assert_eq!(registry.definitions_for("example.com").len(), 3);
    }

    #[test]
    fn test_resolve_prefers_path_pattern_then_default() {
        let registry = ParserRegistry::in_memory();
        registry.register(new_def("x.com", None)).unwrap();
        registry
            .register(new_def("x.com", Some("/thread/*")))
            .unwrap();

        let specific = registry.resolve("https://x.com/thread/123").unwrap();
        assert_eq!(specific.path_pattern.as_deref(), Some("/thread/*"));

        let default = registry.resolve("https://x.com/other").unwrap();
        assert_eq!(default.path_pattern, None);
    }

    #[test]
    fn test_resolve_ties_break_by_version() {
        let registry = ParserRegistry::in_memory();
        registry.register(new_def("x.com", None)).unwrap();
        registry.register(new_def("x.com", None)).unwrap();
        let resolved = registry.resolve("https://x.com/").unwrap();
        assert_eq!(resolved.version, 2);
    }

    #[test]
    fn test_resolve_specificity_ordering() {
        let registry = ParserRegistry::in_memory();
        registry.register(new_def("x.com", Some("/t/*"))).unwrap();
        registry
            .register(new_def("x.com", Some("/t/pinned/*")))
            .unwrap();
        let resolved = registry.resolve("https://x.com/t/pinned/42").unwrap();
        assert_eq!(resolved.path_pattern.as_deref(), Some("/t/pinned/*"));
    }

    #[test]
    fn test_resolve_normalizes_www_and_case() {
        let registry = ParserRegistry::in_memory();
        registry.register(new_def("WWW.Example.com", None)).unwrap();
        assert!(registry.resolve("https://example.com/page").is_some());
        assert!(registry.resolve("https://www.example.com/page").is_some());
    }

    #[test]
    fn test_resolve_unknown_is_none() {
        let registry = ParserRegistry::in_memory();
        registry.register(new_def("x.com", None)).unwrap();
        assert!(registry.resolve("https://y.com/").is_none());
        assert!(registry.resolve("not a url").is_none());
    }

    #[test]
    fn test_register_rejects_invalid() {
        let registry = ParserRegistry::in_memory();
        let mut bad = new_def("x.com", None);
        bad.selector = "  ".to_string();
        assert!(registry.register(bad).is_err());

        let mut empty_routine = new_def("x.com", None);
        empty_routine.routine = ExtractionRoutine::new();
        assert!(registry.register(empty_routine).is_err());
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match("/thread/*", "/thread/123"));
        assert!(glob_match("/thread/*", "/thread/"));
        assert!(!glob_match("/thread/*", "/other"));
        assert!(glob_match("/a/*/c", "/a/b/c"));
        assert!(!glob_match("/a/*/c", "/a/b/d"));
        assert!(glob_match("/exact", "/exact"));
        assert!(!glob_match("/exact", "/exact/sub"));
    }

    #[test]
    fn test_domain_slug() {
        assert_eq!(domain_slug("news.example.com"), "news-example-com");
        assert_eq!(domain_slug("x.com"), "x-com");
    }
}
