//! Extraction-routine synthesis loop
//!
//! Structurally analogous to the selection loop: each iteration asks the
//! agent to produce or revise a declarative extraction routine for the nodes
//! matched by the finalized selector, then self-tests the candidate against
//! those same nodes. Acceptance requires an error-free run producing at
//! least one record with at least one non-empty field.

use crate::agent::{CodegenContext, ReasoningAgent};
use crate::dom::DomSnapshot;
use crate::error::CodegenError;
use crate::registry::{NewDefinition, Provenance};
use crate::routine::{execute_on_fragment, ExtractionRoutine, Record};
use crate::selection::SelectorCandidate;
use crate::tools::ToolSurface;
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Budgets for one codegen run.
#[derive(Debug, Clone)]
pub struct CodegenConfig {
    /// Propose/self-test attempts before failing
    pub max_attempts: u32,
    /// Matched-node fragments sampled into agent context and self-test
    pub max_samples: usize,
    /// Agent error retries per attempt
    pub agent_retry_cap: u32,
    /// Base delay for agent retry backoff
    pub retry_base_delay: Duration,
}

impl Default for CodegenConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            max_samples: 4,
            agent_retry_cap: 3,
            retry_base_delay: Duration::from_millis(250),
        }
    }
}

/// An accepted routine together with its self-test evidence.
#[derive(Debug, Clone)]
pub struct GeneratedParser {
    /// The originating selector
    pub selector: String,
    /// The accepted routine
    pub routine: ExtractionRoutine,
    /// Records produced during the accepting self-test
    pub records: Vec<Record>,
    /// Attempts it took to converge
    pub attempts: u32,
}

impl GeneratedParser {
    /// Package the accepted routine for registration (provenance: generated).
    pub fn into_definition(self, domain: &str, path_pattern: Option<String>) -> NewDefinition {
        NewDefinition {
            domain: domain.to_string(),
            path_pattern,
            selector: self.selector,
            routine: self.routine,
            provenance: Provenance::Generated,
        }
    }
}

/// The codegen loop driver.
pub struct CodegenLoop {
    config: CodegenConfig,
}

impl Default for CodegenLoop {
    fn default() -> Self {
        Self::new(CodegenConfig::default())
    }
}

impl CodegenLoop {
    /// Create a loop with the given budgets.
    pub fn new(config: CodegenConfig) -> Self {
        Self { config }
    }

    /// Synthesize a routine for the finalized `candidate` against the
    /// snapshot it was tested on.
    #[instrument(skip(self, agent, snapshot, candidate), fields(selector = %candidate.selector))]
    pub async fn run(
        &self,
        agent: &dyn ReasoningAgent,
        candidate: &SelectorCandidate,
        snapshot: &DomSnapshot,
    ) -> Result<GeneratedParser, CodegenError> {
        let tools = ToolSurface::new(snapshot);
        let fragments = tools
            .matched_html(&candidate.selector, self.config.max_samples * 3)
            .map_err(|e| CodegenError::AgentFailed(format!("selector no longer valid: {e}")))?;
        if fragments.is_empty() {
            return Err(CodegenError::NoValidOutput {
                attempts: 0,
                feedback: format!("selector '{}' matches no nodes", candidate.selector),
            });
        }
        let samples = sample_fragments(&fragments, self.config.max_samples);
        info!(
            "Codegen started: {} fragments, {} sampled",
            fragments.len(),
            samples.len()
        );

        let mut feedback: Option<String> = None;
        let mut previous_records: Vec<Record> = Vec::new();

        for attempt in 1..=self.config.max_attempts {
            let ctx = CodegenContext {
                selector: &candidate.selector,
                samples: &samples,
                attempt,
                feedback: feedback.as_deref(),
                previous_records: &previous_records,
            };
            let routine = self.propose_with_retry(agent, &ctx).await?;

            match self.self_test(&routine, &samples) {
                Ok(records) => {
                    let quality = quality_feedback(&records);
                    // First success still gets one mandatory refinement pass
                    // when quality issues exist, mirroring how a human would
                    // not ship the very first draft.
                    if attempt < self.config.max_attempts && !quality.is_empty() {
                        debug!("Attempt {} passed with quality issues: {:?}", attempt, quality);
                        feedback = Some(format!("quality issues: {}", quality.join("; ")));
                        previous_records = records;
                        continue;
                    }
                    info!(
                        "Codegen accepted after {} attempts ({} records)",
                        attempt,
                        records.len()
                    );
                    return Ok(GeneratedParser {
                        selector: candidate.selector.clone(),
                        routine,
                        records,
                        attempts: attempt,
                    });
                }
                Err(msg) => {
                    warn!("Attempt {} self-test failed: {}", attempt, msg);
                    feedback = Some(msg);
                    previous_records.clear();
                }
            }
        }

        Err(CodegenError::NoValidOutput {
            attempts: self.config.max_attempts,
            feedback: feedback.unwrap_or_else(|| "no attempt produced output".to_string()),
        })
    }

    /// Run the candidate routine over every sampled fragment. Success needs
    /// all fragments to execute and at least one record with at least one
    /// non-empty field.
    fn self_test(
        &self,
        routine: &ExtractionRoutine,
        samples: &[String],
    ) -> Result<Vec<Record>, String> {
        if routine.is_empty() {
            return Err("routine defines no fields".to_string());
        }
        let mut records = Vec::new();
        for (idx, fragment) in samples.iter().enumerate() {
            match execute_on_fragment(routine, fragment) {
                Ok(record) => records.push(record),
                Err(e) => return Err(format!("sample {} failed: {e}", idx + 1)),
            }
        }
        let any_non_empty = records
            .iter()
            .any(|r| r.values().any(|v| !v.trim().is_empty()));
        if !any_non_empty {
            return Err("all extracted fields are empty".to_string());
        }
        Ok(records)
    }

    async fn propose_with_retry(
        &self,
        agent: &dyn ReasoningAgent,
        ctx: &CodegenContext<'_>,
    ) -> Result<ExtractionRoutine, CodegenError> {
        let mut last_error = String::new();
        for attempt in 1..=self.config.agent_retry_cap {
            match agent.propose_routine(ctx).await {
                Ok(routine) => return Ok(routine),
                Err(e) => {
                    warn!(
                        "Codegen agent attempt {}/{} failed: {}",
                        attempt, self.config.agent_retry_cap, e
                    );
                    last_error = e.to_string();
                    if attempt < self.config.agent_retry_cap {
                        tokio::time::sleep(self.config.retry_base_delay * attempt).await;
                    }
                }
            }
        }
        Err(CodegenError::AgentFailed(last_error))
    }
}

/// Pick a bounded, spread-out subset of fragments: always the first, then
/// evenly spaced through the rest, keeping document order.
fn sample_fragments(fragments: &[String], max: usize) -> Vec<String> {
    if fragments.len() <= max || max == 0 {
        return fragments.to_vec();
    }
    let step = fragments.len() as f64 / max as f64;
    let mut picked = Vec::with_capacity(max);
    let mut seen = BTreeSet::new();
    for i in 0..max {
        let idx = (i as f64 * step) as usize;
        if seen.insert(idx) {
            picked.push(fragments[idx].clone());
        }
    }
    picked
}

/// Report fields that carry no information across records: empty in every
/// record, or identical in every record when there is more than one.
fn quality_feedback(records: &[Record]) -> Vec<String> {
    let mut issues = Vec::new();
    if records.len() < 2 {
        return issues;
    }
    let all_keys: BTreeSet<&String> = records.iter().flat_map(|r| r.keys()).collect();
    for key in all_keys {
        let values: Vec<&str> = records
            .iter()
            .filter_map(|r| r.get(key).map(String::as_str))
            .collect();
        if values.iter().all(|v| v.trim().is_empty()) {
            issues.push(format!("field '{key}' is empty in every record"));
        } else if values.len() == records.len() && values.windows(2).all(|w| w[0] == w[1]) {
            issues.push(format!("field '{key}' is identical in every record"));
        }
    }
    issues
}
