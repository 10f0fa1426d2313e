//! Reasoning-collaborator boundary
//!
//! The inference provider is external to this crate and appears only as the
//! [`ReasoningAgent`] trait: given bounded context, propose the next action
//! (selection) or an extraction routine (codegen). Actions form a closed
//! enum; the loops are plain state machines switching on the variant, with no
//! dynamic tool dispatch.

use crate::error::AgentError;
use crate::routine::{ExtractionRoutine, Record};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One of the finite actions an agent may take during selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", content = "arg", rename_all = "snake_case")]
pub enum AgentAction {
    /// Test a CSS selector against the snapshot
    Query(String),
    /// Inspect one node by its structural locator
    Describe(String),
    /// Look at the rendered page
    Screenshot,
    /// Commit to a selector and end the loop
    Finalize(String),
    /// Give up without a selector
    Abandon,
}

impl AgentAction {
    /// Short label used in history entries and logs.
    pub fn label(&self) -> &'static str {
        match self {
            AgentAction::Query(_) => "query",
            AgentAction::Describe(_) => "describe",
            AgentAction::Screenshot => "screenshot",
            AgentAction::Finalize(_) => "finalize",
            AgentAction::Abandon => "abandon",
        }
    }
}

/// One (action, result-summary) pair kept in the bounded loop history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// The action that was executed
    pub action: AgentAction,
    /// Truncated summary of its result
    pub summary: String,
}

impl HistoryEntry {
    /// Approximate size used against the cumulative history budget.
    pub fn cost(&self) -> usize {
        self.summary.chars().count() + 32
    }
}

/// Context handed to the agent on each selection iteration.
///
/// History and candidate samples are already truncated by the loop; the
/// agent never sees unbounded document content.
#[derive(Debug, Clone, Serialize)]
pub struct SelectionContext<'a> {
    /// Page URL the snapshot came from
    pub url: &'a str,
    /// Natural-language goal
    pub goal: &'a str,
    /// Current best candidate selector, if any
    pub best_candidate: Option<&'a crate::selection::SelectorCandidate>,
    /// Bounded history of prior actions and their results
    pub history: &'a [HistoryEntry],
    /// Iteration number, starting at 1
    pub iteration: u32,
}

/// Context handed to the agent on each codegen iteration.
#[derive(Debug, Clone, Serialize)]
pub struct CodegenContext<'a> {
    /// The accepted selector the routine must work against
    pub selector: &'a str,
    /// Outer-HTML fragments of sampled matched nodes
    pub samples: &'a [String],
    /// Attempt number, starting at 1
    pub attempt: u32,
    /// Self-test feedback from the previous attempt, if any
    pub feedback: Option<&'a str>,
    /// Records the previous attempt produced, for refinement
    pub previous_records: &'a [Record],
}

/// The single capability the external reasoning provider exposes.
#[async_trait]
pub trait ReasoningAgent: Send + Sync {
    /// Propose the next selection action given bounded context.
    async fn next_action(&self, ctx: &SelectionContext<'_>) -> Result<AgentAction, AgentError>;

    /// Propose (or revise) an extraction routine for the matched samples.
    async fn propose_routine(
        &self,
        ctx: &CodegenContext<'_>,
    ) -> Result<ExtractionRoutine, AgentError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_serde_shape() {
        let action = AgentAction::Query(".post".to_string());
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["action"], "query");
        assert_eq!(json["arg"], ".post");

        let screenshot = serde_json::to_value(AgentAction::Screenshot).unwrap();
        assert_eq!(screenshot["action"], "screenshot");
    }

    #[test]
    fn test_action_round_trip() {
        for action in [
            AgentAction::Query("div".into()),
            AgentAction::Describe("html > body:nth-of-type(1)".into()),
            AgentAction::Screenshot,
            AgentAction::Finalize("article".into()),
            AgentAction::Abandon,
        ] {
            let json = serde_json::to_string(&action).unwrap();
            let back: AgentAction = serde_json::from_str(&json).unwrap();
            assert_eq!(back, action);
        }
    }

    #[test]
    fn test_action_labels() {
        assert_eq!(AgentAction::Query("div".into()).label(), "query");
        assert_eq!(AgentAction::Describe("html".into()).label(), "describe");
        assert_eq!(AgentAction::Screenshot.label(), "screenshot");
        assert_eq!(AgentAction::Finalize("div".into()).label(), "finalize");
        assert_eq!(AgentAction::Abandon.label(), "abandon");
    }

    #[test]
    fn test_history_entry_cost_counts_summary() {
        let entry = HistoryEntry {
            action: AgentAction::Screenshot,
            summary: "png 120x80".to_string(),
        };
        assert!(entry.cost() > "png 120x80".len());
    }
}
