//! Selector synthesis loop
//!
//! A plain state machine that repeatedly asks the reasoning agent for the
//! next action, executes it against the tool surface, and accumulates a
//! size-bounded history until a selector is finalized, abandoned, or the
//! loop fails. Cancellation is cooperative, checked at iteration boundaries,
//! and always yields the best-known candidate rather than an error.

use crate::agent::{AgentAction, HistoryEntry, ReasoningAgent, SelectionContext};
use crate::dom::DomSnapshot;
use crate::error::SelectionError;
use crate::tools::ToolSurface;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Lifecycle of a selector candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidateState {
    /// Proposed by the agent, not yet tested
    Proposed,
    /// Tested against the snapshot
    Tested,
    /// Finalized; at most one per session, requires match count ≥ 1
    Accepted,
    /// Tested and ruled out
    Rejected,
}

/// A selector under consideration, with its observed match evidence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectorCandidate {
    /// The selector string
    pub selector: String,
    /// Number of nodes it matched in the snapshot
    pub match_count: usize,
    /// Bounded sample of matched text
    pub samples: Vec<String>,
    /// Candidate lifecycle state
    pub state: CandidateState,
}

/// Selection session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Created, loop not yet started
    Idle,
    /// Loop in progress
    Running,
    /// Cancelled or abandoned
    Stopped,
    /// A selector was accepted
    Finalized,
    /// Budget exhausted or agent failure
    Failed,
}

/// Cooperative cancellation signal, checked at the top of each iteration.
/// An in-flight tool call is always allowed to finish first.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<AtomicBool>,
}

impl CancelToken {
    /// Create a new, unset token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.inner.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.inner.load(Ordering::SeqCst)
    }
}

/// Budgets and retry policy for one selection run.
#[derive(Debug, Clone)]
pub struct SelectionConfig {
    /// Maximum loop iterations before failing exhausted
    pub max_iterations: u32,
    /// Maximum history entries retained in context
    pub max_history_entries: usize,
    /// Maximum cumulative characters retained in context
    pub max_history_chars: usize,
    /// Cumulative character budget across the whole run; exceeding it fails
    /// the session even though old entries were evicted
    pub max_total_chars: usize,
    /// Agent error retries before the loop fails
    pub agent_retry_cap: u32,
    /// Base delay for agent retry backoff (doubles per attempt, with jitter)
    pub retry_base_delay: Duration,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            max_history_entries: 30,
            max_history_chars: 8_000,
            max_total_chars: 64_000,
            agent_retry_cap: 3,
            retry_base_delay: Duration::from_millis(250),
        }
    }
}

/// State owned exclusively by the loop driving it; inspectable after the
/// run ends.
#[derive(Debug, Clone)]
pub struct SelectionSession {
    /// Session id
    pub id: Uuid,
    /// Target page URL
    pub url: String,
    /// Natural-language goal
    pub goal: String,
    /// Bounded (action, result-summary) history
    pub history: VecDeque<HistoryEntry>,
    /// Current best candidate by match count (non-zero matches only)
    pub best_candidate: Option<SelectorCandidate>,
    /// Session lifecycle state
    pub status: SessionStatus,
    /// Iterations executed
    pub iterations: u32,
}

impl SelectionSession {
    fn new(url: &str, goal: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            url: url.to_string(),
            goal: goal.to_string(),
            history: VecDeque::new(),
            best_candidate: None,
            status: SessionStatus::Idle,
            iterations: 0,
        }
    }
}

/// Terminal outcome of a selection run.
#[derive(Debug)]
pub enum SelectionOutcome {
    /// A selector was accepted (match count ≥ 1)
    Finalized(SelectorCandidate),
    /// Cancelled or abandoned; carries the best non-zero-match candidate
    Stopped(Option<SelectorCandidate>),
    /// Budget exhausted or agent failure
    Failed(SelectionError),
}

/// The selection loop driver.
pub struct SelectionLoop {
    config: SelectionConfig,
}

impl Default for SelectionLoop {
    fn default() -> Self {
        Self::new(SelectionConfig::default())
    }
}

impl SelectionLoop {
    /// Create a loop with the given budgets.
    pub fn new(config: SelectionConfig) -> Self {
        Self { config }
    }

    /// Drive the agent to a finalized selector for `goal` against `snapshot`.
    ///
    /// Strictly sequential: no two agent actions execute concurrently within
    /// one session.
    #[instrument(skip(self, agent, snapshot, cancel), fields(goal = %goal))]
    pub async fn run(
        &self,
        agent: &dyn ReasoningAgent,
        snapshot: &DomSnapshot,
        goal: &str,
        cancel: &CancelToken,
    ) -> (SelectionOutcome, SelectionSession) {
        let tools = ToolSurface::new(snapshot);
        let mut session = SelectionSession::new(&snapshot.url, goal);
        session.status = SessionStatus::Running;
        let mut total_chars = 0usize;

        info!("Selection session {} started", session.id);

        for iteration in 1..=self.config.max_iterations {
            if cancel.is_cancelled() {
                info!("Selection session {} cancelled", session.id);
                session.status = SessionStatus::Stopped;
                return (
                    SelectionOutcome::Stopped(session.best_candidate.clone()),
                    session,
                );
            }
            session.iterations = iteration;

            let action = match self.next_action_with_retry(agent, &session, iteration).await {
                Ok(action) => action,
                Err(e) => {
                    warn!("Selection session {} failed: {}", session.id, e);
                    session.status = SessionStatus::Failed;
                    return (SelectionOutcome::Failed(e), session);
                }
            };
            debug!("Iteration {}: {} action", iteration, action.label());

            let summary = match &action {
                AgentAction::Query(selector) => match tools.query_selector(selector) {
                    Ok(result) => {
                        if result.count > 0 {
                            let candidate = SelectorCandidate {
                                selector: selector.clone(),
                                match_count: result.count,
                                samples: result.samples.iter().map(|s| s.text.clone()).collect(),
                                state: CandidateState::Tested,
                            };
                            let better = session
                                .best_candidate
                                .as_ref()
                                .map(|best| result.count > best.match_count)
                                .unwrap_or(true);
                            if better {
                                session.best_candidate = Some(candidate);
                            }
                        }
                        result.summary()
                    }
                    Err(e) => format!("query failed: {e}"),
                },
                AgentAction::Describe(locator) => match tools.describe_node(locator) {
                    Ok(summary) => summary.summary(),
                    Err(e) => format!("describe failed: {e}"),
                },
                AgentAction::Screenshot => {
                    let image = tools.capture_screenshot();
                    format!("{} screenshot, {} bytes", image.format, image.byte_len)
                }
                AgentAction::Finalize(selector) => match tools.finalize(selector) {
                    Ok(candidate) => {
                        info!(
                            "Selection session {} finalized '{}' ({} matches)",
                            session.id, candidate.selector, candidate.match_count
                        );
                        session.best_candidate = Some(candidate.clone());
                        session.status = SessionStatus::Finalized;
                        return (SelectionOutcome::Finalized(candidate), session);
                    }
                    // Rejected finalize leaves candidate and status untouched;
                    // the failure goes into history for the agent to see.
                    Err(e) => format!("finalize rejected: {e}"),
                },
                AgentAction::Abandon => {
                    info!("Selection session {} abandoned by agent", session.id);
                    session.status = SessionStatus::Stopped;
                    return (SelectionOutcome::Stopped(None), session);
                }
            };

            let entry = HistoryEntry { action, summary };
            total_chars += entry.cost();
            session.history.push_back(entry);
            self.evict_history(&mut session);

            if total_chars > self.config.max_total_chars {
                warn!(
                    "Selection session {} exceeded cumulative history budget",
                    session.id
                );
                session.status = SessionStatus::Failed;
                return (
                    SelectionOutcome::Failed(SelectionError::Exhausted {
                        iterations: iteration,
                    }),
                    session,
                );
            }
        }

        warn!(
            "Selection session {} exhausted after {} iterations",
            session.id, self.config.max_iterations
        );
        session.status = SessionStatus::Failed;
        let iterations = self.config.max_iterations;
        (
            SelectionOutcome::Failed(SelectionError::Exhausted { iterations }),
            session,
        )
    }

    /// Ask the agent for its next action, retrying transient failures with
    /// exponential backoff and jitter up to the configured cap.
    async fn next_action_with_retry(
        &self,
        agent: &dyn ReasoningAgent,
        session: &SelectionSession,
        iteration: u32,
    ) -> Result<AgentAction, SelectionError> {
        let history: Vec<HistoryEntry> = session.history.iter().cloned().collect();
        let mut last_error = String::new();

        for attempt in 1..=self.config.agent_retry_cap {
            let ctx = SelectionContext {
                url: &session.url,
                goal: &session.goal,
                best_candidate: session.best_candidate.as_ref(),
                history: &history,
                iteration,
            };
            match agent.next_action(&ctx).await {
                Ok(action) => return Ok(action),
                Err(e) => {
                    warn!("Agent attempt {}/{} failed: {}", attempt, self.config.agent_retry_cap, e);
                    last_error = e.to_string();
                    if attempt < self.config.agent_retry_cap {
                        tokio::time::sleep(self.backoff_delay(attempt)).await;
                    }
                }
            }
        }

        Err(SelectionError::AgentFailed {
            attempts: self.config.agent_retry_cap,
            last_error,
        })
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.config.retry_base_delay.as_millis() as u64;
        let backoff = base.saturating_mul(1u64 << (attempt - 1).min(8));
        let jitter = rand::rng().random_range(0..=base.max(1) / 2);
        Duration::from_millis(backoff + jitter)
    }

    /// Evict oldest entries once count or character budget is exceeded.
    fn evict_history(&self, session: &mut SelectionSession) {
        while session.history.len() > self.config.max_history_entries {
            session.history.pop_front();
        }
        let mut chars: usize = session.history.iter().map(HistoryEntry::cost).sum();
        while chars > self.config.max_history_chars && session.history.len() > 1 {
            if let Some(evicted) = session.history.pop_front() {
                chars -= evicted.cost();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_token() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_history_eviction_by_count() {
        let looper = SelectionLoop::new(SelectionConfig {
            max_history_entries: 3,
            ..SelectionConfig::default()
        });
        let mut session = SelectionSession::new("https://example.com", "goal");
        for i in 0..5 {
            session.history.push_back(HistoryEntry {
                action: AgentAction::Screenshot,
                summary: format!("entry {i}"),
            });
        }
        looper.evict_history(&mut session);
        assert_eq!(session.history.len(), 3);
        assert_eq!(session.history.front().unwrap().summary, "entry 2");
    }

    #[test]
    fn test_history_eviction_by_chars() {
        let looper = SelectionLoop::new(SelectionConfig {
            max_history_entries: 100,
            max_history_chars: 120,
            ..SelectionConfig::default()
        });
        let mut session = SelectionSession::new("https://example.com", "goal");
        for _ in 0..10 {
            session.history.push_back(HistoryEntry {
                action: AgentAction::Screenshot,
                summary: "x".repeat(40),
            });
        }
        looper.evict_history(&mut session);
        let total: usize = session.history.iter().map(HistoryEntry::cost).sum();
        assert!(total <= 120 || session.history.len() == 1);
    }

    #[test]
    fn test_backoff_grows() {
        let looper = SelectionLoop::new(SelectionConfig {
            retry_base_delay: Duration::from_millis(100),
            ..SelectionConfig::default()
        });
        let first = looper.backoff_delay(1);
        let third = looper.backoff_delay(3);
        assert!(first >= Duration::from_millis(100));
        assert!(third >= Duration::from_millis(400));
    }
}
