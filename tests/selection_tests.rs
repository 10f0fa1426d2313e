//! Selection and codegen loop tests with a scripted agent
//!
//! The agent here replays a fixed script of actions, which makes every loop
//! outcome deterministic and lets the tests drive the full pipeline from
//! snapshot to registered parser without any inference provider.

use async_trait::async_trait;
use parsekit::agent::{AgentAction, CodegenContext, ReasoningAgent, SelectionContext};
use parsekit::codegen::CodegenLoop;
use parsekit::dom::DomSnapshot;
use parsekit::error::{AgentError, SelectionError};
use parsekit::registry::ParserRegistry;
use parsekit::routine::{ExtractionRoutine, FieldRule};
use parsekit::selection::{CancelToken, SelectionConfig, SelectionLoop, SelectionOutcome};
use pretty_assertions::assert_eq;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

const PAGE: &str = r#"
    <html><body>
        <nav><a href="/">Home</a></nav>
        <main>
            <div class="post">
                <h2 class="title">First post</h2>
                <span class="author">alice</span>
            </div>
            <div class="post">
                <h2 class="title">Second post</h2>
                <span class="author">bob</span>
            </div>
            <div class="post">
                <h2 class="title">Third post</h2>
                <span class="author">carol</span>
            </div>
        </main>
        <footer>© example</footer>
    </body></html>
"#;

/// Replays a fixed action script; proposes a fixed routine during codegen.
struct ScriptedAgent {
    actions: Mutex<VecDeque<AgentAction>>,
    routine: ExtractionRoutine,
}

impl ScriptedAgent {
    fn new(actions: Vec<AgentAction>) -> Self {
        Self {
            actions: Mutex::new(actions.into()),
            routine: ExtractionRoutine::new()
                .with_field("title", FieldRule::text("h2.title"))
                .with_field("author", FieldRule::text("span.author")),
        }
    }
}

#[async_trait]
impl ReasoningAgent for ScriptedAgent {
    async fn next_action(&self, _ctx: &SelectionContext<'_>) -> Result<AgentAction, AgentError> {
        self.actions
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| AgentError::Unreachable("script exhausted".to_string()))
    }

    async fn propose_routine(
        &self,
        _ctx: &CodegenContext<'_>,
    ) -> Result<ExtractionRoutine, AgentError> {
        Ok(self.routine.clone())
    }
}

/// Queries once, then requests cancellation from outside the loop while
/// continuing to act, mimicking a user stopping a session that already
/// found matches.
struct CancelAfterQueryAgent {
    cancel: CancelToken,
    calls: AtomicU32,
}

#[async_trait]
impl ReasoningAgent for CancelAfterQueryAgent {
    async fn next_action(&self, _ctx: &SelectionContext<'_>) -> Result<AgentAction, AgentError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            Ok(AgentAction::Query("div.post".to_string()))
        } else {
            self.cancel.cancel();
            Ok(AgentAction::Screenshot)
        }
    }

    async fn propose_routine(
        &self,
        _ctx: &CodegenContext<'_>,
    ) -> Result<ExtractionRoutine, AgentError> {
        Err(AgentError::Unreachable("not used".to_string()))
    }
}

/// Always fails, for retry-cap coverage.
struct DownAgent;

#[async_trait]
impl ReasoningAgent for DownAgent {
    async fn next_action(&self, _ctx: &SelectionContext<'_>) -> Result<AgentAction, AgentError> {
        Err(AgentError::Unreachable("connection refused".to_string()))
    }

    async fn propose_routine(
        &self,
        _ctx: &CodegenContext<'_>,
    ) -> Result<ExtractionRoutine, AgentError> {
        Err(AgentError::Unreachable("connection refused".to_string()))
    }
}

fn snapshot() -> DomSnapshot {
    DomSnapshot::from_html(PAGE, "https://forum.example.com/threads")
}

fn fast_config() -> SelectionConfig {
    SelectionConfig {
        retry_base_delay: Duration::from_millis(1),
        ..SelectionConfig::default()
    }
}

#[tokio::test]
async fn test_finalize_after_exploration() {
    let agent = ScriptedAgent::new(vec![
        AgentAction::Query("div.nothing".to_string()),
        AgentAction::Query("div.post".to_string()),
        AgentAction::Screenshot,
        AgentAction::Finalize("div.post".to_string()),
    ]);
    let snapshot = snapshot();
    let (outcome, session) = SelectionLoop::new(fast_config())
        .run(&agent, &snapshot, "extract forum posts", &CancelToken::new())
        .await;

    let candidate = match outcome {
        SelectionOutcome::Finalized(c) => c,
        other => panic!("expected finalized, got {other:?}"),
    };
    assert_eq!(candidate.selector, "div.post");
    assert_eq!(candidate.match_count, 3);
    assert_eq!(session.iterations, 4);
}

#[tokio::test]
async fn test_finalize_zero_match_is_rejected_not_fatal() {
    let agent = ScriptedAgent::new(vec![
        AgentAction::Finalize("div.missing".to_string()),
        AgentAction::Query("div.post".to_string()),
        AgentAction::Finalize("div.post".to_string()),
    ]);
    let snapshot = snapshot();
    let (outcome, session) = SelectionLoop::new(fast_config())
        .run(&agent, &snapshot, "extract forum posts", &CancelToken::new())
        .await;

    match outcome {
        SelectionOutcome::Finalized(c) => assert_eq!(c.match_count, 3),
        other => panic!("expected finalized, got {other:?}"),
    }
    // The rejected finalize shows up in history as feedback to the agent.
    assert!(session
        .history
        .iter()
        .any(|e| e.summary.contains("finalize rejected")));
}

#[tokio::test]
async fn test_abandon_stops_without_candidate() {
    let agent = ScriptedAgent::new(vec![
        AgentAction::Query("div.post".to_string()),
        AgentAction::Abandon,
    ]);
    let snapshot = snapshot();
    let (outcome, _) = SelectionLoop::new(fast_config())
        .run(&agent, &snapshot, "extract forum posts", &CancelToken::new())
        .await;

    match outcome {
        SelectionOutcome::Stopped(candidate) => assert!(candidate.is_none()),
        other => panic!("expected stopped, got {other:?}"),
    }
}

#[tokio::test]
async fn test_cancellation_yields_best_candidate() {
    let agent = ScriptedAgent::new(vec![
        AgentAction::Query("div.post".to_string()),
        AgentAction::Screenshot,
        AgentAction::Screenshot,
    ]);
    let snapshot = snapshot();
    let cancel = CancelToken::new();
    cancel.cancel();

    let (outcome, session) = SelectionLoop::new(fast_config())
        .run(&agent, &snapshot, "extract forum posts", &cancel)
        .await;

    // Pre-cancelled: no iteration ran, best candidate is whatever was known
    // (nothing here), and the outcome is a stop rather than an error.
    match outcome {
        SelectionOutcome::Stopped(candidate) => {
            if let Some(c) = candidate {
                assert!(c.match_count >= 1);
            }
        }
        other => panic!("expected stopped, got {other:?}"),
    }
    assert_eq!(session.iterations, 0);
}

#[tokio::test]
async fn test_cancellation_mid_run_carries_best_candidate() {
    let cancel = CancelToken::new();
    let agent = CancelAfterQueryAgent {
        cancel: cancel.clone(),
        calls: AtomicU32::new(0),
    };
    let snapshot = snapshot();

    let (outcome, session) = SelectionLoop::new(fast_config())
        .run(&agent, &snapshot, "extract forum posts", &cancel)
        .await;

    // Iteration 1 queried, iteration 2 cancelled; the loop notices at the
    // top of iteration 3 and hands back the matched candidate, not an error.
    let candidate = match outcome {
        SelectionOutcome::Stopped(Some(c)) => c,
        other => panic!("expected stopped with candidate, got {other:?}"),
    };
    assert_eq!(candidate.selector, "div.post");
    assert_eq!(candidate.match_count, 3);
    assert_eq!(session.iterations, 2);
}

#[tokio::test]
async fn test_iteration_exhaustion_fails() {
    let actions = vec![AgentAction::Screenshot; 5];
    let agent = ScriptedAgent::new(actions);
    let snapshot = snapshot();
    let config = SelectionConfig {
        max_iterations: 5,
        ..fast_config()
    };
    let (outcome, _) = SelectionLoop::new(config)
        .run(&agent, &snapshot, "extract forum posts", &CancelToken::new())
        .await;

    match outcome {
        SelectionOutcome::Failed(SelectionError::Exhausted { iterations }) => {
            assert_eq!(iterations, 5)
        }
        other => panic!("expected exhausted, got {other:?}"),
    }
}

#[tokio::test]
async fn test_agent_retry_cap_fails_session() {
    let snapshot = snapshot();
    let (outcome, session) = SelectionLoop::new(fast_config())
        .run(&DownAgent, &snapshot, "extract forum posts", &CancelToken::new())
        .await;

    match outcome {
        SelectionOutcome::Failed(SelectionError::AgentFailed { attempts, last_error }) => {
            assert_eq!(attempts, 3);
            assert!(last_error.contains("connection refused"));
        }
        other => panic!("expected agent failure, got {other:?}"),
    }
    assert_eq!(session.iterations, 1);
}

#[tokio::test]
async fn test_full_pipeline_selector_to_records() {
    let agent = ScriptedAgent::new(vec![
        AgentAction::Query("div.post".to_string()),
        AgentAction::Finalize("div.post".to_string()),
    ]);
    let snapshot = snapshot();

    let (outcome, _) = SelectionLoop::new(fast_config())
        .run(&agent, &snapshot, "extract forum posts", &CancelToken::new())
        .await;
    let candidate = match outcome {
        SelectionOutcome::Finalized(c) => c,
        other => panic!("expected finalized, got {other:?}"),
    };

    let generated = CodegenLoop::default()
        .run(&agent, &candidate, &snapshot)
        .await
        .unwrap();
    assert_eq!(generated.selector, "div.post");
    assert!(!generated.records.is_empty());

    let registry = ParserRegistry::in_memory();
    registry
        .register(generated.into_definition("forum.example.com", None))
        .unwrap();

    let records = parsekit::parse(&registry, "https://forum.example.com/threads", PAGE);
    assert_eq!(records.len(), 3);
    assert_eq!(records[0]["title"], "First post");
    assert_eq!(records[0]["author"], "alice");
    assert_eq!(records[2]["author"], "carol");
}
