//! Seed end-to-end scenarios for the Stream Orchestrator: cold start with no context,
//! multi-round tool use, and the tool-call budget guard.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hearth_core::orchestrator::OrchestratorEvent;
use hearth_core::provider::{FrameStream, Provider, ProviderError, StreamFrame};
use hearth_core::retrieval::{Embedder, RetrievalError, RetrievalIndex};
use hearth_core::store::RuleContextSource;
use hearth_core::tool_source::ToolSpec;
use hearth_core::export::ArtifactDeriver;
use hearth_core::{ChatMessage, EndReason, ModelRegistry, Orchestrator, OrchestratorLimits, Store, ToolRegistry};

/// Embeds nothing meaningfully; the orchestrator tests don't exercise real
/// similarity ranking, only that retrieval participates in the event grammar.
struct NullEmbedder;

#[async_trait]
impl Embedder for NullEmbedder {
    async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RetrievalError> {
        Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
    }

    fn model_id(&self) -> &str {
        "null-embedder"
    }
}

/// A scripted provider: each call to `stream_chat` consumes the next round's fixed
/// sequence of frames, so a test can assert on exact multi-round behavior without a
/// real LLM endpoint.
struct ScriptedProvider {
    rounds: Vec<Vec<StreamFrame>>,
    next_round: AtomicUsize,
}

impl ScriptedProvider {
    fn new(rounds: Vec<Vec<StreamFrame>>) -> Self {
        Self {
            rounds,
            next_round: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    async fn list_models(&self) -> Result<Vec<String>, ProviderError> {
        Ok(vec!["stub-model".into()])
    }

    async fn stream_chat(
        &self,
        _messages: &[ChatMessage],
        _tools: &[ToolSpec],
        _model_id: &str,
    ) -> Result<FrameStream, ProviderError> {
        let idx = self.next_round.fetch_add(1, Ordering::SeqCst);
        let frames = self.rounds.get(idx).cloned().unwrap_or_default();
        Ok(Box::pin(tokio_stream::iter(frames)))
    }
}

async fn harness(
    rounds: Vec<Vec<StreamFrame>>,
) -> (tempfile::TempDir, Arc<Orchestrator>) {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path().join("app.db")).unwrap();
    let retrieval = Arc::new(RetrievalIndex::new(
        store.clone(),
        Arc::new(NullEmbedder),
        dir.path().join("rag_cache"),
    ));
    let repo_root = dir.path().join("repo");
    std::fs::create_dir_all(&repo_root).unwrap();
    let provider: Arc<dyn Provider> = Arc::new(ScriptedProvider::new(rounds));
    let models = Arc::new(ModelRegistry::new(store.clone(), "stub-model".into()));
    let deriver = Arc::new(ArtifactDeriver::new(store.clone(), provider.clone(), models.clone()));
    let tools = Arc::new(ToolRegistry::new(store.clone(), repo_root, deriver));
    let orchestrator = Arc::new(Orchestrator::new(
        store,
        retrieval,
        tools,
        provider,
        models,
        OrchestratorLimits {
            max_tool_rounds: 4,
            max_total_tool_calls: 15,
            tool_call_timeout: Duration::from_secs(5),
            ..OrchestratorLimits::default()
        },
    ));
    (dir, orchestrator)
}

async fn drain(orchestrator: &Arc<Orchestrator>, session_id: &str, input: &str) -> Vec<OrchestratorEvent> {
    let mut rx = orchestrator.clone().run_turn(session_id.to_string(), input.to_string());
    let mut events = Vec::new();
    while let Some(e) = rx.recv().await {
        events.push(e);
    }
    events
}

fn event_kind(e: &OrchestratorEvent) -> &'static str {
    match e {
        OrchestratorEvent::SessionInfo { .. } => "session_info",
        OrchestratorEvent::RuleChunks { .. } => "rule_chunks",
        OrchestratorEvent::Thinking(_) => "thinking",
        OrchestratorEvent::ToolCalls(_) => "tool_calls",
        OrchestratorEvent::Token(_) => "token",
        OrchestratorEvent::End { .. } => "end",
    }
}

/// Scenario 1 (spec seed scenarios, "Cold start, no context"): `session_info`,
/// `rule_chunks{[]}`, `token*`, `end{complete}`, with the user and assistant
/// messages both landing in the store.
#[tokio::test]
async fn cold_start_with_no_context_matches_grammar() {
    let (_dir, orchestrator) = harness(vec![vec![
        StreamFrame::ContentDelta("hi there".into()),
        StreamFrame::Done,
    ]])
    .await;

    let events = drain(&orchestrator, "s1", "hello").await;
    let kinds: Vec<&str> = events.iter().map(event_kind).collect();
    assert_eq!(kinds, vec!["session_info", "rule_chunks", "token", "end"]);
    assert!(matches!(
        events.last().unwrap(),
        OrchestratorEvent::End { reason: EndReason::Done }
    ));

    let store = Store::open(_dir.path().join("app.db")).unwrap();
    let messages = store.list_messages("s1", None, None).await.unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].content, "hello");
    assert_eq!(messages[1].content, "hi there");
}

/// Scenario 3 ("Multi-round tool use"): a provider that first calls `add_todo` then
/// produces content emits exactly one `tool_calls` frame, the store gains a task,
/// and the final content is non-empty.
#[tokio::test]
async fn multi_round_tool_use_executes_once_and_persists_task() {
    let (_dir, orchestrator) = harness(vec![
        vec![
            StreamFrame::ToolCallDelta {
                call_index: 0,
                id: Some("call-1".into()),
                name: Some("add_todo".into()),
                arguments_delta: r#"{"item":"design schema"}"#.into(),
            },
            StreamFrame::Done,
        ],
        vec![
            StreamFrame::ContentDelta("done, added the task".into()),
            StreamFrame::Done,
        ],
    ])
    .await;

    let events = drain(&orchestrator, "s2", "please plan").await;
    let tool_call_frames = events
        .iter()
        .filter(|e| matches!(e, OrchestratorEvent::ToolCalls(_)))
        .count();
    assert_eq!(tool_call_frames, 1);

    let store = Store::open(_dir.path().join("app.db")).unwrap();
    let tasks = store.list_tasks(Some("s2".to_string())).await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].item, "design schema");

    let messages = store.list_messages("s2", None, None).await.unwrap();
    let assistant_text = &messages.last().unwrap().content;
    assert!(!assistant_text.is_empty());
}

/// An id the provider repeats across rounds must never be executed twice, even
/// though the orchestrator re-announces a round's results before execution.
#[tokio::test]
async fn repeated_tool_call_id_executes_only_once() {
    let (_dir, orchestrator) = harness(vec![
        vec![
            StreamFrame::ToolCallDelta {
                call_index: 0,
                id: Some("call-1".into()),
                name: Some("add_todo".into()),
                arguments_delta: r#"{"item":"a"}"#.into(),
            },
            StreamFrame::Done,
        ],
        vec![
            StreamFrame::ToolCallDelta {
                call_index: 0,
                id: Some("call-1".into()),
                name: Some("add_todo".into()),
                arguments_delta: r#"{"item":"a"}"#.into(),
            },
            StreamFrame::Done,
        ],
        vec![StreamFrame::ContentDelta("ok".into()), StreamFrame::Done],
    ])
    .await;

    drain(&orchestrator, "s3", "do it twice?").await;

    let store = Store::open(_dir.path().join("app.db")).unwrap();
    let tasks = store.list_tasks(Some("s3".to_string())).await.unwrap();
    assert_eq!(tasks.len(), 1);
}

/// A provider reporting `done` with an announced tool call whose arguments never
/// completed into valid JSON rejects the turn with `end{reason:error}` instead of
/// running the handler with truncated input.
#[tokio::test]
async fn incomplete_tool_call_arguments_reject_the_turn() {
    let (_dir, orchestrator) = harness(vec![vec![
        StreamFrame::ToolCallDelta {
            call_index: 0,
            id: Some("call-1".into()),
            name: Some("add_todo".into()),
            arguments_delta: r#"{"item": "unterminated"#.into(),
        },
        StreamFrame::Done,
    ]])
    .await;

    let events = drain(&orchestrator, "s4", "go").await;
    assert!(matches!(
        events.last().unwrap(),
        OrchestratorEvent::End { reason: EndReason::Error(_) }
    ));

    let store = Store::open(_dir.path().join("app.db")).unwrap();
    let tasks = store.list_tasks(Some("s4".to_string())).await.unwrap();
    assert!(tasks.is_empty());
}

/// Exceeding `max_total_tool_calls` stops further execution, emits the budget token,
/// and ends the turn with `max_rounds` rather than looping forever.
#[tokio::test]
async fn tool_call_budget_exhaustion_ends_turn_with_max_rounds() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path().join("app.db")).unwrap();
    let retrieval = Arc::new(RetrievalIndex::new(
        store.clone(),
        Arc::new(NullEmbedder),
        dir.path().join("rag_cache"),
    ));
    let repo_root = dir.path().join("repo");
    std::fs::create_dir_all(&repo_root).unwrap();

    // Every round announces a fresh tool-call id so none gets deduped away; the
    // budget of 1 must stop execution well before the round cap of 4.
    let rounds: Vec<Vec<StreamFrame>> = (0..4)
        .map(|i| {
            vec![
                StreamFrame::ToolCallDelta {
                    call_index: 0,
                    id: Some(format!("call-{i}")),
                    name: Some("add_todo".into()),
                    arguments_delta: format!(r#"{{"item":"item-{i}"}}"#),
                },
                StreamFrame::Done,
            ]
        })
        .collect();
    let provider: Arc<dyn Provider> = Arc::new(ScriptedProvider::new(rounds));
    let models = Arc::new(ModelRegistry::new(store.clone(), "stub-model".into()));
    let deriver = Arc::new(ArtifactDeriver::new(store.clone(), provider.clone(), models.clone()));
    let tools = Arc::new(ToolRegistry::new(store.clone(), repo_root, deriver));
    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        retrieval,
        tools,
        provider,
        models,
        OrchestratorLimits {
            max_tool_rounds: 4,
            max_total_tool_calls: 1,
            tool_call_timeout: Duration::from_secs(5),
            ..OrchestratorLimits::default()
        },
    ));

    let events = drain(&orchestrator, "s5", "spam tool calls").await;
    assert!(matches!(
        events.last().unwrap(),
        OrchestratorEvent::End { reason: EndReason::MaxRounds }
    ));

    let tasks = store.list_tasks(Some("s5".to_string())).await.unwrap();
    assert_eq!(tasks.len(), 1);
}

/// Two turns on the same session are serialized: the second does not start until
/// the first has emitted `end`, so their persisted messages never interleave.
#[tokio::test]
async fn concurrent_turns_on_same_session_do_not_interleave() {
    let (_dir, orchestrator) = harness(vec![
        vec![StreamFrame::ContentDelta("first".into()), StreamFrame::Done],
        vec![StreamFrame::ContentDelta("second".into()), StreamFrame::Done],
    ])
    .await;

    let o1 = orchestrator.clone();
    let o2 = orchestrator.clone();
    let t1 = tokio::spawn(async move { drain(&o1, "shared", "one").await });
    let t2 = tokio::spawn(async move { drain(&o2, "shared", "two").await });
    let (_r1, _r2) = tokio::join!(t1, t2);

    let store = Store::open(_dir.path().join("app.db")).unwrap();
    let messages = store.list_messages("shared", None, None).await.unwrap();
    // Two user turns, two assistant replies; whichever ran first, each user message
    // is immediately followed by its own assistant reply, never interleaved.
    assert_eq!(messages.len(), 4);
    assert_eq!(messages[0].role, hearth_core::store::Role::User);
    assert_eq!(messages[1].role, hearth_core::store::Role::Assistant);
    assert_eq!(messages[2].role, hearth_core::store::Role::User);
    assert_eq!(messages[3].role, hearth_core::store::Role::Assistant);
}

/// Exercises the ingestor -> retrieval path end to end (spec seed scenario 2,
/// "Context ingest + retrieval"): once rule context is active for a session, the
/// orchestrator's `rule_chunks` event surfaces the ingested text.
#[tokio::test]
async fn ingested_context_surfaces_in_rule_chunks() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path().join("app.db")).unwrap();
    store
        .insert_rule_context(
            Some("s6".into()),
            RuleContextSource::Text,
            "Teams may have up to 4 members.\n\nDeadline is March 15.",
            None,
        )
        .await
        .unwrap();

    let retrieval = Arc::new(RetrievalIndex::new(
        store.clone(),
        Arc::new(NullEmbedder),
        dir.path().join("rag_cache"),
    ));
    let repo_root = dir.path().join("repo");
    std::fs::create_dir_all(&repo_root).unwrap();
    let provider: Arc<dyn Provider> = Arc::new(ScriptedProvider::new(vec![vec![
        StreamFrame::ContentDelta("ok".into()),
        StreamFrame::Done,
    ]]));
    let models = Arc::new(ModelRegistry::new(store.clone(), "stub-model".into()));
    let deriver = Arc::new(ArtifactDeriver::new(store.clone(), provider.clone(), models.clone()));
    let tools = Arc::new(ToolRegistry::new(store.clone(), repo_root, deriver));
    let orchestrator = Arc::new(Orchestrator::new(
        store,
        retrieval,
        tools,
        provider,
        models,
        OrchestratorLimits {
            max_tool_rounds: 4,
            max_total_tool_calls: 15,
            tool_call_timeout: Duration::from_secs(5),
            ..OrchestratorLimits::default()
        },
    ));

    let events = drain(&orchestrator, "s6", "team size?").await;
    let rule_chunks = events
        .iter()
        .find_map(|e| match e {
            OrchestratorEvent::RuleChunks { chunks } => Some(chunks),
            _ => None,
        })
        .unwrap();
    assert!(rule_chunks.iter().any(|c| c.text.contains("4 members")));
}

/// A provider whose stream never produces a frame, standing in for an upstream that
/// hangs mid-turn.
struct StallingProvider;

#[async_trait]
impl Provider for StallingProvider {
    async fn list_models(&self) -> Result<Vec<String>, ProviderError> {
        Ok(vec!["stub-model".into()])
    }

    async fn stream_chat(
        &self,
        _messages: &[ChatMessage],
        _tools: &[ToolSpec],
        _model_id: &str,
    ) -> Result<FrameStream, ProviderError> {
        Ok(Box::pin(futures_util::stream::pending()))
    }
}

#[tokio::test]
async fn turn_exceeding_the_hard_wall_clock_limit_ends_with_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path().join("app.db")).unwrap();
    let retrieval = Arc::new(RetrievalIndex::new(
        store.clone(),
        Arc::new(NullEmbedder),
        dir.path().join("rag_cache"),
    ));
    let repo_root = dir.path().join("repo");
    std::fs::create_dir_all(&repo_root).unwrap();
    let provider: Arc<dyn Provider> = Arc::new(StallingProvider);
    let models = Arc::new(ModelRegistry::new(store.clone(), "stub-model".into()));
    let deriver = Arc::new(ArtifactDeriver::new(store.clone(), provider.clone(), models.clone()));
    let tools = Arc::new(ToolRegistry::new(store.clone(), repo_root, deriver));
    let orchestrator = Arc::new(Orchestrator::new(
        store,
        retrieval,
        tools,
        provider,
        models,
        OrchestratorLimits {
            max_tool_rounds: 4,
            max_total_tool_calls: 15,
            tool_call_timeout: Duration::from_secs(30),
            turn_timeout: Duration::from_millis(50),
        },
    ));

    let events = drain(&orchestrator, "s7", "hello").await;
    assert!(matches!(
        events.last().unwrap(),
        OrchestratorEvent::End { reason: EndReason::Error(_) }
    ));
}

/// A provider that keeps announcing tool calls through every normal round AND the
/// forced final content-only round never gets a `Done`: the turn must end with
/// `max_rounds` rather than silently persisting as `complete`.
#[tokio::test]
async fn round_count_exhaustion_through_forced_round_ends_turn_with_max_rounds() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path().join("app.db")).unwrap();
    let retrieval = Arc::new(RetrievalIndex::new(
        store.clone(),
        Arc::new(NullEmbedder),
        dir.path().join("rag_cache"),
    ));
    let repo_root = dir.path().join("repo");
    std::fs::create_dir_all(&repo_root).unwrap();

    // 4 normal rounds plus 1 forced content-only round: every one of them still
    // announces a fresh tool-call id, so the forced round never sees a bare
    // content-only response either.
    let rounds: Vec<Vec<StreamFrame>> = (0..5)
        .map(|i| {
            vec![
                StreamFrame::ToolCallDelta {
                    call_index: 0,
                    id: Some(format!("call-{i}")),
                    name: Some("add_todo".into()),
                    arguments_delta: format!(r#"{{"item":"item-{i}"}}"#),
                },
                StreamFrame::Done,
            ]
        })
        .collect();
    let provider: Arc<dyn Provider> = Arc::new(ScriptedProvider::new(rounds));
    let models = Arc::new(ModelRegistry::new(store.clone(), "stub-model".into()));
    let deriver = Arc::new(ArtifactDeriver::new(store.clone(), provider.clone(), models.clone()));
    let tools = Arc::new(ToolRegistry::new(store.clone(), repo_root, deriver));
    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        retrieval,
        tools,
        provider,
        models,
        OrchestratorLimits {
            max_tool_rounds: 4,
            max_total_tool_calls: 100,
            tool_call_timeout: Duration::from_secs(5),
            ..OrchestratorLimits::default()
        },
    ));

    let events = drain(&orchestrator, "s8", "keep calling tools forever").await;
    assert!(matches!(
        events.last().unwrap(),
        OrchestratorEvent::End { reason: EndReason::MaxRounds }
    ));

    // Only the 4 normal rounds' calls executed; the forced round offered no tool
    // schemas, so its announced call never ran.
    let tasks = store.list_tasks(Some("s8".to_string())).await.unwrap();
    assert_eq!(tasks.len(), 4);
}

