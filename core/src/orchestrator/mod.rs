//! Stream Orchestrator (C5): drives one assistant turn end-to-end — builds the
//! prompt from history plus retrieved rule chunks, streams the provider's response,
//! runs any announced tool calls in bounded rounds, and persists the final message.
//! Events are pushed onto an `mpsc` channel in the teacher's "writer feeding a
//! channel" shape (see `loom`'s `StreamWriter`), but the grammar here is fixed and
//! linear rather than mode-gated: `session_info, rule_chunks, (thinking|tool_calls)*,
//! token*, end`.

mod event;
mod prompt;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};

pub use event::{EndReason, OrchestratorEvent, RuleChunkSummary, ToolCallRecord};

use crate::message::ChatMessage;
use crate::provider::{ModelRegistry, Provider, StreamFrame};
use crate::retrieval::RetrievalIndex;
use crate::store::{Role, Store};
use crate::tool_source::{ToolCallContext, ToolRegistry, ToolSpec};

pub struct OrchestratorLimits {
    pub max_tool_rounds: u32,
    pub max_total_tool_calls: u32,
    pub tool_call_timeout: Duration,
    /// Hard ceiling on one turn's whole run (provider streaming plus every tool
    /// round), independent of `tool_call_timeout`. Defaults to 10 minutes per the
    /// concurrency model; not separately configurable via environment.
    pub turn_timeout: Duration,
}

impl Default for OrchestratorLimits {
    fn default() -> Self {
        Self {
            max_tool_rounds: 4,
            max_total_tool_calls: 15,
            tool_call_timeout: Duration::from_secs(30),
            turn_timeout: Duration::from_secs(600),
        }
    }
}

pub struct Orchestrator {
    store: Store,
    retrieval: Arc<RetrievalIndex>,
    tools: Arc<ToolRegistry>,
    provider: Arc<dyn Provider>,
    models: Arc<ModelRegistry>,
    limits: OrchestratorLimits,
    turn_locks: DashMap<String, Arc<Mutex<()>>>,
}

/// Accumulates `ToolCallDelta` frames by the adapter's `call_index` within the
/// current round. The provider adapter already hands us each call whole (name and
/// complete JSON arguments in one frame), so in practice this merges exactly one
/// frame per slot; keeping the merge here too means a future adapter that streams
/// arguments incrementally doesn't require an orchestrator change to support.
#[derive(Default, Clone)]
struct PendingToolCall {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

/// Accumulated state across every round of one turn, threaded through `run_round`.
#[derive(Default)]
struct TurnState {
    total_tool_calls: u32,
    seen_call_ids: HashSet<String>,
    any_token_emitted: bool,
    final_text: String,
    thinking_acc: String,
    executed_tool_calls: Vec<Value>,
}

/// What a single `run_round` call produced.
enum RoundOutcome {
    /// The round ended with no announced tool calls: the turn's content is complete.
    Done,
    /// At least one newly-announced tool call ran to completion within budget; the
    /// caller should run another round.
    ToolCallsExecuted,
    /// A newly-announced tool call would have exceeded `max_total_tool_calls`.
    BudgetExhausted,
    /// The round was run with no tool schemas offered (the forced final round) and
    /// the model still announced a tool call anyway; nothing was executed.
    ToolsStillRequested,
    /// The provider stream reported an error; carries the error and whatever
    /// content text this round had produced before the error arrived.
    StreamError(String, String),
    /// An announced tool call's arguments never completed into valid JSON.
    BadArguments(String),
}

impl Orchestrator {
    pub fn new(
        store: Store,
        retrieval: Arc<RetrievalIndex>,
        tools: Arc<ToolRegistry>,
        provider: Arc<dyn Provider>,
        models: Arc<ModelRegistry>,
        limits: OrchestratorLimits,
    ) -> Self {
        Self {
            store,
            retrieval,
            tools,
            provider,
            models,
            limits,
            turn_locks: DashMap::new(),
        }
    }

    fn session_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        self.turn_locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Starts one turn and returns a receiver of its event stream. Turns for the same
    /// session are serialized: a turn that arrives while another is in flight waits
    /// for the session's lock rather than interleaving with it.
    pub fn run_turn(self: Arc<Self>, session_id: String, user_text: String) -> mpsc::Receiver<OrchestratorEvent> {
        // Sink-side back-pressure: the provider stops being polled once this many
        // frames are queued for the client.
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            let lock = self.session_lock(&session_id);
            let _guard = lock.lock().await;
            let turn_timeout = self.limits.turn_timeout;
            match tokio::time::timeout(turn_timeout, self.drive_turn(&session_id, &user_text, &tx)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    let _ = tx
                        .send(OrchestratorEvent::End {
                            reason: EndReason::Error(e.kind().to_string()),
                        })
                        .await;
                }
                Err(_) => {
                    // `end`'s wire contract has no "timeout" reason; surface the
                    // per-turn wall-clock limit expiring the same way any other fatal
                    // cause is surfaced.
                    let _ = tx
                        .send(OrchestratorEvent::End {
                            reason: EndReason::Error(format!(
                                "turn exceeded the {turn_timeout:?} per-turn time limit"
                            )),
                        })
                        .await;
                }
            }
        });
        rx
    }

    async fn drive_turn(
        &self,
        session_id: &str,
        user_text: &str,
        tx: &mpsc::Sender<OrchestratorEvent>,
    ) -> Result<(), crate::error::HostError> {
        self.store
            .append_message(session_id, Role::User, user_text, None)
            .await?;

        let model_id = self.models.current_model().await.map_err(|e| {
            crate::error::HostError::UpstreamUnavailable(e.to_string())
        })?;
        let _ = tx
            .send(OrchestratorEvent::SessionInfo {
                session_id: session_id.to_string(),
                model_id: model_id.clone(),
            })
            .await;

        if matches!(self.retrieval.status(session_id).await, crate::retrieval::IndexStatus::Empty) {
            let _ = self.retrieval.rebuild(session_id).await;
        }
        let retrieved = self
            .retrieval
            .retrieve(session_id, user_text, 5)
            .await
            .unwrap_or_default();
        let _ = tx
            .send(OrchestratorEvent::RuleChunks {
                chunks: retrieved
                    .iter()
                    .map(|c| RuleChunkSummary {
                        chunk_id: c.chunk_id.clone(),
                        text: c.text.clone(),
                        source_row_id: c.source_row_id,
                    })
                    .collect(),
            })
            .await;

        let history = self.store.list_messages(session_id, None, None).await?;
        let tool_specs = self.tools.list_tools();
        let mut messages = prompt::build_prompt(&history, &retrieved, &tool_specs);

        let ctx = ToolCallContext {
            session_id: session_id.to_string(),
        };
        let mut state = TurnState::default();

        for _round in 0..self.limits.max_tool_rounds {
            let outcome = self
                .run_round(&mut messages, &tool_specs, &model_id, &ctx, tx, &mut state)
                .await?;
            match outcome {
                RoundOutcome::Done => {
                    return self.finish_turn(session_id, &state, false, tx, EndReason::Done).await;
                }
                RoundOutcome::ToolCallsExecuted => continue,
                RoundOutcome::BudgetExhausted => {
                    state.any_token_emitted = true;
                    let _ = tx
                        .send(OrchestratorEvent::Token("[tool call budget exhausted]".into()))
                        .await;
                    state.final_text.push_str("[tool call budget exhausted]");
                    return self.finish_turn(session_id, &state, true, tx, EndReason::MaxRounds).await;
                }
                RoundOutcome::StreamError(e, round_text) => {
                    self.persist_partial_if_needed(
                        session_id,
                        &state.final_text,
                        &round_text,
                        state.any_token_emitted,
                        &state.thinking_acc,
                        &state.executed_tool_calls,
                    )
                    .await?;
                    let _ = tx
                        .send(OrchestratorEvent::End {
                            reason: EndReason::Error(e),
                        })
                        .await;
                    return Ok(());
                }
                RoundOutcome::BadArguments(msg) => {
                    return self
                        .finish_turn(session_id, &state, true, tx, EndReason::Error(msg))
                        .await;
                }
                // Normal rounds always offer tool schemas, so this variant cannot
                // arise here; it's only ever produced by the forced final round.
                RoundOutcome::ToolsStillRequested => unreachable!(),
            }
        }

        // Every round through max_tool_rounds still had pending tool calls: run one
        // more, forced, content-only round with no tool schemas offered. If the
        // model still insists on calling tools even then, give up with max_rounds.
        let forced_outcome = self
            .run_round(&mut messages, &[], &model_id, &ctx, tx, &mut state)
            .await?;
        match forced_outcome {
            RoundOutcome::Done => {
                self.finish_turn(session_id, &state, false, tx, EndReason::Done).await
            }
            RoundOutcome::StreamError(e, round_text) => {
                self.persist_partial_if_needed(
                    session_id,
                    &state.final_text,
                    &round_text,
                    state.any_token_emitted,
                    &state.thinking_acc,
                    &state.executed_tool_calls,
                )
                .await?;
                let _ = tx
                    .send(OrchestratorEvent::End {
                        reason: EndReason::Error(e),
                    })
                    .await;
                Ok(())
            }
            RoundOutcome::BadArguments(msg) => {
                self.finish_turn(session_id, &state, true, tx, EndReason::Error(msg)).await
            }
            RoundOutcome::ToolCallsExecuted
            | RoundOutcome::BudgetExhausted
            | RoundOutcome::ToolsStillRequested => {
                self.finish_turn(session_id, &state, true, tx, EndReason::MaxRounds).await
            }
        }
    }

    /// Runs one provider round: streams `thinking`/`token` frames through as they
    /// arrive, buffers any announced tool calls, and — if the round ends with at
    /// least one whole announced call — executes each (sequentially, per-call
    /// timeout) before returning. `tools` may be empty to force a content-only round
    /// (the forced final round after `max_tool_rounds` offers no tool schemas).
    async fn run_round(
        &self,
        messages: &mut Vec<ChatMessage>,
        tools: &[ToolSpec],
        model_id: &str,
        ctx: &ToolCallContext,
        tx: &mpsc::Sender<OrchestratorEvent>,
        state: &mut TurnState,
    ) -> Result<RoundOutcome, crate::error::HostError> {
        let mut stream = self
            .provider
            .stream_chat(messages, tools, model_id)
            .await
            .map_err(|e| crate::error::HostError::UpstreamUnavailable(e.to_string()))?;

        let mut pending: Vec<PendingToolCall> = Vec::new();
        let mut round_text = String::new();
        let mut saw_error = None;

        use tokio_stream::StreamExt as _;
        while let Some(frame) = stream.next().await {
            match frame {
                StreamFrame::Thinking(t) => {
                    if !t.is_empty() {
                        state.thinking_acc.push_str(&t);
                        let _ = tx.send(OrchestratorEvent::Thinking(t)).await;
                    }
                }
                StreamFrame::ContentDelta(t) => {
                    if !t.is_empty() {
                        state.any_token_emitted = true;
                        round_text.push_str(&t);
                        let _ = tx.send(OrchestratorEvent::Token(t)).await;
                    }
                }
                StreamFrame::ToolCallDelta {
                    call_index,
                    id,
                    name,
                    arguments_delta,
                } => {
                    let idx = call_index as usize;
                    if pending.len() <= idx {
                        pending.resize(idx + 1, PendingToolCall::default());
                    }
                    let slot = &mut pending[idx];
                    if id.is_some() {
                        slot.id = id;
                    }
                    if name.is_some() {
                        slot.name = name;
                    }
                    slot.arguments.push_str(&arguments_delta);
                }
                StreamFrame::Done => break,
                StreamFrame::Error(e) => {
                    saw_error = Some(e);
                    break;
                }
            }
        }

        if let Some(e) = saw_error {
            return Ok(RoundOutcome::StreamError(e, round_text));
        }

        let announced: Vec<PendingToolCall> = pending.into_iter().filter(|p| p.id.is_some()).collect();
        if announced.is_empty() {
            state.final_text.push_str(&round_text);
            return Ok(RoundOutcome::Done);
        }

        // This round offered no tool schemas (the forced final round) and the model
        // announced a call anyway: nothing was offered to call, so nothing runs.
        if tools.is_empty() {
            state.final_text.push_str(&round_text);
            return Ok(RoundOutcome::ToolsStillRequested);
        }

        // The provider reported the round done while at least one announced tool
        // call's arguments payload never completed into valid JSON: reject the turn
        // rather than silently running the handler with truncated input.
        if let Some(bad) = announced.iter().find(|c| serde_json::from_str::<Value>(&c.arguments).is_err()) {
            state.final_text.push_str(&round_text);
            return Ok(RoundOutcome::BadArguments(format!(
                "incomplete tool-call arguments for call {:?}",
                bad.id
            )));
        }

        state.final_text.push_str(&round_text);
        messages.push(ChatMessage::Assistant(round_text));

        // Only calls not already announced in an earlier round are "newly
        // announced" — mark them seen now so a provider that repeats an id never
        // gets it executed twice, then emit the announcement frame (with the raw
        // accumulated JSON string, per the wire contract) before running any
        // handler.
        let new_calls: Vec<(String, String, String, Value)> = announced
            .into_iter()
            .filter_map(|call| {
                let id = call.id?;
                if state.seen_call_ids.contains(&id) {
                    return None;
                }
                state.seen_call_ids.insert(id.clone());
                let name = call.name.unwrap_or_default();
                let raw_arguments = call.arguments.clone();
                let args: Value = serde_json::from_str(&call.arguments).unwrap_or(Value::Null);
                Some((id, name, raw_arguments, args))
            })
            .collect();

        let _ = tx
            .send(OrchestratorEvent::ToolCalls(
                new_calls
                    .iter()
                    .map(|(id, name, raw_arguments, _)| ToolCallRecord {
                        id: id.clone(),
                        name: name.clone(),
                        arguments: raw_arguments.clone(),
                    })
                    .collect(),
            ))
            .await;

        let mut budget_exhausted = false;
        for (id, name, _raw_arguments, args) in new_calls {
            if state.total_tool_calls >= self.limits.max_total_tool_calls {
                budget_exhausted = true;
                break;
            }
            state.total_tool_calls += 1;

            let result = match tokio::time::timeout(
                self.limits.tool_call_timeout,
                self.tools.call(&name, args.clone(), ctx),
            )
            .await
            {
                Ok(Ok(r)) => r,
                Ok(Err(e)) => crate::tool_source::ToolResult {
                    ok: false,
                    result: None,
                    error: Some(e.to_string()),
                },
                Err(_) => crate::tool_source::ToolResult {
                    ok: false,
                    result: None,
                    error: Some("tool call timed out".into()),
                },
            };

            messages.push(ChatMessage::Tool {
                tool_call_id: id.clone(),
                content: serde_json::to_string(&result).unwrap_or_default(),
            });
            state.executed_tool_calls.push(serde_json::json!({
                "id": id,
                "name": name,
                "arguments": args,
                "ok": result.ok,
            }));
        }

        if budget_exhausted {
            Ok(RoundOutcome::BudgetExhausted)
        } else {
            Ok(RoundOutcome::ToolCallsExecuted)
        }
    }

    /// Persists the turn's final text under `forced_cutoff` and emits `end{reason}`.
    async fn finish_turn(
        &self,
        session_id: &str,
        state: &TurnState,
        forced_cutoff: bool,
        tx: &mpsc::Sender<OrchestratorEvent>,
        reason: EndReason,
    ) -> Result<(), crate::error::HostError> {
        self.persist_final(
            session_id,
            &state.final_text,
            forced_cutoff,
            state.any_token_emitted,
            &state.thinking_acc,
            &state.executed_tool_calls,
        )
        .await?;
        let _ = tx.send(OrchestratorEvent::End { reason }).await;
        Ok(())
    }

    /// Persists the assistant's accumulated text for the turn. `forced_cutoff`
    /// distinguishes a normal end-of-turn completion from a forced early stop (e.g.
    /// the tool-call budget was exhausted); `metadata.partial` is only ever set when
    /// the turn was cut off AND at least one non-empty token was actually emitted —
    /// a forced cutoff with zero tokens has nothing partial to mark, and a normal
    /// completion is never partial regardless of how much text it produced.
    async fn persist_final(
        &self,
        session_id: &str,
        text: &str,
        forced_cutoff: bool,
        any_token_emitted: bool,
        thinking: &str,
        tool_calls: &[Value],
    ) -> Result<(), crate::error::HostError> {
        let metadata = build_message_metadata(forced_cutoff && any_token_emitted, thinking, tool_calls);
        self.store
            .append_message(session_id, Role::Assistant, text, metadata)
            .await?;
        Ok(())
    }

    async fn persist_partial_if_needed(
        &self,
        session_id: &str,
        final_text: &str,
        round_text: &str,
        any_token_emitted: bool,
        thinking: &str,
        tool_calls: &[Value],
    ) -> Result<(), crate::error::HostError> {
        if !any_token_emitted {
            return Ok(());
        }
        let mut text = final_text.to_string();
        text.push_str(round_text);
        let metadata = build_message_metadata(true, thinking, tool_calls);
        self.store
            .append_message(session_id, Role::Assistant, &text, metadata)
            .await?;
        Ok(())
    }
}

/// Builds `Message.metadata`: `partial` only when requested, plus whatever
/// `thinking` text and executed tool-call descriptors were collected this turn.
/// Returns `None` when there is nothing worth recording.
fn build_message_metadata(partial: bool, thinking: &str, tool_calls: &[Value]) -> Option<Value> {
    let mut map = serde_json::Map::new();
    if partial {
        map.insert("partial".to_string(), Value::Bool(true));
    }
    if !thinking.is_empty() {
        map.insert("thinking".to_string(), Value::String(thinking.to_string()));
    }
    if !tool_calls.is_empty() {
        map.insert("tool_calls".to_string(), Value::Array(tool_calls.to_vec()));
    }
    if map.is_empty() {
        None
    } else {
        Some(Value::Object(map))
    }
}
