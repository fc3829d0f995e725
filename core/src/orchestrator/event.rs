//! The orchestrator's event grammar: `session_info, rule_chunks, (thinking |
//! tool_calls)*, token*, end`. Each variant here is one SSE frame's payload; the CLI
//! or HTTP layer (out of scope for this crate) is responsible for the wire encoding.
//! Wire shapes: `rule_chunks` is `{chunk_ids:[…], texts:[…]}` (parallel arrays, not an
//! array of objects); `tool_calls` is `{tool_calls:[{id, name, arguments: string}]}`
//! with `arguments` left as the raw accumulated JSON text, not a parsed value; `end`
//! is `{reason: "complete" | "max_rounds" | "error", error?: string}` — only those
//! three `reason` values ever reach the wire.

use serde::Serialize;

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    SessionInfo { session_id: String, model_id: String },
    RuleChunks { chunks: Vec<RuleChunkSummary> },
    Thinking(String),
    ToolCalls(Vec<ToolCallRecord>),
    Token(String),
    End { reason: EndReason },
}

#[derive(Clone, Debug, Serialize)]
pub struct RuleChunkSummary {
    pub chunk_id: String,
    pub text: String,
    pub source_row_id: i64,
}

/// One tool call as announced to the client, before execution: `{id, name,
/// arguments}` with no result yet. `arguments` is the raw JSON text the adapter
/// accumulated for this call, not a parsed `Value` — the wire contract carries it as
/// a string. The executed outcome (`ok`/error) is not part of the event grammar — it
/// travels back to the provider as a synthetic tool message and is recorded in the
/// persisted assistant message's `tool_calls` metadata.
#[derive(Clone, Debug, Serialize)]
pub struct ToolCallRecord {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

/// `end`'s wire contract carries exactly three `reason` values: `"complete"`,
/// `"max_rounds"`, `"error"`. There is no fourth `"timeout"` reason — the per-turn
/// wall-clock limit expiring is surfaced as `Error(_)` like any other fatal cause.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum EndReason {
    #[serde(rename = "complete")]
    Done,
    MaxRounds,
    Error(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn end_reason_serializes_with_kind_tag() {
        let v = serde_json::to_value(EndReason::MaxRounds).unwrap();
        assert_eq!(v["kind"], "max_rounds");
    }
}
