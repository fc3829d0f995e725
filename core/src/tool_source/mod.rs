//! Tool Registry (C4): the closed set of tools the orchestrator may call. Each tool is
//! a named JSON-schema'd handler backed by the [`Store`](crate::store::Store); unlike
//! the teacher's MCP-backed tool sources, every tool here is in-process and synchronous
//! in spirit (no subprocess, no JSON-RPC transport), so `ToolSourceError` drops the
//! `Transport`/`JsonRpc` variants in favor of `UnauthorizedPath` for the one tool that
//! touches the filesystem.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;

use crate::export::ArtifactDeriver;
use crate::store::Store;

#[derive(Debug, Error)]
pub enum ToolSourceError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("unauthorized path: {0}")]
    UnauthorizedPath(String),
    #[error("upstream: {0}")]
    Upstream(String),
}

#[derive(Clone, Debug, serde::Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// A tool's result: this is what's fed back to the provider as the tool-result
/// message content, never an exception — a failing tool call produces `ok: false`
/// with an `error` string, not a propagated `ToolSourceError`.
#[derive(Clone, Debug, serde::Serialize)]
pub struct ToolResult {
    pub ok: bool,
    pub result: Option<Value>,
    pub error: Option<String>,
}

impl ToolResult {
    fn ok(result: Value) -> Self {
        Self {
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    fn err(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            result: None,
            error: Some(message.into()),
        }
    }
}

/// Per-call context the orchestrator supplies: the active session (tools that don't
/// need one, like `derive_project_idea`, simply ignore it).
#[derive(Clone, Debug)]
pub struct ToolCallContext {
    pub session_id: String,
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn spec(&self) -> ToolSpec;
    async fn call(&self, args: Value, ctx: &ToolCallContext) -> ToolResult;
}

/// The fixed set of nine tools the orchestrator may announce and invoke. Construction
/// is total (no fallible setup); `repo_root` confines `list_directory`.
pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new(store: Store, repo_root: PathBuf, deriver: Arc<ArtifactDeriver>) -> Self {
        let tools: Vec<Box<dyn Tool>> = vec![
            Box::new(GetSessionId),
            Box::new(ListTodos { store: store.clone() }),
            Box::new(AddTodo { store: store.clone() }),
            Box::new(ClearTodos { store: store.clone() }),
            Box::new(ListDirectory { repo_root }),
            Box::new(DeriveProjectIdea { deriver: deriver.clone() }),
            Box::new(CreateTechStack { deriver: deriver.clone() }),
            Box::new(SummarizeChatHistory { deriver: deriver.clone() }),
            Box::new(GenerateChatTitle { deriver }),
        ];
        Self { tools }
    }

    pub fn list_tools(&self) -> Vec<ToolSpec> {
        self.tools.iter().map(|t| t.spec()).collect()
    }

    /// Looks up `name` and runs it. Returns `ToolSourceError::NotFound` only when the
    /// name isn't in the registry at all; every other failure is reported inside the
    /// returned `ToolResult` with `ok: false`, per the "handlers never raise" contract.
    pub async fn call(
        &self,
        name: &str,
        args: Value,
        ctx: &ToolCallContext,
    ) -> Result<ToolResult, ToolSourceError> {
        let tool = self
            .tools
            .iter()
            .find(|t| t.spec().name == name)
            .ok_or_else(|| ToolSourceError::NotFound(name.to_string()))?;
        Ok(tool.call(args, ctx).await)
    }
}

fn schema(properties: Value, required: &[&str]) -> Value {
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

// ---- get_session_id ----------------------------------------------------------------

struct GetSessionId;

#[async_trait]
impl Tool for GetSessionId {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "get_session_id".into(),
            description: "Returns the id of the current session.".into(),
            input_schema: schema(json!({}), &[]),
        }
    }

    async fn call(&self, _args: Value, ctx: &ToolCallContext) -> ToolResult {
        ToolResult::ok(json!({ "session_id": ctx.session_id }))
    }
}

// ---- list_todos ---------------------------------------------------------------------

struct ListTodos {
    store: Store,
}

#[async_trait]
impl Tool for ListTodos {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "list_todos".into(),
            description: "Lists todo items for the current session.".into(),
            input_schema: schema(json!({}), &[]),
        }
    }

    async fn call(&self, _args: Value, ctx: &ToolCallContext) -> ToolResult {
        match self.store.list_tasks(Some(ctx.session_id.clone())).await {
            Ok(tasks) => ToolResult::ok(json!(tasks
                .into_iter()
                .map(|t| json!({
                    "id": t.id,
                    "item": t.item,
                    "status": t.status,
                    "priority": t.priority,
                }))
                .collect::<Vec<_>>())),
            Err(e) => ToolResult::err(e.to_string()),
        }
    }
}

// ---- add_todo -------------------------------------------------------------------------

struct AddTodo {
    store: Store,
}

#[async_trait]
impl Tool for AddTodo {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "add_todo".into(),
            description: "Adds a todo item to the current session.".into(),
            input_schema: schema(
                json!({
                    "item": { "type": "string" },
                    "priority": { "type": "integer" },
                }),
                &["item"],
            ),
        }
    }

    async fn call(&self, args: Value, ctx: &ToolCallContext) -> ToolResult {
        let Some(item) = args.get("item").and_then(Value::as_str) else {
            return ToolResult::err("missing required field: item");
        };
        if item.trim().is_empty() {
            return ToolResult::err("item must not be empty");
        }
        let priority = args.get("priority").and_then(Value::as_i64).unwrap_or(0);
        match self
            .store
            .add_task(Some(ctx.session_id.clone()), item, priority)
            .await
        {
            Ok(task) => ToolResult::ok(json!({ "id": task.id, "item": task.item })),
            Err(e) => ToolResult::err(e.to_string()),
        }
    }
}

// ---- clear_todos -----------------------------------------------------------------------

struct ClearTodos {
    store: Store,
}

#[async_trait]
impl Tool for ClearTodos {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "clear_todos".into(),
            description: "Removes every todo item for the current session.".into(),
            input_schema: schema(json!({}), &[]),
        }
    }

    async fn call(&self, _args: Value, ctx: &ToolCallContext) -> ToolResult {
        match self.store.clear_tasks(&ctx.session_id).await {
            Ok(n) => ToolResult::ok(json!({ "cleared": n })),
            Err(e) => ToolResult::err(e.to_string()),
        }
    }
}

// ---- list_directory ---------------------------------------------------------------------

struct ListDirectory {
    repo_root: PathBuf,
}

#[async_trait]
impl Tool for ListDirectory {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "list_directory".into(),
            description: "Lists entries of a directory relative to the repository root."
                .into(),
            input_schema: schema(json!({ "path": { "type": "string" } }), &[]),
        }
    }

    async fn call(&self, args: Value, _ctx: &ToolCallContext) -> ToolResult {
        let rel = args.get("path").and_then(Value::as_str).unwrap_or(".");
        match resolve_confined(&self.repo_root, rel) {
            Ok(resolved) => match std::fs::read_dir(&resolved) {
                Ok(entries) => {
                    let mut names = Vec::new();
                    for entry in entries {
                        match entry {
                            Ok(e) => names.push(e.file_name().to_string_lossy().to_string()),
                            Err(e) => return ToolResult::err(e.to_string()),
                        }
                    }
                    names.sort();
                    ToolResult::ok(json!({ "entries": names }))
                }
                Err(e) => ToolResult::err(e.to_string()),
            },
            Err(e) => ToolResult::err(e.to_string()),
        }
    }
}

/// Resolves `rel` against `root` and rejects the result unless it stays inside `root`
/// after canonicalization, so `../../etc` (or a symlink pointing outside) can't escape.
fn resolve_confined(root: &Path, rel: &str) -> Result<PathBuf, ToolSourceError> {
    let candidate = root.join(rel);
    let canonical_root = root
        .canonicalize()
        .map_err(|e| ToolSourceError::Upstream(e.to_string()))?;
    let canonical = candidate
        .canonicalize()
        .map_err(|e| ToolSourceError::UnauthorizedPath(e.to_string()))?;
    if !canonical.starts_with(&canonical_root) {
        return Err(ToolSourceError::UnauthorizedPath(format!(
            "{} escapes repository root",
            rel
        )));
    }
    Ok(canonical)
}

// ---- derive_project_idea / create_tech_stack / summarize_chat_history ------------------
//
// Each of these runs the export layer's (C6) one-shot, tool-calling-disabled
// Orchestrator invocation and stores the result as the named artifact — the tool
// *is* the generation step, not a record of a draft the model composed itself.

struct DeriveProjectIdea {
    deriver: Arc<ArtifactDeriver>,
}

#[async_trait]
impl Tool for DeriveProjectIdea {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "derive_project_idea".into(),
            description: "Generates and stores the project idea artifact from the \
                           conversation so far."
                .into(),
            input_schema: schema(json!({}), &[]),
        }
    }

    async fn call(&self, _args: Value, ctx: &ToolCallContext) -> ToolResult {
        match self.deriver.derive_project_idea(&ctx.session_id).await {
            Ok(idea_markdown) => ToolResult::ok(json!({ "idea_markdown": idea_markdown })),
            Err(e) => ToolResult::err(e.to_string()),
        }
    }
}

struct CreateTechStack {
    deriver: Arc<ArtifactDeriver>,
}

#[async_trait]
impl Tool for CreateTechStack {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "create_tech_stack".into(),
            description: "Generates and stores the tech-stack artifact from the \
                           conversation and project idea."
                .into(),
            input_schema: schema(json!({}), &[]),
        }
    }

    async fn call(&self, _args: Value, ctx: &ToolCallContext) -> ToolResult {
        match self.deriver.derive_tech_stack(&ctx.session_id).await {
            Ok(tech_stack_markdown) => {
                ToolResult::ok(json!({ "tech_stack_markdown": tech_stack_markdown }))
            }
            Err(e) => ToolResult::err(e.to_string()),
        }
    }
}

struct SummarizeChatHistory {
    deriver: Arc<ArtifactDeriver>,
}

#[async_trait]
impl Tool for SummarizeChatHistory {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "summarize_chat_history".into(),
            description: "Generates and stores the submission-summary artifact from the \
                           conversation so far."
                .into(),
            input_schema: schema(json!({}), &[]),
        }
    }

    async fn call(&self, _args: Value, ctx: &ToolCallContext) -> ToolResult {
        match self.deriver.derive_submission_summary(&ctx.session_id).await {
            Ok(summary_markdown) => ToolResult::ok(json!({ "summary_markdown": summary_markdown })),
            Err(e) => ToolResult::err(e.to_string()),
        }
    }
}

// ---- generate_chat_title ----------------------------------------------------------------

struct GenerateChatTitle {
    deriver: Arc<ArtifactDeriver>,
}

#[async_trait]
impl Tool for GenerateChatTitle {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "generate_chat_title".into(),
            description: "Sets the session title from its first user message (or a short \
                           LLM call if none exists yet); idempotent unless `force` is set."
                .into(),
            input_schema: schema(json!({ "force": { "type": "boolean" } }), &[]),
        }
    }

    async fn call(&self, args: Value, ctx: &ToolCallContext) -> ToolResult {
        let force = args.get("force").and_then(Value::as_bool).unwrap_or(false);
        match self.deriver.generate_title(&ctx.session_id, force).await {
            Ok(title) => ToolResult::ok(json!({ "title": title })),
            Err(e) => ToolResult::err(e.to_string()),
        }
    }
}
