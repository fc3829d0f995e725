//! Export/Artifact Layer (C6): derives the three named artifacts (project idea, tech
//! stack, submission summary) via a one-shot, tool-calling-disabled Orchestrator
//! invocation, and assembles the deterministic ZIP submission pack from whatever
//! artifacts and todos exist.

use std::io::Write;
use std::sync::Arc;

use thiserror::Error;
use zip::write::FileOptions;
use zip::ZipWriter;

use crate::message::ChatMessage;
use crate::provider::{ModelRegistry, Provider, StreamFrame};
use crate::store::{ArtifactType, Store, StoreError};

#[derive(Debug, Error)]
pub enum ExportError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("provider: {0}")]
    Provider(String),
    #[error("zip: {0}")]
    Zip(String),
}

const IDEA_INSTRUCTION: &str = "Read the conversation history and produce a concise project \
    idea as markdown: a title, a one-paragraph pitch, and 3-5 bullet goals. Output only the \
    markdown, no preamble.";
const TECH_STACK_INSTRUCTION: &str = "Read the conversation history and the project idea, and \
    produce a tech stack recommendation as markdown: language/runtime, storage, and any key \
    libraries, each with a one-line justification. Output only the markdown, no preamble.";
const SUMMARY_INSTRUCTION: &str = "Read the conversation history and produce a submission \
    summary as markdown: what was built and why. Output only the markdown, no preamble.";
const TITLE_INSTRUCTION: &str = "Suggest a short session title (3-6 words, no punctuation at \
    the end, no quotes). Output only the title.";

/// Clamps a title to a single line of at most 60 characters, trimming at a word
/// boundary where possible rather than cutting mid-word.
fn truncate_title(text: &str) -> String {
    let first_line = text.lines().next().unwrap_or("").trim();
    let chars: Vec<char> = first_line.chars().collect();
    if chars.len() <= 60 {
        return first_line.to_string();
    }
    let clipped: String = chars[..60].iter().collect();
    match clipped.rfind(' ') {
        Some(idx) if idx > 0 => clipped[..idx].to_string(),
        _ => clipped,
    }
}

pub struct ArtifactDeriver {
    store: Store,
    provider: Arc<dyn Provider>,
    models: Arc<ModelRegistry>,
}

impl ArtifactDeriver {
    pub fn new(store: Store, provider: Arc<dyn Provider>, models: Arc<ModelRegistry>) -> Self {
        Self {
            store,
            provider,
            models,
        }
    }

    pub async fn derive_project_idea(&self, session_id: &str) -> Result<String, ExportError> {
        self.derive(session_id, ArtifactType::ProjectIdea, IDEA_INSTRUCTION)
            .await
    }

    pub async fn derive_tech_stack(&self, session_id: &str) -> Result<String, ExportError> {
        self.derive(session_id, ArtifactType::TechStack, TECH_STACK_INSTRUCTION)
            .await
    }

    pub async fn derive_submission_summary(&self, session_id: &str) -> Result<String, ExportError> {
        self.derive(session_id, ArtifactType::SubmissionSummary, SUMMARY_INSTRUCTION)
            .await
    }

    /// Sets a session's title from its first user message, falling back to a short LLM
    /// call when no user message exists yet. Idempotent: a session that already has a
    /// title is left untouched unless `force` is set.
    pub async fn generate_title(&self, session_id: &str, force: bool) -> Result<String, ExportError> {
        // Creates the session row if it doesn't exist yet, preserving any existing
        // title rather than clobbering it.
        let session = self.store.upsert_session(session_id, None).await?;
        if !force {
            if let Some(existing) = session.title {
                return Ok(existing);
            }
        }

        let history = self.store.list_messages(session_id, None, None).await?;
        let first_user = history
            .iter()
            .find(|m| matches!(m.role, crate::store::Role::User))
            .map(|m| m.content.clone());

        let title = match first_user {
            Some(text) => truncate_title(&text),
            None => {
                let model_id = self
                    .models
                    .current_model()
                    .await
                    .map_err(|e| ExportError::Provider(e.to_string()))?;
                let messages = vec![ChatMessage::System(TITLE_INSTRUCTION.to_string())];
                let mut stream = self
                    .provider
                    .stream_chat(&messages, &[], &model_id)
                    .await
                    .map_err(|e| ExportError::Provider(e.to_string()))?;
                let mut content = String::new();
                use tokio_stream::StreamExt as _;
                while let Some(frame) = stream.next().await {
                    match frame {
                        StreamFrame::ContentDelta(t) => content.push_str(&t),
                        StreamFrame::Error(e) => return Err(ExportError::Provider(e)),
                        StreamFrame::Done => break,
                        _ => {}
                    }
                }
                truncate_title(content.trim())
            }
        };

        self.store
            .upsert_session(session_id, Some(title.clone()))
            .await?;
        Ok(title)
    }

    /// Runs one non-streaming, tool-free completion seeded with the session's history
    /// plus a fixed instruction, and upserts the result as the named artifact.
    async fn derive(
        &self,
        session_id: &str,
        artifact_type: ArtifactType,
        instruction: &str,
    ) -> Result<String, ExportError> {
        let history = self.store.list_messages(session_id, None, None).await?;
        let mut messages: Vec<ChatMessage> = vec![ChatMessage::System(instruction.to_string())];
        messages.extend(history.into_iter().map(|m| match m.role {
            crate::store::Role::User => ChatMessage::User(m.content),
            crate::store::Role::Assistant => ChatMessage::Assistant(m.content),
            crate::store::Role::System => ChatMessage::System(m.content),
        }));

        let model_id = self
            .models
            .current_model()
            .await
            .map_err(|e| ExportError::Provider(e.to_string()))?;

        let mut stream = self
            .provider
            .stream_chat(&messages, &[], &model_id)
            .await
            .map_err(|e| ExportError::Provider(e.to_string()))?;

        let mut content = String::new();
        use tokio_stream::StreamExt as _;
        while let Some(frame) = stream.next().await {
            match frame {
                StreamFrame::ContentDelta(t) => content.push_str(&t),
                StreamFrame::Error(e) => return Err(ExportError::Provider(e)),
                StreamFrame::Done => break,
                _ => {}
            }
        }

        self.store
            .put_artifact(session_id, artifact_type, content.trim(), None)
            .await?;
        Ok(content.trim().to_string())
    }
}

/// Assembles the submission ZIP with exactly six entries in fixed order:
/// `idea.md, tech_stack.md, summary.md, todos.json, rules_ingested.txt,
/// session_metadata.json`. Missing artifacts are written as empty strings rather than
/// omitted, so the entry set (and therefore the archive's central directory layout)
/// never varies with how much of a session's work has actually happened. Every entry
/// carries the same fixed modification time so two packs built from identical inputs
/// are byte-identical.
///
/// `session_metadata.json`'s `exported_at` is the session's own `updated_at`, not the
/// wall-clock time of the export call: the determinism property ("byte-identical for
/// two back-to-back calls on unchanged state") would otherwise fail the moment two
/// calls land in different milliseconds.
pub async fn build_submission_pack(
    store: &Store,
    session_id: &str,
    model_id: &str,
) -> Result<Vec<u8>, ExportError> {
    let idea = store
        .get_artifact(session_id, ArtifactType::ProjectIdea)
        .await?
        .map(|a| a.content)
        .unwrap_or_default();
    let tech_stack = store
        .get_artifact(session_id, ArtifactType::TechStack)
        .await?
        .map(|a| a.content)
        .unwrap_or_default();
    let summary = store
        .get_artifact(session_id, ArtifactType::SubmissionSummary)
        .await?
        .map(|a| a.content)
        .unwrap_or_default();
    let todos = store.list_tasks(Some(session_id.to_string())).await?;
    let todos_json = serde_json::to_string_pretty(&todos).map_err(|e| ExportError::Zip(e.to_string()))?;
    let rules = store
        .list_active_rule_context(Some(session_id.to_string()))
        .await?;
    let rules_text = rules
        .iter()
        .map(|r| {
            format!(
                "# {} ({:?})\n{}\n",
                r.filename.clone().unwrap_or_else(|| "inline".into()),
                r.source,
                r.content
            )
        })
        .collect::<Vec<_>>()
        .join("\n");
    let session = store.get_session(session_id).await?;
    let message_count = store.list_messages(session_id, None, None).await?.len();
    let metadata = serde_json::json!({
        "session_id": session.id,
        "title": session.title,
        "created_at": session.created_at,
        "updated_at": session.updated_at,
        "message_count": message_count,
        "model_id": model_id,
        "exported_at": session.updated_at,
    });
    let metadata_json =
        serde_json::to_string_pretty(&metadata).map_err(|e| ExportError::Zip(e.to_string()))?;

    let mut buf = std::io::Cursor::new(Vec::new());
    {
        let mut zip = ZipWriter::new(&mut buf);
        let fixed_time = zip::DateTime::from_date_and_time(1980, 1, 1, 0, 0, 0)
            .unwrap_or_else(|_| zip::DateTime::default());
        let options: FileOptions = FileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated)
            .last_modified_time(fixed_time);

        for (name, bytes) in [
            ("idea.md", idea.as_bytes()),
            ("tech_stack.md", tech_stack.as_bytes()),
            ("summary.md", summary.as_bytes()),
            ("todos.json", todos_json.as_bytes()),
            ("rules_ingested.txt", rules_text.as_bytes()),
            ("session_metadata.json", metadata_json.as_bytes()),
        ] {
            zip.start_file(name, options)
                .map_err(|e| ExportError::Zip(e.to_string()))?;
            zip.write_all(bytes).map_err(|e| ExportError::Zip(e.to_string()))?;
        }
        zip.finish().map_err(|e| ExportError::Zip(e.to_string()))?;
    }
    Ok(buf.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::RuleContextSource;
    use async_trait::async_trait;
    use futures_util::stream;

    struct StubProvider {
        reply: String,
    }

    #[async_trait]
    impl Provider for StubProvider {
        async fn list_models(&self) -> Result<Vec<String>, crate::provider::ProviderError> {
            Ok(vec!["stub".into()])
        }

        async fn stream_chat(
            &self,
            _messages: &[ChatMessage],
            _tools: &[crate::tool_source::ToolSpec],
            _model_id: &str,
        ) -> Result<crate::provider::FrameStream, crate::provider::ProviderError> {
            let reply = self.reply.clone();
            let frames = vec![StreamFrame::ContentDelta(reply), StreamFrame::Done];
            Ok(Box::pin(stream::iter(frames)))
        }
    }

    async fn harness(reply: &str) -> (tempfile::TempDir, Store, ArtifactDeriver) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("app.db")).unwrap();
        let models = Arc::new(ModelRegistry::new(store.clone(), "stub".into()));
        let provider: Arc<dyn Provider> = Arc::new(StubProvider {
            reply: reply.to_string(),
        });
        let deriver = ArtifactDeriver::new(store.clone(), provider, models);
        (dir, store, deriver)
    }

    #[tokio::test]
    async fn derive_project_idea_persists_artifact() {
        let (_dir, store, deriver) = harness("# Idea\nBuild a thing.").await;
        store
            .append_message("s", crate::store::Role::User, "let's build something", None)
            .await
            .unwrap();
        let idea = deriver.derive_project_idea("s").await.unwrap();
        assert!(idea.contains("Build a thing"));
        let stored = store.get_artifact("s", ArtifactType::ProjectIdea).await.unwrap();
        assert!(stored.is_some());
    }

    #[tokio::test]
    async fn submission_pack_has_six_entries_in_fixed_order() {
        let (_dir, store, _deriver) = harness("x").await;
        store.upsert_session("s", None).await.unwrap();
        store
            .insert_rule_context(Some("s".into()), RuleContextSource::Text, "rule one", None)
            .await
            .unwrap();
        let bytes = build_submission_pack(&store, "s", "stub-model").await.unwrap();
        let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes)).unwrap();
        let names: Vec<String> = (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect();
        assert_eq!(
            names,
            vec![
                "idea.md",
                "tech_stack.md",
                "summary.md",
                "todos.json",
                "rules_ingested.txt",
                "session_metadata.json",
            ]
        );
    }

    #[tokio::test]
    async fn submission_pack_is_byte_identical_across_runs() {
        let (_dir, store, _deriver) = harness("x").await;
        store.upsert_session("s", None).await.unwrap();
        let first = build_submission_pack(&store, "s", "stub-model").await.unwrap();
        let second = build_submission_pack(&store, "s", "stub-model").await.unwrap();
        assert_eq!(first, second);
    }
}
