//! Provider Adapter (C7): an OpenAI-compatible chat-completions client (works against
//! a local Ollama/vLLM server or the real OpenAI API, matching `PROVIDER_BASE_URL`),
//! plus the store-backed "current model" setting the orchestrator consults before
//! every turn.

use std::collections::{HashMap, VecDeque};
use std::pin::Pin;

use async_openai::config::OpenAIConfig;
use async_openai::types::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestToolMessageArgs,
    ChatCompletionRequestUserMessageArgs, ChatCompletionTool, ChatCompletionToolType,
    CreateChatCompletionRequestArgs, FunctionObject,
};
use async_openai::Client;
use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use thiserror::Error;

use crate::message::ChatMessage;
use crate::store::{Store, StoreError};
use crate::tool_source::ToolSpec;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("timeout")]
    Timeout,
    #[error("protocol: {0}")]
    Protocol(String),
}

impl From<StoreError> for ProviderError {
    fn from(e: StoreError) -> Self {
        ProviderError::Protocol(e.to_string())
    }
}

/// One increment of an in-flight assistant turn. A `ToolCallDelta` always carries a
/// whole call: the adapter buffers the upstream's own partial, byte-at-a-time
/// argument chunks (keyed by `call_index`) internally and emits each call exactly
/// once, fully named with complete JSON arguments, so the orchestrator never has to
/// reconstruct one itself.
#[derive(Clone, Debug)]
pub enum StreamFrame {
    Thinking(String),
    ToolCallDelta {
        call_index: u32,
        id: Option<String>,
        name: Option<String>,
        arguments_delta: String,
    },
    ContentDelta(String),
    Done,
    Error(String),
}

pub type FrameStream = Pin<Box<dyn Stream<Item = StreamFrame> + Send>>;

const CURRENT_MODEL_SETTING_KEY: &str = "current_model_id";

#[async_trait]
pub trait Provider: Send + Sync {
    async fn list_models(&self) -> Result<Vec<String>, ProviderError>;
    async fn stream_chat(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSpec],
        model_id: &str,
    ) -> Result<FrameStream, ProviderError>;
}

pub struct OpenAiProvider {
    client: Client<OpenAIConfig>,
    default_model_id: String,
}

impl OpenAiProvider {
    pub fn new(base_url: &str, api_key: Option<&str>, default_model_id: &str) -> Self {
        let mut config = OpenAIConfig::new().with_api_base(base_url);
        if let Some(key) = api_key {
            config = config.with_api_key(key);
        }
        Self {
            client: Client::with_config(config),
            default_model_id: default_model_id.to_string(),
        }
    }

    pub fn default_model_id(&self) -> &str {
        &self.default_model_id
    }

    fn to_request_message(
        msg: &ChatMessage,
    ) -> Result<ChatCompletionRequestMessage, ProviderError> {
        let built = match msg {
            ChatMessage::System(text) => ChatCompletionRequestSystemMessageArgs::default()
                .content(text.clone())
                .build()
                .map(Into::into),
            ChatMessage::User(text) => ChatCompletionRequestUserMessageArgs::default()
                .content(text.clone())
                .build()
                .map(Into::into),
            ChatMessage::Assistant(text) => ChatCompletionRequestAssistantMessageArgs::default()
                .content(text.clone())
                .build()
                .map(Into::into),
            ChatMessage::Tool {
                tool_call_id,
                content,
            } => ChatCompletionRequestToolMessageArgs::default()
                .tool_call_id(tool_call_id.clone())
                .content(content.clone())
                .build()
                .map(Into::into),
        };
        built.map_err(|e| ProviderError::Protocol(e.to_string()))
    }

    fn to_tool_def(spec: &ToolSpec) -> ChatCompletionTool {
        ChatCompletionTool {
            r#type: ChatCompletionToolType::Function,
            function: FunctionObject {
                name: spec.name.clone(),
                description: Some(spec.description.clone()),
                parameters: Some(spec.input_schema.clone()),
                strict: None,
            },
        }
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    async fn list_models(&self) -> Result<Vec<String>, ProviderError> {
        match self.client.models().list().await {
            Ok(resp) => {
                let ids: Vec<String> = resp.data.into_iter().map(|m| m.id).collect();
                if ids.is_empty() {
                    Ok(vec![self.default_model_id.clone()])
                } else {
                    Ok(ids)
                }
            }
            Err(_) => Ok(vec![self.default_model_id.clone()]),
        }
    }

    async fn stream_chat(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSpec],
        model_id: &str,
    ) -> Result<FrameStream, ProviderError> {
        let request_messages = messages
            .iter()
            .map(Self::to_request_message)
            .collect::<Result<Vec<_>, _>>()?;

        let mut builder = CreateChatCompletionRequestArgs::default();
        builder.model(model_id).messages(request_messages).stream(true);
        if !tools.is_empty() {
            builder.tools(tools.iter().map(Self::to_tool_def).collect::<Vec<_>>());
        }
        let request = builder
            .build()
            .map_err(|e| ProviderError::Protocol(e.to_string()))?;

        let upstream = self
            .client
            .chat()
            .create_stream(request)
            .await
            .map_err(|e| ProviderError::Unavailable(e.to_string()))?;

        let state = ReassembleState {
            upstream,
            pending: HashMap::new(),
            order: Vec::new(),
            queue: VecDeque::new(),
            done: false,
        };
        let frames = futures_util::stream::unfold(state, Self::reassemble_next);
        Ok(Box::pin(frames))
    }
}

#[derive(Default)]
struct ToolCallAccumulator {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

/// Buffers an in-progress OpenAI-compatible SSE stream so it can be polled one whole
/// tool call (or content chunk) at a time.
struct ReassembleState {
    upstream: async_openai::types::ChatCompletionResponseStream,
    pending: HashMap<u32, ToolCallAccumulator>,
    order: Vec<u32>,
    queue: VecDeque<StreamFrame>,
    done: bool,
}

impl OpenAiProvider {
    /// Drains `state.queue` before pulling another chunk upstream, and flushes every
    /// accumulated tool call as a single complete `ToolCallDelta` frame once the
    /// provider reports the round finished.
    async fn reassemble_next(mut state: ReassembleState) -> Option<(StreamFrame, ReassembleState)> {
        loop {
            if let Some(frame) = state.queue.pop_front() {
                return Some((frame, state));
            }
            if state.done {
                return None;
            }
            match state.upstream.next().await {
                Some(Ok(resp)) => {
                    let Some(choice) = resp.choices.into_iter().next() else {
                        state.queue.push_back(StreamFrame::Error("empty choices in stream chunk".into()));
                        continue;
                    };
                    if let Some(tool_calls) = choice.delta.tool_calls {
                        for tc in tool_calls {
                            let idx = tc.index as u32;
                            if !state.pending.contains_key(&idx) {
                                state.order.push(idx);
                                state.pending.insert(idx, ToolCallAccumulator::default());
                            }
                            let entry = state.pending.get_mut(&idx).expect("just inserted");
                            if let Some(id) = tc.id {
                                entry.id = Some(id);
                            }
                            if let Some(f) = tc.function {
                                if let Some(name) = f.name {
                                    entry.name = Some(name);
                                }
                                if let Some(args) = f.arguments {
                                    entry.arguments.push_str(&args);
                                }
                            }
                        }
                        continue;
                    }
                    if let Some(content) = choice.delta.content {
                        if !content.is_empty() {
                            state.queue.push_back(StreamFrame::ContentDelta(content));
                            continue;
                        }
                    }
                    if choice.finish_reason.is_some() {
                        Self::flush_pending(&mut state);
                        state.queue.push_back(StreamFrame::Done);
                        state.done = true;
                        continue;
                    }
                    state.queue.push_back(StreamFrame::Thinking(String::new()));
                }
                Some(Err(e)) => {
                    state.queue.push_back(StreamFrame::Error(e.to_string()));
                    state.done = true;
                }
                None => {
                    // Upstream closed without a finish_reason chunk: flush whatever
                    // tool calls were in flight rather than drop them silently.
                    Self::flush_pending(&mut state);
                    state.queue.push_back(StreamFrame::Done);
                    state.done = true;
                }
            }
        }
    }

    fn flush_pending(state: &mut ReassembleState) {
        for idx in state.order.drain(..) {
            if let Some(acc) = state.pending.remove(&idx) {
                state.queue.push_back(StreamFrame::ToolCallDelta {
                    call_index: idx,
                    id: acc.id,
                    name: acc.name,
                    arguments_delta: acc.arguments,
                });
            }
        }
    }
}

/// Tracks which model id the host should use, persisted across restarts via the
/// `app_settings` table so `PROVIDER_API_KEY`/`DEFAULT_MODEL_ID` only govern the
/// first run.
pub struct ModelRegistry {
    store: Store,
    configured_default: String,
}

impl ModelRegistry {
    pub fn new(store: Store, configured_default: String) -> Self {
        Self {
            store,
            configured_default,
        }
    }

    pub async fn current_model(&self) -> Result<String, ProviderError> {
        Ok(self
            .store
            .setting_get(CURRENT_MODEL_SETTING_KEY)
            .await?
            .unwrap_or_else(|| self.configured_default.clone()))
    }

    pub async fn set_model(&self, model_id: &str) -> Result<(), ProviderError> {
        Ok(self
            .store
            .setting_put(CURRENT_MODEL_SETTING_KEY, model_id)
            .await?)
    }
}
