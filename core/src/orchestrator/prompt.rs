//! Assembles the message list sent to the provider: a persona/instruction preamble,
//! retrieved rule chunks folded in as system context, then the session's message
//! history verbatim.

use crate::message::ChatMessage;
use crate::retrieval::RetrievedChunk;
use crate::store::{Message, Role};
use crate::tool_source::ToolSpec;

const PERSONA: &str = "You are a focused project assistant. Use the active rules and \
    retrieved context below when they're relevant, and call tools when a request maps \
    directly onto one. Keep answers concise.";

pub fn build_prompt(
    history: &[Message],
    retrieved: &[RetrievedChunk],
    tools: &[ToolSpec],
) -> Vec<ChatMessage> {
    let mut messages = vec![ChatMessage::System(PERSONA.to_string())];

    if !retrieved.is_empty() {
        let mut context = String::from("Retrieved context:\n");
        for chunk in retrieved {
            context.push_str("- [");
            context.push_str(&chunk.chunk_id);
            context.push_str("] ");
            context.push_str(&chunk.text);
            context.push('\n');
        }
        messages.push(ChatMessage::System(context));
    }

    if !tools.is_empty() {
        let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
        messages.push(ChatMessage::System(format!(
            "Available tools: {}",
            names.join(", ")
        )));
    }

    for msg in history {
        let chat = match msg.role {
            Role::User => ChatMessage::User(msg.content.clone()),
            Role::Assistant => ChatMessage::Assistant(msg.content.clone()),
            Role::System => ChatMessage::System(msg.content.clone()),
        };
        messages.push(chat);
    }

    messages
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history_msg(role: Role, content: &str) -> Message {
        Message {
            id: 1,
            session_id: "s".into(),
            role,
            content: content.to_string(),
            metadata: None,
            created_at: "now".into(),
        }
    }

    #[test]
    fn includes_persona_then_history_in_order() {
        let history = vec![
            history_msg(Role::User, "hi"),
            history_msg(Role::Assistant, "hello"),
        ];
        let messages = build_prompt(&history, &[], &[]);
        assert_eq!(messages.len(), 3);
        assert!(matches!(messages[0], ChatMessage::System(_)));
        assert_eq!(messages[1].text(), "hi");
        assert_eq!(messages[2].text(), "hello");
    }

    #[test]
    fn folds_retrieved_chunks_into_system_context() {
        let retrieved = vec![RetrievedChunk {
            chunk_id: "1:0".into(),
            text: "never commit secrets".into(),
            score: 0.9,
            source_row_id: 1,
            filename: None,
        }];
        let messages = build_prompt(&[], &retrieved, &[]);
        assert!(messages.iter().any(|m| m.text().contains("never commit secrets")));
    }

    #[test]
    fn tags_retrieved_chunks_with_their_stable_chunk_id() {
        let retrieved = vec![RetrievedChunk {
            chunk_id: "42:3".into(),
            text: "some rule".into(),
            score: 0.5,
            source_row_id: 42,
            filename: None,
        }];
        let messages = build_prompt(&[], &retrieved, &[]);
        assert!(messages.iter().any(|m| m.text().contains("[42:3]")));
    }

    #[test]
    fn no_retrieved_chunks_means_no_context_message() {
        let messages = build_prompt(&[], &[], &[]);
        assert_eq!(messages.len(), 1, "only the persona message");
    }
}
