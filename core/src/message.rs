//! Provider-facing chat message type, distinct from the persisted [`crate::store::Message`]
//! row: this is what gets sent to the Provider Adapter on each round of a turn.

/// One message in a conversation sent to the provider: system instructions, a user
/// turn, or a prior assistant turn (including synthetic tool-result turns, which are
/// represented as `Assistant` content appended by the orchestrator after a tool call).
#[derive(Clone, Debug)]
pub enum ChatMessage {
    System(String),
    User(String),
    Assistant(String),
    /// Tool execution result fed back to the provider as part of the conversation,
    /// named by the tool call id it answers.
    Tool { tool_call_id: String, content: String },
}

impl ChatMessage {
    pub fn text(&self) -> &str {
        match self {
            ChatMessage::System(s)
            | ChatMessage::User(s)
            | ChatMessage::Assistant(s)
            | ChatMessage::Tool { content: s, .. } => s,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_extracts_content_for_every_variant() {
        assert_eq!(ChatMessage::System("a".into()).text(), "a");
        assert_eq!(ChatMessage::User("b".into()).text(), "b");
        assert_eq!(ChatMessage::Assistant("c".into()).text(), "c");
        assert_eq!(
            ChatMessage::Tool {
                tool_call_id: "1".into(),
                content: "d".into()
            }
            .text(),
            "d"
        );
    }
}
