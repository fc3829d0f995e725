//! # hearth-core
//!
//! The runtime behind an offline, local-first conversational agent host: a SQLite
//! store, a context ingestor that turns pasted text / uploaded files / fetched URLs
//! into active rule context, a retrieval index over that context, a closed tool
//! registry, a stream orchestrator that drives one turn at a time, an artifact/export
//! layer, and a provider adapter talking to an OpenAI-compatible chat endpoint.
//!
//! ## Main modules
//!
//! - [`store`]: [`store::Store`] — sessions, messages, tasks, artifacts, rule-context
//!   rows, and settings, with migrations applied at [`store::Store::open`].
//! - [`ingest`]: [`ingest::Ingestor`] — text/file/URL ingestion into rule-context rows.
//! - [`retrieval`]: [`retrieval::RetrievalIndex`] — per-session chunk/embed/search
//!   with an on-disk cache keyed by a content hash of the active rows.
//! - [`tool_source`]: [`tool_source::ToolRegistry`] — the nine named tools the
//!   orchestrator may call.
//! - [`provider`]: [`provider::Provider`], [`provider::OpenAiProvider`],
//!   [`provider::ModelRegistry`] — the chat-completions adapter and model selection.
//! - [`orchestrator`]: [`orchestrator::Orchestrator`] — drives one turn: prompt
//!   assembly, streaming, bounded tool-calling rounds, persistence.
//! - [`export`]: [`export::ArtifactDeriver`], [`export::build_submission_pack`] —
//!   artifact derivation and the deterministic ZIP submission pack.
//! - [`message`]: [`message::ChatMessage`] — the provider-facing chat message type.
//! - [`error`]: [`error::HostError`] — the crate-wide error taxonomy.

pub mod error;
pub mod export;
pub mod ingest;
pub mod message;
pub mod orchestrator;
pub mod provider;
pub mod retrieval;
pub mod store;
pub mod tool_source;

pub use error::HostError;
pub use message::ChatMessage;
pub use orchestrator::{EndReason, Orchestrator, OrchestratorEvent, OrchestratorLimits};
pub use provider::{ModelRegistry, OpenAiProvider, Provider, StreamFrame};
pub use retrieval::{Embedder, IndexStatus, RetrievalError, RetrievalIndex, RetrievalStatus};
pub use store::Store;
pub use tool_source::ToolRegistry;

/// When running `cargo test -p hearth-core`, initializes tracing from `RUST_LOG` so
/// unit tests can print logs with `--nocapture`.
#[cfg(test)]
mod test_logging {
    use ctor::ctor;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::Layer;

    #[ctor]
    fn init() {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_test_writer()
                    .with_filter(filter),
            )
            .try_init();
    }
}
