//! `hearth`: serve, migrate, and health-check the agent host.
//!
//! - `hearth serve` (default): reads lines from stdin as user turns against a single
//!   session, printing each orchestrator event as a line of JSON to stdout.
//! - `hearth migrate`: applies pending schema migrations and exits.
//! - `hearth health`: checks the store opens and the provider is reachable.
//!
//! Exit codes: `0` success, `2` configuration error, `3` migration failure, `1` other
//! fatal error.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use hearth_config::RuntimeConfig;
use hearth_core::ingest::{IngestLimits, Ingestor};
use hearth_core::orchestrator::OrchestratorLimits;
use hearth_core::provider::{ModelRegistry, OpenAiProvider, Provider};
use hearth_core::retrieval::RetrievalIndex;
use hearth_core::tool_source::ToolRegistry;
use hearth_core::{EndReason, Orchestrator, OrchestratorEvent, Store};

#[derive(Parser)]
#[command(name = "hearth", about = "Offline, local-first conversational agent host")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Drive turns against a single session from stdin (default).
    Serve {
        #[arg(long, default_value = "cli-session")]
        session_id: String,
    },
    /// Apply pending schema migrations and exit.
    Migrate,
    /// Check the store and provider are reachable.
    Health,
    /// Ingest pasted text, a file, or a URL as rule context and rebuild retrieval.
    Ingest {
        #[arg(long, default_value = "cli-session")]
        session_id: String,
        /// Pasted text body.
        #[arg(long, conflicts_with_all = ["file", "url"])]
        text: Option<String>,
        /// Path to a file to read and ingest (MIME inferred from extension).
        #[arg(long, conflicts_with_all = ["text", "url"])]
        file: Option<PathBuf>,
        /// URL to fetch and ingest.
        #[arg(long, conflicts_with_all = ["text", "file"])]
        url: Option<String>,
    },
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// A deterministic embedder stand-in: real deployments supply one backed by a local
/// embedding model or provider endpoint (see `hearth_core::retrieval::Embedder`).
/// Hashing-based so it's available offline with zero extra configuration. Carries
/// `model_id` from the resolved config rather than a hardcoded literal, so a cache
/// built under one `EMBEDDING_MODEL_ID` is correctly invalidated after the setting
/// changes.
struct HashingEmbedder {
    model_id: String,
}

#[async_trait::async_trait]
impl hearth_core::retrieval::Embedder for HashingEmbedder {
    async fn encode(
        &self,
        texts: &[String],
    ) -> Result<Vec<Vec<f32>>, hearth_core::retrieval::RetrievalError> {
        use sha2::{Digest, Sha256};
        Ok(texts
            .iter()
            .map(|t| {
                let digest = Sha256::digest(t.as_bytes());
                digest.iter().take(32).map(|b| *b as f32).collect()
            })
            .collect())
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}

fn main() -> ExitCode {
    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start async runtime: {e}");
            return ExitCode::from(1);
        }
    };
    rt.block_on(async_main())
}

async fn async_main() -> ExitCode {
    init_tracing();

    if let Err(e) = hearth_config::load_and_apply("hearth", None) {
        tracing::warn!(error = %e, "config load failed, continuing with process environment");
    }
    let config = RuntimeConfig::from_env();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Serve {
        session_id: "cli-session".to_string(),
    }) {
        Command::Migrate => run_migrate(&config.db_path).await,
        Command::Health => run_health(&config).await,
        Command::Serve { session_id } => run_serve(&config, &session_id).await,
        Command::Ingest { session_id, text, file, url } => {
            run_ingest(&config, &session_id, text.as_deref(), file.as_deref(), url.as_deref()).await
        }
    }
}

async fn run_migrate(db_path: &PathBuf) -> ExitCode {
    match Store::open(db_path) {
        Ok(_) => {
            println!("migrations applied");
            ExitCode::from(0)
        }
        Err(e) => {
            eprintln!("migration failed: {e}");
            ExitCode::from(3)
        }
    }
}

async fn run_health(config: &RuntimeConfig) -> ExitCode {
    let store = match Store::open(&config.db_path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("store unavailable: {e}");
            return ExitCode::from(1);
        }
    };
    if let Err(e) = store.setting_get("health_check").await {
        eprintln!("store unavailable: {e}");
        return ExitCode::from(1);
    }

    let provider = OpenAiProvider::new(
        &config.provider_base_url,
        config.provider_api_key.as_deref(),
        &config.default_model_id,
    );
    match provider.list_models().await {
        Ok(_) => {
            println!("ok");
            ExitCode::from(0)
        }
        Err(e) => {
            eprintln!("provider unavailable: {e}");
            ExitCode::from(1)
        }
    }
}

/// Logs the resolved data root, provider base URL, and model id once at startup, in
/// the spirit of a config-summary line without standing up a whole section-printing
/// framework for a host with a single LLM/embedding surface to report on.
fn log_config_summary(config: &RuntimeConfig) {
    tracing::info!(
        data_root = %config.data_root.display(),
        provider_base_url = %config.provider_base_url,
        model_id = %config.default_model_id,
        "resolved configuration"
    );
}

async fn run_serve(config: &RuntimeConfig, session_id: &str) -> ExitCode {
    log_config_summary(config);

    let store = match Store::open(&config.db_path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("store unavailable: {e}");
            return ExitCode::from(1);
        }
    };

    let retrieval = Arc::new(RetrievalIndex::new(
        store.clone(),
        Arc::new(HashingEmbedder {
            model_id: config.embedding_model_id.clone(),
        }),
        config.data_root.join("rag_cache"),
    ));
    let provider: Arc<dyn Provider> = Arc::new(OpenAiProvider::new(
        &config.provider_base_url,
        config.provider_api_key.as_deref(),
        &config.default_model_id,
    ));
    let models = Arc::new(ModelRegistry::new(store.clone(), config.default_model_id.clone()));
    let deriver = Arc::new(hearth_core::export::ArtifactDeriver::new(
        store.clone(),
        provider.clone(),
        models.clone(),
    ));
    let tools = Arc::new(ToolRegistry::new(
        store.clone(),
        config.repo_root.clone(),
        deriver,
    ));
    let orchestrator = Arc::new(Orchestrator::new(
        store,
        retrieval,
        tools,
        provider,
        models,
        OrchestratorLimits {
            max_tool_rounds: config.max_tool_rounds,
            max_total_tool_calls: config.max_total_tool_calls,
            tool_call_timeout: Duration::from_secs(config.tool_call_timeout_seconds),
            ..OrchestratorLimits::default()
        },
    ));

    let stdin = tokio::io::stdin();
    let mut lines = tokio::io::AsyncBufReadExt::lines(tokio::io::BufReader::new(stdin));
    loop {
        match tokio::io::AsyncBufReadExt::next_line(&mut lines).await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                let mut rx = orchestrator.clone().run_turn(session_id.to_string(), line);
                while let Some(event) = rx.recv().await {
                    print_event(&event);
                }
            }
            Ok(None) => break,
            Err(e) => {
                eprintln!("stdin read error: {e}");
                return ExitCode::from(1);
            }
        }
    }
    ExitCode::from(0)
}

/// Ingests exactly one of `text`/`file`/`url` as rule context for `session_id`, then
/// rebuilds the session's retrieval index so the new content is immediately
/// retrievable — without this, an ingested row sits inactive until the next turn's
/// lazy "if Empty" rebuild, which only fires when the index has never been built.
async fn run_ingest(
    config: &RuntimeConfig,
    session_id: &str,
    text: Option<&str>,
    file: Option<&std::path::Path>,
    url: Option<&str>,
) -> ExitCode {
    let store = match Store::open(&config.db_path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("store unavailable: {e}");
            return ExitCode::from(1);
        }
    };

    let ingestor = Ingestor::new(
        store.clone(),
        IngestLimits {
            max_upload_bytes: config.max_upload_bytes,
            max_url_bytes: config.max_url_bytes,
            url_timeout: Duration::from_secs(config.url_timeout_seconds),
            max_redirects: config.max_redirects as u8,
        },
    );

    let result = if let Some(text) = text {
        ingestor.ingest_text(Some(session_id.to_string()), text).await
    } else if let Some(path) = file {
        let bytes = match std::fs::read(path) {
            Ok(b) => b,
            Err(e) => {
                eprintln!("failed to read {}: {e}", path.display());
                return ExitCode::from(1);
            }
        };
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());
        let mime = match path.extension().and_then(|e| e.to_str()) {
            Some("md") => "text/markdown",
            Some("json") => "application/json",
            _ => "text/plain",
        };
        ingestor
            .ingest_file(Some(session_id.to_string()), &filename, &bytes, mime)
            .await
    } else if let Some(url) = url {
        ingestor.ingest_url(Some(session_id.to_string()), url).await
    } else {
        eprintln!("one of --text, --file, or --url is required");
        return ExitCode::from(2);
    };

    let row = match result {
        Ok(row) => row,
        Err(e) => {
            eprintln!("ingest failed: {e}");
            return ExitCode::from(1);
        }
    };

    let retrieval = RetrievalIndex::new(
        store,
        Arc::new(HashingEmbedder {
            model_id: config.embedding_model_id.clone(),
        }),
        config.data_root.join("rag_cache"),
    );
    if let Err(e) = retrieval.rebuild(session_id).await {
        eprintln!("ingested row {} but retrieval rebuild failed: {e}", row.id);
        return ExitCode::from(1);
    }

    println!("ingested row {} ({} bytes)", row.id, row.content.len());
    ExitCode::from(0)
}

fn print_event(event: &OrchestratorEvent) {
    match event {
        OrchestratorEvent::SessionInfo { session_id, model_id } => {
            println!(
                "{{\"type\":\"session_info\",\"session_id\":{session_id:?},\"model_id\":{model_id:?}}}"
            );
        }
        OrchestratorEvent::RuleChunks { chunks } => {
            let chunk_ids: Vec<&str> = chunks.iter().map(|c| c.chunk_id.as_str()).collect();
            let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
            println!(
                "{{\"type\":\"rule_chunks\",\"chunk_ids\":{},\"texts\":{}}}",
                serde_json::to_string(&chunk_ids).unwrap_or_default(),
                serde_json::to_string(&texts).unwrap_or_default(),
            );
        }
        OrchestratorEvent::Thinking(text) => {
            println!("{{\"type\":\"thinking\",\"text\":{text:?}}}");
        }
        OrchestratorEvent::ToolCalls(records) => {
            let calls: Vec<serde_json::Value> = records
                .iter()
                .map(|r| {
                    serde_json::json!({
                        "id": r.id,
                        "name": r.name,
                        "arguments": r.arguments,
                    })
                })
                .collect();
            println!(
                "{{\"type\":\"tool_calls\",\"tool_calls\":{}}}",
                serde_json::to_string(&calls).unwrap_or_default(),
            );
        }
        OrchestratorEvent::Token(text) => {
            use std::io::Write;
            print!("{text}");
            let _ = std::io::stdout().flush();
        }
        OrchestratorEvent::End { reason } => {
            println!();
            match reason {
                EndReason::Done => println!("{{\"type\":\"end\",\"reason\":\"complete\"}}"),
                EndReason::MaxRounds => println!("{{\"type\":\"end\",\"reason\":\"max_rounds\"}}"),
                EndReason::Error(e) => {
                    println!("{{\"type\":\"end\",\"reason\":\"error\",\"message\":{e:?}}}")
                }
            }
        }
    }
}
