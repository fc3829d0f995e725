//! Enumerated runtime settings (data paths, provider endpoint, safety caps) read from the
//! process environment after [`crate::load_and_apply`] has merged `.env` and XDG config.

use std::path::PathBuf;

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Runtime configuration enumerated by the host, read from environment variables with
/// documented defaults. Constructed once at process start via [`RuntimeConfig::from_env`].
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    pub data_root: PathBuf,
    pub db_path: PathBuf,
    pub provider_base_url: String,
    pub provider_api_key: Option<String>,
    pub default_model_id: String,
    pub embedding_model_id: String,
    pub max_upload_bytes: u64,
    pub max_url_bytes: u64,
    pub url_timeout_seconds: u64,
    pub max_redirects: u32,
    pub max_tool_rounds: u32,
    pub max_total_tool_calls: u32,
    pub tool_call_timeout_seconds: u64,
    pub repo_root: PathBuf,
}

impl RuntimeConfig {
    /// Reads every enumerated setting from the current process environment.
    /// Call after [`crate::load_and_apply`] so `.env`/XDG values have been applied.
    pub fn from_env() -> Self {
        let data_root = PathBuf::from(env_string("DATA_ROOT", "./data"));
        let db_path = std::env::var("DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_root.join("app.db"));
        let repo_root = std::env::var("REPO_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

        Self {
            data_root,
            db_path,
            provider_base_url: env_string("PROVIDER_BASE_URL", "http://localhost:11434/v1"),
            provider_api_key: std::env::var("PROVIDER_API_KEY").ok(),
            default_model_id: env_string("DEFAULT_MODEL_ID", "default"),
            embedding_model_id: env_string("EMBEDDING_MODEL_ID", "default"),
            max_upload_bytes: env_u64("MAX_UPLOAD_BYTES", 10 * 1024 * 1024),
            max_url_bytes: env_u64("MAX_URL_BYTES", 2 * 1024 * 1024),
            url_timeout_seconds: env_u64("URL_TIMEOUT_SECONDS", 10),
            max_redirects: env_usize("MAX_REDIRECTS", 3) as u32,
            max_tool_rounds: env_usize("MAX_TOOL_ROUNDS", 4) as u32,
            max_total_tool_calls: env_usize("MAX_TOTAL_TOOL_CALLS", 15) as u32,
            tool_call_timeout_seconds: env_u64("TOOL_CALL_TIMEOUT_SECONDS", 30),
            repo_root,
        }
    }
}
