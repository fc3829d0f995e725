//! Retrieval Index (C3): chunks active rule-context rows, embeds them, and answers
//! nearest-neighbour queries per session. State is kept per session as a small state
//! machine (`Empty -> Building -> Ready`) behind a `DashMap`, with a disk cache keyed
//! by a content hash of the rows that produced it so an unchanged rule set never pays
//! to re-embed after a process restart.

mod cache;
mod chunk;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::store::{RuleContextRow, Store, StoreError};

pub use chunk::Chunk;

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("embedding: {0}")]
    Embedding(String),
    #[error("cache io: {0}")]
    Io(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Turns text into embedding vectors. A pure-function collaborator (per call, no
/// hidden state) so it can be backed by a local model, a remote provider, or — in
/// tests — a deterministic stub.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RetrievalError>;

    /// Identifier recorded in `meta.json` alongside a cache entry, so a later reader
    /// can tell which embedding model produced it.
    fn model_id(&self) -> &str;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexStatus {
    Empty,
    Building,
    Ready { n_chunks: usize },
}

/// The full status surface: `ready`/`building` flags plus chunk count and the content
/// hash of the rows the current `ready` structure (if any) was built from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetrievalStatus {
    pub ready: bool,
    pub building: bool,
    pub n_chunks: usize,
    pub rules_hash: Option<String>,
}

struct SessionState {
    status: IndexStatus,
    rules_hash: Option<String>,
    chunks: Vec<Chunk>,
    embeddings: Vec<Vec<f32>>,
    /// Bumped on every rebuild request; a running build checks this before publishing
    /// its result so a superseded build never clobbers a newer one ("last writer
    /// wins" via the writer itself noticing it's stale, not via cancellation).
    generation: u64,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            status: IndexStatus::Empty,
            rules_hash: None,
            chunks: Vec::new(),
            embeddings: Vec::new(),
            generation: 0,
        }
    }
}

#[derive(Clone, Debug)]
pub struct RetrievedChunk {
    pub chunk_id: String,
    pub text: String,
    pub score: f32,
    pub source_row_id: i64,
    pub filename: Option<String>,
}

pub struct RetrievalIndex {
    store: Store,
    embedder: Arc<dyn Embedder>,
    cache_root: PathBuf,
    sessions: DashMap<String, Arc<RwLock<SessionState>>>,
    generation_counter: AtomicU64,
}

impl RetrievalIndex {
    pub fn new(store: Store, embedder: Arc<dyn Embedder>, cache_root: PathBuf) -> Self {
        Self {
            store,
            embedder,
            cache_root,
            sessions: DashMap::new(),
            generation_counter: AtomicU64::new(0),
        }
    }

    fn session_cell(&self, session_key: &str) -> Arc<RwLock<SessionState>> {
        self.sessions
            .entry(session_key.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(SessionState::default())))
            .clone()
    }

    pub async fn status(&self, session_key: &str) -> IndexStatus {
        self.session_cell(session_key).read().await.status
    }

    /// The API-surface status: ready/building flags, chunk count, and the rules hash
    /// the current `ready` structure (if any) was built from.
    pub async fn full_status(&self, session_key: &str) -> RetrievalStatus {
        let state = self.session_cell(session_key).read().await;
        let (ready, building, n_chunks) = match state.status {
            IndexStatus::Empty => (false, false, 0),
            IndexStatus::Building => (false, true, state.chunks.len()),
            IndexStatus::Ready { n_chunks } => (true, false, n_chunks),
        };
        RetrievalStatus {
            ready,
            building,
            n_chunks,
            rules_hash: state.rules_hash.clone(),
        }
    }

    /// Rebuilds the index for `session_key` from the session's currently active rows.
    /// Marks the session `Building` immediately (synchronously, before returning) so a
    /// concurrent `status()` call observes the in-progress state right away, then
    /// chunks, embeds, and either serves from the on-disk cache (if `rules_hash`
    /// matches) or computes fresh and writes the cache.
    pub async fn rebuild(&self, session_id: &str) -> Result<(), RetrievalError> {
        let cell = self.session_cell(session_id);
        let my_generation = self.generation_counter.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut state = cell.write().await;
            state.status = IndexStatus::Building;
            state.generation = my_generation;
        }

        let rows = self
            .store
            .list_active_rule_context(Some(session_id.to_string()))
            .await?;
        let hash = cache::rules_hash(&rows);
        let chunks = chunk::chunk_rows(&rows);

        let embeddings = if let Some(cached) = cache::load(&self.cache_root, &hash, self.embedder.model_id())
            .map_err(|e| RetrievalError::Io(e.to_string()))?
        {
            cached
        } else {
            let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
            let raw = if texts.is_empty() {
                Vec::new()
            } else {
                self.embedder.encode(&texts).await?
            };
            let normalized: Vec<Vec<f32>> = raw.into_iter().map(normalize).collect();
            cache::store(&self.cache_root, &hash, &chunks, &normalized, self.embedder.model_id())
                .map_err(|e| RetrievalError::Io(e.to_string()))?;
            normalized
        };

        let mut state = cell.write().await;
        if state.generation != my_generation {
            // A newer rebuild was requested while this one ran; drop our result.
            return Ok(());
        }
        state.status = IndexStatus::Ready {
            n_chunks: chunks.len(),
        };
        state.rules_hash = Some(hash);
        state.chunks = chunks;
        state.embeddings = embeddings;
        Ok(())
    }

    /// Returns the top `k` chunks by inner-product similarity to `query`. An empty or
    /// still-building index returns an empty list rather than an error: callers treat
    /// "no context yet" as a normal, expected state.
    pub async fn retrieve(&self, session_id: &str, query: &str, k: usize) -> Result<Vec<RetrievedChunk>, RetrievalError> {
        let cell = self.session_cell(session_id);
        let state = cell.read().await;
        if state.chunks.is_empty() {
            return Ok(Vec::new());
        }
        drop(state);

        let query_vec = {
            let raw = self.embedder.encode(&[query.to_string()]).await?;
            raw.into_iter().next().map(normalize).ok_or_else(|| {
                RetrievalError::Embedding("embedder returned no vector for query".into())
            })?
        };

        let state = cell.read().await;
        let mut scored: Vec<(f32, usize)> = state
            .embeddings
            .iter()
            .enumerate()
            .map(|(i, v)| (inner_product(&query_vec, v), i))
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .map(|(score, i)| {
                let c = &state.chunks[i];
                RetrievedChunk {
                    chunk_id: c.chunk_id.clone(),
                    text: c.text.clone(),
                    score,
                    source_row_id: c.source_row_id,
                    filename: c.filename.clone(),
                }
            })
            .collect())
    }
}

fn normalize(v: Vec<f32>) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm == 0.0 {
        v
    } else {
        v.into_iter().map(|x| x / norm).collect()
    }
}

fn inner_product(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}
