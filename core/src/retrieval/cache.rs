//! On-disk retrieval cache: `<cache_root>/<rules_hash>/{chunks.json, embeddings.bin,
//! meta.json}`. Keyed by a SHA-256 hash of the active rule-context rows that produced
//! it, so an unchanged rule set is served straight from disk without re-embedding.

use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::chunk::Chunk;
use crate::store::RuleContextRow;

#[derive(Serialize, Deserialize)]
struct Meta {
    dim: usize,
    n_chunks: usize,
    embedding_model_id: String,
    created_at: String,
}

/// Content hash of the rows an index was built from: each row's id, content, and
/// filename, concatenated with separators the content itself can't forge (row ids are
/// monotonic integers, never free text).
pub fn rules_hash(rows: &[RuleContextRow]) -> String {
    let mut hasher = Sha256::new();
    for row in rows {
        hasher.update(row.id.to_le_bytes());
        hasher.update(b"\0");
        hasher.update(row.filename.as_deref().unwrap_or("").as_bytes());
        hasher.update(b"\0");
        hasher.update(row.content.as_bytes());
        hasher.update(b"\x1e");
    }
    hex::encode(hasher.finalize())
}

fn dir_for(cache_root: &Path, hash: &str) -> PathBuf {
    cache_root.join(hash)
}

/// Loads a cache entry for `hash`, or `None` if no entry exists, it's corrupt, or it
/// was built by a different embedding model than `expected_model_id` — a stale
/// cross-model entry is treated as a cache miss rather than silently reused, per
/// spec.md's "if meta.dim == D, load it; otherwise compute and write": a mismatched
/// model implies a mismatched `D`, so the dimension the cache was built with can no
/// longer be trusted against the live embedder's output.
pub fn load(
    cache_root: &Path,
    hash: &str,
    expected_model_id: &str,
) -> io::Result<Option<Vec<Vec<f32>>>> {
    let dir = dir_for(cache_root, hash);
    let meta_path = dir.join("meta.json");
    let embeddings_path = dir.join("embeddings.bin");
    if !meta_path.exists() || !embeddings_path.exists() {
        return Ok(None);
    }
    let meta: Meta = serde_json::from_slice(&std::fs::read(&meta_path)?)?;
    if meta.embedding_model_id != expected_model_id {
        return Ok(None);
    }
    let raw = std::fs::read(&embeddings_path)?;
    if meta.dim == 0 {
        return Ok(Some(vec![Vec::new(); meta.n_chunks]));
    }
    let expected_bytes = meta.n_chunks * meta.dim * 4;
    if raw.len() != expected_bytes {
        return Ok(None);
    }
    let mut out = Vec::with_capacity(meta.n_chunks);
    for chunk_bytes in raw.chunks_exact(meta.dim * 4) {
        let mut vec = Vec::with_capacity(meta.dim);
        for f in chunk_bytes.chunks_exact(4) {
            vec.push(f32::from_le_bytes([f[0], f[1], f[2], f[3]]));
        }
        out.push(vec);
    }
    Ok(Some(out))
}

pub fn store(
    cache_root: &Path,
    hash: &str,
    chunks: &[Chunk],
    embeddings: &[Vec<f32>],
    embedding_model_id: &str,
) -> io::Result<()> {
    let dir = dir_for(cache_root, hash);
    std::fs::create_dir_all(&dir)?;

    std::fs::write(dir.join("chunks.json"), serde_json::to_vec(chunks)?)?;

    let dim = embeddings.first().map(|v| v.len()).unwrap_or(0);
    let mut raw = Vec::with_capacity(embeddings.len() * dim * 4);
    for v in embeddings {
        for f in v {
            raw.extend_from_slice(&f.to_le_bytes());
        }
    }
    std::fs::write(dir.join("embeddings.bin"), raw)?;

    let meta = Meta {
        dim,
        n_chunks: embeddings.len(),
        embedding_model_id: embedding_model_id.to_string(),
        created_at: chrono::Utc::now().to_rfc3339(),
    };
    std::fs::write(dir.join("meta.json"), serde_json::to_vec(&meta)?)?;
    Ok(())
}
