//! Splits active rule-context rows into retrievable chunks, keeping provenance back to
//! the row each chunk came from.

use serde::{Deserialize, Serialize};

use crate::store::RuleContextRow;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Chunk {
    /// Stable across rebuilds of unchanged content: `"<source_row_id>:<index within
    /// that row>"`, since a row's blank-line split is itself deterministic.
    pub chunk_id: String,
    pub text: String,
    pub source_row_id: i64,
    pub filename: Option<String>,
}

/// Splits a row's content on blank lines into paragraph-sized chunks. A row with no
/// blank line becomes a single chunk.
fn split_blank_lines(content: &str) -> Vec<String> {
    content
        .split("\n\n")
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .map(|p| p.to_string())
        .collect()
}

pub fn chunk_rows(rows: &[RuleContextRow]) -> Vec<Chunk> {
    let mut out = Vec::new();
    for row in rows {
        for (idx, text) in split_blank_lines(&row.content).into_iter().enumerate() {
            out.push(Chunk {
                chunk_id: format!("{}:{}", row.id, idx),
                text,
                source_row_id: row.id,
                filename: row.filename.clone(),
            });
        }
    }
    out
}
