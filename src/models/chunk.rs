//! Represents one uploaded piece of a file.

use base64::{Engine as _, engine::general_purpose};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::models::file_entry::new_short_id;

/// Decimal width of the index before it is encoded into a block id.
const BLOCK_INDEX_WIDTH: usize = 6;

/// Highest chunk count whose indices all fit in `BLOCK_INDEX_WIDTH` digits
/// and stay within the block-blob block limit.
pub const MAX_TOTAL_CHUNKS: u32 = 50_000;

/// A recorded chunk upload. One row per `(file_id, chunk_index)`.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    pub id: String,

    /// Owning file entry.
    pub file_id: String,

    /// Zero-based position of the chunk in the final object.
    pub chunk_index: u32,

    /// Size in bytes.
    pub chunk_size: i64,

    /// Client-supplied hash of the chunk payload.
    pub chunk_hash: String,

    pub uploaded_at: DateTime<Utc>,
}

impl Chunk {
    pub fn new(file_id: &str, chunk_index: u32, chunk_size: i64, chunk_hash: &str) -> Self {
        Self {
            id: new_short_id(),
            file_id: file_id.to_string(),
            chunk_index,
            chunk_size,
            chunk_hash: chunk_hash.to_string(),
            uploaded_at: Utc::now(),
        }
    }

    pub fn block_id(&self) -> String {
        block_id_for(self.chunk_index)
    }
}

/// Block id for a chunk index: base64 of the zero-padded decimal index.
///
/// Depends on nothing but the index, so re-staging an index always targets
/// the same block.
pub fn block_id_for(chunk_index: u32) -> String {
    general_purpose::STANDARD.encode(format!(
        "{:0width$}",
        chunk_index,
        width = BLOCK_INDEX_WIDTH
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_ids_are_fixed_width_and_stable() {
        assert_eq!(block_id_for(0), "MDAwMDAw");
        assert_eq!(block_id_for(1), "MDAwMDAx");
        assert_eq!(block_id_for(0), block_id_for(0));
        assert_eq!(block_id_for(7).len(), block_id_for(MAX_TOTAL_CHUNKS - 1).len());
    }

    #[test]
    fn chunk_block_id_matches_its_index() {
        let chunk = Chunk::new("file1", 42, 10, "abc");
        assert_eq!(chunk.block_id(), block_id_for(42));
    }
}
