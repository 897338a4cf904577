//! # VectorStore
//!
//! Read-only access to the embedding store written by the ingestion tool.
//!
//! The store is a SQLite table of `(id, chunk, embedding)` rows where
//! `embedding` is a blob of 4-byte little-endian IEEE-754 floats. This module:
//!
//! - **Decodes** embedding blobs ([`decode_embedding`]) and encodes them back
//!   ([`encode_embedding`]) in the same layout the ingestion side writes.
//! - **Loads** the whole table into an [`EmbeddingSnapshot`], an immutable,
//!   cheaply cloned view shared by every session without locking.
//! - **Reports** whether the store is populated ([`store_status`]).
//!
//! ## Snapshot invariant
//! Every vector in one snapshot has the same non-zero dimensionality. Rows
//! that cannot be decoded, hold no floats, or whose dimension disagrees with
//! the first accepted row, are skipped with a warning instead of failing the
//! load.
//!
//! ## Quick Example
//! ```no_run
//! use awful_rag::vector_store::EmbeddingSnapshot;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let snapshot = EmbeddingSnapshot::load("rag.db")?;
//! println!("{} embeddings of dimension {:?}", snapshot.len(), snapshot.dimension());
//! # Ok(()) }
//! ```

use diesel::dsl::count_star;
use diesel::prelude::*;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::establish_connection;
use crate::error::{RagError, Result};
use crate::models::{EmbeddingRecord, EmbeddingRow};
use crate::schema::embeddings;

/// Decode an embedding blob into its float values.
///
/// # Errors
/// Returns [`RagError::Store`] if the blob length is not a multiple of 4.
pub fn decode_embedding(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(RagError::Store(format!(
            "invalid byte length {} for float32 array",
            bytes.len()
        )));
    }

    Ok(bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

/// Encode floats the way the ingestion tool stores them.
pub fn encode_embedding(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Whether the store holds anything, and how much.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub struct StoreStatus {
    pub populated: bool,
    pub count: i64,
}

/// Row count of the `embeddings` table; `populated` is `count > 0`.
pub fn store_status(conn: &mut SqliteConnection) -> Result<StoreStatus> {
    let count: i64 = embeddings::table.select(count_star()).first(conn)?;
    Ok(StoreStatus {
        populated: count > 0,
        count,
    })
}

/// Open the store at `db_path` and report its status.
pub fn store_status_at(db_path: &str) -> Result<StoreStatus> {
    let mut conn = establish_connection(db_path)?;
    let status = store_status(&mut conn)?;
    debug!(populated = status.populated, count = status.count, "Store status for {db_path}");
    Ok(status)
}

/// Read and decode every row, enforcing the single-dimension invariant.
pub fn load_embeddings(conn: &mut SqliteConnection) -> Result<Vec<EmbeddingRecord>> {
    let rows: Vec<EmbeddingRow> = embeddings::table
        .select(EmbeddingRow::as_select())
        .order(embeddings::id.asc())
        .load(conn)?;

    let mut records = Vec::with_capacity(rows.len());
    let mut dimension: Option<usize> = None;

    for row in rows {
        let vector = match decode_embedding(&row.embedding) {
            Ok(v) => v,
            Err(e) => {
                warn!(id = row.id, "Error decoding embedding: {e}");
                continue;
            }
        };

        if vector.is_empty() {
            warn!(id = row.id, "Skipping empty embedding");
            continue;
        }

        match dimension {
            None => dimension = Some(vector.len()),
            Some(d) if d != vector.len() => {
                warn!(
                    id = row.id,
                    expected = d,
                    found = vector.len(),
                    "Skipping embedding with mismatched dimension"
                );
                continue;
            }
            Some(_) => {}
        }

        records.push(EmbeddingRecord {
            id: row.id,
            chunk: row.chunk,
            vector,
        });
    }

    debug!("Decoded {} embedding rows", records.len());
    Ok(records)
}

/// Process-lifetime, read-only view of the embedding store.
#[derive(Debug, Clone, Default)]
pub struct EmbeddingSnapshot {
    records: Arc<[EmbeddingRecord]>,
}

impl EmbeddingSnapshot {
    pub fn new(records: Vec<EmbeddingRecord>) -> Self {
        Self {
            records: records.into(),
        }
    }

    /// Open the store at `db_path` and load every row.
    pub fn load(db_path: &str) -> Result<Self> {
        let mut conn = establish_connection(db_path)?;
        let records = load_embeddings(&mut conn)?;
        info!("Loaded {} embeddings from {}", records.len(), db_path);
        Ok(Self::new(records))
    }

    pub fn records(&self) -> &[EmbeddingRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Dimension shared by every vector, or `None` for an empty snapshot.
    pub fn dimension(&self) -> Option<usize> {
        self.records.first().map(|r| r.vector.len())
    }
}
