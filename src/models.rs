//! # Database models
//!
//! Data structures for the embedding store written by the external ingestion
//! tool and read (never written) by this crate.
//!
//! - [`EmbeddingRow`]: one raw row of the `embeddings` table, as Diesel sees it.
//! - [`EmbeddingRecord`]: the decoded, immutable form held in memory.
//!
//! The `embedding` column is a blob of 4-byte little-endian IEEE-754 floats;
//! see [`crate::vector_store::decode_embedding`].
use diesel::prelude::*;

/// A row of the `embeddings` table.
#[derive(Queryable, Selectable, Debug, Clone)]
#[diesel(table_name = crate::schema::embeddings)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct EmbeddingRow {
    pub id: i32,
    pub chunk: String,
    pub embedding: Vec<u8>,
}

/// A chunk of source text with its embedding vector.
///
/// Records are loaded once and shared read-only for the life of the process.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingRecord {
    pub id: i32,
    pub chunk: String,
    pub vector: Vec<f32>,
}
