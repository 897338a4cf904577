//! # Similarity scoring and ranking
//!
//! Cosine similarity between embedding vectors, and the top-K ranker built on
//! it. Both search backends rank through [`rank`], so ordering and tie-breaking
//! are identical whichever one answered the query.
//!
//! ## Ordering
//! Results are sorted by descending similarity. Candidates with equal scores
//! keep their input order (the sort is stable), which makes rankings
//! reproducible for a given snapshot.
//!
//! ```rust
//! use awful_rag::models::EmbeddingRecord;
//! use awful_rag::similarity::rank;
//!
//! let corpus = vec![
//!     EmbeddingRecord { id: 1, chunk: "cat".into(), vector: vec![1.0, 0.0] },
//!     EmbeddingRecord { id: 2, chunk: "dog".into(), vector: vec![0.0, 1.0] },
//! ];
//! let top = rank(&[1.0, 0.0], &corpus, 1);
//! assert_eq!(top[0].chunk, "cat");
//! assert!((top[0].similarity - 1.0).abs() < 1e-9);
//! ```

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::models::EmbeddingRecord;

/// A chunk paired with its similarity to the query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredChunk {
    pub chunk: String,
    pub similarity: f64,
}

/// Anything the ranker can score: a text and the vector that represents it.
pub trait Candidate {
    fn chunk(&self) -> &str;
    fn vector(&self) -> &[f32];
}

impl Candidate for EmbeddingRecord {
    fn chunk(&self) -> &str {
        &self.chunk
    }

    fn vector(&self) -> &[f32] {
        &self.vector
    }
}

impl Candidate for (String, Vec<f32>) {
    fn chunk(&self) -> &str {
        &self.0
    }

    fn vector(&self) -> &[f32] {
        &self.1
    }
}

/// Cosine of the angle between `a` and `b`.
///
/// Returns `0.0` when the lengths differ, when either vector has zero norm, or
/// when the inputs are not finite. Accumulation happens in `f64`.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() {
        return 0.0;
    }

    let (mut dot, mut norm_a, mut norm_b) = (0.0f64, 0.0f64, 0.0f64);
    for (&x, &y) in a.iter().zip(b) {
        let (x, y) = (f64::from(x), f64::from(y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    let score = dot / (norm_a.sqrt() * norm_b.sqrt());
    if score.is_finite() {
        score.clamp(-1.0, 1.0)
    } else {
        0.0
    }
}

/// Scores every candidate against `query` and returns the best `k`.
///
/// The result holds exactly `min(k, candidates.len())` items in non-increasing
/// similarity order; ties keep input order.
pub fn rank<C>(query: &[f32], candidates: &[C], k: usize) -> Vec<ScoredChunk>
where
    C: Candidate + Sync,
{
    if k == 0 || candidates.is_empty() {
        return Vec::new();
    }

    // collect() on an indexed parallel iterator preserves input order
    let mut scored: Vec<(usize, f64)> = candidates
        .par_iter()
        .enumerate()
        .map(|(i, c)| (i, cosine_similarity(query, c.vector())))
        .collect();

    scored.sort_by(|a, b| b.1.total_cmp(&a.1));
    scored.truncate(k);

    scored
        .into_iter()
        .map(|(i, similarity)| ScoredChunk {
            chunk: candidates[i].chunk().to_string(),
            similarity,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: i32, chunk: &str, vector: Vec<f32>) -> EmbeddingRecord {
        EmbeddingRecord {
            id,
            chunk: chunk.to_string(),
            vector,
        }
    }

    #[test]
    fn identical_vectors_score_one() {
        let a = [0.3f32, -1.2, 4.5, 0.01];
        assert!((cosine_similarity(&a, &a) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn zero_vector_scores_zero() {
        let zero = [0.0f32; 3];
        assert_eq!(cosine_similarity(&zero, &zero), 0.0);
        assert_eq!(cosine_similarity(&zero, &[1.0, 2.0, 3.0]), 0.0);
    }

    #[test]
    fn mismatched_lengths_score_zero() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0, 0.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[1.0]), 0.0);
    }

    #[test]
    fn orthogonal_vectors_score_zero() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
    }

    #[test]
    fn opposite_vectors_score_minus_one() {
        assert!((cosine_similarity(&[1.0, 2.0], &[-1.0, -2.0]) + 1.0).abs() < 1e-9);
    }

    #[test]
    fn score_is_symmetric() {
        let pairs: [(&[f32], &[f32]); 3] = [
            (&[1.0, 2.0, 3.0], &[3.0, -2.0, 1.0]),
            (&[0.5, 0.5], &[0.1, 0.9]),
            (&[-4.0, 0.0, 2.5], &[1.0, 1.0, 1.0]),
        ];
        for (a, b) in pairs {
            assert_eq!(cosine_similarity(a, b), cosine_similarity(b, a));
        }
    }

    #[test]
    fn non_finite_input_scores_zero() {
        assert_eq!(cosine_similarity(&[f32::NAN, 1.0], &[1.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[f32::INFINITY, 1.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn rank_picks_the_closest_chunk() {
        let corpus = vec![record(1, "cat", vec![1.0, 0.0]), record(2, "dog", vec![0.0, 1.0])];
        let top = rank(&[1.0, 0.0], &corpus, 1);
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].chunk, "cat");
        assert!((top[0].similarity - 1.0).abs() < 1e-9);
    }

    #[test]
    fn rank_returns_min_of_k_and_len_sorted_descending() {
        let corpus = vec![
            record(1, "a", vec![0.2, 1.0]),
            record(2, "b", vec![1.0, 0.1]),
            record(3, "c", vec![-1.0, 0.0]),
            record(4, "d", vec![0.7, 0.7]),
        ];

        let top = rank(&[1.0, 0.0], &corpus, 3);
        assert_eq!(top.len(), 3);
        assert!(top.windows(2).all(|w| w[0].similarity >= w[1].similarity));
        assert_eq!(
            top.iter().map(|s| s.chunk.as_str()).collect::<Vec<_>>(),
            vec!["b", "d", "a"]
        );

        assert_eq!(rank(&[1.0, 0.0], &corpus, 10).len(), 4);
        assert!(rank(&[1.0, 0.0], &corpus, 0).is_empty());
    }

    #[test]
    fn rank_of_empty_corpus_is_empty() {
        let corpus: Vec<EmbeddingRecord> = Vec::new();
        assert!(rank(&[1.0, 0.0], &corpus, 5).is_empty());
    }

    #[test]
    fn ties_keep_input_order() {
        let corpus = vec![
            record(1, "low", vec![0.0, 1.0]),
            record(2, "first", vec![2.0, 0.0]),
            record(3, "second", vec![1.0, 0.0]),
            record(4, "third", vec![5.0, 0.0]),
        ];
        let top = rank(&[1.0, 0.0], &corpus, 4);
        assert_eq!(
            top.iter().map(|s| s.chunk.as_str()).collect::<Vec<_>>(),
            vec!["first", "second", "third", "low"]
        );
    }

    #[test]
    fn malformed_candidates_rank_as_zero() {
        let corpus = vec![
            record(1, "short", vec![1.0]),
            record(2, "neg", vec![-1.0, 0.0]),
            record(3, "ok", vec![1.0, 0.0]),
        ];
        let top = rank(&[1.0, 0.0], &corpus, 3);
        assert_eq!(top[0].chunk, "ok");
        assert_eq!(top[1].chunk, "short");
        assert_eq!(top[1].similarity, 0.0);
        assert_eq!(top[2].chunk, "neg");
    }

    #[test]
    fn tuples_are_candidates() {
        let pairs = vec![
            ("north".to_string(), vec![0.0f32, 1.0]),
            ("east".to_string(), vec![1.0f32, 0.0]),
        ];
        let top = rank(&[0.9, 0.1], &pairs, 1);
        assert_eq!(top[0].chunk, "east");
    }
}
