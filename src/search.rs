//! # Search providers
//!
//! Everything downstream of retrieval (context assembly, prompting,
//! generation) only sees the [`SearchProvider`] trait. Two backends implement
//! it and one is picked when the server starts:
//!
//! - [`InProcessSearch`] embeds the query through an [`Embedder`] and scores it
//!   against every record of the preloaded [`EmbeddingSnapshot`]. Cost is
//!   linear in corpus size per query; there is no index.
//! - [`DelegatedSearch`] runs an external search tool as a subprocess and
//!   parses what it prints. If the tool also returns embeddings and the query
//!   vector, the candidates are re-ranked locally before the final cut.
//!
//! ## Delegated tool contract
//! The tool is invoked as `<program> <args..> <query> <count>`, where `count`
//! is [`SearchConfig::first_stage_k`], raised to the requested `k` when that is
//! larger. On success it prints either a JSON array
//! of chunk strings, or
//!
//! ```json
//! {"query_vector": [..], "result": [{"chunk": "..", "embedding": [..]}, ..]}
//! ```
//!
//! A non-zero exit status or undecodable output is a [`RagError::Search`].

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::{AwfulRagConfig, SearchConfig, SearchMode};
use crate::embedding::{Embedder, OllamaEmbedder};
use crate::error::{RagError, Result};
use crate::similarity::{Candidate, rank};
use crate::vector_store::EmbeddingSnapshot;

/// One retrieved fragment. `similarity` is absent when the backend did not
/// report a score.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub chunk: String,
    pub similarity: Option<f64>,
}

/// Ranked fragments, best first, plus the query's own embedding when the
/// backend exposed it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchResults {
    pub hits: Vec<SearchHit>,
    pub query_vector: Option<Vec<f32>>,
}

impl SearchResults {
    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    pub fn chunks(&self) -> impl Iterator<Item = &str> {
        self.hits.iter().map(|h| h.chunk.as_str())
    }
}

/// Query in, ranked top-K fragments out.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    /// Return at most `k` fragments for `query`, best first.
    async fn search(&self, query: &str, k: usize) -> Result<SearchResults>;

    /// Result count used when the caller has no preference.
    fn default_k(&self) -> usize;

    /// Short backend name for logs and the status page.
    fn name(&self) -> &'static str;

    /// Number of records held in memory, if the backend keeps any.
    fn in_memory(&self) -> Option<usize> {
        None
    }
}

/// Builds the backend selected by `config.search.mode`.
///
/// The in-process backend loads the store snapshot here, once.
pub fn build_search_provider(config: &AwfulRagConfig) -> Result<Arc<dyn SearchProvider>> {
    match config.search.mode {
        SearchMode::InProcess => {
            let snapshot = EmbeddingSnapshot::load(&config.db_path)?;
            let embedder = OllamaEmbedder::new(&config.embedding_base, &config.embedding_model)?;
            Ok(Arc::new(InProcessSearch::new(
                snapshot,
                Arc::new(embedder),
                config.search.top_k,
            )))
        }
        SearchMode::Delegated => Ok(Arc::new(DelegatedSearch::new(&config.search))),
    }
}

/// Linear scan over a preloaded snapshot.
pub struct InProcessSearch {
    snapshot: EmbeddingSnapshot,
    embedder: Arc<dyn Embedder>,
    top_k: usize,
}

impl InProcessSearch {
    pub fn new(snapshot: EmbeddingSnapshot, embedder: Arc<dyn Embedder>, top_k: usize) -> Self {
        Self {
            snapshot,
            embedder,
            top_k,
        }
    }

    pub fn snapshot(&self) -> &EmbeddingSnapshot {
        &self.snapshot
    }
}

#[async_trait]
impl SearchProvider for InProcessSearch {
    async fn search(&self, query: &str, k: usize) -> Result<SearchResults> {
        if self.snapshot.is_empty() {
            debug!("Snapshot is empty; nothing to search");
            return Ok(SearchResults::default());
        }

        let query_vector = self.embedder.embed(query).await?;
        if Some(query_vector.len()) != self.snapshot.dimension() {
            warn!(
                query_dim = query_vector.len(),
                store_dim = ?self.snapshot.dimension(),
                "Query embedding dimension does not match the store"
            );
        }

        let snapshot = self.snapshot.clone();
        let qv = query_vector.clone();
        let ranked = tokio::task::spawn_blocking(move || rank(&qv, snapshot.records(), k))
            .await
            .map_err(|e| RagError::Search(format!("ranking task failed: {e}")))?;

        Ok(SearchResults {
            hits: ranked
                .into_iter()
                .map(|s| SearchHit {
                    chunk: s.chunk,
                    similarity: Some(s.similarity),
                })
                .collect(),
            query_vector: Some(query_vector),
        })
    }

    fn default_k(&self) -> usize {
        self.top_k
    }

    fn name(&self) -> &'static str {
        "in_process"
    }

    fn in_memory(&self) -> Option<usize> {
        Some(self.snapshot.len())
    }
}

#[derive(Debug, Deserialize)]
struct SimilarChunk {
    chunk: String,
    embedding: Vec<f32>,
}

impl Candidate for SimilarChunk {
    fn chunk(&self) -> &str {
        &self.chunk
    }

    fn vector(&self) -> &[f32] {
        &self.embedding
    }
}

#[derive(Debug, Deserialize)]
struct EmbeddedResponse {
    query_vector: Vec<f32>,
    result: Vec<SimilarChunk>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DelegatedOutput {
    Chunks(Vec<String>),
    Embedded(EmbeddedResponse),
}

/// Search performed by an external tool.
#[derive(Debug, Clone)]
pub struct DelegatedSearch {
    program: String,
    args: Vec<String>,
    first_stage_k: usize,
    final_k: usize,
}

impl DelegatedSearch {
    pub fn new(config: &SearchConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            first_stage_k: config.first_stage_k,
            final_k: config.final_k,
        }
    }

    async fn run_tool(&self, query: &str, count: usize) -> Result<Vec<u8>> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(query)
            .arg(count.to_string())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| RagError::Search(format!("failed to run {}: {e}", self.program)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(status = %output.status, "Search tool stderr: {}", stderr.trim());
            return Err(RagError::Search(format!(
                "{} exited with {}",
                self.program, output.status
            )));
        }

        Ok(output.stdout)
    }
}

#[async_trait]
impl SearchProvider for DelegatedSearch {
    async fn search(&self, query: &str, k: usize) -> Result<SearchResults> {
        let stdout = self.run_tool(query, self.first_stage_k.max(k)).await?;

        let parsed: DelegatedOutput = serde_json::from_slice(&stdout).map_err(|e| {
            warn!(
                "Failed to decode search tool output: {}",
                String::from_utf8_lossy(&stdout).trim()
            );
            RagError::Search(format!("error decoding search output: {e}"))
        })?;

        match parsed {
            DelegatedOutput::Chunks(mut chunks) => {
                chunks.truncate(k);
                Ok(SearchResults {
                    hits: chunks
                        .into_iter()
                        .map(|chunk| SearchHit {
                            chunk,
                            similarity: None,
                        })
                        .collect(),
                    query_vector: None,
                })
            }
            DelegatedOutput::Embedded(resp) => {
                debug!(
                    candidates = resp.result.len(),
                    k, "Re-ranking delegated candidates"
                );
                let ranked = rank(&resp.query_vector, &resp.result, k);
                Ok(SearchResults {
                    hits: ranked
                        .into_iter()
                        .map(|s| SearchHit {
                            chunk: s.chunk,
                            similarity: Some(s.similarity),
                        })
                        .collect(),
                    query_vector: Some(resp.query_vector),
                })
            }
        }
    }

    fn default_k(&self) -> usize {
        self.final_k
    }

    fn name(&self) -> &'static str {
        "delegated"
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::EmbeddingRecord;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Returns a fixed vector and counts calls.
    pub(crate) struct FixedEmbedder {
        pub vector: Vec<f32>,
        pub calls: AtomicUsize,
    }

    impl FixedEmbedder {
        pub(crate) fn new(vector: Vec<f32>) -> Self {
            Self {
                vector,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Embedder for FixedEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.vector.clone())
        }
    }

    struct FailingEmbedder;

    #[async_trait]
    impl Embedder for FailingEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            Err(RagError::Embedding("connection refused".into()))
        }
    }

    fn pets() -> EmbeddingSnapshot {
        EmbeddingSnapshot::new(vec![
            EmbeddingRecord {
                id: 1,
                chunk: "cat".into(),
                vector: vec![1.0, 0.0],
            },
            EmbeddingRecord {
                id: 2,
                chunk: "dog".into(),
                vector: vec![0.0, 1.0],
            },
        ])
    }

    fn delegated(script: &str) -> DelegatedSearch {
        DelegatedSearch::new(&SearchConfig {
            mode: SearchMode::Delegated,
            top_k: 3,
            program: "sh".into(),
            args: vec!["-c".into(), script.into(), "search-tool".into()],
            first_stage_k: 20,
            final_k: 2,
        })
    }

    #[tokio::test]
    async fn in_process_returns_the_closest_chunk() {
        let search = InProcessSearch::new(pets(), Arc::new(FixedEmbedder::new(vec![1.0, 0.0])), 3);
        let results = search.search("kitten", 1).await.unwrap();
        assert_eq!(results.chunks().collect::<Vec<_>>(), vec!["cat"]);
        let score = results.hits[0].similarity.unwrap();
        assert!((score - 1.0).abs() < 1e-9);
        assert_eq!(results.query_vector, Some(vec![1.0, 0.0]));
    }

    #[tokio::test]
    async fn in_process_empty_snapshot_skips_embedding() {
        let embedder = Arc::new(FixedEmbedder::new(vec![1.0, 0.0]));
        let search = InProcessSearch::new(EmbeddingSnapshot::default(), embedder.clone(), 3);
        let results = search.search("anything", 3).await.unwrap();
        assert!(results.is_empty());
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn in_process_propagates_embedding_failure() {
        let search = InProcessSearch::new(pets(), Arc::new(FailingEmbedder), 3);
        assert!(matches!(
            search.search("kitten", 1).await,
            Err(RagError::Embedding(_))
        ));
    }

    #[tokio::test]
    async fn delegated_passes_query_and_count() {
        let search = delegated(r#"printf '["%s","%s"]' "$1" "$2""#);
        let results = search.search("what is rust", 5).await.unwrap();
        assert_eq!(
            results.chunks().collect::<Vec<_>>(),
            vec!["what is rust", "20"]
        );
        assert!(results.hits.iter().all(|h| h.similarity.is_none()));
        assert_eq!(results.query_vector, None);
    }

    #[tokio::test]
    async fn delegated_count_grows_with_large_k() {
        let search = delegated(r#"printf '["%s"]' "$2""#);
        let results = search.search("q", 25).await.unwrap();
        assert_eq!(results.chunks().collect::<Vec<_>>(), vec!["25"]);
    }

    #[tokio::test]
    async fn delegated_text_results_are_cut_to_k() {
        let search = delegated(r#"echo '["a","b","c","d"]'"#);
        let results = search.search("q", 2).await.unwrap();
        assert_eq!(results.chunks().collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn delegated_embeddings_are_reranked_locally() {
        let search = delegated(
            r#"echo '{"query_vector":[1.0,0.0],"result":[
                {"chunk":"far","embedding":[0.0,1.0]},
                {"chunk":"near","embedding":[1.0,0.1]},
                {"chunk":"exact","embedding":[2.0,0.0]}]}'"#,
        );
        let results = search.search("q", search.default_k()).await.unwrap();
        assert_eq!(results.chunks().collect::<Vec<_>>(), vec!["exact", "near"]);
        assert_eq!(results.query_vector, Some(vec![1.0, 0.0]));
        assert!(results.hits[0].similarity.unwrap() > results.hits[1].similarity.unwrap());
    }

    #[tokio::test]
    async fn delegated_empty_array_is_not_an_error() {
        let search = delegated("echo '[]'");
        assert!(search.search("q", 3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delegated_non_zero_exit_is_a_search_failure() {
        let search = delegated("echo boom >&2; exit 3");
        assert!(matches!(
            search.search("q", 3).await,
            Err(RagError::Search(_))
        ));
    }

    #[tokio::test]
    async fn delegated_garbage_output_is_a_search_failure() {
        let search = delegated("echo 'Traceback (most recent call last)'");
        assert!(matches!(
            search.search("q", 3).await,
            Err(RagError::Search(_))
        ));
    }

    #[tokio::test]
    async fn delegated_missing_program_is_a_search_failure() {
        let search = DelegatedSearch::new(&SearchConfig {
            program: "/nonexistent/search-tool".into(),
            args: vec![],
            ..SearchConfig::default()
        });
        assert!(matches!(
            search.search("q", 3).await,
            Err(RagError::Search(_))
        ));
    }
}
