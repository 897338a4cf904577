//! # Query pipeline
//!
//! One query, start to finish: search, show the retrieved fragments, assemble
//! the grounding prompt, and stream the model's answer. Sessions and the
//! `ask` command both drive it; they differ only in the [`FrameSink`] the
//! frames go to.
//!
//! For a query with results the client receives, in order:
//!
//! 1. each retrieved fragment, best first, as a [`FrameKind::Fragment`];
//! 2. the [`RESPONSE_SEPARATOR`];
//! 3. the answer as [`FrameKind::Increment`]s, in generation order.
//!
//! A query with no results gets [`NO_RELEVANT_INFORMATION`] and no model call.
//! Failures end the query with the error's fixed client text.
//!
//! Every stage also watches the query's cancellation scope. Once it fires the
//! pipeline stops at the next await point and emits nothing more.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::Generator;
use crate::error::Result;
use crate::search::SearchProvider;
use crate::template::{assemble, assemble_prompt};

/// Marks the boundary between retrieved fragments and the generated answer.
pub const RESPONSE_SEPARATOR: &str = "---------- Response ----------";

/// Sent instead of an answer when retrieval found nothing.
pub const NO_RELEVANT_INFORMATION: &str = "No relevant information found in the document.";

/// Sent when the model finished without producing any text.
pub const EMPTY_ANSWER: &str = "The model returned an empty response.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Fragment,
    Separator,
    Increment,
    /// Fixed diagnostic or no-results text.
    Notice,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub text: String,
}

impl Frame {
    fn new(kind: FrameKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
        }
    }
}

/// Where pipeline output goes.
///
/// An error means the destination is gone; the pipeline abandons the query.
#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn send_frame(&self, frame: Frame) -> Result<()>;
}

/// A user query. `k` overrides the backend's default result count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub text: String,
    pub k: Option<usize>,
}

impl Query {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            k: None,
        }
    }
}

/// How a query ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Answered { fragments: usize, answer: String },
    NoResults,
    /// A retrieval or generation failure; holds the text sent to the client.
    Failed(&'static str),
    Cancelled,
}

/// Search, assemble and generate, bound to one backend and one model.
pub struct Pipeline {
    search: Arc<dyn SearchProvider>,
    generator: Arc<dyn Generator>,
    chat_model: String,
}

impl Pipeline {
    pub fn new(
        search: Arc<dyn SearchProvider>,
        generator: Arc<dyn Generator>,
        chat_model: impl Into<String>,
    ) -> Self {
        Self {
            search,
            generator,
            chat_model: chat_model.into(),
        }
    }

    pub fn search_provider(&self) -> &Arc<dyn SearchProvider> {
        &self.search
    }

    /// Run `query` to completion, cancellation, or failure.
    ///
    /// Returns `Err` only when `sink` stopped accepting frames.
    pub async fn run(
        &self,
        query: &Query,
        scope: &CancellationToken,
        sink: &dyn FrameSink,
    ) -> Result<Outcome> {
        let k = query.k.unwrap_or_else(|| self.search.default_k());
        debug!(backend = self.search.name(), k, "Searching for {:?}", query.text);

        let searched = tokio::select! {
            biased;
            _ = scope.cancelled() => return Ok(Outcome::Cancelled),
            r = self.search.search(&query.text, k) => r,
        };

        let results = match searched {
            Ok(results) => results,
            Err(e) => {
                warn!("Search failed: {e}");
                let text = e.client_message();
                sink.send_frame(Frame::new(FrameKind::Notice, text)).await?;
                return Ok(Outcome::Failed(text));
            }
        };

        if results.is_empty() {
            info!("No fragments matched the query");
            sink.send_frame(Frame::new(FrameKind::Notice, NO_RELEVANT_INFORMATION))
                .await?;
            return Ok(Outcome::NoResults);
        }

        for chunk in results.chunks() {
            if scope.is_cancelled() {
                return Ok(Outcome::Cancelled);
            }
            sink.send_frame(Frame::new(FrameKind::Fragment, chunk)).await?;
        }
        sink.send_frame(Frame::new(FrameKind::Separator, RESPONSE_SEPARATOR))
            .await?;

        let context = assemble(results.chunks());
        let prompt = assemble_prompt(&context, &query.text);

        let (piece_tx, mut piece_rx) = mpsc::unbounded_channel::<String>();
        let mut on_increment = move |piece: &str| {
            let _ = piece_tx.send(piece.to_string());
        };
        let generation =
            self.generator
                .generate(&self.chat_model, &prompt, &mut on_increment);
        tokio::pin!(generation);

        let generated = loop {
            tokio::select! {
                biased;
                _ = scope.cancelled() => return Ok(Outcome::Cancelled),
                Some(piece) = piece_rx.recv() => {
                    sink.send_frame(Frame::new(FrameKind::Increment, piece)).await?;
                }
                r = &mut generation => break r,
            }
        };
        while let Ok(piece) = piece_rx.try_recv() {
            if scope.is_cancelled() {
                return Ok(Outcome::Cancelled);
            }
            sink.send_frame(Frame::new(FrameKind::Increment, piece)).await?;
        }

        match generated {
            Ok(answer) if answer.is_empty() => {
                warn!("Model returned an empty answer");
                sink.send_frame(Frame::new(FrameKind::Notice, EMPTY_ANSWER))
                    .await?;
                Ok(Outcome::Answered {
                    fragments: results.hits.len(),
                    answer,
                })
            }
            Ok(answer) => Ok(Outcome::Answered {
                fragments: results.hits.len(),
                answer,
            }),
            Err(e) => {
                warn!("Generation failed: {e}");
                let text = e.client_message();
                sink.send_frame(Frame::new(FrameKind::Notice, text)).await?;
                Ok(Outcome::Failed(text))
            }
        }
    }
}
