//! # Errors
//!
//! One error type for the whole query path. Variants follow how a failure is
//! handled rather than where it came from:
//!
//! - [`RagError::Transport`] ends the session that hit it.
//! - [`RagError::Protocol`] drops the offending frame; the session keeps going.
//! - [`RagError::Embedding`], [`RagError::Search`] and [`RagError::Store`] are
//!   retrieval failures. The client gets a fixed diagnostic and may ask again.
//! - [`RagError::Generation`] is reported the same way. Increments already
//!   streamed stay streamed.
//! - [`RagError::Ingest`] carries the ingestion tool's captured output back to
//!   the upload caller.

pub type Result<T> = std::result::Result<T, RagError>;

/// Sent when the query embedding could not be produced.
pub const EMBEDDING_FAILED_MESSAGE: &str = "Could not generate query embedding.";

/// Sent when the search backend (store or delegated tool) failed.
pub const SEARCH_FAILED_MESSAGE: &str = "Search failed. Please try again.";

/// Sent when the chat model call failed.
pub const GENERATION_FAILED_MESSAGE: &str = "Error generating response from chat model.";

#[derive(Debug, thiserror::Error)]
pub enum RagError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed frame: {0}")]
    Protocol(String),

    #[error("embedding service error: {0}")]
    Embedding(String),

    #[error("search failed: {0}")]
    Search(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("generation failed: {0}")]
    Generation(String),

    #[error("ingestion tool failed: {output}")]
    Ingest { output: String },

    #[error("configuration error: {0}")]
    Config(String),
}

impl RagError {
    /// The fixed text a client sees when this error interrupts a query.
    ///
    /// Anything that is not a generation or embedding failure is reported as a
    /// search failure; the details stay in the server log.
    pub fn client_message(&self) -> &'static str {
        match self {
            RagError::Embedding(_) => EMBEDDING_FAILED_MESSAGE,
            RagError::Generation(_) => GENERATION_FAILED_MESSAGE,
            _ => SEARCH_FAILED_MESSAGE,
        }
    }
}

impl From<diesel::result::Error> for RagError {
    fn from(err: diesel::result::Error) -> Self {
        RagError::Store(err.to_string())
    }
}

impl From<diesel::ConnectionError> for RagError {
    fn from(err: diesel::ConnectionError) -> Self {
        RagError::Store(err.to_string())
    }
}

impl From<reqwest::Error> for RagError {
    fn from(err: reqwest::Error) -> Self {
        RagError::Embedding(err.to_string())
    }
}

impl From<async_openai::error::OpenAIError> for RagError {
    fn from(err: async_openai::error::OpenAIError) -> Self {
        RagError::Generation(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retrieval_errors_map_to_search_message() {
        assert_eq!(
            RagError::Search("exit status 3".into()).client_message(),
            SEARCH_FAILED_MESSAGE
        );
        assert_eq!(
            RagError::Store("no such table".into()).client_message(),
            SEARCH_FAILED_MESSAGE
        );
    }

    #[test]
    fn embedding_and_generation_have_their_own_messages() {
        assert_eq!(
            RagError::Embedding("connection refused".into()).client_message(),
            EMBEDDING_FAILED_MESSAGE
        );
        assert_eq!(
            RagError::Generation("model not found".into()).client_message(),
            GENERATION_FAILED_MESSAGE
        );
    }
}
