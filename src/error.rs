//! # Error types
//!
//! One enum per failure domain, plus [`AskAiError`] which wraps all of them for callers that
//! drive several components at once (the session driver, the command handlers).
//!
//! | Domain | Raised by |
//! |---|---|
//! | [`EmbeddingError`] | [`crate::embedder`] |
//! | [`StoreError`] | [`crate::store`] |
//! | [`StreamError`] | [`crate::generate`], [`crate::session`] |
//! | [`ArchiveError`] | [`crate::archive`] |

use thiserror::Error;

/// The embedding call failed or produced something unusable.
#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("embedding request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("embedding service returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("failed to decode embedding response: {0}")]
    Decode(String),

    #[error("embedding service returned an empty embedding")]
    Empty,

    #[error("embedding has {actual} dimensions, expected {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// A call to the similarity store failed.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("vector store transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("vector store returned {status}: {body}")]
    Server { status: u16, body: String },

    #[error("failed to decode vector store response: {0}")]
    Decode(String),

    #[error("collection '{collection}' holds {actual}-d vectors, expected {expected}")]
    DimensionMismatch {
        collection: String,
        expected: usize,
        actual: usize,
    },

    #[error("collection '{0}' does not exist")]
    MissingCollection(String),
}

/// The generation call failed, or the producer task died.
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("generation request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("generation service returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("failed to decode generation stream: {0}")]
    Decode(String),

    #[error("generation backend error: {0}")]
    Backend(String),

    #[error("stream panic: {0}")]
    Panicked(String),
}

impl From<async_openai::error::OpenAIError> for StreamError {
    fn from(err: async_openai::error::OpenAIError) -> Self {
        StreamError::Backend(err.to_string())
    }
}

/// Reading, parsing or rewriting the local archive (or the vault around it) failed.
#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("archive I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse archive: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("vault path exists but is not a directory: {0}")]
    NotADirectory(String),

    #[error("insufficient permissions to write to vault directory: {0}")]
    ReadOnly(String),
}

/// Umbrella error for code that spans components.
#[derive(Error, Debug)]
pub enum AskAiError {
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("question is empty")]
    EmptyQuestion,

    #[error("a response is still streaming")]
    SessionBusy,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_umbrella_is_transparent() {
        let err: AskAiError = EmbeddingError::Empty.into();
        assert_eq!(err.to_string(), "embedding service returned an empty embedding");

        let err: AskAiError = StreamError::Panicked("boom".into()).into();
        assert_eq!(err.to_string(), "stream panic: boom");
    }

    #[test]
    fn test_dimension_mismatch_message() {
        let err = StoreError::DimensionMismatch {
            collection: "askai_questions".into(),
            expected: 1024,
            actual: 384,
        };
        assert_eq!(
            err.to_string(),
            "collection 'askai_questions' holds 384-d vectors, expected 1024"
        );
    }
}
