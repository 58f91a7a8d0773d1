use thiserror::Error;

/// Failures while opening, reading or rewriting a word-processing document.
#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("failed to open document archive: {0}")]
    InvalidContainer(String),

    #[error("document archive has no body part '{0}'")]
    MissingBodyPart(String),

    #[error("failed to parse document body: {0}")]
    InvalidBody(String),

    /// A segment points at a node that is not a text leaf of this document.
    #[error("segment {segment} references node {node} which is not a text leaf")]
    StaleReference { segment: usize, node: usize },

    #[error("failed to serialize document: {0}")]
    Serialization(String),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("conversion failed: {message}")]
    ConversionFailed { message: String },

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl PipelineError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        PipelineError::Io {
            context: context.into(),
            source,
        }
    }
}
