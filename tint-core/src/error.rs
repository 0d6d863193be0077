use thiserror::Error;

/// Errors surfaced to the job submitter.
///
/// Everything below the handler propagates `anyhow::Error` with context; the
/// handler classifies failures into one of these kinds before building the
/// `{error}` payload.
#[derive(Debug, Error)]
pub enum TintError {
    #[error("invalid job input: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("Failed to decode base64 image: {0}")]
    ImageDecode(String),

    #[error("Failed to fetch image from URL")]
    ImageFetch(String),

    #[error("invalid image argument: {0}")]
    InvalidImageArgument(String),

    #[error("failed to acquire model {model}: {message}")]
    ModelAcquisition { model: String, message: String },

    #[error("inference failed: {0}")]
    Inference(String),
}

pub type TintResult<T> = Result<T, TintError>;

impl TintError {
    pub fn acquisition(model: impl Into<String>, err: &anyhow::Error) -> Self {
        Self::ModelAcquisition {
            model: model.into(),
            message: format!("{err:#}"),
        }
    }

    /// Error lines reported to the job submitter.
    pub fn messages(&self) -> Vec<String> {
        match self {
            Self::Validation(errors) => errors.clone(),
            other => vec![other.to_string()],
        }
    }
}
