use thiserror::Error;

/// Failures raised by the pipeline stages. Orchestration code wraps these in
/// `anyhow` and the HTTP layer maps them to `ApiError`.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("PDF processing failed: {0}")]
    Pdf(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Metadata extraction failed: {0}")]
    Metadata(String),

    #[error("Queue operation failed: {0}")]
    Queue(String),

    #[error("CRM integration failed: {0}")]
    Crm(String),

    #[error("OCR extraction failed: {0}")]
    Ocr(String),

    #[error("Document analysis failed: {0}")]
    Analysis(String),

    #[error("Storage operation failed: {0}")]
    Storage(String),

    #[error("Tracking update failed: {0}")]
    Tracking(String),

    #[error("Notification failed: {0}")]
    Notification(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl From<lopdf::Error> for PipelineError {
    fn from(err: lopdf::Error) -> Self {
        PipelineError::Pdf(err.to_string())
    }
}

impl From<rusqlite::Error> for PipelineError {
    fn from(err: rusqlite::Error) -> Self {
        PipelineError::Tracking(err.to_string())
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;
