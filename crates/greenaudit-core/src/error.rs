use thiserror::Error;

#[derive(Error, Debug)]
pub enum GreenAuditError {
    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Energy profiler error: {0}")]
    Profiler(String),

    #[error("No energy profiler available: {0}")]
    ProfilerUnavailable(String),

    #[error("Judge error: {0}")]
    Judge(String),

    #[error("Prompt set error: {0}")]
    PromptSet(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

pub type Result<T> = std::result::Result<T, GreenAuditError>;
