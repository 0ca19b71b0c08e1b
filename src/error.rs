use thiserror::Error;

#[derive(Error, Debug)]
pub enum InsightError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: i64 },

    #[error("Mixpanel API error: {status} - {body}")]
    AnalyticsApi { status: u16, body: String },

    /// A successful Mixpanel response whose JSON did not have the expected shape.
    #[error("Unexpected Mixpanel response: {0}")]
    UnexpectedResponse(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Catalog error: {0}")]
    Catalog(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to process query during {stage}: {source}")]
    QueryFailed {
        stage: &'static str,
        #[source]
        source: Box<InsightError>,
    },
}

impl InsightError {
    pub fn not_found(kind: &'static str, id: i64) -> Self {
        InsightError::NotFound { kind, id }
    }

    /// True for errors the caller can fix by changing the request.
    pub fn is_validation(&self) -> bool {
        matches!(self, InsightError::Validation(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, InsightError::NotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, InsightError>;
