use std::sync::PoisonError;
use thiserror::Error;
use tokio::task::JoinError;

#[derive(Debug, Error)]
pub enum AppError {

    #[error("Config error: {0}")]
    Config(String),

    #[error("Unknown entity '{0}'")]
    UnknownEntity(String),

    #[error("Unknown index '{index}' on entity '{entity}'")]
    UnknownIndex { entity: String, index: String },

    #[error("No transcode '{transcode}' registered for property '{property}'")]
    MissingTranscode { property: String, transcode: String },

    #[error("Encoding failed for property '{property}' with value '{value}': {reason}")]
    Encoding { property: String, value: String, reason: String },

    #[error("Decoding failed for transcode '{transcode}' on input '{input}': {reason}")]
    Decoding { transcode: String, input: String, reason: String },

    #[error("Malformed key segment '{0}'")]
    MalformedKey(String),

    #[error("Invalid condition: {0}")]
    InvalidCondition(String),

    #[error("Query on '{entity}'/'{index}' aborted by shard '{shard}' after shards {contributed:?} contributed: {source}")]
    QueryAborted {
        entity: String,
        index: String,
        shard: String,
        contributed: Vec<String>,
        #[source]
        source: Box<AppError>,
    },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Config load error: {0}")]
    ConfigLoad(#[from] config::ConfigError),

    #[error("Join: {0}")]
    JoinError(#[from] JoinError),

    #[error("Custom error: {0}")]
    Custom(String),
}

impl AppError {
    pub fn new(msg: impl Into<String>) -> Self {
        AppError::Custom(msg.into())
    }

    /// True for errors raised by configuration or input validation, which
    /// callers must fix rather than retry.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AppError::Config(_)
                | AppError::UnknownEntity(_)
                | AppError::UnknownIndex { .. }
                | AppError::MissingTranscode { .. }
                | AppError::Encoding { .. }
                | AppError::Decoding { .. }
                | AppError::MalformedKey(_)
                | AppError::InvalidCondition(_)
        )
    }
}

impl<T> From<PoisonError<T>> for AppError {
    fn from(e: PoisonError<T>) -> Self {
        AppError::Custom(format!("Poison error: {:?}", e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_are_fatal_transport_errors_are_not() {
        assert!(AppError::Config("bad bump".to_string()).is_fatal());
        assert!(AppError::UnknownEntity("order".to_string()).is_fatal());
        assert!(AppError::MalformedKey("x".to_string()).is_fatal());
        assert!(!AppError::Storage("connection reset".to_string()).is_fatal());
        assert!(!AppError::new("anything else").is_fatal());
    }

    #[test]
    fn aborted_query_reports_its_context() {
        let err = AppError::QueryAborted {
            entity: "order".to_string(),
            index: "byCreated".to_string(),
            shard: "2".to_string(),
            contributed: vec!["0".to_string(), "1".to_string()],
            source: Box::new(AppError::Storage("boom".to_string())),
        };
        let text = err.to_string();
        assert!(text.contains("order") && text.contains("byCreated") && text.contains("'2'"));
    }
}
