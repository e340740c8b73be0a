//! Error types for the core data model

use thiserror::Error;

/// Errors raised while encoding or decoding canonical messages
#[derive(Error, Debug)]
pub enum CoreError {
    /// JSON encoding or decoding failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Unknown message category name
    #[error("Unknown message category: {0}")]
    UnknownCategory(String),
}

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_category_message() {
        let err = CoreError::UnknownCategory("sideways".to_string());
        assert!(err.to_string().contains("sideways"));
    }
}
