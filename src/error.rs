// src/error.rs
// Error taxonomy for the harvesting pipeline. Item-level kinds are caught
// and logged where single records fail; everything else aborts the run.

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, HarvestError>;

#[derive(Debug, thiserror::Error)]
pub enum HarvestError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("upstream login failed: {0}")]
    Auth(String),

    #[error("invalid item: {0}")]
    Validation(String),

    #[error("enrichment failed: {0}")]
    Llm(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HarvestError {
    /// True for errors that cost a single item, not the whole run.
    pub fn is_item_level(&self) -> bool {
        matches!(self, HarvestError::Validation(_) | HarvestError::Llm(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_level_errors_are_skippable() {
        assert!(HarvestError::Validation("missing id".into()).is_item_level());
        assert!(HarvestError::Llm("gave up".into()).is_item_level());
        assert!(!HarvestError::Auth("bad credentials".into()).is_item_level());
        assert!(!HarvestError::Config("no such community".into()).is_item_level());
    }
}
