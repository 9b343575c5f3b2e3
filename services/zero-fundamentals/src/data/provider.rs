//! Data source abstraction for fundamental feeds.
//!
//! Defines the `DataSource` trait that every fetcher implements. The change
//! detector only sees raw records; transport, authentication and pagination
//! stay behind this seam.

use async_trait::async_trait;
use thiserror::Error;

use super::{RawRecord, SourceConfig};

// ============================================================================
// Source Error
// ============================================================================

/// Errors returned by data sources.
#[derive(Debug, Clone, Error)]
pub enum SourceError {
    /// Network error (connection failed, reset)
    #[error("Network error: {0}")]
    Network(String),
    /// Payload could not be decoded
    #[error("Parse error: {0}")]
    Parse(String),
    /// Fetch exceeded its time budget
    #[error("Fetch timed out after {0}s")]
    Timeout(u64),
    /// Source is temporarily unavailable
    #[error("Source unavailable: {0}")]
    Unavailable(String),
    /// Nothing published for the requested asset/data type
    #[error("Not found: {0}")]
    NotFound(String),
}

impl SourceError {
    /// Check if the error is recoverable (worth retrying)
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::Timeout(_) | Self::Unavailable(_)
        )
    }
}

// ============================================================================
// Data Source Trait
// ============================================================================

/// A fetcher of raw fundamental records.
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Source name (for logging)
    fn name(&self) -> &str;

    /// Fetch the current batch of records for a source descriptor.
    ///
    /// An empty vector means the source published nothing; it is not an error.
    async fn fetch(&self, source: &SourceConfig) -> Result<Vec<RawRecord>, SourceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_error_recoverable() {
        assert!(SourceError::Network("reset".into()).is_recoverable());
        assert!(SourceError::Timeout(30).is_recoverable());
        assert!(!SourceError::Parse("bad json".into()).is_recoverable());
        assert!(!SourceError::NotFound("AAPL:roe".into()).is_recoverable());
    }

    #[test]
    fn test_source_error_display() {
        assert_eq!(
            SourceError::Timeout(30).to_string(),
            "Fetch timed out after 30s"
        );
    }
}
