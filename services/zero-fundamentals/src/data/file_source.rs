//! JSON file data source.
//!
//! Reads `<root>/<asset>/<data_type>.json`. The file holds either an array of
//! records or an object with a `records` array. A missing file is an empty
//! batch, so a data directory can be populated incrementally.

use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::{DataSource, RawRecord, SourceConfig, SourceError};

/// Data source backed by JSON files on disk.
#[derive(Debug, Clone)]
pub struct JsonFileSource {
    root: PathBuf,
}

impl JsonFileSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the file for a source descriptor.
    pub fn path_for(&self, source: &SourceConfig) -> PathBuf {
        self.root
            .join(&source.asset)
            .join(format!("{}.json", source.data_type.as_str()))
    }

    fn parse_records(content: &str) -> Result<Vec<RawRecord>, SourceError> {
        let value: Value =
            serde_json::from_str(content).map_err(|e| SourceError::Parse(e.to_string()))?;

        let items = match value {
            Value::Array(items) => items,
            Value::Object(mut obj) => match obj.remove("records") {
                Some(Value::Array(items)) => items,
                _ => {
                    return Err(SourceError::Parse(
                        "expected an array or an object with a `records` array".into(),
                    ))
                }
            },
            _ => return Err(SourceError::Parse("expected a JSON array".into())),
        };

        Ok(items
            .into_iter()
            .filter_map(|item| match item {
                Value::Object(map) => Some(map),
                _ => None,
            })
            .collect())
    }
}

#[async_trait]
impl DataSource for JsonFileSource {
    fn name(&self) -> &str {
        "json_file"
    }

    async fn fetch(&self, source: &SourceConfig) -> Result<Vec<RawRecord>, SourceError> {
        let path = self.path_for(source);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No data file, treating as empty batch");
                return Ok(Vec::new());
            }
            Err(e) => return Err(SourceError::Unavailable(format!("{}: {}", path.display(), e))),
        };

        let records = Self::parse_records(&content)?;
        debug!(
            path = %path.display(),
            records = records.len(),
            "Loaded records from file"
        );
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::DataType;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_file_is_empty_batch() {
        let dir = TempDir::new().unwrap();
        let source = JsonFileSource::new(dir.path());
        let records = source
            .fetch(&SourceConfig::new("AAPL", DataType::Earnings))
            .await
            .unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn test_reads_array_and_wrapped_records() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("AAPL")).unwrap();
        std::fs::write(
            dir.path().join("AAPL/earnings.json"),
            r#"[{"netIncome": 1.0}, 7, {"netIncome": 2.0}]"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("AAPL/revenue.json"),
            r#"{"records": [{"revenue": 10}]}"#,
        )
        .unwrap();

        let source = JsonFileSource::new(dir.path());
        let earnings = source
            .fetch(&SourceConfig::new("AAPL", DataType::Earnings))
            .await
            .unwrap();
        assert_eq!(earnings.len(), 2);

        let revenue = source
            .fetch(&SourceConfig::new("AAPL", DataType::Revenue))
            .await
            .unwrap();
        assert_eq!(revenue.len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_file_is_parse_error() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("SPX")).unwrap();
        std::fs::write(dir.path().join("SPX/economic_indicator.json"), "{not json").unwrap();

        let source = JsonFileSource::new(dir.path());
        let err = source
            .fetch(&SourceConfig::new("SPX", DataType::EconomicIndicator))
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::Parse(_)));
    }
}
