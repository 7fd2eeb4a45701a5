//! Error taxonomy for a load batch.
//!
//! Everything except [`LoadError::MissingDirectory`] and [`LoadError::Catalog`] is scoped to a
//! single file: the coordinator turns it into that file's outcome and moves on.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("source directory not found: {0}")]
    MissingDirectory(PathBuf),

    #[error("invalid file catalog: {0}")]
    Catalog(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed CSV: {0}")]
    Csv(#[from] csv::Error),

    #[error("line {line}: bytes are not valid {encoding}")]
    Encoding { line: u64, encoding: &'static str },

    #[error("file has no header row")]
    EmptyFile,

    #[error("column '{column}' is declared for this file but missing from its header")]
    MissingColumn { column: String },

    #[error("chunk {chunk} header {found:?} does not match first chunk header {expected:?}")]
    HeaderMismatch {
        chunk: usize,
        expected: Vec<String>,
        found: Vec<String>,
    },

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("{operation} timed out after {}s", .timeout.as_secs())]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("load cancelled")]
    Cancelled,

    #[error("load task panicked: {0}")]
    Panicked(String),
}

impl LoadError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        LoadError::Io {
            path: path.into(),
            source,
        }
    }

    /// Stable short name recorded in reports
    pub fn kind(&self) -> &'static str {
        match self {
            LoadError::MissingDirectory(_) => "missing_directory",
            LoadError::Catalog(_) => "catalog",
            LoadError::Io { .. } => "io",
            LoadError::Csv(_) => "parse",
            LoadError::Encoding { .. } => "encoding",
            LoadError::EmptyFile => "empty_file",
            LoadError::MissingColumn { .. } => "missing_column",
            LoadError::HeaderMismatch { .. } => "schema_mismatch",
            LoadError::Store(_) => "store",
            LoadError::Timeout { .. } => "timeout",
            LoadError::Cancelled => "cancelled",
            LoadError::Panicked(_) => "panicked",
        }
    }
}

pub type LoadResult<T> = std::result::Result<T, LoadError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_are_distinct_per_taxonomy_entry() {
        let errors = [
            LoadError::EmptyFile,
            LoadError::MissingColumn {
                column: "review_id".to_string(),
            },
            LoadError::HeaderMismatch {
                chunk: 1,
                expected: vec!["a".to_string()],
                found: vec!["b".to_string()],
            },
            LoadError::Store(sqlx::Error::PoolTimedOut),
            LoadError::Cancelled,
        ];
        let kinds: std::collections::HashSet<_> = errors.iter().map(|e| e.kind()).collect();
        assert_eq!(kinds.len(), errors.len());
    }

    #[test]
    fn test_timeout_message() {
        let err = LoadError::Timeout {
            operation: "COPY",
            timeout: Duration::from_secs(180),
        };
        assert_eq!(err.to_string(), "COPY timed out after 180s");
    }
}
