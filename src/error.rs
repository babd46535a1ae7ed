//! Error types shared by the ingestion and aggregation pipeline

use std::path::PathBuf;
use thiserror::Error;

/// Failure reported by the record store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

/// Failure that ends a pipeline run, or abandons a single input
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("log directory not found: {}", .0.display())]
    MissingDirectory(PathBuf),

    #[error("invalid discovery pattern {pattern}: {source}")]
    Glob {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },

    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl PipelineError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Why a single log line produced no record.
///
/// These are routine on real logs, so they travel as values and are only
/// counted, never propagated.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LineRejection {
    #[error("expected {expected} columns, found {found}")]
    ColumnCount { expected: usize, found: usize },

    #[error("data line before any #Fields directive")]
    NoDirective,

    #[error("field {field} is not a number: {value:?}")]
    InvalidNumber { field: &'static str, value: String },

    #[error("invalid date: {0:?}")]
    InvalidDate(String),

    #[error("invalid time of day: {0:?}")]
    InvalidTime(String),
}

impl LineRejection {
    /// Stable label used when tallying rejections
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ColumnCount { .. } => "column_count",
            Self::NoDirective => "no_directive",
            Self::InvalidNumber { .. } => "invalid_number",
            Self::InvalidDate(_) => "invalid_date",
            Self::InvalidTime(_) => "invalid_time",
        }
    }
}
