use thiserror::Error;

use crate::tracking::table::Side;

pub type Result<T> = std::result::Result<T, TrackError>;

/// Unified error type for matching, correspondence and lineage operations.
#[derive(Debug, Error)]
pub enum TrackError {
    #[error("invalid scale factor {0}: must be a positive finite number")]
    InvalidScaleFactor(f64),

    /// A table has ids referenced zero or several times on one side.
    #[error("inconsistent correspondence table {table}: {missing} missing, {duplicated} duplicated")]
    InconsistentTable {
        table: String,
        missing: usize,
        duplicated: usize,
    },

    #[error("region {region} of image '{image}' was never observed")]
    NotFound { image: String, region: u32 },

    #[error("unknown image '{0}'")]
    UnknownImage(String),

    /// Only raised for explicit many-to-many requests; automatic matching
    /// always resolves ambiguity and reports it as data.
    #[error("cannot link {sources} source region(s) to {targets} target region(s) in one row")]
    AmbiguousMatch { sources: usize, targets: usize },

    #[error("region {id} is already present on the {side} side")]
    DuplicateRegion { side: Side, id: u32 },

    #[error("invalid correspondence row: {0}")]
    InvalidRow(String),

    #[error("matching was cancelled")]
    Cancelled,

    #[error("a matching worker thread panicked")]
    WorkerPanicked,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}
