//! Status inference for production runs.
//!
//! The pipeline never announces that it is done; everything here is derived
//! by scanning the append-only event log it writes into a per-run database.

pub mod classify;
pub mod error_report;
pub mod events;
pub mod summary;

pub use classify::{classify, is_failure, like, EventClass};
pub use error_report::{error_report, ErrorReport, FailureDetail};
pub use events::{resolve_database, JsonlLogStore, LogDatabases, LogEvent, MemoryLogStore};
pub use summary::{analyze, summarize, Anomaly, Elapsed, RunOutcome, RunSummary, WorkerStatus};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("no log database matches run {0}")]
    NoMatch(String),

    #[error("multiple log databases match run {run_id}: {candidates:?}")]
    Ambiguous {
        run_id: String,
        candidates: Vec<String>,
    },

    #[error("log database {database} line {line}: {source}")]
    Parse {
        database: String,
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
