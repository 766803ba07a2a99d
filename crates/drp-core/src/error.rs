use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failures surfaced by the run-coordination layer.
///
/// Configuration and contention errors happen before anything is claimed.
/// Stage errors happen while a machine group is held and always go through
/// lock release before reaching the caller.
#[derive(Debug, Error)]
pub enum DrpError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("required path {} is unreadable", .0.display())]
    Unreadable(PathBuf),

    #[error("required path {} is unwritable", .0.display())]
    Unwritable(PathBuf),

    #[error("insufficient disk space in output filesystem: {available} available, {needed} needed")]
    InsufficientSpace { available: u64, needed: u64 },

    #[error("run type '{0}' must be one word")]
    InvalidRunType(String),

    #[error("unable to acquire a machine group for arch {arch}")]
    NoGroupAvailable { arch: String },

    #[error(
        "{stage} failed{}",
        .tail.as_deref().map(|t| format!("\n(last 500 bytes)... {t}")).unwrap_or_default()
    )]
    Stage { stage: String, tail: Option<String> },

    #[error("cannot release machine group {group} into {}: {source}", .target.display())]
    Release {
        group: String,
        target: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("no current run with run id {0}")]
    NoActiveRun(String),

    #[error("multiple lock records claim run {run_id}: {groups:?}")]
    AmbiguousRun { run_id: String, groups: Vec<String> },

    #[error("invalid configuration file: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl DrpError {
    pub fn stage(stage: impl Into<String>, tail: Option<String>) -> Self {
        DrpError::Stage {
            stage: stage.into(),
            tail,
        }
    }

    /// Name of the failed stage, if this is a stage failure.
    pub fn failed_stage(&self) -> Option<&str> {
        match self {
            DrpError::Stage { stage, .. } => Some(stage),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, DrpError>;
