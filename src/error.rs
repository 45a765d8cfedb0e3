//! Crate-wide error type and `Result` alias.

use std::path::{Path, PathBuf};

pub type Result<T, E = BuildError> = std::result::Result<T, E>;

/// Every fallible operation in this crate returns this error type.
///
/// Recoverable cache errors (corrupt or version-mismatched archives) are caught at the
/// cache boundary and downgraded to an empty/rebuilt cache with a `warn!` log line; they
/// never reach this type. Everything here is either fatal or an aggregated action failure.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Archive(#[from] crate::archive::ArchiveError),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),

    #[error("config value mismatch for {key}: makefile was built with {old:?}, now {new:?}")]
    ConfigInvalid { key: String, old: Vec<String>, new: Vec<String> },

    #[error("makefile at {0} is corrupt and regeneration also failed: {1}")]
    MakefileCorrupt(PathBuf, String),

    #[error("target descriptor parsing failed: {0}")]
    DescriptorParseFailed(String),

    #[error("action {producer} and {other} both produce {path}")]
    DuplicateProducer { path: PathBuf, producer: usize, other: usize },

    #[error("dependency cycle detected, first action involved: {0}")]
    CycleDetected(usize),

    #[error("prerequisite {path} of action {action} has no producer and does not exist on disk")]
    MissingPrerequisite { path: PathBuf, action: usize },

    #[error("{count} action(s) failed, first: action {first} exited with {status}")]
    ActionFailed { count: usize, first: usize, status: i32 },

    #[error("live coding session already owns the host: {0}")]
    LiveCodingConflict(String),

    #[error("build would modify engine file {0} with -NoEngineChanges set")]
    EngineReadOnlyViolation(PathBuf),

    #[error("distributed build coordinator not found on PATH")]
    ExecutorUnavailable,

    #[error("{0}")]
    Message(String),
}

impl BuildError {
    pub fn msg(msg: impl std::fmt::Display) -> Self {
        Self::Message(msg.to_string())
    }

    pub fn io(err: std::io::Error, path: impl AsRef<Path>) -> Self {
        Self::Message(format!("{}: {err}", path.as_ref().display()))
    }
}
