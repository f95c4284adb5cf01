//! Error taxonomy shared by every subsystem.
//!
//! Errors bubble from the leaves through the execution engines to the
//! driver; the core never catches and swallows. The driver maps a failure to
//! its exit code via [`exit_code_for`]: `2` for usage errors, `1` for
//! everything else.

use std::path::PathBuf;

pub use sqlitch_fsutil::ArtifactConflictError;

/// Classified sqlitch failure.
#[derive(Debug, thiserror::Error)]
pub enum SqlitchError {
    /// Invalid flag combination or missing required argument. Exit 2.
    #[error("{0}")]
    Usage(String),

    /// Malformed or conflicting configuration. Exit 1.
    #[error("{0}")]
    Config(String),

    /// Plan parse failure with file and line position. Exit 1.
    #[error("{file}:{line}: {message}", file = .file.display())]
    PlanParse {
        file: PathBuf,
        line: usize,
        message: String,
    },

    /// Invalid plan content, missing dependency, or dangling symbolic
    /// reference. Exit 1.
    #[error("{0}")]
    Plan(String),

    /// Registry schema or connection failure. Exit 1.
    #[error("{0}")]
    Registry(String),

    /// A deploy/revert/verify script raised an engine error. Exit 1.
    #[error("{0}")]
    Script(String),

    /// Both the preferred and drop-in filenames are present. Exit 1.
    #[error(transparent)]
    ArtifactConflict(#[from] ArtifactConflictError),

    /// The user declined a confirmation prompt. Exit 1.
    #[error("{0}")]
    Aborted(String),
}

impl SqlitchError {
    /// Process exit code for this failure class.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Usage(_) => 2,
            _ => 1,
        }
    }
}

/// Exit code for an error chain, defaulting to 1 for unclassified failures.
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    if let Some(classified) = err.downcast_ref::<SqlitchError>() {
        return classified.exit_code();
    }
    1
}
