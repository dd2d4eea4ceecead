//! Error taxonomy shared by every Freehold component.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias used across the core crate.
pub type FreeholdResult<T> = std::result::Result<T, FreeholdError>;

/// Errors surfaced by the environment manager.
///
/// No error is retried automatically; everything propagates to the outer
/// shell, which decides how to render it.
#[derive(Error, Debug)]
pub enum FreeholdError {
    /// I/O error during local filesystem operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An external tool exited non-zero.
    #[error("`{tool} {}` exited with status {exit}: {stderr}", .args.join(" "))]
    ToolFailure {
        tool: String,
        args: Vec<String>,
        exit: i32,
        stderr: String,
    },

    /// Allocation arithmetic failed before any file was created.
    #[error("not enough space: need {needed} bytes, have {available} bytes")]
    InsufficientSpace { needed: u64, available: u64 },

    /// A required binary could not be resolved.
    #[error("required tool `{missing_tool}` not found on PATH")]
    PreflightFailure { missing_tool: String },

    /// An operation was entered with its precondition unmet.
    #[error("precondition unmet: {0}")]
    PreconditionUnmet(String),

    /// Array assembly disagreed with the discovered backing set.
    #[error("MD array inconsistent: {0}")]
    ArrayInconsistent(String),

    /// `luksOpen` rejected the provided header/key/offset tuple.
    #[error("tuple rejected: header `{header}` did not open with key `{key}` at the given offset")]
    WrongTuple { header: String, key: String },

    /// A destructive command was issued without explicit confirmation.
    #[error("refusing `{0}` without explicit confirmation")]
    RefusedUnconfirmed(String),

    /// A named key or header is absent.
    #[error("not found: {}", .path.display())]
    NotFound { path: PathBuf },

    /// Configuration could not be loaded or failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl From<toml::de::Error> for FreeholdError {
    fn from(err: toml::de::Error) -> Self {
        FreeholdError::InvalidConfig(err.to_string())
    }
}

impl From<toml::ser::Error> for FreeholdError {
    fn from(err: toml::ser::Error) -> Self {
        FreeholdError::InvalidConfig(err.to_string())
    }
}
