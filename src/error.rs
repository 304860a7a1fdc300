//! The single error currency for every public Inibase operation.
//!
//! Every fallible boundary in the crate — codec, crypto, schema, file
//! engine, search, assembler, sort, mutation — returns `Result<T,
//! InibaseError>` or a narrower error that converts into it with `?`.
//! There is no in-engine retry beyond the lock backoff in
//! [`crate::file_engine::lock`]; callers must treat a failed mutation as
//! "possibly partially applied" and re-issue after repair (see §7).

use std::path::PathBuf;

/// Errors surfaced by Inibase's public API.
#[derive(Debug, thiserror::Error)]
pub enum InibaseError {
    /// No `INIBASE_SECRET` configured and none could be generated/persisted.
    #[error("no secret configured: {0}")]
    NoEnv(String),

    #[error("table '{name}' already exists")]
    TableExists { name: String },

    #[error("table '{name}' does not exist")]
    TableNotExists { name: String },

    #[error("table '{name}' is empty")]
    TableEmpty { name: String },

    #[error("table '{name}' has no schema")]
    NoSchema { name: String },

    #[error("invalid id: {id}")]
    InvalidId { id: String },

    #[error("invalid type for field '{field}': expected {expected}, got {got}")]
    InvalidType {
        field: String,
        expected: String,
        got: String,
    },

    #[error("invalid parameters: {reason}")]
    InvalidParameters { reason: String },

    #[error("field '{field}' is required")]
    FieldRequired { field: String },

    #[error("field '{field}' must be unique, value '{value}' already exists")]
    FieldUnique { field: String, value: String },

    #[error("timed out acquiring lock '{key}' after {attempts} attempts")]
    LockTimeout { key: String, attempts: u32 },

    #[error("join depth exceeded ({depth}) or cycle detected resolving table '{table}'")]
    JoinDepthExceeded { table: String, depth: u32 },

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("schema (de)serialization error: {0}")]
    Schema(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, InibaseError>;

/// Attach a path to an [`std::io::Error`], the way most of this crate's
/// file-engine helpers need to report *which* column file failed.
pub(crate) fn io_at(path: impl Into<PathBuf>, source: std::io::Error) -> InibaseError {
    InibaseError::Io {
        path: path.into(),
        source,
    }
}
