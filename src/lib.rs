//! Inibase — a serverless, file-based relational data store.
//!
//! Each table is a directory; each scalar/union schema field is its own
//! line-oriented column file, one line per record. Records are addressed
//! externally by an opaque id (AES-256-CBC over the raw auto-increment
//! integer) and internally by line number. See [`engine::Engine`] for the
//! public async surface.

pub mod assembler;
pub mod codec;
pub mod config;
pub mod criteria;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod file_engine;
pub mod mutation;
pub mod query;
pub mod schema;
pub mod search;
pub mod sort;
pub mod table;

pub use crypto::SALT_LEN;
pub use engine::Engine;
pub use error::{InibaseError, Result};
pub use query::{Options, SortDirection, SortSpec, Where};
pub use schema::{Children, Field, FieldType, Schema};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
