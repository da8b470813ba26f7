//! Row models for the SQLite backend.
//!
//! These map directly to the schema in `migrations/` and handle the JSON
//! encoding of nested fields.

pub mod job;

pub use job::*;
