//! Core data models for the accession portal.
//!
//! Accessions and their files map to SQLite tables via `sqlx::FromRow`
//! and serialize as JSON via `serde`.

pub mod accession;
pub mod file;
