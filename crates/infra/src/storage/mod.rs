//! Durable storage for backfill jobs.
//!
//! The [`JobStorage`] trait is the only persistence boundary the job manager
//! sees. Two interchangeable backends implement it:
//!
//! - [`LocalJobStorage`]: JSON files on the local filesystem
//! - [`PostgresJobStorage`]: JSONB documents in PostgreSQL

pub mod local;
pub mod postgres;
pub mod query;
pub mod r#trait;

#[cfg(test)]
pub(crate) mod conformance;

pub use local::LocalJobStorage;
pub use postgres::PostgresJobStorage;
pub use query::{JobFilter, JobPage, Pagination};
pub use r#trait::{JobStorage, StorageError};
