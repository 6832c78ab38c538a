//! Query execution over index snapshots.

pub mod engine;
pub mod query;
pub mod scoring;

pub use engine::QueryEngine;
pub use query::{SearchFilters, SearchQuery, SearchResult};
