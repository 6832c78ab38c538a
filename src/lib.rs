//! # chatsearch
//!
//! Per-user local full-text search over chat messages.
//!
//! ## Features
//!
//! - Segmented per-user indexes with size- and count-based rotation
//! - Schema-versioned indexes with crash-safe rebuilds
//! - A JSON user config store with non-decreasing versions
//! - Free-space guarding before every write
//! - Ranked queries with sender and date filters and a recency boost
//! - A supervised worker that restarts after crashes
//!
//! ## Example
//!
//! ```no_run
//! use chatsearch::prelude::*;
//!
//! # async fn run() -> chatsearch::error::Result<()> {
//! let config = SearchConfig::builder().user_data_dir("/tmp/chatsearch").build()?;
//! let client = Supervisor::spawn(SearchCoreFactory::new(config.clone()), config.supervisor);
//!
//! client
//!     .index_batch(42, vec![Message::new("m1", 1, "lunch at noon")])
//!     .await?;
//! let hits = client.search(42, SearchQuery::new("lunch")).await?;
//! assert_eq!(hits[0].message_id, "m1");
//! client.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod analysis;
pub mod cli;
pub mod config;
pub mod context;
pub mod core;
pub mod disk;
pub mod error;
pub mod index;
pub mod search;
pub mod storage;
pub mod supervisor;
pub mod user_config;

pub mod prelude {
    pub use crate::config::SearchConfig;
    pub use crate::context::{SearchContext, UserId};
    pub use crate::core::{SearchCore, SearchCoreFactory};
    pub use crate::disk::{DiskCheck, DiskSpaceGuard};
    pub use crate::error::{ChatSearchError, ErrorKind, Result};
    pub use crate::index::message::Message;
    pub use crate::index::version::{IndexHealth, IndexState};
    pub use crate::search::query::{SearchQuery, SearchResult};
    pub use crate::supervisor::{SearchClient, Supervisor, SupervisorStatus};
    pub use crate::user_config::{ConfigLookup, UserConfigPatch, UserConfigRecord};
}

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
