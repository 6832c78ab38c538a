//! The per-worker context.
//!
//! Everything the core operations need that would otherwise be ambient state
//! (config paths, disk guard, schema tag, default language) lives here. A
//! context is built once when a worker starts and passed to every component.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::info;

use crate::config::SearchConfig;
use crate::disk::DiskSpaceGuard;
use crate::error::{ChatSearchError, Result};

/// Numeric chat user identifier.
pub type UserId = u64;

/// Reject identifiers that cannot name a user.
pub fn validate_user_id(user_id: UserId) -> Result<()> {
    if user_id == 0 {
        return Err(ChatSearchError::invalid_input("user id must be non-zero"));
    }
    Ok(())
}

/// Explicit context threaded through every core operation.
#[derive(Debug, Clone)]
pub struct SearchContext {
    config: Arc<SearchConfig>,
    guard: DiskSpaceGuard,
    user_data_dir: PathBuf,
    index_root: PathBuf,
}

impl SearchContext {
    /// Build a context from `config`, creating the data directories.
    pub fn new(config: SearchConfig) -> Result<Self> {
        let guard = DiskSpaceGuard::from_config(&config.disk);
        Self::with_guard(config, guard)
    }

    /// Build a context with an explicit disk guard.
    pub fn with_guard(config: SearchConfig, guard: DiskSpaceGuard) -> Result<Self> {
        config.validate()?;

        let user_data_dir = config.paths.user_data_dir.clone();
        let index_root = config.paths.index_root();
        for dir in [&user_data_dir, &index_root] {
            std::fs::create_dir_all(dir).map_err(|e| {
                ChatSearchError::storage(format!("Failed to create {}: {e}", dir.display()))
            })?;
        }

        info!(
            "Search context ready: data dir {}, index root {}, schema {}",
            user_data_dir.display(),
            index_root.display(),
            config.schema_version
        );

        Ok(SearchContext {
            config: Arc::new(config),
            guard,
            user_data_dir,
            index_root,
        })
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    pub fn guard(&self) -> &DiskSpaceGuard {
        &self.guard
    }

    pub fn schema_version(&self) -> &str {
        &self.config.schema_version
    }

    pub fn default_language(&self) -> &str {
        &self.config.default_language
    }

    pub fn user_data_dir(&self) -> &Path {
        &self.user_data_dir
    }

    pub fn index_root(&self) -> &Path {
        &self.index_root
    }

    /// Directory holding one user's segments and manifest.
    pub fn user_index_dir(&self, user_id: UserId) -> PathBuf {
        self.index_root.join(user_id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::FixedProbe;
    use tempfile::TempDir;

    #[test]
    fn test_context_creates_directories() {
        let temp_dir = TempDir::new().unwrap();
        let config = SearchConfig::builder()
            .user_data_dir(temp_dir.path().join("data"))
            .build()
            .unwrap();
        let guard = DiskSpaceGuard::new(Arc::new(FixedProbe::new(u64::MAX)), 0);

        let ctx = SearchContext::with_guard(config, guard).unwrap();
        assert!(ctx.user_data_dir().is_dir());
        assert!(ctx.index_root().is_dir());
        assert_eq!(
            ctx.user_index_dir(42),
            temp_dir.path().join("data").join("search_index").join("42")
        );
    }

    #[test]
    fn test_zero_user_id_is_invalid() {
        assert!(validate_user_id(0).is_err());
        assert!(validate_user_id(1234567891011).is_ok());
    }
}
