//! Configuration for the search worker.
//!
//! All recognised options live in [`SearchConfig`] and its sections. Defaults
//! are resolved when the config is constructed (or deserialized, thanks to
//! `#[serde(default)]`), never at call time.
//!
//! # Example
//!
//! ```no_run
//! use chatsearch::config::SearchConfig;
//!
//! let config = SearchConfig::builder()
//!     .user_data_dir("/tmp/chatsearch")
//!     .rotation_max_messages(5_000)
//!     .max_results(50)
//!     .build()
//!     .unwrap();
//! assert_eq!(config.search.max_results, 50);
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ChatSearchError, Result};

/// Schema tag written into new config records and manifests.
pub const INDEX_VERSION: &str = "v1";

/// File name of the per-installation user config document.
pub const USER_CONFIG_FILE: &str = "search_users_config.json";

/// Default minimum free space required before any write (300 MB).
pub const MINIMUM_DISK_SPACE: u64 = 300_000_000;

/// Status token printed by the free-space helper when a drive is not ready.
pub const DISK_NOT_READY: &str = "NOT_READY";

/// Status token printed by the free-space helper when a drive does not exist.
pub const DISK_NOT_FOUND: &str = "DISK_NOT_FOUND";

/// `df` diagnostic for unresolvable paths.
pub const DF_PATH_ERROR: &str = "No such file or directory";

/// Where the worker keeps its files.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Directory holding the user config document.
    pub user_data_dir: PathBuf,

    /// Root of the per-user index directories. Defaults to
    /// `<user_data_dir>/search_index` when unset.
    pub index_root: Option<PathBuf>,

    /// File name of the user config document inside `user_data_dir`.
    pub config_file_name: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        PathsConfig {
            user_data_dir: PathBuf::from("."),
            index_root: None,
            config_file_name: USER_CONFIG_FILE.to_string(),
        }
    }
}

impl PathsConfig {
    /// Full path of the user config document.
    pub fn config_file(&self) -> PathBuf {
        self.user_data_dir.join(&self.config_file_name)
    }

    /// Root directory of the per-user indexes.
    pub fn index_root(&self) -> PathBuf {
        self.index_root
            .clone()
            .unwrap_or_else(|| self.user_data_dir.join("search_index"))
    }
}

/// How free space is measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeKind {
    /// Native filesystem statistics (`statvfs`).
    Native,
    /// The `df` command.
    Df,
    /// An external helper executable printing `<bytes>,<status>`.
    Helper,
    /// Always report plenty of space.
    Disabled,
}

impl Default for ProbeKind {
    fn default() -> Self {
        if cfg!(unix) {
            ProbeKind::Native
        } else {
            ProbeKind::Helper
        }
    }
}

/// Disk-space preflight settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskConfig {
    /// Minimum free bytes required on the target volume.
    pub minimum_free_bytes: u64,

    /// Measurement strategy.
    pub probe: ProbeKind,

    /// Helper executable used by [`ProbeKind::Helper`].
    pub helper_path: Option<PathBuf>,
}

impl Default for DiskConfig {
    fn default() -> Self {
        DiskConfig {
            minimum_free_bytes: MINIMUM_DISK_SPACE,
            probe: ProbeKind::default(),
            helper_path: None,
        }
    }
}

/// Thresholds at which the active segment is sealed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationConfig {
    /// Seal once the active segment holds this many messages.
    pub max_messages: usize,

    /// Seal once the active segment's estimated size reaches this many bytes.
    pub max_bytes: u64,
}

impl Default for RotationConfig {
    fn default() -> Self {
        RotationConfig {
            max_messages: 10_000,
            max_bytes: 64 * 1024 * 1024, // 64MB
        }
    }
}

/// Query engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Hard cap on the number of results returned.
    pub max_results: usize,

    /// Age (relative to the newest indexed message) at which the recency weight halves.
    pub recency_half_life_days: f64,

    /// Lower bound for the recency weight.
    pub recency_floor: f32,

    /// Optional regex used instead of Unicode word segmentation.
    pub token_pattern: Option<String>,
}

impl Default for QueryConfig {
    fn default() -> Self {
        QueryConfig {
            max_results: 100,
            recency_half_life_days: 30.0,
            recency_floor: 0.05,
            token_pattern: None,
        }
    }
}

/// Worker restart policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Delay before the first restart, in milliseconds.
    pub initial_backoff_ms: u64,

    /// Multiplier applied to the delay after every consecutive failure.
    pub backoff_multiplier: f64,

    /// Upper bound for the restart delay, in milliseconds.
    pub max_backoff_ms: u64,

    /// Consecutive failures after which the worker is declared unavailable.
    pub max_consecutive_failures: u32,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        SupervisorConfig {
            initial_backoff_ms: 100,
            backoff_multiplier: 2.0,
            max_backoff_ms: 10_000,
            max_consecutive_failures: 5,
        }
    }
}

impl SupervisorConfig {
    /// Delay before restart attempt number `failures` (1-based).
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(32) as i32;
        let delay = self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(exponent);
        Duration::from_millis(delay.min(self.max_backoff_ms as f64) as u64)
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub paths: PathsConfig,
    pub disk: DiskConfig,
    pub rotation: RotationConfig,
    pub search: QueryConfig,
    pub supervisor: SupervisorConfig,

    /// Schema tag understood by this build.
    pub schema_version: String,

    /// Language stamped on records created without one.
    pub default_language: String,
}

impl Default for SearchConfig {
    fn default() -> Self {
        SearchConfig {
            paths: PathsConfig::default(),
            disk: DiskConfig::default(),
            rotation: RotationConfig::default(),
            search: QueryConfig::default(),
            supervisor: SupervisorConfig::default(),
            schema_version: INDEX_VERSION.to_string(),
            default_language: "en".to_string(),
        }
    }
}

impl SearchConfig {
    /// Create a new builder.
    pub fn builder() -> SearchConfigBuilder {
        SearchConfigBuilder::new()
    }

    /// Load a config from a JSON file; missing fields take their defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            ChatSearchError::invalid_input(format!(
                "Failed to read config {}: {e}",
                path.display()
            ))
        })?;
        let config: SearchConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check that the values are usable.
    pub fn validate(&self) -> Result<()> {
        if self.schema_version.trim().is_empty() {
            return Err(ChatSearchError::invalid_input("schema_version must not be empty"));
        }
        if self.rotation.max_messages == 0 {
            return Err(ChatSearchError::invalid_input(
                "rotation.max_messages must be greater than zero",
            ));
        }
        if self.rotation.max_bytes == 0 {
            return Err(ChatSearchError::invalid_input(
                "rotation.max_bytes must be greater than zero",
            ));
        }
        if self.search.max_results == 0 {
            return Err(ChatSearchError::invalid_input(
                "search.max_results must be greater than zero",
            ));
        }
        if self.search.recency_half_life_days.is_nan() || self.search.recency_half_life_days <= 0.0 {
            return Err(ChatSearchError::invalid_input(
                "search.recency_half_life_days must be positive",
            ));
        }
        if self.supervisor.backoff_multiplier < 1.0 {
            return Err(ChatSearchError::invalid_input(
                "supervisor.backoff_multiplier must be at least 1.0",
            ));
        }
        if self.supervisor.max_consecutive_failures == 0 {
            return Err(ChatSearchError::invalid_input(
                "supervisor.max_consecutive_failures must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// Builder for [`SearchConfig`].
#[derive(Debug, Clone, Default)]
pub struct SearchConfigBuilder {
    config: SearchConfig,
}

impl SearchConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn user_data_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.config.paths.user_data_dir = dir.into();
        self
    }

    pub fn index_root<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.config.paths.index_root = Some(dir.into());
        self
    }

    pub fn minimum_free_bytes(mut self, bytes: u64) -> Self {
        self.config.disk.minimum_free_bytes = bytes;
        self
    }

    pub fn probe(mut self, probe: ProbeKind) -> Self {
        self.config.disk.probe = probe;
        self
    }

    pub fn helper_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.config.disk.helper_path = Some(path.into());
        self
    }

    pub fn rotation_max_messages(mut self, count: usize) -> Self {
        self.config.rotation.max_messages = count;
        self
    }

    pub fn rotation_max_bytes(mut self, bytes: u64) -> Self {
        self.config.rotation.max_bytes = bytes;
        self
    }

    pub fn max_results(mut self, count: usize) -> Self {
        self.config.search.max_results = count;
        self
    }

    pub fn recency_half_life_days(mut self, days: f64) -> Self {
        self.config.search.recency_half_life_days = days;
        self
    }

    pub fn token_pattern<S: Into<String>>(mut self, pattern: S) -> Self {
        self.config.search.token_pattern = Some(pattern.into());
        self
    }

    pub fn supervisor(mut self, supervisor: SupervisorConfig) -> Self {
        self.config.supervisor = supervisor;
        self
    }

    pub fn schema_version<S: Into<String>>(mut self, version: S) -> Self {
        self.config.schema_version = version.into();
        self
    }

    pub fn default_language<S: Into<String>>(mut self, language: S) -> Self {
        self.config.default_language = language.into();
        self
    }

    pub fn build(self) -> Result<SearchConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = SearchConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.schema_version, "v1");
        assert_eq!(config.disk.minimum_free_bytes, MINIMUM_DISK_SPACE);
        assert_eq!(
            config.paths.config_file(),
            PathBuf::from(".").join(USER_CONFIG_FILE)
        );
    }

    #[test]
    fn test_partial_json_takes_defaults() {
        let config: SearchConfig =
            serde_json::from_str(r#"{"rotation": {"max_messages": 7}}"#).unwrap();
        assert_eq!(config.rotation.max_messages, 7);
        assert_eq!(config.rotation.max_bytes, 64 * 1024 * 1024);
        assert_eq!(config.search.max_results, 100);
    }

    #[test]
    fn test_builder_rejects_zero_rotation() {
        let result = SearchConfig::builder().rotation_max_messages(0).build();
        assert!(result.is_err());
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let supervisor = SupervisorConfig {
            initial_backoff_ms: 100,
            backoff_multiplier: 2.0,
            max_backoff_ms: 500,
            max_consecutive_failures: 5,
        };
        assert_eq!(supervisor.backoff(1), Duration::from_millis(100));
        assert_eq!(supervisor.backoff(2), Duration::from_millis(200));
        assert_eq!(supervisor.backoff(3), Duration::from_millis(400));
        assert_eq!(supervisor.backoff(4), Duration::from_millis(500));
    }

    #[test]
    fn test_index_root_defaults_under_user_data() {
        let config = SearchConfig::builder()
            .user_data_dir("/data")
            .build()
            .unwrap();
        assert_eq!(config.paths.index_root(), PathBuf::from("/data/search_index"));
    }
}
