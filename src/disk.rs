//! Disk-space preflight.
//!
//! Every write the worker performs (indexing, config updates, rebuilds) first
//! asks the [`DiskSpaceGuard`] whether the target volume has at least the
//! configured minimum free. How free space is measured is delegated to a
//! [`SpaceProbe`]; callers only ever see a [`DiskCheck`].
//!
//! Results are never cached: each check is a fresh OS query.
//!
//! # Example
//!
//! ```
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! use chatsearch::disk::{DiskSpaceGuard, FixedProbe};
//! use chatsearch::error::DiskSpaceError;
//!
//! let guard = DiskSpaceGuard::new(Arc::new(FixedProbe::new(1_000)), 500);
//! assert!(guard.check_free_space(Some(Path::new("/data"))).ok);
//!
//! // Without a callback nothing is checked.
//! assert!(!guard.check_free_space_with(Some(Path::new("/data")), None::<fn(bool, Option<DiskSpaceError>)>));
//! ```

use std::path::Path;
use std::sync::Arc;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::config::{DiskConfig, ProbeKind};
use crate::error::{ChatSearchError, DiskSpaceError, Result};

pub mod command;
#[cfg(unix)]
pub mod native;

pub use command::{DfProbe, HelperProbe};
#[cfg(unix)]
pub use native::StatvfsProbe;

/// A strategy for measuring free space.
pub trait SpaceProbe: Send + Sync + std::fmt::Debug {
    /// Free bytes available to the current user on the volume holding `path`.
    fn free_bytes(&self, path: &Path) -> std::result::Result<u64, DiskSpaceError>;

    /// Short name used in logs.
    fn name(&self) -> &'static str;
}

/// A probe that always returns the same answer.
#[derive(Debug, Clone)]
pub struct FixedProbe {
    answer: std::result::Result<u64, DiskSpaceError>,
}

impl FixedProbe {
    /// Report `free_bytes` for every path.
    pub fn new(free_bytes: u64) -> Self {
        FixedProbe {
            answer: Ok(free_bytes),
        }
    }

    /// Fail every query with `error`.
    pub fn failing(error: DiskSpaceError) -> Self {
        FixedProbe { answer: Err(error) }
    }
}

impl SpaceProbe for FixedProbe {
    fn free_bytes(&self, _path: &Path) -> std::result::Result<u64, DiskSpaceError> {
        self.answer.clone()
    }

    fn name(&self) -> &'static str {
        "fixed"
    }
}

/// Outcome of a free-space check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskCheck {
    /// Whether the write may proceed.
    pub ok: bool,

    /// Measured free bytes, when the probe produced a number.
    pub free_bytes: Option<u64>,

    /// Diagnostic when `ok` is false.
    pub error: Option<DiskSpaceError>,
}

impl DiskCheck {
    fn passed(free_bytes: u64) -> Self {
        DiskCheck {
            ok: true,
            free_bytes: Some(free_bytes),
            error: None,
        }
    }

    fn failed(free_bytes: Option<u64>, error: DiskSpaceError) -> Self {
        DiskCheck {
            ok: false,
            free_bytes,
            error: Some(error),
        }
    }
}

/// Free-space guard used before every write.
#[derive(Debug, Clone)]
pub struct DiskSpaceGuard {
    probe: Arc<dyn SpaceProbe>,
    minimum_free_bytes: u64,
}

impl DiskSpaceGuard {
    /// Create a guard around an explicit probe.
    pub fn new(probe: Arc<dyn SpaceProbe>, minimum_free_bytes: u64) -> Self {
        DiskSpaceGuard {
            probe,
            minimum_free_bytes,
        }
    }

    /// Create the guard described by `config`.
    pub fn from_config(config: &DiskConfig) -> Self {
        let probe: Arc<dyn SpaceProbe> = match config.probe {
            #[cfg(unix)]
            ProbeKind::Native => Arc::new(StatvfsProbe),
            #[cfg(not(unix))]
            ProbeKind::Native => Arc::new(HelperProbe::new(config.helper_path.clone())),
            ProbeKind::Df => Arc::new(DfProbe::new()),
            ProbeKind::Helper => Arc::new(HelperProbe::new(config.helper_path.clone())),
            ProbeKind::Disabled => Arc::new(FixedProbe::new(u64::MAX)),
        };
        Self::new(probe, config.minimum_free_bytes)
    }

    /// Minimum free bytes this guard requires.
    pub fn minimum_free_bytes(&self) -> u64 {
        self.minimum_free_bytes
    }

    /// Check whether `path` has enough free space. Never panics.
    pub fn check_free_space(&self, path: Option<&Path>) -> DiskCheck {
        let Some(path) = path.filter(|p| !p.as_os_str().is_empty()) else {
            return DiskCheck::failed(None, DiskSpaceError::InvalidPath);
        };

        match self.probe.free_bytes(path) {
            Ok(free) if free >= self.minimum_free_bytes => {
                debug!(
                    "{} probe: {} bytes free at {}",
                    self.probe.name(),
                    free,
                    path.display()
                );
                DiskCheck::passed(free)
            }
            Ok(free) => {
                warn!(
                    "Free space at {} is {} bytes, below the {} byte minimum",
                    path.display(),
                    free,
                    self.minimum_free_bytes
                );
                DiskCheck::failed(
                    Some(free),
                    DiskSpaceError::BelowThreshold {
                        free,
                        required: self.minimum_free_bytes,
                    },
                )
            }
            Err(e) => {
                warn!("Error retrieving free disk space for {}: {e}", path.display());
                DiskCheck::failed(None, e)
            }
        }
    }

    /// Callback form of [`check_free_space`](Self::check_free_space).
    ///
    /// Returns `false` without checking anything when no callback is supplied.
    /// Otherwise runs the check, hands `(ok, diagnostic)` to the callback and
    /// returns `true`.
    pub fn check_free_space_with<F>(&self, path: Option<&Path>, callback: Option<F>) -> bool
    where
        F: FnOnce(bool, Option<DiskSpaceError>),
    {
        let Some(callback) = callback else {
            return false;
        };
        let check = self.check_free_space(path);
        callback(check.ok, check.error);
        true
    }

    /// Fail with `InsufficientDiskSpace` unless `path` passes the check.
    pub fn preflight(&self, path: &Path) -> Result<()> {
        let check = self.check_free_space(Some(path));
        if check.ok {
            Ok(())
        } else {
            Err(ChatSearchError::InsufficientDiskSpace(
                check.error.unwrap_or(DiskSpaceError::QueryFailed(
                    "no diagnostic".to_string(),
                )),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_enough_space_passes() {
        let guard = DiskSpaceGuard::new(Arc::new(FixedProbe::new(2_000)), 1_000);
        let check = guard.check_free_space(Some(Path::new("/tmp")));
        assert!(check.ok);
        assert_eq!(check.free_bytes, Some(2_000));
        assert!(check.error.is_none());
    }

    #[test]
    fn test_below_threshold_fails() {
        let guard = DiskSpaceGuard::new(Arc::new(FixedProbe::new(10)), 1_000);
        let check = guard.check_free_space(Some(Path::new("/tmp")));
        assert!(!check.ok);
        assert_eq!(
            check.error,
            Some(DiskSpaceError::BelowThreshold {
                free: 10,
                required: 1_000
            })
        );
    }

    #[test]
    fn test_missing_or_empty_path_fails() {
        let guard = DiskSpaceGuard::new(Arc::new(FixedProbe::new(u64::MAX)), 0);
        assert_eq!(
            guard.check_free_space(None).error,
            Some(DiskSpaceError::InvalidPath)
        );
        assert_eq!(
            guard.check_free_space(Some(Path::new(""))).error,
            Some(DiskSpaceError::InvalidPath)
        );
    }

    #[test]
    fn test_probe_failure_is_reported_not_raised() {
        let guard = DiskSpaceGuard::new(
            Arc::new(FixedProbe::failing(DiskSpaceError::NotReady)),
            0,
        );
        let check = guard.check_free_space(Some(Path::new("A://test")));
        assert!(!check.ok);
        assert_eq!(check.error, Some(DiskSpaceError::NotReady));
    }

    #[test]
    fn test_no_callback_returns_false() {
        let guard = DiskSpaceGuard::new(Arc::new(FixedProbe::new(u64::MAX)), 0);
        let started =
            guard.check_free_space_with(Some(Path::new("/tmp")), None::<fn(bool, Option<DiskSpaceError>)>);
        assert!(!started);
    }

    #[test]
    fn test_callback_receives_status() {
        let guard = DiskSpaceGuard::new(Arc::new(FixedProbe::new(5)), 10);
        let mut seen = None;
        let started = guard.check_free_space_with(
            Some(Path::new("/tmp")),
            Some(|ok: bool, error: Option<DiskSpaceError>| seen = Some((ok, error))),
        );
        assert!(started);
        let (ok, error) = seen.unwrap();
        assert!(!ok);
        assert!(matches!(error, Some(DiskSpaceError::BelowThreshold { .. })));
    }

    #[test]
    fn test_preflight_maps_to_insufficient_disk_space() {
        let guard = DiskSpaceGuard::new(Arc::new(FixedProbe::new(5)), 10);
        let err = guard.preflight(Path::new("/tmp")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InsufficientDiskSpace);
    }

    #[cfg(unix)]
    #[test]
    fn test_native_probe_on_nonexistent_path_fails() {
        let guard = DiskSpaceGuard::new(Arc::new(StatvfsProbe), 0);
        let check = guard.check_free_space(Some(Path::new("./tp/does/not/exist")));
        assert!(!check.ok);
        assert!(matches!(check.error, Some(DiskSpaceError::PathError(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_native_probe_on_temp_dir_passes() {
        let dir = tempfile::TempDir::new().unwrap();
        let guard = DiskSpaceGuard::new(Arc::new(StatvfsProbe), 1);
        assert!(guard.check_free_space(Some(dir.path())).ok);
    }
}
