//! Free-space probes that shell out to an external program.
//!
//! [`DfProbe`] runs `df -k` and reads the "Available" column; [`HelperProbe`]
//! runs a platform helper that prints `<freeBytes>,<status>`. Output parsing is
//! kept in free functions so it can be tested without spawning anything.

use std::path::{Path, PathBuf};
use std::process::Command;

use log::error;

use crate::config::{DF_PATH_ERROR, DISK_NOT_FOUND, DISK_NOT_READY};
use crate::disk::SpaceProbe;
use crate::error::DiskSpaceError;

/// Measures free space with `df -k '<path>'`.
#[derive(Debug, Clone)]
pub struct DfProbe {
    program: PathBuf,
}

impl DfProbe {
    pub fn new() -> Self {
        DfProbe {
            program: PathBuf::from("df"),
        }
    }
}

impl Default for DfProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl SpaceProbe for DfProbe {
    fn free_bytes(&self, path: &Path) -> Result<u64, DiskSpaceError> {
        let output = Command::new(&self.program)
            .arg("-k")
            .arg(path)
            .output()
            .map_err(|e| DiskSpaceError::QueryFailed(format!("Error : {e}")))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !output.status.success() {
            if stderr.contains(DF_PATH_ERROR) {
                return Err(DiskSpaceError::PathError(stderr.trim().to_string()));
            }
            return Err(DiskSpaceError::QueryFailed(format!(
                "Error : {} {}",
                output.status,
                stderr.trim()
            )));
        }

        parse_df_output(&stdout)
    }

    fn name(&self) -> &'static str {
        "df"
    }
}

/// Parse `df -k` output: last line, fourth column, in KiB.
pub fn parse_df_output(stdout: &str) -> Result<u64, DiskSpaceError> {
    let last_line = stdout
        .trim()
        .lines()
        .last()
        .ok_or_else(|| DiskSpaceError::QueryFailed("empty df output".to_string()))?;

    let available = last_line
        .split_whitespace()
        .nth(3)
        .ok_or_else(|| DiskSpaceError::QueryFailed(format!("unexpected df output: {last_line}")))?;

    let kib: u64 = available.parse().map_err(|_| {
        DiskSpaceError::QueryFailed(format!("unexpected df available column: {available}"))
    })?;

    Ok(kib.saturating_mul(1024))
}

/// Measures free space with an external helper executable.
#[derive(Debug, Clone)]
pub struct HelperProbe {
    program: Option<PathBuf>,
}

impl HelperProbe {
    pub fn new(program: Option<PathBuf>) -> Self {
        HelperProbe { program }
    }
}

impl SpaceProbe for HelperProbe {
    fn free_bytes(&self, path: &Path) -> Result<u64, DiskSpaceError> {
        let program = self.program.as_ref().ok_or_else(|| {
            DiskSpaceError::QueryFailed("no free-space helper configured".to_string())
        })?;

        let output = Command::new(program)
            .arg(path)
            .output()
            .map_err(|e| DiskSpaceError::QueryFailed(format!("Error : {e}")))?;

        if !output.status.success() {
            // The helper still prints its status line on failure, so keep parsing.
            error!(
                "Error retrieving free disk space : {} stderr: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        parse_helper_output(&String::from_utf8_lossy(&output.stdout))
    }

    fn name(&self) -> &'static str {
        "helper"
    }
}

/// Parse helper output of the form `<freeBytes>,<status>`.
pub fn parse_helper_output(stdout: &str) -> Result<u64, DiskSpaceError> {
    let mut fields = stdout.trim().split(',');
    let bytes = fields.next().unwrap_or_default().trim();
    let status = fields.next().map(str::trim);

    match status {
        Some(DISK_NOT_READY) => return Err(DiskSpaceError::NotReady),
        Some(DISK_NOT_FOUND) => return Err(DiskSpaceError::NotFound),
        _ => {}
    }

    bytes
        .parse()
        .map_err(|_| DiskSpaceError::QueryFailed(format!("unexpected helper output: {}", stdout.trim())))
}
