//! Native free-space measurement via `statvfs(3)`.

use std::path::Path;

use nix::errno::Errno;
use nix::sys::statvfs::statvfs;

use crate::disk::SpaceProbe;
use crate::error::DiskSpaceError;

/// Reads free space straight from the filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatvfsProbe;

impl SpaceProbe for StatvfsProbe {
    fn free_bytes(&self, path: &Path) -> Result<u64, DiskSpaceError> {
        match statvfs(path) {
            // Blocks available to unprivileged users, in fragment-size units.
            Ok(stat) => Ok((stat.blocks_available() as u64).saturating_mul(stat.fragment_size() as u64)),
            Err(Errno::ENOENT) | Err(Errno::ENOTDIR) => {
                Err(DiskSpaceError::PathError(path.display().to_string()))
            }
            Err(errno) => Err(DiskSpaceError::QueryFailed(format!(
                "statvfs {}: {errno}",
                path.display()
            ))),
        }
    }

    fn name(&self) -> &'static str {
        "statvfs"
    }
}
