//! Per-user segmented message index.
//!
//! Each user owns a directory holding a `manifest.json`, one file per sealed
//! segment and one for the active segment. The [`writer::IndexWriter`] appends
//! to the active segment and rotates it; the [`version::VersionManager`] owns
//! the lifecycle (state, rebuild, wipe, health).

pub mod directory;
pub mod manifest;
pub mod message;
pub mod segment;
pub mod version;
pub mod writer;

pub use directory::{FileIndexDirectory, IndexDirectory, MemoryIndexDirectory};
pub use manifest::{IndexManifest, SegmentMeta};
pub use message::Message;
pub use segment::SegmentData;
pub use version::{IndexHealth, IndexState, VersionManager};
pub use writer::{IndexReport, IndexSnapshot, IndexWriter};
