//! The per-user index manifest.
//!
//! `manifest.json` is the single source of truth for which segment files make
//! up a user's index. It is only ever replaced atomically, and only after every
//! file it references is durable.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ChatSearchError, Result};
use crate::index::segment::{SegmentData, segment_file_name};
use crate::storage::{Storage, read_file_opt, write_atomic};

/// Manifest file name inside a user's index directory.
pub const MANIFEST_FILE: &str = "manifest.json";

/// Present while a rebuild is in progress.
pub const REBUILD_MARKER: &str = "rebuild.marker";

/// Catalog entry for one segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentMeta {
    pub segment_id: u64,
    pub created_at: DateTime<Utc>,
    pub min_seq: u64,
    pub max_seq: u64,
    pub message_count: u64,
    pub byte_size: u64,
    pub file_name: String,
}

impl SegmentMeta {
    /// Metadata for a new, empty segment.
    pub fn new(segment_id: u64) -> Self {
        SegmentMeta {
            segment_id,
            created_at: Utc::now(),
            min_seq: 0,
            max_seq: 0,
            message_count: 0,
            byte_size: 0,
            file_name: segment_file_name(segment_id),
        }
    }

    /// Refresh range and counts from the segment contents.
    pub fn update_from(&mut self, data: &SegmentData, byte_size: u64) {
        self.min_seq = data.min_seq().unwrap_or(0);
        self.max_seq = data.max_seq().unwrap_or(0);
        self.message_count = data.message_count() as u64;
        self.byte_size = byte_size;
    }

    pub fn is_empty(&self) -> bool {
        self.message_count == 0
    }
}

/// The catalog of a user's index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexManifest {
    pub index_version: String,
    pub rotation_id: u64,
    pub next_segment_id: u64,
    /// Sealed segments, oldest first.
    #[serde(default)]
    pub segments: Vec<SegmentMeta>,
    #[serde(default)]
    pub active: Option<SegmentMeta>,
}

impl IndexManifest {
    pub fn new<S: Into<String>>(index_version: S) -> Self {
        IndexManifest {
            index_version: index_version.into(),
            rotation_id: 0,
            next_segment_id: 1,
            segments: Vec::new(),
            active: None,
        }
    }

    /// Load the manifest, or `None` when the user has no index.
    pub fn load(storage: &dyn Storage) -> Result<Option<Self>> {
        let Some(bytes) = read_file_opt(storage, MANIFEST_FILE)? else {
            return Ok(None);
        };
        let manifest: IndexManifest = serde_json::from_slice(&bytes)
            .map_err(|e| ChatSearchError::index(format!("unreadable {MANIFEST_FILE}: {e}")))?;
        manifest.validate()?;
        Ok(Some(manifest))
    }

    /// Atomically replace the manifest on disk.
    pub fn store(&self, storage: &dyn Storage) -> Result<()> {
        self.validate()?;
        let bytes = serde_json::to_vec_pretty(self)?;
        write_atomic(storage, MANIFEST_FILE, &bytes)
    }

    /// Check ordering and range invariants.
    pub fn validate(&self) -> Result<()> {
        let mut previous_max: Option<u64> = None;
        for segment in &self.segments {
            if segment.is_empty() {
                return Err(ChatSearchError::index(format!(
                    "sealed segment {} is empty",
                    segment.segment_id
                )));
            }
            if segment.min_seq > segment.max_seq {
                return Err(ChatSearchError::index(format!(
                    "segment {} has an inverted range",
                    segment.segment_id
                )));
            }
            if previous_max.is_some_and(|max| segment.min_seq <= max) {
                return Err(ChatSearchError::index(format!(
                    "segment {} overlaps its predecessor",
                    segment.segment_id
                )));
            }
            previous_max = Some(segment.max_seq);
        }

        if let Some(active) = &self.active {
            if !active.is_empty() && previous_max.is_some_and(|max| active.min_seq <= max) {
                return Err(ChatSearchError::index(
                    "active segment overlaps the last sealed segment",
                ));
            }
        }

        let highest_id = self
            .segments
            .iter()
            .chain(self.active.iter())
            .map(|s| s.segment_id)
            .max();
        if highest_id.is_some_and(|id| id >= self.next_segment_id) {
            return Err(ChatSearchError::index("nextSegmentId is not ahead of existing segments"));
        }

        Ok(())
    }

    /// Hand out the next segment id.
    pub fn allocate_segment_id(&mut self) -> u64 {
        let id = self.next_segment_id;
        self.next_segment_id += 1;
        id
    }

    /// Highest sequence number that is sealed.
    pub fn last_sealed_max_seq(&self) -> Option<u64> {
        self.segments.last().map(|s| s.max_seq)
    }

    /// Messages across sealed and active segments.
    pub fn message_count(&self) -> u64 {
        self.segments
            .iter()
            .chain(self.active.iter())
            .map(|s| s.message_count)
            .sum()
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len() + usize::from(self.active.is_some())
    }

    /// Every file name the manifest references.
    pub fn referenced_files(&self) -> HashSet<String> {
        self.segments
            .iter()
            .chain(self.active.iter())
            .map(|s| s.file_name.clone())
            .collect()
    }
}
