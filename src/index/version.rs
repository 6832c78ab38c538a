//! Index lifecycle: version state, rebuild, wipe and health.
//!
//! A user's index is in one of four states:
//!
//! - `NoIndex`: no manifest on disk.
//! - `Rebuilding`: a `rebuild.marker` is present.
//! - `Stale`: the manifest was written for another schema version.
//! - `Current`: everything else.
//!
//! A rebuild writes a complete new set of segments next to the old ones,
//! swaps the manifest, stamps the user config and only then removes the
//! superseded files. Until the swap, the old manifest stays authoritative.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::analysis::analyzer::MessageAnalyzer;
use crate::config::RotationConfig;
use crate::context::{SearchContext, UserId, validate_user_id};
use crate::disk::DiskSpaceGuard;
use crate::error::Result;
use crate::index::directory::IndexDirectory;
use crate::index::manifest::{IndexManifest, REBUILD_MARKER, SegmentMeta};
use crate::index::message::{Message, prepare_batch};
use crate::index::segment::{SegmentData, is_segment_file, write_segment};
use crate::index::writer::{IndexReport, needs_rotation};
use crate::storage::{Storage, write_atomic};
use crate::user_config::UserConfigStore;

/// Lifecycle state of one user's index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexState {
    NoIndex,
    Current,
    Stale,
    Rebuilding,
}

/// Index health and version, as reported to the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexHealth {
    pub user_id: UserId,
    pub state: IndexState,
    pub index_version: Option<String>,
    pub rotation_id: u64,
    pub segment_count: usize,
    pub message_count: u64,
    pub schema_version: String,
}

/// Delete segment files the manifest does not reference, and leftover temp files.
///
/// Returns the names of the removed files.
pub fn collect_garbage(storage: &dyn Storage, manifest: &IndexManifest) -> Result<Vec<String>> {
    let referenced = manifest.referenced_files();
    let mut removed = Vec::new();

    for name in storage.list_files()? {
        let orphan = is_segment_file(&name) && !referenced.contains(&name);
        if orphan || name.ends_with(".tmp") {
            storage.delete_file(&name)?;
            removed.push(name);
        }
    }

    Ok(removed)
}

/// What a startup sweep cleaned up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    /// Users whose index storage was inspected.
    pub users: usize,
    /// Interrupted rebuilds that were rolled back.
    pub recovered: usize,
    /// Orphaned segment and temp files removed.
    pub removed_files: usize,
    /// Users whose storage could not be cleaned.
    pub failed: usize,
}

/// Owns the version state machine of every user's index.
#[derive(Debug)]
pub struct VersionManager {
    directory: Arc<dyn IndexDirectory>,
    schema_version: String,
    rotation: RotationConfig,
    guard: DiskSpaceGuard,
    guard_path: PathBuf,
}

impl VersionManager {
    pub fn new(ctx: &SearchContext, directory: Arc<dyn IndexDirectory>) -> Self {
        VersionManager {
            guard_path: directory.root(),
            directory,
            schema_version: ctx.schema_version().to_string(),
            rotation: ctx.config().rotation.clone(),
            guard: ctx.guard().clone(),
        }
    }

    pub fn schema_version(&self) -> &str {
        &self.schema_version
    }

    pub fn directory(&self) -> &Arc<dyn IndexDirectory> {
        &self.directory
    }

    /// The user's manifest, if the user has an index.
    pub fn load_manifest(&self, user_id: UserId) -> Result<Option<IndexManifest>> {
        if !self.directory.exists(user_id) {
            return Ok(None);
        }
        let storage = self.directory.open(user_id)?;
        IndexManifest::load(storage.as_ref())
    }

    pub fn state(&self, user_id: UserId) -> Result<IndexState> {
        validate_user_id(user_id)?;
        if !self.directory.exists(user_id) {
            return Ok(IndexState::NoIndex);
        }

        let storage = self.directory.open(user_id)?;
        if storage.file_exists(REBUILD_MARKER) {
            return Ok(IndexState::Rebuilding);
        }

        Ok(match IndexManifest::load(storage.as_ref())? {
            None => IndexState::NoIndex,
            Some(manifest) if manifest.index_version != self.schema_version => IndexState::Stale,
            Some(_) => IndexState::Current,
        })
    }

    /// Clean up after a rebuild that did not finish.
    ///
    /// Files of the abandoned rebuild are removed and the marker is cleared;
    /// the state is then whatever the surviving manifest says.
    pub fn recover(&self, user_id: UserId) -> Result<IndexState> {
        validate_user_id(user_id)?;
        if !self.directory.exists(user_id) {
            return Ok(IndexState::NoIndex);
        }

        let storage = self.directory.open(user_id)?;
        if storage.file_exists(REBUILD_MARKER) {
            warn!("Found interrupted rebuild for user {user_id}, cleaning up");
            let manifest = IndexManifest::load(storage.as_ref())?
                .unwrap_or_else(|| IndexManifest::new(self.schema_version.clone()));
            collect_garbage(storage.as_ref(), &manifest)?;
            storage.delete_file(REBUILD_MARKER)?;
            storage.sync()?;
        }

        self.state(user_id)
    }

    /// Clean every user's index storage: roll back interrupted rebuilds and
    /// drop files no manifest references.
    ///
    /// Stale indexes are left alone; they are rebuilt on their next write.
    /// A user that cannot be cleaned is logged and skipped.
    pub fn sweep(&self) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        for user_id in self.directory.users()? {
            report.users += 1;
            match self.sweep_user(user_id) {
                Ok((recovered, removed)) => {
                    report.recovered += usize::from(recovered);
                    report.removed_files += removed;
                }
                Err(e) => {
                    warn!("Could not clean index of user {user_id}: {e}");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    fn sweep_user(&self, user_id: UserId) -> Result<(bool, usize)> {
        match self.state(user_id)? {
            IndexState::Rebuilding => {
                self.recover(user_id)?;
                Ok((true, 0))
            }
            IndexState::Current => {
                let storage = self.directory.open(user_id)?;
                let removed = match IndexManifest::load(storage.as_ref())? {
                    Some(manifest) => collect_garbage(storage.as_ref(), &manifest)?.len(),
                    None => 0,
                };
                Ok((false, removed))
            }
            IndexState::NoIndex | IndexState::Stale => Ok((false, 0)),
        }
    }

    /// Rebuild the user's index from `backfill` under the current schema.
    pub fn rebuild(
        &self,
        user_id: UserId,
        backfill: Vec<Message>,
        analyzer: &MessageAnalyzer,
        config_store: &UserConfigStore,
    ) -> Result<IndexReport> {
        validate_user_id(user_id)?;
        for message in &backfill {
            message.validate()?;
        }
        self.guard.preflight(&self.guard_path)?;

        let storage = self.directory.open(user_id)?;
        let previous = match IndexManifest::load(storage.as_ref()) {
            Ok(previous) => previous,
            Err(e) => {
                warn!("Discarding unreadable manifest of user {user_id}: {e}");
                None
            }
        };

        write_atomic(
            storage.as_ref(),
            REBUILD_MARKER,
            Utc::now().to_rfc3339().as_bytes(),
        )?;

        let mut manifest = IndexManifest::new(self.schema_version.clone());
        if let Some(previous) = &previous {
            manifest.rotation_id = previous.rotation_id;
            manifest.next_segment_id = previous.next_segment_id;
        }

        let (batch, duplicates) = prepare_batch(backfill);
        let mut report = IndexReport {
            skipped: duplicates,
            ..IndexReport::default()
        };

        let mut active = SegmentData::new();
        let mut active_meta = SegmentMeta::new(manifest.allocate_segment_id());
        for message in &batch {
            let terms = analyzer.term_frequencies(&message.text)?;
            active.add(message, &terms)?;
            report.indexed += 1;

            if needs_rotation(&self.rotation, &active) {
                let size = write_segment(storage.as_ref(), &active_meta.file_name, &active)?;
                active_meta.update_from(&active, size);
                manifest.segments.push(active_meta);

                active = SegmentData::new();
                active_meta = SegmentMeta::new(manifest.allocate_segment_id());
            }
        }

        let size = write_segment(storage.as_ref(), &active_meta.file_name, &active)?;
        active_meta.update_from(&active, size);
        manifest.active = Some(active_meta);

        manifest.store(storage.as_ref())?;
        config_store.set_index_version(user_id, &self.schema_version)?;

        let removed = collect_garbage(storage.as_ref(), &manifest)?;
        storage.delete_file(REBUILD_MARKER)?;
        storage.sync()?;

        info!(
            "Rebuilt index for user {user_id} at {}: {} messages in {} segments, {} old files removed",
            self.schema_version,
            report.indexed,
            manifest.segment_count(),
            removed.len()
        );
        Ok(report)
    }

    /// Delete the user's index and config record.
    pub fn wipe(&self, user_id: UserId, config_store: &UserConfigStore) -> Result<()> {
        validate_user_id(user_id)?;
        self.directory.remove(user_id)?;
        config_store.remove_user(user_id)?;
        info!("Wiped search index for user {user_id}");
        Ok(())
    }

    pub fn health(&self, user_id: UserId) -> Result<IndexHealth> {
        let state = self.state(user_id)?;
        let manifest = self.load_manifest(user_id)?;

        Ok(IndexHealth {
            user_id,
            state,
            index_version: manifest.as_ref().map(|m| m.index_version.clone()),
            rotation_id: manifest.as_ref().map_or(0, |m| m.rotation_id),
            segment_count: manifest.as_ref().map_or(0, |m| m.segment_count()),
            message_count: manifest.as_ref().map_or(0, |m| m.message_count()),
            schema_version: self.schema_version.clone(),
        })
    }
}
