//! Appending to a user's index and rotating segments.
//!
//! The writer keeps the sealed segments and the active segment in memory and
//! publishes an immutable [`IndexSnapshot`] after every change that reached
//! disk. Readers clone the snapshot `Arc` under a short read lock and never
//! block on indexing.
//!
//! Write ordering is what keeps the index crash-safe:
//!
//! 1. segment files are written (temp file, sync, rename),
//! 2. the manifest referencing them is replaced,
//! 3. the in-memory snapshot is swapped,
//! 4. the rotation is recorded in the user config store.
//!
//! A crash at any point leaves a manifest that only references complete files.

use std::path::PathBuf;
use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::analysis::analyzer::MessageAnalyzer;
use crate::config::RotationConfig;
use crate::context::{SearchContext, UserId, validate_user_id};
use crate::disk::DiskSpaceGuard;
use crate::error::{ChatSearchError, Result};
use crate::index::manifest::{IndexManifest, SegmentMeta};
use crate::index::message::{Message, prepare_batch};
use crate::index::segment::{SegmentData, read_segment, write_segment};
use crate::index::version::collect_garbage;
use crate::storage::Storage;
use crate::user_config::UserConfigStore;

/// Outcome of an indexing call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexReport {
    /// Messages added to the index.
    pub indexed: usize,
    /// Messages ignored as duplicates or already indexed.
    pub skipped: usize,
    /// Segment rotations performed.
    pub rotations: usize,
}

/// An immutable view of one user's index.
#[derive(Debug, Clone)]
pub struct IndexSnapshot {
    manifest: IndexManifest,
    // Sealed segments in manifest order, then the active segment.
    segments: Vec<Arc<SegmentData>>,
}

impl IndexSnapshot {
    pub fn manifest(&self) -> &IndexManifest {
        &self.manifest
    }

    /// All segments with their catalog entries, oldest first.
    pub fn segments(&self) -> impl Iterator<Item = (&SegmentMeta, &SegmentData)> {
        self.manifest
            .segments
            .iter()
            .chain(self.manifest.active.iter())
            .zip(self.segments.iter().map(Arc::as_ref))
    }

    pub fn message_count(&self) -> usize {
        self.segments.iter().map(|s| s.message_count()).sum()
    }

    /// Messages containing `term`, across all segments.
    pub fn doc_freq(&self, term: &str) -> usize {
        self.segments.iter().map(|s| s.doc_freq(term)).sum()
    }

    pub fn newest_timestamp(&self) -> Option<i64> {
        self.segments.iter().filter_map(|s| s.newest_timestamp()).max()
    }
}

/// Whether `data` has reached a rotation threshold.
pub(crate) fn needs_rotation(rotation: &RotationConfig, data: &SegmentData) -> bool {
    data.message_count() >= rotation.max_messages || data.approx_bytes() >= rotation.max_bytes
}

#[derive(Debug)]
struct WriterState {
    manifest: IndexManifest,
    sealed: Vec<Arc<SegmentData>>,
    active: Arc<SegmentData>,
    // Active segment has changes not yet on disk.
    dirty: bool,
}

impl WriterState {
    fn active_meta(&self) -> Result<SegmentMeta> {
        self.manifest
            .active
            .clone()
            .ok_or_else(|| ChatSearchError::index("manifest has no active segment"))
    }
}

/// Appends messages to one user's index.
#[derive(Debug)]
pub struct IndexWriter {
    user_id: UserId,
    storage: Arc<dyn Storage>,
    analyzer: MessageAnalyzer,
    rotation: RotationConfig,
    guard: DiskSpaceGuard,
    guard_path: PathBuf,
    state: Mutex<WriterState>,
    snapshot: RwLock<Arc<IndexSnapshot>>,
}

impl IndexWriter {
    /// Open (or start) the index of `user_id` in `storage`.
    ///
    /// Fails with `IndexVersionMismatch` if the index was built for another
    /// schema version; such an index has to be rebuilt first.
    pub fn open(
        ctx: &SearchContext,
        user_id: UserId,
        storage: Arc<dyn Storage>,
        analyzer: MessageAnalyzer,
        config_store: &UserConfigStore,
    ) -> Result<Self> {
        validate_user_id(user_id)?;

        let mut manifest = match IndexManifest::load(storage.as_ref())? {
            Some(manifest) if manifest.index_version != ctx.schema_version() => {
                return Err(ChatSearchError::version_mismatch(
                    manifest.index_version,
                    ctx.schema_version(),
                ));
            }
            Some(manifest) => manifest,
            None => IndexManifest::new(ctx.schema_version()),
        };

        let removed = collect_garbage(storage.as_ref(), &manifest)?;
        if !removed.is_empty() {
            info!("Removed {} orphaned files for user {user_id}", removed.len());
        }

        let mut sealed = Vec::with_capacity(manifest.segments.len());
        for meta in &manifest.segments {
            let data = read_segment(storage.as_ref(), &meta.file_name)?;
            if data.message_count() as u64 != meta.message_count {
                return Err(ChatSearchError::index(format!(
                    "{} holds {} messages, manifest says {}",
                    meta.file_name,
                    data.message_count(),
                    meta.message_count
                )));
            }
            sealed.push(Arc::new(data));
        }

        let active = match manifest.active.clone() {
            Some(meta) if storage.file_exists(&meta.file_name) => {
                read_segment(storage.as_ref(), &meta.file_name)?
            }
            Some(meta) if meta.is_empty() => SegmentData::new(),
            Some(meta) => {
                return Err(ChatSearchError::index(format!(
                    "active segment {} is missing",
                    meta.file_name
                )));
            }
            None => {
                let meta = SegmentMeta::new(manifest.allocate_segment_id());
                manifest.active = Some(meta);
                SegmentData::new()
            }
        };

        if manifest.rotation_id > 0 {
            let recorded = config_store.find_user(user_id)?.map(|r| r.rotation_id);
            if recorded.is_none_or(|rotation_id| rotation_id < manifest.rotation_id) {
                debug!(
                    "Config for user {user_id} is behind manifest rotation {}",
                    manifest.rotation_id
                );
                config_store.record_rotation(user_id, manifest.rotation_id)?;
            }
        }

        let state = WriterState {
            manifest,
            sealed,
            active: Arc::new(active),
            dirty: false,
        };
        let snapshot = Arc::new(Self::build_snapshot(&state));

        debug!(
            "Opened index for user {user_id}: {} segments, {} messages",
            state.manifest.segment_count(),
            snapshot.message_count()
        );

        Ok(IndexWriter {
            user_id,
            storage,
            analyzer,
            rotation: ctx.config().rotation.clone(),
            guard: ctx.guard().clone(),
            guard_path: ctx.index_root().to_path_buf(),
            state: Mutex::new(state),
            snapshot: RwLock::new(snapshot),
        })
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn analyzer(&self) -> &MessageAnalyzer {
        &self.analyzer
    }

    /// The latest published view of the index.
    pub fn snapshot(&self) -> Arc<IndexSnapshot> {
        self.snapshot.read().clone()
    }

    /// Index a batch of messages.
    ///
    /// The batch is sorted by `seq`; messages whose `seq` is already sealed,
    /// or whose `seq` or `id` is already in the active segment, are skipped, so
    /// replaying a batch is a no-op.
    pub fn index_batch(
        &self,
        messages: Vec<Message>,
        config_store: &UserConfigStore,
    ) -> Result<IndexReport> {
        self.guard.preflight(&self.guard_path)?;
        for message in &messages {
            message.validate()?;
        }

        let (batch, duplicates) = prepare_batch(messages);
        let mut report = IndexReport {
            skipped: duplicates,
            ..IndexReport::default()
        };

        let mut state = self.state.lock();
        for message in &batch {
            let already_sealed = state
                .manifest
                .last_sealed_max_seq()
                .is_some_and(|max| message.seq <= max);
            if already_sealed
                || state.active.contains_seq(message.seq)
                || state.active.contains_id(&message.id)
            {
                report.skipped += 1;
                continue;
            }

            let terms = self.analyzer.term_frequencies(&message.text)?;
            Arc::make_mut(&mut state.active).add(message, &terms)?;
            state.dirty = true;
            report.indexed += 1;

            if needs_rotation(&self.rotation, &state.active) {
                self.rotate(&mut state, config_store)?;
                report.rotations += 1;
            }
        }

        if state.dirty {
            self.persist_active(&mut state)?;
        }

        debug!(
            "User {}: indexed {}, skipped {}, rotations {}",
            self.user_id, report.indexed, report.skipped, report.rotations
        );
        Ok(report)
    }

    /// Seal the active segment and start a new one.
    fn rotate(&self, state: &mut WriterState, config_store: &UserConfigStore) -> Result<()> {
        let sealed_data = state.active.clone();
        let mut sealed_meta = state.active_meta()?;
        let size = write_segment(self.storage.as_ref(), &sealed_meta.file_name, &sealed_data)?;
        sealed_meta.update_from(&sealed_data, size);

        let mut next = state.manifest.clone();
        next.segments.push(sealed_meta);
        next.rotation_id += 1;

        let empty = Arc::new(SegmentData::new());
        let mut active_meta = SegmentMeta::new(next.allocate_segment_id());
        let empty_size = write_segment(self.storage.as_ref(), &active_meta.file_name, &empty)?;
        active_meta.update_from(&empty, empty_size);
        next.active = Some(active_meta);

        next.store(self.storage.as_ref())?;

        let rotation_id = next.rotation_id;
        state.manifest = next;
        state.sealed.push(sealed_data);
        state.active = empty;
        state.dirty = false;
        self.publish(state);

        info!(
            "Rotated index for user {}: rotation {rotation_id}, {} sealed segments",
            self.user_id,
            state.sealed.len()
        );

        // The manifest is authoritative; a lagging config is repaired on open.
        if let Err(e) = config_store.record_rotation(self.user_id, rotation_id) {
            warn!(
                "Could not record rotation {rotation_id} for user {}: {e}",
                self.user_id
            );
        }
        Ok(())
    }

    fn persist_active(&self, state: &mut WriterState) -> Result<()> {
        let mut meta = state.active_meta()?;
        let size = write_segment(self.storage.as_ref(), &meta.file_name, &state.active)?;
        meta.update_from(&state.active, size);

        let mut next = state.manifest.clone();
        next.active = Some(meta);
        next.store(self.storage.as_ref())?;

        state.manifest = next;
        state.dirty = false;
        self.publish(state);
        Ok(())
    }

    fn publish(&self, state: &WriterState) {
        let snapshot = Arc::new(Self::build_snapshot(state));
        *self.snapshot.write() = snapshot;
    }

    fn build_snapshot(state: &WriterState) -> IndexSnapshot {
        let mut segments = state.sealed.clone();
        segments.push(state.active.clone());
        IndexSnapshot {
            manifest: state.manifest.clone(),
            segments,
        }
    }
}
