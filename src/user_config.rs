//! Per-user search configuration records.
//!
//! One JSON document per installation maps the user id (as a string) to a
//! [`UserConfigRecord`]. The document is always rewritten in full with
//! [`write_atomic`], so a crash leaves either the previous or the new version
//! on disk.
//!
//! Lookups distinguish three outcomes that are easy to collapse by accident:
//!
//! | on disk                     | result                         |
//! |-----------------------------|--------------------------------|
//! | no document                 | `Ok(ConfigLookup::NoConfigFile)` |
//! | document, no entry for user | `Ok(ConfigLookup::NoRecord)`     |
//! | document with entry         | `Ok(ConfigLookup::Found(..))`    |
//! | unreadable / malformed      | `Err(ConfigRead)`                |

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::context::{SearchContext, UserId, validate_user_id};
use crate::disk::DiskSpaceGuard;
use crate::error::{ChatSearchError, Result};
use crate::storage::{Storage, read_file_opt, write_atomic};

/// The stored search settings of one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserConfigRecord {
    #[serde(default)]
    pub user_id: UserId,

    /// Number of completed segment rotations.
    #[serde(default)]
    pub rotation_id: u64,

    /// Client-side data version; never decreases.
    #[serde(default)]
    pub version: u32,

    #[serde(default)]
    pub language: String,

    /// Schema tag of the index this record describes.
    #[serde(default)]
    pub index_version: String,
}

/// Fields a caller may change with [`UserConfigStore::update_user_config`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserConfigPatch {
    pub rotation_id: Option<u64>,
    pub version: Option<u32>,
    pub language: Option<String>,
}

impl UserConfigPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rotation_id(mut self, rotation_id: u64) -> Self {
        self.rotation_id = Some(rotation_id);
        self
    }

    pub fn version(mut self, version: u32) -> Self {
        self.version = Some(version);
        self
    }

    pub fn language<S: Into<String>>(mut self, language: S) -> Self {
        self.language = Some(language.into());
        self
    }
}

/// Result of [`UserConfigStore::get_user_config`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigLookup {
    /// No config document existed yet (one has now been created).
    NoConfigFile,
    /// The document exists but has no entry for the user.
    NoRecord,
    /// The user's record.
    Found(UserConfigRecord),
}

impl ConfigLookup {
    /// The record, if one was found.
    pub fn record(&self) -> Option<&UserConfigRecord> {
        match self {
            ConfigLookup::Found(record) => Some(record),
            _ => None,
        }
    }

    pub fn into_record(self) -> Option<UserConfigRecord> {
        match self {
            ConfigLookup::Found(record) => Some(record),
            _ => None,
        }
    }
}

type ConfigDocument = BTreeMap<String, UserConfigRecord>;

/// Reads and atomically rewrites the user config document.
#[derive(Debug)]
pub struct UserConfigStore {
    storage: Arc<dyn Storage>,
    file_name: String,
    guard: DiskSpaceGuard,
    guard_path: PathBuf,
    schema_version: String,
    default_language: String,
    // Serializes read-modify-write cycles on the document.
    write_lock: Mutex<()>,
}

impl UserConfigStore {
    /// Store for the document named in `ctx`, kept in `storage`.
    pub fn new(ctx: &SearchContext, storage: Arc<dyn Storage>) -> Self {
        UserConfigStore {
            storage,
            file_name: ctx.config().paths.config_file_name.clone(),
            guard: ctx.guard().clone(),
            guard_path: ctx.user_data_dir().to_path_buf(),
            schema_version: ctx.schema_version().to_string(),
            default_language: ctx.default_language().to_string(),
            write_lock: Mutex::new(()),
        }
    }

    /// Look up a user's record. See the module docs for the three outcomes.
    pub fn get_user_config(&self, user_id: UserId) -> Result<ConfigLookup> {
        validate_user_id(user_id)?;

        let _guard = self.write_lock.lock();
        match self.load()? {
            None => {
                debug!("User config {} not found, creating it", self.file_name);
                if let Err(e) = self.persist(&ConfigDocument::new()) {
                    warn!("Could not create user config {}: {e}", self.file_name);
                }
                Ok(ConfigLookup::NoConfigFile)
            }
            Some(document) => Ok(document
                .get(&user_id.to_string())
                .cloned()
                .map(ConfigLookup::Found)
                .unwrap_or(ConfigLookup::NoRecord)),
        }
    }

    /// Merge `patch` into the user's record, creating record and document as needed.
    ///
    /// New records are stamped with the current schema tag; existing records keep
    /// theirs. `version` may not go backwards; `rotationId` may stay put or
    /// advance by one.
    pub fn update_user_config(
        &self,
        user_id: UserId,
        patch: UserConfigPatch,
    ) -> Result<UserConfigRecord> {
        validate_user_id(user_id)?;
        self.guard.preflight(&self.guard_path)?;

        self.modify(user_id, |record| {
            if let Some(version) = patch.version {
                if version < record.version {
                    return Err(ChatSearchError::invalid_input(format!(
                        "version may not decrease ({} -> {version})",
                        record.version
                    )));
                }
                record.version = version;
            }
            if let Some(rotation_id) = patch.rotation_id {
                if rotation_id < record.rotation_id {
                    return Err(ChatSearchError::invalid_input(format!(
                        "rotationId may not decrease ({} -> {rotation_id})",
                        record.rotation_id
                    )));
                }
                if rotation_id > record.rotation_id.saturating_add(1) {
                    return Err(ChatSearchError::invalid_input(format!(
                        "rotationId may only advance by one ({} -> {rotation_id})",
                        record.rotation_id
                    )));
                }
                record.rotation_id = rotation_id;
            }
            if let Some(language) = &patch.language {
                record.language = language.clone();
            }
            Ok(())
        })
    }

    /// Stamp a new schema tag on the user's record (after a rebuild).
    pub fn set_index_version(&self, user_id: UserId, index_version: &str) -> Result<UserConfigRecord> {
        validate_user_id(user_id)?;
        self.modify(user_id, |record| {
            record.index_version = index_version.to_string();
            Ok(())
        })
    }

    /// Record a completed rotation.
    pub fn record_rotation(&self, user_id: UserId, rotation_id: u64) -> Result<UserConfigRecord> {
        validate_user_id(user_id)?;
        self.modify(user_id, |record| {
            record.rotation_id = record.rotation_id.max(rotation_id);
            Ok(())
        })
    }

    /// Remove the user's record. Returns whether one existed.
    pub fn remove_user(&self, user_id: UserId) -> Result<bool> {
        validate_user_id(user_id)?;

        let _guard = self.write_lock.lock();
        let Some(mut document) = self.load()? else {
            return Ok(false);
        };
        let existed = document.remove(&user_id.to_string()).is_some();
        if existed {
            self.persist(&document)?;
            info!("Removed search config for user {user_id}");
        }
        Ok(existed)
    }

    /// The user's record, without creating the document when it is missing.
    pub fn find_user(&self, user_id: UserId) -> Result<Option<UserConfigRecord>> {
        Ok(self
            .load()?
            .and_then(|mut document| document.remove(&user_id.to_string())))
    }

    /// All records, keyed by user id.
    pub fn load_all(&self) -> Result<BTreeMap<UserId, UserConfigRecord>> {
        let document = self.load()?.unwrap_or_default();
        Ok(document
            .into_iter()
            .filter_map(|(key, record)| key.parse().ok().map(|id| (id, record)))
            .collect())
    }

    fn modify<F>(&self, user_id: UserId, apply: F) -> Result<UserConfigRecord>
    where
        F: FnOnce(&mut UserConfigRecord) -> Result<()>,
    {
        let _guard = self.write_lock.lock();
        let mut document = self.load()?.unwrap_or_default();
        let key = user_id.to_string();

        let mut record = document.get(&key).cloned().unwrap_or_else(|| UserConfigRecord {
            user_id,
            rotation_id: 0,
            version: 1,
            language: self.default_language.clone(),
            index_version: self.schema_version.clone(),
        });
        record.user_id = user_id;
        apply(&mut record)?;

        document.insert(key, record.clone());
        self.persist(&document)?;
        Ok(record)
    }

    fn load(&self) -> Result<Option<ConfigDocument>> {
        let Some(bytes) = read_file_opt(self.storage.as_ref(), &self.file_name).map_err(|e| {
            ChatSearchError::config_read(format!("Failed to read {}: {e}", self.file_name))
        })?
        else {
            return Ok(None);
        };

        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Some(ConfigDocument::new()));
        }

        let document = serde_json::from_slice(&bytes).map_err(|e| {
            ChatSearchError::config_read(format!("Failed to parse {}: {e}", self.file_name))
        })?;
        Ok(Some(document))
    }

    fn persist(&self, document: &ConfigDocument) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(document)?;
        write_atomic(self.storage.as_ref(), &self.file_name, &bytes).map_err(|e| {
            ChatSearchError::config_write(format!("Failed to write {}: {e}", self.file_name))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SearchConfig;
    use crate::disk::FixedProbe;
    use crate::error::{DiskSpaceError, ErrorKind};
    use crate::storage::memory::MemoryStorage;
    use tempfile::TempDir;

    const USER: UserId = 1234567891011;

    fn context(temp_dir: &TempDir, free_bytes: u64) -> SearchContext {
        let config = SearchConfig::builder()
            .user_data_dir(temp_dir.path())
            .minimum_free_bytes(100)
            .build()
            .unwrap();
        let guard = DiskSpaceGuard::new(Arc::new(FixedProbe::new(free_bytes)), 100);
        SearchContext::with_guard(config, guard).unwrap()
    }

    fn store(free_bytes: u64) -> (TempDir, Arc<MemoryStorage>, UserConfigStore) {
        let temp_dir = TempDir::new().unwrap();
        let ctx = context(&temp_dir, free_bytes);
        let storage = Arc::new(MemoryStorage::new());
        let store = UserConfigStore::new(&ctx, storage.clone());
        (temp_dir, storage, store)
    }

    #[test]
    fn test_lookup_sequence_null_then_empty() {
        let (_dir, storage, store) = store(u64::MAX);

        assert_eq!(store.get_user_config(USER).unwrap(), ConfigLookup::NoConfigFile);
        assert!(storage.file_exists(crate::config::USER_CONFIG_FILE));
        assert_eq!(store.get_user_config(USER).unwrap(), ConfigLookup::NoRecord);
    }

    #[test]
    fn test_first_update_stamps_index_version() {
        let (_dir, _storage, store) = store(u64::MAX);

        let record = store
            .update_user_config(USER, UserConfigPatch::new().rotation_id(0).version(1).language("en"))
            .unwrap();

        assert_eq!(
            record,
            UserConfigRecord {
                user_id: USER,
                rotation_id: 0,
                version: 1,
                language: "en".to_string(),
                index_version: "v1".to_string(),
            }
        );
        assert_eq!(store.get_user_config(USER).unwrap(), ConfigLookup::Found(record));
    }

    #[test]
    fn test_second_update_preserves_index_version() {
        let (_dir, _storage, store) = store(u64::MAX);
        store
            .update_user_config(USER, UserConfigPatch::new().rotation_id(0).version(1).language("en"))
            .unwrap();
        store.set_index_version(USER, "v1").unwrap();

        let record = store
            .update_user_config(USER, UserConfigPatch::new().rotation_id(1).version(1).language("en"))
            .unwrap();
        assert_eq!(record.rotation_id, 1);
        assert_eq!(record.index_version, "v1");
    }

    #[test]
    fn test_version_may_not_decrease() {
        let (_dir, _storage, store) = store(u64::MAX);
        store
            .update_user_config(USER, UserConfigPatch::new().version(3))
            .unwrap();

        let err = store
            .update_user_config(USER, UserConfigPatch::new().version(2))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);

        let err = store
            .update_user_config(USER, UserConfigPatch::new().rotation_id(1))
            .and_then(|_| store.update_user_config(USER, UserConfigPatch::new().rotation_id(0)))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn test_rotation_id_advances_one_step_at_a_time() {
        let (_dir, _storage, store) = store(u64::MAX);
        store
            .update_user_config(USER, UserConfigPatch::new().rotation_id(1))
            .unwrap();

        let err = store
            .update_user_config(USER, UserConfigPatch::new().rotation_id(5))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);

        let record = store
            .update_user_config(USER, UserConfigPatch::new().rotation_id(1))
            .unwrap();
        assert_eq!(record.rotation_id, 1);
        let record = store
            .update_user_config(USER, UserConfigPatch::new().rotation_id(2))
            .unwrap();
        assert_eq!(record.rotation_id, 2);
    }

    #[test]
    fn test_users_do_not_clobber_each_other() {
        let (_dir, _storage, store) = store(u64::MAX);
        store
            .update_user_config(1, UserConfigPatch::new().language("en"))
            .unwrap();
        store
            .update_user_config(2, UserConfigPatch::new().language("ja"))
            .unwrap();

        let all = store.load_all().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[&1].language, "en");
        assert_eq!(all[&2].language, "ja");
    }

    #[test]
    fn test_insufficient_space_rejects_without_mutation() {
        let (_dir, storage, store) = store(10);

        let err = store
            .update_user_config(USER, UserConfigPatch::new().version(1))
            .unwrap_err();
        assert!(matches!(
            err,
            ChatSearchError::InsufficientDiskSpace(DiskSpaceError::BelowThreshold { .. })
        ));
        assert_eq!(storage.file_count(), 0);
    }

    #[test]
    fn test_unwritable_storage_is_config_write_error() {
        let (_dir, storage, store) = store(u64::MAX);
        storage.set_read_only(true);

        let err = store
            .update_user_config(USER, UserConfigPatch::new().version(1))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigWrite);
    }

    #[test]
    fn test_malformed_document_is_config_read_error() {
        let (_dir, storage, store) = store(u64::MAX);
        write_atomic(storage.as_ref(), crate::config::USER_CONFIG_FILE, b"{not json").unwrap();

        let err = store.get_user_config(USER).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigRead);
    }

    #[test]
    fn test_remove_user() {
        let (_dir, _storage, store) = store(u64::MAX);
        store.update_user_config(USER, UserConfigPatch::new()).unwrap();

        assert!(store.remove_user(USER).unwrap());
        assert!(!store.remove_user(USER).unwrap());
        assert_eq!(store.get_user_config(USER).unwrap(), ConfigLookup::NoRecord);
    }

    #[test]
    fn test_document_uses_camel_case_keys() {
        let (_dir, storage, store) = store(u64::MAX);
        store
            .update_user_config(USER, UserConfigPatch::new().rotation_id(1))
            .unwrap();

        let bytes = crate::storage::read_file(storage.as_ref(), crate::config::USER_CONFIG_FILE).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value[USER.to_string()]["rotationId"], 1);
        assert_eq!(value[USER.to_string()]["indexVersion"], "v1");
    }
}
