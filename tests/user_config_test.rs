//! End-to-end behaviour of the user config store and the free-space check,
//! driven through a `SearchCore` over real files.

use std::sync::Arc;

use chatsearch::config::SearchConfig;
use chatsearch::context::{SearchContext, UserId};
use chatsearch::core::SearchCore;
use chatsearch::disk::{DiskSpaceGuard, FixedProbe};
use chatsearch::error::{DiskSpaceError, ErrorKind};
use chatsearch::index::directory::{FileIndexDirectory, IndexDirectory};
use chatsearch::index::message::Message;
use chatsearch::storage::Storage;
use chatsearch::storage::file::FileStorage;
use chatsearch::user_config::{ConfigLookup, UserConfigPatch};
use tempfile::TempDir;

const FIRST_USER: UserId = 1234567891011;
const SECOND_USER: UserId = 2234567891011;

fn open_core(dir: &TempDir, free_bytes: u64) -> SearchCore {
    let config = SearchConfig::builder()
        .user_data_dir(dir.path())
        .rotation_max_messages(2)
        .build()
        .unwrap();
    let guard = DiskSpaceGuard::new(Arc::new(FixedProbe::new(free_bytes)), 1_000);
    let ctx = SearchContext::with_guard(config, guard).unwrap();
    let config_storage: Arc<dyn Storage> =
        Arc::new(FileStorage::new(ctx.user_data_dir()).unwrap());
    let directory: Arc<dyn IndexDirectory> = Arc::new(FileIndexDirectory::new(ctx.index_root()));
    SearchCore::new(ctx, config_storage, directory)
}

fn config_file(dir: &TempDir) -> std::path::PathBuf {
    dir.path().join(chatsearch::config::USER_CONFIG_FILE)
}

#[test]
fn test_lookup_distinguishes_missing_file_from_missing_record() {
    let dir = TempDir::new().unwrap();
    let core = open_core(&dir, u64::MAX);
    assert!(!config_file(&dir).exists());

    assert_eq!(
        core.get_user_config(FIRST_USER).unwrap(),
        ConfigLookup::NoConfigFile
    );
    assert!(config_file(&dir).exists());
    assert_eq!(
        core.get_user_config(FIRST_USER).unwrap(),
        ConfigLookup::NoRecord
    );
}

#[test]
fn test_first_update_stamps_index_version() {
    let dir = TempDir::new().unwrap();
    let mut core = open_core(&dir, u64::MAX);

    let record = core
        .update_user_config(
            FIRST_USER,
            UserConfigPatch::new().rotation_id(0).version(1).language("en"),
        )
        .unwrap();
    assert_eq!(record.user_id, FIRST_USER);
    assert_eq!(record.rotation_id, 0);
    assert_eq!(record.version, 1);
    assert_eq!(record.language, "en");
    assert_eq!(record.index_version, "v1");

    let second = core
        .update_user_config(FIRST_USER, UserConfigPatch::new().rotation_id(1))
        .unwrap();
    assert_eq!(second.rotation_id, 1);
    assert_eq!(second.version, 1);
    assert_eq!(second.index_version, "v1");

    assert_eq!(
        core.get_user_config(FIRST_USER).unwrap(),
        ConfigLookup::Found(second)
    );
}

#[test]
fn test_users_are_independent() {
    let dir = TempDir::new().unwrap();
    let mut core = open_core(&dir, u64::MAX);

    core.update_user_config(FIRST_USER, UserConfigPatch::new().language("en"))
        .unwrap();
    core.update_user_config(SECOND_USER, UserConfigPatch::new().language("de"))
        .unwrap();

    let first = core.get_user_config(FIRST_USER).unwrap().into_record().unwrap();
    let second = core.get_user_config(SECOND_USER).unwrap().into_record().unwrap();
    assert_eq!(first.language, "en");
    assert_eq!(second.language, "de");

    let raw: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(config_file(&dir)).unwrap()).unwrap();
    assert_eq!(raw["1234567891011"]["indexVersion"], "v1");
    assert_eq!(raw["2234567891011"]["language"], "de");
}

#[test]
fn test_deleted_config_file_is_recreated_on_update() {
    let dir = TempDir::new().unwrap();
    let mut core = open_core(&dir, u64::MAX);

    let batch = |range: std::ops::RangeInclusive<u64>| -> Vec<Message> {
        range
            .map(|seq| Message::new(format!("m{seq}"), seq, format!("weekly sync {seq}")))
            .collect()
    };

    core.update_user_config(FIRST_USER, UserConfigPatch::new().rotation_id(0))
        .unwrap();
    core.index_batch(FIRST_USER, batch(1..=2)).unwrap();
    core.update_user_config(FIRST_USER, UserConfigPatch::new().rotation_id(1))
        .unwrap();
    core.index_batch(FIRST_USER, batch(3..=4)).unwrap();

    let record = core.get_user_config(FIRST_USER).unwrap().into_record().unwrap();
    assert!(record.rotation_id >= 1);

    std::fs::remove_file(config_file(&dir)).unwrap();
    let recreated = core
        .update_user_config(FIRST_USER, UserConfigPatch::new().rotation_id(1))
        .unwrap();
    assert_eq!(recreated.rotation_id, 1);
    assert!(config_file(&dir).exists());
}

#[test]
fn test_decreasing_version_is_rejected() {
    let dir = TempDir::new().unwrap();
    let mut core = open_core(&dir, u64::MAX);

    core.update_user_config(FIRST_USER, UserConfigPatch::new().version(3))
        .unwrap();
    let err = core
        .update_user_config(FIRST_USER, UserConfigPatch::new().version(2))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
}

#[test]
fn test_low_disk_blocks_config_writes() {
    let dir = TempDir::new().unwrap();
    let mut core = open_core(&dir, 10);

    let err = core
        .update_user_config(FIRST_USER, UserConfigPatch::new().version(1))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InsufficientDiskSpace);
    assert_eq!(
        core.get_user_config(FIRST_USER).unwrap(),
        ConfigLookup::NoConfigFile
    );
}

#[test]
fn test_free_space_check_without_path_or_callback() {
    let dir = TempDir::new().unwrap();
    let core = open_core(&dir, u64::MAX);
    let guard = core.context().guard();

    let called = guard.check_free_space_with(
        Some(dir.path()),
        None::<fn(bool, Option<DiskSpaceError>)>,
    );
    assert!(!called);

    let check = core.check_free_space(None);
    assert!(!check.ok);
    assert_eq!(check.error, Some(DiskSpaceError::InvalidPath));

    let mut seen = None;
    assert!(guard.check_free_space_with(
        Some(dir.path()),
        Some(|ok: bool, error: Option<DiskSpaceError>| seen = Some((ok, error)))
    ));
    assert_eq!(seen, Some((true, None)));
}

#[cfg(unix)]
#[test]
fn test_unreachable_path_reports_error() {
    use chatsearch::disk::StatvfsProbe;
    use std::path::Path;

    let guard = DiskSpaceGuard::new(Arc::new(StatvfsProbe), 0);
    let check = guard.check_free_space(Some(Path::new("/no/such/directory/anywhere")));
    assert!(!check.ok);
    assert!(check.error.is_some());
}
