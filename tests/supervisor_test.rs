//! The supervised worker over real on-disk state: crashes, restarts and
//! command ordering.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use chatsearch::config::{SearchConfig, SupervisorConfig};
use chatsearch::context::{SearchContext, UserId};
use chatsearch::core::SearchCore;
use chatsearch::disk::{DiskSpaceGuard, FixedProbe};
use chatsearch::error::{DiskSpaceError, ErrorKind, Result};
use chatsearch::index::directory::{FileIndexDirectory, IndexDirectory};
use chatsearch::index::message::Message;
use chatsearch::search::query::SearchQuery;
use chatsearch::storage::Storage;
use chatsearch::storage::file::FileStorage;
use chatsearch::supervisor::{
    Command, CommandHandler, Response, SearchClient, Supervisor, SupervisorStatus,
};
use chatsearch::user_config::{ConfigLookup, UserConfigPatch};
use tempfile::TempDir;

const USER: UserId = 1234567891011;
const POISON: UserId = 666;

/// A core that dies on any health check for [`POISON`].
struct Crashy {
    core: SearchCore,
}

impl CommandHandler for Crashy {
    fn handle(&mut self, command: Command) -> Result<Response> {
        if let Command::Health { user_id: POISON } = command {
            panic!("simulated worker crash");
        }
        self.core.handle(command)
    }
}

fn fast_restarts() -> SupervisorConfig {
    SupervisorConfig {
        initial_backoff_ms: 1,
        backoff_multiplier: 2.0,
        max_backoff_ms: 10,
        max_consecutive_failures: 3,
    }
}

fn spawn(dir: &TempDir, starts: Arc<AtomicU32>) -> SearchClient {
    let config = SearchConfig::builder()
        .user_data_dir(dir.path())
        .rotation_max_messages(3)
        .build()
        .unwrap();

    Supervisor::spawn(
        move || -> Result<Box<dyn CommandHandler>> {
            starts.fetch_add(1, Ordering::SeqCst);
            let guard = DiskSpaceGuard::new(Arc::new(FixedProbe::new(u64::MAX)), 0);
            let ctx = SearchContext::with_guard(config.clone(), guard)?;
            let config_storage: Arc<dyn Storage> = Arc::new(FileStorage::new(ctx.user_data_dir())?);
            let directory: Arc<dyn IndexDirectory> =
                Arc::new(FileIndexDirectory::new(ctx.index_root()));
            Ok(Box::new(Crashy {
                core: SearchCore::new(ctx, config_storage, directory),
            }))
        },
        fast_restarts(),
    )
}

fn messages(range: std::ops::RangeInclusive<u64>) -> Vec<Message> {
    range
        .map(|seq| Message::new(format!("m{seq}"), seq, format!("incident retro {seq}")))
        .collect()
}

#[tokio::test]
async fn test_end_to_end_through_worker() {
    let dir = TempDir::new().unwrap();
    let client = spawn(&dir, Arc::new(AtomicU32::new(0)));

    assert_eq!(
        client.get_user_config(USER).await.unwrap(),
        ConfigLookup::NoConfigFile
    );
    assert_eq!(
        client.get_user_config(USER).await.unwrap(),
        ConfigLookup::NoRecord
    );

    let record = client
        .update_user_config(USER, UserConfigPatch::new().rotation_id(0).version(1).language("en"))
        .await
        .unwrap();
    assert_eq!(record.index_version, "v1");

    client.index_batch(USER, messages(1..=2)).await.unwrap();
    client
        .update_user_config(USER, UserConfigPatch::new().rotation_id(1))
        .await
        .unwrap();
    client.index_batch(USER, messages(3..=4)).await.unwrap();

    let record = client.get_user_config(USER).await.unwrap().into_record().unwrap();
    assert_eq!(record.rotation_id, 1);
    assert_eq!(record.index_version, "v1");

    let hits = client.search(USER, SearchQuery::new("retro")).await.unwrap();
    assert_eq!(hits.len(), 4);
    client.shutdown().await;
}

#[tokio::test]
async fn test_crash_restarts_worker_and_keeps_index() {
    let dir = TempDir::new().unwrap();
    let starts = Arc::new(AtomicU32::new(0));
    let client = spawn(&dir, starts.clone());

    client.index_batch(USER, messages(1..=5)).await.unwrap();
    assert_eq!(starts.load(Ordering::SeqCst), 1);

    let err = client.health(POISON).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::WorkerUnavailable);

    let hits = client.search(USER, SearchQuery::new("retro")).await.unwrap();
    assert_eq!(hits.len(), 5);
    assert!(starts.load(Ordering::SeqCst) >= 3);
    assert_eq!(client.status(), SupervisorStatus::Running);

    let health = client.health(USER).await.unwrap();
    assert_eq!(health.message_count, 5);
    client.shutdown().await;
}

#[tokio::test]
async fn test_commands_complete_in_submission_order() {
    let dir = TempDir::new().unwrap();
    let client = spawn(&dir, Arc::new(AtomicU32::new(0)));

    // join! polls in order, so the index command is queued first.
    let (report, hits, health) = tokio::join!(
        client.index_batch(USER, messages(1..=6)),
        client.search(USER, SearchQuery::new("retro")),
        client.health(USER),
    );

    assert_eq!(report.unwrap().indexed, 6);
    assert_eq!(hits.unwrap().len(), 6);
    assert_eq!(health.unwrap().rotation_id, 2);
    client.shutdown().await;
}

#[tokio::test]
async fn test_errors_cross_the_boundary_with_their_kind() {
    let dir = TempDir::new().unwrap();
    let client = spawn(&dir, Arc::new(AtomicU32::new(0)));

    let err = client.health(0).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);

    client
        .update_user_config(USER, UserConfigPatch::new().version(5))
        .await
        .unwrap();
    let err = client
        .update_user_config(USER, UserConfigPatch::new().version(4))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);

    let check = client.check_free_space(None).await.unwrap();
    assert!(!check.ok);
    assert_eq!(check.error, Some(DiskSpaceError::InvalidPath));

    let mut seen = None;
    let called = client
        .check_free_space_with(
            Some(dir.path()),
            Some(|ok: bool, error: Option<DiskSpaceError>| seen = Some((ok, error))),
        )
        .await;
    assert!(called);
    assert_eq!(seen, Some((true, None)));
    client.shutdown().await;
}

#[tokio::test]
async fn test_many_clients_share_one_worker() {
    let dir = TempDir::new().unwrap();
    let starts = Arc::new(AtomicU32::new(0));
    let client = spawn(&dir, starts.clone());
    client.index_batch(USER, messages(1..=9)).await.unwrap();

    let searches = (0..16).map(|_| {
        let client = client.clone();
        async move { client.search(USER, SearchQuery::new("incident")).await }
    });
    let results = futures::future::join_all(searches).await;

    assert_eq!(results.len(), 16);
    for hits in results {
        assert_eq!(hits.unwrap().len(), 9);
    }
    assert_eq!(starts.load(Ordering::SeqCst), 1);
    client.shutdown().await;
}
