//! Supervision of the search worker.
//!
//! [`Supervisor::spawn`] starts a tokio task that owns the worker thread and
//! returns a cloneable [`SearchClient`]. The supervisor:
//!
//! - starts the worker lazily, on the first command,
//! - dispatches queued commands one at a time, in submission order,
//! - restarts a crashed worker after an exponential backoff,
//! - re-dispatches a command that was in flight during a crash once, and
//! - gives up after `max_consecutive_failures` crashes in a row, failing all
//!   pending and future commands with `WorkerUnavailable`.
//!
//! A caller that stops waiting for a reply does not cancel the command.

pub mod protocol;
pub mod worker;

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

use crate::config::SupervisorConfig;
use crate::context::UserId;
use crate::disk::DiskCheck;
use crate::error::{ChatSearchError, DiskSpaceError, Result};
use crate::index::message::Message;
use crate::index::version::IndexHealth;
use crate::index::writer::IndexReport;
use crate::search::query::{SearchQuery, SearchResult};
use crate::user_config::{ConfigLookup, UserConfigPatch, UserConfigRecord};

pub use protocol::{Command, Envelope, Reply, RequestId, Response, WorkerEvent};
pub use worker::{CommandHandler, WorkerFactory};

use worker::{WorkerHandle, spawn_worker};

/// Externally visible supervisor state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SupervisorStatus {
    /// No worker is running.
    Idle,
    /// A worker is up.
    Running,
    /// Waiting out the backoff before the next start.
    Restarting,
    /// Restart attempts are exhausted.
    Unavailable,
}

enum ClientMessage {
    Submit {
        command: Command,
        reply: oneshot::Sender<Result<Response>>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

struct Pending {
    id: RequestId,
    command: Command,
    reply: oneshot::Sender<Result<Response>>,
    // Number of worker crashes this command was in flight for.
    crashes: u32,
}

impl Pending {
    fn fail(self, error: ChatSearchError) {
        let _ = self.reply.send(Err(error));
    }
}

/// Owns the worker and its restart policy.
pub struct Supervisor {
    factory: Arc<dyn WorkerFactory>,
    config: SupervisorConfig,
    requests: mpsc::UnboundedReceiver<ClientMessage>,
    events_tx: mpsc::UnboundedSender<WorkerEvent>,
    events: mpsc::UnboundedReceiver<WorkerEvent>,
    status: watch::Sender<SupervisorStatus>,
    queue: VecDeque<Pending>,
    in_flight: Option<Pending>,
    worker: Option<WorkerHandle>,
    ready: bool,
    generation: u64,
    consecutive_failures: u32,
    restart_at: Option<Instant>,
    terminal: bool,
    shutdown: Option<oneshot::Sender<()>>,
}

impl Supervisor {
    /// Start supervising workers built by `factory`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<F: WorkerFactory>(factory: F, config: SupervisorConfig) -> SearchClient {
        Self::spawn_shared(Arc::new(factory), config)
    }

    /// Like [`spawn`](Self::spawn), for an already shared factory.
    pub fn spawn_shared(factory: Arc<dyn WorkerFactory>, config: SupervisorConfig) -> SearchClient {
        let (requests_tx, requests) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        let (status, status_rx) = watch::channel(SupervisorStatus::Idle);

        let supervisor = Supervisor {
            factory,
            config,
            requests,
            events_tx,
            events,
            status,
            queue: VecDeque::new(),
            in_flight: None,
            worker: None,
            ready: false,
            generation: 0,
            consecutive_failures: 0,
            restart_at: None,
            terminal: false,
            shutdown: None,
        };
        tokio::spawn(supervisor.run());

        SearchClient {
            requests: requests_tx,
            status: status_rx,
        }
    }

    async fn run(mut self) {
        let mut accepting = true;
        loop {
            self.pump();

            if !accepting && self.queue.is_empty() && self.in_flight.is_none() {
                break;
            }

            let restart_at = self.restart_at;
            tokio::select! {
                message = self.requests.recv(), if accepting => match message {
                    Some(ClientMessage::Submit { command, reply }) => {
                        self.submit(command, reply);
                    }
                    Some(ClientMessage::Shutdown { done }) => {
                        info!("Search supervisor shutting down");
                        self.shutdown = Some(done);
                        accepting = false;
                    }
                    None => {
                        debug!("All search clients dropped");
                        accepting = false;
                    }
                },
                Some(event) = self.events.recv() => self.on_event(event),
                _ = sleep_until(restart_at), if restart_at.is_some() => {
                    self.restart_at = None;
                }
            }
        }

        self.stop_worker().await;
        // Anyone who submitted after shutdown began is told so.
        self.requests.close();
        while let Ok(message) = self.requests.try_recv() {
            match message {
                ClientMessage::Submit { reply, .. } => {
                    let _ = reply.send(Err(ChatSearchError::worker_unavailable(
                        "search supervisor has shut down",
                    )));
                }
                ClientMessage::Shutdown { done } => {
                    let _ = done.send(());
                }
            }
        }
        self.set_status(SupervisorStatus::Idle);
        if let Some(done) = self.shutdown.take() {
            let _ = done.send(());
        }
    }

    fn submit(&mut self, command: Command, reply: oneshot::Sender<Result<Response>>) {
        let pending = Pending {
            id: RequestId::new(),
            command,
            reply,
            crashes: 0,
        };
        if self.terminal {
            pending.fail(self.unavailable());
            return;
        }
        debug!("Queued {} {}", pending.command.name(), pending.id);
        self.queue.push_back(pending);
    }

    /// Start a worker or dispatch the next command when possible.
    fn pump(&mut self) {
        if self.terminal {
            while let Some(pending) = self.queue.pop_front() {
                pending.fail(self.unavailable());
            }
            return;
        }

        let has_work = !self.queue.is_empty() || self.in_flight.is_some();
        if self.worker.is_none() && self.restart_at.is_none() && has_work {
            self.start_worker();
        }

        if self.ready && self.in_flight.is_none() {
            if let Some(pending) = self.queue.pop_front() {
                self.dispatch(pending);
            }
        }
    }

    fn start_worker(&mut self) {
        self.generation += 1;
        self.ready = false;
        match spawn_worker(self.generation, self.factory.clone(), self.events_tx.clone()) {
            Ok(handle) => {
                debug!("Started search worker generation {}", self.generation);
                self.worker = Some(handle);
            }
            Err(e) => {
                error!("Could not start search worker: {e}");
                self.on_crash(e.to_string());
            }
        }
    }

    fn dispatch(&mut self, pending: Pending) {
        let Some(worker) = &self.worker else {
            self.queue.push_front(pending);
            return;
        };

        let envelope = Envelope {
            id: pending.id,
            command: pending.command.clone(),
        };
        match worker.send(envelope) {
            Ok(()) => self.in_flight = Some(pending),
            // The worker is exiting; its Exited event will requeue.
            Err(_) => self.queue.push_front(pending),
        }
    }

    fn on_event(&mut self, event: WorkerEvent) {
        let current = self.worker.as_ref().map(|w| w.generation());
        match event {
            WorkerEvent::Ready { generation } if Some(generation) == current => {
                self.ready = true;
                self.set_status(SupervisorStatus::Running);
            }
            WorkerEvent::Completed { generation, id, reply } if Some(generation) == current => {
                match self.in_flight.take() {
                    Some(pending) if pending.id == id => {
                        self.consecutive_failures = 0;
                        let _ = pending.reply.send(reply.map_err(ChatSearchError::from));
                    }
                    other => {
                        warn!("Dropping reply {id} that matches no in-flight command");
                        self.in_flight = other;
                    }
                }
            }
            WorkerEvent::Exited {
                generation,
                crashed,
                reason,
            } if Some(generation) == current => {
                if let Some(handle) = self.worker.take() {
                    // The thread has finished its work; let it wind down on its own.
                    drop(handle.close());
                }
                self.ready = false;
                if crashed || self.shutdown.is_none() {
                    self.on_crash(reason);
                } else {
                    self.set_status(SupervisorStatus::Idle);
                }
            }
            other => debug!("Ignoring event from a previous worker: {other:?}"),
        }
    }

    fn on_crash(&mut self, reason: String) {
        if let Some(mut pending) = self.in_flight.take() {
            pending.crashes += 1;
            if pending.crashes > 1 {
                warn!(
                    "{} {} crashed the worker twice, giving up on it",
                    pending.command.name(),
                    pending.id
                );
                pending.fail(ChatSearchError::worker_unavailable(format!(
                    "command crashed the search worker twice: {reason}"
                )));
            } else {
                self.queue.push_front(pending);
            }
        }

        self.consecutive_failures += 1;
        if self.consecutive_failures >= self.config.max_consecutive_failures {
            error!(
                "Search worker failed {} times in a row, giving up: {reason}",
                self.consecutive_failures
            );
            self.terminal = true;
            self.restart_at = None;
            self.set_status(SupervisorStatus::Unavailable);
            return;
        }

        let delay = restart_delay(&self.config, self.consecutive_failures);
        warn!(
            "Search worker failed ({reason}), restart {} in {:?}",
            self.consecutive_failures, delay
        );
        self.restart_at = Some(Instant::now() + delay);
        self.set_status(SupervisorStatus::Restarting);
    }

    async fn stop_worker(&mut self) {
        let Some(handle) = self.worker.take() else {
            return;
        };
        if let Some(thread) = handle.close() {
            match tokio::task::spawn_blocking(move || thread.join()).await {
                Ok(Ok(())) => debug!("Search worker stopped"),
                Ok(Err(_)) => warn!("Search worker panicked while stopping"),
                Err(e) => warn!("Could not join search worker: {e}"),
            }
        }
    }

    fn unavailable(&self) -> ChatSearchError {
        ChatSearchError::worker_unavailable(format!(
            "search worker failed {} times in a row",
            self.consecutive_failures
        ))
    }

    fn set_status(&self, status: SupervisorStatus) {
        self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }
}

/// Backoff before restart number `failures` (1-based), plus up to 10% jitter.
fn restart_delay(config: &SupervisorConfig, failures: u32) -> Duration {
    let base = config.backoff(failures);
    let jitter_ms = (base.as_millis() / 10) as u64;
    if jitter_ms == 0 {
        return base;
    }
    base + Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Async handle for submitting commands to the supervised worker.
#[derive(Clone)]
pub struct SearchClient {
    requests: mpsc::UnboundedSender<ClientMessage>,
    status: watch::Receiver<SupervisorStatus>,
}

impl std::fmt::Debug for SearchClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchClient")
            .field("status", &*self.status.borrow())
            .finish()
    }
}

impl SearchClient {
    /// Submit `command` and wait for its reply.
    pub async fn execute(&self, command: Command) -> Result<Response> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(ClientMessage::Submit { command, reply })
            .map_err(|_| ChatSearchError::worker_unavailable("search supervisor has shut down"))?;
        response
            .await
            .map_err(|_| ChatSearchError::worker_unavailable("search supervisor dropped the request"))?
    }

    pub async fn index_batch(&self, user_id: UserId, messages: Vec<Message>) -> Result<IndexReport> {
        match self.execute(Command::IndexBatch { user_id, messages }).await? {
            Response::Indexed(report) => Ok(report),
            other => Err(unexpected(other)),
        }
    }

    pub async fn search(&self, user_id: UserId, query: SearchQuery) -> Result<Vec<SearchResult>> {
        match self.execute(Command::Search { user_id, query }).await? {
            Response::Results(results) => Ok(results),
            other => Err(unexpected(other)),
        }
    }

    pub async fn get_user_config(&self, user_id: UserId) -> Result<ConfigLookup> {
        match self.execute(Command::GetUserConfig { user_id }).await? {
            Response::UserConfig(lookup) => Ok(lookup),
            other => Err(unexpected(other)),
        }
    }

    pub async fn update_user_config(
        &self,
        user_id: UserId,
        patch: UserConfigPatch,
    ) -> Result<UserConfigRecord> {
        match self.execute(Command::UpdateUserConfig { user_id, patch }).await? {
            Response::UserConfigUpdated(record) => Ok(record),
            other => Err(unexpected(other)),
        }
    }

    /// Free-space check on `path`. A missing path is reported as `InvalidPath`.
    pub async fn check_free_space(&self, path: Option<PathBuf>) -> Result<DiskCheck> {
        match self.execute(Command::CheckFreeSpace { path }).await? {
            Response::FreeSpace(check) => Ok(check),
            other => Err(unexpected(other)),
        }
    }

    /// Callback form of [`check_free_space`](Self::check_free_space).
    ///
    /// Returns `false` straight away when there is no callback. Otherwise the
    /// callback receives `(ok, diagnostic)` and `true` is returned.
    pub async fn check_free_space_with<F>(&self, path: Option<&Path>, callback: Option<F>) -> bool
    where
        F: FnOnce(bool, Option<DiskSpaceError>),
    {
        let Some(callback) = callback else {
            return false;
        };
        match self.check_free_space(path.map(Path::to_path_buf)).await {
            Ok(check) => callback(check.ok, check.error),
            Err(e) => callback(false, Some(DiskSpaceError::QueryFailed(e.to_string()))),
        }
        true
    }

    pub async fn rebuild(&self, user_id: UserId, backfill: Vec<Message>) -> Result<IndexReport> {
        match self.execute(Command::Rebuild { user_id, backfill }).await? {
            Response::Rebuilt(report) => Ok(report),
            other => Err(unexpected(other)),
        }
    }

    pub async fn wipe_user(&self, user_id: UserId) -> Result<()> {
        match self.execute(Command::WipeUser { user_id }).await? {
            Response::Wiped => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn health(&self, user_id: UserId) -> Result<IndexHealth> {
        match self.execute(Command::Health { user_id }).await? {
            Response::Health(health) => Ok(health),
            other => Err(unexpected(other)),
        }
    }

    /// Current supervisor state.
    pub fn status(&self) -> SupervisorStatus {
        *self.status.borrow()
    }

    /// Receiver that observes every status change.
    pub fn watch_status(&self) -> watch::Receiver<SupervisorStatus> {
        self.status.clone()
    }

    /// Finish queued commands, stop the worker and end supervision.
    pub async fn shutdown(&self) {
        let (done, finished) = oneshot::channel();
        if self.requests.send(ClientMessage::Shutdown { done }).is_ok() {
            let _ = finished.await;
        }
    }
}

fn unexpected(response: Response) -> ChatSearchError {
    ChatSearchError::other(format!("unexpected worker response: {response:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Scripted {
        handled: Arc<AtomicU32>,
    }

    impl CommandHandler for Scripted {
        fn handle(&mut self, command: Command) -> Result<Response> {
            self.handled.fetch_add(1, Ordering::SeqCst);
            match command {
                Command::WipeUser { .. } => Ok(Response::Wiped),
                Command::Health { user_id: 13 } => panic!("poisoned"),
                _ => Err(ChatSearchError::invalid_input("unsupported")),
            }
        }
    }

    fn fast_config(max_failures: u32) -> SupervisorConfig {
        SupervisorConfig {
            initial_backoff_ms: 1,
            backoff_multiplier: 1.0,
            max_backoff_ms: 5,
            max_consecutive_failures: max_failures,
        }
    }

    fn scripted(handled: Arc<AtomicU32>) -> impl WorkerFactory {
        move || -> Result<Box<dyn CommandHandler>> {
            Ok(Box::new(Scripted {
                handled: handled.clone(),
            }))
        }
    }

    #[test]
    fn test_restart_delay_grows_with_every_failure() {
        let config = SupervisorConfig {
            initial_backoff_ms: 100,
            backoff_multiplier: 2.0,
            max_backoff_ms: 10_000,
            max_consecutive_failures: 10,
        };

        let delays: Vec<_> = (1..=4).map(|n| restart_delay(&config, n)).collect();
        assert!(delays[0] >= Duration::from_millis(100));
        assert!(delays[0] <= Duration::from_millis(110));
        for pair in delays.windows(2) {
            assert!(pair[1] > pair[0], "{delays:?}");
        }
        assert!(delays[3] >= Duration::from_millis(800));
        assert!(restart_delay(&config, 20) <= Duration::from_millis(11_000));
    }

    #[tokio::test]
    async fn test_lazy_start_and_reply() {
        let handled = Arc::new(AtomicU32::new(0));
        let client = Supervisor::spawn(scripted(handled.clone()), fast_config(3));
        assert_eq!(client.status(), SupervisorStatus::Idle);

        client.wipe_user(1).await.unwrap();
        assert_eq!(handled.load(Ordering::SeqCst), 1);
        assert_eq!(client.status(), SupervisorStatus::Running);

        let err = client.get_user_config(1).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidInput);
        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_poison_command_fails_after_one_retry() {
        let handled = Arc::new(AtomicU32::new(0));
        let client = Supervisor::spawn(scripted(handled.clone()), fast_config(5));

        let err = client.health(13).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::WorkerUnavailable);
        assert_eq!(handled.load(Ordering::SeqCst), 2);

        client.wipe_user(1).await.unwrap();
        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_startup_failures_become_terminal() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let client = Supervisor::spawn(
            move || -> Result<Box<dyn CommandHandler>> {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(ChatSearchError::config_read("broken"))
            },
            fast_config(3),
        );

        let err = client.wipe_user(1).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::WorkerUnavailable);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(client.status(), SupervisorStatus::Unavailable);

        let err = client.wipe_user(1).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::WorkerUnavailable);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_later_commands() {
        let handled = Arc::new(AtomicU32::new(0));
        let client = Supervisor::spawn(scripted(handled), fast_config(3));
        client.wipe_user(1).await.unwrap();
        client.shutdown().await;

        let err = client.wipe_user(1).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::WorkerUnavailable);
    }

    #[tokio::test]
    async fn test_check_free_space_without_callback() {
        let handled = Arc::new(AtomicU32::new(0));
        let client = Supervisor::spawn(scripted(handled.clone()), fast_config(3));
        let started = client
            .check_free_space_with(Some(Path::new("/tmp")), None::<fn(bool, Option<DiskSpaceError>)>)
            .await;
        assert!(!started);
        assert_eq!(handled.load(Ordering::SeqCst), 0);
    }
}
