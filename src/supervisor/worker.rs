//! The isolated worker thread.
//!
//! A worker owns exactly one [`CommandHandler`], built on the worker thread by
//! a [`WorkerFactory`]. It pulls [`Envelope`]s from a crossbeam channel,
//! executes them one at a time and reports every outcome as a
//! [`WorkerEvent`]. Panics are caught at the thread boundary and reported as
//! a crashed exit; they never reach the host.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, unbounded};
use log::{debug, error};
use tokio::sync::mpsc::UnboundedSender;

use crate::error::{ChatSearchError, Result};
use crate::supervisor::protocol::{Command, Envelope, Response, WorkerEvent};

/// Executes commands inside the worker.
pub trait CommandHandler: Send {
    fn handle(&mut self, command: Command) -> Result<Response>;
}

/// Builds a fresh handler each time a worker starts.
pub trait WorkerFactory: Send + Sync + 'static {
    fn create(&self) -> Result<Box<dyn CommandHandler>>;
}

impl<F> WorkerFactory for F
where
    F: Fn() -> Result<Box<dyn CommandHandler>> + Send + Sync + 'static,
{
    fn create(&self) -> Result<Box<dyn CommandHandler>> {
        self()
    }
}

/// Host-side handle of a running worker thread.
#[derive(Debug)]
pub(crate) struct WorkerHandle {
    generation: u64,
    commands: Sender<Envelope>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    /// Queue `envelope` on the worker. Fails if the worker is gone.
    pub(crate) fn send(&self, envelope: Envelope) -> Result<()> {
        self.commands
            .send(envelope)
            .map_err(|_| ChatSearchError::worker_unavailable("worker channel closed"))
    }

    /// Close the command channel and hand back the thread for joining.
    pub(crate) fn close(mut self) -> Option<JoinHandle<()>> {
        self.thread.take()
    }
}

/// Start worker `generation` on a new thread.
pub(crate) fn spawn_worker(
    generation: u64,
    factory: Arc<dyn WorkerFactory>,
    events: UnboundedSender<WorkerEvent>,
) -> Result<WorkerHandle> {
    let (commands, receiver) = unbounded();

    let thread = thread::Builder::new()
        .name(format!("chatsearch-worker-{generation}"))
        .spawn(move || run_worker(generation, factory, receiver, events))
        .map_err(|e| ChatSearchError::worker_unavailable(format!("cannot spawn worker: {e}")))?;

    Ok(WorkerHandle {
        generation,
        commands,
        thread: Some(thread),
    })
}

fn run_worker(
    generation: u64,
    factory: Arc<dyn WorkerFactory>,
    receiver: Receiver<Envelope>,
    events: UnboundedSender<WorkerEvent>,
) {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| -> std::result::Result<(), String> {
        let mut handler = factory
            .create()
            .map_err(|e| format!("worker startup failed: {e}"))?;
        debug!("Worker {generation} ready");
        let _ = events.send(WorkerEvent::Ready { generation });

        for Envelope { id, command } in receiver.iter() {
            let name = command.name();
            let reply = handler.handle(command).map_err(|e| {
                debug!("Worker {generation}: {name} {id} failed: {e}");
                e.to_remote()
            });
            if events.send(WorkerEvent::Completed { generation, id, reply }).is_err() {
                break;
            }
        }
        Ok(())
    }));

    let (crashed, reason) = match outcome {
        Ok(Ok(())) => (false, "stopped".to_string()),
        Ok(Err(reason)) => (true, reason),
        Err(payload) => (true, format!("worker panicked: {}", panic_message(payload.as_ref()))),
    };
    if crashed {
        error!("Worker {generation} exited: {reason}");
    }
    let _ = events.send(WorkerEvent::Exited {
        generation,
        crashed,
        reason,
    });
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        *message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::protocol::RequestId;
    use tokio::sync::mpsc::unbounded_channel;

    struct Echo;

    impl CommandHandler for Echo {
        fn handle(&mut self, command: Command) -> Result<Response> {
            match command {
                Command::WipeUser { .. } => Ok(Response::Wiped),
                Command::Health { .. } => panic!("boom"),
                _ => Err(ChatSearchError::invalid_input("unsupported")),
            }
        }
    }

    fn echo_factory() -> Arc<dyn WorkerFactory> {
        Arc::new(|| -> Result<Box<dyn CommandHandler>> { Ok(Box::new(Echo)) })
    }

    #[test]
    fn test_worker_replies_and_stops_cleanly() {
        let (events_tx, mut events) = unbounded_channel();
        let worker = spawn_worker(1, echo_factory(), events_tx).unwrap();

        let id = RequestId::new();
        worker
            .send(Envelope {
                id,
                command: Command::WipeUser { user_id: 1 },
            })
            .unwrap();
        let thread = worker.close().unwrap();
        thread.join().unwrap();

        assert!(matches!(events.blocking_recv(), Some(WorkerEvent::Ready { generation: 1 })));
        match events.blocking_recv() {
            Some(WorkerEvent::Completed { id: got, reply, .. }) => {
                assert_eq!(got, id);
                assert_eq!(reply.unwrap(), Response::Wiped);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(matches!(
            events.blocking_recv(),
            Some(WorkerEvent::Exited { crashed: false, .. })
        ));
    }

    #[test]
    fn test_panic_is_reported_as_crash() {
        let (events_tx, mut events) = unbounded_channel();
        let worker = spawn_worker(3, echo_factory(), events_tx).unwrap();
        worker
            .send(Envelope {
                id: RequestId::new(),
                command: Command::Health { user_id: 1 },
            })
            .unwrap();

        assert!(matches!(events.blocking_recv(), Some(WorkerEvent::Ready { .. })));
        match events.blocking_recv() {
            Some(WorkerEvent::Exited {
                generation,
                crashed,
                reason,
            }) => {
                assert_eq!(generation, 3);
                assert!(crashed);
                assert!(reason.contains("boom"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        worker.close().unwrap().join().unwrap();
    }

    #[test]
    fn test_factory_failure_is_reported_as_crash() {
        let (events_tx, mut events) = unbounded_channel();
        let factory: Arc<dyn WorkerFactory> = Arc::new(|| -> Result<Box<dyn CommandHandler>> {
            Err(ChatSearchError::config_read("corrupt"))
        });
        let worker = spawn_worker(1, factory, events_tx).unwrap();

        match events.blocking_recv() {
            Some(WorkerEvent::Exited { crashed, reason, .. }) => {
                assert!(crashed);
                assert!(reason.contains("startup failed"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        worker.close().unwrap().join().unwrap();
    }
}
