//! Messages exchanged between the host and the search worker.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::context::UserId;
use crate::disk::DiskCheck;
use crate::error::RemoteError;
use crate::index::message::Message;
use crate::index::version::IndexHealth;
use crate::index::writer::IndexReport;
use crate::search::query::{SearchQuery, SearchResult};
use crate::user_config::{ConfigLookup, UserConfigPatch, UserConfigRecord};

/// Correlates a reply with the command that caused it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self {
        RequestId(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A request executed by the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    IndexBatch {
        user_id: UserId,
        messages: Vec<Message>,
    },
    Search {
        user_id: UserId,
        query: SearchQuery,
    },
    GetUserConfig {
        user_id: UserId,
    },
    UpdateUserConfig {
        user_id: UserId,
        patch: UserConfigPatch,
    },
    CheckFreeSpace {
        path: Option<PathBuf>,
    },
    Rebuild {
        user_id: UserId,
        backfill: Vec<Message>,
    },
    WipeUser {
        user_id: UserId,
    },
    Health {
        user_id: UserId,
    },
}

impl Command {
    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Command::IndexBatch { .. } => "index_batch",
            Command::Search { .. } => "search",
            Command::GetUserConfig { .. } => "get_user_config",
            Command::UpdateUserConfig { .. } => "update_user_config",
            Command::CheckFreeSpace { .. } => "check_free_space",
            Command::Rebuild { .. } => "rebuild",
            Command::WipeUser { .. } => "wipe_user",
            Command::Health { .. } => "health",
        }
    }

    /// The user the command targets, if any.
    pub fn user_id(&self) -> Option<UserId> {
        match self {
            Command::IndexBatch { user_id, .. }
            | Command::Search { user_id, .. }
            | Command::GetUserConfig { user_id }
            | Command::UpdateUserConfig { user_id, .. }
            | Command::Rebuild { user_id, .. }
            | Command::WipeUser { user_id }
            | Command::Health { user_id } => Some(*user_id),
            Command::CheckFreeSpace { .. } => None,
        }
    }
}

/// A successful command result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Indexed(IndexReport),
    Results(Vec<SearchResult>),
    UserConfig(ConfigLookup),
    UserConfigUpdated(UserConfigRecord),
    FreeSpace(DiskCheck),
    Rebuilt(IndexReport),
    Wiped,
    Health(IndexHealth),
}

/// What the worker sends back for one command.
pub type Reply = std::result::Result<Response, RemoteError>;

/// A command tagged with its request id.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub id: RequestId,
    pub command: Command,
}

/// Lifecycle notifications from a worker thread.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// The worker built its handler and accepts commands.
    Ready { generation: u64 },
    /// A command finished.
    Completed {
        generation: u64,
        id: RequestId,
        reply: Reply,
    },
    /// The worker thread is about to end.
    Exited {
        generation: u64,
        crashed: bool,
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_ids_are_unique() {
        assert_ne!(RequestId::new(), RequestId::new());
    }

    #[test]
    fn test_command_user_id() {
        assert_eq!(Command::Health { user_id: 5 }.user_id(), Some(5));
        assert_eq!(Command::CheckFreeSpace { path: None }.user_id(), None);
        assert_eq!(Command::WipeUser { user_id: 5 }.name(), "wipe_user");
    }
}
