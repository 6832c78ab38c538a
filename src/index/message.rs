//! Chat messages as handed over for indexing.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{ChatSearchError, Result};

/// A chat message to be indexed.
///
/// `seq` is the caller's monotonically increasing ingestion sequence; it is
/// what segment ranges and duplicate detection are based on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub seq: u64,
    #[serde(default)]
    pub conversation_id: String,
    #[serde(default)]
    pub sender: String,
    #[serde(default)]
    pub text: String,
    /// Milliseconds since the Unix epoch.
    #[serde(default)]
    pub timestamp: i64,
}

impl Message {
    pub fn new<I: Into<String>, T: Into<String>>(id: I, seq: u64, text: T) -> Self {
        Message {
            id: id.into(),
            seq,
            conversation_id: String::new(),
            sender: String::new(),
            text: text.into(),
            timestamp: 0,
        }
    }

    pub fn with_sender<S: Into<String>>(mut self, sender: S) -> Self {
        self.sender = sender.into();
        self
    }

    pub fn with_conversation<S: Into<String>>(mut self, conversation_id: S) -> Self {
        self.conversation_id = conversation_id.into();
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(ChatSearchError::invalid_input(format!(
                "message with seq {} has an empty id",
                self.seq
            )));
        }
        Ok(())
    }
}

/// Sort a batch by `seq` and drop repeated sequence numbers and message ids.
///
/// Returns the surviving messages and how many duplicates were dropped. After
/// sorting, the first occurrence of a `seq` or an `id` wins.
pub fn prepare_batch(mut messages: Vec<Message>) -> (Vec<Message>, usize) {
    let before = messages.len();
    messages.sort_by_key(|m| m.seq);
    messages.dedup_by_key(|m| m.seq);

    let mut seen = HashSet::with_capacity(messages.len());
    messages.retain(|m| seen.insert(m.id.clone()));

    let dropped = before - messages.len();
    (messages, dropped)
}
