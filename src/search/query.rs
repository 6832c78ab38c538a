//! Query and result types.

use serde::{Deserialize, Serialize};

use crate::index::segment::StoredMessage;

/// Optional restrictions applied before scoring.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchFilters {
    /// Earliest timestamp (ms, inclusive).
    pub from: Option<i64>,
    /// Latest timestamp (ms, inclusive).
    pub to: Option<i64>,
    /// Exact sender match.
    pub sender: Option<String>,
}

impl SearchFilters {
    pub fn is_empty(&self) -> bool {
        self.from.is_none() && self.to.is_none() && self.sender.is_none()
    }

    /// Whether `message` passes every filter.
    pub fn matches(&self, message: &StoredMessage) -> bool {
        if self.from.is_some_and(|from| message.timestamp < from) {
            return false;
        }
        if self.to.is_some_and(|to| message.timestamp > to) {
            return false;
        }
        match &self.sender {
            Some(sender) => &message.sender == sender,
            None => true,
        }
    }
}

/// A free-text query with optional filters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchQuery {
    pub text: String,
    #[serde(default)]
    pub filters: SearchFilters,
    /// Requested result count; capped by the configured maximum.
    #[serde(default)]
    pub limit: Option<usize>,
}

impl SearchQuery {
    pub fn new<S: Into<String>>(text: S) -> Self {
        SearchQuery {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_sender<S: Into<String>>(mut self, sender: S) -> Self {
        self.filters.sender = Some(sender.into());
        self
    }

    pub fn with_range(mut self, from: Option<i64>, to: Option<i64>) -> Self {
        self.filters.from = from;
        self.filters.to = to;
        self
    }
}

/// One ranked hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub message_id: String,
    pub seq: u64,
    pub segment_id: u64,
    pub score: f32,
}
