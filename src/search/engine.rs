//! Query execution.
//!
//! The engine is stateless: it scores one [`IndexSnapshot`] at a time, so a
//! query always sees a manifest that was durable when the snapshot was taken.

use std::collections::HashMap;

use log::debug;

use crate::analysis::analyzer::MessageAnalyzer;
use crate::config::QueryConfig;
use crate::context::SearchContext;
use crate::error::{ChatSearchError, Result};
use crate::index::segment::DocId;
use crate::index::writer::IndexSnapshot;
use crate::search::query::{SearchQuery, SearchResult};
use crate::search::scoring::{idf, recency_weight, tf_weight};

/// Executes [`SearchQuery`]s against index snapshots.
#[derive(Debug, Clone)]
pub struct QueryEngine {
    schema_version: String,
    config: QueryConfig,
}

impl QueryEngine {
    pub fn new(ctx: &SearchContext) -> Self {
        Self::with_config(ctx.schema_version(), ctx.config().search.clone())
    }

    pub fn with_config<S: Into<String>>(schema_version: S, config: QueryConfig) -> Self {
        QueryEngine {
            schema_version: schema_version.into(),
            config,
        }
    }

    pub fn schema_version(&self) -> &str {
        &self.schema_version
    }

    /// Effective result cap for `query`.
    pub fn result_limit(&self, query: &SearchQuery) -> usize {
        query
            .limit
            .unwrap_or(self.config.max_results)
            .min(self.config.max_results)
    }

    /// Run `query` over `snapshot`.
    ///
    /// `analyzer` must be the one the snapshot was indexed with, so that query
    /// terms and indexed terms agree.
    pub fn search(
        &self,
        snapshot: &IndexSnapshot,
        analyzer: &MessageAnalyzer,
        query: &SearchQuery,
    ) -> Result<Vec<SearchResult>> {
        if query.text.trim().is_empty() {
            return Ok(Vec::new());
        }

        let index_version = &snapshot.manifest().index_version;
        if *index_version != self.schema_version {
            return Err(ChatSearchError::version_mismatch(
                index_version.clone(),
                self.schema_version.clone(),
            ));
        }

        let limit = self.result_limit(query);
        let mut terms = analyzer.analyze(&query.text)?;
        terms.sort();
        terms.dedup();
        if terms.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let total_docs = snapshot.message_count();
        let weighted_terms: Vec<(&str, f32)> = terms
            .iter()
            .filter_map(|term| {
                let doc_freq = snapshot.doc_freq(term);
                (doc_freq > 0).then(|| (term.as_str(), idf(doc_freq, total_docs)))
            })
            .collect();
        if weighted_terms.is_empty() {
            return Ok(Vec::new());
        }

        let newest = snapshot.newest_timestamp().unwrap_or(0);
        let mut results = Vec::new();

        for (meta, segment) in snapshot.segments() {
            let mut scores: HashMap<DocId, f32> = HashMap::new();
            for &(term, term_idf) in &weighted_terms {
                for posting in segment.postings(term) {
                    *scores.entry(posting.doc).or_insert(0.0) += tf_weight(posting.tf) * term_idf;
                }
            }

            for (doc, score) in scores {
                let Some(message) = segment.message(doc) else {
                    continue;
                };
                if !query.filters.matches(message) {
                    continue;
                }

                let recency = recency_weight(
                    newest.saturating_sub(message.timestamp),
                    self.config.recency_half_life_days,
                    self.config.recency_floor,
                );
                results.push(SearchResult {
                    message_id: message.id.clone(),
                    seq: message.seq,
                    segment_id: meta.segment_id,
                    score: score * recency,
                });
            }
        }

        results.sort_by(|a, b| b.score.total_cmp(&a.score).then(b.seq.cmp(&a.seq)));
        results.truncate(limit);

        debug!(
            "Query {:?} matched {} messages (limit {limit})",
            query.text,
            results.len()
        );
        Ok(results)
    }
}
