//! Text analysis for message indexing.
//!
//! The writer and the query engine share one [`analyzer::MessageAnalyzer`] so
//! that a message and a query containing the same words always produce the
//! same terms.

pub mod analyzer;
pub mod token;
pub mod tokenizer;
