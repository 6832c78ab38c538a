//! The analyzer shared by indexing and querying.
//!
//! Tokenize, lowercase, drop stop words for the user's language. The output is
//! a list of terms; [`MessageAnalyzer::term_frequencies`] folds it into the
//! per-message counts stored in segment postings.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, LazyLock};

use crate::analysis::tokenizer::{RegexTokenizer, Tokenizer, UnicodeWordTokenizer};
use crate::error::Result;

const ENGLISH_STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "if", "in", "into", "is", "it",
    "no", "not", "of", "on", "or", "such", "that", "the", "their", "then", "there", "these",
    "they", "this", "to", "was", "will", "with",
];

const JAPANESE_STOP_WORDS: &[&str] = &[
    "の", "に", "は", "を", "た", "が", "で", "て", "と", "し", "れ", "さ", "ある", "いる", "も",
    "する", "から", "な", "こと", "として", "です", "ます",
];

static ENGLISH: LazyLock<HashSet<String>> =
    LazyLock::new(|| ENGLISH_STOP_WORDS.iter().map(|s| s.to_string()).collect());

static JAPANESE: LazyLock<HashSet<String>> =
    LazyLock::new(|| JAPANESE_STOP_WORDS.iter().map(|s| s.to_string()).collect());

/// Stop words for a language tag such as `en`, `en-US` or `ja`.
///
/// Unknown languages get no stop words, so nothing is silently dropped.
pub fn stop_words_for(language: &str) -> HashSet<String> {
    let primary = language
        .split(['-', '_'])
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase();
    match primary.as_str() {
        "en" => ENGLISH.clone(),
        "ja" => JAPANESE.clone(),
        _ => HashSet::new(),
    }
}

/// Tokenizer + lowercase + stop filter.
#[derive(Debug, Clone)]
pub struct MessageAnalyzer {
    tokenizer: Arc<dyn Tokenizer>,
    stop_words: HashSet<String>,
    language: String,
}

impl MessageAnalyzer {
    /// Analyzer for `language`, optionally tokenizing with a custom regex.
    pub fn new(language: &str, token_pattern: Option<&str>) -> Result<Self> {
        let tokenizer: Arc<dyn Tokenizer> = match token_pattern {
            Some(pattern) => Arc::new(RegexTokenizer::with_pattern(pattern)?),
            None => Arc::new(UnicodeWordTokenizer::new()),
        };

        Ok(MessageAnalyzer {
            tokenizer,
            stop_words: stop_words_for(language),
            language: language.to_string(),
        })
    }

    /// The language this analyzer filters for.
    pub fn language(&self) -> &str {
        &self.language
    }

    /// Analyze text into lowercased, stop-filtered terms in order of appearance.
    pub fn analyze(&self, text: &str) -> Result<Vec<String>> {
        let terms = self
            .tokenizer
            .tokenize(text)?
            .map(|token| token.text.to_lowercase())
            .filter(|term| !term.is_empty() && !self.stop_words.contains(term))
            .collect();
        Ok(terms)
    }

    /// Analyze text into distinct terms with their occurrence counts.
    pub fn term_frequencies(&self, text: &str) -> Result<BTreeMap<String, u32>> {
        let mut frequencies = BTreeMap::new();
        for term in self.analyze(text)? {
            *frequencies.entry(term).or_insert(0) += 1;
        }
        Ok(frequencies)
    }
}
