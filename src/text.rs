//! # Text Processing Module
//!
//! ## Purpose
//! Text normalization, tokenization, and similarity primitives shared by the
//! retrieval engine and the binding verifier. Every function here is a pure
//! function of its inputs so that scores and binding decisions are
//! reproducible across runs.
//!
//! ## Input/Output Specification
//! - **Input**: Raw opinion page text, case names, queries, claimed quotes
//! - **Output**: Normalized strings, lexical index vectors, similarity scores
//!
//! ## Key Features
//! - Quote-verification normalization (NFKC, CRLF folding, whitespace collapse,
//!   lowercasing) used for substring containment checks
//! - Lexical index vectors (token frequencies) standing in for precomputed
//!   text-search vectors
//! - Trigram similarity for fuzzy case-name matching
//! - Case-name normalization for the fuzzy binding fallback

use regex::Regex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::OnceLock;
use unicode_normalization::UnicodeNormalization;

/// Stopwords excluded from lexical index vectors. Deliberately small: legal
/// text leans on words ("not", "under") that general-purpose lists discard.
const INDEX_STOPWORDS: &[&str] = &[
    "a", "an", "the", "of", "in", "on", "at", "to", "for", "by", "is", "are", "was", "were", "be",
    "it", "its", "as", "that", "this", "with", "from", "or",
];

/// Tokens dropped when normalizing case names for fuzzy binding: party
/// separators, connectives, and corporate suffixes.
const CASE_NAME_NOISE: &[&str] = &["v", "vs", "the", "of", "and", "corp", "inc", "llc", "ltd", "co"];

fn hyphenation_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\w+)-\n(\w+)").expect("static regex"))
}

/// Normalization used for quote verification: NFKC, CRLF -> LF, whitespace
/// collapsed to single spaces, lowercased, trimmed.
pub fn normalize_for_verification(text: &str) -> String {
    let nfkc: String = text.nfkc().collect();
    let unified = nfkc.replace("\r\n", "\n").replace('\r', "\n");
    let mut out = String::with_capacity(unified.len());
    let mut last_was_space = false;
    for ch in unified.chars() {
        if ch.is_whitespace() {
            if !last_was_space {
                out.push(' ');
                last_was_space = true;
            }
        } else {
            for lower in ch.to_lowercase() {
                out.push(lower);
            }
            last_was_space = false;
        }
    }
    out.trim().to_string()
}

/// Relaxed normalization: verification normalization plus folding of curly
/// quotes and long dashes to their ASCII forms. A quote that matches only
/// under this normalization indicates a normalization mismatch, not a
/// fabrication.
pub fn normalize_relaxed(text: &str) -> String {
    let folded: String = text
        .chars()
        .map(|c| match c {
            '\u{2018}' | '\u{2019}' | '\u{201A}' | '\u{2032}' => '\'',
            '\u{201C}' | '\u{201D}' | '\u{201E}' | '\u{2033}' => '"',
            '\u{2013}' | '\u{2014}' | '\u{2212}' => '-',
            other => other,
        })
        .collect();
    normalize_for_verification(&folded)
}

/// Aggressive normalization for OCR-artifact detection: relaxed normalization
/// with all spaces and hyphens removed. Matches here but not under the
/// standard normalization point to broken extraction (hyphenation splits,
/// run-together words), not to a wrong quote.
pub fn normalize_ocr(text: &str) -> String {
    normalize_relaxed(text)
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .collect()
}

/// Join words hyphenated across line breaks by the PDF extractor.
pub fn cleanup_hyphenation(text: &str) -> String {
    hyphenation_regex().replace_all(text, "$1$2").to_string()
}

/// Tokenize for lexical indexing: lowercase word characters, stopwords
/// removed, possessive suffix folded.
pub fn index_tokens(text: &str) -> Vec<String> {
    let lowered = normalize_for_verification(text);
    lowered
        .split(|c: char| !c.is_alphanumeric() && c != '\'')
        .filter_map(|raw| {
            let t = raw.trim_matches('\'').trim_end_matches("'s");
            if t.len() < 2 && !t.chars().all(|c| c.is_ascii_digit()) {
                return None;
            }
            if INDEX_STOPWORDS.contains(&t) {
                return None;
            }
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .collect()
}

/// Precomputed lexical index vector: sorted token frequencies plus the
/// total token count of the indexed text.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct LexVector {
    pub terms: BTreeMap<String, u32>,
    pub token_count: u32,
}

impl LexVector {
    /// Build the index vector for a body of text.
    pub fn build(text: &str) -> Self {
        let tokens = index_tokens(text);
        let token_count = tokens.len() as u32;
        let mut terms: BTreeMap<String, u32> = BTreeMap::new();
        for t in tokens {
            *terms.entry(t).or_insert(0) += 1;
        }
        Self { terms, token_count }
    }

    /// Lexical rank of this vector against a tokenized query, squashed into
    /// (0, 1) so thresholds behave like text-search ranks.
    pub fn rank(&self, query_tokens: &[String]) -> f32 {
        if query_tokens.is_empty() || self.terms.is_empty() {
            return 0.0;
        }
        let distinct: HashSet<&String> = query_tokens.iter().collect();
        let mut weight = 0.0f32;
        let mut matched = 0usize;
        for term in &distinct {
            if let Some(freq) = self.terms.get(*term) {
                matched += 1;
                weight += 1.0 + (*freq as f32).ln();
            }
        }
        if matched == 0 {
            return 0.0;
        }
        let coverage = matched as f32 / distinct.len() as f32;
        let raw = weight * coverage;
        raw / (raw + 4.0)
    }

    /// Whether any query token appears in the indexed text.
    pub fn matches(&self, query_tokens: &[String]) -> bool {
        query_tokens.iter().any(|t| self.terms.contains_key(t))
    }
}

fn trigrams(text: &str) -> HashSet<[u8; 3]> {
    let cleaned: String = text
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    let mut grams = HashSet::new();
    for word in cleaned.split_whitespace() {
        // pg_trgm-style padding: two leading blanks, one trailing
        let padded: Vec<u8> = format!("  {} ", word).bytes().collect();
        for w in padded.windows(3) {
            grams.insert([w[0], w[1], w[2]]);
        }
    }
    grams
}

/// Trigram similarity between two strings, in [0, 1].
pub fn trigram_similarity(a: &str, b: &str) -> f32 {
    let ga = trigrams(a);
    let gb = trigrams(b);
    if ga.is_empty() || gb.is_empty() {
        return 0.0;
    }
    let shared = ga.intersection(&gb).count() as f32;
    let union = (ga.len() + gb.len()) as f32 - shared;
    if union == 0.0 {
        0.0
    } else {
        shared / union
    }
}

/// Case-insensitive containment check used for case-name boosting.
pub fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    if needle.is_empty() {
        return false;
    }
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

/// Normalize a case name for fuzzy binding: lowercase, corporate suffixes and
/// party connectives removed, non-word characters treated as separators.
pub fn normalize_case_name(name: &str) -> String {
    name.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty() && !CASE_NAME_NOISE.contains(t))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Significant tokens of a normalized case name.
pub fn case_name_tokens(name: &str) -> Vec<String> {
    normalize_case_name(name)
        .split_whitespace()
        .map(|s| s.to_string())
        .collect()
}

/// Rough token estimate for context budgeting (~4 chars per token).
pub fn estimate_tokens(text: &str) -> usize {
    text.len() / 4
}

/// Truncate to at most `max_chars` characters on a char boundary.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    text.chars().take(max_chars).collect()
}

/// Split a query into quoted phrase subqueries and the remaining plain text.
pub fn split_phrases(query: &str) -> (Vec<String>, String) {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r#""([^"]+)""#).expect("static regex"));
    let phrases: Vec<String> = re
        .captures_iter(query)
        .map(|c| c[1].trim().to_string())
        .filter(|p| !p.is_empty())
        .collect();
    let plain = re.replace_all(query, " ").split_whitespace().collect::<Vec<_>>().join(" ");
    (phrases, plain)
}

/// Word-frequency map of a query, retained for snippet scoring.
pub fn term_frequencies(text: &str) -> HashMap<String, u32> {
    let mut map = HashMap::new();
    for t in index_tokens(text) {
        *map.entry(t).or_insert(0) += 1;
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_for_verification() {
        assert_eq!(
            normalize_for_verification("We  HOLD\r\nthat   the claims"),
            "we hold that the claims"
        );
        // NFKC folds ligatures
        assert_eq!(normalize_for_verification("e\u{FB03}cient"), "efficient");
    }

    #[test]
    fn test_relaxed_folds_smart_punctuation() {
        let page = "the court\u{2019}s \u{201C}two-step\u{201D} framework";
        assert_eq!(normalize_relaxed(page), "the court's \"two-step\" framework");
        assert_ne!(normalize_for_verification(page), normalize_relaxed(page));
    }

    #[test]
    fn test_ocr_normalization_joins_hyphenation() {
        assert_eq!(normalize_ocr("inter-\nmediated settle ment"), normalize_ocr("intermediated settlement"));
    }

    #[test]
    fn test_cleanup_hyphenation() {
        assert_eq!(cleanup_hyphenation("settle-\nment fails"), "settlement fails");
    }

    #[test]
    fn test_normalize_case_name() {
        assert_eq!(
            normalize_case_name("Google LLC v. Oracle America, Inc."),
            "google oracle america"
        );
        assert_eq!(
            normalize_case_name("Alice Corp. v. CLS Bank International"),
            "alice cls bank international"
        );
        assert_eq!(
            normalize_case_name("DDR Holdings, LLC vs. Hotels.com, L.P."),
            "ddr holdings hotels com l p"
        );
    }

    #[test]
    fn test_lex_vector_rank_orders_by_coverage() {
        let on_point = LexVector::build("claim construction begins with the claim language");
        let off_point = LexVector::build("the district court awarded attorney fees");
        let query = index_tokens("claim construction");
        assert!(on_point.rank(&query) > off_point.rank(&query));
        assert!(on_point.rank(&query) > 0.0 && on_point.rank(&query) < 1.0);
    }

    #[test]
    fn test_lex_vector_empty_query() {
        let v = LexVector::build("some text here");
        assert_eq!(v.rank(&[]), 0.0);
    }

    #[test]
    fn test_trigram_similarity() {
        let a = trigram_similarity("DDR Holdings", "DDR Holdings LLC");
        let b = trigram_similarity("DDR Holdings", "Alice Corp");
        assert!(a > b);
        assert!(trigram_similarity("markman", "markman") > 0.99);
    }

    #[test]
    fn test_split_phrases() {
        let (phrases, plain) = split_phrases(r#"alice "abstract idea" step two"#);
        assert_eq!(phrases, vec!["abstract idea".to_string()]);
        assert_eq!(plain, "alice step two");
    }

    #[test]
    fn test_truncate_chars_respects_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("ab", 10), "ab");
    }
}
