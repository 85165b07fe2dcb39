//! # Retrieval Engine Module
//!
//! ## Purpose
//! Lexical search over chunks and pages with case-name boosting, party-only
//! mode, per-opinion filtering, hybrid recency-aware ranking, and keyset
//! cursor pagination.
//!
//! ## Input/Output Specification
//! - **Input**: Search queries (plain text, optionally with quoted phrases),
//!   filters, cursor tokens
//! - **Output**: Ranked chunk/page hits carrying opinion metadata; paginated
//!   advanced-search results with a `next_cursor`
//!
//! ## Scoring
//! - Chunk/page search: `rank = lexical_rank + 10·case_name_contains +
//!   5·case_name_trigram_sim`; party-only mode matches case names only with
//!   rank pinned to 1.0
//! - Advanced search: `hybrid = lexical_rank · recency_decay + 5·fuzzy_hit`
//!   with `recency_decay = 1 / (max(days_old/365, 0) + 1)`
//!
//! ## Failure semantics
//! Empty or whitespace queries return empty results without error. Store
//! errors surface as `RetrievalFailure` to the caller.

use crate::config::RetrievalConfig;
use crate::corpus::CorpusStore;
use crate::errors::{CoreError, Result};
use crate::text;
use crate::{Chunk, Opinion, OpinionId};
use base64::Engine;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

/// Trigram similarity above which a case name counts as a fuzzy hit.
const FUZZY_HIT_THRESHOLD: f32 = 0.2;

/// A page-level retrieval hit with the opinion metadata downstream stages
/// need for ranking, context assembly, and binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageHit {
    pub opinion_id: OpinionId,
    pub page_number: u32,
    /// Page text, capped at the retrieval boundary
    pub text: String,
    pub case_name: String,
    pub appeal_no: String,
    pub release_date: Option<NaiveDate>,
    pub pdf_url: String,
    pub origin: String,
    pub precedential: bool,
    pub en_banc: bool,
    pub is_rule_36: bool,
    pub is_landmark: bool,
    pub citation_count: u32,
    /// Retrieval rank (not the composite score)
    pub rank: f32,
    /// Which stage produced this candidate: "baseline", "decomposition",
    /// "semantic", or "framework_injection"
    pub provenance: String,
}

impl PageHit {
    /// Stable page identifier used in audit manifests.
    pub fn page_id(&self) -> String {
        format!("{}:{}", self.opinion_id, self.page_number)
    }
}

/// A chunk-level retrieval hit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkHit {
    pub opinion_id: OpinionId,
    pub chunk_index: u32,
    pub page_start: u32,
    pub page_end: u32,
    pub text: String,
    pub case_name: String,
    pub appeal_no: String,
    pub release_date: Option<NaiveDate>,
    pub pdf_url: String,
    pub author_judge: Option<String>,
    pub is_rule_36: bool,
    pub rank: f32,
}

/// One advanced-search result row (deduplicated per opinion).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdvancedHit {
    pub id: String,
    pub case_name: String,
    pub author: Option<String>,
    pub forum: String,
    pub is_rule_36: bool,
    pub release_date: Option<NaiveDate>,
    /// Leading snippet of the best-matching chunk
    pub highlights: String,
    pub score: f32,
}

/// A page of advanced-search hits plus the continuation cursor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdvancedSearchPage {
    pub results: Vec<AdvancedHit>,
    pub next_cursor: Option<String>,
}

/// Keyset cursor over `(hybrid_score DESC, release_date DESC, id DESC)`.
#[derive(Debug, Serialize, Deserialize)]
struct CursorToken {
    score: f32,
    ts: Option<String>,
    id: String,
}

/// Retrieval engine over the corpus store
pub struct RetrievalEngine {
    corpus: Arc<CorpusStore>,
    config: RetrievalConfig,
}

impl RetrievalEngine {
    pub fn new(corpus: Arc<CorpusStore>, config: RetrievalConfig) -> Self {
        Self { corpus, config }
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Search chunks with case-name boosting and optional filters.
    pub fn search_chunks(
        &self,
        query: &str,
        limit: usize,
        party_only: bool,
        author: Option<&str>,
        include_r36: bool,
    ) -> Result<Vec<ChunkHit>> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }
        let opinions = self.opinion_map()?;
        let (phrases, plain) = text::split_phrases(query);
        let query_tokens = text::index_tokens(&plain);

        let mut hits = Vec::new();
        for chunk in self
            .corpus
            .all_chunks()
            .map_err(retrieval_failure)?
        {
            let Some(opinion) = opinions.get(&chunk.opinion_id) else {
                continue;
            };
            if !opinion.ingested {
                continue;
            }
            if let Some(judge) = author {
                if opinion.author_judge.as_deref() != Some(judge) {
                    continue;
                }
            }
            if !include_r36 && opinion.is_rule_36 {
                continue;
            }

            let rank = if party_only {
                if text::contains_ignore_case(&opinion.case_name, query.trim()) {
                    1.0
                } else {
                    continue;
                }
            } else {
                match self.score_text(&chunk.lexemes, &chunk.text, &query_tokens, &phrases, opinion, query) {
                    Some(rank) => rank,
                    None => continue,
                }
            };

            hits.push(ChunkHit {
                opinion_id: chunk.opinion_id,
                chunk_index: chunk.chunk_index,
                page_start: chunk.page_start,
                page_end: chunk.page_end,
                text: chunk.text.clone(),
                case_name: opinion.case_name.clone(),
                appeal_no: opinion.appeal_no.clone(),
                release_date: opinion.release_date,
                pdf_url: opinion.pdf_url.clone(),
                author_judge: opinion.author_judge.clone(),
                is_rule_36: opinion.is_rule_36,
                rank,
            });
        }

        hits.sort_by(|a, b| {
            order_desc(a.rank, b.rank)
                .then_with(|| b.release_date.cmp(&a.release_date))
                .then_with(|| a.opinion_id.cmp(&b.opinion_id))
                .then_with(|| a.chunk_index.cmp(&b.chunk_index))
        });
        hits.truncate(limit);
        Ok(hits)
    }

    /// Search pages with case-name boosting or party-only mode. Page text is
    /// capped at `max_text_chars` to keep downstream prompts bounded.
    pub fn search_pages(
        &self,
        query: &str,
        opinion_ids: Option<&[OpinionId]>,
        limit: usize,
        party_only: bool,
        max_text_chars: usize,
    ) -> Result<Vec<PageHit>> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }
        let opinions = self.opinion_map()?;
        let (phrases, plain) = text::split_phrases(query);
        let query_tokens = text::index_tokens(&plain);

        let mut hits = Vec::new();
        for page in self.corpus.all_pages().map_err(retrieval_failure)? {
            if page.page_number < 1 {
                continue;
            }
            let Some(opinion) = opinions.get(&page.opinion_id) else {
                continue;
            };
            if !opinion.ingested {
                continue;
            }
            if let Some(ids) = opinion_ids {
                if !ids.contains(&page.opinion_id) {
                    continue;
                }
            }

            let rank = if party_only {
                if text::contains_ignore_case(&opinion.case_name, query.trim()) {
                    1.0
                } else {
                    continue;
                }
            } else {
                match self.score_text(&page.lexemes, &page.text, &query_tokens, &phrases, opinion, query) {
                    Some(rank) => rank,
                    None => continue,
                }
            };

            hits.push(self.page_hit(opinion, page.page_number, &page.text, rank, max_text_chars, "baseline"));
        }

        sort_page_hits(&mut hits);
        if party_only {
            // One representative page per opinion in party mode
            let mut seen = std::collections::HashSet::new();
            hits.retain(|h| seen.insert(h.opinion_id));
        }
        hits.truncate(limit);
        Ok(hits)
    }

    /// Advanced search with hybrid recency ranking and keyset pagination.
    /// Fetches one row beyond `limit` to decide whether a next page exists.
    pub fn advanced_search(
        &self,
        query: &str,
        author: Option<&str>,
        forum: Option<&str>,
        exclude_r36: bool,
        cursor_token: Option<&str>,
        limit: usize,
    ) -> Result<AdvancedSearchPage> {
        let (phrases, plain) = text::split_phrases(query);
        if plain.is_empty() && phrases.is_empty() {
            return Ok(AdvancedSearchPage {
                results: Vec::new(),
                next_cursor: None,
            });
        }
        let query_tokens = text::index_tokens(&plain);
        let opinions = self.opinion_map()?;
        let today = chrono::Utc::now().date_naive();

        // Best-scoring chunk per opinion
        let mut best: HashMap<OpinionId, (f32, Chunk)> = HashMap::new();
        for chunk in self.corpus.all_chunks().map_err(retrieval_failure)? {
            let Some(opinion) = opinions.get(&chunk.opinion_id) else {
                continue;
            };
            if !opinion.ingested {
                continue;
            }
            if let Some(judge) = author {
                if opinion.author_judge.as_deref() != Some(judge) {
                    continue;
                }
            }
            if let Some(f) = forum {
                if !opinion.origin.eq_ignore_ascii_case(f) {
                    continue;
                }
            }
            if exclude_r36 && opinion.is_rule_36 {
                continue;
            }

            let lexical = chunk.lexemes.rank(&query_tokens);
            let phrase_hit = phrases
                .iter()
                .any(|p| text::normalize_for_verification(&chunk.text).contains(&text::normalize_for_verification(p)));
            let fuzzy = text::trigram_similarity(&opinion.case_name, &plain);
            if lexical == 0.0 && !phrase_hit && fuzzy <= FUZZY_HIT_THRESHOLD {
                continue;
            }

            let days_old = opinion
                .release_date
                .map(|d| (today - d).num_days().max(0) as f32)
                .unwrap_or(0.0);
            let recency_decay = 1.0 / (days_old / 365.0 + 1.0);
            let fuzzy_bonus = if fuzzy > FUZZY_HIT_THRESHOLD { 5.0 } else { 0.0 };
            let hybrid = lexical.max(0.01) * recency_decay + fuzzy_bonus;

            match best.get(&chunk.opinion_id) {
                Some((existing, _)) if *existing >= hybrid => {}
                _ => {
                    best.insert(chunk.opinion_id, (hybrid, chunk));
                }
            }
        }

        let mut rows: Vec<(f32, Option<NaiveDate>, OpinionId, Chunk)> = best
            .into_iter()
            .map(|(id, (score, chunk))| {
                let date = opinions.get(&id).and_then(|o| o.release_date);
                (score, date, id, chunk)
            })
            .collect();
        rows.sort_by(|a, b| {
            order_desc(a.0, b.0)
                .then_with(|| b.1.cmp(&a.1))
                .then_with(|| b.2.cmp(&a.2))
        });

        // Keyset cursor: keep rows strictly after the cursor position
        if let Some(token) = cursor_token {
            if let Some(cursor) = decode_cursor(token) {
                rows.retain(|(score, date, id, _)| {
                    after_cursor(*score, *date, &id.to_string(), &cursor)
                });
            }
        }

        let has_more = rows.len() > limit;
        let next_cursor = if has_more && limit > 0 {
            let (score, date, id, _) = &rows[limit - 1];
            Some(encode_cursor(&CursorToken {
                score: *score,
                ts: date.map(|d| d.to_string()),
                id: id.to_string(),
            }))
        } else {
            None
        };

        let results = rows
            .into_iter()
            .take(limit)
            .map(|(score, date, id, chunk)| {
                let opinion = &opinions[&id];
                AdvancedHit {
                    id: id.to_string(),
                    case_name: opinion.case_name.clone(),
                    author: opinion.author_judge.clone(),
                    forum: opinion.origin.clone(),
                    is_rule_36: opinion.is_rule_36,
                    release_date: date,
                    highlights: text::truncate_chars(&chunk.text, 300),
                    score,
                }
            })
            .collect();

        Ok(AdvancedSearchPage {
            results,
            next_cursor,
        })
    }

    /// Look up a single page as a hit, for the binding verifier's strict path
    /// and the controlling-framework injector.
    pub fn page_hit_for(
        &self,
        opinion_id: OpinionId,
        page_number: u32,
        max_text_chars: usize,
        provenance: &str,
    ) -> Result<Option<PageHit>> {
        let Some(page) = self.corpus.page(opinion_id, page_number).map_err(retrieval_failure)? else {
            return Ok(None);
        };
        let Some(opinion) = self.corpus.opinion(opinion_id).map_err(retrieval_failure)? else {
            return Ok(None);
        };
        Ok(Some(self.page_hit(
            &opinion,
            page.page_number,
            &page.text,
            0.0,
            max_text_chars,
            provenance,
        )))
    }

    fn page_hit(
        &self,
        opinion: &Opinion,
        page_number: u32,
        page_text: &str,
        rank: f32,
        max_text_chars: usize,
        provenance: &str,
    ) -> PageHit {
        PageHit {
            opinion_id: opinion.id,
            page_number,
            text: text::truncate_chars(page_text, max_text_chars),
            case_name: opinion.case_name.clone(),
            appeal_no: opinion.appeal_no.clone(),
            release_date: opinion.release_date,
            pdf_url: opinion.pdf_url.clone(),
            origin: opinion.origin.clone(),
            precedential: opinion.precedential,
            en_banc: opinion.en_banc,
            is_rule_36: opinion.is_rule_36,
            is_landmark: opinion.is_landmark,
            citation_count: opinion.citation_count,
            rank,
            provenance: provenance.to_string(),
        }
    }

    /// Effective score for full-text mode, or None when the row does not
    /// match at all.
    fn score_text(
        &self,
        lexemes: &text::LexVector,
        body: &str,
        query_tokens: &[String],
        phrases: &[String],
        opinion: &Opinion,
        raw_query: &str,
    ) -> Option<f32> {
        let lexical = lexemes.rank(query_tokens);
        let phrase_score: f32 = phrases
            .iter()
            .filter(|p| {
                text::normalize_for_verification(body).contains(&text::normalize_for_verification(p))
            })
            .map(|_| 0.5)
            .sum();
        let name_contains = text::contains_ignore_case(&opinion.case_name, raw_query.trim());
        let fuzzy = text::trigram_similarity(&opinion.case_name, raw_query);

        if lexical == 0.0 && phrase_score == 0.0 && !name_contains && fuzzy <= FUZZY_HIT_THRESHOLD {
            return None;
        }
        let mut rank = lexical + phrase_score;
        if name_contains {
            rank += 10.0;
        }
        rank += 5.0 * fuzzy;
        Some(rank)
    }

    fn opinion_map(&self) -> Result<HashMap<OpinionId, Opinion>> {
        Ok(self
            .corpus
            .opinions()
            .map_err(retrieval_failure)?
            .into_iter()
            .map(|o| (o.id, o))
            .collect())
    }
}

/// Deterministic page-hit ordering: rank desc, recency desc, stable id order.
pub fn sort_page_hits(hits: &mut [PageHit]) {
    hits.sort_by(|a, b| {
        order_desc(a.rank, b.rank)
            .then_with(|| b.release_date.cmp(&a.release_date))
            .then_with(|| a.opinion_id.cmp(&b.opinion_id))
            .then_with(|| a.page_number.cmp(&b.page_number))
    });
}

fn order_desc(a: f32, b: f32) -> Ordering {
    b.partial_cmp(&a).unwrap_or(Ordering::Equal)
}

fn retrieval_failure(err: CoreError) -> CoreError {
    CoreError::RetrievalFailure {
        details: err.to_string(),
    }
}

fn encode_cursor(token: &CursorToken) -> String {
    let json = serde_json::to_vec(token).unwrap_or_default();
    base64::engine::general_purpose::STANDARD.encode(json)
}

fn decode_cursor(token: &str) -> Option<CursorToken> {
    let bytes = base64::engine::general_purpose::STANDARD.decode(token).ok()?;
    serde_json::from_slice(&bytes).ok()
}

/// Whether a row sorts strictly after the cursor position under
/// `(score DESC, release_date DESC, id DESC)`.
fn after_cursor(score: f32, date: Option<NaiveDate>, id: &str, cursor: &CursorToken) -> bool {
    match score.partial_cmp(&cursor.score) {
        Some(Ordering::Less) => return true,
        Some(Ordering::Greater) => return false,
        _ => {}
    }
    let row_ts = date.map(|d| d.to_string());
    match (&row_ts, &cursor.ts) {
        (Some(a), Some(b)) if a != b => return a < b,
        (Some(_), None) => return false,
        (None, Some(_)) => return true,
        _ => {}
    }
    id < cursor.id.as_str()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::test_support::{opinion, seed, temp_store};
    use uuid::Uuid;

    fn engine(store: Arc<CorpusStore>) -> RetrievalEngine {
        RetrievalEngine::new(store, RetrievalConfig::default())
    }

    #[test]
    fn test_empty_query_returns_empty() {
        let (store, _dir) = temp_store();
        let engine = engine(Arc::new(store));
        assert!(engine.search_pages("", None, 10, false, 2000).unwrap().is_empty());
        assert!(engine.search_pages("   ", None, 10, false, 2000).unwrap().is_empty());
        assert!(engine.search_chunks("\t", 10, false, None, true).unwrap().is_empty());
        let page = engine.advanced_search("  ", None, None, false, None, 10).unwrap();
        assert!(page.results.is_empty() && page.next_cursor.is_none());
    }

    #[test]
    fn test_case_name_boost_outranks_body_match() {
        let (store, _dir) = temp_store();
        let alice = opinion(Uuid::new_v4(), "Alice Corp. v. CLS Bank International", "SCOTUS", (2014, 6, 19));
        seed(&store, &alice, &["We hold that the claims are drawn to an abstract idea."]);
        let other = opinion(Uuid::new_v4(), "Unrelated v. Case", "CAFC", (2020, 1, 1));
        seed(&store, &other, &["This opinion discusses Alice at length, Alice being central."]);

        let engine = engine(Arc::new(store));
        let hits = engine.search_pages("Alice", None, 10, false, 2000).unwrap();
        assert!(!hits.is_empty());
        assert_eq!(hits[0].case_name, "Alice Corp. v. CLS Bank International");
        assert!(hits[0].rank >= 10.0, "case-name containment adds +10, got {}", hits[0].rank);
    }

    #[test]
    fn test_party_only_ignores_body_text() {
        let (store, _dir) = temp_store();
        let ddr = opinion(Uuid::new_v4(), "DDR Holdings, LLC v. Hotels.com, L.P.", "CAFC", (2014, 12, 5));
        seed(&store, &ddr, &["Unlike the claims in Alice, the claims here specify how interactions work."]);

        let engine = engine(Arc::new(store));
        // "Alice" appears in DDR's body but not its caption
        let hits = engine.search_pages("Alice", None, 10, true, 2000).unwrap();
        assert!(hits.is_empty());

        let hits = engine.search_pages("Hotels.com", None, 10, true, 2000).unwrap();
        assert_eq!(hits.len(), 1);
        assert!((hits[0].rank - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_snippet_cap_applied() {
        let (store, _dir) = temp_store();
        let long_text = format!("obviousness {}", "x".repeat(5000));
        let op = opinion(Uuid::new_v4(), "Long v. Opinion", "CAFC", (2021, 1, 1));
        seed(&store, &op, &[long_text.as_str()]);

        let engine = engine(Arc::new(store));
        let hits = engine.search_pages("obviousness", None, 10, false, 2000).unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].text.chars().count() <= 2000);
    }

    #[test]
    fn test_opinion_filter_restricts_results() {
        let (store, _dir) = temp_store();
        let a = opinion(Uuid::new_v4(), "A v. B", "CAFC", (2020, 1, 1));
        seed(&store, &a, &["claim construction analysis"]);
        let b = opinion(Uuid::new_v4(), "C v. D", "CAFC", (2021, 1, 1));
        seed(&store, &b, &["claim construction analysis"]);

        let engine = engine(Arc::new(store));
        let hits = engine
            .search_pages("claim construction", Some(&[a.id]), 10, false, 2000)
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].opinion_id, a.id);
    }

    #[test]
    fn test_advanced_search_rule36_exclusion() {
        let (store, _dir) = temp_store();
        let mut r36 = opinion(Uuid::new_v4(), "Summary v. Affirmance", "CAFC", (2023, 1, 1));
        r36.is_rule_36 = true;
        seed(&store, &r36, &["infringement judgment affirmed"]);
        let merits = opinion(Uuid::new_v4(), "Merits v. Decision", "CAFC", (2022, 1, 1));
        seed(&store, &merits, &["infringement judgment analysis in detail"]);

        let engine = engine(Arc::new(store));
        let with_r36 = engine.advanced_search("infringement judgment", None, None, false, None, 10).unwrap();
        assert_eq!(with_r36.results.len(), 2);
        let without = engine.advanced_search("infringement judgment", None, None, true, None, 10).unwrap();
        assert_eq!(without.results.len(), 1);
        assert_eq!(without.results[0].case_name, "Merits v. Decision");
    }

    #[test]
    fn test_advanced_search_recency_tiebreak() {
        let (store, _dir) = temp_store();
        // Same text, different dates: newer should decay less, ranking first
        let newer = opinion(Uuid::new_v4(), "Newer v. Case", "CAFC", (2025, 6, 1));
        seed(&store, &newer, &["enablement requires undue experimentation analysis"]);
        let older = opinion(Uuid::new_v4(), "Older v. Case", "CAFC", (2005, 6, 1));
        seed(&store, &older, &["enablement requires undue experimentation analysis"]);

        let engine = engine(Arc::new(store));
        let page = engine.advanced_search("enablement undue experimentation", None, None, false, None, 10).unwrap();
        assert_eq!(page.results.len(), 2);
        assert_eq!(page.results[0].case_name, "Newer v. Case");
        assert!(page.results[0].score > page.results[1].score);
    }

    #[test]
    fn test_advanced_search_cursor_pagination() {
        let (store, _dir) = temp_store();
        for (i, year) in (0..5).zip([2021, 2022, 2023, 2024, 2025]) {
            let op = opinion(Uuid::new_v4(), &format!("Case{} v. Other{}", i, i), "CAFC", (year, 1, 1));
            seed(&store, &op, &["damages apportionment reasonable royalty analysis"]);
        }

        let engine = engine(Arc::new(store));
        let first = engine.advanced_search("damages apportionment", None, None, false, None, 2).unwrap();
        assert_eq!(first.results.len(), 2);
        let cursor = first.next_cursor.expect("expected a next page");

        let second = engine
            .advanced_search("damages apportionment", None, None, false, Some(&cursor), 2)
            .unwrap();
        assert_eq!(second.results.len(), 2);
        let first_ids: Vec<_> = first.results.iter().map(|r| r.id.clone()).collect();
        for hit in &second.results {
            assert!(!first_ids.contains(&hit.id), "pages must not overlap");
        }

        // Walk to the end: five rows, page size two, so the third page has one
        let cursor = second.next_cursor.expect("expected a third page");
        let third = engine
            .advanced_search("damages apportionment", None, None, false, Some(&cursor), 2)
            .unwrap();
        assert_eq!(third.results.len(), 1);
        assert!(third.next_cursor.is_none());
    }

    #[test]
    fn test_garbage_cursor_ignored() {
        let (store, _dir) = temp_store();
        let op = opinion(Uuid::new_v4(), "Robust v. Cursor", "CAFC", (2023, 1, 1));
        seed(&store, &op, &["prosecution history estoppel analysis"]);

        let engine = engine(Arc::new(store));
        let page = engine
            .advanced_search("prosecution history", None, None, false, Some("not-base64!!"), 10)
            .unwrap();
        assert_eq!(page.results.len(), 1);
    }

    #[test]
    fn test_phrase_subquery_contributes() {
        let (store, _dir) = temp_store();
        let with_phrase = opinion(Uuid::new_v4(), "Phrase v. Match", "CAFC", (2022, 1, 1));
        seed(&store, &with_phrase, &["The inventive concept inquiry asks whether the elements transform the claim."]);
        let without = opinion(Uuid::new_v4(), "Scattered v. Terms", "CAFC", (2022, 1, 1));
        seed(&store, &without, &["The concept was inventive according to the inquiry of the district court transform."]);

        let engine = engine(Arc::new(store));
        let hits = engine
            .search_pages(r#""inventive concept inquiry""#, None, 10, false, 2000)
            .unwrap();
        assert_eq!(hits[0].case_name, "Phrase v. Match");
    }
}
