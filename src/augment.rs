//! # Recall Augmenter Module
//!
//! ## Purpose
//! Strictly additive recall augmentation for thin or multi-issue queries:
//! decomposes multi-issue questions into focused subqueries and, when an
//! embeddings provider is available, adds semantic nearest-neighbor
//! candidates from the precomputed page-embedding table.
//!
//! ## Guarantees
//! - Additive only: baseline candidates are never removed or reordered
//! - Fail-soft: any error returns the baseline unchanged with a telemetry note
//! - Bounded: a total latency budget and candidate caps limit the work
//!
//! Triggers fire when the baseline is thin, its top score is low, or the
//! query spans multiple doctrines; a strong baseline suppresses augmentation
//! unless the eval-force flag is set.

use crate::config::AugmentConfig;
use crate::corpus::CorpusStore;
use crate::errors::Result;
use crate::retrieval::{PageHit, RetrievalEngine};
use crate::OpinionId;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

/// Doctrine signal table: query tokens mapped to doctrine tags.
const DOCTRINE_SIGNALS: &[(&str, &[&str])] = &[
    ("101", &[
        "101", "§101", "§ 101", "section 101", "alice", "mayo", "bilski", "abstract idea",
        "abstract", "patent eligible", "eligibility", "patent-eligible", "judicial exception",
        "laws of nature", "natural phenomena",
    ]),
    ("102", &[
        "102", "§102", "§ 102", "section 102", "anticipation", "anticipate", "anticipated",
        "prior art", "novelty",
    ]),
    ("103", &[
        "103", "§103", "§ 103", "section 103", "obviousness", "obvious", "nonobvious",
        "non-obvious", "secondary considerations", "teaching away", "ksr", "graham",
        "motivation to combine", "combine references",
    ]),
    ("112", &[
        "112", "§112", "§ 112", "section 112", "enablement", "enabled", "undue experimentation",
        "written description", "indefiniteness", "indefinite", "means plus function",
        "means-plus-function", "wands factors",
    ]),
    ("claim_construction", &[
        "claim construction", "markman", "phillips", "extrinsic", "intrinsic", "specification",
        "prosecution history",
    ]),
    ("infringement", &[
        "infringement", "infringe", "infringes", "infringing", "doctrine of equivalents",
        "literal infringement", "contributory", "inducement", "induced",
    ]),
    ("damages", &[
        "damages", "reasonable royalty", "lost profits", "georgia-pacific", "apportionment",
        "entire market value",
    ]),
    ("inequitable_conduct", &[
        "inequitable conduct", "unenforceability", "materiality", "intent to deceive",
        "therasense",
    ]),
    ("obviousness_type_double_patenting", &["double patenting", "terminal disclaimer", "otdp"]),
    ("certificate_correction", &[
        "certificate of correction", "certificates of correction", "reissue",
        "retroactive effect", "252", "254", "255",
    ]),
];

const CONJUNCTION_PATTERNS: &[&str] = &[
    r"\band\b",
    r"\bas well as\b",
    r"\bplus\b",
    r"\balong with\b",
    r"\bin addition to\b",
    r"\btogether with\b",
    r"\bcombined with\b",
    r"\bboth\b.*\band\b",
    r"/",
];

/// Telemetry emitted alongside every augmentation attempt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AugmentTelemetry {
    pub enabled: bool,
    pub triggered: bool,
    pub trigger_reasons: Vec<String>,
    pub subqueries_generated: usize,
    pub decompose_candidates_added: usize,
    pub embed_candidates_added: usize,
    pub total_candidates_added: usize,
    pub augmentation_latency_ms: u64,
    pub skipped_reason: Option<String>,
}

/// Optional embeddings collaborator for the semantic fallback.
#[async_trait::async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// The augmenter itself: owns nothing but configuration and read handles.
pub struct RecallAugmenter {
    config: AugmentConfig,
    corpus: Arc<CorpusStore>,
    engine: Arc<RetrievalEngine>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
}

impl RecallAugmenter {
    pub fn new(
        config: AugmentConfig,
        corpus: Arc<CorpusStore>,
        engine: Arc<RetrievalEngine>,
        embedder: Option<Arc<dyn EmbeddingProvider>>,
    ) -> Self {
        Self {
            config,
            corpus,
            engine,
            embedder,
        }
    }

    /// Augment the baseline candidate set. Never removes baseline hits.
    pub async fn augment(&self, query: &str, baseline: Vec<PageHit>) -> (Vec<PageHit>, AugmentTelemetry) {
        let start = Instant::now();
        let mut telemetry = AugmentTelemetry {
            enabled: self.config.query_decompose_enabled || self.config.embed_recall_enabled,
            ..Default::default()
        };

        if !telemetry.enabled {
            telemetry.skipped_reason = Some("flags_off".to_string());
            return (baseline, telemetry);
        }

        let (should, reasons) = self.should_augment(&baseline, query);
        telemetry.trigger_reasons = reasons.clone();
        if !should {
            telemetry.skipped_reason = Some("triggers_not_met".to_string());
            return (baseline, telemetry);
        }
        telemetry.triggered = true;

        let mut augmented = baseline.clone();
        let mut seen: HashSet<(OpinionId, u32)> =
            baseline.iter().map(|h| (h.opinion_id, h.page_number)).collect();
        let mut added = 0usize;

        // Decomposition: focused subqueries for each detected doctrine
        if self.config.query_decompose_enabled && reasons.iter().any(|r| r == "multi_issue") {
            let elapsed = start.elapsed().as_millis() as u64;
            if self.config.budget_ms.saturating_sub(elapsed) > 100 {
                let subqueries = decompose_query(query, self.config.max_subqueries);
                telemetry.subqueries_generated = subqueries.len();
                for subquery in subqueries {
                    if added >= self.config.max_augment_candidates {
                        break;
                    }
                    // Decomposition gets at most 60% of the budget
                    if start.elapsed().as_millis() as u64 > self.config.budget_ms * 6 / 10 {
                        break;
                    }
                    match self.engine.search_pages(
                        &subquery,
                        None,
                        10,
                        false,
                        self.engine.config().max_text_chars,
                    ) {
                        Ok(hits) => {
                            for mut hit in hits {
                                if added >= self.config.max_augment_candidates {
                                    break;
                                }
                                if seen.insert((hit.opinion_id, hit.page_number)) {
                                    hit.provenance = "decomposition".to_string();
                                    augmented.push(hit);
                                    added += 1;
                                    telemetry.decompose_candidates_added += 1;
                                }
                            }
                        }
                        Err(e) => {
                            tracing::debug!("Subquery search failed: {}", e);
                        }
                    }
                }
            }
        }

        // Semantic fallback over precomputed page embeddings
        if self.config.embed_recall_enabled && added < self.config.max_augment_candidates {
            let elapsed = start.elapsed().as_millis() as u64;
            if self.config.budget_ms.saturating_sub(elapsed) > 100 {
                let remaining = self.config.max_augment_candidates - added;
                let k = self.config.max_embed_candidates.min(remaining);
                match self.semantic_recall(query, k, &seen).await {
                    Ok(hits) => {
                        for hit in hits {
                            if added >= self.config.max_augment_candidates {
                                break;
                            }
                            seen.insert((hit.opinion_id, hit.page_number));
                            augmented.push(hit);
                            added += 1;
                            telemetry.embed_candidates_added += 1;
                        }
                    }
                    Err(e) => {
                        tracing::debug!("Embedding recall failed: {}", e);
                    }
                }
            }
        }

        telemetry.total_candidates_added = added;
        telemetry.augmentation_latency_ms = start.elapsed().as_millis() as u64;
        tracing::info!(
            added,
            latency_ms = telemetry.augmentation_latency_ms,
            reasons = ?telemetry.trigger_reasons,
            "Recall augmentation complete"
        );
        (augmented, telemetry)
    }

    /// Trigger decision with strong-baseline suppression.
    fn should_augment(&self, baseline: &[PageHit], query: &str) -> (bool, Vec<String>) {
        if self.config.eval_force_phase1 {
            return (true, vec!["forced".to_string()]);
        }

        let top_score = baseline.iter().map(|h| h.rank).fold(0.0f32, f32::max);
        let strong_baseline = baseline.len() >= self.config.strong_baseline_min_sources
            && top_score >= self.config.strong_baseline_min_score;
        if strong_baseline {
            return (false, vec!["strong_baseline".to_string()]);
        }

        let mut reasons = Vec::new();
        if baseline.is_empty() {
            reasons.push("no_results".to_string());
        } else if baseline.len() < self.config.min_fts_results {
            reasons.push("thin_results".to_string());
        }
        if !baseline.is_empty() && top_score < self.config.min_top_score {
            reasons.push("low_score".to_string());
        }
        if self.config.query_decompose_enabled && should_decompose(query) {
            reasons.push("multi_issue".to_string());
        }
        (!reasons.is_empty(), reasons)
    }

    /// Top-k cosine neighbors from the page-embedding table, excluding
    /// pages already in the candidate set.
    async fn semantic_recall(
        &self,
        query: &str,
        k: usize,
        exclude: &HashSet<(OpinionId, u32)>,
    ) -> Result<Vec<PageHit>> {
        let Some(embedder) = &self.embedder else {
            return Ok(Vec::new());
        };
        if k == 0 {
            return Ok(Vec::new());
        }
        let query_vec = embedder.embed(query).await?;
        let mut scored: Vec<((OpinionId, u32), f32)> = self
            .corpus
            .all_page_embeddings()?
            .into_iter()
            .filter(|(key, _)| !exclude.contains(key))
            .map(|(key, vector)| (key, cosine_similarity(&query_vec, &vector)))
            .collect();
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });

        let mut hits = Vec::new();
        for ((opinion_id, page_number), similarity) in scored.into_iter().take(k) {
            if let Some(mut hit) = self.engine.page_hit_for(
                opinion_id,
                page_number,
                self.engine.config().max_text_chars,
                "semantic",
            )? {
                hit.rank = similarity;
                hits.push(hit);
            }
        }
        Ok(hits)
    }
}

/// Expand common ambiguous legal phrasing into doctrine-oriented terms.
pub fn canonicalize_legal_query(query: &str) -> String {
    static RULES: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    let rules = RULES.get_or_init(|| {
        [
            (r"(?i)\bfunctional and broad\b", "functional claiming under 112(f) written description enablement"),
            (r"(?i)\bfew examples\b", "few representative species written description enablement"),
            (r"(?i)\bcabin scope\b", "prosecution disclaimer claim construction"),
            (r"(?i)\bcorrected after issuance\b", "certificate of correction retroactive effect 252 254 255"),
        ]
        .iter()
        .map(|(p, r)| (Regex::new(p).expect("static regex"), *r))
        .collect()
    });
    let mut q = query.to_string();
    for (re, replacement) in rules {
        q = re.replace_all(&q, *replacement).to_string();
    }
    q
}

/// Detect which doctrine areas a query mentions.
pub fn detect_doctrine_signals(query: &str) -> (Vec<&'static str>, HashMap<&'static str, Vec<String>>) {
    let canonical = canonicalize_legal_query(query);
    let lower = canonical.to_lowercase();
    let mut detected = Vec::new();
    let mut evidence: HashMap<&'static str, Vec<String>> = HashMap::new();

    for (doctrine, signals) in DOCTRINE_SIGNALS {
        let matched: Vec<String> = signals
            .iter()
            .filter(|s| lower.contains(&s.to_lowercase()))
            .map(|s| s.to_string())
            .collect();
        if !matched.is_empty() {
            detected.push(*doctrine);
            evidence.insert(doctrine, matched);
        }
    }
    (detected, evidence)
}

fn conjunction_regexes() -> &'static Vec<Regex> {
    static RES: OnceLock<Vec<Regex>> = OnceLock::new();
    RES.get_or_init(|| {
        CONJUNCTION_PATTERNS
            .iter()
            .map(|p| Regex::new(p).expect("static regex"))
            .collect()
    })
}

/// Whether the query contains conjunction patterns suggesting several issues.
pub fn has_conjunction_pattern(query: &str) -> bool {
    let lower = query.to_lowercase();
    conjunction_regexes().iter().any(|re| re.is_match(&lower))
}

/// Multi-issue detection: two or more doctrine signals, or one signal plus a
/// conjunction in a query of at least ten words.
pub fn should_decompose(query: &str) -> bool {
    let (doctrines, _) = detect_doctrine_signals(query);
    if doctrines.len() >= 2 {
        return true;
    }
    if has_conjunction_pattern(query) && !doctrines.is_empty() && query.split_whitespace().count() >= 10 {
        return true;
    }
    false
}

/// Decompose a multi-issue query into at most `max_subqueries` focused
/// subqueries of the form `<Case v. Case> <signal>` or
/// `<signal> CAFC Federal Circuit`.
pub fn decompose_query(query: &str, max_subqueries: usize) -> Vec<String> {
    static CASE_NAME: OnceLock<Regex> = OnceLock::new();
    let case_name_re = CASE_NAME.get_or_init(|| {
        Regex::new(r"([A-Z][a-z]+(?:\s+[A-Z][a-z]+)*\s+v\.?\s+[A-Z][a-z]+(?:\s+[A-Z][a-z]+)*)")
            .expect("static regex")
    });

    let (doctrines, evidence) = detect_doctrine_signals(query);
    if doctrines.len() < 2 {
        return Vec::new();
    }

    let case_name = case_name_re.captures(query).map(|c| c[1].to_string());
    let mut subqueries = Vec::new();
    for doctrine in doctrines.into_iter().take(max_subqueries) {
        let Some(signals) = evidence.get(doctrine) else {
            continue;
        };
        let Some(primary) = signals.first() else {
            continue;
        };
        let subquery = match &case_name {
            Some(name) => format!("{} {}", name, primary),
            None => format!("{} CAFC Federal Circuit", primary),
        };
        subqueries.push(subquery.trim().to_string());
    }
    subqueries.truncate(max_subqueries);
    subqueries
}

/// Cosine similarity between two vectors; 0.0 on dimension mismatch.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetrievalConfig;
    use crate::corpus::test_support::{opinion, seed, temp_store};
    use uuid::Uuid;

    #[test]
    fn test_multi_issue_detection_two_doctrines() {
        assert!(should_decompose("Does Alice eligibility doctrine interact with enablement under Amgen?"));
        assert!(should_decompose("obviousness under KSR and written description"));
        assert!(!should_decompose("what did the court hold"));
    }

    #[test]
    fn test_single_doctrine_needs_conjunction_and_length() {
        // One doctrine, conjunction, >= 10 words
        assert!(should_decompose(
            "how does the court treat obviousness and the standard of review for factual findings"
        ));
        // One doctrine, short query
        assert!(!should_decompose("obviousness and review"));
    }

    #[test]
    fn test_decompose_caps_subqueries() {
        let q = "eligibility under Alice, obviousness under KSR, enablement under Amgen, claim construction under Phillips, and damages apportionment";
        let subs = decompose_query(q, 4);
        assert!(!subs.is_empty());
        assert!(subs.len() <= 4);
    }

    #[test]
    fn test_decompose_uses_case_name_when_present() {
        let q = "Alice Corp v. Bank eligibility and enablement questions together";
        let subs = decompose_query(q, 4);
        assert!(subs.iter().any(|s| s.contains("v.")), "subqueries: {:?}", subs);
    }

    #[test]
    fn test_decompose_without_case_name_targets_the_forum() {
        let subs = decompose_query("eligibility under alice and enablement analysis", 4);
        assert!(!subs.is_empty());
        assert!(subs.iter().all(|s| s.contains("CAFC Federal Circuit")));
    }

    #[test]
    fn test_decompose_non_multi_issue_is_empty() {
        assert!(decompose_query("claim construction standard", 4).is_empty());
    }

    #[test]
    fn test_canonicalization_expands_phrases() {
        let q = canonicalize_legal_query("claims that are functional and broad with few examples");
        assert!(q.contains("112(f)"));
        assert!(q.contains("written description"));
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
    }

    fn augmenter(config: AugmentConfig) -> (RecallAugmenter, tempfile::TempDir) {
        let (store, dir) = temp_store();
        let corpus = Arc::new(store);
        let engine = Arc::new(RetrievalEngine::new(corpus.clone(), RetrievalConfig::default()));
        (RecallAugmenter::new(config, corpus, engine, None), dir)
    }

    #[tokio::test]
    async fn test_flags_off_skips_silently() {
        let (aug, _dir) = augmenter(AugmentConfig::default());
        let (out, telemetry) = aug.augment("alice and enablement question", Vec::new()).await;
        assert!(out.is_empty());
        assert_eq!(telemetry.skipped_reason.as_deref(), Some("flags_off"));
        assert!(!telemetry.triggered);
    }

    #[tokio::test]
    async fn test_strong_baseline_suppresses() {
        let mut config = AugmentConfig {
            query_decompose_enabled: true,
            strong_baseline_min_sources: 1,
            strong_baseline_min_score: 0.4,
            ..AugmentConfig::default()
        };
        config.min_fts_results = 8;
        let (store, _dir) = temp_store();
        let corpus = Arc::new(store);
        let engine = Arc::new(RetrievalEngine::new(corpus.clone(), RetrievalConfig::default()));
        let aug = RecallAugmenter::new(config, corpus, engine, None);

        let baseline = vec![PageHit {
            opinion_id: Uuid::new_v4(),
            page_number: 1,
            text: "text".to_string(),
            case_name: "Strong v. Baseline".to_string(),
            appeal_no: String::new(),
            release_date: None,
            pdf_url: String::new(),
            origin: "CAFC".to_string(),
            precedential: true,
            en_banc: false,
            is_rule_36: false,
            is_landmark: false,
            citation_count: 0,
            rank: 0.9,
            provenance: "baseline".to_string(),
        }];
        let (out, telemetry) = aug.augment("alice eligibility and amgen enablement", baseline.clone()).await;
        assert_eq!(out.len(), baseline.len());
        assert!(!telemetry.triggered);
        assert_eq!(telemetry.skipped_reason.as_deref(), Some("triggers_not_met"));
    }

    #[tokio::test]
    async fn test_decomposition_is_additive() {
        let config = AugmentConfig {
            query_decompose_enabled: true,
            ..AugmentConfig::default()
        };
        let (store, _dir) = temp_store();
        let alice = opinion(Uuid::new_v4(), "Alice Corp. v. CLS Bank International", "SCOTUS", (2014, 6, 19));
        seed(&store, &alice, &["The abstract idea eligibility analysis controls here."]);
        let amgen = opinion(Uuid::new_v4(), "Amgen Inc. v. Sanofi", "SCOTUS", (2023, 5, 18));
        seed(&store, &amgen, &["Enablement requires the full scope of the claims."]);

        let corpus = Arc::new(store);
        let engine = Arc::new(RetrievalEngine::new(corpus.clone(), RetrievalConfig::default()));
        let aug = RecallAugmenter::new(config, corpus, engine.clone(), None);

        // Thin baseline: only the Alice page
        let baseline = engine.search_pages("abstract idea eligibility", None, 10, false, 2000).unwrap();
        assert!(!baseline.is_empty());
        let baseline_len = baseline.len();

        let (out, telemetry) = aug
            .augment("eligibility abstract idea alice and enablement under amgen", baseline.clone())
            .await;
        assert!(telemetry.triggered, "reasons: {:?}", telemetry.trigger_reasons);
        assert!(out.len() >= baseline_len, "augmentation must never remove candidates");
        for (i, hit) in baseline.iter().enumerate() {
            assert_eq!(out[i].opinion_id, hit.opinion_id, "baseline order preserved");
        }
    }

    struct FixedEmbedder(Vec<f32>);

    #[async_trait::async_trait]
    impl EmbeddingProvider for FixedEmbedder {
        async fn embed(&self, _text: &str) -> crate::errors::Result<Vec<f32>> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_semantic_fallback_excludes_baseline_ids() {
        let config = AugmentConfig {
            embed_recall_enabled: true,
            ..AugmentConfig::default()
        };
        let (store, _dir) = temp_store();
        let a = opinion(Uuid::new_v4(), "Near v. Neighbor", "CAFC", (2022, 1, 1));
        seed(&store, &a, &["semantically relevant passage"]);
        let b = opinion(Uuid::new_v4(), "Other v. Neighbor", "CAFC", (2022, 1, 1));
        seed(&store, &b, &["another semantically relevant passage"]);
        store.put_page_embedding(a.id, 1, &[1.0, 0.0]).unwrap();
        store.put_page_embedding(b.id, 1, &[0.9, 0.1]).unwrap();

        let corpus = Arc::new(store);
        let engine = Arc::new(RetrievalEngine::new(corpus.clone(), RetrievalConfig::default()));
        let aug = RecallAugmenter::new(
            config,
            corpus,
            engine.clone(),
            Some(Arc::new(FixedEmbedder(vec![1.0, 0.0]))),
        );

        // Baseline already contains opinion a's page; only b should be added
        let baseline = engine
            .search_pages("semantically relevant passage", Some(&[a.id]), 10, false, 2000)
            .unwrap();
        assert_eq!(baseline.len(), 1);
        let (out, telemetry) = aug.augment("unrelated wording entirely", baseline).await;
        assert!(telemetry.triggered);
        assert_eq!(telemetry.embed_candidates_added, 1);
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].opinion_id, b.id);
        assert_eq!(out[1].provenance, "semantic");
    }
}
