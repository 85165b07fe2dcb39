//! # Binding Verifier Module
//!
//! ## Purpose
//! Prevents misattribution of quotes. Parses the hidden citation markers the
//! model emits, *binds* each claimed quote to the claimed opinion before
//! accepting any quote match, verifies the quote against that opinion's
//! actual page text, and assigns a trust tier. A quote that exists in the
//! corpus but not in the claimed opinion is never silently reattached to a
//! different opinion; it is emitted as UNVERIFIED with a `binding_failed`
//! signal.
//!
//! ## Input/Output Specification
//! - **Input**: Raw answer text with `<!--CITE:opinion_id|page|"quote"-->`
//!   markers, the candidate pages retrieval produced
//! - **Output**: The rewritten answer (` [S<n>]` labels), Source records with
//!   tiers, per-citation verification records for audit, support audit counts
//!
//! ## Binding order
//! 1. Strict: look up the claimed `(opinion_id, page)` and verify the quote
//!    there under the declared normalization (>= 20 chars)
//! 2. Fuzzy: resolve the claimed reference as a case name against candidate
//!    opinions (lowest ambiguity wins; ties broken by recency then id), then
//!    verify the quote in that opinion; fuzzy results cap at MODERATE
//! 3. Failure: emit UNVERIFIED with a classified failure reason
//!
//! No suspension points: this module operates on already-materialized text.

use crate::errors::FailureReason;
use crate::ranking::{self, AuthorityType};
use crate::retrieval::PageHit;
use crate::text;
use crate::{BindingMethod, Source, Tier};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::OnceLock;

/// Minimum quote length after normalization; shorter quotes fail automatically.
pub const MIN_QUOTE_CHARS: usize = 20;

/// Cap applied to the numeric score whenever binding was fuzzy, preserving
/// the MODERATE ceiling.
const FUZZY_SCORE_CAP: u32 = 69;

/// A parsed citation marker from the model's answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CitationMarker {
    /// Claimed opinion id, or a claimed case name when the model lost the id
    pub opinion_ref: String,
    /// Claimed 1-based page number
    pub page_number: u32,
    /// Claimed verbatim quote
    pub quote: String,
    /// Byte offset of the marker in the answer text
    pub position: usize,
    /// Byte length of the raw marker text
    pub raw_len: usize,
}

/// Section classification of the passage around a quote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SectionType {
    Holding,
    Dicta,
    Dissent,
    Concurrence,
    Majority,
}

impl SectionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SectionType::Holding => "holding",
            SectionType::Dicta => "dicta",
            SectionType::Dissent => "dissent",
            SectionType::Concurrence => "concurrence",
            SectionType::Majority => "majority",
        }
    }
}

/// Per-citation verification record for the audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CitationVerification {
    pub citation_index: usize,
    pub page_id: Option<String>,
    pub opinion_id: Option<String>,
    pub tier: Tier,
    pub binding_method: BindingMethod,
    pub signals: Vec<String>,
    pub verified: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<FailureReason>,
}

/// Claim-support counts surfaced in debug output.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupportAudit {
    pub total_claims: usize,
    pub supported_claims: usize,
    pub unsupported_claims: usize,
}

/// The verifier's complete output for one answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifiedAnswer {
    pub answer_markdown: String,
    pub sources: Vec<Source>,
    pub verifications: Vec<CitationVerification>,
    pub support_audit: SupportAudit,
}

fn marker_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"<!--CITE:([^|]*)\|(\d+)\|"([^"]+)"-->"#).expect("static regex"))
}

fn leftover_marker_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<!--CITE:[^>]*-->").expect("static regex"))
}

/// Extract citation markers from the answer text. Markers claiming a page
/// below 1 are discarded here.
pub fn extract_markers(answer: &str) -> Vec<CitationMarker> {
    let mut markers = Vec::new();
    for caps in marker_regex().captures_iter(answer) {
        let whole = caps.get(0).expect("match");
        let Ok(page_number) = caps[2].parse::<u32>() else {
            continue;
        };
        if page_number < 1 {
            continue;
        }
        markers.push(CitationMarker {
            opinion_ref: caps[1].trim().to_string(),
            page_number,
            quote: caps[3].trim().to_string(),
            position: whole.start(),
            raw_len: whole.len(),
        });
    }
    markers
}

/// Strict quote verification: normalized substring containment with the
/// minimum-length gate.
pub fn verify_quote_strict(quote: &str, page_text: &str) -> bool {
    let norm_quote = text::normalize_for_verification(quote);
    if norm_quote.chars().count() < MIN_QUOTE_CHARS {
        return false;
    }
    text::normalize_for_verification(page_text).contains(&norm_quote)
}

/// Classify the passage around a quote as holding, dicta, dissent,
/// concurrence, or majority. Feeds confidence signals; does not directly
/// change the strict/fuzzy binding outcome.
pub fn detect_section_type(page_text: &str, quote: &str) -> (SectionType, Vec<String>) {
    static DISSENT: OnceLock<Regex> = OnceLock::new();
    static CONCURRENCE: OnceLock<Regex> = OnceLock::new();
    static DICTA: OnceLock<Regex> = OnceLock::new();
    static HOLDING: OnceLock<Regex> = OnceLock::new();

    let window = quote_window(page_text, quote, 400);
    let lower = window.to_lowercase();

    let dissent = DISSENT.get_or_init(|| Regex::new(r"respectfully dissent|i dissent").expect("static regex"));
    if dissent.is_match(&lower) {
        return (SectionType::Dissent, vec!["dissent_heuristic".to_string()]);
    }
    let concurrence = CONCURRENCE
        .get_or_init(|| Regex::new(r"concur in the result|i concur").expect("static regex"));
    if concurrence.is_match(&lower) {
        return (SectionType::Concurrence, vec!["concurrence_heuristic".to_string()]);
    }
    let dicta = DICTA
        .get_or_init(|| Regex::new(r"we note that even if|dicta|in passing").expect("static regex"));
    if dicta.is_match(&lower) {
        return (SectionType::Dicta, vec!["dicta_heuristic".to_string()]);
    }
    let holding = HOLDING.get_or_init(|| {
        Regex::new(r"we hold|for the foregoing reasons|reverse|affirm").expect("static regex")
    });
    if holding.is_match(&lower) {
        return (SectionType::Holding, vec!["holding_heuristic".to_string()]);
    }
    (SectionType::Majority, Vec::new())
}

/// Text window around the quote's location in the page, or the whole page
/// when the quote cannot be located.
fn quote_window(page_text: &str, quote: &str, radius: usize) -> String {
    if quote.is_empty() {
        return page_text.to_string();
    }
    let pattern = format!("(?i){}", regex::escape(quote));
    let Ok(re) = Regex::new(&pattern) else {
        return page_text.to_string();
    };
    let Some(m) = re.find(page_text) else {
        return page_text.to_string();
    };
    let start = floor_char_boundary(page_text, m.start().saturating_sub(radius));
    let end = ceil_char_boundary(page_text, (m.end() + radius).min(page_text.len()));
    page_text[start..end].to_string()
}

fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

fn ceil_char_boundary(s: &str, mut idx: usize) -> usize {
    while idx < s.len() && !s.is_char_boundary(idx) {
        idx += 1;
    }
    idx
}

/// Outcome of binding one marker.
#[derive(Debug, Clone)]
struct BindingOutcome {
    bound: Option<PageHit>,
    method: BindingMethod,
    section: SectionType,
    signals: Vec<String>,
    failure: Option<FailureReason>,
}

/// Resolve a marker's claim against the candidate pages.
fn bind_marker(marker: &CitationMarker, pages: &[PageHit]) -> BindingOutcome {
    if pages.is_empty() {
        return BindingOutcome {
            bound: None,
            method: BindingMethod::None,
            section: SectionType::Majority,
            signals: vec!["binding_failed".to_string()],
            failure: Some(FailureReason::NoCandidatePassages),
        };
    }

    let norm_quote = text::normalize_for_verification(&marker.quote);
    if norm_quote.chars().count() < MIN_QUOTE_CHARS {
        return BindingOutcome {
            bound: None,
            method: BindingMethod::None,
            section: SectionType::Majority,
            signals: vec!["binding_failed".to_string(), "quote_too_short".to_string()],
            failure: Some(FailureReason::TooShort),
        };
    }

    // Strict binding: the claimed (opinion_id, page) pair
    let claimed_page = pages.iter().find(|p| {
        p.opinion_id.to_string() == marker.opinion_ref && p.page_number == marker.page_number
    });
    if let Some(page) = claimed_page {
        if verify_quote_strict(&marker.quote, &page.text) {
            let (section, mut section_signals) = detect_section_type(&page.text, &marker.quote);
            let mut signals = vec!["case_bound".to_string(), "exact_match".to_string()];
            signals.append(&mut section_signals);
            return BindingOutcome {
                bound: Some(page.clone()),
                method: BindingMethod::Strict,
                section,
                signals,
                failure: None,
            };
        }
    }

    // Fuzzy case-name binding on the claimed reference
    if let Some(outcome) = bind_fuzzy(marker, pages) {
        return outcome;
    }

    // Classification of the failure, for telemetry
    let failure = classify_failure(marker, pages, claimed_page.is_some());
    BindingOutcome {
        bound: None,
        method: BindingMethod::None,
        section: SectionType::Majority,
        signals: vec!["binding_failed".to_string()],
        failure: Some(failure),
    }
}

/// Attempt fuzzy binding: the claimed reference interpreted as a case name.
/// The chosen opinion must contain every significant token of the claim;
/// among several matches, the fewest extra name tokens (lowest ambiguity)
/// wins, with ties broken by more recent release date and then stable id.
fn bind_fuzzy(marker: &CitationMarker, pages: &[PageHit]) -> Option<BindingOutcome> {
    let claimed_tokens = text::case_name_tokens(&marker.opinion_ref);
    if claimed_tokens.is_empty() {
        return None;
    }

    let mut by_opinion: HashMap<crate::OpinionId, Vec<&PageHit>> = HashMap::new();
    for page in pages {
        by_opinion.entry(page.opinion_id).or_default().push(page);
    }

    let mut candidates: Vec<(usize, &Vec<&PageHit>)> = Vec::new();
    for opinion_pages in by_opinion.values() {
        let name_tokens = text::case_name_tokens(&opinion_pages[0].case_name);
        let contains_all = claimed_tokens.iter().all(|t| name_tokens.contains(t));
        if contains_all {
            let ambiguity = name_tokens.len().saturating_sub(claimed_tokens.len());
            candidates.push((ambiguity, opinion_pages));
        }
    }
    if candidates.is_empty() {
        return None;
    }

    candidates.sort_by(|a, b| {
        a.0.cmp(&b.0)
            .then_with(|| b.1[0].release_date.cmp(&a.1[0].release_date))
            .then_with(|| a.1[0].opinion_id.cmp(&b.1[0].opinion_id))
    });

    let (_, opinion_pages) = &candidates[0];
    let mut ordered: Vec<&PageHit> = opinion_pages.to_vec();
    ordered.sort_by_key(|p| p.page_number);
    // Claimed page number first, then the rest of the opinion's candidates
    ordered.sort_by_key(|p| p.page_number != marker.page_number);

    for page in ordered {
        if verify_quote_strict(&marker.quote, &page.text) {
            let (section, mut section_signals) = detect_section_type(&page.text, &marker.quote);
            let mut signals = vec!["fuzzy_case_binding".to_string(), "exact_match".to_string()];
            signals.append(&mut section_signals);
            return Some(BindingOutcome {
                bound: Some(page.clone()),
                method: BindingMethod::Fuzzy,
                section,
                signals,
                failure: None,
            });
        }
    }
    None
}

/// Decide why a binding failed, in telemetry terms.
fn classify_failure(marker: &CitationMarker, pages: &[PageHit], claimed_page_found: bool) -> FailureReason {
    let quote = &marker.quote;

    if quote.contains("...") || quote.contains('\u{2026}') {
        return FailureReason::EllipsisFragment;
    }

    // Does the quote exist anywhere among the candidates?
    let mut found_same_opinion_other_page = false;
    let mut found_other_opinion = false;
    for page in pages {
        if verify_quote_strict(quote, &page.text) {
            if page.opinion_id.to_string() == marker.opinion_ref {
                if page.page_number != marker.page_number {
                    found_same_opinion_other_page = true;
                }
            } else {
                found_other_opinion = true;
            }
        }
    }
    if found_same_opinion_other_page {
        return FailureReason::WrongPage;
    }
    if found_other_opinion {
        return FailureReason::WrongCaseId;
    }

    // Near-miss classification against the claimed page, when we had one
    if claimed_page_found {
        if let Some(page) = pages.iter().find(|p| {
            p.opinion_id.to_string() == marker.opinion_ref && p.page_number == marker.page_number
        }) {
            let relaxed_quote = text::normalize_relaxed(quote);
            if relaxed_quote.chars().count() >= MIN_QUOTE_CHARS
                && text::normalize_relaxed(&page.text).contains(&relaxed_quote)
            {
                return FailureReason::NormalizationMismatch;
            }
            let ocr_quote = text::normalize_ocr(quote);
            if !ocr_quote.is_empty() && text::normalize_ocr(&page.text).contains(&ocr_quote) {
                return FailureReason::OcrArtifactMismatch;
            }
        }
    }

    FailureReason::QuoteNotFound
}

/// Tier and score assignment for a bound citation.
///
/// Additive score components: strict +40 / fuzzy +25, exact +30 (partial
/// +15), holding +15, dicta −5, post-2020 recency +10. Fuzzy bindings are
/// capped at 69 to preserve the MODERATE ceiling.
pub fn compute_tier(
    method: BindingMethod,
    section: SectionType,
    hit: &PageHit,
    signals: &mut Vec<String>,
) -> (Tier, u32) {
    if method == BindingMethod::None {
        return (Tier::Unverified, 0);
    }

    let mut score: i32 = match method {
        BindingMethod::Strict => 40,
        BindingMethod::Fuzzy => 25,
        BindingMethod::None => 0,
    };
    if signals.iter().any(|s| s == "exact_match") {
        score += 30;
    } else if signals.iter().any(|s| s == "partial_match") {
        score += 15;
    }
    match section {
        SectionType::Holding => score += 15,
        SectionType::Dicta => score -= 5,
        _ => {}
    }
    let recent = hit
        .release_date
        .map(|d| chrono::Datelike::year(&d) >= 2020)
        .unwrap_or(false);
    if recent {
        score += 10;
        if !signals.iter().any(|s| s == "recent") {
            signals.push("recent".to_string());
        }
    }

    let mut score = score.clamp(0, 100) as u32;
    if method == BindingMethod::Fuzzy {
        score = score.min(FUZZY_SCORE_CAP);
    }

    let demoted_section = matches!(
        section,
        SectionType::Dicta | SectionType::Dissent | SectionType::Concurrence
    );

    let tier = match method {
        BindingMethod::Fuzzy => {
            if demoted_section {
                Tier::Weak
            } else {
                Tier::Moderate
            }
        }
        BindingMethod::Strict => {
            if demoted_section {
                Tier::Weak
            } else {
                let (authority, _) = ranking::authority_type(hit);
                match authority {
                    AuthorityType::Statute
                    | AuthorityType::Scotus
                    | AuthorityType::CafcEnBanc
                    | AuthorityType::CafcPrecedential => Tier::Strong,
                    _ => Tier::Moderate,
                }
            }
        }
        BindingMethod::None => Tier::Unverified,
    };
    (tier, score)
}

fn dedup_key(opinion_id: &str, page_number: u32, quote: &str) -> (String, u32, String) {
    (
        opinion_id.to_string(),
        page_number,
        quote.chars().take(50).collect(),
    )
}

/// Bind and verify every marker, emit deduplicated sources, and rewrite the
/// answer text so supported sentences end with ` [S<n>]`. Unresolved markers
/// are stripped from the text; their failure details live only in the
/// verification records.
pub fn build_sources(answer: &str, markers: &[CitationMarker], pages: &[PageHit]) -> VerifiedAnswer {
    let mut sources: Vec<Source> = Vec::new();
    let mut verifications: Vec<CitationVerification> = Vec::new();
    let mut seen: HashMap<(String, u32, String), String> = HashMap::new();
    let mut replacements: Vec<(usize, usize, Option<String>)> = Vec::new();
    let mut sid_counter = 1usize;

    for (index, marker) in markers.iter().enumerate() {
        let outcome = bind_marker(marker, pages);
        match outcome.bound {
            Some(hit) => {
                let mut signals = outcome.signals.clone();
                let (tier, score) = compute_tier(outcome.method, outcome.section, &hit, &mut signals);
                let opinion_id = hit.opinion_id.to_string();
                let key = dedup_key(&opinion_id, hit.page_number, &marker.quote);

                let sid = if let Some(existing) = seen.get(&key) {
                    existing.clone()
                } else {
                    let sid = format!("S{}", sid_counter);
                    sid_counter += 1;
                    seen.insert(key, sid.clone());
                    sources.push(Source {
                        sid: sid.clone(),
                        opinion_id: opinion_id.clone(),
                        case_name: hit.case_name.clone(),
                        appeal_no: hit.appeal_no.clone(),
                        release_date: hit.release_date,
                        page_number: hit.page_number,
                        quote: text::truncate_chars(&marker.quote, 300),
                        viewer_url: format!("/pdf/{}?page={}", opinion_id, hit.page_number),
                        pdf_url: hit.pdf_url.clone(),
                        tier,
                        binding_method: outcome.method,
                        score,
                        signals: signals.clone(),
                        application_reason: String::new(),
                        explain: None,
                    });
                    sid
                };

                verifications.push(CitationVerification {
                    citation_index: index,
                    page_id: Some(format!("{}:{}", opinion_id, hit.page_number)),
                    opinion_id: Some(opinion_id),
                    tier,
                    binding_method: outcome.method,
                    signals,
                    verified: tier.is_verified(),
                    failure_reason: None,
                });
                replacements.push((marker.position, marker.raw_len, Some(sid)));
            }
            None => {
                // Emitted, but only as an explicitly unverified source
                let claimed_id = marker.opinion_ref.clone();
                let key = dedup_key(&claimed_id, marker.page_number, &marker.quote);
                if !seen.contains_key(&key) {
                    let sid = format!("S{}", sid_counter);
                    sid_counter += 1;
                    seen.insert(key, sid.clone());
                    sources.push(Source {
                        sid,
                        opinion_id: claimed_id.clone(),
                        case_name: String::new(),
                        appeal_no: String::new(),
                        release_date: None,
                        page_number: marker.page_number,
                        quote: text::truncate_chars(&marker.quote, 300),
                        viewer_url: String::new(),
                        pdf_url: String::new(),
                        tier: Tier::Unverified,
                        binding_method: BindingMethod::None,
                        score: 0,
                        signals: outcome.signals.clone(),
                        application_reason: String::new(),
                        explain: None,
                    });
                }
                verifications.push(CitationVerification {
                    citation_index: index,
                    page_id: None,
                    opinion_id: if claimed_id.is_empty() { None } else { Some(claimed_id) },
                    tier: Tier::Unverified,
                    binding_method: BindingMethod::None,
                    signals: outcome.signals,
                    verified: false,
                    failure_reason: outcome.failure,
                });
                replacements.push((marker.position, marker.raw_len, None));
            }
        }
    }

    // Rewrite from the end so earlier offsets stay valid
    let mut answer_markdown = answer.to_string();
    replacements.sort_by(|a, b| b.0.cmp(&a.0));
    for (position, len, sid) in replacements {
        let replacement = match sid {
            Some(sid) => format!(" [{}]", sid),
            None => String::new(),
        };
        answer_markdown.replace_range(position..position + len, &replacement);
    }
    let answer_markdown = leftover_marker_regex()
        .replace_all(&answer_markdown, "")
        .trim()
        .to_string();

    let supported = verifications.iter().filter(|v| v.verified).count();
    let support_audit = SupportAudit {
        total_claims: verifications.len(),
        supported_claims: supported,
        unsupported_claims: verifications.len() - supported,
    };

    VerifiedAnswer {
        answer_markdown,
        sources,
        verifications,
        support_audit,
    }
}

/// The fixed response when nothing in the corpus supports the query.
pub fn not_found_answer() -> VerifiedAnswer {
    VerifiedAnswer {
        answer_markdown: crate::generator::NOT_FOUND_ANSWER.to_string(),
        sources: Vec::new(),
        verifications: Vec::new(),
        support_audit: SupportAudit {
            total_claims: 0,
            supported_claims: 0,
            unsupported_claims: 1,
        },
    }
}

/// Retrieval-only fallback when the model is unavailable or timed out:
/// up to five top pages, each contributing a short exact substring as its
/// quote. Fallback sources are never tiered above MODERATE.
pub fn fallback_sources(pages: &[PageHit]) -> VerifiedAnswer {
    let mut sources = Vec::new();
    let mut verifications = Vec::new();

    for page in pages.iter().filter(|p| p.page_number >= 1).take(5) {
        let quote: String = text::truncate_chars(page.text.trim(), 200);
        if !verify_quote_strict(&quote, &page.text) {
            continue;
        }
        let (section, mut section_signals) = detect_section_type(&page.text, &quote);
        let mut signals = vec![
            "case_bound".to_string(),
            "exact_match".to_string(),
            "retrieval_fallback".to_string(),
        ];
        signals.append(&mut section_signals);
        let (tier, score) = compute_tier(BindingMethod::Strict, section, page, &mut signals);
        let tier = tier.min(Tier::Moderate);
        let score = score.min(FUZZY_SCORE_CAP);

        let sid = format!("S{}", sources.len() + 1);
        let opinion_id = page.opinion_id.to_string();
        verifications.push(CitationVerification {
            citation_index: sources.len(),
            page_id: Some(format!("{}:{}", opinion_id, page.page_number)),
            opinion_id: Some(opinion_id.clone()),
            tier,
            binding_method: BindingMethod::Strict,
            signals: signals.clone(),
            verified: true,
            failure_reason: None,
        });
        sources.push(Source {
            sid,
            opinion_id: opinion_id.clone(),
            case_name: page.case_name.clone(),
            appeal_no: page.appeal_no.clone(),
            release_date: page.release_date,
            page_number: page.page_number,
            quote,
            viewer_url: format!("/pdf/{}?page={}", opinion_id, page.page_number),
            pdf_url: page.pdf_url.clone(),
            tier,
            binding_method: BindingMethod::Strict,
            score,
            signals,
            application_reason: String::new(),
            explain: None,
        });
    }

    if sources.is_empty() {
        return not_found_answer();
    }

    let labels = sources
        .iter()
        .map(|s| format!("[{}]", s.sid))
        .collect::<Vec<_>>()
        .join(" ");
    let answer_markdown = format!(
        "**Relevant Excerpts Found**\n\nThe following excerpts from ingested opinions may be relevant to your query. {}",
        labels
    );
    let count = sources.len();

    VerifiedAnswer {
        answer_markdown,
        sources,
        verifications,
        support_audit: SupportAudit {
            total_claims: count,
            supported_claims: count,
            unsupported_claims: 0,
        },
    }
}
