//! # Ranking Scorer Module
//!
//! ## Purpose
//! Precedence-aware composite scoring that surfaces the most authoritative and
//! on-point passages (statute / SCOTUS / en banc / precedential CAFC) and
//! demotes passages that merely mention controlling authority without
//! applying it.
//!
//! ## Input/Output Specification
//! - **Input**: Candidate pages with opinion metadata, baseline relevance
//! - **Output**: Composite scores with a full explain breakdown, ordered
//!   candidates, one-sentence application reasons
//!
//! ## Composite formula
//! `composite = relevance · authority_boost · gravity_factor ·
//! recency_factor · application_signal · framework_boost`
//!
//! Every function here is deterministic: identical inputs produce identical
//! scores and orderings.

use crate::retrieval::PageHit;
use crate::{Court, Tier};
use rayon::prelude::*;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Authority classes with their fixed boost table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorityType {
    Statute,
    #[serde(rename = "SCOTUS")]
    Scotus,
    CafcEnBanc,
    CafcPrecedential,
    PtabPrecedential,
    Nonprecedential,
    UnknownPrecedential,
    Unknown,
}

impl AuthorityType {
    pub fn boost(&self) -> f32 {
        match self {
            AuthorityType::Statute => 2.0,
            AuthorityType::Scotus => 1.8,
            AuthorityType::CafcEnBanc => 1.6,
            AuthorityType::CafcPrecedential => 1.3,
            AuthorityType::PtabPrecedential => 1.1,
            AuthorityType::Nonprecedential => 0.8,
            AuthorityType::UnknownPrecedential | AuthorityType::Unknown => 1.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AuthorityType::Statute => "statute",
            AuthorityType::Scotus => "SCOTUS",
            AuthorityType::CafcEnBanc => "CAFC_en_banc",
            AuthorityType::CafcPrecedential => "CAFC_precedential",
            AuthorityType::PtabPrecedential => "PTAB_precedential",
            AuthorityType::Nonprecedential => "nonprecedential",
            AuthorityType::UnknownPrecedential => "UNKNOWN_precedential",
            AuthorityType::Unknown => "unknown",
        }
    }
}

/// Named doctrinal frameworks recognized in passage text.
const FRAMEWORK_TERMS: &[&str] = &[
    // §101 eligibility
    "Alice", "Mayo", "Bilski", "Diehr", "Benson", "Flook",
    // §103 obviousness
    "KSR", "Graham", "TSM",
    // §112 disclosure
    "Nautilus", "Amgen", "Ariad", "Gentry", "Williamson",
    // Claim construction
    "Markman", "Teva", "Phillips", "Vitronics", "Innova",
    // PTAB reviewability
    "Cuozzo", "Thryv", "SAS",
    // Remedies
    "eBay", "Halo", "Octane", "Stryker",
    // DOE/estoppel
    "Festo", "Warner-Jenkinson", "Graver Tank",
    // Certificates of correction / reissue
    "certificate of correction", "reissue",
];

/// Case-name patterns that identify SCOTUS opinions when origin metadata is
/// missing or points at a generic ingestion source.
const SCOTUS_CASE_PATTERNS: &[&str] = &[
    "alice corp", "mayo collaborative", "ksr international", "ebay inc", "halo electronics",
    "octane fitness", "teva pharm", "markman v. westview", "bilski v. kappos", "cuozzo speed",
    "thryv, inc", "sas institute", "amgen inc. v. sanofi", "nautilus, inc", "festo corp",
    "warner-jenkinson", "graham v. john deere", "diamond v. diehr",
];

/// Controlling SCOTUS cases by doctrine, injected into thin candidate pools.
const CONTROLLING_SCOTUS_CASES: &[(&str, &[&str])] = &[
    ("101", &["Alice Corp. v. CLS Bank", "Mayo Collaborative Services v. Prometheus", "Bilski v. Kappos", "Diamond v. Diehr"]),
    ("103", &["KSR International Co. v. Teleflex Inc.", "Graham v. John Deere Co."]),
    ("112", &["Amgen Inc. v. Sanofi", "Nautilus, Inc. v. Biosig Instruments, Inc."]),
    ("claim_construction", &["Markman v. Westview Instruments, Inc.", "Teva Pharmaceuticals USA, Inc. v. Sandoz, Inc."]),
    ("ptab", &["Cuozzo Speed Technologies, LLC v. Lee", "Thryv, Inc. v. Click-to-Call Technologies, LP", "SAS Institute Inc. v. Iancu"]),
    ("remedies", &["eBay Inc. v. MercExchange, L.L.C.", "Halo Electronics, Inc. v. Pulse Electronics, Inc.", "Octane Fitness, LLC v. ICON Health & Fitness, Inc."]),
    ("doe", &["Festo Corporation v. Shoketsu Kinzoku Kogyo Kabushiki Co.", "Warner-Jenkinson Company, Inc. v. Hilton Davis Chemical Co."]),
    ("certificate_correction", &["Southwest Software, Inc. v. Harlequin Inc.", "H-W Tech., L.C. v. Overstock.com, Inc."]),
];

/// Cases that *define* a controlling framework, with their boost.
const CONTROLLING_CASE_BOOSTS: &[(&str, f32)] = &[
    ("alice", 1.25),
    ("mayo", 1.20),
    ("bilski", 1.15),
    ("ksr", 1.25),
    ("graham", 1.15),
    ("markman", 1.25),
    ("teva", 1.20),
    ("phillips", 1.20),
    ("nautilus", 1.20),
    ("amgen", 1.25),
    ("ebay", 1.25),
    ("halo", 1.20),
    ("octane", 1.20),
    ("cuozzo", 1.20),
    ("thryv", 1.20),
    ("sas", 1.20),
    ("festo", 1.20),
    ("warner-jenkinson", 1.15),
];

/// Breakdown of the applies-vs-mentions signal for one passage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationBreakdown {
    /// 0 = none, 1 = moderate findings language, 2 = strong holding language
    pub holding_indicator: u8,
    pub analysis_depth: f32,
    pub framework_reference: u8,
    pub frameworks_detected: Vec<String>,
    pub proximity_score: f32,
    /// Final signal in [0.8, 1.5]
    pub application_signal: f32,
}

/// Full composite-score explain record attached to emitted sources.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreExplain {
    pub relevance_score: f32,
    pub authority_boost: f32,
    pub authority_type: AuthorityType,
    pub court_signal: Option<String>,
    pub gravity_factor: f32,
    pub recency_factor: f32,
    pub application_signal: f32,
    pub application_breakdown: ApplicationBreakdown,
    pub framework_boost: f32,
    pub composite_score: f32,
}

fn regex(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).expect("static regex"))
}

/// Normalize the origin label to a court, tracking whether a case-name
/// fallback inferred the court.
///
/// Priority: trust origin metadata first; for known ingestion sources check
/// SCOTUS case-name patterns before defaulting to CAFC; with no usable origin,
/// case names may promote to SCOTUS, otherwise UNKNOWN.
pub fn normalize_origin(origin: &str, case_name: &str) -> (Court, Option<&'static str>) {
    let origin_upper = origin.trim().to_uppercase();
    let case_lower = case_name.to_lowercase();
    let name_is_scotus = SCOTUS_CASE_PATTERNS.iter().any(|p| case_lower.contains(p));

    match origin_upper.as_str() {
        "SCOTUS" => (Court::Scotus, None),
        "PTAB" => (Court::Ptab, None),
        "CAFC" | "CAFC_WEBSITE" | "FEDERAL CIRCUIT" => (Court::Cafc, None),
        "COURTLISTENER_API" | "WEB_SEARCH" | "DCT" => {
            if name_is_scotus {
                (Court::Scotus, Some("court_inferred_from_name"))
            } else {
                (Court::Cafc, None)
            }
        }
        "" | "UNKNOWN" => {
            if name_is_scotus {
                (Court::Scotus, Some("court_inferred_from_name"))
            } else {
                (Court::Unknown, None)
            }
        }
        _ => {
            if name_is_scotus {
                (Court::Scotus, Some("court_inferred_from_name"))
            } else {
                (Court::Unknown, None)
            }
        }
    }
}

/// Authority classification of a candidate page.
pub fn authority_type(hit: &PageHit) -> (AuthorityType, Option<&'static str>) {
    let (court, signal) = normalize_origin(&hit.origin, &hit.case_name);
    let lower = hit.case_name.to_lowercase();
    if lower.contains("u.s.c.") || hit.case_name.contains('§') {
        return (AuthorityType::Statute, signal);
    }
    let authority = match court {
        Court::Scotus => AuthorityType::Scotus,
        Court::Ptab => {
            if hit.precedential {
                AuthorityType::PtabPrecedential
            } else {
                AuthorityType::Nonprecedential
            }
        }
        Court::Unknown => {
            if hit.precedential {
                AuthorityType::UnknownPrecedential
            } else {
                AuthorityType::Unknown
            }
        }
        Court::Cafc => {
            if hit.en_banc {
                AuthorityType::CafcEnBanc
            } else if hit.precedential {
                AuthorityType::CafcPrecedential
            } else {
                AuthorityType::Nonprecedential
            }
        }
    };
    (authority, signal)
}

/// Recency factor in {1.10, 1.05, 1.00, 0.98, 0.95} by age bucket.
pub fn recency_factor(release_date: Option<chrono::NaiveDate>) -> f32 {
    let Some(date) = release_date else {
        return 1.0;
    };
    let years_old = chrono::Utc::now().date_naive().years_since(date).unwrap_or(0);
    match years_old {
        0..=2 => 1.10,
        3..=5 => 1.05,
        6..=10 => 1.00,
        11..=20 => 0.98,
        _ => 0.95,
    }
}

/// Gravity factor in [0.60, 1.00] from en banc, landmark, and citation count.
pub fn gravity_factor(hit: &PageHit) -> f32 {
    let mut base: f32 = 0.85;
    if hit.en_banc {
        base += 0.10;
    }
    if hit.is_landmark {
        base += 0.05;
    }
    if hit.citation_count > 100 {
        base += 0.05;
    } else if hit.citation_count > 50 {
        base += 0.03;
    }
    base.clamp(0.60, 1.0)
}

/// Holding language strength: 2 strong, 1 moderate, 0 none.
pub fn holding_indicator(text: &str) -> u8 {
    static STRONG: OnceLock<Regex> = OnceLock::new();
    static MODERATE: OnceLock<Regex> = OnceLock::new();
    let lower = text.to_lowercase();
    let strong = regex(
        &STRONG,
        r"\bwe\s+hold\b|\bwe\s+conclude\b|\bwe\s+reverse\b|\bwe\s+affirm\b|\btherefore\s*,?\s*we\b|\baccordingly\s*,?\s*we\s+(hold|conclude|reverse|affirm)\b|\bfor\s+the\s+foregoing\s+reasons\b",
    );
    if strong.is_match(&lower) {
        return 2;
    }
    let moderate = regex(
        &MODERATE,
        r"\bthe\s+court\s+finds\b|\bwe\s+agree\b|\bwe\s+determine\b|\bwe\s+find\s+that\b|\bit\s+is\s+clear\s+that\b|\bwe\s+are\s+persuaded\b",
    );
    if moderate.is_match(&lower) {
        1
    } else {
        0
    }
}

/// Analysis depth in [0, 1] from length, reasoning markers, and citation
/// density.
pub fn analysis_depth(text: &str) -> f32 {
    if text.is_empty() {
        return 0.0;
    }
    static REASONING: OnceLock<Regex> = OnceLock::new();
    static CITATIONS: OnceLock<Regex> = OnceLock::new();
    let lower = text.to_lowercase();

    let base = (text.len() as f32 / 5000.0).min(1.0);

    let reasoning = regex(
        &REASONING,
        r"\bbecause\b|\btherefore\b|\bthus\b|\bhence\b|\banalysis\b|\breasoning\b|\bunder\s+this\s+standard\b|\bapplying\s+this\s+(test|standard|framework)\b",
    );
    let structure_boost = 0.1 * reasoning.find_iter(&lower).map(|m| m.as_str()).collect::<std::collections::HashSet<_>>().len() as f32;

    let citation_re = regex(&CITATIONS, r"\d+\s+F\.\s*\d*d?\s+\d+|\d+\s+U\.S\.\s+\d+");
    let citation_boost = (citation_re.find_iter(text).count() as f32 * 0.02).min(0.2);

    (base + structure_boost + citation_boost).min(1.0)
}

fn framework_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        let alternation = FRAMEWORK_TERMS
            .iter()
            .map(|t| regex::escape(&t.to_lowercase()))
            .collect::<Vec<_>>()
            .join("|");
        Regex::new(&format!(r"\b({})\b", alternation)).expect("static regex")
    })
}

/// Detect framework mentions; 1 when any framework term is present.
pub fn detect_framework_reference(text: &str) -> (u8, Vec<String>) {
    let lower = text.to_lowercase();
    let mut detected: Vec<String> = Vec::new();
    for m in framework_regex().find_iter(&lower) {
        if let Some(term) = FRAMEWORK_TERMS
            .iter()
            .find(|t| t.to_lowercase() == m.as_str())
        {
            if !detected.iter().any(|d| d == term) {
                detected.push((*term).to_string());
            }
        }
    }
    if detected.is_empty() {
        (0, detected)
    } else {
        (1, detected)
    }
}

/// Proximity between a framework mention and holding language, in [0, 1].
pub fn proximity_score(text: &str) -> f32 {
    if text.is_empty() {
        return 0.0;
    }
    static HOLDING: OnceLock<Regex> = OnceLock::new();
    let lower = text.to_lowercase();

    let framework_positions: Vec<i64> = framework_regex()
        .find_iter(&lower)
        .map(|m| m.start() as i64)
        .collect();
    if framework_positions.is_empty() {
        return 0.0;
    }

    let holding = regex(
        &HOLDING,
        r"\bwe\s+hold\b|\bwe\s+conclude\b|\bapplying\b|\bthe\s+court\s+finds\b|\bwe\s+agree\b",
    );
    let holding_positions: Vec<i64> = holding.find_iter(&lower).map(|m| m.start() as i64).collect();
    if holding_positions.is_empty() {
        return 0.0;
    }

    let mut min_distance = i64::MAX;
    for f in &framework_positions {
        for h in &holding_positions {
            min_distance = min_distance.min((f - h).abs());
        }
    }
    match min_distance {
        d if d < 100 => 1.0,
        d if d < 300 => 0.7,
        d if d < 500 => 0.4,
        d if d < 1000 => 0.2,
        _ => 0.0,
    }
}

/// Full applies-vs-mentions signal, capped to [0.8, 1.5].
///
/// Component weights yield a maximum boost of 0.5 over the 1.0 baseline;
/// passages with no framework, no holding language, and shallow analysis are
/// penalized to 0.8 (mention-only).
pub fn application_signal(text: &str) -> ApplicationBreakdown {
    let holding = holding_indicator(text);
    let depth = analysis_depth(text);
    let (framework_ref, frameworks_detected) = detect_framework_reference(text);
    let proximity = proximity_score(text);

    let boost = 0.15 * holding as f32 + 0.10 * depth + 0.05 * framework_ref as f32 + 0.05 * proximity;
    let mut raw_signal = 1.0 + boost.min(0.50);
    if framework_ref == 0 && holding == 0 && depth < 0.3 {
        raw_signal = 0.8;
    }
    let signal = raw_signal.clamp(0.8, 1.5);

    ApplicationBreakdown {
        holding_indicator: holding,
        analysis_depth: depth,
        framework_reference: framework_ref,
        frameworks_detected,
        proximity_score: proximity,
        application_signal: signal,
    }
}

/// Boost for cases that are themselves the controlling authority for a
/// framework (Alice for §101, Markman for claim construction, ...).
pub fn framework_boost(case_name: &str) -> f32 {
    let lower = case_name.to_lowercase();
    for (pattern, boost) in CONTROLLING_CASE_BOOSTS {
        if lower.contains(pattern) {
            return *boost;
        }
    }
    1.0
}

/// Classify a query into a doctrine tag for framework injection.
pub fn classify_doctrine_tag(query: &str) -> Option<&'static str> {
    let q = query.to_lowercase();
    let token = |t: &str| {
        Regex::new(&format!(r"\b{}\b", regex::escape(t)))
            .map(|re| re.is_match(&q))
            .unwrap_or(false)
    };

    if ["abstract idea", "patent eligible", "inventive concept", "law of nature", "natural phenomena"]
        .iter()
        .any(|t| q.contains(t))
        || ["101", "alice", "mayo"].into_iter().any(token)
    {
        return Some("101");
    }
    if ["obvious", "motivation to combine", "teaching suggestion"].iter().any(|t| q.contains(t))
        || ["103", "ksr", "graham", "tsm"].into_iter().any(token)
    {
        return Some("103");
    }
    if ["enablement", "written description", "indefinite"].iter().any(|t| q.contains(t))
        || ["112", "amgen", "nautilus", "ariad"].into_iter().any(token)
    {
        return Some("112");
    }
    if ["certificate of correction", "certificates of correction", "retroactive effect"]
        .iter()
        .any(|t| q.contains(t))
        || ["252", "254", "255", "reissue"].into_iter().any(token)
    {
        return Some("certificate_correction");
    }
    if ["claim construction", "markman", "teva", "phillips", "intrinsic evidence", "specification"]
        .iter()
        .any(|t| q.contains(t))
    {
        return Some("claim_construction");
    }
    if ["ptab", "ipr", "inter partes", "cuozzo", "thryv", "sas", "institution", "reviewability"]
        .iter()
        .any(|t| q.contains(t))
    {
        return Some("ptab");
    }
    if [
        "injunction", "ebay", "halo", "willful", "enhanced damage", "octane", "exceptional", "fee",
        "damages", "royalty", "apportionment", "reasonable royalty",
    ]
    .iter()
    .any(|t| q.contains(t))
    {
        return Some("remedies");
    }
    if ["doctrine of equivalents", "prosecution history"].iter().any(|t| q.contains(t))
        || ["doe", "estoppel", "festo", "warner-jenkinson"].into_iter().any(token)
    {
        return Some("doe");
    }
    None
}

/// Case-name patterns of the controlling SCOTUS authorities for a doctrine,
/// used to inject missing framework candidates into the pool.
pub fn controlling_framework_candidates(doctrine_tag: Option<&str>) -> &'static [&'static str] {
    let Some(tag) = doctrine_tag else {
        return &[];
    };
    CONTROLLING_SCOTUS_CASES
        .iter()
        .find(|(d, _)| *d == tag)
        .map(|(_, cases)| *cases)
        .unwrap_or(&[])
}

/// Compute the composite score and explain breakdown for one candidate.
pub fn compute_composite(relevance: f32, hit: &PageHit) -> ScoreExplain {
    let (authority, court_signal) = authority_type(hit);
    let gravity = gravity_factor(hit);
    let recency = recency_factor(hit.release_date);
    let breakdown = application_signal(&hit.text);
    let fw_boost = framework_boost(&hit.case_name);

    let composite = relevance
        * authority.boost()
        * gravity
        * recency
        * breakdown.application_signal
        * fw_boost;

    ScoreExplain {
        relevance_score: relevance,
        authority_boost: authority.boost(),
        authority_type: authority,
        court_signal: court_signal.map(|s| s.to_string()),
        gravity_factor: gravity,
        recency_factor: recency,
        application_signal: breakdown.application_signal,
        application_breakdown: breakdown,
        framework_boost: fw_boost,
        composite_score: composite,
    }
}

/// Squash a retrieval rank into a [0, 1) relevance value.
pub fn relevance_from_rank(rank: f32) -> f32 {
    let rank = rank.max(0.0);
    rank / (rank + 1.0)
}

/// Baseline relevance for an emitted source, derived from its verification
/// score and tier.
pub fn relevance_from_verification(score: u32, tier: Tier) -> f32 {
    let mut base = if score > 0 { score as f32 / 100.0 } else { 0.5 };
    match tier {
        Tier::Strong => base = base.max(0.7),
        Tier::Moderate => base = base.max(0.5),
        _ => {}
    }
    base
}

/// Score and order candidates by composite score, descending. Scoring runs in
/// parallel; the final ordering is deterministic (composite desc, then stable
/// id order).
pub fn rank_candidates(hits: Vec<PageHit>) -> Vec<(PageHit, ScoreExplain)> {
    let mut scored: Vec<(PageHit, ScoreExplain)> = hits
        .into_par_iter()
        .map(|hit| {
            let explain = compute_composite(relevance_from_rank(hit.rank), &hit);
            (hit, explain)
        })
        .collect();
    scored.sort_by(|a, b| {
        b.1.composite_score
            .partial_cmp(&a.1.composite_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.opinion_id.cmp(&b.0.opinion_id))
            .then_with(|| a.0.page_number.cmp(&b.0.page_number))
    });
    scored
}

/// One-sentence "why this case" explanation derived from the explain
/// breakdown.
pub fn application_reason(explain: &ScoreExplain, case_name: &str) -> String {
    let mut reasons: Vec<String> = Vec::new();

    match explain.authority_type {
        AuthorityType::Scotus => reasons.push("Supreme Court precedent".to_string()),
        AuthorityType::CafcEnBanc => reasons.push("En banc Federal Circuit decision".to_string()),
        AuthorityType::Statute => reasons.push("Statutory authority".to_string()),
        _ => {}
    }

    match explain.application_breakdown.holding_indicator {
        2 => reasons.push("majority holding language".to_string()),
        1 => reasons.push("court findings language".to_string()),
        _ => {}
    }

    if !explain.application_breakdown.frameworks_detected.is_empty() {
        let frameworks = explain
            .application_breakdown
            .frameworks_detected
            .iter()
            .take(3)
            .cloned()
            .collect::<Vec<_>>()
            .join("/");
        reasons.push(format!("applies {}", frameworks));
    }

    if explain.application_breakdown.analysis_depth > 0.7 {
        reasons.push("detailed legal analysis".to_string());
    }

    if reasons.is_empty() {
        if case_name.is_empty() {
            return String::new();
        }
        return "Relevant to query based on case content.".to_string();
    }
    format!("{}.", reasons.join("; "))
}
