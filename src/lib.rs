//! # Grounded Citation Retrieval & Verification Core
//!
//! ## Overview
//! This library implements the retrieval, grounded generation, and citation
//! verification core of a legal research assistant for U.S. Federal Circuit
//! and Supreme Court patent opinions. Given a natural-language question and a
//! corpus of ingested opinions (pages and chunks), it retrieves candidate
//! passages, calls an external language model under strict grounding rules,
//! and then binds, verifies, and tiers every citation the model produces
//! against the actual corpus text.
//!
//! ## Architecture
//! The system is composed of several key modules:
//! - `corpus`: Opinion/page/chunk storage with precomputed lexical vectors
//! - `text`: Normalization, tokenization, and similarity primitives
//! - `retrieval`: Lexical search with hybrid ranking and cursor pagination
//! - `augment`: Additive recall augmentation (decomposition + semantic fallback)
//! - `ranking`: Authority/recency/application-signal composite scoring
//! - `generator`: Context assembly and the quote-first model protocol
//! - `binding`: Case-quote binding verification and citation tiering
//! - `audit`: Query-run recording, replay packets, retention, circuit breaker
//! - `telemetry`: Verification metrics, latency percentiles, batch evals
//! - `pipeline`: Per-request orchestration of the above
//! - `api`: REST surface (query, chat, search, replay)
//! - `ingestion`: Collaborator interfaces and chunk assembly
//! - `config`: Configuration management and settings
//! - `errors`: Centralized error handling and types
//!
//! ## Input/Output Specification
//! - **Input**: Natural-language questions, an ingested opinion corpus
//! - **Output**: Markdown answers whose citations are either proven against a
//!   specific source passage or explicitly marked unverified
//! - **Determinism**: Scoring, binding, tiering, and corpus versioning are
//!   pure functions of their inputs; the model call is the only
//!   non-deterministic step and is captured for replay

// Core modules
pub mod config;
pub mod errors;
pub mod text;
pub mod corpus;
pub mod retrieval;
pub mod augment;
pub mod ranking;
pub mod generator;
pub mod binding;
pub mod audit;
pub mod telemetry;
pub mod pipeline;
pub mod ingestion;
pub mod api;

// Utilities
pub mod utils;

// Re-exports for convenience
pub use config::Config;
pub use errors::{CoreError, FailureReason, Result};
pub use pipeline::{QueryPipeline, QueryResponse};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Unique identifier for opinions
pub type OpinionId = Uuid;

/// Court that issued an opinion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Court {
    Scotus,
    Cafc,
    Ptab,
    Unknown,
}

impl Court {
    pub fn as_str(&self) -> &'static str {
        match self {
            Court::Scotus => "SCOTUS",
            Court::Cafc => "CAFC",
            Court::Ptab => "PTAB",
            Court::Unknown => "UNKNOWN",
        }
    }
}

/// Four-level grading of citation trust
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Unverified,
    Weak,
    Moderate,
    Strong,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Strong => "strong",
            Tier::Moderate => "moderate",
            Tier::Weak => "weak",
            Tier::Unverified => "unverified",
        }
    }

    /// Whether this tier counts toward verified citation totals.
    pub fn is_verified(&self) -> bool {
        !matches!(self, Tier::Unverified)
    }
}

/// How a citation marker was resolved to a corpus passage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindingMethod {
    Strict,
    Fuzzy,
    None,
}

impl BindingMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            BindingMethod::Strict => "strict",
            BindingMethod::Fuzzy => "fuzzy",
            BindingMethod::None => "none",
        }
    }
}

/// A single court decision (one PDF) with metadata. Unit of authority.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Opinion {
    /// Opaque identifier
    pub id: OpinionId,
    /// Case name, e.g. "Alice Corp. v. CLS Bank International"
    pub case_name: String,
    /// Appeal or docket number
    pub appeal_no: String,
    /// Release date
    pub release_date: Option<NaiveDate>,
    /// Raw origin label from ingestion (SCOTUS, CAFC, courtlistener_api, ...)
    pub origin: String,
    /// Precedential flag
    pub precedential: bool,
    /// En banc flag
    pub en_banc: bool,
    /// External system's stable identifier for deduplication
    pub cluster_id: Option<i64>,
    /// Source PDF URL (unique)
    pub pdf_url: String,
    /// SHA-256 of the fetched PDF, when known
    pub pdf_sha256: Option<String>,
    /// Whether pages and chunks have been materialized
    pub ingested: bool,
    /// Rule 36 summary affirmance flag
    pub is_rule_36: bool,
    /// Authoring judge, when known
    pub author_judge: Option<String>,
    /// Landmark-case flag (curated list)
    pub is_landmark: bool,
    /// Citation count from the external citator
    pub citation_count: u32,
    /// Last metadata update
    pub updated_at: DateTime<Utc>,
}

/// A single page of an opinion. Unit of citation locality.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page {
    /// Owning opinion
    pub opinion_id: OpinionId,
    /// 1-based page number
    pub page_number: u32,
    /// Extracted text
    pub text: String,
    /// Lexical index vector, maintained in lockstep with `text`
    pub lexemes: text::LexVector,
}

/// A coalescence of consecutive pages. Unit of retrieval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    /// Owning opinion
    pub opinion_id: OpinionId,
    /// 0-based chunk index within the opinion
    pub chunk_index: u32,
    /// First page covered (1-based)
    pub page_start: u32,
    /// Last page covered (inclusive)
    pub page_end: u32,
    /// Concatenated page text
    pub text: String,
    /// Lexical index vector, maintained in lockstep with `text`
    pub lexemes: text::LexVector,
}

/// An emitted citation: the user-visible record of one verified (or
/// explicitly unverified) quote.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    /// Monotonic citation label within one answer: "S1", "S2", ...
    pub sid: String,
    /// Bound opinion id (the claimed id for failed bindings)
    pub opinion_id: String,
    pub case_name: String,
    pub appeal_no: String,
    pub release_date: Option<NaiveDate>,
    pub page_number: u32,
    /// The verified quote text (claimed quote for failed bindings)
    pub quote: String,
    /// In-app viewer deep link
    pub viewer_url: String,
    pub pdf_url: String,
    pub tier: Tier,
    pub binding_method: BindingMethod,
    /// Confidence score in [0, 100]
    pub score: u32,
    /// Binding/verification signals, e.g. "case_bound", "exact_match"
    pub signals: Vec<String>,
    /// One-sentence human explanation derived from ranking signals
    pub application_reason: String,
    /// Composite-score breakdown, when ranking ran for this source
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explain: Option<ranking::ScoreExplain>,
}

/// Application state shared across request handlers.
///
/// Explicitly constructed in `main.rs` and injected into the API layer; the
/// process keeps no hidden global mutable state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<config::Config>,
    pub pipeline: Arc<pipeline::QueryPipeline>,
    pub corpus: Arc<corpus::CorpusStore>,
    pub recorder: Arc<audit::AuditRecorder>,
    pub telemetry: Arc<telemetry::TelemetryStore>,
    pub rate_limiter: Arc<utils::LeakyBucket>,
}
