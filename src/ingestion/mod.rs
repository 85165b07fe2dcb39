//! # Ingestion Module
//!
//! ## Purpose
//! The corpus-facing side of document ingestion: chunk assembly, hollow-PDF
//! gating, and batch processing of pending documents. PDF fetching, text
//! extraction, web search for new documents, and OCR recovery are external
//! collaborators; this module defines only the interfaces the core consumes.
//! Nothing here runs on the answering hot path.

pub mod pipeline;

pub use pipeline::{assemble_chunks, assess_density, ingest_pages, pdf_sha256, run_batch, BatchStats, IngestSummary, TextDensity};

use crate::errors::Result;
use crate::retrieval::PageHit;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Metadata accompanying a document handed to the ingester.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestMeta {
    pub case_name: String,
    pub appeal_no: String,
    pub release_date: Option<NaiveDate>,
    pub origin: String,
    pub cluster_id: Option<i64>,
    pub precedential: bool,
    pub en_banc: bool,
}

/// Result of an external ingestion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestResult {
    pub success: bool,
    pub document_id: Option<String>,
}

/// A case the web-search collaborator proposes for ingestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreparedCase {
    pub case_name: String,
    pub pdf_url: String,
    pub cluster_id: Option<i64>,
}

/// Outcome of a web-search pass over a query with thin local results.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebSearchOutcome {
    pub cases_to_ingest: Vec<PreparedCase>,
}

/// External collaborator: discovers new documents for a query the local
/// corpus answers poorly. Never on the answering hot path.
#[async_trait::async_trait]
pub trait WebSearchProvider: Send + Sync {
    async fn find_and_prepare_cases(
        &self,
        query: &str,
        local_results: &[PageHit],
    ) -> Result<WebSearchOutcome>;
}

/// External collaborator: fetches and extracts one document, then feeds it
/// to the corpus store.
#[async_trait::async_trait]
pub trait DocumentIngester: Send + Sync {
    async fn ingest_document_from_url(&self, url: &str, meta: IngestMeta) -> Result<IngestResult>;
}
