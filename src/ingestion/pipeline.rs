//! # Ingestion Pipeline
//!
//! Chunk assembly, hollow-document gating, and the batch loop that claims
//! pending documents and indexes their extracted pages. The density gate
//! keeps image-only PDFs out of the lexical index; they wait for OCR
//! recovery instead.

use crate::corpus::CorpusStore;
use crate::errors::Result;
use crate::text::{self, LexVector};
use crate::{Chunk, Opinion, OpinionId};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Pages per chunk.
pub const CHUNK_SIZE_PAGES: usize = 2;
/// Chunks with less text than this are dropped.
pub const MIN_CHUNK_CHARS: usize = 100;
/// Hollow gate: average chars per page for multi-page documents.
pub const MIN_CHARS_PER_PAGE: usize = 200;
/// Hollow gate: total characters.
pub const MIN_TOTAL_CHARS: usize = 500;

/// Extraction density assessment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextDensity {
    pub total_chars: usize,
    pub page_count: usize,
    pub chars_per_page: f64,
    pub is_hollow: bool,
}

/// Outcome of indexing one document's pages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestSummary {
    pub indexed: bool,
    pub ocr_required: bool,
    pub page_count: usize,
    pub chunk_count: usize,
}

/// Batch processing counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchStats {
    pub claimed: usize,
    pub indexed: usize,
    pub hollow: usize,
    pub failed: usize,
}

/// SHA-256 of fetched document bytes, recorded as the opinion content hash.
pub fn pdf_sha256(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Judge whether an extraction is hollow (image-only or near-empty).
pub fn assess_density(pages: &[String]) -> TextDensity {
    let total_chars: usize = pages.iter().map(|p| p.len()).sum();
    let page_count = pages.len();
    let chars_per_page = if page_count > 0 {
        total_chars as f64 / page_count as f64
    } else {
        0.0
    };
    let is_hollow = (page_count > 1 && (chars_per_page as usize) < MIN_CHARS_PER_PAGE)
        || total_chars < MIN_TOTAL_CHARS;
    TextDensity {
        total_chars,
        page_count,
        chars_per_page,
        is_hollow,
    }
}

/// Coalesce consecutive pages into chunks of `chunk_size` pages, dropping
/// near-empty chunks.
pub fn assemble_chunks(opinion_id: OpinionId, pages: &[String], chunk_size: usize) -> Vec<Chunk> {
    let chunk_size = chunk_size.max(1);
    let mut chunks = Vec::new();
    let mut chunk_index = 0u32;
    for (i, window) in pages.chunks(chunk_size).enumerate() {
        let page_start = (i * chunk_size + 1) as u32;
        let page_end = (i * chunk_size + window.len()) as u32;
        let chunk_text = window.join("\n\n");
        if chunk_text.trim().len() <= MIN_CHUNK_CHARS {
            continue;
        }
        chunks.push(Chunk {
            opinion_id,
            chunk_index,
            page_start,
            page_end,
            text: chunk_text.clone(),
            lexemes: LexVector::build(&chunk_text),
        });
        chunk_index += 1;
    }
    chunks
}

/// Clean and index one document's extracted pages. Hollow documents are not
/// indexed; they are reported as needing OCR.
pub fn ingest_pages(
    store: &CorpusStore,
    opinion_id: OpinionId,
    raw_pages: Vec<String>,
) -> Result<IngestSummary> {
    let pages: Vec<String> = raw_pages.iter().map(|p| text::cleanup_hyphenation(p)).collect();
    let density = assess_density(&pages);
    if density.is_hollow {
        tracing::info!(
            %opinion_id,
            total_chars = density.total_chars,
            pages = density.page_count,
            "hollow document, deferring to OCR recovery"
        );
        return Ok(IngestSummary {
            indexed: false,
            ocr_required: true,
            page_count: density.page_count,
            chunk_count: 0,
        });
    }

    let chunks = assemble_chunks(opinion_id, &pages, CHUNK_SIZE_PAGES);
    let chunk_count = chunks.len();
    store.replace_content(opinion_id, &pages, &chunks)?;
    tracing::info!(%opinion_id, pages = pages.len(), chunks = chunk_count, "document indexed");
    Ok(IngestSummary {
        indexed: true,
        ocr_required: false,
        page_count: pages.len(),
        chunk_count,
    })
}

/// Claim up to `limit` pending documents and index whatever the fetcher
/// extracts for each. Claims are always released, including on failure.
pub fn run_batch<F>(store: &CorpusStore, worker: &str, limit: usize, mut fetch: F) -> Result<BatchStats>
where
    F: FnMut(&Opinion) -> Result<Vec<String>>,
{
    let claimed = store.claim_pending(limit, worker)?;
    let mut stats = BatchStats {
        claimed: claimed.len(),
        ..BatchStats::default()
    };
    for opinion in claimed {
        let outcome = fetch(&opinion).and_then(|pages| ingest_pages(store, opinion.id, pages));
        match outcome {
            Ok(summary) if summary.indexed => stats.indexed += 1,
            Ok(_) => stats.hollow += 1,
            Err(e) => {
                stats.failed += 1;
                tracing::warn!(opinion_id = %opinion.id, error = %e, "batch ingest failed");
            }
        }
        store.release_claim(opinion.id)?;
    }
    Ok(stats)
}
