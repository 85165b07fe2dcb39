//! # Corpus Store Module
//!
//! ## Purpose
//! Persistent storage for opinions, pages, and chunks with precomputed
//! lexical index vectors, using an embedded database. This module is the
//! exclusive owner of Opinion/Page/Chunk mutation; every other component
//! reads through its query interface.
//!
//! ## Input/Output Specification
//! - **Input**: Opinion metadata, extracted page text, assembled chunks
//! - **Output**: Point lookups, full iteration for search, corpus snapshots
//! - **Storage**: Sled trees (`opinions`, `pages`, `chunks`,
//!   `page_embeddings`, `meta`) with bincode records, optionally gzipped
//!
//! ## Invariants
//! - `(pdf_url)` unique; `cluster_id` unique when present
//! - `(opinion, page_number)` unique; citable pages have `page_number >= 1`
//! - `(opinion, chunk_index)` unique; `page_start <= page_end`, `page_start >= 1`
//! - Lexical index vectors are rebuilt whenever text is written
//! - The corpus version id is a pure function of corpus state, cached briefly

use crate::config::StorageConfig;
use crate::errors::{CoreError, Result};
use crate::text::LexVector;
use crate::{Chunk, Opinion, OpinionId, Page};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::{Read, Write};
use std::time::{Duration, Instant};
use uuid::Uuid;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Snapshot of corpus state for versioning and governance output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorpusState {
    pub document_count: u64,
    pub page_count: u64,
    pub latest_sync_at: Option<String>,
    pub latest_doc_updated_at: Option<String>,
    pub version_id: String,
}

/// Main corpus store
pub struct CorpusStore {
    config: StorageConfig,
    db: sled::Db,
    opinions: sled::Tree,
    pages: sled::Tree,
    chunks: sled::Tree,
    embeddings: sled::Tree,
    meta: sled::Tree,
    claims: sled::Tree,
    version_cache: Mutex<Option<(String, Instant)>>,
}

impl CorpusStore {
    /// Open (or create) the corpus store at the configured path.
    pub fn open(config: StorageConfig) -> Result<Self> {
        if let Some(parent) = config.db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = sled::open(&config.db_path)?;
        let opinions = db.open_tree("opinions")?;
        let pages = db.open_tree("pages")?;
        let chunks = db.open_tree("chunks")?;
        let embeddings = db.open_tree("page_embeddings")?;
        let meta = db.open_tree("meta")?;
        let claims = db.open_tree("ingest_claims")?;

        let store = Self {
            config,
            db,
            opinions,
            pages,
            chunks,
            embeddings,
            meta,
            claims,
            version_cache: Mutex::new(None),
        };
        tracing::info!(
            documents = store.opinions.len(),
            pages = store.pages.len(),
            "Corpus store opened"
        );
        Ok(store)
    }

    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        let raw = bincode::serialize(value)?;
        if self.config.enable_compression {
            let mut encoder =
                flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(&raw)?;
            Ok(encoder.finish()?)
        } else {
            Ok(raw)
        }
    }

    fn decode<T: for<'de> Deserialize<'de>>(&self, data: &[u8]) -> Result<T> {
        if data.len() >= 2 && data[..2] == GZIP_MAGIC {
            let mut decoder = flate2::read::GzDecoder::new(data);
            let mut raw = Vec::new();
            decoder.read_to_end(&mut raw)?;
            Ok(bincode::deserialize(&raw)?)
        } else {
            Ok(bincode::deserialize(data)?)
        }
    }

    // ---- opinion mutation ----------------------------------------------

    /// Insert or update an opinion, enforcing pdf_url / cluster_id dedupe.
    pub fn upsert_opinion(&self, opinion: &Opinion) -> Result<OpinionId> {
        if !opinion.pdf_url.is_empty() {
            if let Some(existing) = self.opinion_by_url(&opinion.pdf_url)? {
                if existing.id != opinion.id {
                    return Ok(existing.id);
                }
            }
        }
        if let Some(cluster_id) = opinion.cluster_id {
            if let Some(existing) = self.opinion_by_cluster_id(cluster_id)? {
                if existing.id != opinion.id {
                    return Ok(existing.id);
                }
            }
        }
        let key = opinion.id.to_string();
        let value = self.encode(opinion)?;
        self.opinions.insert(key.as_bytes(), value)?;
        self.touch_doc_updated(opinion.updated_at)?;
        Ok(opinion.id)
    }

    /// Replace the pages and chunks of an opinion atomically from the
    /// caller's perspective: content is cleared, rewritten, then the opinion
    /// is flagged ingested.
    pub fn replace_content(
        &self,
        opinion_id: OpinionId,
        page_texts: &[String],
        chunks: &[Chunk],
    ) -> Result<()> {
        self.clear_content(opinion_id)?;
        for (i, text) in page_texts.iter().enumerate() {
            let page = Page {
                opinion_id,
                page_number: (i + 1) as u32,
                text: text.clone(),
                lexemes: LexVector::build(text),
            };
            self.pages
                .insert(page_key(opinion_id, page.page_number), self.encode(&page)?)?;
        }
        for chunk in chunks {
            debug_assert!(chunk.page_start >= 1 && chunk.page_start <= chunk.page_end);
            self.chunks
                .insert(chunk_key(opinion_id, chunk.chunk_index), self.encode(chunk)?)?;
        }
        if let Some(mut opinion) = self.opinion(opinion_id)? {
            opinion.ingested = !page_texts.is_empty();
            opinion.updated_at = Utc::now();
            let value = self.encode(&opinion)?;
            self.opinions.insert(opinion.id.to_string().as_bytes(), value)?;
            self.touch_doc_updated(opinion.updated_at)?;
        }
        self.db.flush()?;
        Ok(())
    }

    fn clear_content(&self, opinion_id: OpinionId) -> Result<()> {
        let prefix = format!("{}:", opinion_id);
        for tree in [&self.pages, &self.chunks, &self.embeddings] {
            let keys: Vec<_> = tree
                .scan_prefix(prefix.as_bytes())
                .keys()
                .collect::<std::result::Result<_, _>>()?;
            for key in keys {
                tree.remove(key)?;
            }
        }
        Ok(())
    }

    /// Store a page embedding for the semantic fallback.
    pub fn put_page_embedding(
        &self,
        opinion_id: OpinionId,
        page_number: u32,
        vector: &[f32],
    ) -> Result<()> {
        let value = bincode::serialize(&vector.to_vec())?;
        self.embeddings.insert(page_key(opinion_id, page_number), value)?;
        Ok(())
    }

    /// Record a completed corpus sync; feeds the version id.
    pub fn record_sync(&self, completed_at: DateTime<Utc>) -> Result<()> {
        self.meta
            .insert(b"latest_sync_at", completed_at.to_rfc3339().as_bytes())?;
        Ok(())
    }

    fn touch_doc_updated(&self, updated_at: DateTime<Utc>) -> Result<()> {
        let newer = match self.meta.get(b"latest_doc_updated_at")? {
            Some(existing) => {
                let existing = String::from_utf8_lossy(&existing).to_string();
                updated_at.to_rfc3339() > existing
            }
            None => true,
        };
        if newer {
            self.meta
                .insert(b"latest_doc_updated_at", updated_at.to_rfc3339().as_bytes())?;
        }
        Ok(())
    }

    // ---- reads ----------------------------------------------------------

    pub fn opinion(&self, opinion_id: OpinionId) -> Result<Option<Opinion>> {
        match self.opinions.get(opinion_id.to_string().as_bytes())? {
            Some(data) => Ok(Some(self.decode(&data)?)),
            None => Ok(None),
        }
    }

    pub fn opinion_by_url(&self, pdf_url: &str) -> Result<Option<Opinion>> {
        for item in self.opinions.iter() {
            let (_, data) = item?;
            let opinion: Opinion = self.decode(&data)?;
            if opinion.pdf_url == pdf_url {
                return Ok(Some(opinion));
            }
        }
        Ok(None)
    }

    pub fn opinion_by_cluster_id(&self, cluster_id: i64) -> Result<Option<Opinion>> {
        for item in self.opinions.iter() {
            let (_, data) = item?;
            let opinion: Opinion = self.decode(&data)?;
            if opinion.cluster_id == Some(cluster_id) {
                return Ok(Some(opinion));
            }
        }
        Ok(None)
    }

    /// All opinions, in stable id order.
    pub fn opinions(&self) -> Result<Vec<Opinion>> {
        let mut out = Vec::new();
        for item in self.opinions.iter() {
            let (_, data) = item?;
            out.push(self.decode::<Opinion>(&data)?);
        }
        out.sort_by_key(|o| o.id);
        Ok(out)
    }

    pub fn page(&self, opinion_id: OpinionId, page_number: u32) -> Result<Option<Page>> {
        match self.pages.get(page_key(opinion_id, page_number))? {
            Some(data) => Ok(Some(self.decode(&data)?)),
            None => Ok(None),
        }
    }

    pub fn pages_for_opinion(&self, opinion_id: OpinionId) -> Result<Vec<Page>> {
        let prefix = format!("{}:", opinion_id);
        let mut pages = Vec::new();
        for item in self.pages.scan_prefix(prefix.as_bytes()) {
            let (_, data) = item?;
            pages.push(self.decode::<Page>(&data)?);
        }
        pages.sort_by_key(|p| p.page_number);
        Ok(pages)
    }

    /// All pages in the corpus, in (opinion, page_number) key order.
    pub fn all_pages(&self) -> Result<Vec<Page>> {
        let mut out = Vec::new();
        for item in self.pages.iter() {
            let (_, data) = item?;
            out.push(self.decode::<Page>(&data)?);
        }
        Ok(out)
    }

    /// All chunks in the corpus, in (opinion, chunk_index) key order.
    pub fn all_chunks(&self) -> Result<Vec<Chunk>> {
        let mut out = Vec::new();
        for item in self.chunks.iter() {
            let (_, data) = item?;
            out.push(self.decode::<Chunk>(&data)?);
        }
        Ok(out)
    }

    pub fn page_embedding(&self, opinion_id: OpinionId, page_number: u32) -> Result<Option<Vec<f32>>> {
        match self.embeddings.get(page_key(opinion_id, page_number))? {
            Some(data) => Ok(Some(bincode::deserialize(&data)?)),
            None => Ok(None),
        }
    }

    /// All stored page embeddings as ((opinion, page), vector) pairs.
    pub fn all_page_embeddings(&self) -> Result<Vec<((OpinionId, u32), Vec<f32>)>> {
        let mut out = Vec::new();
        for item in self.embeddings.iter() {
            let (key, data) = item?;
            if let Some(parsed) = parse_page_key(&key) {
                out.push((parsed, bincode::deserialize(&data)?));
            }
        }
        Ok(out)
    }

    pub fn document_count(&self) -> u64 {
        self.opinions.len() as u64
    }

    pub fn page_count(&self) -> u64 {
        self.pages.len() as u64
    }

    // ---- ingestion coordination ----------------------------------------

    /// Claim up to `limit` pending (not yet ingested) opinions for a batch
    /// worker. A claim key guards each document so that concurrent workers
    /// skip documents already being processed, standing in for row-level
    /// `FOR UPDATE SKIP LOCKED` on the external substrate.
    pub fn claim_pending(&self, limit: usize, worker: &str) -> Result<Vec<Opinion>> {
        let mut claimed = Vec::new();
        for opinion in self.opinions()? {
            if claimed.len() >= limit {
                break;
            }
            if opinion.ingested {
                continue;
            }
            let key = opinion.id.to_string();
            let won = self
                .claims
                .compare_and_swap(key.as_bytes(), None as Option<&[u8]>, Some(worker.as_bytes()))?
                .is_ok();
            if won {
                claimed.push(opinion);
            }
        }
        Ok(claimed)
    }

    /// Release a batch claim after processing (success or failure).
    pub fn release_claim(&self, opinion_id: OpinionId) -> Result<()> {
        self.claims.remove(opinion_id.to_string().as_bytes())?;
        Ok(())
    }

    // ---- versioning -----------------------------------------------------

    /// Deterministic corpus version id: first 12 hex chars of SHA-256 over
    /// `docs:<N>|pages:<M>|sync:<latest_sync_ts>|doc_updated:<max_doc_updated_ts>`.
    /// Cached for the configured TTL (default 5 minutes).
    pub fn corpus_version_id(&self) -> Result<String> {
        let ttl = Duration::from_secs(self.config.version_cache_ttl_seconds);
        {
            let cache = self.version_cache.lock();
            if let Some((version, at)) = cache.as_ref() {
                if at.elapsed() < ttl {
                    return Ok(version.clone());
                }
            }
        }
        let state = self.corpus_state_uncached()?;
        let version = state.version_id.clone();
        *self.version_cache.lock() = Some((version.clone(), Instant::now()));
        Ok(version)
    }

    /// Full corpus state including the version id. Bypasses the cache.
    pub fn corpus_state(&self) -> Result<CorpusState> {
        self.corpus_state_uncached()
    }

    fn corpus_state_uncached(&self) -> Result<CorpusState> {
        let document_count = self.document_count();
        let page_count = self.page_count();
        let latest_sync_at = self
            .meta
            .get(b"latest_sync_at")?
            .map(|v| String::from_utf8_lossy(&v).to_string());
        let latest_doc_updated_at = self
            .meta
            .get(b"latest_doc_updated_at")?
            .map(|v| String::from_utf8_lossy(&v).to_string());
        let version_id = compute_version_id(
            document_count,
            page_count,
            latest_sync_at.as_deref(),
            latest_doc_updated_at.as_deref(),
        );
        Ok(CorpusState {
            document_count,
            page_count,
            latest_sync_at,
            latest_doc_updated_at,
            version_id,
        })
    }

    /// The underlying database, shared with the audit recorder so query runs
    /// live in the same storage substrate.
    pub fn database(&self) -> &sled::Db {
        &self.db
    }

    /// Health check: round-trip a sentinel through the meta tree.
    pub fn health_check(&self) -> Result<()> {
        self.meta.insert(b"health_check", b"ok")?;
        let read = self.meta.get(b"health_check")?;
        if read.is_none() {
            return Err(CoreError::Internal {
                message: "Health check value not found after write".to_string(),
            });
        }
        self.meta.remove(b"health_check")?;
        Ok(())
    }
}

/// Pure version-id computation shared by the store and tests.
pub fn compute_version_id(
    document_count: u64,
    page_count: u64,
    latest_sync: Option<&str>,
    latest_doc_updated: Option<&str>,
) -> String {
    let version_string = format!(
        "docs:{}|pages:{}|sync:{}|doc_updated:{}",
        document_count,
        page_count,
        latest_sync.unwrap_or("none"),
        latest_doc_updated.unwrap_or("none"),
    );
    let digest = Sha256::digest(version_string.as_bytes());
    let hex = digest
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<String>();
    hex[..12].to_string()
}

fn page_key(opinion_id: OpinionId, page_number: u32) -> Vec<u8> {
    format!("{}:{:08}", opinion_id, page_number).into_bytes()
}

fn chunk_key(opinion_id: OpinionId, chunk_index: u32) -> Vec<u8> {
    format!("{}:{:08}", opinion_id, chunk_index).into_bytes()
}

fn parse_page_key(key: &[u8]) -> Option<(OpinionId, u32)> {
    let key = std::str::from_utf8(key).ok()?;
    let (id, page) = key.split_once(':')?;
    Some((Uuid::parse_str(id).ok()?, page.parse().ok()?))
}

#[cfg(test)]
pub mod test_support {
    //! Shared corpus fixtures for module tests.

    use super::*;
    use crate::ingestion::assemble_chunks;
    use chrono::NaiveDate;

    /// Open a throwaway store backed by a temp directory.
    pub fn temp_store() -> (CorpusStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = StorageConfig {
            db_path: dir.path().join("corpus.db"),
            enable_compression: false,
            version_cache_ttl_seconds: 300,
        };
        (CorpusStore::open(config).expect("open store"), dir)
    }

    /// Build an opinion with sensible test defaults.
    pub fn opinion(id: Uuid, case_name: &str, origin: &str, date: (i32, u32, u32)) -> Opinion {
        Opinion {
            id,
            case_name: case_name.to_string(),
            appeal_no: "13-0000".to_string(),
            release_date: NaiveDate::from_ymd_opt(date.0, date.1, date.2),
            origin: origin.to_string(),
            precedential: true,
            en_banc: false,
            cluster_id: None,
            pdf_url: format!("https://example.test/{}.pdf", id),
            pdf_sha256: None,
            ingested: true,
            is_rule_36: false,
            author_judge: None,
            is_landmark: false,
            citation_count: 0,
            updated_at: Utc::now(),
        }
    }

    /// Insert an opinion together with its page texts (chunks assembled with
    /// the production chunker).
    pub fn seed(store: &CorpusStore, opinion: &Opinion, page_texts: &[&str]) {
        store.upsert_opinion(opinion).expect("upsert");
        let texts: Vec<String> = page_texts.iter().map(|s| s.to_string()).collect();
        let chunks = assemble_chunks(opinion.id, &texts, 2);
        store
            .replace_content(opinion.id, &texts, &chunks)
            .expect("content");
    }
}
