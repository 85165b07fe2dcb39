//! # Audit/Replay Recorder Module
//!
//! ## Purpose
//! Records a QueryRun per query with ordered manifests (retrieval, context,
//! model config, citation verifications), produces bounded replay packets,
//! and applies the retention policy. A small explicit circuit breaker
//! protects the request path from cascading storage failures: when open,
//! inserts are skipped and the query proceeds without audit.
//!
//! ## Circuit breaker states
//! `closed` (normal) → `open` after `failure_threshold` consecutive
//! failures → `half_open` after the cooldown, where a single probe either
//! closes or reopens the circuit.
//!
//! ## Ordering and scheduling
//! Run creation is a synchronous, breaker-guarded insert (callers on an
//! async runtime dispatch it via `spawn_blocking`). Every subsequent write
//! is fire-and-forget: it is queued to a dedicated background worker thread
//! and applied there, off the request path. The queue is FIFO and the
//! worker is single, so within one request the retrieval manifest is
//! recorded before the context manifest, then the model config, then the
//! citation verifications. Across requests there are no ordering
//! guarantees. `flush` blocks until the queue has drained, for tests and
//! shutdown.

use crate::binding::CitationVerification;
use crate::config::AuditConfig;
use crate::errors::{CoreError, Result};
use crate::generator::ModelConfigRecord;
use crate::retrieval::PageHit;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Instant;
use uuid::Uuid;

const ANSWER_RECORD_CAP: usize = 10_000;
const MANIFEST_ROW_CAP: usize = 50;
const REDACTED: &str = "[REDACTED]";
const TRUNCATED: &str = "[TRUNCATED]";

/// Circuit breaker state labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    failure_count: u32,
    last_failure: Option<Instant>,
}

/// Snapshot of the breaker for monitoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub failure_count: u32,
    pub cooldown_remaining_seconds: u64,
}

/// In-memory circuit breaker for audit writes.
pub struct CircuitBreaker {
    failure_threshold: u32,
    cooldown_seconds: u64,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown_seconds: u64) -> Self {
        Self {
            failure_threshold,
            cooldown_seconds,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failure_count: 0,
                last_failure: None,
            }),
        }
    }

    /// Whether a write may be attempted. An open circuit transitions to
    /// half-open once the cooldown has elapsed, admitting a single probe.
    pub fn can_execute(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let elapsed = inner
                    .last_failure
                    .map(|at| at.elapsed().as_secs())
                    .unwrap_or(u64::MAX);
                if elapsed >= self.cooldown_seconds {
                    inner.state = BreakerState::HalfOpen;
                    tracing::debug!("Circuit breaker: open -> half_open");
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.failure_count = 0;
        if inner.state == BreakerState::HalfOpen {
            inner.state = BreakerState::Closed;
            tracing::info!("Circuit breaker: half_open -> closed");
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.failure_count += 1;
        inner.last_failure = Some(Instant::now());
        match inner.state {
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                tracing::warn!("Circuit breaker: half_open -> open (probe failed)");
            }
            BreakerState::Closed if inner.failure_count >= self.failure_threshold => {
                inner.state = BreakerState::Open;
                tracing::warn!(
                    threshold = self.failure_threshold,
                    "Circuit breaker: closed -> open"
                );
            }
            _ => {}
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        let cooldown_remaining_seconds = match inner.state {
            BreakerState::Open => inner
                .last_failure
                .map(|at| self.cooldown_seconds.saturating_sub(at.elapsed().as_secs()))
                .unwrap_or(0),
            _ => 0,
        };
        BreakerSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
            cooldown_remaining_seconds,
        }
    }
}

/// Manifest of retrieval results: ids and scores only, no text.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrievalManifest {
    pub page_ids: Vec<String>,
    pub opinion_ids: Vec<String>,
    pub scores: Vec<f32>,
    pub count: usize,
}

impl RetrievalManifest {
    pub fn from_hits(hits: &[PageHit]) -> Self {
        let mut opinion_ids = Vec::new();
        for hit in hits.iter().take(MANIFEST_ROW_CAP) {
            let id = hit.opinion_id.to_string();
            if !opinion_ids.contains(&id) {
                opinion_ids.push(id);
            }
        }
        Self {
            page_ids: hits.iter().take(MANIFEST_ROW_CAP).map(|h| h.page_id()).collect(),
            opinion_ids,
            scores: hits.iter().take(MANIFEST_ROW_CAP).map(|h| h.rank).collect(),
            count: hits.len(),
        }
    }
}

/// Manifest of the pages actually fed to the model.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextManifest {
    pub page_ids: Vec<String>,
    pub page_order: Vec<usize>,
    pub token_counts: Vec<usize>,
    pub total_tokens: usize,
    pub page_count: usize,
}

impl ContextManifest {
    pub fn from_hits(hits: &[PageHit], token_counts: Vec<usize>) -> Self {
        let total_tokens = token_counts.iter().sum();
        Self {
            page_ids: hits.iter().map(|h| h.page_id()).collect(),
            page_order: (0..hits.len()).collect(),
            token_counts,
            total_tokens,
            page_count: hits.len(),
        }
    }
}

/// Complete audit record for a single query.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRun {
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    pub conversation_id: Option<String>,
    pub user_query: String,
    pub doctrine_tag: Option<String>,
    pub corpus_version_id: String,
    pub retrieval_manifest: Option<RetrievalManifest>,
    pub context_manifest: Option<ContextManifest>,
    pub model_config: Option<ModelConfigRecord>,
    pub system_prompt_version: Option<String>,
    pub final_answer: Option<String>,
    pub citation_verifications: Vec<CitationVerification>,
    pub latency_ms: Option<u64>,
    pub failure_reason: Option<String>,
}

/// Storage abstraction for query runs. The production implementation sits on
/// a sled tree; tests inject failing stores to exercise the breaker.
pub trait RunStore: Send + Sync {
    fn insert(&self, run: &QueryRun) -> Result<()>;
    fn update(&self, run: &QueryRun) -> Result<()>;
    fn get(&self, run_id: &str) -> Result<Option<QueryRun>>;
    fn list(&self) -> Result<Vec<QueryRun>>;
    fn remove(&self, run_id: &str) -> Result<()>;
}

/// Sled-backed run store.
pub struct SledRunStore {
    tree: sled::Tree,
}

impl SledRunStore {
    pub fn open(db: &sled::Db) -> Result<Self> {
        Ok(Self {
            tree: db.open_tree("query_runs")?,
        })
    }
}

impl RunStore for SledRunStore {
    fn insert(&self, run: &QueryRun) -> Result<()> {
        let value = bincode::serialize(run)?;
        self.tree.insert(run.run_id.as_bytes(), value)?;
        Ok(())
    }

    fn update(&self, run: &QueryRun) -> Result<()> {
        self.insert(run)
    }

    fn get(&self, run_id: &str) -> Result<Option<QueryRun>> {
        match self.tree.get(run_id.as_bytes())? {
            Some(data) => Ok(Some(bincode::deserialize(&data)?)),
            None => Ok(None),
        }
    }

    fn list(&self) -> Result<Vec<QueryRun>> {
        let mut runs = Vec::new();
        for item in self.tree.iter() {
            let (_, data) = item?;
            runs.push(bincode::deserialize(&data)?);
        }
        Ok(runs)
    }

    fn remove(&self, run_id: &str) -> Result<()> {
        self.tree.remove(run_id.as_bytes())?;
        Ok(())
    }
}

/// Summary of one retention cleanup pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub dry_run: bool,
    pub redact_cutoff: DateTime<Utc>,
    pub delete_cutoff: DateTime<Utc>,
    pub to_redact: usize,
    pub to_delete: usize,
    pub redacted: usize,
    pub deleted: usize,
}

/// Work items applied by the background audit worker, in send order.
enum AuditJob {
    RetrievalManifest {
        run_id: String,
        manifest: RetrievalManifest,
    },
    ContextManifest {
        run_id: String,
        manifest: ContextManifest,
    },
    ModelConfig {
        run_id: String,
        config: ModelConfigRecord,
    },
    CitationVerifications {
        run_id: String,
        verifications: Vec<CitationVerification>,
    },
    FinalAnswer {
        run_id: String,
        answer: String,
        latency_ms: u64,
        failure_reason: Option<String>,
    },
    Flush(mpsc::Sender<()>),
}

fn with_run<F: FnOnce(&mut QueryRun)>(store: &Arc<dyn RunStore>, run_id: &str, mutate: F) {
    match store.get(run_id) {
        Ok(Some(mut run)) => {
            mutate(&mut run);
            if let Err(e) = store.update(&run) {
                tracing::debug!(run_id, error = %e, "query run update failed");
            }
        }
        Ok(None) => {}
        Err(e) => tracing::debug!(run_id, error = %e, "query run read failed"),
    }
}

fn apply_job(store: &Arc<dyn RunStore>, job: AuditJob) {
    match job {
        AuditJob::RetrievalManifest { run_id, manifest } => {
            with_run(store, &run_id, |run| run.retrieval_manifest = Some(manifest));
        }
        AuditJob::ContextManifest { run_id, manifest } => {
            with_run(store, &run_id, |run| run.context_manifest = Some(manifest));
        }
        AuditJob::ModelConfig { run_id, config } => {
            with_run(store, &run_id, |run| {
                run.system_prompt_version = Some(config.system_prompt_version.clone());
                run.model_config = Some(config);
            });
        }
        AuditJob::CitationVerifications {
            run_id,
            verifications,
        } => {
            with_run(store, &run_id, |run| run.citation_verifications = verifications);
        }
        AuditJob::FinalAnswer {
            run_id,
            answer,
            latency_ms,
            failure_reason,
        } => {
            with_run(store, &run_id, |run| {
                run.final_answer = Some(answer);
                run.latency_ms = Some(latency_ms);
                run.failure_reason = failure_reason;
            });
        }
        AuditJob::Flush(ack) => {
            let _ = ack.send(());
        }
    }
}

fn worker_loop(store: Arc<dyn RunStore>, jobs: mpsc::Receiver<AuditJob>) {
    // recv drains any queued jobs before reporting disconnection, so pending
    // writes are applied even when the recorder is dropped without a flush
    while let Ok(job) = jobs.recv() {
        apply_job(&store, job);
    }
}

/// The audit recorder: breaker-guarded inserts, fire-and-forget updates on a
/// background worker, replay packets, retention.
pub struct AuditRecorder {
    store: Arc<dyn RunStore>,
    breaker: CircuitBreaker,
    config: AuditConfig,
    jobs: Mutex<Option<mpsc::Sender<AuditJob>>>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl AuditRecorder {
    pub fn new(store: Arc<dyn RunStore>, config: AuditConfig) -> Self {
        let breaker = CircuitBreaker::new(
            config.breaker_failure_threshold,
            config.breaker_cooldown_seconds,
        );
        let (tx, rx) = mpsc::channel();
        let worker_store = store.clone();
        let worker = thread::Builder::new()
            .name("audit-recorder".to_string())
            .spawn(move || worker_loop(worker_store, rx))
            .map_err(|e| tracing::warn!(error = %e, "audit worker unavailable; writes apply inline"))
            .ok();
        let jobs = worker.is_some().then_some(tx);
        Self {
            store,
            breaker,
            config,
            jobs: Mutex::new(jobs),
            worker: Mutex::new(worker),
        }
    }

    /// Hand a write to the background worker. Falls back to applying it on
    /// the calling thread only when no worker could be spawned.
    fn enqueue(&self, job: AuditJob) {
        let rejected = {
            let guard = self.jobs.lock();
            match guard.as_ref() {
                Some(tx) => tx.send(job).err().map(|e| e.0),
                None => Some(job),
            }
        };
        if let Some(job) = rejected {
            apply_job(&self.store, job);
        }
    }

    /// Block until every write queued so far has been applied. Used by tests
    /// and shutdown paths; never on the request path.
    pub fn flush(&self) {
        let (ack_tx, ack_rx) = mpsc::channel();
        self.enqueue(AuditJob::Flush(ack_tx));
        let _ = ack_rx.recv();
    }

    /// Create a new query run. When the breaker is open the insert is
    /// skipped and the returned run id is simply never persisted; the query
    /// proceeds without audit.
    pub fn create_run(
        &self,
        conversation_id: Option<String>,
        user_query: &str,
        doctrine_tag: Option<String>,
        corpus_version_id: String,
    ) -> String {
        let run = QueryRun {
            run_id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            conversation_id,
            user_query: user_query.to_string(),
            doctrine_tag,
            corpus_version_id,
            retrieval_manifest: None,
            context_manifest: None,
            model_config: None,
            system_prompt_version: None,
            final_answer: None,
            citation_verifications: Vec::new(),
            latency_ms: None,
            failure_reason: None,
        };

        if !self.breaker.can_execute() {
            tracing::debug!(run_id = %run.run_id, "audit write suppressed (circuit open)");
            return run.run_id;
        }
        match self.store.insert(&run) {
            Ok(()) => self.breaker.record_success(),
            Err(e) => {
                self.breaker.record_failure();
                tracing::debug!(run_id = %run.run_id, error = %e, "query run insert failed");
            }
        }
        run.run_id
    }

    /// Queue the retrieval manifest write (fire-and-forget).
    pub fn record_retrieval_manifest(&self, run_id: &str, hits: &[PageHit]) {
        self.enqueue(AuditJob::RetrievalManifest {
            run_id: run_id.to_string(),
            manifest: RetrievalManifest::from_hits(hits),
        });
    }

    /// Queue the context manifest write (fire-and-forget).
    pub fn record_context_manifest(&self, run_id: &str, hits: &[PageHit], token_counts: Vec<usize>) {
        self.enqueue(AuditJob::ContextManifest {
            run_id: run_id.to_string(),
            manifest: ContextManifest::from_hits(hits, token_counts),
        });
    }

    /// Queue the model-config write (fire-and-forget).
    pub fn record_model_config(&self, run_id: &str, config: ModelConfigRecord) {
        self.enqueue(AuditJob::ModelConfig {
            run_id: run_id.to_string(),
            config,
        });
    }

    /// Queue the citation-verification write (fire-and-forget).
    pub fn record_citation_verifications(&self, run_id: &str, verifications: &[CitationVerification]) {
        self.enqueue(AuditJob::CitationVerifications {
            run_id: run_id.to_string(),
            verifications: verifications.iter().take(MANIFEST_ROW_CAP).cloned().collect(),
        });
    }

    /// Queue the final answer and latency write (fire-and-forget).
    pub fn record_final_answer(
        &self,
        run_id: &str,
        answer: &str,
        latency_ms: u64,
        failure_reason: Option<String>,
    ) {
        self.enqueue(AuditJob::FinalAnswer {
            run_id: run_id.to_string(),
            answer: crate::text::truncate_chars(answer, ANSWER_RECORD_CAP),
            latency_ms,
            failure_reason,
        });
    }

    pub fn get_run(&self, run_id: &str) -> Result<Option<QueryRun>> {
        self.store.get(run_id)
    }

    pub fn breaker_state(&self) -> BreakerSnapshot {
        self.breaker.snapshot()
    }

    /// Build a replay packet for a run, enforcing the byte-size cap. When
    /// exceeded, oversized fields collapse to `[TRUNCATED]` markers and
    /// `_size_limited` is set.
    pub fn replay_packet(&self, run_id: &str) -> Result<serde_json::Value> {
        let run = self
            .get_run(run_id)?
            .ok_or_else(|| CoreError::RunNotFound {
                run_id: run_id.to_string(),
            })?;

        let mut packet = serde_json::json!({
            "runId": run.run_id,
            "createdAt": run.created_at,
            "conversationId": run.conversation_id,
            "userQuery": run.user_query,
            "doctrineTag": run.doctrine_tag,
            "corpusVersionId": run.corpus_version_id,
            "retrievalManifest": run.retrieval_manifest,
            "contextManifest": run.context_manifest,
            "modelConfig": run.model_config,
            "systemPromptVersion": run.system_prompt_version,
            "finalAnswer": run.final_answer,
            "citationsManifest": run.citation_verifications,
            "latencyMs": run.latency_ms,
            "failureReason": run.failure_reason,
        });

        let size = serde_json::to_vec(&packet)?.len();
        if size > self.config.replay_packet_max_bytes {
            tracing::warn!(run_id, size, "replay packet exceeds size limit");
            let object = packet.as_object_mut().expect("packet is an object");
            object.insert("finalAnswer".to_string(), serde_json::json!(TRUNCATED));
            if let Some(manifest) = run.retrieval_manifest.as_ref() {
                object.insert(
                    "retrievalManifest".to_string(),
                    serde_json::json!({"truncated": true, "originalPageCount": manifest.page_ids.len()}),
                );
            }
            if let Some(manifest) = run.context_manifest.as_ref() {
                object.insert(
                    "contextManifest".to_string(),
                    serde_json::json!({"truncated": true, "originalPageCount": manifest.page_ids.len()}),
                );
            }
            object.insert("_size_limited".to_string(), serde_json::json!(true));
        }
        Ok(packet)
    }

    /// Apply the retention policy: redact `final_answer` after the redaction
    /// horizon, delete rows past the deletion horizon. Idempotent; dry-run
    /// reports counts without mutating.
    pub fn cleanup(&self, dry_run: bool) -> Result<CleanupReport> {
        let now = Utc::now();
        let redact_cutoff = now - ChronoDuration::days(self.config.retention_redact_days);
        let delete_cutoff = now - ChronoDuration::days(self.config.retention_delete_days);

        let mut report = CleanupReport {
            dry_run,
            redact_cutoff,
            delete_cutoff,
            to_redact: 0,
            to_delete: 0,
            redacted: 0,
            deleted: 0,
        };

        for run in self.store.list()? {
            if run.created_at < delete_cutoff {
                report.to_delete += 1;
                if !dry_run {
                    self.store.remove(&run.run_id)?;
                    report.deleted += 1;
                }
            } else if run.created_at < redact_cutoff
                && run.final_answer.as_deref().is_some_and(|a| a != REDACTED)
            {
                report.to_redact += 1;
                if !dry_run {
                    let mut redacted = run.clone();
                    redacted.final_answer = Some(REDACTED.to_string());
                    self.store.update(&redacted)?;
                    report.redacted += 1;
                }
            }
        }

        if dry_run {
            tracing::info!(
                to_redact = report.to_redact,
                to_delete = report.to_delete,
                "retention dry-run"
            );
        } else {
            tracing::info!(
                redacted = report.redacted,
                deleted = report.deleted,
                "retention applied"
            );
        }
        Ok(report)
    }
}

impl Drop for AuditRecorder {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain the queue and exit
        *self.jobs.lock() = None;
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Store whose writes can be toggled to fail, for breaker tests.
    struct FlakyStore {
        inner: Mutex<std::collections::HashMap<String, QueryRun>>,
        failing: AtomicBool,
    }

    impl FlakyStore {
        fn new() -> Self {
            Self {
                inner: Mutex::new(std::collections::HashMap::new()),
                failing: AtomicBool::new(false),
            }
        }

        fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }

        fn check(&self) -> Result<()> {
            if self.failing.load(Ordering::SeqCst) {
                Err(CoreError::Internal {
                    message: "simulated failure".to_string(),
                })
            } else {
                Ok(())
            }
        }
    }

    impl RunStore for FlakyStore {
        fn insert(&self, run: &QueryRun) -> Result<()> {
            self.check()?;
            self.inner.lock().insert(run.run_id.clone(), run.clone());
            Ok(())
        }
        fn update(&self, run: &QueryRun) -> Result<()> {
            self.check()?;
            self.inner.lock().insert(run.run_id.clone(), run.clone());
            Ok(())
        }
        fn get(&self, run_id: &str) -> Result<Option<QueryRun>> {
            Ok(self.inner.lock().get(run_id).cloned())
        }
        fn list(&self) -> Result<Vec<QueryRun>> {
            Ok(self.inner.lock().values().cloned().collect())
        }
        fn remove(&self, run_id: &str) -> Result<()> {
            self.check()?;
            self.inner.lock().remove(run_id);
            Ok(())
        }
    }

    fn recorder_with(
        store: Arc<FlakyStore>,
        threshold: u32,
        cooldown_seconds: u64,
    ) -> AuditRecorder {
        AuditRecorder::new(
            store,
            AuditConfig {
                breaker_failure_threshold: threshold,
                breaker_cooldown_seconds: cooldown_seconds,
                ..AuditConfig::default()
            },
        )
    }

    fn sample_run(created_at: DateTime<Utc>, answer: &str) -> QueryRun {
        QueryRun {
            run_id: Uuid::new_v4().to_string(),
            created_at,
            conversation_id: None,
            user_query: "q".to_string(),
            doctrine_tag: None,
            corpus_version_id: "abc123def456".to_string(),
            retrieval_manifest: None,
            context_manifest: None,
            model_config: None,
            system_prompt_version: None,
            final_answer: Some(answer.to_string()),
            citation_verifications: Vec::new(),
            latency_ms: Some(100),
            failure_reason: None,
        }
    }

    #[test]
    fn test_breaker_full_state_machine() {
        // Invariant 6: closed initially; exactly threshold failures open it;
        // after cooldown the next probe is half-open; half-open failure
        // reopens; half-open success closes.
        let breaker = CircuitBreaker::new(5, 0);
        assert_eq!(breaker.snapshot().state, BreakerState::Closed);

        for i in 0..4 {
            breaker.record_failure();
            assert_eq!(breaker.snapshot().state, BreakerState::Closed, "after {} failures", i + 1);
        }
        breaker.record_failure();
        assert_eq!(breaker.snapshot().state, BreakerState::Open);

        // Zero cooldown: the next check admits a half-open probe
        assert!(breaker.can_execute());
        assert_eq!(breaker.snapshot().state, BreakerState::HalfOpen);

        breaker.record_failure();
        assert_eq!(breaker.snapshot().state, BreakerState::Open);

        assert!(breaker.can_execute());
        assert_eq!(breaker.snapshot().state, BreakerState::HalfOpen);
        breaker.record_success();
        assert_eq!(breaker.snapshot().state, BreakerState::Closed);
    }

    #[test]
    fn test_breaker_blocks_while_cooling_down() {
        let breaker = CircuitBreaker::new(1, 300);
        breaker.record_failure();
        assert_eq!(breaker.snapshot().state, BreakerState::Open);
        assert!(!breaker.can_execute());
        assert!(breaker.snapshot().cooldown_remaining_seconds > 0);
    }

    #[test]
    fn test_inserts_suppressed_when_open() {
        // S6: five failing inserts open the breaker; the sixth query still
        // gets a run id but nothing is persisted.
        let store = Arc::new(FlakyStore::new());
        let recorder = recorder_with(store.clone(), 5, 300);

        store.set_failing(true);
        for _ in 0..5 {
            recorder.create_run(None, "query", None, "v".to_string());
        }
        assert_eq!(recorder.breaker_state().state, BreakerState::Open);

        store.set_failing(false);
        let run_id = recorder.create_run(None, "query six", None, "v".to_string());
        assert!(!run_id.is_empty());
        assert!(store.get(&run_id).unwrap().is_none(), "insert must be skipped while open");
        assert_eq!(recorder.breaker_state().state, BreakerState::Open);
    }

    #[test]
    fn test_probe_closes_after_cooldown() {
        let store = Arc::new(FlakyStore::new());
        let recorder = recorder_with(store.clone(), 5, 0);

        store.set_failing(true);
        for _ in 0..5 {
            recorder.create_run(None, "query", None, "v".to_string());
        }
        assert_eq!(recorder.breaker_state().state, BreakerState::Open);

        // Cooldown of zero: next insert is the half-open probe and succeeds
        store.set_failing(false);
        let run_id = recorder.create_run(None, "probe", None, "v".to_string());
        assert!(store.get(&run_id).unwrap().is_some());
        assert_eq!(recorder.breaker_state().state, BreakerState::Closed);
    }

    #[test]
    fn test_recording_order_builds_complete_run() {
        let store = Arc::new(FlakyStore::new());
        let recorder = recorder_with(store, 5, 300);

        let run_id = recorder.create_run(Some("conv-1".to_string()), "what did alice hold", Some("101".to_string()), "abc123def456".to_string());
        recorder.record_retrieval_manifest(&run_id, &[]);
        recorder.record_context_manifest(&run_id, &[], vec![]);
        recorder.record_model_config(
            &run_id,
            ModelConfigRecord {
                model: "gpt-4o".to_string(),
                temperature: 0.2,
                max_tokens: 2000,
                system_prompt_version: "v2.0-quote-first".to_string(),
            },
        );
        recorder.record_citation_verifications(&run_id, &[]);
        recorder.record_final_answer(&run_id, "answer [S1]", 1234, None);
        recorder.flush();

        let run = recorder.get_run(&run_id).unwrap().unwrap();
        assert!(run.retrieval_manifest.is_some());
        assert!(run.context_manifest.is_some());
        assert_eq!(run.system_prompt_version.as_deref(), Some("v2.0-quote-first"));
        assert_eq!(run.final_answer.as_deref(), Some("answer [S1]"));
        assert_eq!(run.latency_ms, Some(1234));
    }

    #[test]
    fn test_updates_for_unknown_runs_are_noops() {
        // An update for a run the breaker suppressed (or that never existed)
        // must neither create a row nor fail.
        let store = Arc::new(FlakyStore::new());
        let recorder = recorder_with(store.clone(), 5, 300);

        recorder.record_final_answer("never-inserted", "answer", 10, None);
        recorder.flush();
        assert!(store.get("never-inserted").unwrap().is_none());
    }

    #[test]
    fn test_queued_writes_drain_on_drop() {
        let store = Arc::new(FlakyStore::new());
        let run_id = {
            let recorder = recorder_with(store.clone(), 5, 300);
            let run_id = recorder.create_run(None, "q", None, "v".to_string());
            recorder.record_final_answer(&run_id, "late answer", 42, None);
            run_id
            // recorder dropped here without an explicit flush
        };
        let run = store.get(&run_id).unwrap().unwrap();
        assert_eq!(run.final_answer.as_deref(), Some("late answer"));
    }

    #[test]
    fn test_replay_packet_size_cap() {
        let store = Arc::new(FlakyStore::new());
        let recorder = AuditRecorder::new(
            store.clone(),
            AuditConfig {
                replay_packet_max_bytes: 500,
                ..AuditConfig::default()
            },
        );
        let mut run = sample_run(Utc::now(), &"long answer ".repeat(200));
        run.retrieval_manifest = Some(RetrievalManifest {
            page_ids: vec!["a:1".to_string(); 10],
            opinion_ids: vec!["a".to_string()],
            scores: vec![0.5; 10],
            count: 10,
        });
        store.insert(&run).unwrap();

        let packet = recorder.replay_packet(&run.run_id).unwrap();
        assert_eq!(packet["_size_limited"], serde_json::json!(true));
        assert_eq!(packet["finalAnswer"], serde_json::json!(TRUNCATED));
        assert_eq!(packet["retrievalManifest"]["truncated"], serde_json::json!(true));
        assert_eq!(
            packet["retrievalManifest"]["originalPageCount"],
            serde_json::json!(10)
        );
    }

    #[test]
    fn test_replay_packet_missing_run() {
        let store = Arc::new(FlakyStore::new());
        let recorder = recorder_with(store, 5, 300);
        assert!(matches!(
            recorder.replay_packet("nope"),
            Err(CoreError::RunNotFound { .. })
        ));
    }

    #[test]
    fn test_retention_buckets_and_idempotence() {
        let store = Arc::new(FlakyStore::new());
        let recorder = recorder_with(store.clone(), 5, 300);

        let fresh = sample_run(Utc::now(), "recent answer");
        let stale = sample_run(Utc::now() - ChronoDuration::days(120), "stale answer");
        let ancient = sample_run(Utc::now() - ChronoDuration::days(400), "ancient answer");
        for run in [&fresh, &stale, &ancient] {
            store.insert(run).unwrap();
        }

        let dry = recorder.cleanup(true).unwrap();
        assert_eq!(dry.to_redact, 1);
        assert_eq!(dry.to_delete, 1);
        assert_eq!(dry.redacted, 0);
        assert_eq!(dry.deleted, 0);
        // Dry run must not mutate
        assert_eq!(
            store.get(&stale.run_id).unwrap().unwrap().final_answer.as_deref(),
            Some("stale answer")
        );

        let applied = recorder.cleanup(false).unwrap();
        assert_eq!(applied.redacted, 1);
        assert_eq!(applied.deleted, 1);
        assert_eq!(
            store.get(&stale.run_id).unwrap().unwrap().final_answer.as_deref(),
            Some(REDACTED)
        );
        assert!(store.get(&ancient.run_id).unwrap().is_none());
        assert_eq!(
            store.get(&fresh.run_id).unwrap().unwrap().final_answer.as_deref(),
            Some("recent answer")
        );

        // Second apply is a no-op
        let again = recorder.cleanup(false).unwrap();
        assert_eq!(again.redacted, 0);
        assert_eq!(again.deleted, 0);
    }
}
