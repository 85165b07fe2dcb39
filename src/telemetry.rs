//! # Telemetry & Eval Harness Module
//!
//! ## Purpose
//! Per-request verification metrics and their aggregates: verification rate
//! (overall and by doctrine), case-attributed-unsupported rate, latency
//! percentiles, failure-reason breakdowns, and alerting thresholds. Also
//! carries the batch eval harness used to sweep doctrine families offline.
//!
//! ## Counting rules
//! WEAK counts toward `verified_citations`; the unverified-rate alert uses
//! the complement of STRONG+MODERATE+WEAK. All user-visible rates are
//! percentages.
//!
//! ## Alert thresholds
//! Verification rate < 90%, case-attributed unsupported > 0.5%, unverified
//! rate > 10%, p95 latency > 30 s.

use crate::binding::SupportAudit;
use crate::errors::FailureReason;
use crate::{Source, Tier};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

const ALERT_MIN_VERIFICATION_RATE: f64 = 90.0;
const ALERT_MAX_CASE_ATTRIBUTED_UNSUPPORTED_RATE: f64 = 0.5;
const ALERT_MAX_UNVERIFIED_RATE: f64 = 10.0;
const ALERT_MAX_P95_LATENCY_MS: f64 = 30_000.0;

/// One request's telemetry record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryRecord {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub conversation_id: Option<String>,
    pub doctrine: Option<String>,
    pub total_citations: usize,
    pub verified_citations: usize,
    pub unverified_citations: usize,
    pub propositions_total: usize,
    pub propositions_case_attributed: usize,
    pub propositions_unsupported: usize,
    pub propositions_case_attributed_unsupported: usize,
    pub latency_ms: u64,
    pub failure_reasons: Vec<FailureReason>,
}

/// Latency percentiles for a window.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencyMetrics {
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub avg_ms: f64,
}

/// Failure reason with its share of all failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureReasonBreakdown {
    pub reason: FailureReason,
    pub count: usize,
    pub percentage: f64,
}

/// Per-doctrine aggregate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DoctrineMetrics {
    pub doctrine: String,
    pub verification_rate: f64,
    pub total_queries: usize,
    pub total_citations: usize,
    pub verified_citations: usize,
    pub unverified_citations: usize,
    pub avg_latency_ms: f64,
    pub alert: bool,
}

/// Dashboard summary over the recorded window.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardSummary {
    pub overall_verification_rate: f64,
    pub overall_unverified_rate: f64,
    pub case_attributed_unsupported_rate: f64,
    pub total_queries: usize,
    pub total_citations: usize,
    pub verified_citations: usize,
    pub unverified_citations: usize,
    pub latency: LatencyMetrics,
    pub by_doctrine: Vec<DoctrineMetrics>,
    pub failure_reasons: Vec<FailureReasonBreakdown>,
    pub alerts: Vec<String>,
}

/// In-memory telemetry store shared by request handlers.
pub struct TelemetryStore {
    records: RwLock<Vec<TelemetryRecord>>,
}

impl Default for TelemetryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetryStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(Vec::new()),
        }
    }

    /// Record a completed request from its emitted sources and support audit.
    pub fn record_request(
        &self,
        conversation_id: Option<String>,
        doctrine: Option<String>,
        sources: &[Source],
        support_audit: &SupportAudit,
        failure_reasons: Vec<FailureReason>,
        latency_ms: u64,
    ) {
        let total_citations = sources.len();
        let verified_citations = sources.iter().filter(|s| s.tier.is_verified()).count();
        let case_attributed = sources.iter().filter(|s| !s.case_name.is_empty()).count();
        let case_attributed_unsupported = sources
            .iter()
            .filter(|s| !s.case_name.is_empty() && s.tier == Tier::Unverified)
            .count();

        let record = TelemetryRecord {
            id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            conversation_id,
            doctrine,
            total_citations,
            verified_citations,
            unverified_citations: total_citations - verified_citations,
            propositions_total: support_audit.total_claims,
            propositions_case_attributed: case_attributed,
            propositions_unsupported: support_audit.unsupported_claims,
            propositions_case_attributed_unsupported: case_attributed_unsupported,
            latency_ms,
            failure_reasons,
        };
        self.records.write().push(record);
    }

    pub fn push(&self, record: TelemetryRecord) {
        self.records.write().push(record);
    }

    pub fn record_count(&self) -> usize {
        self.records.read().len()
    }

    /// Aggregate the window into the dashboard summary.
    pub fn summary(&self) -> DashboardSummary {
        let records = self.records.read();
        summarize(&records)
    }
}

fn percentile(sorted: &[u64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1] as f64
}

fn rate(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

/// Pure aggregation over a set of records.
pub fn summarize(records: &[TelemetryRecord]) -> DashboardSummary {
    let total_queries = records.len();
    let total_citations: usize = records.iter().map(|r| r.total_citations).sum();
    let verified_citations: usize = records.iter().map(|r| r.verified_citations).sum();
    let unverified_citations: usize = records.iter().map(|r| r.unverified_citations).sum();

    let propositions_case_attributed: usize =
        records.iter().map(|r| r.propositions_case_attributed).sum();
    let case_attributed_unsupported: usize = records
        .iter()
        .map(|r| r.propositions_case_attributed_unsupported)
        .sum();

    let mut latencies: Vec<u64> = records.iter().map(|r| r.latency_ms).collect();
    latencies.sort_unstable();
    let latency = LatencyMetrics {
        p50_ms: percentile(&latencies, 50.0),
        p95_ms: percentile(&latencies, 95.0),
        avg_ms: if latencies.is_empty() {
            0.0
        } else {
            latencies.iter().sum::<u64>() as f64 / latencies.len() as f64
        },
    };

    // Per-doctrine rollup
    let mut by_doctrine_map: HashMap<String, Vec<&TelemetryRecord>> = HashMap::new();
    for record in records {
        let key = record.doctrine.clone().unwrap_or_else(|| "untagged".to_string());
        by_doctrine_map.entry(key).or_default().push(record);
    }
    let mut by_doctrine: Vec<DoctrineMetrics> = by_doctrine_map
        .into_iter()
        .map(|(doctrine, rows)| {
            let citations: usize = rows.iter().map(|r| r.total_citations).sum();
            let verified: usize = rows.iter().map(|r| r.verified_citations).sum();
            let verification_rate = rate(verified, citations);
            let avg_latency_ms = if rows.is_empty() {
                0.0
            } else {
                rows.iter().map(|r| r.latency_ms).sum::<u64>() as f64 / rows.len() as f64
            };
            DoctrineMetrics {
                doctrine,
                verification_rate,
                total_queries: rows.len(),
                total_citations: citations,
                verified_citations: verified,
                unverified_citations: citations - verified,
                avg_latency_ms,
                alert: citations > 0 && verification_rate < ALERT_MIN_VERIFICATION_RATE,
            }
        })
        .collect();
    by_doctrine.sort_by(|a, b| a.doctrine.cmp(&b.doctrine));

    // Failure-reason breakdown, top 10
    let mut failure_counts: HashMap<FailureReason, usize> = HashMap::new();
    for record in records {
        for reason in &record.failure_reasons {
            *failure_counts.entry(*reason).or_insert(0) += 1;
        }
    }
    let total_failures: usize = failure_counts.values().sum();
    let mut failure_reasons: Vec<FailureReasonBreakdown> = failure_counts
        .into_iter()
        .map(|(reason, count)| FailureReasonBreakdown {
            reason,
            count,
            percentage: rate(count, total_failures),
        })
        .collect();
    failure_reasons.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.reason.as_str().cmp(b.reason.as_str())));
    failure_reasons.truncate(10);

    let overall_verification_rate = rate(verified_citations, total_citations);
    let overall_unverified_rate = rate(unverified_citations, total_citations);
    let case_attributed_unsupported_rate =
        rate(case_attributed_unsupported, propositions_case_attributed);

    let mut alerts = Vec::new();
    if total_citations > 0 && overall_verification_rate < ALERT_MIN_VERIFICATION_RATE {
        alerts.push(format!(
            "Verification rate {:.1}% below {:.0}%",
            overall_verification_rate, ALERT_MIN_VERIFICATION_RATE
        ));
    }
    if case_attributed_unsupported_rate > ALERT_MAX_CASE_ATTRIBUTED_UNSUPPORTED_RATE {
        alerts.push(format!(
            "Case-attributed unsupported rate {:.2}% above {:.1}%",
            case_attributed_unsupported_rate, ALERT_MAX_CASE_ATTRIBUTED_UNSUPPORTED_RATE
        ));
    }
    if total_citations > 0 && overall_unverified_rate > ALERT_MAX_UNVERIFIED_RATE {
        alerts.push(format!(
            "Unverified rate {:.1}% above {:.0}%",
            overall_unverified_rate, ALERT_MAX_UNVERIFIED_RATE
        ));
    }
    if latency.p95_ms > ALERT_MAX_P95_LATENCY_MS {
        alerts.push(format!("p95 latency {:.0}ms above {:.0}ms", latency.p95_ms, ALERT_MAX_P95_LATENCY_MS));
    }

    DashboardSummary {
        overall_verification_rate,
        overall_unverified_rate,
        case_attributed_unsupported_rate,
        total_queries,
        total_citations,
        verified_citations,
        unverified_citations,
        latency,
        by_doctrine,
        failure_reasons,
        alerts,
    }
}

/// One case in the offline eval sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalCase {
    pub doctrine: String,
    pub question: String,
}

/// The default eval set: a few prompts per doctrine family.
pub fn default_eval_set() -> Vec<EvalCase> {
    let cases: &[(&str, &str)] = &[
        ("101", "When are software claims directed to an abstract idea under Alice?"),
        ("101", "What transforms an abstract idea into a patent-eligible application?"),
        ("103", "What showing is required for motivation to combine references?"),
        ("103", "How do secondary considerations factor into obviousness?"),
        ("112", "What does enablement require for genus claims after Amgen?"),
        ("112", "When is a claim indefinite under Nautilus?"),
        ("claim_construction", "How is intrinsic evidence weighed in claim construction?"),
        ("infringement", "What establishes induced infringement?"),
        ("damages", "How is a reasonable royalty apportioned?"),
        ("certificate_correction", "Do certificates of correction apply retroactively?"),
    ];
    cases
        .iter()
        .map(|(doctrine, question)| EvalCase {
            doctrine: doctrine.to_string(),
            question: question.to_string(),
        })
        .collect()
}

/// Per-query eval outcome fed back into the report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalOutcome {
    pub case_: EvalCase,
    pub total_citations: usize,
    pub verified_citations: usize,
    pub latency_ms: u64,
}

/// Aggregated eval report across doctrine families.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvalReport {
    pub total_cases: usize,
    pub overall_verification_rate: f64,
    pub by_doctrine: Vec<DoctrineMetrics>,
}

impl EvalReport {
    pub fn from_outcomes(outcomes: &[EvalOutcome]) -> Self {
        let records: Vec<TelemetryRecord> = outcomes
            .iter()
            .map(|o| TelemetryRecord {
                id: Uuid::new_v4().to_string(),
                created_at: Utc::now(),
                conversation_id: None,
                doctrine: Some(o.case_.doctrine.clone()),
                total_citations: o.total_citations,
                verified_citations: o.verified_citations,
                unverified_citations: o.total_citations - o.verified_citations,
                propositions_total: o.total_citations,
                propositions_case_attributed: o.total_citations,
                propositions_unsupported: o.total_citations - o.verified_citations,
                propositions_case_attributed_unsupported: 0,
                latency_ms: o.latency_ms,
                failure_reasons: Vec::new(),
            })
            .collect();
        let summary = summarize(&records);
        Self {
            total_cases: outcomes.len(),
            overall_verification_rate: summary.overall_verification_rate,
            by_doctrine: summary.by_doctrine,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(doctrine: &str, total: usize, verified: usize, latency_ms: u64) -> TelemetryRecord {
        TelemetryRecord {
            id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            conversation_id: None,
            doctrine: Some(doctrine.to_string()),
            total_citations: total,
            verified_citations: verified,
            unverified_citations: total - verified,
            propositions_total: total,
            propositions_case_attributed: total,
            propositions_unsupported: total - verified,
            propositions_case_attributed_unsupported: 0,
            latency_ms,
            failure_reasons: Vec::new(),
        }
    }

    #[test]
    fn test_verification_rate_is_percentage() {
        let summary = summarize(&[record("101", 10, 9, 1000)]);
        assert!((summary.overall_verification_rate - 90.0).abs() < 1e-9);
        assert!((summary.overall_unverified_rate - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_weak_counts_as_verified() {
        // A WEAK source is verified for summary purposes
        let store = TelemetryStore::new();
        let source = Source {
            sid: "S1".to_string(),
            opinion_id: "a".to_string(),
            case_name: "A v. B".to_string(),
            appeal_no: String::new(),
            release_date: None,
            page_number: 1,
            quote: "q".to_string(),
            viewer_url: String::new(),
            pdf_url: String::new(),
            tier: Tier::Weak,
            binding_method: crate::BindingMethod::Strict,
            score: 60,
            signals: vec![],
            application_reason: String::new(),
            explain: None,
        };
        store.record_request(
            None,
            Some("101".to_string()),
            &[source],
            &SupportAudit {
                total_claims: 1,
                supported_claims: 1,
                unsupported_claims: 0,
            },
            vec![],
            500,
        );
        let summary = store.summary();
        assert_eq!(summary.verified_citations, 1);
        assert_eq!(summary.unverified_citations, 0);
    }

    #[test]
    fn test_percentiles() {
        let records: Vec<TelemetryRecord> =
            (1..=100).map(|i| record("101", 1, 1, i * 100)).collect();
        let summary = summarize(&records);
        assert!((summary.latency.p50_ms - 5000.0).abs() < 1e-9);
        assert!((summary.latency.p95_ms - 9500.0).abs() < 1e-9);
    }

    #[test]
    fn test_alerts_fire_on_thresholds() {
        // 50% verification, all latencies high
        let records = vec![record("101", 2, 1, 40_000), record("103", 2, 1, 45_000)];
        let summary = summarize(&records);
        assert!(summary.alerts.iter().any(|a| a.contains("Verification rate")));
        assert!(summary.alerts.iter().any(|a| a.contains("Unverified rate")));
        assert!(summary.alerts.iter().any(|a| a.contains("p95 latency")));
    }

    #[test]
    fn test_no_alerts_on_healthy_window() {
        let records = vec![record("101", 10, 10, 2_000), record("103", 10, 10, 2_500)];
        let summary = summarize(&records);
        assert!(summary.alerts.is_empty(), "alerts: {:?}", summary.alerts);
    }

    #[test]
    fn test_failure_reason_breakdown_ordering() {
        let mut r1 = record("101", 3, 0, 100);
        r1.failure_reasons = vec![
            FailureReason::QuoteNotFound,
            FailureReason::QuoteNotFound,
            FailureReason::WrongCaseId,
        ];
        let summary = summarize(&[r1]);
        assert_eq!(summary.failure_reasons[0].reason, FailureReason::QuoteNotFound);
        assert_eq!(summary.failure_reasons[0].count, 2);
        assert!((summary.failure_reasons[0].percentage - 66.66666666666666).abs() < 1e-6);
    }

    #[test]
    fn test_by_doctrine_rollup() {
        let records = vec![
            record("101", 4, 4, 1000),
            record("101", 4, 2, 1000),
            record("103", 2, 2, 1000),
        ];
        let summary = summarize(&records);
        let d101 = summary.by_doctrine.iter().find(|d| d.doctrine == "101").unwrap();
        assert_eq!(d101.total_queries, 2);
        assert_eq!(d101.total_citations, 8);
        assert_eq!(d101.verified_citations, 6);
        assert!(d101.alert, "75% verification must alert");
        let d103 = summary.by_doctrine.iter().find(|d| d.doctrine == "103").unwrap();
        assert!(!d103.alert);
    }

    #[test]
    fn test_empty_window() {
        let summary = summarize(&[]);
        assert_eq!(summary.total_queries, 0);
        assert_eq!(summary.overall_verification_rate, 0.0);
        assert!(summary.alerts.is_empty());
    }

    #[test]
    fn test_eval_report_aggregates_by_doctrine() {
        let outcomes: Vec<EvalOutcome> = default_eval_set()
            .into_iter()
            .map(|case_| EvalOutcome {
                case_,
                total_citations: 2,
                verified_citations: 2,
                latency_ms: 800,
            })
            .collect();
        let report = EvalReport::from_outcomes(&outcomes);
        assert_eq!(report.total_cases, 10);
        assert!((report.overall_verification_rate - 100.0).abs() < 1e-9);
        assert!(report.by_doctrine.iter().any(|d| d.doctrine == "101"));
    }
}
