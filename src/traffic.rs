//! In-memory ring of recent requests.
//!
//! [`TrafficLog`] is a fixed-capacity ring-buffer: once full, the oldest
//! entry is evicted to make room for the newest. Nothing is persisted —
//! this is the single-user proxy's only request history, surfaced as
//! aggregate counters on the health endpoint.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;

/// Fixed-capacity ring-buffer of recent [`TrafficEntry`] records.
///
/// Safe to share via `Arc<TrafficLog>`. [`push`][Self::push] uses a
/// non-blocking `try_lock` so it never delays request handling; under lock
/// contention the entry is silently dropped.
pub struct TrafficLog {
    capacity: usize,
    entries: Mutex<VecDeque<TrafficEntry>>,
}

impl TrafficLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Record a completed request. Best-effort and non-blocking.
    pub fn push(&self, entry: TrafficEntry) {
        if let Ok(mut entries) = self.entries.try_lock() {
            if entries.len() == self.capacity {
                entries.pop_front();
            }
            entries.push_back(entry);
        }
    }

    /// Aggregate counters over all buffered entries.
    pub async fn stats(&self) -> TrafficStats {
        let entries = self.entries.lock().await;
        let total = entries.len();
        let deduped = entries.iter().filter(|e| e.dedup != "origin").count();
        let challenges_signed = entries.iter().filter(|e| e.payment == "signed").count();
        let avg_savings = if total == 0 {
            0.0
        } else {
            entries.iter().map(|e| e.savings).sum::<f64>() / total as f64
        };
        TrafficStats { total_requests: total, deduped, challenges_signed, avg_savings }
    }

    #[cfg(test)]
    pub async fn recent(&self, limit: usize) -> Vec<TrafficEntry> {
        let entries = self.entries.lock().await;
        entries.iter().rev().take(limit).cloned().collect()
    }
}

/// One completed request.
#[derive(Debug, Clone, Serialize)]
pub struct TrafficEntry {
    /// Correlation id — the same value echoed to the client as
    /// `X-Request-ID` and stamped on the request's tracing span.
    pub id: String,
    pub timestamp: DateTime<Utc>,
    /// Raw `model` field from the client body.
    pub requested_model: String,
    /// Canonical model that handled the request.
    pub model: String,
    /// Tier label, `-` for explicit model requests.
    pub tier: String,
    /// Routing method (`scored`, `forced`, `default`, `free-fallback`).
    pub method: String,
    pub confidence: f64,
    pub savings: f64,
    /// Payment path (`none`, `preauth`, `signed`).
    pub payment: String,
    /// How this request was served (`origin`, `subscriber`, `replay`).
    pub dedup: String,
    pub latency_ms: u64,
    pub success: bool,
}

impl TrafficEntry {
    pub fn new(
        request_id: &str,
        requested_model: &str,
        decision: &crate::router::RoutingDecision,
    ) -> Self {
        Self {
            id: request_id.to_string(),
            timestamp: Utc::now(),
            requested_model: requested_model.to_string(),
            model: decision.model.clone(),
            tier: decision.tier.map(|t| t.to_string()).unwrap_or_else(|| "-".into()),
            method: serde_json::to_value(decision.method)
                .ok()
                .and_then(|v| v.as_str().map(String::from))
                .unwrap_or_default(),
            confidence: decision.confidence,
            savings: decision.savings,
            payment: "none".into(),
            dedup: "origin".into(),
            latency_ms: 0,
            success: false,
        }
    }

    pub fn with_payment(mut self, payment: &str) -> Self {
        self.payment = payment.to_string();
        self
    }

    pub fn with_dedup(mut self, dedup: &str) -> Self {
        self.dedup = dedup.to_string();
        self
    }

    pub fn finished(mut self, latency_ms: u64, success: bool) -> Self {
        self.latency_ms = latency_ms;
        self.success = success;
        self
    }
}

/// Aggregates exposed on the health endpoint.
#[derive(Debug, Serialize)]
pub struct TrafficStats {
    pub total_requests: usize,
    /// Requests served without a fresh upstream send.
    pub deduped: usize,
    /// Requests that signed a new payment authorization.
    pub challenges_signed: usize,
    pub avg_savings: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Tier;
    use crate::router::{RouteMethod, RoutingDecision};

    fn decision() -> RoutingDecision {
        RoutingDecision {
            model: "google/gemini-2.5-flash-lite".into(),
            tier: Some(Tier::Simple),
            confidence: 0.92,
            method: RouteMethod::Scored,
            cost_estimate: 0.0001,
            baseline_cost: 0.03,
            savings: 0.98,
            reasoning: "scored".into(),
        }
    }

    fn entry() -> TrafficEntry {
        TrafficEntry::new("req-1", "auto", &decision()).finished(12, true)
    }

    #[tokio::test]
    async fn push_and_read_back() {
        let log = TrafficLog::new(10);
        log.push(entry());
        let recent = log.recent(10).await;
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].model, "google/gemini-2.5-flash-lite");
        assert_eq!(recent[0].tier, "SIMPLE");
        assert_eq!(recent[0].method, "scored");
    }

    #[tokio::test]
    async fn oldest_entry_evicted_at_capacity() {
        let log = TrafficLog::new(2);
        log.push(entry().with_dedup("origin"));
        log.push(entry().with_dedup("subscriber"));
        log.push(entry().with_dedup("replay"));

        let recent = log.recent(10).await;
        assert_eq!(recent.len(), 2);
        assert!(!recent.iter().any(|e| e.dedup == "origin"));
    }

    #[tokio::test]
    async fn stats_count_dedup_and_payment() {
        let log = TrafficLog::new(10);
        log.push(entry());
        log.push(entry().with_dedup("replay"));
        log.push(entry().with_payment("signed"));

        let stats = log.stats().await;
        assert_eq!(stats.total_requests, 3);
        assert_eq!(stats.deduped, 1);
        assert_eq!(stats.challenges_signed, 1);
        assert!((stats.avg_savings - 0.98).abs() < 1e-9);
    }

    #[test]
    fn entry_preserves_the_correlation_id() {
        let e = TrafficEntry::new("trace-42.span-7", "auto", &decision());
        assert_eq!(e.id, "trace-42.span-7");
    }
}
