//! Per-tenant usage metrics: delta counters plus a rolling latency window.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::Mutex;

/// Latency samples retained per tenant between reports.
const LATENCY_WINDOW: usize = 100;

#[derive(Debug, Default)]
struct TenantMetrics {
    requests: u64,
    errors: u64,
    auth_failures: u64,
    latencies: Vec<f64>,
    last_request_at: Option<i64>,
}

/// One report record pushed to the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsReport {
    pub connection_id: String,
    pub request_count: u64,
    pub error_count: u64,
    pub auth_failures: u64,
    pub p95_latency_ms: f64,
    pub active_sessions: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_request_at: Option<String>,
}

#[derive(Default)]
pub(crate) struct MetricsStore {
    inner: Mutex<HashMap<String, TenantMetrics>>,
}

impl MetricsStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) async fn ensure(&self, tenant_id: &str) {
        self.inner
            .lock()
            .await
            .entry(tenant_id.to_string())
            .or_default();
    }

    pub(crate) async fn record_request(
        &self,
        tenant_id: &str,
        latency_ms: f64,
        is_error: bool,
        now_epoch_seconds: i64,
    ) {
        let mut inner = self.inner.lock().await;
        let entry = inner.entry(tenant_id.to_string()).or_default();
        entry.requests += 1;
        entry.last_request_at = Some(now_epoch_seconds);
        if is_error {
            entry.errors += 1;
        }
        entry.latencies.push(latency_ms);
        if entry.latencies.len() > LATENCY_WINDOW {
            let excess = entry.latencies.len() - LATENCY_WINDOW;
            entry.latencies.drain(..excess);
        }
    }

    pub(crate) async fn record_auth_failure(&self, tenant_id: &str) {
        let mut inner = self.inner.lock().await;
        inner.entry(tenant_id.to_string()).or_default().auth_failures += 1;
    }

    /// Builds one report per tenant with any non-zero delta, then zeroes the
    /// deltas and clears the latency ring. `last_request_at` is a gauge and
    /// survives the reset.
    pub(crate) async fn collect_and_reset(
        &self,
        active_sessions: &HashMap<String, u32>,
    ) -> Vec<MetricsReport> {
        let mut inner = self.inner.lock().await;
        let mut reports = Vec::new();
        for (tenant_id, entry) in inner.iter_mut() {
            if entry.requests == 0 && entry.errors == 0 && entry.auth_failures == 0 {
                continue;
            }
            reports.push(MetricsReport {
                connection_id: tenant_id.clone(),
                request_count: entry.requests,
                error_count: entry.errors,
                auth_failures: entry.auth_failures,
                p95_latency_ms: p95(&entry.latencies),
                active_sessions: active_sessions.get(tenant_id).copied().unwrap_or(0),
                last_request_at: entry.last_request_at.and_then(format_epoch_rfc3339),
            });
            entry.requests = 0;
            entry.errors = 0;
            entry.auth_failures = 0;
            entry.latencies.clear();
        }
        reports
    }
}

/// P95 by copy, sort, and select at `⌊0.95·n⌋` clamped to the last index.
fn p95(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(f64::total_cmp);
    let idx = (sorted.len() as f64 * 0.95) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn format_epoch_rfc3339(epoch_seconds: i64) -> Option<String> {
    OffsetDateTime::from_unix_timestamp(epoch_seconds)
        .ok()?
        .format(&Rfc3339)
        .ok()
}
