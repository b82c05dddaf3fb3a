use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use http::StatusCode;

use crate::error::Error;
use crate::util::lock_unpoisoned;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ClientMetricsSnapshot {
    pub requests_started: u64,
    pub requests_succeeded: u64,
    pub requests_failed: u64,
    pub retries: u64,
    pub redirects: u64,
    pub cache_hits: u64,
    pub timeouts: u64,
    pub cancellations: u64,
    pub in_flight: u64,
    pub latency_samples: u64,
    pub latency_total_ms: u64,
    pub latency_avg_ms: f64,
    pub status_counts: BTreeMap<u16, u64>,
    pub error_counts: BTreeMap<String, u64>,
}

/// Counters shared by a client and every client extended from it.
/// A disabled instance records nothing and snapshots as all zeros.
#[derive(Clone, Debug, Default)]
pub(crate) struct ClientMetrics {
    inner: Option<Arc<ClientMetricsInner>>,
}

#[derive(Debug, Default)]
struct ClientMetricsInner {
    requests_started: AtomicU64,
    requests_succeeded: AtomicU64,
    requests_failed: AtomicU64,
    retries: AtomicU64,
    redirects: AtomicU64,
    cache_hits: AtomicU64,
    timeouts: AtomicU64,
    cancellations: AtomicU64,
    in_flight: AtomicU64,
    latency_total_ms: AtomicU64,
    latency_samples: AtomicU64,
    status_counts: Mutex<BTreeMap<u16, u64>>,
    error_counts: Mutex<BTreeMap<String, u64>>,
}

pub(crate) struct InFlightGuard {
    inner: Option<Arc<ClientMetricsInner>>,
}

impl ClientMetrics {
    pub(crate) fn enabled() -> Self {
        Self {
            inner: Some(Arc::new(ClientMetricsInner::default())),
        }
    }

    pub(crate) fn disabled() -> Self {
        Self::default()
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    pub(crate) fn enter_session(&self) -> InFlightGuard {
        if let Some(inner) = &self.inner {
            inner.requests_started.fetch_add(1, Ordering::Relaxed);
            inner.in_flight.fetch_add(1, Ordering::Relaxed);
        }
        InFlightGuard {
            inner: self.inner.clone(),
        }
    }

    pub(crate) fn record_retry(&self) {
        if let Some(inner) = &self.inner {
            inner.retries.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_redirect(&self) {
        if let Some(inner) = &self.inner {
            inner.redirects.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_cache_hit(&self) {
        if let Some(inner) = &self.inner {
            inner.cache_hits.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_success(&self, status: StatusCode, latency: Duration) {
        let Some(inner) = &self.inner else {
            return;
        };
        inner.requests_succeeded.fetch_add(1, Ordering::Relaxed);
        add_status_count(inner, status.as_u16());
        record_latency(inner, latency);
    }

    pub(crate) fn record_failure(&self, error: &Error, latency: Duration) {
        let Some(inner) = &self.inner else {
            return;
        };
        inner.requests_failed.fetch_add(1, Ordering::Relaxed);
        record_latency(inner, latency);
        if let Some(status) = error.status() {
            add_status_count(inner, status);
        }
        if let Some(phase) = error.timeout_phase() {
            inner.timeouts.fetch_add(1, Ordering::Relaxed);
            add_error_count(inner, format!("timeout:{phase}"));
            return;
        }
        if error.is_cancel() {
            inner.cancellations.fetch_add(1, Ordering::Relaxed);
        }
        match error.transport_code() {
            Some(code) => add_error_count(inner, format!("{}:{code}", error.code())),
            None => add_error_count(inner, error.code().as_str().to_owned()),
        }
    }

    pub(crate) fn snapshot(&self) -> ClientMetricsSnapshot {
        let Some(inner) = &self.inner else {
            return ClientMetricsSnapshot::default();
        };
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        let latency_samples = load(&inner.latency_samples);
        let latency_total_ms = load(&inner.latency_total_ms);
        let latency_avg_ms = if latency_samples == 0 {
            0.0
        } else {
            latency_total_ms as f64 / latency_samples as f64
        };

        ClientMetricsSnapshot {
            requests_started: load(&inner.requests_started),
            requests_succeeded: load(&inner.requests_succeeded),
            requests_failed: load(&inner.requests_failed),
            retries: load(&inner.retries),
            redirects: load(&inner.redirects),
            cache_hits: load(&inner.cache_hits),
            timeouts: load(&inner.timeouts),
            cancellations: load(&inner.cancellations),
            in_flight: load(&inner.in_flight),
            latency_samples,
            latency_total_ms,
            latency_avg_ms,
            status_counts: lock_unpoisoned(&inner.status_counts).clone(),
            error_counts: lock_unpoisoned(&inner.error_counts).clone(),
        }
    }
}

fn record_latency(inner: &ClientMetricsInner, latency: Duration) {
    inner.latency_samples.fetch_add(1, Ordering::Relaxed);
    inner.latency_total_ms.fetch_add(
        latency.as_millis().min(u64::MAX as u128) as u64,
        Ordering::Relaxed,
    );
}

fn add_status_count(inner: &ClientMetricsInner, status: u16) {
    let mut status_counts = lock_unpoisoned(&inner.status_counts);
    *status_counts.entry(status).or_insert(0) += 1;
}

fn add_error_count(inner: &ClientMetricsInner, error_key: String) {
    let mut error_counts = lock_unpoisoned(&inner.error_counts);
    *error_counts.entry(error_key).or_insert(0) += 1;
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Some(inner) = &self.inner {
            inner.in_flight.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TimeoutPhase;

    #[test]
    fn sessions_track_in_flight_counts() {
        let metrics = ClientMetrics::enabled();
        let guard = metrics.enter_session();
        assert_eq!(metrics.snapshot().in_flight, 1);
        drop(guard);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.in_flight, 0);
        assert_eq!(snapshot.requests_started, 1);
    }

    #[test]
    fn failures_are_bucketed_by_code() {
        let metrics = ClientMetrics::enabled();
        metrics.record_failure(
            &Error::timeout(
                TimeoutPhase::Request,
                Duration::from_millis(50),
                Duration::from_millis(50),
            ),
            Duration::from_millis(50),
        );
        metrics.record_failure(&Error::cancel(), Duration::ZERO);
        metrics.record_success(StatusCode::OK, Duration::from_millis(10));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.timeouts, 1);
        assert_eq!(snapshot.cancellations, 1);
        assert_eq!(snapshot.requests_failed, 2);
        assert_eq!(snapshot.error_counts.get("timeout:request"), Some(&1));
        assert_eq!(snapshot.error_counts.get("cancel"), Some(&1));
        assert_eq!(snapshot.status_counts.get(&200), Some(&1));
    }

    #[test]
    fn disabled_metrics_stay_empty() {
        let metrics = ClientMetrics::disabled();
        let _guard = metrics.enter_session();
        metrics.record_retry();
        assert!(!metrics.is_enabled());
        assert_eq!(metrics.snapshot(), ClientMetricsSnapshot::default());
    }
}
