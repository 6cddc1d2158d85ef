use chrono::Utc;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub timestamp: String,
    pub uptime_secs: u64,
    pub registrations: RegistrationMetrics,
    pub submissions: SubmissionMetrics,
    pub confirmation: ConfirmationMetrics,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistrationMetrics {
    pub requested: u64,
    pub pool_exhausted: u64,
    pub completed: u64,
    pub failed: u64,
    pub success_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmissionMetrics {
    pub submitted: u64,
    pub rejected: u64,
    pub retried: u64,
    pub timeouts: u64,
    pub renonced: u64,
    pub wallets_retired: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfirmationMetrics {
    pub confirmed: u64,
    pub avg_latency_ms: f64,
    pub min_latency_ms: u64,
    pub max_latency_ms: u64,
}

#[derive(Debug)]
pub struct SequencerMetrics {
    registrations_requested: AtomicU64,
    pool_exhausted: AtomicU64,
    registrations_completed: AtomicU64,
    registrations_failed: AtomicU64,
    submitted: AtomicU64,
    rejected: AtomicU64,
    retried: AtomicU64,
    timeouts: AtomicU64,
    renonced: AtomicU64,
    wallets_retired: AtomicU64,
    confirmed: AtomicU64,
    confirm_latency_sum_ms: AtomicU64,
    confirm_min_latency_ms: AtomicU64,
    confirm_max_latency_ms: AtomicU64,
    start_time: Instant,
}

impl Default for SequencerMetrics {
    fn default() -> Self {
        Self {
            registrations_requested: AtomicU64::new(0),
            pool_exhausted: AtomicU64::new(0),
            registrations_completed: AtomicU64::new(0),
            registrations_failed: AtomicU64::new(0),
            submitted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            renonced: AtomicU64::new(0),
            wallets_retired: AtomicU64::new(0),
            confirmed: AtomicU64::new(0),
            confirm_latency_sum_ms: AtomicU64::new(0),
            confirm_min_latency_ms: AtomicU64::new(u64::MAX),
            confirm_max_latency_ms: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }
}

impl SequencerMetrics {
    pub fn record_request(&self) {
        self.registrations_requested.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_pool_exhausted(&self) {
        self.pool_exhausted.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_submission(&self) {
        self.submitted.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_rejection(&self) {
        self.rejected.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_retry(&self) {
        self.retried.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_renonce(&self) {
        self.renonced.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_retirement(&self) {
        self.wallets_retired.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_failure(&self) {
        self.registrations_failed.fetch_add(1, Ordering::SeqCst);
    }

    /// Confirmation of a registration, with the time since its first submission
    pub fn record_confirmation(&self, latency: Duration) {
        self.confirmed.fetch_add(1, Ordering::SeqCst);
        self.registrations_completed.fetch_add(1, Ordering::SeqCst);

        let latency_ms = latency.as_millis() as u64;
        self.confirm_latency_sum_ms
            .fetch_add(latency_ms, Ordering::SeqCst);
        self.confirm_min_latency_ms
            .fetch_min(latency_ms, Ordering::SeqCst);
        self.confirm_max_latency_ms
            .fetch_max(latency_ms, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let completed = self.registrations_completed.load(Ordering::SeqCst);
        let failed = self.registrations_failed.load(Ordering::SeqCst);
        let resolved = completed + failed;

        let confirmed = self.confirmed.load(Ordering::SeqCst);
        let latency_sum = self.confirm_latency_sum_ms.load(Ordering::SeqCst);
        let min_latency = self.confirm_min_latency_ms.load(Ordering::SeqCst);

        MetricsSnapshot {
            timestamp: Utc::now().to_rfc3339(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            registrations: RegistrationMetrics {
                requested: self.registrations_requested.load(Ordering::SeqCst),
                pool_exhausted: self.pool_exhausted.load(Ordering::SeqCst),
                completed,
                failed,
                success_rate: if resolved > 0 {
                    completed as f64 / resolved as f64 * 100.0
                } else {
                    0.0
                },
            },
            submissions: SubmissionMetrics {
                submitted: self.submitted.load(Ordering::SeqCst),
                rejected: self.rejected.load(Ordering::SeqCst),
                retried: self.retried.load(Ordering::SeqCst),
                timeouts: self.timeouts.load(Ordering::SeqCst),
                renonced: self.renonced.load(Ordering::SeqCst),
                wallets_retired: self.wallets_retired.load(Ordering::SeqCst),
            },
            confirmation: ConfirmationMetrics {
                confirmed,
                avg_latency_ms: if confirmed > 0 {
                    latency_sum as f64 / confirmed as f64
                } else {
                    0.0
                },
                min_latency_ms: if min_latency == u64::MAX { 0 } else { min_latency },
                max_latency_ms: self.confirm_max_latency_ms.load(Ordering::SeqCst),
            },
        }
    }

    pub fn to_json(&self) -> String {
        let snapshot = self.snapshot();
        serde_json::to_string_pretty(&snapshot).unwrap_or_else(|_| "{}".to_string())
    }

    pub async fn export_to_file(&self, path: &str) -> std::io::Result<()> {
        let json = self.to_json();
        tokio::fs::write(path, json).await
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confirmation_latency() {
        let metrics = SequencerMetrics::default();
        metrics.record_confirmation(Duration::from_millis(100));
        metrics.record_confirmation(Duration::from_millis(300));
        metrics.record_failure();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.confirmation.confirmed, 2);
        assert_eq!(snapshot.confirmation.min_latency_ms, 100);
        assert_eq!(snapshot.confirmation.max_latency_ms, 300);
        assert_eq!(snapshot.confirmation.avg_latency_ms, 200.0);
        assert!((snapshot.registrations.success_rate - 66.666).abs() < 0.01);
    }

    #[test]
    fn test_empty_snapshot() {
        let metrics = SequencerMetrics::default();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.confirmation.min_latency_ms, 0);
        assert_eq!(snapshot.registrations.success_rate, 0.0);
        assert!(metrics.to_json().contains("\"pool_exhausted\": 0"));
    }
}
