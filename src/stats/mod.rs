//! Per-deployment statistics: the contract (this module), an in-process
//! implementation (`memory`), and a distributed one (`distributed`).

pub mod distributed;
pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::deployment::DeploymentId;
use crate::error::GatewayError;

pub const DEFAULT_ROLLING_WINDOW: usize = 10;
pub const FAILURE_WINDOW_MINUTES: u64 = 5;
pub const EWMA_ALPHA_DEFAULT: f64 = 0.1;
/// Appended to the latency window on a timeout so latency-based routing
/// self-avoids a deployment that is timing out.
pub const TIMEOUT_PENALTY_MS: f64 = 1_000_000.0;

#[derive(Debug, Clone, Copy, Default)]
pub struct SuccessMetrics {
    pub latency_ms: f64,
    pub ttft_ms: Option<f64>,
    pub tokens: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct FailureOpts {
    pub is_single_deployment: bool,
    pub status: u16,
}

/// One bucket of 60 seconds tagged by its UTC unix-minute key, used for both
/// the TPM/RPM window and the sliding success/failure windows.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MinuteBucket {
    pub minute: u64,
    pub count: u64,
}

impl MinuteBucket {
    /// Add to the bucket if it's still the current minute, else reset it to
    /// a fresh bucket for `minute` with this sample as its only entry.
    pub fn add(&mut self, minute: u64, amount: u64) {
        if self.minute != minute {
            self.minute = minute;
            self.count = 0;
        }
        self.count += amount;
    }

    pub fn current(&self, minute: u64) -> u64 {
        if self.minute == minute {
            self.count
        } else {
            0
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeploymentStats {
    pub total_requests: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub active_requests: u64,
    pub latency_window: Vec<f64>,
    pub ttft_window: Vec<f64>,
    pub ewma_latency: f64,
    pub ewma_ttft: f64,
    pub ewma_success_rate: f64,
    pub tpm: MinuteBucket,
    pub rpm: MinuteBucket,
    /// Indexed by `minute % (FAILURE_WINDOW_MINUTES+1)`, each a (minute, count).
    pub success_buckets: Vec<MinuteBucket>,
    pub failure_buckets: Vec<MinuteBucket>,
    pub last_request_time_ms: i64,
    /// Unix millis; zero means inactive.
    pub cooldown_until_ms: i64,
}

impl DeploymentStats {
    pub fn new() -> Self {
        let bucket_count = (FAILURE_WINDOW_MINUTES + 1) as usize;
        Self {
            success_buckets: vec![MinuteBucket::default(); bucket_count],
            failure_buckets: vec![MinuteBucket::default(); bucket_count],
            ..Default::default()
        }
    }

    pub fn is_circuit_open(&self, now_ms: i64) -> bool {
        self.cooldown_until_ms > now_ms
    }

    pub fn average_latency(&self) -> f64 {
        average(&self.latency_window)
    }

    pub fn average_ttft(&self) -> f64 {
        average(&self.ttft_window)
    }

    /// Sum of failures/successes over the sliding window of the last
    /// `FAILURE_WINDOW_MINUTES` complete minutes (current minute included).
    pub fn sliding_window_totals(&self, now_minute: u64) -> (u64, u64) {
        let window = FAILURE_WINDOW_MINUTES;
        let mut successes = 0u64;
        let mut failures = 0u64;
        for offset in 0..window {
            let minute = now_minute.saturating_sub(offset);
            let idx = (minute % (window + 1)) as usize;
            if self.success_buckets[idx].minute == minute {
                successes += self.success_buckets[idx].count;
            }
            if self.failure_buckets[idx].minute == minute {
                failures += self.failure_buckets[idx].count;
            }
        }
        (successes, failures)
    }

    fn push_window(window: &mut Vec<f64>, sample: f64) {
        window.push(sample);
        if window.len() > DEFAULT_ROLLING_WINDOW {
            window.remove(0);
        }
    }

    pub fn apply_success(&mut self, metrics: SuccessMetrics, now_minute: u64, now_ms: i64, alpha: f64) {
        self.total_requests += 1;
        self.success_count += 1;
        self.last_request_time_ms = now_ms;
        Self::push_window(&mut self.latency_window, metrics.latency_ms);
        self.ewma_latency = ewma(self.ewma_latency, metrics.latency_ms, alpha, self.success_count == 1);
        if let Some(ttft) = metrics.ttft_ms {
            Self::push_window(&mut self.ttft_window, ttft);
            self.ewma_ttft = ewma(self.ewma_ttft, ttft, alpha, self.ttft_window.len() == 1);
        }
        self.ewma_success_rate = ewma(self.ewma_success_rate, 1.0, alpha, self.total_requests == 1);
        self.tpm.add(now_minute, metrics.tokens as u64);
        self.rpm.add(now_minute, 1);
        let idx = (now_minute % (FAILURE_WINDOW_MINUTES + 1)) as usize;
        self.success_buckets[idx].add(now_minute, 1);
    }

    pub fn apply_failure(&mut self, opts: FailureOpts, now_minute: u64, now_ms: i64, alpha: f64) {
        self.total_requests += 1;
        self.failure_count += 1;
        self.last_request_time_ms = now_ms;
        if opts.status == 408 {
            Self::push_window(&mut self.latency_window, TIMEOUT_PENALTY_MS);
        }
        self.ewma_success_rate = ewma(self.ewma_success_rate, 0.0, alpha, self.total_requests == 1);
        let idx = (now_minute % (FAILURE_WINDOW_MINUTES + 1)) as usize;
        self.failure_buckets[idx].add(now_minute, 1);
    }
}

fn average(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        0.0
    } else {
        samples.iter().sum::<f64>() / samples.len() as f64
    }
}

fn ewma(old: f64, sample: f64, alpha: f64, is_first: bool) -> f64 {
    if is_first {
        sample
    } else {
        alpha * sample + (1.0 - alpha) * old
    }
}

/// One contract, two implementations (in-process / distributed). All
/// operations are idempotent per call; ordering across the
/// increment/record/decrement triple is the caller's responsibility (see
/// the Router, which enforces it per request).
#[async_trait]
pub trait StatsStore: Send + Sync {
    async fn get_stats(&self, id: &DeploymentId) -> Result<Option<DeploymentStats>, GatewayError>;
    async fn increment_active_requests(&self, id: &DeploymentId) -> Result<(), GatewayError>;
    async fn decrement_active_requests(&self, id: &DeploymentId) -> Result<(), GatewayError>;
    async fn record_success(&self, id: &DeploymentId, metrics: SuccessMetrics) -> Result<(), GatewayError>;
    async fn record_failure(&self, id: &DeploymentId, opts: FailureOpts) -> Result<(), GatewayError>;
    async fn set_cooldown(&self, id: &DeploymentId, until_ms: i64) -> Result<(), GatewayError>;
    async fn get_cooldown_until(&self, id: &DeploymentId) -> Result<i64, GatewayError>;
    async fn delete_stats(&self, id: &DeploymentId) -> Result<(), GatewayError>;
    async fn list_deployments(&self) -> Result<Vec<DeploymentId>, GatewayError>;
    async fn close(&self) -> Result<(), GatewayError>;
}

/// Current UTC unix-minute, used as the bucket key everywhere (integer
/// buckets, not `YYYY-MM-DD-HH-MM` strings — see DESIGN.md).
pub fn current_minute(now_ms: i64) -> u64 {
    (now_ms / 60_000).max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rolling_window_evicts_oldest_at_capacity() {
        let mut stats = DeploymentStats::new();
        for i in 0..(DEFAULT_ROLLING_WINDOW as i64 + 5) {
            stats.apply_success(SuccessMetrics { latency_ms: i as f64, ttft_ms: None, tokens: 1 }, 0, 0, 0.1);
        }
        assert_eq!(stats.latency_window.len(), DEFAULT_ROLLING_WINDOW);
        assert_eq!(*stats.latency_window.first().unwrap(), 5.0);
    }

    #[test]
    fn cooldown_open_until_exactly_the_deadline() {
        let mut stats = DeploymentStats::new();
        stats.cooldown_until_ms = 1000;
        assert!(stats.is_circuit_open(999));
        assert!(!stats.is_circuit_open(1000));
    }

    #[test]
    fn minute_bucket_resets_on_rollover() {
        let mut bucket = MinuteBucket::default();
        bucket.add(5, 3);
        bucket.add(5, 2);
        assert_eq!(bucket.current(5), 5);
        bucket.add(6, 1);
        assert_eq!(bucket.current(6), 1);
        assert_eq!(bucket.current(5), 0);
    }
}
