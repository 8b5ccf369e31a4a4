//! In-process `StatsStore`, grounded in the teacher's dashmap use throughout
//! `caching.rs` / `rate_limiting.rs`: one `DashMap` entry per deployment,
//! each guarded by its own `Mutex` so one writer touches one deployment at a
//! time without a global lock.

use std::sync::Mutex;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::deployment::DeploymentId;
use crate::error::GatewayError;

use super::{current_minute, DeploymentStats, FailureOpts, StatsStore, SuccessMetrics, EWMA_ALPHA_DEFAULT};

pub struct InMemoryStatsStore {
    entries: DashMap<DeploymentId, Mutex<DeploymentStats>>,
    alpha: f64,
}

impl InMemoryStatsStore {
    pub fn new() -> Self {
        Self { entries: DashMap::new(), alpha: EWMA_ALPHA_DEFAULT }
    }

    pub fn with_alpha(alpha: f64) -> Self {
        Self { entries: DashMap::new(), alpha }
    }

    fn entry(&self, id: &DeploymentId) -> dashmap::mapref::one::RefMut<'_, DeploymentId, Mutex<DeploymentStats>> {
        self.entries.entry(id.clone()).or_insert_with(|| Mutex::new(DeploymentStats::new()))
    }
}

impl Default for InMemoryStatsStore {
    fn default() -> Self {
        Self::new()
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[async_trait]
impl StatsStore for InMemoryStatsStore {
    async fn get_stats(&self, id: &DeploymentId) -> Result<Option<DeploymentStats>, GatewayError> {
        Ok(self.entries.get(id).map(|e| e.lock().unwrap().clone()))
    }

    async fn increment_active_requests(&self, id: &DeploymentId) -> Result<(), GatewayError> {
        let entry = self.entry(id);
        let mut stats = entry.lock().unwrap();
        stats.active_requests += 1;
        Ok(())
    }

    async fn decrement_active_requests(&self, id: &DeploymentId) -> Result<(), GatewayError> {
        let entry = self.entry(id);
        let mut stats = entry.lock().unwrap();
        stats.active_requests = stats.active_requests.saturating_sub(1);
        Ok(())
    }

    async fn record_success(&self, id: &DeploymentId, metrics: SuccessMetrics) -> Result<(), GatewayError> {
        let now = now_ms();
        let entry = self.entry(id);
        let mut stats = entry.lock().unwrap();
        stats.apply_success(metrics, current_minute(now), now, self.alpha);
        Ok(())
    }

    async fn record_failure(&self, id: &DeploymentId, opts: FailureOpts) -> Result<(), GatewayError> {
        let now = now_ms();
        let entry = self.entry(id);
        let mut stats = entry.lock().unwrap();
        stats.apply_failure(opts, current_minute(now), now, self.alpha);
        Ok(())
    }

    async fn set_cooldown(&self, id: &DeploymentId, until_ms: i64) -> Result<(), GatewayError> {
        let entry = self.entry(id);
        entry.lock().unwrap().cooldown_until_ms = until_ms;
        Ok(())
    }

    async fn get_cooldown_until(&self, id: &DeploymentId) -> Result<i64, GatewayError> {
        Ok(self.entries.get(id).map(|e| e.lock().unwrap().cooldown_until_ms).unwrap_or(0))
    }

    async fn delete_stats(&self, id: &DeploymentId) -> Result<(), GatewayError> {
        self.entries.remove(id);
        Ok(())
    }

    async fn list_deployments(&self) -> Result<Vec<DeploymentId>, GatewayError> {
        Ok(self.entries.iter().map(|e| e.key().clone()).collect())
    }

    async fn close(&self) -> Result<(), GatewayError> {
        Ok(())
    }
}
