//! Response cache: a sha256-derived key over the semantic content of a
//! request (never the tenant id verbatim) plus TTL-bounded storage, grounded
//! in the teacher's `caching.rs` shape (atomic hit/miss counters) but backed
//! by real `DashMap` storage instead of a no-op stub.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use sha2::{Digest, Sha256};

use crate::schemas::ChatRequest;

#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

struct Entry {
    value: String,
    expires_at: Instant,
}

pub struct CacheManager {
    entries: DashMap<String, Entry>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheManager {
    pub fn new(ttl: Duration) -> Self {
        Self { entries: DashMap::new(), ttl, hits: AtomicU64::new(0), misses: AtomicU64::new(0) }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let hit = self.entries.get(key).and_then(|entry| if entry.expires_at > Instant::now() { Some(entry.value.clone()) } else { None });
        if hit.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.entries.remove(key);
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        hit
    }

    pub fn set(&self, key: String, value: String) {
        self.entries.insert(key, Entry { value, expires_at: Instant::now() + self.ttl });
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats { hits: self.hits.load(Ordering::Relaxed), misses: self.misses.load(Ordering::Relaxed) }
    }
}

/// `sha256(tenant_scope || model || canonical messages || temperature ||
/// top_p || max_tokens || sorted extras)`, formatted as `chat:<64-hex>`.
/// `tenant_scope` only ever feeds the hash input; it never appears in the
/// output string, satisfying invariant 5 (spec §8).
pub fn chat_cache_key(tenant_scope: &str, request: &ChatRequest) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tenant_scope.as_bytes());
    hasher.update(b"\0");
    hasher.update(request.model.as_bytes());
    hasher.update(b"\0");
    for message in &request.messages {
        hasher.update(format!("{:?}", message.role).as_bytes());
        hasher.update(message.content.to_string().as_bytes());
        hasher.update(b"\x1f");
    }
    hasher.update(b"\0");
    hasher.update(request.temperature.map(|v| v.to_bits()).unwrap_or(0).to_le_bytes());
    hasher.update(request.top_p.map(|v| v.to_bits()).unwrap_or(0).to_le_bytes());
    hasher.update(request.max_tokens.unwrap_or(0).to_le_bytes());
    // `extra` is a BTreeMap, so iteration order is already sorted — stable
    // regardless of the caller's original insertion order.
    for (k, v) in &request.extra {
        hasher.update(k.as_bytes());
        hasher.update(v.to_string().as_bytes());
    }
    let digest = hasher.finalize();
    format!("chat:{}", hex_encode(&digest))
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schemas::Message;
    use std::collections::BTreeMap;

    fn req(model: &str) -> ChatRequest {
        ChatRequest {
            model: model.into(),
            messages: vec![Message::user("hi")],
            stream: None,
            temperature: None,
            top_p: None,
            max_tokens: None,
            stop: None,
            n: None,
            presence_penalty: None,
            frequency_penalty: None,
            user: None,
            tags: vec![],
            extra: BTreeMap::new(),
        }
    }

    #[test]
    fn key_differs_across_tenants_and_never_contains_the_tenant_id() {
        let request = req("gpt-4o");
        let key_a = chat_cache_key("tenant-alpha", &request);
        let key_b = chat_cache_key("tenant-beta", &request);
        assert_ne!(key_a, key_b);
        assert!(!key_a.contains("tenant-alpha"));
        assert!(key_a.starts_with("chat:"));
        assert_eq!(key_a.len(), "chat:".len() + 64);
    }

    #[test]
    fn key_is_stable_regardless_of_extra_insertion_order() {
        let mut a = req("gpt-4o");
        a.extra.insert("b".into(), serde_json::json!(2));
        a.extra.insert("a".into(), serde_json::json!(1));
        let mut b = req("gpt-4o");
        b.extra.insert("a".into(), serde_json::json!(1));
        b.extra.insert("b".into(), serde_json::json!(2));
        assert_eq!(chat_cache_key("t", &a), chat_cache_key("t", &b));
    }

    #[test]
    fn key_changes_when_a_scored_parameter_changes() {
        let mut a = req("gpt-4o");
        let mut b = req("gpt-4o");
        a.temperature = Some(0.1);
        b.temperature = Some(0.9);
        assert_ne!(chat_cache_key("t", &a), chat_cache_key("t", &b));
    }
}
