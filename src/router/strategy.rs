//! The six selection strategies plus tag-based (identical to simple-shuffle
//! once mandatory tag filtering has already run). Each operates over an
//! already health/tag/limit-filtered candidate list.

use std::sync::Mutex;

use crate::deployment::Deployment;
use crate::pricing::{PricingRegistry, UNKNOWN_MODEL_COST};
use crate::stats::DeploymentStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    SimpleShuffle,
    RoundRobin,
    LowestLatency,
    LeastBusy,
    LowestTpmRpm,
    LowestCost,
    TagBased,
}

pub struct Candidate<'a> {
    pub deployment: &'a Deployment,
    pub stats: &'a DeploymentStats,
}

/// Mutex-protected single random source per Router (spec §5).
pub struct Rng(Mutex<fastrand::Rng>);

impl Rng {
    pub fn new() -> Self {
        Self(Mutex::new(fastrand::Rng::new()))
    }

    pub fn f64(&self) -> f64 {
        self.0.lock().unwrap().f64()
    }

    pub fn usize(&self, bound: usize) -> usize {
        self.0.lock().unwrap().usize(0..bound)
    }

    pub fn shuffle<T>(&self, items: &mut [T]) {
        self.0.lock().unwrap().shuffle(items);
    }
}

impl Default for Rng {
    fn default() -> Self {
        Self::new()
    }
}

pub fn weighted_random<'a>(candidates: &[Candidate<'a>], rng: &Rng) -> Option<usize> {
    if candidates.is_empty() {
        return None;
    }
    let total_weight: f64 = candidates.iter().map(|c| c.deployment.weight.max(0.0)).sum();
    if total_weight <= 0.0 {
        return Some(rng.usize(candidates.len()));
    }
    let mut target = rng.f64() * total_weight;
    for (i, c) in candidates.iter().enumerate() {
        target -= c.deployment.weight.max(0.0);
        if target <= 0.0 {
            return Some(i);
        }
    }
    Some(candidates.len() - 1)
}

pub fn round_robin(candidates_len: usize, counter: u64) -> Option<usize> {
    if candidates_len == 0 {
        None
    } else {
        Some((counter % candidates_len as u64) as usize)
    }
}

pub fn lowest_latency<'a>(candidates: &[Candidate<'a>], is_streaming: bool, latency_buffer: f64, rng: &Rng) -> Option<usize> {
    if candidates.is_empty() {
        return None;
    }
    let mut order: Vec<usize> = (0..candidates.len()).collect();
    rng.shuffle(&mut order);
    order.sort_by(|&a, &b| {
        let la = sample_latency(candidates[a].stats, is_streaming);
        let lb = sample_latency(candidates[b].stats, is_streaming);
        la.partial_cmp(&lb).unwrap_or(std::cmp::Ordering::Equal)
    });
    let lowest = sample_latency(candidates[order[0]].stats, is_streaming);
    let threshold = lowest * (1.0 + latency_buffer);
    let within: Vec<usize> = order.iter().copied().filter(|&i| sample_latency(candidates[i].stats, is_streaming) <= threshold).collect();
    if within.len() == 1 {
        return Some(within[0]);
    }
    let weights: Vec<f64> = within
        .iter()
        .map(|&i| {
            let c = &candidates[i];
            let latency = sample_latency(c.stats, is_streaming).max(1.0);
            let success_rate = c.stats.ewma_success_rate.max(0.0);
            c.deployment.weight.max(0.0) * success_rate * success_rate / latency
        })
        .collect();
    let total: f64 = weights.iter().sum();
    if total <= 0.0 {
        return Some(within[0]);
    }
    let mut target = rng.f64() * total;
    for (pos, w) in weights.iter().enumerate() {
        target -= w;
        if target <= 0.0 {
            return Some(within[pos]);
        }
    }
    Some(*within.last().unwrap())
}

fn sample_latency(stats: &DeploymentStats, is_streaming: bool) -> f64 {
    let avg = if is_streaming { stats.average_ttft() } else { stats.average_latency() };
    if avg > 0.0 {
        avg
    } else {
        f64::MAX / 2.0
    }
}

pub fn least_busy<'a>(candidates: &[Candidate<'a>], rng: &Rng) -> Option<usize> {
    if candidates.is_empty() {
        return None;
    }
    let min = candidates.iter().map(|c| c.stats.active_requests).min().unwrap();
    let ties: Vec<usize> = candidates.iter().enumerate().filter(|(_, c)| c.stats.active_requests == min).map(|(i, _)| i).collect();
    Some(ties[rng.usize(ties.len())])
}

/// Default token estimate used when the caller's request gives none.
pub const DEFAULT_TPM_ESTIMATE: u32 = 100;

pub fn lowest_tpm_rpm<'a>(candidates: &[Candidate<'a>], estimated_tokens: u32, now_minute: u64) -> Option<usize> {
    let estimate = if estimated_tokens > 0 { estimated_tokens } else { DEFAULT_TPM_ESTIMATE };
    let fitting: Vec<usize> = candidates
        .iter()
        .enumerate()
        .filter(|(_, c)| {
            let tpm_now = c.stats.tpm.current(now_minute);
            let rpm_now = c.stats.rpm.current(now_minute);
            let tpm_ok = c.deployment.tpm_limit.map(|limit| tpm_now + estimate as u64 <= limit as u64).unwrap_or(true);
            let rpm_ok = c.deployment.rpm_limit.map(|limit| rpm_now + 1 <= limit as u64).unwrap_or(true);
            tpm_ok && rpm_ok
        })
        .map(|(i, _)| i)
        .collect();
    fitting.into_iter().min_by_key(|&i| candidates[i].stats.tpm.current(now_minute))
}

pub fn lowest_cost<'a>(candidates: &[Candidate<'a>], pricing: &PricingRegistry, rng: &Rng) -> Option<usize> {
    if candidates.is_empty() {
        return None;
    }
    let mut order: Vec<usize> = (0..candidates.len()).collect();
    rng.shuffle(&mut order);
    order.sort_by(|&a, &b| {
        cost_of(candidates[a].deployment, pricing).partial_cmp(&cost_of(candidates[b].deployment, pricing)).unwrap_or(std::cmp::Ordering::Equal)
    });
    order.into_iter().next()
}

fn cost_of(deployment: &Deployment, pricing: &PricingRegistry) -> f64 {
    let (input, output) = match (deployment.input_cost_per_token, deployment.output_cost_per_token) {
        (Some(i), Some(o)) => (i, o),
        _ => match pricing.lookup(&deployment.provider, &deployment.model) {
            Some(cost) => (cost.input_cost_per_token, cost.output_cost_per_token),
            None => (UNKNOWN_MODEL_COST, UNKNOWN_MODEL_COST),
        },
    };
    input + output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deployment::Deployment;
    use crate::stats::DeploymentStats;

    fn dep(id: &str, weight: f64) -> Deployment {
        Deployment::new(id, "openai", "gpt-4o", "https://api.openai.com").with_weight(weight)
    }

    #[test]
    fn least_busy_picks_the_minimum_active_count() {
        let d0 = dep("a", 1.0);
        let d1 = dep("b", 1.0);
        let mut s0 = DeploymentStats::new();
        s0.active_requests = 5;
        let s1 = DeploymentStats::new();
        let candidates = vec![Candidate { deployment: &d0, stats: &s0 }, Candidate { deployment: &d1, stats: &s1 }];
        let rng = Rng::new();
        assert_eq!(least_busy(&candidates, &rng), Some(1));
    }

    #[test]
    fn lowest_cost_prefers_registry_price_over_unknown_sentinel() {
        let d0 = Deployment::new("openai-dep", "openai", "gpt-4o", "https://api.openai.com");
        let d1 = Deployment::new("custom-dep", "custom", "gpt-4o", "https://custom.example").with_cost(0.5, 0.5);
        let s0 = DeploymentStats::new();
        let s1 = DeploymentStats::new();
        let candidates = vec![Candidate { deployment: &d0, stats: &s0 }, Candidate { deployment: &d1, stats: &s1 }];
        let pricing = PricingRegistry::new();
        let rng = Rng::new();
        assert_eq!(lowest_cost(&candidates, &pricing, &rng), Some(0));
    }

    #[test]
    fn lowest_tpm_rpm_rejects_all_when_none_fit() {
        let mut d0 = dep("a", 1.0);
        d0.tpm_limit = Some(10);
        let mut s0 = DeploymentStats::new();
        s0.tpm.minute = 0;
        s0.tpm.count = 10;
        let candidates = vec![Candidate { deployment: &d0, stats: &s0 }];
        assert_eq!(lowest_tpm_rpm(&candidates, 50, 0), None);
    }
}
