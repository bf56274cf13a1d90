//! 平滑加权轮询选择

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::provider::{HealthStatus, ProviderEntry};

/// Degraded 状态下权重除以该值（最小为 1）
pub const DEGRADED_WEIGHT_DIVISOR: u32 = 4;

/// 按当前健康状态计算有效权重
pub fn effective_weight(entry: &ProviderEntry) -> i64 {
    let weight = entry.provider().weight().max(1);
    match entry.status() {
        HealthStatus::Degraded => (weight / DEGRADED_WEIGHT_DIVISOR).max(1) as i64,
        _ => weight as i64,
    }
}

/// 平滑加权轮询（nginx 算法）
///
/// 每次选择时所有候选的当前值加上有效权重，取最大者并减去总权重。
/// 当前值相同时选择最近延迟最低的 Provider。
#[derive(Debug, Default)]
pub struct WeightedSelector {
    current: Mutex<HashMap<String, i64>>,
}

impl WeightedSelector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn select(&self, candidates: &[Arc<ProviderEntry>]) -> Option<Arc<ProviderEntry>> {
        if candidates.is_empty() {
            return None;
        }

        let weighted: Vec<(&Arc<ProviderEntry>, i64, u64)> = candidates
            .iter()
            .map(|e| (e, effective_weight(e), e.observed_latency_ms()))
            .collect();
        let total: i64 = weighted.iter().map(|(_, w, _)| w).sum();

        let mut current = self.current.lock();
        let mut best: Option<(&Arc<ProviderEntry>, i64, u64)> = None;
        for (entry, weight, latency) in weighted {
            let value = current.entry(entry.id().to_string()).or_insert(0);
            *value += weight;
            let value = *value;

            let better = match best {
                None => true,
                Some((_, best_value, best_latency)) => {
                    value > best_value || (value == best_value && latency < best_latency)
                }
            };
            if better {
                best = Some((entry, value, latency));
            }
        }

        let (chosen, _, _) = best?;
        if let Some(value) = current.get_mut(chosen.id()) {
            *value -= total;
        }
        Some(chosen.clone())
    }
}
