//! 统计聚合

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::model::UsageRecord;
use super::types::{OwnerStats, ProviderStats, StatsSnapshot};
use crate::streaming::TerminationReason;

/// 默认保留的最近记录条数
const DEFAULT_RECENT_CAPACITY: usize = 200;

#[derive(Debug, Default)]
struct ProviderCounters {
    attempts: u64,
    successes: u64,
    failures: u64,
    latency_total_ms: u64,
}

#[derive(Debug, Default)]
struct OwnerCounters {
    requests: u64,
    successes: u64,
}

/// 统计收集器
pub struct StatsCollector {
    started_at: DateTime<Utc>,
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    failures_by_kind: Mutex<HashMap<String, u64>>,
    providers: Mutex<HashMap<String, ProviderCounters>>,
    owners: Mutex<HashMap<String, OwnerCounters>>,
    stream_terminations: Mutex<HashMap<&'static str, u64>>,
    recent: Mutex<VecDeque<UsageRecord>>,
    recent_capacity: usize,
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new(DEFAULT_RECENT_CAPACITY)
    }
}

impl StatsCollector {
    pub fn new(recent_capacity: usize) -> Self {
        Self {
            started_at: Utc::now(),
            total_requests: AtomicU64::new(0),
            successful_requests: AtomicU64::new(0),
            failures_by_kind: Mutex::new(HashMap::new()),
            providers: Mutex::new(HashMap::new()),
            owners: Mutex::new(HashMap::new()),
            stream_terminations: Mutex::new(HashMap::new()),
            recent: Mutex::new(VecDeque::with_capacity(recent_capacity)),
            recent_capacity: recent_capacity.max(1),
        }
    }

    /// 记录一个请求的最终结果
    ///
    /// 每个请求恰好调用一次（成功、失败或在认证阶段被拒绝）
    pub fn record_completion(&self, record: UsageRecord) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        let success = record.is_success();
        if success {
            self.successful_requests.fetch_add(1, Ordering::Relaxed);
        } else {
            *self
                .failures_by_kind
                .lock()
                .entry(record.status.clone())
                .or_default() += 1;
        }

        if let Some(owner_id) = &record.owner_id {
            let mut owners = self.owners.lock();
            let counters = owners.entry(owner_id.clone()).or_default();
            counters.requests += 1;
            if success {
                counters.successes += 1;
            }
        }

        let mut recent = self.recent.lock();
        if recent.len() >= self.recent_capacity {
            recent.pop_front();
        }
        recent.push_back(record);
    }

    /// 记录认证阶段被拒绝的请求（没有已知的调用方）
    pub fn record_rejection(&self, trace_id: &str, kind: &str) {
        self.record_completion(UsageRecord::new(trace_id, kind));
    }

    /// 记录一次对上游的尝试结果
    pub fn record_attempt(&self, provider_id: &str, success: bool, latency: Duration) {
        let mut providers = self.providers.lock();
        let counters = providers.entry(provider_id.to_string()).or_default();
        counters.attempts += 1;
        counters.latency_total_ms += latency.as_millis() as u64;
        if success {
            counters.successes += 1;
        } else {
            counters.failures += 1;
        }
    }

    /// 流式响应头已返回（计为成功）但之后由上游中断：改记为失败
    pub fn record_stream_failure(&self, provider_id: &str) {
        let mut providers = self.providers.lock();
        let counters = providers.entry(provider_id.to_string()).or_default();
        if counters.successes > 0 {
            counters.successes -= 1;
            counters.failures += 1;
        } else {
            counters.attempts += 1;
            counters.failures += 1;
        }
    }

    /// 记录流式会话的终止原因
    pub fn record_stream_termination(&self, reason: TerminationReason) {
        *self
            .stream_terminations
            .lock()
            .entry(reason.as_str())
            .or_default() += 1;
    }

    /// 某个终止原因出现的次数
    #[cfg(test)]
    pub fn stream_termination_count(&self, reason: TerminationReason) -> u64 {
        self.stream_terminations
            .lock()
            .get(reason.as_str())
            .copied()
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let total = self.total_requests.load(Ordering::Relaxed);
        let successes = self.successful_requests.load(Ordering::Relaxed);
        let failed = total.saturating_sub(successes);
        let uptime = (Utc::now() - self.started_at).num_seconds().max(0) as u64;

        let failures_by_kind: BTreeMap<String, u64> = self
            .failures_by_kind
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();

        let mut providers: Vec<ProviderStats> = self
            .providers
            .lock()
            .iter()
            .map(|(id, c)| ProviderStats {
                id: id.clone(),
                attempts: c.attempts,
                successes: c.successes,
                failures: c.failures,
                avg_latency_ms: if c.attempts > 0 {
                    c.latency_total_ms as f64 / c.attempts as f64
                } else {
                    0.0
                },
            })
            .collect();
        providers.sort_by(|a, b| a.id.cmp(&b.id));

        let mut owners: Vec<OwnerStats> = self
            .owners
            .lock()
            .iter()
            .map(|(owner_id, c)| OwnerStats {
                owner_id: owner_id.clone(),
                requests: c.requests,
                successes: c.successes,
            })
            .collect();
        owners.sort_by(|a, b| a.owner_id.cmp(&b.owner_id));

        let stream_terminations = self
            .stream_terminations
            .lock()
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect();

        StatsSnapshot {
            started_at: self.started_at.to_rfc3339(),
            uptime_secs: uptime,
            total_requests: total,
            successful_requests: successes,
            failed_requests: failed,
            success_rate: if total > 0 {
                successes as f64 / total as f64
            } else {
                0.0
            },
            failures_by_kind,
            providers,
            owners,
            stream_terminations,
            recent: self.recent.lock().iter().cloned().collect(),
        }
    }
}
