//! 统计快照类型

use std::collections::BTreeMap;

use serde::Serialize;

use super::model::UsageRecord;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub started_at: String,
    pub uptime_secs: u64,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub success_rate: f64,
    pub failures_by_kind: BTreeMap<String, u64>,
    pub providers: Vec<ProviderStats>,
    pub owners: Vec<OwnerStats>,
    pub stream_terminations: BTreeMap<String, u64>,
    pub recent: Vec<UsageRecord>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderStats {
    pub id: String,
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub avg_latency_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerStats {
    pub owner_id: String,
    pub requests: u64,
    pub successes: u64,
}
