//! Provider 健康状态与周期性健康检查

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};

use super::client::ProviderClient;
use super::{ProviderEntry, ProviderRegistry};
use crate::model::config::HealthConfig;

/// 健康状态
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// 初始状态为 Healthy，首次探测前即可接收流量
    #[default]
    Healthy,
    /// 可用但延迟偏高，选择权重降低
    Degraded,
    /// 不参与选择
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 单个 Provider 的健康状态
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthState {
    pub status: HealthStatus,
    pub consecutive_failures: u32,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub last_latency_ms: Option<u64>,
}

impl HealthState {
    /// 记录一次成功探测：清零失败计数，按延迟判定 Healthy / Degraded
    ///
    /// 从 Unhealthy 恢复时总是先回到 Healthy，延迟在下一次探测时再判定。
    /// 状态发生变化时返回 (旧, 新)
    pub fn record_success(
        &mut self,
        latency: Duration,
        degraded_latency_ms: u64,
        now: DateTime<Utc>,
    ) -> Option<(HealthStatus, HealthStatus)> {
        let latency_ms = latency.as_millis() as u64;
        let old = self.status;
        self.consecutive_failures = 0;
        self.last_checked_at = Some(now);
        self.last_latency_ms = Some(latency_ms);
        self.status = if old != HealthStatus::Unhealthy && latency_ms > degraded_latency_ms {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
        (old != self.status).then_some((old, self.status))
    }

    /// 记录一次失败探测：连续失败达到阈值时标记为 Unhealthy
    pub fn record_failure(
        &mut self,
        failure_threshold: u32,
        now: DateTime<Utc>,
    ) -> Option<(HealthStatus, HealthStatus)> {
        let old = self.status;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_checked_at = Some(now);
        if self.consecutive_failures >= failure_threshold {
            self.status = HealthStatus::Unhealthy;
        }
        (old != self.status).then_some((old, self.status))
    }
}

/// 周期性健康检查器
///
/// 只写入注册表中的健康状态，不参与请求处理
pub struct HealthChecker {
    registry: Arc<ProviderRegistry>,
    client: ProviderClient,
    interval: Duration,
    timeout: Duration,
    failure_threshold: u32,
    degraded_latency_ms: u64,
}

impl HealthChecker {
    pub fn new(registry: Arc<ProviderRegistry>, client: ProviderClient, config: &HealthConfig) -> Self {
        Self {
            registry,
            client,
            interval: Duration::from_secs(config.interval_secs),
            timeout: Duration::from_secs(config.timeout_secs),
            failure_threshold: config.failure_threshold.max(1),
            degraded_latency_ms: config.degraded_latency_ms,
        }
    }

    /// 在后台任务中运行
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    /// 运行检查循环，第一次检查立即执行
    pub async fn run(&self) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            providers = self.registry.len(),
            interval_secs = self.interval.as_secs(),
            "健康检查任务已启动"
        );

        loop {
            ticker.tick().await;
            self.check_all().await;
        }
    }

    /// 并发探测所有 Provider
    pub async fn check_all(&self) {
        let checks = self.registry.all().iter().map(|entry| self.check_one(entry));
        join_all(checks).await;

        let (healthy, degraded, unhealthy) = self.registry.status_counts();
        tracing::debug!(healthy, degraded, unhealthy, "健康检查完成");
    }

    async fn check_one(&self, entry: &ProviderEntry) {
        let result = self.client.probe(entry.provider(), self.timeout).await;
        let now = Utc::now();

        let transition = match &result {
            Ok(latency) => {
                let latency = *latency;
                entry.apply_probe(|h| h.record_success(latency, self.degraded_latency_ms, now))
            }
            Err(failure) => {
                tracing::debug!(
                    provider = %entry.id(),
                    error = %failure.summary(),
                    "健康探测失败"
                );
                let threshold = self.failure_threshold;
                entry.apply_probe(|h| h.record_failure(threshold, now))
            }
        };

        if let Some((from, to)) = transition {
            let at = now.to_rfc3339();
            match to {
                HealthStatus::Unhealthy => tracing::warn!(
                    provider = %entry.id(),
                    from = %from,
                    to = %to,
                    at = %at,
                    "Provider 健康状态变化"
                ),
                _ => tracing::info!(
                    provider = %entry.id(),
                    from = %from,
                    to = %to,
                    at = %at,
                    "Provider 健康状态变化"
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MockUpstream, provider_config_for, upstream_client};

    #[test]
    fn test_failures_reach_threshold() {
        let mut state = HealthState::default();
        let now = Utc::now();

        assert!(state.record_failure(3, now).is_none());
        assert!(state.record_failure(3, now).is_none());
        assert_eq!(state.status, HealthStatus::Healthy);

        let transition = state.record_failure(3, now);
        assert_eq!(transition, Some((HealthStatus::Healthy, HealthStatus::Unhealthy)));
        assert_eq!(state.consecutive_failures, 3);
    }

    #[test]
    fn test_single_success_recovers() {
        let mut state = HealthState::default();
        let now = Utc::now();
        for _ in 0..3 {
            state.record_failure(3, now);
        }

        let transition = state.record_success(Duration::from_millis(120), 2000, now);
        assert_eq!(transition, Some((HealthStatus::Unhealthy, HealthStatus::Healthy)));
        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(state.last_latency_ms, Some(120));
    }

    #[test]
    fn test_slow_probe_is_degraded() {
        let mut state = HealthState::default();
        let now = Utc::now();

        let transition = state.record_success(Duration::from_millis(2500), 2000, now);
        assert_eq!(transition, Some((HealthStatus::Healthy, HealthStatus::Degraded)));

        // 恢复到正常延迟
        let transition = state.record_success(Duration::from_millis(50), 2000, now);
        assert_eq!(transition, Some((HealthStatus::Degraded, HealthStatus::Healthy)));
    }

    #[test]
    fn test_slow_recovery_is_healthy_then_degraded() {
        let mut state = HealthState::default();
        let now = Utc::now();
        for _ in 0..3 {
            state.record_failure(3, now);
        }

        let transition = state.record_success(Duration::from_millis(2500), 2000, now);
        assert_eq!(transition, Some((HealthStatus::Unhealthy, HealthStatus::Healthy)));
        assert_eq!(state.consecutive_failures, 0);

        let transition = state.record_success(Duration::from_millis(2500), 2000, now);
        assert_eq!(transition, Some((HealthStatus::Healthy, HealthStatus::Degraded)));
    }

    #[tokio::test]
    async fn test_check_all_marks_unreachable_provider() {
        let up = MockUpstream::ok_json(r#"{"data":[]}"#).await;
        let registry = Arc::new(ProviderRegistry::from_configs(&[
            provider_config_for("up", &up.base_url(), &["m"]),
            // 端口 1 上没有服务，连接会被拒绝
            provider_config_for("down", "http://127.0.0.1:1", &["m"]),
        ]));

        let config = HealthConfig {
            interval_secs: 1,
            timeout_secs: 2,
            failure_threshold: 3,
            degraded_latency_ms: 2000,
        };
        let checker = HealthChecker::new(registry.clone(), ProviderClient::new(upstream_client()), &config);
        for _ in 0..3 {
            checker.check_all().await;
        }

        let up_entry = registry.get("up").unwrap();
        let down_entry = registry.get("down").unwrap();
        assert_eq!(up_entry.status(), HealthStatus::Healthy);
        assert_eq!(up_entry.health().consecutive_failures, 0);
        assert!(up_entry.health().last_checked_at.is_some());
        assert_eq!(down_entry.status(), HealthStatus::Unhealthy);
        assert_eq!(down_entry.health().consecutive_failures, 3);
        assert!(up.probe_count() >= 3);
    }
}
