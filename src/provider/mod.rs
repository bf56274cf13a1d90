//! 上游 Provider 注册表
//!
//! Provider 的身份信息在加载后不可变，健康状态只由健康检查路径写入

pub mod client;
pub mod health;

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::model::config::ProviderConfig;

pub use client::{ProviderClient, UpstreamFailure, UpstreamReply};
pub use health::{HealthChecker, HealthState, HealthStatus};

/// Provider 协议类型
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// OpenAI 兼容的云端 API（DeepSeek、OpenAI 等）
    #[default]
    OpenAi,
    /// 本地推理服务（Ollama 等）
    Generic,
}

impl ProviderKind {
    /// 健康探测使用的路径
    pub fn probe_path(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "/models",
            ProviderKind::Generic => "/api/tags",
        }
    }

    /// 对话补全使用的路径
    pub fn completions_path(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "/chat/completions",
            ProviderKind::Generic => "/v1/chat/completions",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Generic => "generic",
        }
    }
}

/// 上游 Provider（加载后不可变）
#[derive(Debug, Clone)]
pub struct Provider {
    id: String,
    base_url: String,
    kind: ProviderKind,
    api_key: Option<String>,
    models: Vec<String>,
    aliases: HashMap<String, String>,
    weight: u32,
    timeout: Duration,
}

impl Provider {
    pub fn from_config(config: &ProviderConfig) -> Self {
        Self {
            id: config.id.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            kind: config.kind,
            api_key: config.api_key.clone().filter(|k| !k.is_empty()),
            models: config.models.clone(),
            aliases: config.aliases.clone(),
            weight: config.weight.max(1),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> ProviderKind {
        self.kind
    }

    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref()
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn models(&self) -> &[String] {
        &self.models
    }

    /// 是否能处理该模型（直接提供或通过别名映射）
    pub fn serves(&self, model: &str) -> bool {
        self.models.iter().any(|m| m == model) || self.aliases.contains_key(model)
    }

    /// 解析发往上游的模型名
    pub fn upstream_model<'a>(&'a self, model: &'a str) -> &'a str {
        self.aliases.get(model).map(String::as_str).unwrap_or(model)
    }

    /// 拼接上游完整 URL
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

/// EWMA 平滑系数的分母（新样本权重 1/4）
const LATENCY_EWMA_WEIGHT: u64 = 4;

/// 注册表中的 Provider 条目：不可变身份 + 可变健康状态
#[derive(Debug)]
pub struct ProviderEntry {
    provider: Provider,
    health: RwLock<HealthState>,
    /// 最近请求延迟的 EWMA（毫秒），0 表示尚无样本
    recent_latency_ms: AtomicU64,
}

impl ProviderEntry {
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            health: RwLock::new(HealthState::default()),
            recent_latency_ms: AtomicU64::new(0),
        }
    }

    pub fn provider(&self) -> &Provider {
        &self.provider
    }

    pub fn id(&self) -> &str {
        self.provider.id()
    }

    /// 当前健康状态快照
    pub fn health(&self) -> HealthState {
        self.health.read().clone()
    }

    pub fn status(&self) -> HealthStatus {
        self.health.read().status
    }

    /// 写入一次探测结果，返回状态变化 (旧, 新)
    pub(crate) fn apply_probe<F>(&self, update: F) -> Option<(HealthStatus, HealthStatus)>
    where
        F: FnOnce(&mut HealthState) -> Option<(HealthStatus, HealthStatus)>,
    {
        let mut health = self.health.write();
        update(&mut health)
    }

    /// 记录一次转发请求的延迟
    pub fn observe_latency(&self, latency: Duration) {
        let sample = (latency.as_millis() as u64).max(1);
        let _ = self
            .recent_latency_ms
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                if current == 0 {
                    Some(sample)
                } else {
                    Some(current - current / LATENCY_EWMA_WEIGHT + sample / LATENCY_EWMA_WEIGHT)
                }
            });
    }

    /// 最近观测到的延迟：优先使用请求 EWMA，其次使用探测延迟
    ///
    /// 都没有样本时返回 u64::MAX
    pub fn observed_latency_ms(&self) -> u64 {
        match self.recent_latency_ms.load(Ordering::Acquire) {
            0 => self.health.read().last_latency_ms.unwrap_or(u64::MAX),
            latency => latency,
        }
    }
}

/// Provider 注册表
#[derive(Debug, Clone)]
pub struct ProviderRegistry {
    entries: Vec<Arc<ProviderEntry>>,
}

impl ProviderRegistry {
    pub fn new(providers: Vec<Provider>) -> Self {
        Self {
            entries: providers
                .into_iter()
                .map(|p| Arc::new(ProviderEntry::new(p)))
                .collect(),
        }
    }

    pub fn from_configs(configs: &[ProviderConfig]) -> Self {
        Self::new(configs.iter().map(Provider::from_config).collect())
    }

    pub fn all(&self) -> &[Arc<ProviderEntry>] {
        &self.entries
    }

    #[cfg(test)]
    pub fn get(&self, id: &str) -> Option<Arc<ProviderEntry>> {
        self.entries.iter().find(|e| e.id() == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 是否有任一 Provider 配置了该模型（不考虑健康状态）
    pub fn serves(&self, model: &str) -> bool {
        self.entries.iter().any(|e| e.provider().serves(model))
    }

    /// 可参与选择的 Provider：提供该模型且不是 Unhealthy
    pub fn eligible(&self, model: &str) -> Vec<Arc<ProviderEntry>> {
        self.entries
            .iter()
            .filter(|e| e.provider().serves(model) && e.status() != HealthStatus::Unhealthy)
            .cloned()
            .collect()
    }

    /// 所有对外可见的模型名（直接提供的模型与别名的并集），已排序
    pub fn models(&self) -> Vec<String> {
        let mut names = BTreeSet::new();
        for entry in &self.entries {
            let provider = entry.provider();
            names.extend(provider.models.iter().cloned());
            names.extend(provider.aliases.keys().cloned());
        }
        names.into_iter().collect()
    }

    /// 各健康状态的 Provider 数量 (healthy, degraded, unhealthy)
    pub fn status_counts(&self) -> (usize, usize, usize) {
        let mut counts = (0, 0, 0);
        for entry in &self.entries {
            match entry.status() {
                HealthStatus::Healthy => counts.0 += 1,
                HealthStatus::Degraded => counts.1 += 1,
                HealthStatus::Unhealthy => counts.2 += 1,
            }
        }
        counts
    }
}
