use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use crate::provider::ProviderKind;

/// 配额计数策略
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum QuotaPolicy {
    /// 请求被接受即计数（上游失败也消耗配额）
    Attempt,
    /// 仅成功完成的请求计数，失败时退还预留的配额
    Success,
}

impl Default for QuotaPolicy {
    fn default() -> Self {
        Self::Attempt
    }
}

/// 流式转发策略
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RelayStrategy {
    /// 直接在连接上写出每个帧（默认）
    Direct,
    /// 经由后台任务和有界通道缓冲（旧实现，保留作为回退）
    Buffered,
}

impl Default for RelayStrategy {
    fn default() -> Self {
        Self::Direct
    }
}

/// 上游 Provider 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    /// Provider 唯一标识
    pub id: String,

    /// 基础 URL，例如 `https://api.deepseek.com/v1` 或 `http://127.0.0.1:11434`
    pub base_url: String,

    /// 协议类型（"openai" 或 "generic"）
    #[serde(default)]
    pub kind: ProviderKind,

    /// 上游 API 密钥（可选，本地模型通常不需要）
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// 该 Provider 提供的模型名列表
    pub models: Vec<String>,

    /// 对外模型名 -> 上游模型名 的映射（可选）
    #[serde(default)]
    pub aliases: HashMap<String, String>,

    /// 加权轮询权重
    #[serde(default = "default_weight")]
    pub weight: u32,

    /// 单次请求超时（秒）
    #[serde(default = "default_provider_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_weight() -> u32 {
    1
}

fn default_provider_timeout_secs() -> u64 {
    60
}

/// 健康检查配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthConfig {
    #[serde(default = "default_health_interval_secs")]
    pub interval_secs: u64,

    #[serde(default = "default_health_timeout_secs")]
    pub timeout_secs: u64,

    /// 连续失败多少次后标记为 Unhealthy
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// 探测延迟超过该值时标记为 Degraded
    #[serde(default = "default_degraded_latency_ms")]
    pub degraded_latency_ms: u64,
}

fn default_health_interval_secs() -> u64 {
    30
}

fn default_health_timeout_secs() -> u64 {
    10
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_degraded_latency_ms() -> u64 {
    2000
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_health_interval_secs(),
            timeout_secs: default_health_timeout_secs(),
            failure_threshold: default_failure_threshold(),
            degraded_latency_ms: default_degraded_latency_ms(),
        }
    }
}

/// 路由与重试配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingConfig {
    /// 首次尝试之外的最大重试次数
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_max_retries() -> u32 {
    2
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
        }
    }
}

/// 配额配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaConfig {
    #[serde(default)]
    pub policy: QuotaPolicy,

    /// 每日重置时刻所在时区（相对 UTC 的分钟偏移，例如东八区为 480）
    #[serde(default)]
    pub timezone_offset_minutes: i32,
}

/// 流式转发配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamingConfig {
    #[serde(default)]
    pub strategy: RelayStrategy,

    /// 请求未指定 stream 字段时是否默认流式输出
    #[serde(default)]
    pub stream_by_default: bool,

    /// buffered 策略下的通道容量（帧数）
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
}

fn default_buffer_capacity() -> usize {
    32
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            strategy: RelayStrategy::default(),
            stream_by_default: false,
            buffer_capacity: default_buffer_capacity(),
        }
    }
}

/// 路由服务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// HTTP 代理地址（可选）
    /// 支持格式: http://host:port, https://host:port, socks5://host:port
    #[serde(default)]
    pub proxy_url: Option<String>,

    /// 建立上游连接的超时（秒）
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default)]
    pub providers: Vec<ProviderConfig>,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub routing: RoutingConfig,

    #[serde(default)]
    pub quota: QuotaConfig,

    #[serde(default)]
    pub streaming: StreamingConfig,

    /// 配置文件路径（运行时元数据，不写入 JSON）
    #[serde(skip)]
    config_path: Option<PathBuf>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_connect_timeout_secs() -> u64 {
    10
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            proxy_url: None,
            connect_timeout_secs: default_connect_timeout_secs(),
            providers: Vec::new(),
            health: HealthConfig::default(),
            routing: RoutingConfig::default(),
            quota: QuotaConfig::default(),
            streaming: StreamingConfig::default(),
            config_path: None,
        }
    }
}

impl Config {
    /// 获取默认配置文件路径
    pub fn default_config_path() -> &'static str {
        "config.json"
    }

    /// 从文件加载配置
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            // 配置文件不存在，返回默认配置
            let mut config = Self::default();
            config.config_path = Some(path.to_path_buf());
            return Ok(config);
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("读取配置文件失败: {}", path.display()))?;
        let mut config: Config = serde_json::from_str(&content)
            .with_context(|| format!("解析配置文件失败: {}", path.display()))?;
        config.config_path = Some(path.to_path_buf());
        Ok(config)
    }

    /// 获取配置文件路径（如果有）
    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    /// 校验配置的一致性
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut ids = HashSet::new();
        for provider in &self.providers {
            if provider.id.trim().is_empty() {
                bail!("Provider id 不能为空");
            }
            if !ids.insert(provider.id.as_str()) {
                bail!("Provider id 重复: {}", provider.id);
            }
            reqwest::Url::parse(&provider.base_url).with_context(|| {
                format!("Provider {} 的 baseUrl 无效: {}", provider.id, provider.base_url)
            })?;
            if provider.models.is_empty() && provider.aliases.is_empty() {
                bail!("Provider {} 未配置任何模型", provider.id);
            }
            if provider.weight == 0 {
                bail!("Provider {} 的 weight 必须大于 0", provider.id);
            }
            if provider.timeout_secs == 0 {
                bail!("Provider {} 的 timeoutSecs 必须大于 0", provider.id);
            }
        }

        if self.health.interval_secs == 0 || self.health.timeout_secs == 0 {
            bail!("health.intervalSecs 与 health.timeoutSecs 必须大于 0");
        }
        if self.health.failure_threshold == 0 {
            bail!("health.failureThreshold 必须大于 0");
        }
        if self.quota.timezone_offset_minutes.abs() >= 24 * 60 {
            bail!(
                "quota.timezoneOffsetMinutes 超出范围: {}",
                self.quota.timezone_offset_minutes
            );
        }
        if self.streaming.buffer_capacity == 0 {
            bail!("streaming.bufferCapacity 必须大于 0");
        }
        Ok(())
    }
}
