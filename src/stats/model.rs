//! 请求用量记录

use serde::Serialize;

/// 单个请求的最终结果（只追加，不修改）
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageRecord {
    pub trace_id: String,
    pub provider_id: Option<String>,
    pub owner_id: Option<String>,
    /// "success" 或错误类型
    pub status: String,
    pub latency_ms: u64,
    pub streaming: bool,
    pub timestamp: String,
}

impl UsageRecord {
    pub const SUCCESS: &'static str = "success";

    pub fn new(trace_id: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            trace_id: trace_id.into(),
            provider_id: None,
            owner_id: None,
            status: status.into(),
            latency_ms: 0,
            streaming: false,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn with_provider(mut self, provider_id: impl Into<String>) -> Self {
        self.provider_id = Some(provider_id.into());
        self
    }

    pub fn with_owner(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }

    pub fn with_latency_ms(mut self, latency_ms: u64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    pub fn streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == Self::SUCCESS
    }
}
