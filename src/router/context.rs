//! 单个请求的路由上下文

use std::time::{Duration, Instant};

use serde::Serialize;

use crate::common::truncate_with_ellipsis;
use crate::provider::UpstreamFailure;

/// 一次失败的上游尝试
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptRecord {
    pub provider: String,
    pub error: String,
    pub message: String,
    pub latency_ms: u64,
}

impl AttemptRecord {
    pub fn new(provider: &str, failure: &UpstreamFailure, latency: Duration) -> Self {
        Self {
            provider: provider.to_string(),
            error: failure.kind().to_string(),
            message: truncate_with_ellipsis(&failure.summary(), 300),
            latency_ms: latency.as_millis() as u64,
        }
    }
}

#[derive(Debug)]
pub struct RequestContext {
    pub trace_id: String,
    /// 调用方请求的模型名（别名解析前）
    pub model: String,
    /// 已尝试的 Provider，按顺序
    pub attempted: Vec<String>,
    pub retry_count: u32,
    pub started_at: Instant,
}

impl RequestContext {
    pub fn new(trace_id: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            trace_id: trace_id.into(),
            model: model.into(),
            attempted: Vec::new(),
            retry_count: 0,
            started_at: Instant::now(),
        }
    }

    pub fn has_attempted(&self, provider_id: &str) -> bool {
        self.attempted.iter().any(|id| id == provider_id)
    }

    pub fn record_attempt(&mut self, provider_id: &str) {
        if !self.attempted.is_empty() {
            self.retry_count += 1;
        }
        self.attempted.push(provider_id.to_string());
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}
