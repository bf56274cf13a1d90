//! OpenAI 兼容 API 类型定义

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::provider::HealthState;
use crate::quota::CredentialUsage;
use crate::router::AttemptRecord;
use crate::stats::StatsSnapshot;

// === Chat Completions 端点类型 ===

/// 对话补全请求
///
/// 只解析路由需要的字段，其余字段原样透传给上游
#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<Value>,
    #[serde(default)]
    pub stream: Option<bool>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// 发往上游的请求体（模型名已按 Provider 解析）
#[derive(Serialize)]
struct UpstreamRequest<'a> {
    model: &'a str,
    messages: &'a [Value],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(flatten)]
    extra: &'a Map<String, Value>,
}

impl ChatCompletionRequest {
    pub fn validate(&self) -> Result<(), String> {
        if self.model.trim().is_empty() {
            return Err("model is required".to_string());
        }
        if self.messages.is_empty() {
            return Err("messages must not be empty".to_string());
        }
        Ok(())
    }

    pub fn upstream_body(&self, upstream_model: &str, stream: bool) -> serde_json::Result<Bytes> {
        let body = UpstreamRequest {
            model: upstream_model,
            messages: &self.messages,
            stream,
            max_tokens: self.max_tokens,
            extra: &self.extra,
        };
        serde_json::to_vec(&body).map(Bytes::from)
    }
}

/// 附加在非流式响应上的路由元数据（`_router_info`）
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterInfo {
    pub provider: String,
    pub latency_ms: u64,
    pub remaining_quota: u32,
    pub trace_id: String,
    pub attempts: Vec<AttemptRecord>,
    pub owner_id: String,
    pub streaming: bool,
}

// === Models 端点类型 ===

#[derive(Debug, Serialize)]
pub struct Model {
    pub id: String,
    pub object: &'static str,
    pub owned_by: String,
}

#[derive(Debug, Serialize)]
pub struct ModelsResponse {
    pub object: &'static str,
    pub data: Vec<Model>,
}

// === 服务状态端点类型 ===

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderCounts {
    pub total: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_secs: u64,
    pub timestamp: String,
    pub providers: ProviderCounts,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthUserInfo {
    pub owner_id: String,
    pub daily_limit: u32,
    pub active: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthInfoResponse {
    pub auth_mode: &'static str,
    pub quota_policy: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shared_daily_limit: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub users: Option<Vec<AuthUserInfo>>,
    pub usage_note: &'static str,
}

/// 单个 Provider 的健康视图
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderHealthView {
    pub id: String,
    pub kind: &'static str,
    pub weight: u32,
    #[serde(flatten)]
    pub health: HealthState,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    pub caller: CredentialUsage,
    pub providers: Vec<ProviderHealthView>,
    pub stats: StatsSnapshot,
}
