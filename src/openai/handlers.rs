//! OpenAI 兼容 API 处理器

use std::time::{Duration, Instant};

use axum::{
    Extension, Json,
    body::Bytes,
    extract::State,
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::de::IgnoredAny;

use super::middleware::{AppState, Caller};
use super::types::{
    AuthInfoResponse, AuthUserInfo, ChatCompletionRequest, HealthResponse, Model, ModelsResponse,
    ProviderCounts, ProviderHealthView, RouterInfo, StatsResponse,
};
use crate::common::truncate_with_ellipsis;
use crate::error::RouterError;
use crate::model::config::QuotaPolicy;
use crate::model::credentials::AuthMode;
use crate::provider::UpstreamReply;
use crate::router::{Dispatched, RequestContext};
use crate::stats::UsageRecord;
use crate::streaming::{FramePump, StreamSession};

/// POST /v1/chat/completions
pub async fn chat_completions(
    State(state): State<AppState>,
    Extension(Caller(credential)): Extension<Caller>,
    body: Bytes,
) -> Response {
    let trace_id = uuid::Uuid::new_v4().to_string();

    #[cfg(feature = "sensitive-logs")]
    tracing::debug!(
        trace_id = %trace_id,
        body = %String::from_utf8_lossy(&body),
        "请求体"
    );

    let request: ChatCompletionRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            let err = RouterError::InvalidRequest(format!("Invalid JSON body: {}", e));
            return reject(&state, &trace_id, Some(credential.owner_id()), None, err);
        }
    };
    if let Err(message) = request.validate() {
        let err = RouterError::InvalidRequest(message);
        return reject(&state, &trace_id, Some(credential.owner_id()), None, err);
    }

    // 配额在联系任何上游之前检查并计数
    let mut admission = match state.auth.admit(&credential) {
        Ok(admission) => admission,
        Err(err) => return reject(&state, &trace_id, Some(credential.owner_id()), None, err),
    };

    let stream = request.stream.unwrap_or(state.stream_by_default);
    let mut ctx = RequestContext::new(trace_id.clone(), request.model.clone());

    tracing::info!(
        trace_id = %trace_id,
        owner_id = %credential.owner_id(),
        model = %request.model,
        stream,
        messages = request.messages.len(),
        "收到对话补全请求"
    );

    let mut guard = DisconnectGuard::new(&state, &trace_id, credential.owner_id());
    let dispatched = state.dispatcher.dispatch(&mut ctx, &request, stream).await;
    guard.disarm();

    let dispatched = match dispatched {
        Ok(dispatched) => dispatched,
        Err(err) => {
            admission.settle(false);
            return reject(&state, &trace_id, Some(credential.owner_id()), Some(&ctx), err);
        }
    };

    let Dispatched {
        provider,
        reply,
        latency,
        failed_attempts,
    } = dispatched;

    match reply {
        UpstreamReply::Complete(payload) => {
            let info = RouterInfo {
                provider: provider.id().to_string(),
                latency_ms: latency.as_millis() as u64,
                remaining_quota: admission.remaining(),
                trace_id: trace_id.clone(),
                attempts: failed_attempts,
                owner_id: credential.owner_id().to_string(),
                streaming: false,
            };
            match attach_router_info(&payload, &info) {
                Ok(body) => {
                    admission.settle(true);
                    state.stats.record_completion(
                        UsageRecord::new(&trace_id, UsageRecord::SUCCESS)
                            .with_provider(provider.id())
                            .with_owner(credential.owner_id())
                            .with_latency_ms(ctx.elapsed().as_millis() as u64),
                    );

                    let mut response = (StatusCode::OK, body).into_response();
                    let headers = response.headers_mut();
                    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
                    insert_router_headers(headers, &info.provider, &trace_id, info.remaining_quota, info.attempts.len());
                    insert_header(headers, "x-router-quota-reset", &admission.reset_at().to_rfc3339());
                    insert_header(headers, "x-router-latency-ms", &info.latency_ms.to_string());
                    response
                }
                Err(reason) => {
                    admission.settle(false);
                    let err = RouterError::UpstreamError {
                        provider: provider.id().to_string(),
                        status: None,
                        message: format!(
                            "malformed upstream payload ({}): {}",
                            reason,
                            truncate_with_ellipsis(&String::from_utf8_lossy(&payload), 512)
                        ),
                    };
                    reject(&state, &trace_id, Some(credential.owner_id()), Some(&ctx), err)
                }
            }
        }
        UpstreamReply::Stream(upstream) => {
            let remaining = admission.remaining();
            let reset_at = admission.reset_at();
            let retries = failed_attempts.len();
            let session = StreamSession::new(trace_id.clone(), provider.id(), state.stats.clone())
                .with_admission(admission)
                .with_started_at(ctx.started_at);
            let pump = FramePump::new(upstream, provider.provider().timeout(), session);

            let mut response = Response::new(state.relay.relay(pump));
            let headers = response.headers_mut();
            headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
            headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
            headers.insert(
                HeaderName::from_static("x-accel-buffering"),
                HeaderValue::from_static("no"),
            );
            insert_header(headers, "x-streaming-type", state.relay.name());
            insert_router_headers(headers, provider.id(), &trace_id, remaining, retries);
            insert_header(headers, "x-router-quota-reset", &reset_at.to_rfc3339());
            response
        }
    }
}

/// 调用方在分发完成前断开时，handler future 被直接丢弃，由此记录断开
struct DisconnectGuard<'a> {
    state: &'a AppState,
    trace_id: &'a str,
    owner_id: &'a str,
    started_at: Instant,
    armed: bool,
}

impl<'a> DisconnectGuard<'a> {
    fn new(state: &'a AppState, trace_id: &'a str, owner_id: &'a str) -> Self {
        Self {
            state,
            trace_id,
            owner_id,
            started_at: Instant::now(),
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for DisconnectGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let err = RouterError::ClientDisconnected;
        let elapsed_ms = self.started_at.elapsed().as_millis() as u64;
        tracing::warn!(
            trace_id = %self.trace_id,
            owner_id = %self.owner_id,
            elapsed_ms,
            "调用方在上游响应前断开连接"
        );
        self.state.stats.record_completion(
            UsageRecord::new(self.trace_id, err.kind())
                .with_owner(self.owner_id)
                .with_latency_ms(elapsed_ms),
        );
    }
}

/// 记录失败并生成错误响应
fn reject(
    state: &AppState,
    trace_id: &str,
    owner_id: Option<&str>,
    ctx: Option<&RequestContext>,
    err: RouterError,
) -> Response {
    let elapsed = ctx.map(|c| c.elapsed()).unwrap_or(Duration::ZERO);
    let attempted = ctx.map(|c| c.attempted.clone()).unwrap_or_default();

    if err.is_admission_error() {
        tracing::warn!(
            trace_id = %trace_id,
            owner_id = owner_id.unwrap_or("-"),
            error = err.kind(),
            "请求被拒绝"
        );
    } else {
        tracing::error!(
            trace_id = %trace_id,
            owner_id = owner_id.unwrap_or("-"),
            error = err.kind(),
            attempted = ?attempted,
            elapsed_ms = elapsed.as_millis() as u64,
            "请求失败: {}",
            err
        );
    }

    let mut record = UsageRecord::new(trace_id, err.kind()).with_latency_ms(elapsed.as_millis() as u64);
    if let Some(owner_id) = owner_id {
        record = record.with_owner(owner_id);
    }
    if let Some(provider) = attempted.last() {
        record = record.with_provider(provider.clone());
    }
    state.stats.record_completion(record);

    let mut response = err.into_response();
    insert_header(response.headers_mut(), "x-router-trace-id", trace_id);
    response
}

/// 在上游 JSON 对象的末尾插入 `_router_info`，其余字节保持不变
pub(crate) fn attach_router_info(payload: &[u8], info: &RouterInfo) -> Result<Bytes, String> {
    serde_json::from_slice::<IgnoredAny>(payload).map_err(|e| e.to_string())?;

    let start = payload
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .ok_or_else(|| "empty body".to_string())?;
    let end = payload
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .ok_or_else(|| "empty body".to_string())?;
    if payload[start] != b'{' || payload[end] != b'}' {
        return Err("not a JSON object".to_string());
    }
    let is_empty_object = payload[start + 1..end].iter().all(|b| b.is_ascii_whitespace());

    let info = serde_json::to_vec(info).map_err(|e| e.to_string())?;
    let mut out = Vec::with_capacity(payload.len() + info.len() + 20);
    out.extend_from_slice(&payload[..end]);
    if !is_empty_object {
        out.push(b',');
    }
    out.extend_from_slice(b"\"_router_info\":");
    out.extend_from_slice(&info);
    out.extend_from_slice(&payload[end..]);
    Ok(Bytes::from(out))
}

fn insert_router_headers(headers: &mut HeaderMap, provider: &str, trace_id: &str, remaining: u32, retries: usize) {
    insert_header(headers, "x-router-provider", provider);
    insert_header(headers, "x-router-trace-id", trace_id);
    insert_header(headers, "x-router-remaining-quota", &remaining.to_string());
    insert_header(headers, "x-router-retries", &retries.to_string());
}

fn insert_header(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(HeaderName::from_static(name), value);
    }
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let (healthy, degraded, unhealthy) = state.registry.status_counts();
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.started_at.elapsed().as_secs(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        providers: ProviderCounts {
            total: state.registry.len(),
            healthy,
            degraded,
            unhealthy,
        },
    })
}

/// GET /stats
pub async fn get_stats(
    State(state): State<AppState>,
    Extension(Caller(credential)): Extension<Caller>,
) -> impl IntoResponse {
    let providers = state
        .registry
        .all()
        .iter()
        .map(|entry| ProviderHealthView {
            id: entry.id().to_string(),
            kind: entry.provider().kind().as_str(),
            weight: entry.provider().weight(),
            health: entry.health(),
        })
        .collect();

    Json(StatsResponse {
        caller: state.auth.usage(&credential),
        providers,
        stats: state.stats.snapshot(),
    })
}

/// GET /auth/info
pub async fn auth_info(State(state): State<AppState>) -> impl IntoResponse {
    let auth = &state.auth;
    let (shared_daily_limit, users) = match auth.mode() {
        AuthMode::Shared => (auth.credentials().first().map(|c| c.daily_limit()), None),
        AuthMode::MultiUser => (
            None,
            Some(
                auth.credentials()
                    .iter()
                    .map(|c| AuthUserInfo {
                        owner_id: c.owner_id().to_string(),
                        daily_limit: c.daily_limit(),
                        active: c.is_active(),
                    })
                    .collect(),
            ),
        ),
    };

    Json(AuthInfoResponse {
        auth_mode: auth.mode().as_str(),
        quota_policy: match auth.policy() {
            QuotaPolicy::Attempt => "attempt",
            QuotaPolicy::Success => "success",
        },
        shared_daily_limit,
        users,
        usage_note: "Include 'Authorization: Bearer YOUR_API_KEY' header in requests",
    })
}

/// GET /v1/models
pub async fn list_models(State(state): State<AppState>) -> impl IntoResponse {
    let data = state
        .registry
        .models()
        .into_iter()
        .map(|id| {
            let owned_by = state
                .registry
                .all()
                .iter()
                .find(|e| e.provider().serves(&id))
                .map(|e| e.id().to_string())
                .unwrap_or_default();
            Model {
                id,
                object: "model",
                owned_by,
            }
        })
        .collect();

    Json(ModelsResponse {
        object: "list",
        data,
    })
}
