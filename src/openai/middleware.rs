//! OpenAI 兼容 API 中间件

use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::common::auth;
use crate::provider::ProviderRegistry;
use crate::quota::{AuthManager, CredentialEntry};
use crate::router::Dispatcher;
use crate::stats::StatsCollector;
use crate::streaming::{DirectRelay, StreamRelay};

/// 应用共享状态
#[derive(Clone)]
pub struct AppState {
    pub auth: Arc<AuthManager>,
    pub registry: Arc<ProviderRegistry>,
    pub dispatcher: Arc<Dispatcher>,
    pub relay: Arc<dyn StreamRelay>,
    pub stats: Arc<StatsCollector>,
    /// 请求未携带 stream 字段时的默认值
    pub stream_by_default: bool,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(auth: Arc<AuthManager>, dispatcher: Arc<Dispatcher>, stats: Arc<StatsCollector>) -> Self {
        Self {
            auth,
            registry: dispatcher.registry().clone(),
            dispatcher,
            relay: Arc::new(DirectRelay),
            stats,
            stream_by_default: false,
            started_at: Instant::now(),
        }
    }

    /// 设置流式输出策略
    pub fn with_relay(mut self, relay: Arc<dyn StreamRelay>) -> Self {
        self.relay = relay;
        self
    }

    pub fn with_stream_by_default(mut self, stream_by_default: bool) -> Self {
        self.stream_by_default = stream_by_default;
        self
    }
}

/// 已认证的调用方，由 auth_middleware 写入请求扩展
#[derive(Clone)]
pub struct Caller(pub Arc<CredentialEntry>);

/// Bearer 认证中间件
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let presented = auth::extract_bearer(&request);
    match state.auth.authenticate(presented.as_deref()) {
        Ok(credential) => {
            request.extensions_mut().insert(Caller(credential));
            next.run(request).await
        }
        Err(err) => {
            let trace_id = uuid::Uuid::new_v4().to_string();
            tracing::warn!(
                trace_id = %trace_id,
                path = %request.uri().path(),
                error = err.kind(),
                "请求认证失败"
            );
            state.stats.record_rejection(&trace_id, err.kind());
            err.into_response()
        }
    }
}

/// CORS 中间层
///
/// 允许任何来源、方法和请求头，浏览器前端可直接调用
pub fn cors_layer() -> tower_http::cors::CorsLayer {
    use tower_http::cors::{Any, CorsLayer};

    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers(Any)
}
