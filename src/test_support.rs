//! 测试辅助
//!
//! 在本地临时端口上启动模拟上游（axum），记录探测与补全请求次数，
//! 并提供构造上游字节流和完整路由服务的工具函数。

use std::collections::HashMap;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures::{Stream, StreamExt, stream};
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::model::config::{ProviderConfig, QuotaConfig, StreamingConfig};
use crate::model::credentials::CredentialsConfig;
use crate::openai::{AppState, create_router};
use crate::provider::{ProviderClient, ProviderKind, ProviderRegistry};
use crate::quota::AuthManager;
use crate::router::Dispatcher;
use crate::stats::StatsCollector;
use crate::streaming::{StreamFault, UpstreamStream, relay_for};

// ============================================================================
// 模拟上游
// ============================================================================

#[derive(Clone)]
enum Behavior {
    Json(&'static str),
    Status(u16, &'static str),
    Slow(Duration),
    Sse { chunks: usize, delay: Duration },
    SseThenError { chunks: usize },
}

struct MockState {
    behavior: Behavior,
    probes: AtomicUsize,
    completions: AtomicUsize,
    last_body: Mutex<Option<serde_json::Value>>,
}

/// 模拟的上游 Provider，被丢弃时关闭
pub struct MockUpstream {
    addr: SocketAddr,
    state: Arc<MockState>,
    handle: JoinHandle<()>,
}

impl MockUpstream {
    /// 补全请求返回固定 JSON
    pub async fn ok_json(body: &'static str) -> Self {
        Self::start(Behavior::Json(body)).await
    }

    /// 补全请求返回指定状态码
    pub async fn status(code: u16, body: &'static str) -> Self {
        Self::start(Behavior::Status(code, body)).await
    }

    /// 补全请求在 delay 之后才响应
    pub async fn slow(delay: Duration) -> Self {
        Self::start(Behavior::Slow(delay)).await
    }

    /// 补全请求返回 SSE：chunks 个数据帧加 [DONE]
    pub async fn sse(chunks: usize, delay: Duration) -> Self {
        Self::start(Behavior::Sse { chunks, delay }).await
    }

    /// 补全请求返回 chunks 个 SSE 数据帧后响应体出错中断
    pub async fn sse_then_error(chunks: usize) -> Self {
        Self::start(Behavior::SseThenError { chunks }).await
    }

    async fn start(behavior: Behavior) -> Self {
        let state = Arc::new(MockState {
            behavior,
            probes: AtomicUsize::new(0),
            completions: AtomicUsize::new(0),
            last_body: Mutex::new(None),
        });

        let app = Router::new()
            .route("/models", get(mock_probe))
            .route("/api/tags", get(mock_probe))
            .route("/chat/completions", post(mock_completion))
            .route("/v1/chat/completions", post(mock_completion))
            .with_state(state.clone());

        let (addr, handle) = serve(app).await;
        Self { addr, state, handle }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn probe_count(&self) -> usize {
        self.state.probes.load(Ordering::SeqCst)
    }

    pub fn completion_count(&self) -> usize {
        self.state.completions.load(Ordering::SeqCst)
    }

    /// 最近一次补全请求的请求体
    pub fn last_request_body(&self) -> Option<serde_json::Value> {
        self.state.last_body.lock().clone()
    }
}

impl Drop for MockUpstream {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn mock_probe(State(state): State<Arc<MockState>>) -> impl IntoResponse {
    state.probes.fetch_add(1, Ordering::SeqCst);
    Json(serde_json::json!({"object": "list", "data": []}))
}

async fn mock_completion(State(state): State<Arc<MockState>>, body: Bytes) -> Response {
    state.completions.fetch_add(1, Ordering::SeqCst);
    *state.last_body.lock() = serde_json::from_slice(&body).ok();

    match state.behavior.clone() {
        Behavior::Json(body) => ([(header::CONTENT_TYPE, "application/json")], body).into_response(),
        Behavior::Status(code, body) => {
            let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (status, body).into_response()
        }
        Behavior::Slow(delay) => {
            tokio::time::sleep(delay).await;
            ([(header::CONTENT_TYPE, "application/json")], "{}").into_response()
        }
        Behavior::Sse { chunks, delay } => {
            let body = delayed_sse_upstream(chunks, delay)
                .map(|item| item.map_err(|fault| std::io::Error::other(fault.message)));
            (
                [(header::CONTENT_TYPE, "text/event-stream")],
                Body::from_stream(body),
            )
                .into_response()
        }
        Behavior::SseThenError { chunks } => {
            let frames = stream::iter(sse_chunks(chunks, false).into_iter().map(Ok));
            let failure = stream::once(async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Err(std::io::Error::other("upstream connection lost"))
            });
            (
                [(header::CONTENT_TYPE, "text/event-stream")],
                Body::from_stream(frames.chain(failure)),
            )
                .into_response()
        }
    }
}

/// 在 127.0.0.1 的临时端口上启动服务
pub async fn serve(app: Router) -> (SocketAddr, JoinHandle<()>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, handle)
}

// ============================================================================
// 配置与客户端
// ============================================================================

pub fn provider_config_for(id: &str, base_url: &str, models: &[&str]) -> ProviderConfig {
    ProviderConfig {
        id: id.to_string(),
        base_url: base_url.to_string(),
        kind: ProviderKind::OpenAi,
        api_key: Some(format!("sk-upstream-{}", id)),
        models: models.iter().map(|m| m.to_string()).collect(),
        aliases: HashMap::new(),
        weight: 1,
        timeout_secs: 5,
    }
}

pub fn upstream_client() -> reqwest::Client {
    crate::http_client::build_client(None, 2).unwrap()
}

// ============================================================================
// 上游字节流
// ============================================================================

/// n 个 `data: {"index":i}` 帧，可选追加 [DONE]
pub fn sse_chunks(n: usize, with_done: bool) -> Vec<Bytes> {
    let mut chunks: Vec<Bytes> = (0..n)
        .map(|i| Bytes::from(format!("data: {{\"index\":{}}}\n\n", i)))
        .collect();
    if with_done {
        chunks.push(Bytes::from_static(b"data: [DONE]\n\n"));
    }
    chunks
}

/// 每个帧之前等待 delay 的上游流，最后发送 [DONE]
pub fn delayed_sse_upstream(
    n: usize,
    delay: Duration,
) -> impl Stream<Item = Result<Bytes, StreamFault>> + Send + 'static {
    stream::unfold(sse_chunks(n, true).into_iter(), move |mut chunks| async move {
        let chunk = chunks.next()?;
        tokio::time::sleep(delay).await;
        Some((Ok(chunk), chunks))
    })
}

/// 记录上游流是否已被释放
#[derive(Clone, Default)]
pub struct DropFlag {
    flag: Arc<AtomicBool>,
}

impl DropFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// 包装上游流，流被丢弃时设置标记
    pub fn wrap<S>(&self, inner: S) -> UpstreamStream
    where
        S: Stream<Item = Result<Bytes, StreamFault>> + Send + 'static,
    {
        GuardedStream {
            inner: inner.boxed(),
            flag: self.flag.clone(),
        }
        .boxed()
    }
}

struct GuardedStream {
    inner: UpstreamStream,
    flag: Arc<AtomicBool>,
}

impl Stream for GuardedStream {
    type Item = Result<Bytes, StreamFault>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

impl Drop for GuardedStream {
    fn drop(&mut self) {
        self.flag.store(true, Ordering::SeqCst);
    }
}

// ============================================================================
// 完整路由服务
// ============================================================================

pub struct TestApp {
    pub addr: SocketAddr,
    pub state: AppState,
    handle: JoinHandle<()>,
}

impl TestApp {
    /// 以给定的 Provider 与凭据（JSON）启动路由服务
    pub async fn spawn(
        providers: &[ProviderConfig],
        credentials_json: &str,
        streaming: StreamingConfig,
    ) -> Self {
        let credentials: CredentialsConfig = serde_json::from_str(credentials_json).unwrap();
        credentials.validate().unwrap();

        let registry = Arc::new(ProviderRegistry::from_configs(providers));
        let stats = Arc::new(StatsCollector::default());
        let auth = Arc::new(AuthManager::from_config(&credentials, &QuotaConfig::default()));
        let dispatcher = Arc::new(Dispatcher::new(
            registry,
            ProviderClient::new(upstream_client()),
            2,
            stats.clone(),
        ));
        let state = AppState::new(auth, dispatcher, stats)
            .with_relay(relay_for(&streaming))
            .with_stream_by_default(streaming.stream_by_default);

        let (addr, handle) = serve(create_router(state.clone())).await;
        Self { addr, state, handle }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
