//! 上游调用：按 Provider 类型统一的 probe / forward

use std::fmt;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use reqwest::Client;
use reqwest::header::{ACCEPT, CONTENT_TYPE};

use super::Provider;
use crate::common::truncate_with_ellipsis;
use crate::streaming::{StreamFault, UpstreamStream};

/// 错误响应体最多保留的字节数
const MAX_ERROR_BODY_BYTES: usize = 2048;

/// 一次上游调用失败的原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamFailure {
    /// 在 Provider 超时时间内没有得到响应
    Timeout { elapsed: Duration },
    /// 连接失败、连接被重置等网络错误
    Transport(String),
    /// 上游返回了非 2xx 状态码
    Status { status: u16, body: String },
}

impl UpstreamFailure {
    /// 网络错误、超时和 5xx 可以换一个 Provider 重试
    pub fn is_retryable(&self) -> bool {
        match self {
            UpstreamFailure::Timeout { .. } | UpstreamFailure::Transport(_) => true,
            UpstreamFailure::Status { status, .. } => *status >= 500,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            UpstreamFailure::Timeout { .. } => "upstream_timeout",
            UpstreamFailure::Transport(_) => "network_error",
            UpstreamFailure::Status { .. } => "upstream_status",
        }
    }

    /// 单行摘要，用于日志和 attempts 记录
    pub fn summary(&self) -> String {
        match self {
            UpstreamFailure::Timeout { elapsed } => {
                format!("timed out after {}ms", elapsed.as_millis())
            }
            UpstreamFailure::Transport(message) => truncate_with_ellipsis(message, 256),
            UpstreamFailure::Status { status, body } => {
                format!("HTTP {}: {}", status, truncate_with_ellipsis(body.trim(), 256))
            }
        }
    }

    fn from_reqwest(err: reqwest::Error, started: Instant) -> Self {
        if err.is_timeout() {
            UpstreamFailure::Timeout {
                elapsed: started.elapsed(),
            }
        } else {
            UpstreamFailure::Transport(err.to_string())
        }
    }
}

fn is_plain_json(response: &reqwest::Response) -> bool {
    response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .is_some_and(|essence| essence.trim().eq_ignore_ascii_case("application/json"))
}

/// JSON 字符串内不会出现裸换行，因此把换行替换成空格不改变内容
fn single_json_frame(body: &[u8]) -> Bytes {
    let text = String::from_utf8_lossy(body);
    let flat: String = text
        .trim()
        .chars()
        .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
        .collect();
    Bytes::from(format!("data: {}\n\n", flat))
}

impl fmt::Display for UpstreamFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.summary())
    }
}

/// 上游成功响应
pub enum UpstreamReply {
    /// 非流式：完整的响应体
    Complete(Bytes),
    /// 流式：尚未读取的响应体字节流
    Stream(UpstreamStream),
}

impl fmt::Debug for UpstreamReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpstreamReply::Complete(body) => write!(f, "Complete({} bytes)", body.len()),
            UpstreamReply::Stream(_) => f.write_str("Stream"),
        }
    }
}

/// 所有 Provider 共享的上游调用客户端
#[derive(Clone)]
pub struct ProviderClient {
    http: Client,
}

impl ProviderClient {
    pub fn new(http: Client) -> Self {
        Self { http }
    }

    /// 健康探测：轻量 GET 请求，返回响应延迟
    pub async fn probe(&self, provider: &Provider, timeout: Duration) -> Result<Duration, UpstreamFailure> {
        let url = provider.endpoint(provider.kind().probe_path());
        let mut request = self.http.get(&url);
        if let Some(key) = provider.api_key() {
            request = request.bearer_auth(key);
        }

        let started = Instant::now();
        let response = match tokio::time::timeout(timeout, request.send()).await {
            Err(_) => {
                return Err(UpstreamFailure::Timeout {
                    elapsed: started.elapsed(),
                });
            }
            Ok(Err(e)) => return Err(UpstreamFailure::from_reqwest(e, started)),
            Ok(Ok(response)) => response,
        };

        let latency = started.elapsed();
        let status = response.status();
        if status.is_success() {
            Ok(latency)
        } else {
            Err(UpstreamFailure::Status {
                status: status.as_u16(),
                body: String::new(),
            })
        }
    }

    /// 转发对话补全请求
    ///
    /// 超时覆盖到响应头（流式）或完整响应体（非流式）为止；
    /// 流式响应体的空闲超时由调用方负责
    pub async fn forward(
        &self,
        provider: &Provider,
        body: Bytes,
        stream: bool,
    ) -> Result<UpstreamReply, UpstreamFailure> {
        let url = provider.endpoint(provider.kind().completions_path());
        let mut request = self
            .http
            .post(&url)
            .header(CONTENT_TYPE, "application/json")
            .body(body);
        if let Some(key) = provider.api_key() {
            request = request.bearer_auth(key);
        }
        if stream {
            request = request.header(ACCEPT, "text/event-stream");
        }

        let timeout = provider.timeout();
        let started = Instant::now();
        let response = match tokio::time::timeout(timeout, request.send()).await {
            Err(_) => {
                return Err(UpstreamFailure::Timeout {
                    elapsed: started.elapsed(),
                });
            }
            Ok(Err(e)) => return Err(UpstreamFailure::from_reqwest(e, started)),
            Ok(Ok(response)) => response,
        };

        let status = response.status();
        let remaining = timeout.saturating_sub(started.elapsed());

        if !status.is_success() {
            let body = match tokio::time::timeout(remaining, response.text()).await {
                Ok(Ok(text)) => truncate_with_ellipsis(&text, MAX_ERROR_BODY_BYTES),
                _ => String::new(),
            };
            return Err(UpstreamFailure::Status {
                status: status.as_u16(),
                body,
            });
        }

        if stream && is_plain_json(&response) {
            // 上游忽略了 stream 参数：整个 JSON 响应体作为单个帧转发
            let body = match tokio::time::timeout(remaining, response.bytes()).await {
                Err(_) => {
                    return Err(UpstreamFailure::Timeout {
                        elapsed: started.elapsed(),
                    });
                }
                Ok(Err(e)) => return Err(UpstreamFailure::from_reqwest(e, started)),
                Ok(Ok(bytes)) => bytes,
            };
            tracing::debug!(
                provider = %provider.id(),
                bytes = body.len(),
                "上游返回非流式 JSON，按单帧转发"
            );
            let frame: Result<Bytes, StreamFault> = Ok(single_json_frame(&body));
            return Ok(UpstreamReply::Stream(futures::stream::once(async move { frame }).boxed()));
        }

        if stream {
            let chunks = response
                .bytes_stream()
                .map_err(|e| StreamFault {
                    timed_out: e.is_timeout(),
                    message: e.to_string(),
                })
                .boxed();
            return Ok(UpstreamReply::Stream(chunks));
        }

        match tokio::time::timeout(remaining, response.bytes()).await {
            Err(_) => Err(UpstreamFailure::Timeout {
                elapsed: started.elapsed(),
            }),
            Ok(Err(e)) => Err(UpstreamFailure::from_reqwest(e, started)),
            Ok(Ok(bytes)) => Ok(UpstreamReply::Complete(bytes)),
        }
    }
}
