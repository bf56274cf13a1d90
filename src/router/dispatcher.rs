//! 请求分发：选择 Provider、调用、失败重试

use std::sync::Arc;
use std::time::{Duration, Instant};

use super::context::{AttemptRecord, RequestContext};
use super::selector::WeightedSelector;
use crate::error::RouterError;
use crate::openai::types::ChatCompletionRequest;
use crate::provider::{ProviderClient, ProviderEntry, ProviderRegistry, UpstreamFailure, UpstreamReply};
use crate::stats::StatsCollector;

/// 分发成功的结果
#[derive(Debug)]
pub struct Dispatched {
    pub provider: Arc<ProviderEntry>,
    pub reply: UpstreamReply,
    /// 成功那次尝试的延迟
    pub latency: Duration,
    /// 之前失败的尝试
    pub failed_attempts: Vec<AttemptRecord>,
}

pub struct Dispatcher {
    registry: Arc<ProviderRegistry>,
    client: ProviderClient,
    selector: WeightedSelector,
    max_retries: u32,
    stats: Arc<StatsCollector>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        client: ProviderClient,
        max_retries: u32,
        stats: Arc<StatsCollector>,
    ) -> Self {
        Self {
            registry,
            client,
            selector: WeightedSelector::new(),
            max_retries,
            stats,
        }
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// 选择 Provider 并转发，可重试的失败换下一个未尝试过的 Provider
    ///
    /// 流式请求只在拿到响应头之前重试，之后的错误由 FramePump 处理
    pub async fn dispatch(
        &self,
        ctx: &mut RequestContext,
        request: &ChatCompletionRequest,
        stream: bool,
    ) -> Result<Dispatched, RouterError> {
        let max_attempts = self.max_retries as usize + 1;
        let mut failures: Vec<AttemptRecord> = Vec::new();

        while ctx.attempted.len() < max_attempts {
            let candidates: Vec<Arc<ProviderEntry>> = self
                .registry
                .eligible(&ctx.model)
                .into_iter()
                .filter(|e| !ctx.has_attempted(e.id()))
                .collect();
            let Some(entry) = self.selector.select(&candidates) else {
                break;
            };
            ctx.record_attempt(entry.id());

            let provider = entry.provider();
            let upstream_model = provider.upstream_model(&ctx.model);
            let body = request
                .upstream_body(upstream_model, stream)
                .map_err(|e| RouterError::InvalidRequest(e.to_string()))?;

            tracing::debug!(
                trace_id = %ctx.trace_id,
                provider = %provider.id(),
                model = %ctx.model,
                upstream_model = %upstream_model,
                attempt = ctx.attempted.len(),
                "转发请求到上游"
            );

            let started = Instant::now();
            let result = self.client.forward(provider, body, stream).await;
            let latency = started.elapsed();

            match result {
                Ok(reply) => {
                    entry.observe_latency(latency);
                    self.stats.record_attempt(provider.id(), true, latency);
                    tracing::info!(
                        trace_id = %ctx.trace_id,
                        provider = %provider.id(),
                        model = %ctx.model,
                        latency_ms = latency.as_millis() as u64,
                        retries = ctx.retry_count,
                        stream,
                        "上游请求成功"
                    );
                    return Ok(Dispatched {
                        provider: entry.clone(),
                        reply,
                        latency,
                        failed_attempts: failures,
                    });
                }
                Err(failure) => {
                    self.stats.record_attempt(provider.id(), false, latency);
                    tracing::warn!(
                        trace_id = %ctx.trace_id,
                        provider = %provider.id(),
                        attempt = ctx.attempted.len(),
                        error = %failure.summary(),
                        retryable = failure.is_retryable(),
                        "上游请求失败"
                    );

                    if !failure.is_retryable() {
                        return Err(terminal_error(provider.id(), failure));
                    }
                    failures.push(AttemptRecord::new(provider.id(), &failure, latency));
                }
            }
        }

        tracing::error!(
            trace_id = %ctx.trace_id,
            model = %ctx.model,
            configured = self.registry.serves(&ctx.model),
            attempted = ?ctx.attempted,
            elapsed_ms = ctx.elapsed().as_millis() as u64,
            "没有可用的 Provider"
        );

        let all_timeouts =
            !failures.is_empty() && failures.iter().all(|f| f.error == "upstream_timeout");
        match failures.last() {
            Some(last) if all_timeouts => Err(RouterError::UpstreamTimeout {
                provider: last.provider.clone(),
                elapsed_ms: last.latency_ms,
                attempts: failures,
            }),
            _ => Err(RouterError::NoProviderAvailable {
                model: ctx.model.clone(),
                attempts: failures,
            }),
        }
    }
}

/// 不可重试的上游失败：保留上游的原始错误文本
fn terminal_error(provider: &str, failure: UpstreamFailure) -> RouterError {
    match failure {
        UpstreamFailure::Status { status, body } => RouterError::UpstreamError {
            provider: provider.to_string(),
            status: Some(status),
            message: if body.trim().is_empty() {
                format!("HTTP {}", status)
            } else {
                body
            },
        },
        other => RouterError::UpstreamError {
            provider: provider.to_string(),
            status: None,
            message: other.summary(),
        },
    }
}
