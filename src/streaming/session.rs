//! 流式会话

use std::sync::Arc;
use std::time::Instant;

use crate::quota::Admission;
use crate::stats::{StatsCollector, UsageRecord};

/// 流式会话的结束原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// 上游发送了 [DONE]
    Completed,
    /// 上游在没有 [DONE] 的情况下正常关闭，已补发 [DONE]
    UpstreamEof,
    /// 上游读取出错，已发送错误帧
    UpstreamError,
    /// 超过空闲超时没有收到数据，已发送错误帧
    UpstreamTimeout,
    /// 客户端断开
    ClientDisconnect,
}

impl TerminationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminationReason::Completed => "completed",
            TerminationReason::UpstreamEof => "upstream_eof",
            TerminationReason::UpstreamError => "upstream_error",
            TerminationReason::UpstreamTimeout => "upstream_timeout",
            TerminationReason::ClientDisconnect => "client_disconnect",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TerminationReason::Completed | TerminationReason::UpstreamEof)
    }
}

/// 单个流式响应的会话状态
///
/// 结束时结算配额并上报统计；未正常结束就被丢弃视为客户端断开
pub struct StreamSession {
    trace_id: String,
    provider_id: String,
    owner_id: Option<String>,
    started_at: Instant,
    bytes_forwarded: u64,
    chunk_count: u64,
    termination: Option<TerminationReason>,
    stats: Arc<StatsCollector>,
    admission: Option<Admission>,
}

impl StreamSession {
    pub fn new(
        trace_id: impl Into<String>,
        provider_id: impl Into<String>,
        stats: Arc<StatsCollector>,
    ) -> Self {
        Self {
            trace_id: trace_id.into(),
            provider_id: provider_id.into(),
            owner_id: None,
            started_at: Instant::now(),
            bytes_forwarded: 0,
            chunk_count: 0,
            termination: None,
            stats,
            admission: None,
        }
    }

    /// 绑定配额占用，会话结束时结算
    pub fn with_admission(mut self, admission: Admission) -> Self {
        self.owner_id = Some(admission.owner_id().to_string());
        self.admission = Some(admission);
        self
    }

    /// 会话的起始时间（用于统计端到端延迟）
    pub fn with_started_at(mut self, started_at: Instant) -> Self {
        self.started_at = started_at;
        self
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn provider_id(&self) -> &str {
        &self.provider_id
    }

    pub fn bytes_forwarded(&self) -> u64 {
        self.bytes_forwarded
    }

    pub fn chunk_count(&self) -> u64 {
        self.chunk_count
    }

    pub fn termination(&self) -> Option<TerminationReason> {
        self.termination
    }

    /// 记录一个已交给连接的帧
    pub fn record_frame(&mut self, len: usize, is_data: bool) {
        self.bytes_forwarded += len as u64;
        if is_data {
            self.chunk_count += 1;
        }
    }

    /// 结束会话（只有第一次调用生效）
    pub fn finish(&mut self, reason: TerminationReason) {
        if self.termination.is_some() {
            return;
        }
        self.termination = Some(reason);

        if let Some(admission) = self.admission.as_mut() {
            admission.settle(reason.is_success());
        }

        let elapsed_ms = self.started_at.elapsed().as_millis() as u64;
        let status = if reason.is_success() {
            UsageRecord::SUCCESS
        } else {
            reason.as_str()
        };
        let mut record = UsageRecord::new(&self.trace_id, status)
            .with_provider(&self.provider_id)
            .with_latency_ms(elapsed_ms)
            .streaming(true);
        if let Some(owner_id) = &self.owner_id {
            record = record.with_owner(owner_id);
        }
        self.stats.record_stream_termination(reason);
        if matches!(
            reason,
            TerminationReason::UpstreamError | TerminationReason::UpstreamTimeout
        ) {
            self.stats.record_stream_failure(&self.provider_id);
        }
        self.stats.record_completion(record);

        if reason.is_success() {
            tracing::info!(
                trace_id = %self.trace_id,
                provider = %self.provider_id,
                reason = reason.as_str(),
                chunks = self.chunk_count,
                bytes = self.bytes_forwarded,
                elapsed_ms,
                "流式响应结束"
            );
        } else {
            tracing::warn!(
                trace_id = %self.trace_id,
                provider = %self.provider_id,
                reason = reason.as_str(),
                chunks = self.chunk_count,
                bytes = self.bytes_forwarded,
                elapsed_ms,
                "流式响应异常结束"
            );
        }
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        self.finish(TerminationReason::ClientDisconnect);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finish_is_idempotent() {
        let stats = Arc::new(StatsCollector::default());
        let mut session = StreamSession::new("t", "p", stats.clone());
        session.record_frame(20, true);
        session.record_frame(14, false);
        session.finish(TerminationReason::Completed);
        session.finish(TerminationReason::UpstreamError);
        drop(session);

        assert_eq!(stats.stream_termination_count(TerminationReason::Completed), 1);
        assert_eq!(stats.stream_termination_count(TerminationReason::UpstreamError), 0);
        assert_eq!(stats.stream_termination_count(TerminationReason::ClientDisconnect), 0);
        assert_eq!(stats.snapshot().successful_requests, 1);
    }

    #[test]
    fn test_upstream_failure_counts_against_provider() {
        let stats = Arc::new(StatsCollector::default());
        stats.record_attempt("p", true, std::time::Duration::from_millis(10));

        let mut session = StreamSession::new("t", "p", stats.clone());
        session.record_frame(20, true);
        session.finish(TerminationReason::UpstreamError);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.providers[0].attempts, 1);
        assert_eq!(snapshot.providers[0].successes, 0);
        assert_eq!(snapshot.providers[0].failures, 1);
    }

    #[test]
    fn test_client_disconnect_keeps_provider_success() {
        let stats = Arc::new(StatsCollector::default());
        stats.record_attempt("p", true, std::time::Duration::from_millis(10));

        let session = StreamSession::new("t", "p", stats.clone());
        drop(session);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.providers[0].successes, 1);
        assert_eq!(snapshot.providers[0].failures, 0);
    }

    #[test]
    fn test_drop_records_client_disconnect() {
        let stats = Arc::new(StatsCollector::default());
        let mut session = StreamSession::new("t", "p", stats.clone());
        session.record_frame(20, true);
        assert_eq!(session.chunk_count(), 1);
        drop(session);

        assert_eq!(stats.stream_termination_count(TerminationReason::ClientDisconnect), 1);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.failures_by_kind.get("client_disconnect"), Some(&1));
    }
}
