//! 上游到下游的帧泵
//!
//! 只在下游请求下一帧时才拉取上游，direct 与 buffered 两种策略共用

use std::collections::VecDeque;
use std::future::{Future, poll_fn};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use tokio::time::{Instant, Sleep, sleep};

use super::session::{StreamSession, TerminationReason};
use super::sse::{DONE_FRAME, MAX_PENDING_BYTES, SseFrame, SseFrameDecoder, encode_data, error_frame};
use super::UpstreamStream;

struct Outgoing {
    bytes: Bytes,
    is_data: bool,
    terminal: Option<TerminationReason>,
}

pub struct FramePump {
    upstream: Option<UpstreamStream>,
    decoder: SseFrameDecoder,
    pending: VecDeque<Outgoing>,
    idle_timeout: Duration,
    idle: Pin<Box<Sleep>>,
    /// 终止帧已入队，之后不再接收新帧
    terminal_queued: bool,
    /// 终止帧已交出
    finished: bool,
    session: StreamSession,
}

impl FramePump {
    /// `idle_timeout`: 两次收到上游数据之间允许的最长间隔
    pub fn new(upstream: UpstreamStream, idle_timeout: Duration, session: StreamSession) -> Self {
        Self {
            upstream: Some(upstream),
            decoder: SseFrameDecoder::new(),
            pending: VecDeque::new(),
            idle_timeout,
            idle: Box::pin(sleep(idle_timeout)),
            terminal_queued: false,
            finished: false,
            session,
        }
    }

    pub fn session(&self) -> &StreamSession {
        &self.session
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// 拉取下一帧；返回 None 表示流已结束
    pub fn poll_next_frame(&mut self, cx: &mut Context<'_>) -> Poll<Option<Bytes>> {
        loop {
            if let Some(out) = self.pending.pop_front() {
                self.session.record_frame(out.bytes.len(), out.is_data);
                if let Some(reason) = out.terminal {
                    self.pending.clear();
                    self.upstream = None;
                    self.finished = true;
                    self.session.finish(reason);
                }
                return Poll::Ready(Some(out.bytes));
            }

            if self.finished {
                return Poll::Ready(None);
            }

            let Some(upstream) = self.upstream.as_mut() else {
                // 上游已释放但没有终止帧
                self.push_error(TerminationReason::UpstreamError, "upstream closed unexpectedly");
                continue;
            };

            match upstream.poll_next_unpin(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    let deadline = Instant::now() + self.idle_timeout;
                    self.idle.as_mut().reset(deadline);
                    for frame in self.decoder.decode(&chunk) {
                        self.push_frame(frame);
                    }
                }
                Poll::Ready(Some(Err(fault))) => {
                    let reason = if fault.timed_out {
                        TerminationReason::UpstreamTimeout
                    } else {
                        TerminationReason::UpstreamError
                    };
                    self.push_error(reason, &fault.message);
                }
                Poll::Ready(None) => {
                    for frame in self.decoder.finish() {
                        self.push_frame(frame);
                    }
                    if !self.terminal_queued {
                        self.push_terminal(Bytes::from_static(DONE_FRAME), TerminationReason::UpstreamEof);
                    }
                }
                Poll::Pending => match self.idle.as_mut().poll(cx) {
                    Poll::Ready(()) => {
                        let message = format!(
                            "no data from upstream within {}s",
                            self.idle_timeout.as_secs_f32()
                        );
                        self.push_error(TerminationReason::UpstreamTimeout, &message);
                    }
                    Poll::Pending => return Poll::Pending,
                },
            }
        }
    }

    /// 异步获取下一帧
    pub async fn next_frame(&mut self) -> Option<Bytes> {
        poll_fn(|cx| self.poll_next_frame(cx)).await
    }

    fn push_frame(&mut self, frame: SseFrame) {
        if self.terminal_queued {
            return;
        }
        match frame {
            SseFrame::Data(payload) => self.pending.push_back(Outgoing {
                bytes: encode_data(&payload),
                is_data: true,
                terminal: None,
            }),
            SseFrame::Done => {
                self.push_terminal(Bytes::from_static(DONE_FRAME), TerminationReason::Completed)
            }
            SseFrame::Overflow(pending) => {
                let message = format!(
                    "upstream sent {} bytes without completing an event (limit {})",
                    pending, MAX_PENDING_BYTES
                );
                self.push_error(TerminationReason::UpstreamError, &message);
            }
        }
    }

    fn push_error(&mut self, reason: TerminationReason, message: &str) {
        if self.terminal_queued {
            return;
        }
        tracing::warn!(
            trace_id = %self.session.trace_id(),
            provider = %self.session.provider_id(),
            reason = reason.as_str(),
            error = %message,
            "流式响应中途出错，发送错误帧"
        );
        let frame = error_frame(
            reason.as_str(),
            message,
            Some(self.session.provider_id()),
            self.session.trace_id(),
        );
        self.push_terminal(frame, reason);
    }

    fn push_terminal(&mut self, bytes: Bytes, reason: TerminationReason) {
        self.terminal_queued = true;
        // 终止帧入队后立即释放上游连接
        self.upstream = None;
        self.pending.push_back(Outgoing {
            bytes,
            is_data: false,
            terminal: Some(reason),
        });
    }
}
