//! 流式响应输出策略

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use bytes::Bytes;
use http_body::Frame;
use tokio::sync::mpsc;

use super::pump::FramePump;
use crate::model::config::{RelayStrategy, StreamingConfig};

/// 把 FramePump 变成 HTTP 响应体
pub trait StreamRelay: Send + Sync {
    fn name(&self) -> &'static str;

    fn relay(&self, pump: FramePump) -> Body;
}

/// 直接输出：连接每次请求下一帧时才从上游拉取
#[derive(Debug, Default)]
pub struct DirectRelay;

impl StreamRelay for DirectRelay {
    fn name(&self) -> &'static str {
        "direct"
    }

    fn relay(&self, pump: FramePump) -> Body {
        Body::new(DirectSseBody { pump })
    }
}

/// 持有 FramePump 的响应体，被丢弃时上游随之释放
struct DirectSseBody {
    pump: FramePump,
}

impl http_body::Body for DirectSseBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        self.get_mut()
            .pump
            .poll_next_frame(cx)
            .map(|frame| frame.map(|bytes| Ok(Frame::data(bytes))))
    }

    fn is_end_stream(&self) -> bool {
        self.pump.is_finished()
    }
}

/// 缓冲输出：后台任务读取上游写入有界通道
#[derive(Debug)]
pub struct BufferedRelay {
    capacity: usize,
}

impl BufferedRelay {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
        }
    }
}

impl StreamRelay for BufferedRelay {
    fn name(&self) -> &'static str {
        "buffered"
    }

    fn relay(&self, mut pump: FramePump) -> Body {
        let (tx, rx) = mpsc::channel::<Bytes>(self.capacity);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = tx.closed() => {
                        tracing::debug!(
                            trace_id = %pump.session().trace_id(),
                            chunks = pump.session().chunk_count(),
                            bytes = pump.session().bytes_forwarded(),
                            "客户端已断开，停止读取上游"
                        );
                        break;
                    }
                    frame = pump.next_frame() => match frame {
                        Some(bytes) => {
                            if tx.send(bytes).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
            // pump 在此处释放；未结束的会话记为客户端断开
        });

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|bytes| (Ok::<_, Infallible>(bytes), rx))
        });
        Body::from_stream(stream)
    }
}

/// 按配置选择输出策略
pub fn relay_for(config: &StreamingConfig) -> Arc<dyn StreamRelay> {
    match config.strategy {
        RelayStrategy::Direct => Arc::new(DirectRelay),
        RelayStrategy::Buffered => Arc::new(BufferedRelay::new(config.buffer_capacity)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::StatsCollector;
    use crate::streaming::{StreamSession, TerminationReason};
    use crate::test_support::{DropFlag, delayed_sse_upstream, sse_chunks};
    use futures::{StreamExt, stream};
    use std::time::Duration;

    fn pump_over(
        upstream: crate::streaming::UpstreamStream,
    ) -> (FramePump, Arc<StatsCollector>) {
        let stats = Arc::new(StatsCollector::default());
        let session = StreamSession::new("trace-1", "p1", stats.clone());
        (FramePump::new(upstream, Duration::from_secs(30), session), stats)
    }

    async fn full_body(relay: &dyn StreamRelay) -> String {
        let upstream = stream::iter(sse_chunks(5, true).into_iter().map(Ok)).boxed();
        let (pump, _) = pump_over(upstream);
        let bytes = axum::body::to_bytes(relay.relay(pump), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_relays_produce_identical_output() {
        let direct = full_body(&DirectRelay).await;
        let buffered = full_body(&BufferedRelay::new(2)).await;
        assert_eq!(direct, buffered);
        assert_eq!(direct.matches("data: ").count(), 6);
        assert!(direct.ends_with("data: [DONE]\n\n"));
    }

    async fn assert_disconnect_releases_upstream(relay: &dyn StreamRelay) {
        let dropped = DropFlag::new();
        let upstream = dropped.wrap(delayed_sse_upstream(10, Duration::from_millis(50)));
        let (pump, stats) = pump_over(upstream);

        let mut body = relay.relay(pump).into_data_stream();
        let first = body.next().await.unwrap().unwrap();
        let second = body.next().await.unwrap().unwrap();
        assert!(first.starts_with(b"data: {\"index\":0}"));
        assert!(second.starts_with(b"data: {\"index\":1}"));
        drop(body);

        // buffered 策略下由后台任务释放，等待其退出
        for _ in 0..100 {
            if dropped.is_set() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(dropped.is_set(), "{} relay kept upstream alive", relay.name());
        assert_eq!(stats.stream_termination_count(TerminationReason::ClientDisconnect), 1);
        assert_eq!(stats.stream_termination_count(TerminationReason::Completed), 0);
    }

    #[tokio::test]
    async fn test_direct_disconnect_releases_upstream() {
        assert_disconnect_releases_upstream(&DirectRelay).await;
    }

    #[tokio::test]
    async fn test_buffered_disconnect_releases_upstream() {
        assert_disconnect_releases_upstream(&BufferedRelay::new(1)).await;
    }

    #[test]
    fn test_relay_for_strategy() {
        let mut config = StreamingConfig::default();
        assert_eq!(relay_for(&config).name(), "direct");
        config.strategy = RelayStrategy::Buffered;
        assert_eq!(relay_for(&config).name(), "buffered");
    }
}
