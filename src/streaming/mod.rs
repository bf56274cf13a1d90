//! 流式响应转发
//!
//! - `sse`: 上游 SSE / NDJSON 解码与下游帧编码
//! - `session`: 单个流式会话的统计与终止原因
//! - `pump`: 从上游拉取并生成下游帧
//! - `relay`: direct / buffered 两种输出策略

pub mod pump;
pub mod relay;
pub mod session;
pub mod sse;

use bytes::Bytes;
use futures::stream::BoxStream;

pub use pump::FramePump;
pub use relay::{DirectRelay, StreamRelay, relay_for};
pub use session::{StreamSession, TerminationReason};

/// 上游响应体读取过程中的错误
#[derive(Debug, Clone)]
pub struct StreamFault {
    pub timed_out: bool,
    pub message: String,
}

/// 上游响应体字节流
pub type UpstreamStream = BoxStream<'static, Result<Bytes, StreamFault>>;
