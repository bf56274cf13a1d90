//! SSE 帧解码与编码
//!
//! 上游可能以任意边界切分字节流，解码器按行缓冲，
//! 同一事件的多条 `data:` 行合并为一个帧。本地推理服务输出的
//! NDJSON（每行一个 JSON）也按一行一帧处理。

use bytes::{Bytes, BytesMut};

/// 流结束标记
pub const DONE_FRAME: &[u8] = b"data: [DONE]\n\n";

/// 未完成的行与未结束的事件合计允许缓冲的最大字节数
pub const MAX_PENDING_BYTES: usize = 4 * 1024 * 1024;

/// 解码出的一个上游事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseFrame {
    Data(String),
    Done,
    /// 缓冲超过 [`MAX_PENDING_BYTES`] 仍未得到完整事件，值为已缓冲的字节数
    Overflow(usize),
}

impl SseFrame {
    fn from_payload(payload: String) -> Self {
        if payload.trim() == "[DONE]" {
            SseFrame::Done
        } else {
            SseFrame::Data(payload)
        }
    }
}

/// 增量 SSE 解码器
#[derive(Debug, Default)]
pub struct SseFrameDecoder {
    buffer: BytesMut,
    /// 当前事件已收到的 data 行
    data_lines: Vec<String>,
    data_bytes: usize,
}

impl SseFrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一段上游字节，返回其中所有完整的事件
    pub fn decode(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line = self.buffer.split_to(pos + 1);
            let line = String::from_utf8_lossy(&line[..pos]);
            let line = line.strip_suffix('\r').unwrap_or(&line);
            self.handle_line(line, &mut frames);
        }

        let pending = self.buffer.len() + self.data_bytes;
        if pending > MAX_PENDING_BYTES {
            self.buffer.clear();
            self.data_lines.clear();
            self.data_bytes = 0;
            frames.push(SseFrame::Overflow(pending));
        }

        frames
    }

    /// 上游结束：处理残留的半行和未以空行结束的事件
    pub fn finish(&mut self) -> Vec<SseFrame> {
        let mut frames = Vec::new();
        if !self.buffer.is_empty() {
            let rest = self.buffer.split();
            let line = String::from_utf8_lossy(&rest);
            let line = line.trim_end_matches(['\r', '\n']);
            self.handle_line(line, &mut frames);
        }
        self.flush_event(&mut frames);
        frames
    }

    fn handle_line(&mut self, line: &str, frames: &mut Vec<SseFrame>) {
        if line.is_empty() {
            self.flush_event(frames);
            return;
        }

        if let Some(value) = line.strip_prefix("data:") {
            let value = value.strip_prefix(' ').unwrap_or(value);
            self.data_bytes += value.len();
            self.data_lines.push(value.to_string());
            return;
        }

        if line.starts_with(':')
            || line.starts_with("event:")
            || line.starts_with("id:")
            || line.starts_with("retry:")
        {
            return;
        }

        // NDJSON
        let trimmed = line.trim();
        if !trimmed.is_empty() {
            self.flush_event(frames);
            frames.push(SseFrame::from_payload(trimmed.to_string()));
        }
    }

    fn flush_event(&mut self, frames: &mut Vec<SseFrame>) {
        if self.data_lines.is_empty() {
            return;
        }
        let payload = self.data_lines.join("\n");
        self.data_lines.clear();
        self.data_bytes = 0;
        frames.push(SseFrame::from_payload(payload));
    }
}

/// 编码一个下游 data 帧，多行内容拆成多条 `data:` 行
pub fn encode_data(payload: &str) -> Bytes {
    let mut out = BytesMut::with_capacity(payload.len() + 8);
    for line in payload.split('\n') {
        out.extend_from_slice(b"data: ");
        out.extend_from_slice(line.as_bytes());
        out.extend_from_slice(b"\n");
    }
    out.extend_from_slice(b"\n");
    out.freeze()
}

/// 编码终止错误帧
pub fn error_frame(kind: &str, message: &str, provider: Option<&str>, trace_id: &str) -> Bytes {
    let body = serde_json::json!({
        "error": {
            "type": kind,
            "message": message,
            "provider": provider,
            "traceId": trace_id,
        }
    });
    encode_data(&body.to_string())
}
