//! OpenAI 兼容 API 服务模块
//!
//! # 端点
//! - `POST /v1/chat/completions` - 对话补全（流式与非流式）
//! - `GET /v1/models` - 模型列表
//! - `GET /health`、`GET /stats`、`GET /auth/info` - 服务状态

mod handlers;
mod middleware;
mod router;
pub mod types;

pub use middleware::AppState;
pub use router::create_router;
