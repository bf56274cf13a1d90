//! OpenAI 兼容 API 路由配置

use axum::{
    Router,
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
};

use super::{
    handlers::{auth_info, chat_completions, get_stats, health, list_models},
    middleware::{AppState, auth_middleware, cors_layer},
};

/// 请求体大小上限：16MB
const MAX_BODY_SIZE: usize = 16 * 1024 * 1024;

/// 创建 API 路由
///
/// # 端点
/// - `POST /v1/chat/completions` - 对话补全（需要认证）
/// - `GET /stats` - 统计信息与调用方用量（需要认证）
/// - `GET /health` - 服务存活检查
/// - `GET /auth/info` - 认证模式说明
/// - `GET /v1/models` - 可用模型列表
///
/// # 认证
/// `Authorization: Bearer <key>`
pub fn create_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/stats", get(get_stats))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    Router::new()
        .route("/health", get(health))
        .route("/auth/info", get(auth_info))
        .route("/v1/models", get(list_models))
        .merge(protected)
        .layer(cors_layer())
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .with_state(state)
}
