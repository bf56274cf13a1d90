//! 请求路径上的错误类型

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header::RETRY_AFTER},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};

use crate::router::AttemptRecord;

/// 路由请求失败的原因
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("missing bearer credential")]
    Unauthenticated,

    #[error("unknown credential")]
    InvalidCredential,

    #[error("account {owner_id} is inactive")]
    AccountInactive { owner_id: String },

    #[error("daily quota of {daily_limit} requests exhausted for {owner_id}")]
    QuotaExceeded {
        owner_id: String,
        daily_limit: u32,
        reset_at: DateTime<Utc>,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("no provider available for model {model}")]
    NoProviderAvailable {
        model: String,
        attempts: Vec<AttemptRecord>,
    },

    #[error("provider {provider} timed out after {elapsed_ms}ms")]
    UpstreamTimeout {
        provider: String,
        elapsed_ms: u64,
        attempts: Vec<AttemptRecord>,
    },

    #[error("provider {provider} returned an error: {message}")]
    UpstreamError {
        provider: String,
        status: Option<u16>,
        message: String,
    },

    #[error("client disconnected")]
    ClientDisconnected,
}

impl RouterError {
    /// 错误类型标识，用于统计和日志
    pub fn kind(&self) -> &'static str {
        match self {
            RouterError::Unauthenticated => "unauthenticated",
            RouterError::InvalidCredential => "invalid_credential",
            RouterError::AccountInactive { .. } => "account_inactive",
            RouterError::QuotaExceeded { .. } => "quota_exceeded",
            RouterError::InvalidRequest(_) => "invalid_request",
            RouterError::NoProviderAvailable { .. } => "no_provider_available",
            RouterError::UpstreamTimeout { .. } => "upstream_timeout",
            RouterError::UpstreamError { .. } => "upstream_error",
            RouterError::ClientDisconnected => "client_disconnect",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            RouterError::Unauthenticated | RouterError::InvalidCredential => StatusCode::UNAUTHORIZED,
            RouterError::AccountInactive { .. } => StatusCode::FORBIDDEN,
            RouterError::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            RouterError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            RouterError::NoProviderAvailable { .. } => StatusCode::BAD_GATEWAY,
            RouterError::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            RouterError::UpstreamError { status, .. } => match status {
                // 上游认证类状态码不透传
                Some(401 | 403 | 407) => StatusCode::BAD_GATEWAY,
                Some(code @ 400..=499) => {
                    StatusCode::from_u16(*code).unwrap_or(StatusCode::BAD_GATEWAY)
                }
                _ => StatusCode::BAD_GATEWAY,
            },
            // nginx 约定的 "Client Closed Request"
            RouterError::ClientDisconnected => {
                StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST)
            }
        }
    }

    /// 是否属于认证/配额类错误（不会触达上游）
    pub fn is_admission_error(&self) -> bool {
        matches!(
            self,
            RouterError::Unauthenticated
                | RouterError::InvalidCredential
                | RouterError::AccountInactive { .. }
                | RouterError::QuotaExceeded { .. }
        )
    }
}

impl IntoResponse for RouterError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let body = match &self {
            // 两种 401 对外返回完全相同的响应体
            RouterError::Unauthenticated | RouterError::InvalidCredential => serde_json::json!({
                "type": "authentication_error",
                "message": "Invalid API key",
            }),
            RouterError::AccountInactive { .. } => serde_json::json!({
                "type": "permission_error",
                "message": "Account is inactive",
            }),
            RouterError::QuotaExceeded {
                daily_limit,
                reset_at,
                ..
            } => serde_json::json!({
                "type": "rate_limit_error",
                "message": format!("Daily limit of {} requests exceeded", daily_limit),
                "remaining": 0,
                "dailyLimit": daily_limit,
                "resetAt": reset_at.to_rfc3339(),
            }),
            RouterError::InvalidRequest(message) => serde_json::json!({
                "type": "invalid_request_error",
                "message": message,
            }),
            RouterError::NoProviderAvailable { attempts, .. } => serde_json::json!({
                "type": self.kind(),
                "message": self.to_string(),
                "attempts": attempts,
            }),
            RouterError::UpstreamTimeout {
                provider, attempts, ..
            } => serde_json::json!({
                "type": self.kind(),
                "message": self.to_string(),
                "provider": provider,
                "attempts": attempts,
            }),
            RouterError::UpstreamError {
                provider, message, ..
            } => serde_json::json!({
                "type": self.kind(),
                "message": message,
                "provider": provider,
            }),
            RouterError::ClientDisconnected => serde_json::json!({
                "type": self.kind(),
                "message": self.to_string(),
            }),
        };

        let mut response = (status, Json(serde_json::json!({ "error": body }))).into_response();

        if let RouterError::QuotaExceeded { reset_at, .. } = &self {
            let wait = (*reset_at - Utc::now()).num_seconds().max(1);
            if let Ok(value) = HeaderValue::from_str(&wait.to_string()) {
                response.headers_mut().insert(RETRY_AFTER, value);
            }
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_json(err: RouterError) -> (StatusCode, serde_json::Value) {
        let response = err.into_response();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_auth_errors_share_body() {
        let (s1, b1) = body_json(RouterError::Unauthenticated).await;
        let (s2, b2) = body_json(RouterError::InvalidCredential).await;
        assert_eq!(s1, StatusCode::UNAUTHORIZED);
        assert_eq!(s1, s2);
        assert_eq!(b1, b2);
    }

    #[tokio::test]
    async fn test_quota_body() {
        let err = RouterError::QuotaExceeded {
            owner_id: "alice".into(),
            daily_limit: 2,
            reset_at: Utc::now() + chrono::Duration::hours(3),
        };
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().contains_key(RETRY_AFTER));

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"]["remaining"], 0);
        assert_eq!(body["error"]["dailyLimit"], 2);
        assert!(body["error"]["resetAt"].is_string());
    }

    #[test]
    fn test_upstream_status_mapping() {
        let err = |status| RouterError::UpstreamError {
            provider: "p".into(),
            status,
            message: "x".into(),
        };
        assert_eq!(err(Some(400)).status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(err(Some(404)).status_code(), StatusCode::NOT_FOUND);
        assert_eq!(err(Some(401)).status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(err(None).status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(RouterError::ClientDisconnected.status_code().as_u16(), 499);
    }
}
