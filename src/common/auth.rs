//! 请求认证工具

use axum::{body::Body, http::Request};
use subtle::ConstantTimeEq;

/// 从 `Authorization: Bearer <key>` 头中提取调用方凭据
///
/// 未携带、格式错误或值为空时返回 None
pub fn extract_bearer(request: &Request<Body>) -> Option<String> {
    let value = request
        .headers()
        .get(http::header::AUTHORIZATION)?
        .to_str()
        .ok()?;

    let (scheme, token) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }

    let token = token.trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

/// 常量时间比较，防止时序攻击
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}
