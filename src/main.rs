//! AI Router
//!
//! 在多个 OpenAI 兼容上游之间做健康感知的加权路由，
//! 提供 API 密钥认证、每日配额和 SSE 流式转发。

mod common;
mod error;
mod http_client;
mod model;
mod openai;
mod provider;
mod quota;
mod router;
mod stats;
mod streaming;
#[cfg(test)]
mod test_support;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use model::config::Config;
use model::credentials::CredentialsConfig;
use provider::{HealthChecker, ProviderClient, ProviderRegistry};
use quota::AuthManager;
use router::Dispatcher;
use stats::StatsCollector;

/// 命令行参数
#[derive(Parser, Debug)]
#[command(name = "ai-router", version, about = "OpenAI 兼容的多上游 AI 路由")]
struct Args {
    /// 配置文件路径
    #[arg(short, long)]
    config: Option<String>,

    /// 凭据文件路径
    #[arg(long)]
    credentials: Option<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    if let Err(e) = run(args).await {
        tracing::error!("启动失败: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config_path = args
        .config
        .unwrap_or_else(|| Config::default_config_path().to_string());
    let config = Config::load(&config_path)?;
    config.validate().context("配置校验失败")?;
    if let Some(path) = config.config_path() {
        tracing::info!("配置文件: {}", path.display());
    }

    let credentials_path = args
        .credentials
        .unwrap_or_else(|| CredentialsConfig::default_credentials_path().to_string());
    let credentials = CredentialsConfig::load(&credentials_path)?;
    credentials.validate().context("凭据校验失败")?;

    let http = http_client::build_client(config.proxy_url.as_deref(), config.connect_timeout_secs)
        .context("创建 HTTP 客户端失败")?;
    if let Some(proxy_url) = &config.proxy_url {
        tracing::info!("已配置 HTTP 代理: {}", proxy_url);
    }
    let client = ProviderClient::new(http);

    let registry = Arc::new(ProviderRegistry::from_configs(&config.providers));
    if registry.is_empty() {
        tracing::warn!("未配置任何 Provider，所有对话补全请求都将失败");
    }
    for entry in registry.all() {
        let provider = entry.provider();
        tracing::info!(
            provider = %provider.id(),
            kind = provider.kind().as_str(),
            weight = provider.weight(),
            models = ?provider.models(),
            "已注册 Provider"
        );
    }

    let stats = Arc::new(StatsCollector::default());
    let auth = Arc::new(AuthManager::from_config(&credentials, &config.quota));
    let dispatcher = Arc::new(Dispatcher::new(
        registry.clone(),
        client.clone(),
        config.routing.max_retries,
        stats.clone(),
    ));

    HealthChecker::new(registry.clone(), client, &config.health).spawn();
    auth.clone().spawn_rollover();

    let state = openai::AppState::new(auth.clone(), dispatcher, stats)
        .with_relay(streaming::relay_for(&config.streaming))
        .with_stream_by_default(config.streaming.stream_by_default);
    let app = openai::create_router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("监听地址失败: {}", addr))?;

    tracing::info!("启动 AI Router: {}", addr);
    tracing::info!(
        "认证模式: {}，凭据数量: {}，配额策略: {:?}",
        auth.mode().as_str(),
        auth.credentials().len(),
        auth.policy()
    );
    tracing::info!("流式策略: {:?}", config.streaming.strategy);
    tracing::info!("可用 API:");
    tracing::info!("  POST /v1/chat/completions");
    tracing::info!("  GET  /v1/models");
    tracing::info!("  GET  /health");
    tracing::info!("  GET  /stats");
    tracing::info!("  GET  /auth/info");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP 服务异常退出")?;

    tracing::info!("服务已停止");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("监听退出信号失败: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("收到退出信号，正在关闭");
}
