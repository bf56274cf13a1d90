//! 调用方凭据配置
//!
//! 从 credentials.json 加载，启动后不再变更

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

/// 认证模式
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMode {
    /// 所有调用方共用一个密钥和一个配额桶
    Shared,
    /// 每个密钥对应独立的所有者和配额
    MultiUser,
}

impl Default for AuthMode {
    fn default() -> Self {
        Self::Shared
    }
}

impl AuthMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMode::Shared => "shared",
            AuthMode::MultiUser => "multi-user",
        }
    }
}

/// 单个用户凭据
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserCredential {
    pub key: String,

    pub owner_id: String,

    #[serde(default = "default_user_daily_limit")]
    pub daily_limit: u32,

    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_user_daily_limit() -> u32 {
    1000
}

fn default_active() -> bool {
    true
}

/// 凭据文件
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialsConfig {
    #[serde(default)]
    pub mode: AuthMode,

    /// shared 模式下的共享密钥
    #[serde(default)]
    pub shared_key: Option<String>,

    #[serde(default = "default_shared_daily_limit")]
    pub shared_daily_limit: u32,

    /// multi-user 模式下的用户列表
    #[serde(default)]
    pub users: Vec<UserCredential>,
}

fn default_shared_daily_limit() -> u32 {
    999_999
}

impl CredentialsConfig {
    /// 获取默认凭据文件路径
    pub fn default_credentials_path() -> &'static str {
        "credentials.json"
    }

    /// 从文件加载凭据
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("读取凭据文件失败: {}", path.display()))?;
        let credentials: CredentialsConfig = serde_json::from_str(&content)
            .with_context(|| format!("解析凭据文件失败: {}", path.display()))?;
        Ok(credentials)
    }

    /// 校验凭据配置与认证模式是否匹配
    pub fn validate(&self) -> anyhow::Result<()> {
        match self.mode {
            AuthMode::Shared => {
                let key = self.shared_key.as_deref().unwrap_or("");
                if key.trim().is_empty() {
                    bail!("shared 模式需要配置 sharedKey");
                }
            }
            AuthMode::MultiUser => {
                if self.users.is_empty() {
                    bail!("multi-user 模式至少需要一个用户");
                }
                let mut keys = HashSet::new();
                for user in &self.users {
                    if user.key.trim().is_empty() {
                        bail!("用户 {} 的 key 不能为空", user.owner_id);
                    }
                    if user.owner_id.trim().is_empty() {
                        bail!("存在 ownerId 为空的用户");
                    }
                    if !keys.insert(user.key.as_str()) {
                        bail!("用户 {} 的 key 与其他用户重复", user.owner_id);
                    }
                }
            }
        }
        Ok(())
    }
}
