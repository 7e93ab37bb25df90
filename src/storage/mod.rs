pub mod local;
pub mod sftp;

use crate::config::SyncConfig;
use crate::core::scanner::NamePattern;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

pub use local::LocalSession;
pub use sftp::SftpSession;

/// 远端目录列表中的一项
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEntry {
    /// 不含路径的文件名
    pub file_name: String,
    pub size_bytes: u64,
    pub is_dir: bool,
}

/// 认证信息，连接前设置
#[derive(Clone, Default)]
pub struct Credentials {
    pub password: Option<String>,
    pub private_key: Option<PathBuf>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("private_key", &self.private_key)
            .finish()
    }
}

/// 远端传输会话抽象接口
///
/// 同一次同步只使用一个会话，且不会并发调用。
#[async_trait]
pub trait RemoteSession: Send {
    /// 设置认证信息
    fn set_credentials(&mut self, credentials: Credentials);

    /// 建立连接；`cancel` 被触发时应尽快放弃并返回错误
    async fn connect(&mut self, port: u16, cancel: CancellationToken) -> Result<()>;

    /// 是否已连接
    fn is_connected(&self) -> bool;

    /// 列出远端目录中匹配通配符的条目
    async fn list_entries(
        &mut self,
        remote_dir: &str,
        pattern: &NamePattern,
    ) -> Result<Vec<RemoteEntry>>;

    /// 将远端文件下载到本地目录，文件名不变
    async fn fetch(&mut self, remote_path: &str, local_dir: &Path) -> Result<()>;

    /// 关闭连接
    async fn close(&mut self) -> Result<()>;

    /// 会话名称（用于日志）
    fn name(&self) -> &str;
}

/// 远端路径中的文件名部分
pub fn remote_file_name(remote_path: &str) -> &str {
    remote_path
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty())
        .unwrap_or(remote_path)
}

/// 远端目录下某文件的完整路径
pub fn join_remote_path(dir: &str, file_name: &str) -> String {
    if dir.is_empty() {
        file_name.to_string()
    } else if dir.ends_with('/') {
        format!("{}{}", dir, file_name)
    } else {
        format!("{}/{}", dir, file_name)
    }
}

/// 删除未完成的下载文件
pub(crate) fn remove_partial(partial: &Path) {
    match std::fs::remove_file(partial) {
        Ok(()) => tracing::debug!("已删除未完成的文件: {:?}", partial),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("删除未完成的文件失败 {:?}: {}", partial, e),
    }
}

/// 根据配置创建会话实例
pub fn create_session(config: &SyncConfig) -> Box<dyn RemoteSession> {
    if let Some(root) = config.local_remote_root() {
        tracing::info!("使用本地目录作为远端: {:?}", root);
        return Box::new(LocalSession::new(root));
    }
    tracing::info!(
        "初始化 SFTP 会话: {}@{}:{}",
        config.username,
        config.host,
        config.port
    );
    Box::new(
        SftpSession::new(&config.host, &config.username)
            .with_handshake_timeout(config.connect_timeout()),
    )
}
