//! 基于 ssh2 的 SFTP 会话
//!
//! ssh2 为阻塞接口，握手、认证、列目录和下载都放在 `spawn_blocking` 中执行。
//! TCP 连接阶段和握手阶段都会响应取消令牌。握手期间由一个独立任务监听令牌，
//! 令牌触发时关闭底层套接字，即使 `connect` 的 future 已被丢弃也会执行，
//! 使阻塞中的 libssh2 调用尽快返回；握手本身另有 libssh2 超时兜底。

use super::{remote_file_name, remove_partial, Credentials, RemoteEntry, RemoteSession};
use crate::core::scanner::NamePattern;
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use ssh2::Session;
use std::io;
use std::net::Shutdown;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub struct SftpSession {
    host: String,
    username: String,
    credentials: Credentials,
    session: Option<Session>,
    /// 握手和认证阶段的 libssh2 超时，0 表示不限
    handshake_timeout: Duration,
    name: String,
}

impl SftpSession {
    pub fn new(host: &str, username: &str) -> Self {
        Self {
            host: host.to_string(),
            username: username.to_string(),
            credentials: Credentials::default(),
            session: None,
            handshake_timeout: Duration::ZERO,
            name: format!("sftp:{}@{}", username, host),
        }
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    fn connected_session(&self) -> Result<Session> {
        self.session
            .clone()
            .ok_or_else(|| anyhow!("SFTP 会话未连接: {}", self.name))
    }
}

/// 私钥优先，失败后回退到密码
fn authenticate(sess: &Session, username: &str, credentials: &Credentials) -> Result<()> {
    let mut auth_errs: Vec<String> = Vec::new();

    if let Some(key) = credentials.private_key.as_deref() {
        match sess.userauth_pubkey_file(username, None, key, None) {
            Ok(()) => {}
            Err(e) => auth_errs.push(format!("key {}: {}", key.display(), e)),
        }
    }

    if !sess.authenticated() {
        if let Some(password) = credentials.password.as_deref() {
            match sess.userauth_password(username, password) {
                Ok(()) => {}
                Err(e) => auth_errs.push(format!("password: {}", e)),
            }
        }
    }

    if !sess.authenticated() {
        debug!("SSH 认证失败: {}", auth_errs.join("; "));
        bail!("SSH 认证失败: {}", auth_errs.join("; "));
    }
    Ok(())
}

#[async_trait]
impl RemoteSession for SftpSession {
    fn set_credentials(&mut self, credentials: Credentials) {
        self.credentials = credentials;
    }

    async fn connect(&mut self, port: u16, cancel: CancellationToken) -> Result<()> {
        let addr = format!("{}:{}", self.host, port);
        debug!("TCP 连接: {}", addr);

        let tcp = tokio::select! {
            _ = cancel.cancelled() => bail!("连接已取消: {}", addr),
            res = tokio::net::TcpStream::connect(&addr) => {
                res.with_context(|| format!("TCP 连接到 {} 失败", addr))?
            }
        };
        let tcp = tcp.into_std()?;
        tcp.set_nonblocking(false)?;
        let guard = tcp.try_clone()?;

        // 不依赖本 future 的生命周期：调用方丢弃 future 后令牌触发也会关闭套接字
        let shutdown_cancel = cancel.clone();
        let shutdown_addr = addr.clone();
        let shutdown = tokio::spawn(async move {
            shutdown_cancel.cancelled().await;
            debug!("握手被取消，关闭套接字: {}", shutdown_addr);
            if let Err(e) = guard.shutdown(Shutdown::Both) {
                warn!("关闭套接字失败: {}", e);
            }
        });

        let username = self.username.clone();
        let credentials = self.credentials.clone();
        let handshake_addr = addr.clone();
        let timeout_ms = u32::try_from(self.handshake_timeout.as_millis()).unwrap_or(u32::MAX);
        let mut handshake = tokio::task::spawn_blocking(move || -> Result<Session> {
            let mut sess = Session::new().context("创建 SSH 会话失败")?;
            sess.set_tcp_stream(tcp);
            sess.set_timeout(timeout_ms);
            sess.handshake()
                .with_context(|| format!("SSH 握手失败: {}", handshake_addr))?;
            authenticate(&sess, &username, &credentials)?;
            sess.set_timeout(0);
            Ok(sess)
        });

        let joined = tokio::select! {
            _ = cancel.cancelled() => None,
            res = &mut handshake => Some(res),
        };
        let Some(joined) = joined else {
            bail!("SSH 握手已取消: {}", addr);
        };
        shutdown.abort();
        let sess = joined??;

        self.session = Some(sess);
        debug!("SSH 已连接: {}", self.name);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.session
            .as_ref()
            .map(|s| s.authenticated())
            .unwrap_or(false)
    }

    async fn list_entries(
        &mut self,
        remote_dir: &str,
        pattern: &NamePattern,
    ) -> Result<Vec<RemoteEntry>> {
        let sess = self.connected_session()?;
        let dir = remote_dir.to_string();
        let pattern = pattern.clone();

        tokio::task::spawn_blocking(move || -> Result<Vec<RemoteEntry>> {
            let sftp = sess.sftp().context("创建 SFTP 通道失败")?;
            let listing = sftp
                .readdir(Path::new(if dir.is_empty() { "." } else { &dir }))
                .with_context(|| format!("读取远端目录失败: {}", dir))?;

            let entries = listing
                .into_iter()
                .filter_map(|(path, stat)| {
                    let file_name = path.file_name()?.to_str()?.to_string();
                    let is_dir = stat.is_dir();
                    if !is_dir && !pattern.matches(&file_name) {
                        return None;
                    }
                    Some(RemoteEntry {
                        file_name,
                        size_bytes: stat.size.unwrap_or(0),
                        is_dir,
                    })
                })
                .collect();
            Ok(entries)
        })
        .await?
    }

    async fn fetch(&mut self, remote_path: &str, local_dir: &Path) -> Result<()> {
        let sess = self.connected_session()?;
        let remote_path = remote_path.to_string();
        let file_name = remote_file_name(&remote_path).to_string();
        let target: PathBuf = local_dir.join(&file_name);
        let partial: PathBuf = local_dir.join(format!("{}.partial", file_name));

        tokio::task::spawn_blocking(move || -> Result<()> {
            let sftp = sess.sftp().context("创建 SFTP 通道失败")?;
            let mut remote = sftp
                .open(Path::new(&remote_path))
                .with_context(|| format!("打开远端文件失败: {}", remote_path))?;

            let mut download = || -> Result<u64> {
                let mut local = std::fs::File::create(&partial)
                    .with_context(|| format!("创建本地文件失败: {}", partial.display()))?;
                let copied = io::copy(&mut remote, &mut local)
                    .with_context(|| format!("下载失败: {}", remote_path))?;
                local.sync_all()?;
                drop(local);
                std::fs::rename(&partial, &target)?;
                Ok(copied)
            };
            match download() {
                Ok(copied) => {
                    debug!("下载完成: {} ({} bytes)", remote_path, copied);
                    Ok(())
                }
                Err(e) => {
                    remove_partial(&partial);
                    Err(e)
                }
            }
        })
        .await?
    }

    async fn close(&mut self) -> Result<()> {
        let Some(sess) = self.session.take() else {
            return Ok(());
        };
        tokio::task::spawn_blocking(move || sess.disconnect(None, "sshsync done", None))
            .await?
            .context("断开 SSH 连接失败")?;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
