use super::{remote_file_name, remove_partial, Credentials, RemoteEntry, RemoteSession};
use crate::core::scanner::NamePattern;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use walkdir::WalkDir;

/// 以本地目录模拟远端的会话，远端路径相对于 `root` 解析
pub struct LocalSession {
    root: PathBuf,
    name: String,
    connected: bool,
}

impl LocalSession {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let name = format!("local:{}", root.display());
        Self {
            root,
            name,
            connected: false,
        }
    }

    fn resolve_path(&self, path: &str) -> PathBuf {
        let path = path.trim_start_matches('/').trim_start_matches('\\');
        let path = path.trim_start_matches("./");
        if path.is_empty() || path == "." {
            self.root.clone()
        } else {
            self.root.join(path)
        }
    }
}

#[async_trait]
impl RemoteSession for LocalSession {
    fn set_credentials(&mut self, _credentials: Credentials) {}

    async fn connect(&mut self, _port: u16, cancel: CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            bail!("连接已取消");
        }
        let meta = fs::metadata(&self.root)
            .await
            .with_context(|| format!("远端根目录不可访问: {}", self.root.display()))?;
        if !meta.is_dir() {
            bail!("远端根目录不是目录: {}", self.root.display());
        }
        self.connected = true;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn list_entries(
        &mut self,
        remote_dir: &str,
        pattern: &NamePattern,
    ) -> Result<Vec<RemoteEntry>> {
        if !self.connected {
            bail!("会话未连接");
        }
        let base = self.resolve_path(remote_dir);
        let pattern = pattern.clone();

        let entries = tokio::task::spawn_blocking(move || -> Result<Vec<RemoteEntry>> {
            let mut entries = Vec::new();
            for entry in WalkDir::new(&base)
                .min_depth(1)
                .max_depth(1)
                .follow_links(false)
                .sort_by_file_name()
            {
                let entry = entry.with_context(|| format!("读取目录失败: {}", base.display()))?;
                let Some(file_name) = entry.file_name().to_str() else {
                    continue;
                };
                let is_dir = entry.file_type().is_dir();
                if !is_dir && !pattern.matches(file_name) {
                    continue;
                }
                let metadata = entry.metadata()?;
                entries.push(RemoteEntry {
                    file_name: file_name.to_string(),
                    size_bytes: if is_dir { 0 } else { metadata.len() },
                    is_dir,
                });
            }
            Ok(entries)
        })
        .await??;

        debug!("{} 列出 {} 项", self.name, entries.len());
        Ok(entries)
    }

    async fn fetch(&mut self, remote_path: &str, local_dir: &Path) -> Result<()> {
        if !self.connected {
            bail!("会话未连接");
        }
        let source = self.resolve_path(remote_path);
        let file_name = remote_file_name(remote_path);
        let target = local_dir.join(file_name);
        let partial = local_dir.join(format!("{}.partial", file_name));

        let copied = async {
            fs::copy(&source, &partial)
                .await
                .with_context(|| format!("复制失败: {}", source.display()))?;
            fs::rename(&partial, &target)
                .await
                .with_context(|| format!("重命名失败: {}", target.display()))?;
            Ok::<(), anyhow::Error>(())
        }
        .await;
        if copied.is_err() {
            remove_partial(&partial);
        }
        copied
    }

    async fn close(&mut self) -> Result<()> {
        self.connected = false;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_connect_requires_directory() {
        let dir = tempdir().unwrap();
        let mut session = LocalSession::new(dir.path().join("missing"));
        assert!(session.connect(22, CancellationToken::new()).await.is_err());
        assert!(!session.is_connected());

        let mut session = LocalSession::new(dir.path());
        session.connect(22, CancellationToken::new()).await.unwrap();
        assert!(session.is_connected());
    }

    #[tokio::test]
    async fn test_list_entries_is_shallow() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"12345").unwrap();
        std::fs::write(dir.path().join("skip.log"), b"1").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub").join("deep.txt"), b"1").unwrap();

        let mut session = LocalSession::new(dir.path());
        session.connect(22, CancellationToken::new()).await.unwrap();
        let pattern = NamePattern::new("*.txt").unwrap();
        let entries = session.list_entries("/", &pattern).await.unwrap();

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].file_name, "a.txt");
        assert_eq!(entries[0].size_bytes, 5);
        assert!(entries[1].is_dir);
    }

    #[tokio::test]
    async fn test_fetch_copies_into_local_dir() {
        let remote = tempdir().unwrap();
        let local = tempdir().unwrap();
        std::fs::create_dir(remote.path().join("logs")).unwrap();
        std::fs::write(remote.path().join("logs").join("a.txt"), b"hello").unwrap();

        let mut session = LocalSession::new(remote.path());
        session.connect(22, CancellationToken::new()).await.unwrap();
        session.fetch("/logs/a.txt", local.path()).await.unwrap();

        assert_eq!(std::fs::read(local.path().join("a.txt")).unwrap(), b"hello");
        assert!(!local.path().join("a.txt.partial").exists());
    }

    #[tokio::test]
    async fn test_failed_fetch_leaves_no_partial_file() {
        let remote = tempdir().unwrap();
        let local = tempdir().unwrap();
        std::fs::write(remote.path().join("a.txt"), b"hello").unwrap();
        // 目标位置已被目录占用，重命名会失败
        std::fs::create_dir(local.path().join("a.txt")).unwrap();

        let mut session = LocalSession::new(remote.path());
        session.connect(22, CancellationToken::new()).await.unwrap();
        assert!(session.fetch("/a.txt", local.path()).await.is_err());

        assert!(!local.path().join("a.txt.partial").exists());
        assert!(local.path().join("a.txt").is_dir());
    }
}
