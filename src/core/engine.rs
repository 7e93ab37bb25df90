use crate::config::SyncConfig;
use crate::core::catalog::CatalogStore;
use crate::core::scanner::{filter_listing, NamePattern};
use crate::core::transfer::{landed_size, verify_transfer, TransferFailure, TransferStatus};
use crate::core::watchdog::{ConnectionStatus, ConnectionWatchdog};
use crate::error::{OutcomeCode, SyncError};
use crate::storage::{join_remote_path, Credentials, RemoteEntry, RemoteSession};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// 单次重试等待的上限
const MAX_RETRY_DELAY_MS: u64 = 5 * 60 * 1000;

/// 同步结果状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    Success,
    ConnectionFailed,
    ConnectionTimeout,
    WriteFailed,
    InvalidAuth,
    CatalogAccessFailed,
    CatalogWriteFailed,
    UnknownError,
}

impl From<&SyncError> for RunStatus {
    fn from(err: &SyncError) -> Self {
        match err {
            SyncError::ConnectFailed { .. } => RunStatus::ConnectionFailed,
            SyncError::ConnectTimeout { .. } => RunStatus::ConnectionTimeout,
            SyncError::DestinationWrite { .. } => RunStatus::WriteFailed,
            SyncError::InvalidAuth(_) => RunStatus::InvalidAuth,
            SyncError::CatalogAccess { .. } | SyncError::InvalidCatalogFile(_) => {
                RunStatus::CatalogAccessFailed
            }
            SyncError::CatalogWrite { .. } => RunStatus::CatalogWriteFailed,
            SyncError::InvalidParameters(_)
            | SyncError::Disconnect(_)
            | SyncError::Session(_)
            | SyncError::Unknown(_) => RunStatus::UnknownError,
        }
    }
}

/// 同步报告
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRunResult {
    pub status: RunStatus,
    pub outcome: OutcomeCode,
    /// 致命错误的描述
    pub error: Option<String>,
    pub files_listed: u32,
    pub files_fetched: u32,
    pub files_skipped: u32,
    pub files_failed: u32,
    pub catalog_rows_pruned: usize,
    pub failures: Vec<TransferFailure>,
    pub start_time: i64,
    pub end_time: i64,
    /// 毫秒
    pub duration: u64,
}

impl SyncRunResult {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }
}

/// 单次运行中累计的计数
#[derive(Debug, Default)]
struct RunStats {
    files_listed: u32,
    files_fetched: u32,
    files_skipped: u32,
    catalog_rows_pruned: usize,
    failures: Vec<TransferFailure>,
}

/// 同步引擎：每个实例对应一个会话和一个清单
pub struct SyncEngine {
    config: SyncConfig,
    session: Box<dyn RemoteSession>,
    catalog: CatalogStore,
    pattern: NamePattern,
}

impl SyncEngine {
    /// 创建引擎并加载清单；清单文件不可用时直接失败
    pub fn new(config: SyncConfig, session: Box<dyn RemoteSession>) -> Result<Self, SyncError> {
        let pattern = NamePattern::new(&config.pattern).map_err(|e| {
            SyncError::InvalidParameters(vec![format!("pattern 无效 '{}': {}", config.pattern, e)])
        })?;

        let mut catalog = match config.catalog_file.as_deref() {
            Some(path) if config.use_catalog() => CatalogStore::open(path, true)?,
            _ => CatalogStore::disabled(),
        };
        catalog.load()?;
        if let Some(path) = catalog.path() {
            debug!("使用清单文件: {:?} ({} 个文件)", path, catalog.len());
        }

        Ok(Self {
            config,
            session,
            catalog,
            pattern,
        })
    }

    pub fn catalog(&self) -> &CatalogStore {
        &self.catalog
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// 运行一次同步
    pub async fn run_sync(&mut self) -> SyncRunResult {
        let start_time = chrono::Utc::now().timestamp();
        let started = Instant::now();
        info!(
            "开始同步: {} -> {:?} ({})",
            self.config.remote_path,
            self.config.local_path,
            self.session.name()
        );

        let mut stats = RunStats::default();
        let outcome = self.execute(&mut stats).await;

        let (status, outcome_code, error_message) = match &outcome {
            Ok(()) => (RunStatus::Success, OutcomeCode::Ok, None),
            Err(e) => {
                let code = e.outcome();
                error!("同步失败 [{} / {}]: {}", code, code.legacy_code(), e);
                (RunStatus::from(e), code, Some(e.to_string()))
            }
        };

        let result = SyncRunResult {
            status,
            outcome: outcome_code,
            error: error_message,
            files_listed: stats.files_listed,
            files_fetched: stats.files_fetched,
            files_skipped: stats.files_skipped,
            files_failed: stats.failures.len() as u32,
            catalog_rows_pruned: stats.catalog_rows_pruned,
            failures: stats.failures,
            start_time,
            end_time: chrono::Utc::now().timestamp(),
            duration: started.elapsed().as_millis() as u64,
        };

        info!(
            "同步结束: 状态={:?}, 列出 {}, 拉取 {}, 跳过 {}, 失败 {}, 清理清单 {} 行, 耗时 {}ms",
            result.status,
            result.files_listed,
            result.files_fetched,
            result.files_skipped,
            result.files_failed,
            result.catalog_rows_pruned,
            result.duration
        );
        result
    }

    /// 关闭会话；失败不影响已拉取的文件和清单
    pub async fn disconnect(&mut self) -> Result<(), SyncError> {
        self.session
            .close()
            .await
            .map_err(|e| SyncError::Disconnect(format!("{:#}", e)))?;
        debug!("会话已关闭: {}", self.session.name());
        Ok(())
    }

    async fn execute(&mut self, stats: &mut RunStats) -> Result<(), SyncError> {
        let remote_dir = normalize_remote_dir(self.config.remote_dir());
        let local_dir = self.config.local_path.clone();
        debug!("远端目录: {}, 本地目录: {:?}", remote_dir, local_dir);

        ensure_local_dir(&local_dir)?;
        if self.config.test_mode {
            probe_destination(&local_dir)?;
            if self.catalog.is_enabled() {
                info!("测试模式: 清单中有 {} 个文件", self.catalog.len());
            }
        }

        let credentials = resolve_credentials(&self.config)?;
        self.session.set_credentials(credentials);
        self.connect().await?;

        let listing = self
            .session
            .list_entries(&remote_dir, &self.pattern)
            .await
            .map_err(|e| session_error(e.context(format!("列出远端目录失败: {}", remote_dir))))?;
        let files = filter_listing(listing, &self.pattern);
        info!("远端匹配 {} 个文件", files.len());

        for entry in &files {
            stats.files_listed += 1;
            let status = self.process_entry(entry, &remote_dir, &local_dir, stats).await?;
            debug!("{}: {}", entry.file_name, status);
        }

        if self.catalog.is_enabled() {
            stats.catalog_rows_pruned = self.catalog.cleanup(self.config.catalog_max_rows)?;
            if stats.catalog_rows_pruned > 0 {
                info!("清单已清理 {} 行", stats.catalog_rows_pruned);
            }
        }

        Ok(())
    }

    /// 在看门狗监督下连接，先完成的一方决定结果
    async fn connect(&mut self) -> Result<(), SyncError> {
        let target = format!("{}:{}", self.session.name(), self.config.port);
        let watchdog = ConnectionWatchdog::start(self.config.connect_timeout());
        let cancel = watchdog.cancel_token();

        debug!("连接 {} (超时 {}ms)", target, self.config.connect_timeout_ms);
        // 会话自身负责在令牌触发时释放连接资源，这里只保证不再等待它
        let returned = tokio::select! {
            res = self.session.connect(self.config.port, cancel.clone()) => Some(res),
            _ = cancel.cancelled() => None,
        };

        let status = match &returned {
            Some(Ok(())) if self.session.is_connected() => watchdog.mark_connected(),
            _ => watchdog.mark_failed(),
        };
        let timeout = watchdog.timeout();
        watchdog.stop();

        match status {
            ConnectionStatus::Connected => {
                info!("已连接: {}", target);
                Ok(())
            }
            ConnectionStatus::TimedOut => {
                if let Err(e) = self.session.close().await {
                    debug!("超时后关闭会话失败: {:#}", e);
                }
                Err(SyncError::ConnectTimeout { target, timeout })
            }
            ConnectionStatus::Failed | ConnectionStatus::NotConnected => {
                let reason = match returned {
                    Some(Err(e)) => format!("{:#}", e),
                    _ => "会话未连接".to_string(),
                };
                Err(SyncError::ConnectFailed { target, reason })
            }
        }
    }

    async fn process_entry(
        &mut self,
        entry: &RemoteEntry,
        remote_dir: &str,
        local_dir: &Path,
        stats: &mut RunStats,
    ) -> Result<TransferStatus, SyncError> {
        if self.catalog.exists(&entry.file_name, entry.size_bytes) {
            debug!("已在清单中，跳过: {} ({} bytes)", entry.file_name, entry.size_bytes);
            stats.files_skipped += 1;
            return Ok(TransferStatus::Skipped);
        }

        if self.config.test_mode {
            info!("测试模式，不拉取: {} ({} bytes)", entry.file_name, entry.size_bytes);
            return Ok(TransferStatus::Listed);
        }

        let remote_path = join_remote_path(remote_dir, &entry.file_name);
        match self.fetch_with_retry(entry, &remote_path, local_dir).await {
            Ok(()) => {
                self.catalog.add(&entry.file_name, entry.size_bytes)?;
                stats.files_fetched += 1;
                Ok(TransferStatus::Completed)
            }
            Err(failure) => {
                warn!("拉取失败: {} - {}", failure.file_name, failure.reason);
                stats.failures.push(failure);
                Ok(TransferStatus::Failed)
            }
        }
    }

    /// 拉取并校验大小，失败时按指数退避重试
    async fn fetch_with_retry(
        &mut self,
        entry: &RemoteEntry,
        remote_path: &str,
        local_dir: &Path,
    ) -> Result<(), TransferFailure> {
        let local_file = local_dir.join(&entry.file_name);
        let max_retries = self.config.max_retries;
        let base_delay_ms = self.config.retry_base_delay_ms;
        let mut reason = String::new();
        let mut actual_size = None;

        for attempt in 0..=max_retries {
            debug!("拉取: {} -> {:?}", remote_path, local_file);
            let fetch_error = self.session.fetch(remote_path, local_dir).await.err();
            if let Some(e) = &fetch_error {
                debug!("拉取出错: {} - {:#}", remote_path, e);
            }

            if verify_transfer(&local_file, entry.size_bytes) {
                debug!("校验通过: {} ({} bytes)", entry.file_name, entry.size_bytes);
                return Ok(());
            }
            actual_size = landed_size(&local_file);

            reason = match (&fetch_error, actual_size) {
                (Some(e), _) => format!("{:#}", e),
                (None, Some(size)) => {
                    format!("大小不一致: 期望 {} bytes, 实际 {} bytes", entry.size_bytes, size)
                }
                (None, None) => "本地文件不存在".to_string(),
            };

            if attempt < max_retries {
                let delay = retry_delay_ms(base_delay_ms, attempt);
                warn!(
                    "校验失败，{}ms 后重试 ({}/{}): {} - {}",
                    delay,
                    attempt + 1,
                    max_retries,
                    entry.file_name,
                    reason
                );
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
        }

        Err(TransferFailure {
            file_name: entry.file_name.clone(),
            expected_size: entry.size_bytes,
            actual_size,
            reason,
        })
    }
}

/// 指数退避：`base * 2^attempt`，溢出或过大时取上限
fn retry_delay_ms(base_delay_ms: u64, attempt: u32) -> u64 {
    if base_delay_ms == 0 {
        return 0;
    }
    2_u64
        .checked_pow(attempt)
        .and_then(|factor| base_delay_ms.checked_mul(factor))
        .map_or(MAX_RETRY_DELAY_MS, |delay| delay.min(MAX_RETRY_DELAY_MS))
}

/// 会话错误；阻塞任务崩溃（panic 或被取消）视为未知错误
fn session_error(err: anyhow::Error) -> SyncError {
    if err.downcast_ref::<tokio::task::JoinError>().is_some() {
        SyncError::Unknown(err)
    } else {
        SyncError::Session(err)
    }
}

/// 远端目录统一以 `/` 结尾
fn normalize_remote_dir(dir: &str) -> String {
    let dir = dir.replace('\\', "/");
    if dir.ends_with('/') {
        dir
    } else {
        format!("{}/", dir)
    }
}

fn ensure_local_dir(local_dir: &Path) -> Result<(), SyncError> {
    if local_dir.is_dir() {
        return Ok(());
    }
    info!("创建本地目录: {:?}", local_dir);
    std::fs::create_dir_all(local_dir).map_err(|source| SyncError::DestinationWrite {
        path: local_dir.to_path_buf(),
        source,
    })
}

/// 测试模式下检查目标目录可写：写入、读回、删除一个临时文件
fn probe_destination(local_dir: &Path) -> Result<(), SyncError> {
    let probe: PathBuf = local_dir.join(format!("sshsync_probe_{}.tmp", uuid::Uuid::new_v4()));
    let payload = b"sshsync write probe";
    let write_err = |source| SyncError::DestinationWrite {
        path: probe.clone(),
        source,
    };

    std::fs::write(&probe, payload).map_err(write_err)?;
    let read_back = std::fs::read(&probe).map_err(write_err)?;
    if read_back != payload {
        return Err(SyncError::DestinationWrite {
            path: probe.clone(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, "读回内容不一致"),
        });
    }
    if let Err(e) = std::fs::remove_file(&probe) {
        warn!("删除探测文件失败 {:?}: {}", probe, e);
    }
    info!("目标目录可写: {:?}", local_dir);
    Ok(())
}

/// 私钥存在时优先使用；私钥缺失且没有密码时认证信息无效
fn resolve_credentials(config: &SyncConfig) -> Result<Credentials, SyncError> {
    let password = config.password.clone().filter(|p| !p.is_empty());
    let key = config
        .private_key
        .clone()
        .filter(|p| !p.as_os_str().is_empty());

    let private_key = match key {
        Some(key) if key.is_file() => {
            debug!("使用私钥认证: {:?}", key);
            Some(key)
        }
        Some(key) => {
            if password.is_none() {
                return Err(SyncError::InvalidAuth(format!(
                    "私钥文件不存在且未提供密码: {}",
                    key.display()
                )));
            }
            warn!("私钥文件不存在，改用密码认证: {:?}", key);
            None
        }
        None => None,
    };

    Ok(Credentials {
        password,
        private_key,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_normalize_remote_dir() {
        assert_eq!(normalize_remote_dir("/data"), "/data/");
        assert_eq!(normalize_remote_dir("/data/"), "/data/");
        assert_eq!(normalize_remote_dir("logs\\in"), "logs/in/");
    }

    #[test]
    fn test_retry_delay_doubles() {
        assert_eq!(retry_delay_ms(2000, 0), 2000);
        assert_eq!(retry_delay_ms(2000, 1), 4000);
        assert_eq!(retry_delay_ms(2000, 3), 16000);
    }

    #[test]
    fn test_retry_delay_is_capped_without_overflow() {
        assert_eq!(retry_delay_ms(2000, 20), MAX_RETRY_DELAY_MS);
        assert_eq!(retry_delay_ms(2000, 70), MAX_RETRY_DELAY_MS);
        assert_eq!(retry_delay_ms(u64::MAX, 1), MAX_RETRY_DELAY_MS);
        assert_eq!(retry_delay_ms(0, 70), 0);
    }

    #[tokio::test]
    async fn test_crashed_blocking_task_is_unknown_error() {
        let join_err = tokio::task::spawn_blocking(|| -> u32 { panic!("listing crashed") })
            .await
            .unwrap_err();
        let err = session_error(anyhow::Error::from(join_err).context("列出远端目录失败"));
        assert_eq!(err.outcome(), OutcomeCode::UnknownError);
        assert_eq!(RunStatus::from(&err), RunStatus::UnknownError);

        let err = session_error(anyhow::anyhow!("permission denied"));
        assert_eq!(err.outcome(), OutcomeCode::SshUnknownError);
    }

    #[test]
    fn test_probe_destination_leaves_nothing_behind() {
        let dir = tempdir().unwrap();
        probe_destination(dir.path()).unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_probe_destination_missing_dir() {
        let dir = tempdir().unwrap();
        let err = probe_destination(&dir.path().join("missing")).unwrap_err();
        assert_eq!(err.outcome(), OutcomeCode::WriteDestinationError);
    }

    #[test]
    fn test_credentials_key_wins_when_present() {
        let dir = tempdir().unwrap();
        let key = dir.path().join("id_ed25519");
        std::fs::write(&key, b"key").unwrap();
        let config = SyncConfig {
            password: Some("pw".to_string()),
            private_key: Some(key.clone()),
            ..Default::default()
        };

        let creds = resolve_credentials(&config).unwrap();
        assert_eq!(creds.private_key, Some(key));
        assert_eq!(creds.password.as_deref(), Some("pw"));
    }

    #[test]
    fn test_credentials_missing_key_falls_back_to_password() {
        let dir = tempdir().unwrap();
        let config = SyncConfig {
            password: Some("pw".to_string()),
            private_key: Some(dir.path().join("missing")),
            ..Default::default()
        };

        let creds = resolve_credentials(&config).unwrap();
        assert!(creds.private_key.is_none());
        assert_eq!(creds.password.as_deref(), Some("pw"));
    }

    #[test]
    fn test_credentials_missing_key_without_password() {
        let dir = tempdir().unwrap();
        let config = SyncConfig {
            private_key: Some(dir.path().join("missing")),
            ..Default::default()
        };

        let err = resolve_credentials(&config).unwrap_err();
        assert_eq!(err.outcome(), OutcomeCode::InvalidAuthDetails);
        assert_eq!(RunStatus::from(&err), RunStatus::InvalidAuth);
    }
}
