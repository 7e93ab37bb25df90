//! 同步配置模块

use crate::error::SyncError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const LOCAL_SCHEME: &str = "file://";

/// 同步配置
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    #[serde(default)]
    pub private_key: Option<PathBuf>,
    /// 远端目录，`file://<dir>` 表示本地目录
    #[serde(default)]
    pub remote_path: String,
    #[serde(default)]
    pub local_path: PathBuf,
    /// 为空时不使用清单（不去重）
    #[serde(default)]
    pub catalog_file: Option<PathBuf>,
    /// 清单最大行数，<= 0 表示不清理
    #[serde(default = "default_catalog_max_rows")]
    pub catalog_max_rows: i64,
    #[serde(default = "default_pattern")]
    pub pattern: String,
    /// 连接超时（毫秒），0 表示不限
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// 只列出不下载，并检查目标目录可写
    #[serde(default)]
    pub test_mode: bool,
    /// 单个文件失败后的额外重试次数
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
}

fn default_port() -> u16 {
    22
}

fn default_catalog_max_rows() -> i64 {
    10000
}

fn default_pattern() -> String {
    "*.*".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    20000
}

fn default_retry_base_delay_ms() -> u64 {
    2000
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_port(),
            username: String::new(),
            password: None,
            private_key: None,
            remote_path: String::new(),
            local_path: PathBuf::new(),
            catalog_file: None,
            catalog_max_rows: default_catalog_max_rows(),
            pattern: default_pattern(),
            connect_timeout_ms: default_connect_timeout_ms(),
            test_mode: false,
            max_retries: 0,
            retry_base_delay_ms: default_retry_base_delay_ms(),
        }
    }
}

impl std::fmt::Debug for SyncConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("private_key", &self.private_key)
            .field("remote_path", &self.remote_path)
            .field("local_path", &self.local_path)
            .field("catalog_file", &self.catalog_file)
            .field("catalog_max_rows", &self.catalog_max_rows)
            .field("pattern", &self.pattern)
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("test_mode", &self.test_mode)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

impl SyncConfig {
    /// 从 JSON 配置文件的 `sync` 节加载，文件中没有该节时返回默认值
    pub fn load(config_file: &Path) -> Result<Self, SyncError> {
        let content = fs::read_to_string(config_file).map_err(|e| {
            SyncError::InvalidParameters(vec![format!(
                "无法读取配置文件 {}: {}",
                config_file.display(),
                e
            )])
        })?;
        let config: serde_json::Value = serde_json::from_str(&content).map_err(|e| {
            SyncError::InvalidParameters(vec![format!(
                "配置文件格式错误 {}: {}",
                config_file.display(),
                e
            )])
        })?;

        match config.get("sync") {
            Some(sync) => serde_json::from_value::<SyncConfig>(sync.clone()).map_err(|e| {
                SyncError::InvalidParameters(vec![format!("sync 配置无效: {}", e)])
            }),
            None => Ok(Self::default()),
        }
    }

    /// 远端为本地目录时返回其根目录
    pub fn local_remote_root(&self) -> Option<PathBuf> {
        if let Some(dir) = self.remote_path.strip_prefix(LOCAL_SCHEME) {
            return Some(PathBuf::from(dir));
        }
        if self.host.eq_ignore_ascii_case("local") {
            return Some(PathBuf::from("/"));
        }
        None
    }

    /// 会话内使用的远端目录
    pub fn remote_dir(&self) -> &str {
        if self.remote_path.starts_with(LOCAL_SCHEME) {
            "/"
        } else {
            &self.remote_path
        }
    }

    pub fn use_catalog(&self) -> bool {
        self.catalog_file
            .as_ref()
            .is_some_and(|p| !p.as_os_str().is_empty())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// 检查配置，一次返回全部问题
    pub fn validate(&self) -> Result<(), SyncError> {
        let mut errors = Vec::new();
        let local_remote = self.local_remote_root().is_some();

        if self.remote_path.trim().is_empty() {
            errors.push("remotePath 不能为空".to_string());
        }
        if self.local_path.as_os_str().is_empty() {
            errors.push("localPath 不能为空".to_string());
        }
        if !local_remote {
            if self.host.trim().is_empty() {
                errors.push("host 不能为空".to_string());
            }
            if self.username.trim().is_empty() {
                errors.push("username 不能为空".to_string());
            }
            if self.port == 0 {
                errors.push("port 不能为 0".to_string());
            }
            let has_password = self.password.as_ref().is_some_and(|p| !p.is_empty());
            let has_key = self
                .private_key
                .as_ref()
                .is_some_and(|p| !p.as_os_str().is_empty());
            if !has_password && !has_key {
                errors.push("需要提供 password 或 privateKey".to_string());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(SyncError::InvalidParameters(errors))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OutcomeCode;
    use tempfile::tempdir;

    fn valid_config() -> SyncConfig {
        SyncConfig {
            host: "example.com".to_string(),
            username: "user".to_string(),
            password: Some("pw".to_string()),
            remote_path: "/data".to_string(),
            local_path: PathBuf::from("/tmp/dest"),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.port, 22);
        assert_eq!(config.catalog_max_rows, 10000);
        assert_eq!(config.pattern, "*.*");
        assert_eq!(config.connect_timeout(), Duration::from_secs(20));
        assert!(!config.use_catalog());
    }

    #[test]
    fn test_load_sync_section() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("config.json");
        fs::write(
            &file,
            r#"{"log": {"level": "debug"}, "sync": {"host": "h", "port": 2222, "catalogFile": "c.txt", "testMode": true}}"#,
        )
        .unwrap();

        let config = SyncConfig::load(&file).unwrap();
        assert_eq!(config.host, "h");
        assert_eq!(config.port, 2222);
        assert!(config.use_catalog());
        assert!(config.test_mode);
        assert_eq!(config.pattern, "*.*");
    }

    #[test]
    fn test_load_without_sync_section() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("config.json");
        fs::write(&file, r#"{"log": {}}"#).unwrap();

        let config = SyncConfig::load(&file).unwrap();
        assert_eq!(config.port, 22);
    }

    #[test]
    fn test_load_malformed_file() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("config.json");
        fs::write(&file, "{not json").unwrap();

        let err = SyncConfig::load(&file).unwrap_err();
        assert_eq!(err.outcome(), OutcomeCode::InvalidParameters);
    }

    #[test]
    fn test_validate_ok() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let config = SyncConfig {
            port: 0,
            ..Default::default()
        };
        match config.validate() {
            Err(SyncError::InvalidParameters(errors)) => assert_eq!(errors.len(), 6),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_local_remote() {
        let config = SyncConfig {
            remote_path: "file:///mnt/share".to_string(),
            local_path: PathBuf::from("/tmp/dest"),
            ..Default::default()
        };
        assert_eq!(config.local_remote_root(), Some(PathBuf::from("/mnt/share")));
        assert_eq!(config.remote_dir(), "/");
        assert!(config.validate().is_ok());

        let config = SyncConfig {
            host: "LOCAL".to_string(),
            remote_path: "/srv/logs".to_string(),
            ..Default::default()
        };
        assert_eq!(config.local_remote_root(), Some(PathBuf::from("/")));
        assert_eq!(config.remote_dir(), "/srv/logs");
    }

    #[test]
    fn test_debug_hides_password() {
        let text = format!("{:?}", valid_config());
        assert!(!text.contains("\"pw\""));
        assert!(text.contains("***"));
    }
}
