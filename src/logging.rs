//! 日志模块 - 按天命名、按大小轮转的日志文件

use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogConfig {
    /// 是否写日志文件
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// 单个日志文件最大大小（MB）
    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: u32,
    /// 日志级别: "error", "warn", "info", "debug", "trace"
    #[serde(default = "default_level")]
    pub level: String,
    /// 日志目录，缺省为配置目录下的 sshsync/logs
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

fn default_enabled() -> bool {
    true
}

fn default_max_size_mb() -> u32 {
    5 // 默认 5MB
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_size_mb: default_max_size_mb(),
            level: default_level(),
            dir: None,
        }
    }
}

impl LogConfig {
    /// 从 JSON 配置文件的 `log` 节加载；文件缺失或格式不对时使用默认值
    pub fn load(config_file: Option<&Path>) -> Self {
        config_file
            .and_then(|path| fs::read_to_string(path).ok())
            .and_then(|content| serde_json::from_str::<serde_json::Value>(&content).ok())
            .and_then(|config| config.get("log").cloned())
            .and_then(|log| serde_json::from_value::<LogConfig>(log).ok())
            .unwrap_or_default()
    }

    /// 将配置的日志级别转换为 tracing Level
    pub fn tracing_level(&self) -> tracing::Level {
        match self.level.to_lowercase().as_str() {
            "error" => tracing::Level::ERROR,
            "warn" => tracing::Level::WARN,
            "debug" => tracing::Level::DEBUG,
            "trace" => tracing::Level::TRACE,
            _ => tracing::Level::INFO,
        }
    }

    pub fn log_dir(&self) -> PathBuf {
        self.dir.clone().unwrap_or_else(default_log_dir)
    }
}

/// 默认日志目录
pub fn default_log_dir() -> PathBuf {
    crate::dirs::config_dir()
        .map(|p| p.join("sshsync").join("logs"))
        .unwrap_or_else(|| PathBuf::from(".sshsync").join("logs"))
}

/// 日志文件写入器：文件名带日期，超过大小限制时改名为 `.old` 后重新打开
///
/// 由 `tracing_appender::non_blocking` 的后台线程独占使用。
pub struct SizeRotatingWriter {
    log_dir: PathBuf,
    max_size: u64,
    date: String,
    file_path: PathBuf,
    written: u64,
    writer: BufWriter<File>,
}

impl SizeRotatingWriter {
    pub fn new(log_dir: &Path, max_size_mb: u32) -> io::Result<Self> {
        fs::create_dir_all(log_dir)?;

        let max_size = (max_size_mb as u64) * 1024 * 1024;
        let date = today();
        let file_path = log_file_path(log_dir, &date);
        let (writer, written) = Self::open_file(&file_path, max_size)?;

        Ok(Self {
            log_dir: log_dir.to_path_buf(),
            max_size,
            date,
            file_path,
            written,
            writer,
        })
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    fn open_file(file_path: &Path, max_size: u64) -> io::Result<(BufWriter<File>, u64)> {
        // 已有文件超过限制时先轮转
        if let Ok(metadata) = fs::metadata(file_path) {
            if metadata.len() > max_size {
                Self::rotate_log(file_path)?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(file_path)?;
        let written = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok((BufWriter::new(file), written))
    }

    /// 轮转日志文件：sshsync_YYYYMMDD.log -> sshsync_YYYYMMDD.log.old
    fn rotate_log(file_path: &Path) -> io::Result<()> {
        let backup_path = file_path.with_extension("log.old");
        if backup_path.exists() {
            fs::remove_file(&backup_path)?;
        }
        fs::rename(file_path, &backup_path)
    }

    fn reopen(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        let (writer, written) = Self::open_file(&self.file_path, self.max_size)?;
        self.writer = writer;
        self.written = written;
        Ok(())
    }

    fn check_and_rotate(&mut self) -> io::Result<()> {
        let date = today();
        if date != self.date {
            self.date = date;
            self.file_path = log_file_path(&self.log_dir, &self.date);
            self.reopen()?;
        } else if self.written > self.max_size {
            self.writer.flush()?;
            Self::rotate_log(&self.file_path)?;
            self.reopen()?;
        }
        Ok(())
    }
}

impl Write for SizeRotatingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.check_and_rotate()?;
        let n = self.writer.write(buf)?;
        self.writer.flush()?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

fn today() -> String {
    chrono::Local::now().format("%Y%m%d").to_string()
}

fn log_file_path(log_dir: &Path, date: &str) -> PathBuf {
    log_dir.join(format!("sshsync_{}.log", date))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_load_log_section() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("config.json");
        fs::write(&file, r#"{"log": {"level": "debug", "maxSizeMb": 1}}"#).unwrap();

        let config = LogConfig::load(Some(&file));
        assert!(config.enabled);
        assert_eq!(config.max_size_mb, 1);
        assert_eq!(config.tracing_level(), tracing::Level::DEBUG);
    }

    #[test]
    fn test_load_defaults() {
        let config = LogConfig::load(None);
        assert!(config.enabled);
        assert_eq!(config.max_size_mb, 5);
        assert_eq!(config.tracing_level(), tracing::Level::INFO);
    }

    #[test]
    fn test_writer_uses_dated_file_name() {
        let dir = tempdir().unwrap();
        let mut writer = SizeRotatingWriter::new(dir.path(), 1).unwrap();
        writer.write_all(b"hello\n").unwrap();

        let name = writer.file_path().file_name().unwrap().to_str().unwrap().to_string();
        assert!(name.starts_with("sshsync_"));
        assert!(name.ends_with(".log"));
        assert_eq!(fs::read(writer.file_path()).unwrap(), b"hello\n");
    }

    #[test]
    fn test_writer_rotates_when_too_large() {
        let dir = tempdir().unwrap();
        let mut writer = SizeRotatingWriter::new(dir.path(), 0).unwrap();
        writer.write_all(b"first\n").unwrap();
        writer.write_all(b"second\n").unwrap();

        let backup = writer.file_path().with_extension("log.old");
        assert_eq!(fs::read(&backup).unwrap(), b"first\n");
        assert_eq!(fs::read(writer.file_path()).unwrap(), b"second\n");
    }
}
