//! 已传输文件清单 - 用于增量拉取去重
//!
//! 清单文件每行一条 `文件名,字节数`，只追加不去重；
//! 内存索引在加载时按行序折叠，同名条目以最后一行为准。

use crate::error::SyncError;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// 清单条目
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub file_name: String,
    pub size_bytes: u64,
}

impl CatalogEntry {
    /// 解析一行清单记录，空行或字节数无法解析时返回 None
    pub fn parse_line(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let mut fields = line.split(',');
        let file_name = fields.next()?.to_string();
        let size_bytes = parse_size(fields.next()?)?;
        Some(Self {
            file_name,
            size_bytes,
        })
    }

    fn to_line(&self) -> String {
        format!("{},{}", self.file_name, self.size_bytes)
    }
}

/// 解析字节数，兼容旧工具写出的浮点格式（如 `1E+15`、`100.0`）
fn parse_size(text: &str) -> Option<u64> {
    let text = text.trim();
    if let Ok(size) = text.parse::<u64>() {
        return Some(size);
    }
    let value = text.parse::<f64>().ok()?;
    if value.is_finite() && value >= 0.0 && value.fract() == 0.0 && value <= u64::MAX as f64 {
        Some(value as u64)
    } else {
        None
    }
}

/// 清单存储
pub struct CatalogStore {
    /// None 表示未启用清单（不去重模式）
    path: Option<PathBuf>,
    entries: HashMap<String, u64>,
    /// 文件末尾缺少换行时，下一次追加需要先补一个
    needs_newline: bool,
}

impl CatalogStore {
    /// 打开清单；`use_catalog` 为 false 时返回一个什么都不做的清单
    pub fn open(path: impl AsRef<Path>, use_catalog: bool) -> Result<Self, SyncError> {
        if !use_catalog {
            debug!("未使用清单文件，所有匹配的文件都会被拉取");
            return Ok(Self::disabled());
        }

        let path = path.as_ref().to_path_buf();
        match fs::metadata(&path) {
            Ok(meta) if meta.is_file() => {
                debug!("清单文件已存在: {:?}", path);
            }
            Ok(_) => return Err(SyncError::InvalidCatalogFile(path)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("清单文件不存在，创建空文件: {:?}", path);
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    fs::create_dir_all(parent).map_err(|source| SyncError::CatalogAccess {
                        path: path.clone(),
                        source,
                    })?;
                }
                File::create(&path).map_err(|source| SyncError::CatalogAccess {
                    path: path.clone(),
                    source,
                })?;
            }
            Err(source) => return Err(SyncError::CatalogAccess { path, source }),
        }

        Ok(Self {
            path: Some(path),
            entries: HashMap::new(),
            needs_newline: false,
        })
    }

    /// 未启用的清单
    pub fn disabled() -> Self {
        Self {
            path: None,
            entries: HashMap::new(),
            needs_newline: false,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.path.is_some()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// 索引中的有效条目数
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 将清单文件加载到内存索引
    pub fn load(&mut self) -> Result<usize, SyncError> {
        let Some(path) = self.path.clone() else {
            return Ok(0);
        };

        let access_err = |source| SyncError::CatalogAccess {
            path: path.clone(),
            source,
        };

        let content = fs::read(&path).map_err(access_err)?;
        self.needs_newline = !content.is_empty() && !content.ends_with(b"\n");

        if content.is_empty() {
            debug!("清单文件为空");
            return Ok(0);
        }

        let reader = BufReader::new(content.as_slice());
        let mut skipped = 0usize;
        for line in reader.lines() {
            let line = line.map_err(access_err)?;
            if line.trim().is_empty() {
                continue;
            }
            match CatalogEntry::parse_line(&line) {
                Some(entry) => {
                    if self.entries.contains_key(&entry.file_name) {
                        debug!("清单中存在重复条目，以后出现的为准: {}", entry.file_name);
                    }
                    self.entries.insert(entry.file_name, entry.size_bytes);
                }
                None => {
                    skipped += 1;
                    warn!("无法解析清单记录，已跳过: {:?}", line);
                }
            }
        }

        info!(
            "清单加载完成: {} 个条目 ({} 行无效)",
            self.entries.len(),
            skipped
        );
        Ok(self.entries.len())
    }

    /// 文件名存在且字节数完全一致时返回 true
    pub fn exists(&self, file_name: &str, size_bytes: u64) -> bool {
        if !self.is_enabled() {
            return false;
        }
        match self.entries.get(file_name) {
            Some(&size) if size == size_bytes => {
                debug!("清单命中: {} ({} 字节)", file_name, size_bytes);
                true
            }
            Some(&size) => {
                debug!(
                    "清单中存在 {} 但大小不同 (清单={}, 远端={})",
                    file_name, size, size_bytes
                );
                false
            }
            None => {
                debug!("清单中不存在: {}", file_name);
                false
            }
        }
    }

    /// 追加一条记录并更新索引
    pub fn add(&mut self, file_name: &str, size_bytes: u64) -> Result<(), SyncError> {
        let Some(path) = self.path.as_ref() else {
            return Ok(());
        };

        let entry = CatalogEntry {
            file_name: file_name.to_string(),
            size_bytes,
        };
        let mut record = String::new();
        if self.needs_newline {
            record.push('\n');
        }
        record.push_str(&entry.to_line());
        record.push('\n');

        let write_err = |source| SyncError::CatalogWrite {
            path: path.clone(),
            source,
        };
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(write_err)?;
        file.write_all(record.as_bytes()).map_err(write_err)?;
        file.flush().map_err(write_err)?;

        self.needs_newline = false;
        self.entries.insert(entry.file_name, entry.size_bytes);
        debug!("已加入清单: {} ({} 字节)", file_name, size_bytes);
        Ok(())
    }

    /// 按行序保留最新的 `max_rows` 行，返回被删除的行数
    ///
    /// 只看位置不看内容，较早的有效条目同样会被删除；内存索引不受影响。
    pub fn cleanup(&mut self, max_rows: i64) -> Result<usize, SyncError> {
        let Some(path) = self.path.clone() else {
            return Ok(0);
        };
        if max_rows <= 0 {
            return Ok(0);
        }
        let max_rows = max_rows as usize;

        let access_err = |source| SyncError::CatalogAccess {
            path: path.clone(),
            source,
        };
        let file = File::open(&path).map_err(access_err)?;
        let mut lines = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(access_err)?;
            let line = line.trim();
            if !line.is_empty() {
                lines.push(line.to_string());
            }
        }

        if lines.len() <= max_rows {
            return Ok(0);
        }

        let removed = lines.len() - max_rows;
        let retained = &lines[removed..];

        let write_err = |source| SyncError::CatalogWrite {
            path: path.clone(),
            source,
        };
        let mut content = retained.join("\n");
        content.push('\n');
        // 先写临时文件再重命名，避免写到一半时清单损坏
        let mut temp_name = path.file_name().unwrap_or_default().to_os_string();
        temp_name.push(".tmp");
        let temp_path = path.with_file_name(temp_name);
        fs::write(&temp_path, content).map_err(write_err)?;
        fs::rename(&temp_path, &path).map_err(write_err)?;

        self.needs_newline = false;
        info!("清单清理完成: 删除 {} 行，保留 {} 行", removed, max_rows);
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn catalog_with(dir: &Path, content: &str) -> CatalogStore {
        let path = dir.join("catalog.txt");
        fs::write(&path, content).unwrap();
        let mut catalog = CatalogStore::open(&path, true).unwrap();
        catalog.load().unwrap();
        catalog
    }

    #[test]
    fn test_later_line_wins() {
        let dir = tempdir().unwrap();
        let catalog = catalog_with(dir.path(), "a.txt,10\na.txt,20\n");

        assert!(catalog.exists("a.txt", 20));
        assert!(!catalog.exists("a.txt", 10));
        assert_eq!(catalog.len(), 1);
    }

    #[test]
    fn test_exists_is_exact_match() {
        let dir = tempdir().unwrap();
        let mut catalog = catalog_with(dir.path(), "");

        catalog.add("f", 100).unwrap();
        assert!(catalog.exists("f", 100));
        assert!(!catalog.exists("f", 99));
        assert!(!catalog.exists("g", 100));
    }

    #[test]
    fn test_open_creates_missing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("catalog.txt");

        let mut catalog = CatalogStore::open(&path, true).unwrap();
        assert!(path.exists());
        assert_eq!(catalog.load().unwrap(), 0);
    }

    #[test]
    fn test_open_existing_file_untouched_until_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("catalog.txt");
        fs::write(&path, "a.txt,1\n").unwrap();

        let catalog = CatalogStore::open(&path, true).unwrap();
        assert!(catalog.is_empty());
        assert_eq!(fs::read_to_string(&path).unwrap(), "a.txt,1\n");
    }

    #[test]
    fn test_directory_is_invalid_catalog() {
        let dir = tempdir().unwrap();
        let result = CatalogStore::open(dir.path(), true);
        assert!(matches!(result, Err(SyncError::InvalidCatalogFile(_))));
    }

    #[test]
    fn test_disabled_catalog_is_noop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("catalog.txt");

        let mut catalog = CatalogStore::open(&path, false).unwrap();
        catalog.add("a.txt", 1).unwrap();

        assert!(!catalog.exists("a.txt", 1));
        assert!(!path.exists());
        assert_eq!(catalog.cleanup(1).unwrap(), 0);
    }

    #[test]
    fn test_invalid_lines_are_skipped() {
        let dir = tempdir().unwrap();
        let catalog = catalog_with(
            dir.path(),
            "good.txt,5\n\nbad.txt,abc\nnocomma\n  \nneg.txt,-3\nlast.txt,7\n",
        );

        assert_eq!(catalog.len(), 2);
        assert!(catalog.exists("good.txt", 5));
        assert!(catalog.exists("last.txt", 7));
        assert!(!catalog.exists("bad.txt", 0));
    }

    #[test]
    fn test_parse_line_accepts_legacy_numbers() {
        assert_eq!(
            CatalogEntry::parse_line("big.bin,1E+15").map(|e| e.size_bytes),
            Some(1_000_000_000_000_000)
        );
        assert_eq!(
            CatalogEntry::parse_line("a.log,100.0").map(|e| e.size_bytes),
            Some(100)
        );
        assert_eq!(CatalogEntry::parse_line("a.log,100.5"), None);
        assert_eq!(
            CatalogEntry::parse_line("a.log,12,extra").map(|e| e.size_bytes),
            Some(12)
        );
    }

    #[test]
    fn test_add_appends_without_dedup() {
        let dir = tempdir().unwrap();
        let mut catalog = catalog_with(dir.path(), "a.txt,1");

        catalog.add("a.txt", 2).unwrap();
        catalog.add("b.txt", 3).unwrap();

        let content = fs::read_to_string(dir.path().join("catalog.txt")).unwrap();
        assert_eq!(content, "a.txt,1\na.txt,2\nb.txt,3\n");
        assert!(catalog.exists("a.txt", 2));
    }

    #[test]
    fn test_cleanup_at_limit_removes_nothing() {
        let dir = tempdir().unwrap();
        let mut catalog = catalog_with(dir.path(), "a,1\nb,2\nc,3\n");

        assert_eq!(catalog.cleanup(3).unwrap(), 0);
        assert_eq!(
            fs::read_to_string(dir.path().join("catalog.txt")).unwrap(),
            "a,1\nb,2\nc,3\n"
        );
    }

    #[test]
    fn test_cleanup_keeps_newest_rows_in_order() {
        let dir = tempdir().unwrap();
        let mut catalog = catalog_with(dir.path(), "a,1\n\nb,2\na,5\nc,3\nd,4\n");

        assert_eq!(catalog.cleanup(3).unwrap(), 2);
        assert_eq!(
            fs::read_to_string(dir.path().join("catalog.txt")).unwrap(),
            "a,5\nc,3\nd,4\n"
        );
    }

    #[test]
    fn test_cleanup_leaves_sibling_files_alone() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("catalog.tmp"), "unrelated\n").unwrap();
        let mut catalog = catalog_with(dir.path(), "a,1\nb,2\nc,3\n");

        assert_eq!(catalog.cleanup(1).unwrap(), 2);
        assert_eq!(
            fs::read_to_string(dir.path().join("catalog.tmp")).unwrap(),
            "unrelated\n"
        );
        assert_eq!(
            fs::read_to_string(dir.path().join("catalog.txt")).unwrap(),
            "c,3\n"
        );
        assert!(!dir.path().join("catalog.txt.tmp").exists());
    }

    #[test]
    fn test_cleanup_non_positive_limit_is_noop() {
        let dir = tempdir().unwrap();
        let mut catalog = catalog_with(dir.path(), "a,1\nb,2\n");

        assert_eq!(catalog.cleanup(0).unwrap(), 0);
        assert_eq!(catalog.cleanup(-5).unwrap(), 0);
        assert_eq!(
            fs::read_to_string(dir.path().join("catalog.txt")).unwrap(),
            "a,1\nb,2\n"
        );
    }
}
