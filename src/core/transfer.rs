//! 传输校验 - 以文件大小判断拉取是否成功

use serde::Serialize;
use std::path::Path;

/// 单个文件的传输状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    /// 已在清单中，跳过
    Skipped,
    /// 测试模式下只列出不拉取
    Listed,
    Completed,
    Failed,
}

impl std::fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferStatus::Skipped => write!(f, "skipped"),
            TransferStatus::Listed => write!(f, "listed"),
            TransferStatus::Completed => write!(f, "completed"),
            TransferStatus::Failed => write!(f, "failed"),
        }
    }
}

/// 拉取失败记录
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferFailure {
    pub file_name: String,
    pub expected_size: u64,
    /// 本地文件不存在时为 None
    pub actual_size: Option<u64>,
    pub reason: String,
}

/// 本地文件的实际大小，文件不存在或不是普通文件时返回 None
pub fn landed_size(local_file: &Path) -> Option<u64> {
    std::fs::metadata(local_file)
        .ok()
        .filter(|m| m.is_file())
        .map(|m| m.len())
}

/// 文件存在且字节数与远端列表一致时返回 true（不做内容校验）
pub fn verify_transfer(local_file: &Path, expected_size: u64) -> bool {
    landed_size(local_file) == Some(expected_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_verify_matching_size() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("a.bin");
        std::fs::write(&file, b"hello").unwrap();

        assert!(verify_transfer(&file, 5));
        assert!(!verify_transfer(&file, 4));
        assert!(!verify_transfer(&file, 6));
    }

    #[test]
    fn test_verify_missing_file() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("missing.bin");

        assert!(!verify_transfer(&file, 0));
        assert_eq!(landed_size(&file), None);
    }

    #[test]
    fn test_verify_directory_is_not_a_file() {
        let dir = tempdir().unwrap();
        assert!(!verify_transfer(dir.path(), 0));
    }

    #[test]
    fn test_verify_empty_file() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("empty");
        std::fs::write(&file, b"").unwrap();

        assert!(verify_transfer(&file, 0));
    }
}
