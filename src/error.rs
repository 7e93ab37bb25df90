//! 错误类型与结果码

use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// 对调用方公开的结果码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutcomeCode {
    Ok,
    SshConnectError,
    RetrieveFileError,
    SshUnknownError,
    WriteDestinationError,
    CatalogAccessError,
    SshConnectTimeout,
    CatalogWriteError,
    SshDisconnectError,
    InvalidParameters,
    InvalidCatalogFile,
    InvalidAuthDetails,
    UnknownError,
}

impl OutcomeCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeCode::Ok => "ok",
            OutcomeCode::SshConnectError => "ssh-connect-error",
            OutcomeCode::RetrieveFileError => "retrieve-file-error",
            OutcomeCode::SshUnknownError => "ssh-unknown-error",
            OutcomeCode::WriteDestinationError => "write-destination-error",
            OutcomeCode::CatalogAccessError => "catalog-access-error",
            OutcomeCode::SshConnectTimeout => "ssh-connect-timeout",
            OutcomeCode::CatalogWriteError => "catalog-write-error",
            OutcomeCode::SshDisconnectError => "ssh-disconnect-error",
            OutcomeCode::InvalidParameters => "invalid-parameters",
            OutcomeCode::InvalidCatalogFile => "invalid-catalog-file",
            OutcomeCode::InvalidAuthDetails => "invalid-auth-details",
            OutcomeCode::UnknownError => "unknown-error",
        }
    }

    /// 旧版工具使用的数字错误码（写入日志，便于与历史记录对照）
    pub fn legacy_code(&self) -> i32 {
        match self {
            OutcomeCode::Ok => 0,
            OutcomeCode::SshConnectError => 3001,
            OutcomeCode::RetrieveFileError => 3002,
            OutcomeCode::SshUnknownError => 3003,
            OutcomeCode::WriteDestinationError => 3004,
            OutcomeCode::CatalogAccessError => 3005,
            OutcomeCode::SshConnectTimeout => 3006,
            OutcomeCode::CatalogWriteError => 3007,
            OutcomeCode::SshDisconnectError => 3008,
            OutcomeCode::InvalidParameters => 3009,
            OutcomeCode::InvalidCatalogFile => 3010,
            OutcomeCode::InvalidAuthDetails => 3011,
            OutcomeCode::UnknownError => 3099,
        }
    }

    /// 进程退出码（POSIX 只保留低 8 位，所以不能直接用旧错误码）
    pub fn exit_code(&self) -> i32 {
        match self {
            OutcomeCode::Ok => 0,
            OutcomeCode::SshConnectError => 1,
            OutcomeCode::RetrieveFileError => 2,
            OutcomeCode::SshUnknownError => 3,
            OutcomeCode::WriteDestinationError => 4,
            OutcomeCode::CatalogAccessError => 5,
            OutcomeCode::SshConnectTimeout => 6,
            OutcomeCode::CatalogWriteError => 7,
            OutcomeCode::SshDisconnectError => 8,
            OutcomeCode::InvalidParameters => 9,
            OutcomeCode::InvalidCatalogFile => 10,
            OutcomeCode::InvalidAuthDetails => 11,
            OutcomeCode::UnknownError => 12,
        }
    }
}

impl std::fmt::Display for OutcomeCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("invalid parameters: {}", .0.join("; "))]
    InvalidParameters(Vec<String>),
    #[error("catalog path is not a regular file: {0}")]
    InvalidCatalogFile(PathBuf),
    #[error("cannot access catalog file {path}: {source}")]
    CatalogAccess {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot write catalog file {path}: {source}")]
    CatalogWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot write to destination {path}: {source}")]
    DestinationWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid authentication details: {0}")]
    InvalidAuth(String),
    #[error("connection to {target} failed: {reason}")]
    ConnectFailed { target: String, reason: String },
    #[error("connection to {target} timed out after {}ms", .timeout.as_millis())]
    ConnectTimeout { target: String, timeout: Duration },
    #[error("disconnect failed: {0}")]
    Disconnect(String),
    #[error("remote session error: {0:#}")]
    Session(anyhow::Error),
    #[error("unexpected error: {0:#}")]
    Unknown(anyhow::Error),
}

impl SyncError {
    pub fn outcome(&self) -> OutcomeCode {
        match self {
            SyncError::InvalidParameters(_) => OutcomeCode::InvalidParameters,
            SyncError::InvalidCatalogFile(_) => OutcomeCode::InvalidCatalogFile,
            SyncError::CatalogAccess { .. } => OutcomeCode::CatalogAccessError,
            SyncError::CatalogWrite { .. } => OutcomeCode::CatalogWriteError,
            SyncError::DestinationWrite { .. } => OutcomeCode::WriteDestinationError,
            SyncError::InvalidAuth(_) => OutcomeCode::InvalidAuthDetails,
            SyncError::ConnectFailed { .. } => OutcomeCode::SshConnectError,
            SyncError::ConnectTimeout { .. } => OutcomeCode::SshConnectTimeout,
            SyncError::Disconnect(_) => OutcomeCode::SshDisconnectError,
            SyncError::Session(_) => OutcomeCode::SshUnknownError,
            SyncError::Unknown(_) => OutcomeCode::UnknownError,
        }
    }
}
