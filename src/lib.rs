pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod storage;

pub use config::SyncConfig;
pub use core::{RunStatus, SyncEngine, SyncRunResult};
pub use error::{OutcomeCode, SyncError};
pub use storage::{create_session, RemoteSession};

pub mod dirs {
    use std::path::PathBuf;

    pub fn config_dir() -> Option<PathBuf> {
        if cfg!(target_os = "windows") {
            std::env::var("APPDATA").ok().map(PathBuf::from)
        } else if cfg!(target_os = "macos") {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join("Library").join("Application Support"))
        } else {
            // Linux
            std::env::var("XDG_CONFIG_HOME")
                .ok()
                .filter(|p| !p.is_empty())
                .map(PathBuf::from)
                .or_else(|| {
                    std::env::var("HOME")
                        .ok()
                        .map(|h| PathBuf::from(h).join(".config"))
                })
        }
    }

    /// 默认配置文件 `<config dir>/sshsync/config.json`
    pub fn default_config_file() -> Option<PathBuf> {
        config_dir().map(|p| p.join("sshsync").join("config.json"))
    }
}
