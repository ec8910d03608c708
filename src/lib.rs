pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod net;
pub mod storage;

pub use config::SyncSettings;
pub use error::{Result, SyncError};
pub use net::controller::{Controller, ModeKind};

/// 应用目录
pub mod dirs {
    use std::path::{Path, PathBuf};

    pub const APP_NAME: &str = "peersync";

    pub fn config_dir() -> Option<PathBuf> {
        if cfg!(target_os = "windows") {
            std::env::var("APPDATA").ok().map(PathBuf::from)
        } else if cfg!(target_os = "macos") {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join("Library").join("Application Support"))
        } else {
            std::env::var("XDG_CONFIG_HOME")
                .ok()
                .map(PathBuf::from)
                .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
        }
    }

    /// 数据目录：命令行指定优先，其次默认目录 config.json 中的 data_path
    pub fn data_dir(explicit: Option<&Path>) -> PathBuf {
        if let Some(dir) = explicit {
            return dir.to_path_buf();
        }

        let default_dir = config_dir()
            .map(|p| p.join(APP_NAME))
            .unwrap_or_else(|| PathBuf::from(format!(".{}", APP_NAME)));

        std::fs::read_to_string(default_dir.join(crate::config::CONFIG_FILE))
            .ok()
            .and_then(|content| serde_json::from_str::<serde_json::Value>(&content).ok())
            .and_then(|config| config.get("data_path")?.as_str().map(PathBuf::from))
            .filter(|p| p.is_dir())
            .inspect(|p| tracing::debug!("使用自定义数据路径: {:?}", p))
            .unwrap_or(default_dir)
    }
}
