//! 应用配置模块

use crate::core::scanner::{default_exclude_patterns, ScanConfig};
use crate::error::{Result, SyncError};
use crate::net::protocol::FrameLimits;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 同步配置（config.json 中的 sync 段）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSettings {
    /// 同步根目录，下标即 rootIndex
    #[serde(default)]
    pub roots: Vec<PathBuf>,
    /// TCP 控制端口
    #[serde(default = "default_control_port")]
    pub control_port: u16,
    /// UDP 发现端口
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// 客户端接收推送的端口
    #[serde(default = "default_notify_port")]
    pub notify_port: u16,
    #[serde(default = "default_broadcast_addr")]
    pub broadcast_addr: IpAddr,
    #[serde(default = "default_rescan_interval_secs")]
    pub rescan_interval_secs: u64,
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    #[serde(default = "default_discovery_interval_secs")]
    pub discovery_interval_secs: u64,
    #[serde(default = "default_registry_sweep_secs")]
    pub registry_sweep_secs: u64,
    /// 客户端静默超过该时间后被移出注册表
    #[serde(default = "default_registry_ttl_secs")]
    pub registry_ttl_secs: u64,
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    /// 抑制键最长存活时间
    #[serde(default = "default_suppression_ttl_secs")]
    pub suppression_ttl_secs: u64,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_max_header_bytes")]
    pub max_header_bytes: usize,
    /// 非上传请求（sync-list、notify）的消息体上限
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// 是否订阅系统文件通知（关闭后只依赖定时扫描）
    #[serde(default = "default_live_watch")]
    pub live_watch: bool,
    #[serde(default = "default_exclude_patterns")]
    pub exclude_patterns: Vec<String>,
}

fn default_control_port() -> u16 {
    8080
}

fn default_discovery_port() -> u16 {
    45454
}

fn default_notify_port() -> u16 {
    9090
}

fn default_broadcast_addr() -> IpAddr {
    IpAddr::from([255, 255, 255, 255])
}

fn default_rescan_interval_secs() -> u64 {
    5
}

fn default_ping_interval_secs() -> u64 {
    30
}

fn default_discovery_interval_secs() -> u64 {
    3
}

fn default_registry_sweep_secs() -> u64 {
    60
}

fn default_registry_ttl_secs() -> u64 {
    180
}

fn default_fetch_timeout_secs() -> u64 {
    5
}

fn default_suppression_ttl_secs() -> u64 {
    30
}

fn default_chunk_size() -> usize {
    64 * 1024
}

fn default_max_header_bytes() -> usize {
    64 * 1024
}

fn default_max_body_bytes() -> usize {
    16 * 1024 * 1024
}

fn default_live_watch() -> bool {
    true
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            roots: Vec::new(),
            control_port: default_control_port(),
            discovery_port: default_discovery_port(),
            notify_port: default_notify_port(),
            broadcast_addr: default_broadcast_addr(),
            rescan_interval_secs: default_rescan_interval_secs(),
            ping_interval_secs: default_ping_interval_secs(),
            discovery_interval_secs: default_discovery_interval_secs(),
            registry_sweep_secs: default_registry_sweep_secs(),
            registry_ttl_secs: default_registry_ttl_secs(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            suppression_ttl_secs: default_suppression_ttl_secs(),
            chunk_size: default_chunk_size(),
            max_header_bytes: default_max_header_bytes(),
            max_body_bytes: default_max_body_bytes(),
            live_watch: default_live_watch(),
            exclude_patterns: default_exclude_patterns(),
        }
    }
}

pub const CONFIG_FILE: &str = "config.json";

/// 读取 config.json 中的一个段，文件不存在或格式错误返回 None
pub fn read_section<T: DeserializeOwned>(config_dir: &Path, section: &str) -> Option<T> {
    let content = fs::read_to_string(config_dir.join(CONFIG_FILE)).ok()?;
    let config = serde_json::from_str::<serde_json::Value>(&content).ok()?;
    match serde_json::from_value::<T>(config.get(section)?.clone()) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!("配置段 {} 无效，使用默认值: {}", section, e);
            None
        }
    }
}

/// 写回 config.json 中的一个段，保留其他段
pub fn write_section<T: Serialize>(config_dir: &Path, section: &str, value: &T) -> io::Result<()> {
    let config_file = config_dir.join(CONFIG_FILE);

    let mut config: serde_json::Value = if config_file.exists() {
        let content = fs::read_to_string(&config_file)?;
        serde_json::from_str(&content).unwrap_or_else(|_| serde_json::json!({}))
    } else {
        serde_json::json!({})
    };
    if !config.is_object() {
        config = serde_json::json!({});
    }

    config[section] = serde_json::to_value(value)?;
    fs::create_dir_all(config_dir)?;
    fs::write(&config_file, serde_json::to_string_pretty(&config)?)
}

impl SyncSettings {
    /// 从配置文件加载，文件不存在或格式错误时使用默认值
    pub fn load(config_dir: &Path) -> Self {
        read_section(config_dir, "sync").unwrap_or_default()
    }

    /// 保存到 config.json 的 sync 段
    pub fn save(&self, config_dir: &Path) -> io::Result<()> {
        write_section(config_dir, "sync", self)
    }

    /// 启动前校验
    pub fn validate(&self) -> Result<()> {
        if self.roots.is_empty() {
            return Err(SyncError::Config("未配置同步根目录".to_string()));
        }
        if self.chunk_size == 0 {
            return Err(SyncError::Config("chunkSize 不能为 0".to_string()));
        }
        for root in &self.roots {
            if !root.is_dir() {
                return Err(SyncError::Config(format!(
                    "根目录不存在: {}",
                    root.display()
                )));
            }
        }
        Ok(())
    }

    pub fn scan_config(&self) -> ScanConfig {
        ScanConfig {
            exclude_patterns: self.exclude_patterns.clone(),
        }
    }

    pub fn frame_limits(&self) -> FrameLimits {
        FrameLimits {
            max_header_bytes: self.max_header_bytes,
            max_body_bytes: self.max_body_bytes,
        }
    }

    pub fn rescan_interval(&self) -> Duration {
        Duration::from_secs(self.rescan_interval_secs.max(1))
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs.max(1))
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_secs(self.discovery_interval_secs.max(1))
    }

    pub fn registry_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.registry_sweep_secs.max(1))
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs.max(1))
    }

    pub fn suppression_ttl(&self) -> Duration {
        Duration::from_secs(self.suppression_ttl_secs)
    }
}
