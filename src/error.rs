//! 统一错误类型

use std::io;
use thiserror::Error;

/// 同步过程中的错误
#[derive(Debug, Error)]
pub enum SyncError {
    /// 请求行/请求头/参数格式错误
    #[error("协议错误: {0}")]
    Protocol(String),

    /// JSON 解析失败
    #[error("JSON 错误: {0}")]
    Json(#[from] serde_json::Error),

    /// 版本过旧（上传或 sync-list 条目被拒绝）
    #[error("版本冲突: {0}")]
    Conflict(String),

    /// 文件不存在
    #[error("文件不存在: {0}")]
    NotFound(String),

    /// 本地文件读写失败
    #[error("IO 错误: {0}")]
    Io(#[from] io::Error),

    /// 传输中断（连接提前关闭、响应不完整）
    #[error("传输中断: {0}")]
    Transport(String),

    /// 出站请求超时
    #[error("请求超时: {0}")]
    Timeout(String),

    /// 本轮广播没有收到发现响应
    #[error("未发现服务器")]
    DiscoveryTimeout,

    /// 与服务器的连接丢失（ping 被拒绝或主机不可达）
    #[error("连接丢失: {0}")]
    ConnectionLost(String),

    /// 启动配置错误（根目录不存在、端口绑定失败等）
    #[error("配置错误: {0}")]
    Config(String),
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;

impl SyncError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// 映射到响应状态码和原因短语
    pub fn status(&self) -> (u16, &'static str) {
        match self {
            SyncError::Protocol(_) | SyncError::Json(_) => (400, "Bad Request"),
            SyncError::Conflict(_) => (409, "Conflict"),
            SyncError::NotFound(_) => (404, "Not Found"),
            _ => (500, "Internal Server Error"),
        }
    }

    /// 是否属于连接层面的失败（需要重新发现服务器）
    pub fn is_liveness_failure(&self) -> bool {
        match self {
            SyncError::ConnectionLost(_) => true,
            SyncError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::HostUnreachable
                    | io::ErrorKind::NetworkUnreachable
                    | io::ErrorKind::AddrNotAvailable
            ),
            _ => false,
        }
    }
}
