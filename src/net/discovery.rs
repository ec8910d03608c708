//! UDP 广播发现
//!
//! 客户端按固定间隔广播 DISCOVER_REQUEST，直到收到第一个 DISCOVER_RESPONSE，
//! 响应方地址即服务器地址。握手不做认证。

use crate::error::{Result, SyncError};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DISCOVER_REQUEST: &[u8] = b"DISCOVER_REQUEST";
pub const DISCOVER_RESPONSE: &[u8] = b"DISCOVER_RESPONSE";

/// 服务器端应答器
pub struct DiscoveryResponder {
    socket: UdpSocket,
}

impl DiscoveryResponder {
    /// 绑定发现端口，失败属于致命错误
    pub async fn bind(port: u16) -> Result<Self> {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
        Self::bind_addr(addr).await
    }

    pub async fn bind_addr(addr: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| SyncError::Config(format!("无法绑定发现端口 {}: {}", addr, e)))?;
        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut buf = [0u8; 512];
        info!("发现服务已启动: {:?}", self.socket.local_addr().ok());

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = self.socket.recv_from(&mut buf) => {
                    let (len, from) = match received {
                        Ok(r) => r,
                        Err(e) => {
                            debug!("发现端口接收失败: {}", e);
                            continue;
                        }
                    };
                    if &buf[..len] != DISCOVER_REQUEST {
                        continue;
                    }
                    debug!("收到发现请求: {}", from);
                    if let Err(e) = self.socket.send_to(DISCOVER_RESPONSE, from).await {
                        warn!("发现响应发送失败 {}: {}", from, e);
                    }
                }
            }
        }

        info!("发现服务已停止");
    }
}

/// 客户端发现器
#[derive(Debug, Clone)]
pub struct DiscoveryClient {
    target: SocketAddr,
    interval: Duration,
}

impl DiscoveryClient {
    pub fn new(broadcast: IpAddr, port: u16, interval: Duration) -> Self {
        Self {
            target: SocketAddr::new(broadcast, port),
            interval,
        }
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    /// 广播直到有服务器响应，返回响应方地址；取消时返回 None
    pub async fn discover(&self, cancel: &CancellationToken) -> Result<Option<SocketAddr>> {
        let bind_ip = match self.target.ip() {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED),
        };
        let socket = UdpSocket::bind(SocketAddr::new(bind_ip, 0)).await?;
        socket.set_broadcast(true)?;

        let mut buf = [0u8; 512];
        let mut attempts = 0u32;
        info!("开始搜索服务器: {}", self.target);

        loop {
            attempts += 1;
            if let Err(e) = socket.send_to(DISCOVER_REQUEST, self.target).await {
                warn!("发现广播失败: {}", e);
            }
            match self.await_response(&socket, &mut buf, cancel).await {
                Ok(Some(from)) => {
                    info!("发现服务器: {} (广播 {} 次)", from, attempts);
                    return Ok(Some(from));
                }
                Ok(None) => return Ok(None),
                Err(SyncError::DiscoveryTimeout) => {
                    debug!("{} (第 {} 次广播)", SyncError::DiscoveryTimeout, attempts);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// 在一个广播间隔内等待响应，超时返回 DiscoveryTimeout
    async fn await_response(
        &self,
        socket: &UdpSocket,
        buf: &mut [u8],
        cancel: &CancellationToken,
    ) -> Result<Option<SocketAddr>> {
        let deadline = tokio::time::sleep(self.interval);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                _ = &mut deadline => return Err(SyncError::DiscoveryTimeout),
                received = socket.recv_from(buf) => {
                    match received {
                        Ok((len, from)) if &buf[..len] == DISCOVER_RESPONSE => return Ok(Some(from)),
                        Ok((_, from)) => debug!("忽略无关数据报: {}", from),
                        Err(e) => debug!("发现接收失败: {}", e),
                    }
                }
            }
        }
    }
}
