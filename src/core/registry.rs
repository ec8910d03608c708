//! 客户端注册表（仅服务器端）

use std::collections::HashMap;
use std::net::IpAddr;
use tracing::{debug, info};

/// 已注册客户端
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerRegistration {
    pub address: IpAddr,
    /// 最近一次请求时间（Unix 时间戳，秒）
    pub last_seen_at: i64,
}

/// 客户端注册表
#[derive(Debug)]
pub struct PeerRegistry {
    peers: HashMap<IpAddr, PeerRegistration>,
    ttl_secs: i64,
}

impl PeerRegistry {
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            peers: HashMap::new(),
            ttl_secs: ttl_secs as i64,
        }
    }

    fn now() -> i64 {
        chrono::Utc::now().timestamp()
    }

    /// 注册或刷新
    pub fn touch(&mut self, address: IpAddr) {
        self.touch_at(address, Self::now());
    }

    pub fn touch_at(&mut self, address: IpAddr, now: i64) {
        let fresh = self
            .peers
            .insert(
                address,
                PeerRegistration {
                    address,
                    last_seen_at: now,
                },
            )
            .is_none();
        if fresh {
            info!("注册客户端: {}", address);
        }
    }

    pub fn sweep(&mut self) -> Vec<IpAddr> {
        self.sweep_at(Self::now())
    }

    /// 移除超过 TTL 未出现的客户端
    pub fn sweep_at(&mut self, now: i64) -> Vec<IpAddr> {
        let ttl = self.ttl_secs;
        let mut removed: Vec<IpAddr> = self
            .peers
            .values()
            .filter(|p| now - p.last_seen_at > ttl)
            .map(|p| p.address)
            .collect();
        removed.sort();
        for address in &removed {
            info!("移除不活跃客户端: {}", address);
            self.peers.remove(address);
        }
        if removed.is_empty() {
            debug!("注册表清理: {} 个活跃客户端", self.len());
        }
        removed
    }

    /// 推送目标：当前注册的全部地址，排除触发该事件的来源
    pub fn targets(&self, exclude: Option<IpAddr>) -> Vec<IpAddr> {
        let mut targets: Vec<IpAddr> = self
            .peers
            .keys()
            .copied()
            .filter(|a| Some(*a) != exclude)
            .collect();
        targets.sort();
        targets
    }

    pub fn get(&self, address: &IpAddr) -> Option<&PeerRegistration> {
        self.peers.get(address)
    }

    pub fn contains(&self, address: &IpAddr) -> bool {
        self.peers.contains_key(address)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
