//! 回声抑制
//!
//! 远端驱动的文件修改会被本地监视器再次观察到，插入抑制键后，该键的下一次本地事件
//! 被消费掉而不再上报。键带有插入时间，超过 TTL 仍未被消费的会被清理。

use crate::core::file_state::FileKey;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

/// 一次性抑制集合
#[derive(Debug)]
pub struct EchoSuppressor {
    entries: HashMap<FileKey, Instant>,
    ttl: Duration,
}

impl EchoSuppressor {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
        }
    }

    /// 在执行远端修改之前调用
    pub fn insert(&mut self, key: FileKey) {
        self.insert_at(key, Instant::now());
    }

    pub fn insert_at(&mut self, key: FileKey, now: Instant) {
        debug!("抑制下一次本地事件: {}", key);
        self.entries.insert(key, now);
    }

    /// 本地事件到达时调用：存在则移除并返回 true（该事件是回声）
    pub fn consume(&mut self, key: &FileKey) -> bool {
        let hit = self.entries.remove(key).is_some();
        if hit {
            debug!("丢弃回声事件: {}", key);
        }
        hit
    }

    /// 远端修改失败时撤销
    pub fn release(&mut self, key: &FileKey) {
        self.entries.remove(key);
    }

    pub fn contains(&self, key: &FileKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn sweep(&mut self) -> usize {
        self.sweep_at(Instant::now())
    }

    /// 清理超过 TTL 的键，返回清理数量
    pub fn sweep_at(&mut self, now: Instant) -> usize {
        let ttl = self.ttl;
        let before = self.entries.len();
        self.entries
            .retain(|_, inserted| now.saturating_duration_since(*inserted) <= ttl);
        let removed = before - self.entries.len();
        if removed > 0 {
            debug!("清理了 {} 个过期抑制键，剩余 {}", removed, self.len());
        }
        removed
    }
}

/// 正在上传中的键，期间监视器事件不触发协调
#[derive(Debug, Default)]
pub struct PendingUploads {
    keys: Mutex<HashSet<FileKey>>,
}

impl PendingUploads {
    /// 标记为上传中，已在上传中返回 false
    pub fn mark(&self, key: &FileKey) -> bool {
        self.keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.clone())
    }

    pub fn release(&self, key: &FileKey) {
        self.keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }

    pub fn contains(&self, key: &FileKey) -> bool {
        self.keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(key)
    }
}
