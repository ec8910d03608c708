//! 协调引擎 - 服务器端权威文件表与接受/冲突规则

use crate::core::comparator::{FileComparator, SyncAction};
use crate::core::file_state::{FileKey, FileRecord, RecordMap};
use crate::core::watcher::WatchEvent;
use crate::error::{Result, SyncError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;
use tracing::debug;

/// sync-list 提交方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// 完整快照
    Full,
    /// 单个变化/删除条目
    Partial,
}

impl SyncMode {
    /// 优先使用 X-Sync-Mode 头；缺省时单条目或含删除条目视为增量
    pub fn detect(header: Option<&str>, entries: &[FileRecord]) -> Result<Self> {
        match header.map(|h| h.trim().to_ascii_lowercase()) {
            Some(h) if h == "full" => Ok(SyncMode::Full),
            Some(h) if h == "partial" => Ok(SyncMode::Partial),
            Some(h) => Err(SyncError::protocol(format!("未知同步模式: {}", h))),
            None => {
                if entries.len() == 1 || entries.iter().any(FileRecord::is_deleted) {
                    Ok(SyncMode::Partial)
                } else {
                    Ok(SyncMode::Full)
                }
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::Full => "full",
            SyncMode::Partial => "partial",
        }
    }
}

/// 完整同步结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FullSyncOutcome {
    UpToDate,
    Actions(Vec<SyncAction>),
}

/// 增量同步评审结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartialOutcome {
    /// 等待客户端上传
    pub accepted: Vec<FileRecord>,
    /// 需要立即在服务器删除
    pub deletions: Vec<FileRecord>,
    /// 版本过旧
    pub rejected: Vec<FileRecord>,
}

impl PartialOutcome {
    pub fn all_accepted(&self) -> bool {
        self.rejected.is_empty()
    }
}

/// 协调引擎
#[derive(Debug, Default)]
pub struct ReconcileEngine {
    records: RecordMap,
}

impl ReconcileEngine {
    pub fn new(records: RecordMap) -> Self {
        Self { records }
    }

    pub fn records(&self) -> &RecordMap {
        &self.records
    }

    pub fn get(&self, key: &FileKey) -> Option<&FileRecord> {
        self.records.get(key)
    }

    /// 本地记录的版本，不存在视为 0
    pub fn stored_version(&self, key: &FileKey) -> u64 {
        self.records.get(key).map_or(0, |r| r.version)
    }

    /// 合并本地监视器事件
    pub fn apply_local(&mut self, event: &WatchEvent) {
        match event {
            WatchEvent::Changed(record) => {
                self.records.insert(record.key(), record.clone());
            }
            WatchEvent::Removed(record) => {
                self.records.remove(&record.key());
            }
        }
    }

    /// 完整同步：三方差异
    pub fn full_sync(&self, report: &[FileRecord]) -> FullSyncOutcome {
        let client = FileComparator::client_map(report);
        let actions = FileComparator::compare_trees(&self.records, &client);
        if actions.is_empty() {
            FullSyncOutcome::UpToDate
        } else {
            FullSyncOutcome::Actions(actions)
        }
    }

    /// 增量同步：只做判定，不修改状态
    pub fn review_partial(&self, entries: &[FileRecord]) -> PartialOutcome {
        let mut outcome = PartialOutcome::default();
        for entry in entries {
            let stored = self.records.get(&entry.key()).map(|r| r.version);
            if entry.is_deleted() {
                // 客户端删除的是它最后看到的版本，服务器更新过则视为冲突
                if stored.map_or(true, |v| entry.version >= v) {
                    outcome.deletions.push(entry.clone());
                } else {
                    outcome.rejected.push(entry.clone());
                }
            } else if stored.map_or(true, |v| entry.version > v) {
                debug!("接受较新的文件: {} ver: {}", entry.key(), entry.version);
                outcome.accepted.push(entry.clone());
            } else {
                debug!("拒绝过期文件: {} ver: {} <= {:?}", entry.key(), entry.version, stored);
                outcome.rejected.push(entry.clone());
            }
        }
        outcome
    }

    /// 上传前的版本检查
    pub fn check_upload(&self, key: &FileKey, incoming: u64) -> Result<()> {
        let stored = self.stored_version(key);
        if incoming <= stored {
            return Err(SyncError::conflict(format!(
                "{} 版本 {} <= 当前版本 {}",
                key, incoming, stored
            )));
        }
        Ok(())
    }

    pub fn commit(&mut self, record: FileRecord) {
        self.records.insert(record.key(), record);
    }

    pub fn remove(&mut self, key: &FileKey) -> Option<FileRecord> {
        self.records.remove(key)
    }
}

/// 按 (rootIndex, path) 串行化“检查版本再写入”
#[derive(Debug, Default)]
pub struct KeyLocks {
    locks: Mutex<HashMap<FileKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyLocks {
    pub async fn lock(&self, key: &FileKey) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            // 没有持有者的锁可以回收
            locks.retain(|k, l| k == key || Arc::strong_count(l) > 1);
            locks.entry(key.clone()).or_default().clone()
        };
        lock.lock_owned().await
    }
}
