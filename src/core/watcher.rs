//! 目录监视器
//!
//! 维护所有根目录的文件表，定时全量扫描，并通过 notify 订阅单个文件与其祖先目录，
//! 单文件变化走快速路径，目录级变化触发全量重扫。

use crate::core::file_state::{FileKey, FileRecord, RecordMap};
use crate::core::scanner::{FileScanner, ScanResult};
use crate::error::{Result, SyncError};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

/// 监视器产生的本地变化
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// 新增或修改
    Changed(FileRecord),
    /// 已删除（携带删除前最后一次观察到的记录）
    Removed(FileRecord),
}

impl WatchEvent {
    pub fn key(&self) -> FileKey {
        match self {
            WatchEvent::Changed(r) | WatchEvent::Removed(r) => r.key(),
        }
    }
}

/// 目录监视器
pub struct DirectoryWatcher {
    roots: Vec<PathBuf>,
    scanner: FileScanner,
    files: RecordMap,
    scanned_once: bool,
    notifier: Option<RecommendedWatcher>,
    watched: HashSet<PathBuf>,
}

impl DirectoryWatcher {
    /// 创建监视器，根目录不存在属于致命配置错误
    pub fn new(roots: &[PathBuf], scanner: FileScanner) -> Result<Self> {
        let mut resolved = Vec::with_capacity(roots.len());
        for root in roots {
            let canonical = std::fs::canonicalize(root).map_err(|e| {
                SyncError::Config(format!("根目录不存在 {}: {}", root.display(), e))
            })?;
            if !canonical.is_dir() {
                return Err(SyncError::Config(format!(
                    "根目录不是文件夹: {}",
                    root.display()
                )));
            }
            resolved.push(canonical);
        }

        Ok(Self {
            roots: resolved,
            scanner,
            files: RecordMap::new(),
            scanned_once: false,
            notifier: None,
            watched: HashSet::new(),
        })
    }

    /// 挂接系统文件通知，原始事件发送到 tx，由调用方交回 handle_notify
    pub fn attach_notifier(&mut self, tx: UnboundedSender<Event>) -> Result<()> {
        let watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    let _ = tx.send(event);
                }
                Err(e) => debug!("文件通知错误: {}", e),
            },
            Config::default(),
        )
        .map_err(|e| SyncError::Config(format!("无法创建文件监视器: {}", e)))?;

        self.notifier = Some(watcher);
        // 重新订阅全部路径
        self.watched.clear();
        self.update_watch_set();
        Ok(())
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    pub fn root_path(&self, root_index: usize) -> Option<&Path> {
        self.roots.get(root_index).map(PathBuf::as_path)
    }

    pub fn get(&self, key: &FileKey) -> Option<&FileRecord> {
        self.files.get(key)
    }

    /// 当前文件表（按键排序）
    pub fn current_files(&self) -> Vec<FileRecord> {
        let mut files: Vec<FileRecord> = self.files.values().cloned().collect();
        files.sort_by(|a, b| a.key().cmp(&b.key()));
        files
    }

    pub fn watched_paths(&self) -> &HashSet<PathBuf> {
        &self.watched
    }

    /// 首次扫描并订阅
    pub fn start(&mut self) -> Vec<WatchEvent> {
        let events = self.rescan();
        self.update_watch_set();
        info!(
            "目录监视已启动: {} 个根目录, {} 个文件",
            self.roots.len(),
            self.files.len()
        );
        events
    }

    /// 同步全量扫描
    pub fn rescan(&mut self) -> Vec<WatchEvent> {
        let fresh = self.scanner.scan_roots(&self.roots);
        self.apply_scan(fresh)
    }

    /// 在阻塞线程池中扫描，结果回到调用方线程合并
    pub async fn rescan_async(&mut self) -> Vec<WatchEvent> {
        let scanner = self.scanner.clone();
        let roots = self.roots.clone();
        match tokio::task::spawn_blocking(move || scanner.scan_roots(&roots)).await {
            Ok(fresh) => self.apply_scan(fresh),
            Err(e) => {
                warn!("扫描任务失败: {}", e);
                Vec::new()
            }
        }
    }

    /// 用新的扫描结果替换文件表，返回差异事件（首次扫描不产生事件）
    ///
    /// 本轮读取失败的路径沿用上一轮记录，不产生删除事件
    pub fn apply_scan(&mut self, mut scan: ScanResult) -> Vec<WatchEvent> {
        let mut fresh = std::mem::take(&mut scan.records);
        if !scan.unreadable.is_empty() {
            for (key, old) in &self.files {
                if !fresh.contains_key(key) && scan.is_unreadable(key) {
                    fresh.insert(key.clone(), old.clone());
                }
            }
        }

        let mut events = Vec::new();

        if self.scanned_once {
            for (key, record) in &fresh {
                let changed = self
                    .files
                    .get(key)
                    .map_or(true, |old| old.version != record.version);
                if changed {
                    events.push(WatchEvent::Changed(record.clone()));
                }
            }
            for (key, old) in &self.files {
                if !fresh.contains_key(key) {
                    events.push(WatchEvent::Removed(old.clone()));
                }
            }
        }

        self.files = fresh;
        self.scanned_once = true;
        events.sort_by_key(WatchEvent::key);
        events
    }

    /// 重新订阅：恰好是当前文件及其各级父目录（含根目录）
    pub fn update_watch_set(&mut self) {
        let mut desired: HashSet<PathBuf> = self.roots.iter().cloned().collect();
        for key in self.files.keys() {
            let Some(root) = self.roots.get(key.root_index) else {
                continue;
            };
            let full = root.join(&key.path);
            let mut parent = full.parent();
            while let Some(dir) = parent {
                if !dir.starts_with(root) {
                    break;
                }
                desired.insert(dir.to_path_buf());
                if dir == root {
                    break;
                }
                parent = dir.parent();
            }
            desired.insert(full);
        }

        if let Some(notifier) = self.notifier.as_mut() {
            for stale in self.watched.difference(&desired) {
                if let Err(e) = notifier.unwatch(stale) {
                    debug!("取消监视失败 {}: {}", stale.display(), e);
                }
            }
            for fresh in desired.difference(&self.watched) {
                if let Err(e) = notifier.watch(fresh, RecursiveMode::NonRecursive) {
                    debug!("监视失败 {}: {}", fresh.display(), e);
                }
            }
        }

        self.watched = desired;
    }

    /// 处理一条系统通知
    pub fn handle_notify(&mut self, event: Event) -> Vec<WatchEvent> {
        if matches!(event.kind, EventKind::Access(_)) {
            return Vec::new();
        }
        let mut events = Vec::new();
        for path in &event.paths {
            events.extend(self.handle_path(path));
        }
        events
    }

    /// 单路径快速路径；目录级变化退化为全量重扫
    pub fn handle_path(&mut self, path: &Path) -> Vec<WatchEvent> {
        let Some(root_index) = self.resolve_root(path) else {
            return Vec::new();
        };
        let root = self.roots[root_index].clone();

        let is_known_dir = self.watched.contains(path)
            && !self.files.keys().any(|k| k.root_index == root_index && root.join(&k.path) == path);
        if path.is_dir() || is_known_dir || path == root {
            debug!("目录变化，全量重扫: {}", path.display());
            let events = self.rescan();
            self.update_watch_set();
            return events;
        }

        let Some(key) = self.scanner.key_for(root_index, &root, path) else {
            return Vec::new();
        };

        let mut events = Vec::new();
        match self.scanner.stat_record(root_index, &root, path) {
            Err(e) => {
                debug!("读取文件信息失败，等待下次扫描 {}: {}", path.display(), e);
                return Vec::new();
            }
            Ok(Some(record)) => {
                let changed = self
                    .files
                    .get(&key)
                    .map_or(true, |old| old.version != record.version);
                if changed {
                    self.files.insert(key, record.clone());
                    events.push(WatchEvent::Changed(record));
                }
            }
            Ok(None) => {
                if let Some(old) = self.files.remove(&key) {
                    events.push(WatchEvent::Removed(old));
                }
            }
        }

        self.update_watch_set();
        events
    }

    /// 最长前缀匹配定位根目录
    fn resolve_root(&self, path: &Path) -> Option<usize> {
        self.roots
            .iter()
            .enumerate()
            .filter(|(_, root)| path.starts_with(root))
            .max_by_key(|(_, root)| root.components().count())
            .map(|(index, _)| index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::file_state::{mtime_from_version, version_from_mtime};
    use std::fs;
    use tempfile::TempDir;

    fn set_version(path: &Path, version: u64) {
        let file = fs::OpenOptions::new().write(true).open(path).unwrap();
        file.set_modified(mtime_from_version(version)).unwrap();
    }

    fn watcher_for(dirs: &[PathBuf]) -> DirectoryWatcher {
        DirectoryWatcher::new(dirs, FileScanner::default()).unwrap()
    }

    #[test]
    fn test_missing_root_is_fatal() {
        let temp = TempDir::new().unwrap();
        let result = DirectoryWatcher::new(&[temp.path().join("nope")], FileScanner::default());
        assert!(matches!(result, Err(SyncError::Config(_))));
    }

    #[test]
    fn test_first_scan_is_silent_and_rescan_idempotent() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("a.txt"), "a").unwrap();
        let mut watcher = watcher_for(&[temp.path().to_path_buf()]);

        assert!(watcher.start().is_empty());
        assert_eq!(watcher.current_files().len(), 1);
        assert!(watcher.rescan().is_empty());
        assert!(watcher.rescan().is_empty());

        let record = &watcher.current_files()[0];
        let mtime = fs::metadata(temp.path().join("a.txt")).unwrap().modified().unwrap();
        assert_eq!(record.version, version_from_mtime(mtime));
    }

    #[test]
    fn test_rescan_reports_changes_and_removals() {
        let temp = TempDir::new().unwrap();
        let a = temp.path().join("a.txt");
        let b = temp.path().join("b.txt");
        fs::write(&a, "a").unwrap();
        fs::write(&b, "b").unwrap();
        set_version(&a, 100);
        set_version(&b, 100);

        let mut watcher = watcher_for(&[temp.path().to_path_buf()]);
        watcher.start();

        set_version(&a, 200);
        fs::remove_file(&b).unwrap();
        fs::write(temp.path().join("c.txt"), "c").unwrap();

        let events = watcher.rescan();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0], WatchEvent::Changed(FileRecord::file(0, "a.txt", 200)));
        assert_eq!(events[1], WatchEvent::Removed(FileRecord::file(0, "b.txt", 100)));
        assert!(matches!(&events[2], WatchEvent::Changed(r) if r.path == "c.txt"));
    }

    #[test]
    fn test_watch_set_covers_files_and_ancestors() {
        let temp = TempDir::new().unwrap();
        let root = fs::canonicalize(temp.path()).unwrap();
        fs::create_dir_all(root.join("x/y")).unwrap();
        fs::write(root.join("x/y/deep.txt"), "d").unwrap();

        let mut watcher = watcher_for(&[root.clone()]);
        watcher.start();

        let watched = watcher.watched_paths();
        assert!(watched.contains(&root));
        assert!(watched.contains(&root.join("x")));
        assert!(watched.contains(&root.join("x/y")));
        assert!(watched.contains(&root.join("x/y/deep.txt")));
        assert_eq!(watched.len(), 4);
    }

    #[test]
    fn test_single_file_fast_path() {
        let temp = TempDir::new().unwrap();
        let root = fs::canonicalize(temp.path()).unwrap();
        let file = root.join("f.txt");
        fs::write(&file, "1").unwrap();
        set_version(&file, 10);

        let mut watcher = watcher_for(&[root.clone()]);
        watcher.start();

        // 版本未变不产生事件
        assert!(watcher.handle_path(&file).is_empty());

        set_version(&file, 11);
        let events = watcher.handle_path(&file);
        assert_eq!(events, vec![WatchEvent::Changed(FileRecord::file(0, "f.txt", 11))]);

        fs::remove_file(&file).unwrap();
        let events = watcher.handle_path(&file);
        assert_eq!(events, vec![WatchEvent::Removed(FileRecord::file(0, "f.txt", 11))]);
        assert!(watcher.handle_path(&file).is_empty());
        assert!(!watcher.watched_paths().contains(&file));
    }

    #[test]
    fn test_directory_notification_triggers_rescan() {
        let temp = TempDir::new().unwrap();
        let root = fs::canonicalize(temp.path()).unwrap();
        let mut watcher = watcher_for(&[root.clone()]);
        watcher.start();

        fs::create_dir_all(root.join("new")).unwrap();
        fs::write(root.join("new/inner.txt"), "i").unwrap();

        let events = watcher.handle_path(&root.join("new"));
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], WatchEvent::Changed(r) if r.path == "new/inner.txt"));
        assert!(watcher.watched_paths().contains(&root.join("new/inner.txt")));
    }

    #[test]
    fn test_longest_prefix_resolves_nested_roots() {
        let temp = TempDir::new().unwrap();
        let outer = fs::canonicalize(temp.path()).unwrap();
        let inner = outer.join("inner");
        fs::create_dir_all(&inner).unwrap();

        let mut watcher = watcher_for(&[outer.clone(), inner.clone()]);
        watcher.start();

        fs::write(inner.join("n.txt"), "n").unwrap();
        let events = watcher.handle_path(&inner.join("n.txt"));
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], WatchEvent::Changed(r) if r.root_index == 1 && r.path == "n.txt"));
    }

    #[test]
    fn test_unreadable_paths_keep_previous_records() {
        let temp = TempDir::new().unwrap();
        let root = fs::canonicalize(temp.path()).unwrap();
        fs::create_dir_all(root.join("private")).unwrap();
        fs::write(root.join("locked.txt"), "l").unwrap();
        fs::write(root.join("private/p.txt"), "p").unwrap();
        fs::write(root.join("gone.txt"), "g").unwrap();
        set_version(&root.join("locked.txt"), 10);
        set_version(&root.join("private/p.txt"), 20);
        set_version(&root.join("gone.txt"), 30);

        let mut watcher = watcher_for(&[root.clone()]);
        watcher.start();

        // locked.txt 与 private/ 读取失败，gone.txt 确实不见了
        fs::remove_file(root.join("gone.txt")).unwrap();
        let scan = ScanResult {
            records: RecordMap::new(),
            unreadable: vec![FileKey::new(0, "locked.txt"), FileKey::new(0, "private")],
        };
        let events = watcher.apply_scan(scan);
        assert_eq!(events, vec![WatchEvent::Removed(FileRecord::file(0, "gone.txt", 30))]);
        assert_eq!(watcher.get(&FileKey::new(0, "locked.txt")).map(|r| r.version), Some(10));
        assert_eq!(watcher.get(&FileKey::new(0, "private/p.txt")).map(|r| r.version), Some(20));

        // 恢复可读后正常比较，不产生事件
        assert!(watcher.rescan().is_empty());
        assert_eq!(watcher.current_files().len(), 2);
    }

    #[test]
    fn test_unreadable_root_reports_nothing() {
        let temp = TempDir::new().unwrap();
        let root = fs::canonicalize(temp.path()).unwrap();
        fs::write(root.join("a.txt"), "a").unwrap();

        let mut watcher = watcher_for(&[root.clone()]);
        watcher.start();

        let scan = ScanResult {
            records: RecordMap::new(),
            unreadable: vec![FileKey::new(0, "")],
        };
        assert!(watcher.apply_scan(scan).is_empty());
        assert_eq!(watcher.current_files().len(), 1);
    }

    #[test]
    fn test_excluded_paths_are_ignored() {
        let temp = TempDir::new().unwrap();
        let root = fs::canonicalize(temp.path()).unwrap();
        let mut watcher = watcher_for(&[root.clone()]);
        watcher.start();

        let temp_file = root.join("a.txt.synctmp");
        fs::write(&temp_file, "partial").unwrap();
        assert!(watcher.handle_path(&temp_file).is_empty());
        assert!(watcher.rescan().is_empty());
    }
}
