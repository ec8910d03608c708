use crate::core::file_state::{version_from_mtime, FileKey, FileRecord, RecordMap};
use regex::Regex;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// 同步中转文件的后缀（写入完成后重命名为正式文件）
pub const TEMP_SUFFIX: &str = ".synctmp";

/// 文件扫描器配置
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// 排除规则（glob patterns）
    pub exclude_patterns: Vec<String>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            exclude_patterns: default_exclude_patterns(),
        }
    }
}

pub fn default_exclude_patterns() -> Vec<String> {
    vec![
        ".git/**".to_string(),
        ".svn/**".to_string(),
        ".DS_Store".to_string(),
        "Thumbs.db".to_string(),
        "*.tmp".to_string(),
        format!("*{}", TEMP_SUFFIX),
        "~*".to_string(),
    ]
}

/// 一轮扫描的结果
#[derive(Debug, Default)]
pub struct ScanResult {
    pub records: RecordMap,
    /// 读取失败的文件或目录（路径为空表示整个根目录）
    pub unreadable: Vec<FileKey>,
}

impl ScanResult {
    /// 键本身或其所在目录本轮读取失败
    pub fn is_unreadable(&self, key: &FileKey) -> bool {
        self.unreadable.iter().any(|failed| {
            failed.root_index == key.root_index
                && (failed.path.is_empty()
                    || key.path == failed.path
                    || key
                        .path
                        .strip_prefix(failed.path.as_str())
                        .is_some_and(|rest| rest.starts_with('/')))
        })
    }
}

/// 文件扫描器
#[derive(Debug, Clone)]
pub struct FileScanner {
    patterns: Vec<Regex>,
}

impl FileScanner {
    pub fn new(config: &ScanConfig) -> Self {
        let patterns = config
            .exclude_patterns
            .iter()
            .filter_map(|p| match compile_pattern(p) {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!("忽略无效的排除规则 {}: {}", p, e);
                    None
                }
            })
            .collect();
        Self { patterns }
    }

    /// 检查相对路径是否应该被排除
    pub fn should_exclude(&self, relative: &str) -> bool {
        self.patterns.iter().any(|re| re.is_match(relative))
    }

    /// 递归扫描单个根目录；读取失败的文件或目录记入 unreadable，等下一轮扫描再试
    pub fn scan_root(&self, root_index: usize, root: &Path, result: &mut ScanResult) {
        let mut found = 0usize;
        let mut skipped = 0usize;

        for entry in WalkDir::new(root).follow_links(false) {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    debug!("扫描条目失败: {}", e);
                    let vanished = e
                        .io_error()
                        .is_some_and(|io| io.kind() == io::ErrorKind::NotFound);
                    if !vanished {
                        let relative = e
                            .path()
                            .and_then(|p| relative_path(root, p))
                            .unwrap_or_default();
                        result.unreadable.push(FileKey::new(root_index, relative));
                        skipped += 1;
                    }
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            match self.stat_record(root_index, root, entry.path()) {
                Ok(Some(record)) => {
                    found += 1;
                    result.records.insert(record.key(), record);
                }
                Ok(None) => {}
                Err(e) => {
                    debug!("读取文件信息失败 {}: {}", entry.path().display(), e);
                    if let Some(key) = self.key_for(root_index, root, entry.path()) {
                        result.unreadable.push(key);
                    }
                    skipped += 1;
                }
            }
        }

        debug!(
            "扫描根目录 [{}] {}: {} 个文件, {} 个跳过",
            root_index,
            root.display(),
            found,
            skipped
        );
    }

    /// 扫描全部根目录
    pub fn scan_roots(&self, roots: &[PathBuf]) -> ScanResult {
        let mut result = ScanResult::default();
        for (index, root) in roots.iter().enumerate() {
            self.scan_root(index, root, &mut result);
        }
        info!("扫描完成: {} 个根目录, {} 个文件", roots.len(), result.records.len());
        if !result.unreadable.is_empty() {
            warn!("{} 个路径读取失败，保留上一轮记录", result.unreadable.len());
        }
        result
    }

    /// 为单个文件生成记录
    ///
    /// 不存在、不是文件或被排除时返回 Ok(None)；其余读取失败返回 Err，调用方不应视为删除
    pub fn stat_record(
        &self,
        root_index: usize,
        root: &Path,
        full_path: &Path,
    ) -> io::Result<Option<FileRecord>> {
        let Some(relative) = relative_path(root, full_path) else {
            return Ok(None);
        };
        if self.should_exclude(&relative) {
            return Ok(None);
        }
        let metadata = match std::fs::metadata(full_path) {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        if !metadata.is_file() {
            return Ok(None);
        }
        let modified = metadata.modified()?;
        Ok(Some(FileRecord::file(root_index, relative, version_from_mtime(modified))))
    }

    /// 路径对应的键（仅做前缀解析，不访问磁盘）
    pub fn key_for(&self, root_index: usize, root: &Path, full_path: &Path) -> Option<FileKey> {
        let relative = relative_path(root, full_path)?;
        if self.should_exclude(&relative) {
            return None;
        }
        Some(FileKey::new(root_index, relative))
    }
}

impl Default for FileScanner {
    fn default() -> Self {
        Self::new(&ScanConfig::default())
    }
}

/// 相对于根目录的路径，统一使用 /
pub fn relative_path(root: &Path, full_path: &Path) -> Option<String> {
    let relative = full_path.strip_prefix(root).ok()?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_str().map(str::to_string))
        .collect::<Option<_>>()?;
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

/// 将 glob 规则编译为正则：** 匹配任意层级，* 不跨目录，规则可命中任意深度
fn compile_pattern(pattern: &str) -> Result<Regex, regex::Error> {
    let mut body = String::new();
    let mut chars = pattern.trim_start_matches('/').chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' if chars.peek() == Some(&'*') => {
                chars.next();
                body.push_str(".*");
            }
            '*' => body.push_str("[^/]*"),
            '?' => body.push_str("[^/]"),
            other => body.push_str(&regex::escape(&other.to_string())),
        }
    }
    Regex::new(&format!("(?i)^(?:.*/)?{}$", body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_exclude_patterns() {
        let scanner = FileScanner::default();
        assert!(scanner.should_exclude(".git/config"));
        assert!(scanner.should_exclude("sub/.git/HEAD"));
        assert!(scanner.should_exclude("notes.TMP"));
        assert!(scanner.should_exclude("dir/a.txt.synctmp"));
        assert!(scanner.should_exclude("photos/Thumbs.db"));
        assert!(!scanner.should_exclude("notes.txt"));
        assert!(!scanner.should_exclude("gitlog/readme.md"));
    }

    #[test]
    fn test_scan_roots_assigns_mtime_versions() {
        let temp = TempDir::new().unwrap();
        let root_a = temp.path().join("a");
        let root_b = temp.path().join("b");
        fs::create_dir_all(root_a.join("nested")).unwrap();
        fs::create_dir_all(&root_b).unwrap();
        fs::write(root_a.join("nested/one.txt"), "1").unwrap();
        fs::write(root_b.join("two.txt"), "2").unwrap();
        fs::write(root_b.join("skip.tmp"), "x").unwrap();

        let scanner = FileScanner::default();
        let result = scanner.scan_roots(&[root_a.clone(), root_b.clone()]);
        assert!(result.unreadable.is_empty());
        let map = result.records;

        assert_eq!(map.len(), 2);
        let one = &map[&FileKey::new(0, "nested/one.txt")];
        let expected = version_from_mtime(fs::metadata(root_a.join("nested/one.txt")).unwrap().modified().unwrap());
        assert_eq!(one.version, expected);
        assert!(map.contains_key(&FileKey::new(1, "two.txt")));
    }

    #[test]
    fn test_stat_record_missing_is_absent() {
        let temp = TempDir::new().unwrap();
        let scanner = FileScanner::default();
        let gone = scanner.stat_record(0, temp.path(), &temp.path().join("gone.txt"));
        assert!(matches!(gone, Ok(None)));
    }

    #[test]
    fn test_unreadable_covers_files_and_directories() {
        let result = ScanResult {
            records: RecordMap::new(),
            unreadable: vec![FileKey::new(0, "locked.txt"), FileKey::new(0, "private"), FileKey::new(1, "")],
        };
        assert!(result.is_unreadable(&FileKey::new(0, "locked.txt")));
        assert!(result.is_unreadable(&FileKey::new(0, "private/a/b.txt")));
        assert!(result.is_unreadable(&FileKey::new(1, "anything.txt")));
        assert!(!result.is_unreadable(&FileKey::new(0, "private-notes.txt")));
        assert!(!result.is_unreadable(&FileKey::new(0, "other.txt")));
    }

    #[test]
    fn test_relative_path() {
        let root = Path::new("/data/root");
        assert_eq!(
            relative_path(root, Path::new("/data/root/a/b.txt")).as_deref(),
            Some("a/b.txt")
        );
        assert_eq!(relative_path(root, Path::new("/data/other/b.txt")), None);
        assert_eq!(relative_path(root, root), None);
    }
}
