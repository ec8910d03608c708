//! 文件记录 - 每个根目录下文件的逻辑版本

use crate::error::{Result, SyncError};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// 文件唯一键：(根目录索引, 相对路径)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileKey {
    pub root_index: usize,
    pub path: String,
}

impl FileKey {
    pub fn new(root_index: usize, path: impl Into<String>) -> Self {
        Self {
            root_index,
            path: path.into(),
        }
    }
}

impl fmt::Display for FileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.root_index, self.path)
    }
}

/// 文件类型
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FileKind {
    #[default]
    File,
    Deleted,
}

impl FileKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileKind::File => "file",
            FileKind::Deleted => "deleted",
        }
    }
}

impl Serialize for FileKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for FileKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        // 旧客户端会把扩展名放在 type 里，除 deleted 外一律视为普通文件
        let raw = String::deserialize(deserializer)?;
        Ok(if raw.eq_ignore_ascii_case("deleted") {
            FileKind::Deleted
        } else {
            FileKind::File
        })
    }
}

/// 文件记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    #[serde(default, deserialize_with = "wire::index")]
    pub root_index: usize,
    pub path: String,
    #[serde(rename = "type", default)]
    pub kind: FileKind,
    #[serde(
        serialize_with = "wire::serialize_version",
        deserialize_with = "wire::version"
    )]
    pub version: u64,
}

impl FileRecord {
    pub fn file(root_index: usize, path: impl Into<String>, version: u64) -> Self {
        Self {
            root_index,
            path: path.into(),
            kind: FileKind::File,
            version,
        }
    }

    pub fn deleted(root_index: usize, path: impl Into<String>, version: u64) -> Self {
        Self {
            root_index,
            path: path.into(),
            kind: FileKind::Deleted,
            version,
        }
    }

    pub fn key(&self) -> FileKey {
        FileKey::new(self.root_index, self.path.clone())
    }

    pub fn is_deleted(&self) -> bool {
        self.kind == FileKind::Deleted
    }
}

/// (根目录索引, 相对路径) -> 文件记录
pub type RecordMap = HashMap<FileKey, FileRecord>;

/// 修改时间截断到秒作为版本号
pub fn version_from_mtime(modified: SystemTime) -> u64 {
    modified
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// 版本号还原为修改时间
pub fn mtime_from_version(version: u64) -> SystemTime {
    UNIX_EPOCH + std::time::Duration::from_secs(version)
}

/// 规范化并校验相对路径（统一使用 /，禁止 .. 与空段）
pub fn sanitize_relative(path: &str) -> Result<String> {
    let normalized = path.replace('\\', "/");
    let trimmed = normalized.trim_start_matches('/');
    if trimmed.is_empty() {
        return Err(SyncError::protocol("路径为空"));
    }

    let mut segments = Vec::new();
    for segment in trimmed.split('/') {
        match segment {
            "" => return Err(SyncError::protocol(format!("路径包含空段: {}", path))),
            "." => continue,
            ".." => return Err(SyncError::protocol(format!("路径越界: {}", path))),
            s if s.contains(':') => {
                return Err(SyncError::protocol(format!("非法路径: {}", path)))
            }
            s => segments.push(s),
        }
    }

    if segments.is_empty() {
        return Err(SyncError::protocol("路径为空"));
    }
    Ok(segments.join("/"))
}

/// JSON 字段兼容：版本号以字符串传输以保留 64 位精度，rootIndex 允许字符串或整数
pub(crate) mod wire {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrString {
        Number(u64),
        Text(String),
    }

    fn parse<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        match NumberOrString::deserialize(deserializer)? {
            NumberOrString::Number(n) => Ok(n),
            NumberOrString::Text(s) => s
                .trim()
                .parse::<u64>()
                .map_err(|e| D::Error::custom(format!("无效数字 {:?}: {}", s, e))),
        }
    }

    pub fn version<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        parse(deserializer)
    }

    pub fn index<'de, D: Deserializer<'de>>(deserializer: D) -> Result<usize, D::Error> {
        let value = parse(deserializer)?;
        usize::try_from(value).map_err(D::Error::custom)
    }

    pub fn serialize_version<S: Serializer>(version: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_json_uses_string_version() {
        let record = FileRecord::file(1, "docs/a.txt", 18_446_744_073_709_551_000);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["version"], "18446744073709551000");
        assert_eq!(json["rootIndex"], 1);
        assert_eq!(json["type"], "file");
        assert_eq!(json["path"], "docs/a.txt");
    }

    #[test]
    fn test_record_accepts_numeric_and_string_fields() {
        let parsed: Vec<FileRecord> = serde_json::from_str(
            r#"[{"path":"a.txt","type":"deleted","version":"7","rootIndex":"2"},
                {"path":"b.txt","type":"txt","version":9,"rootIndex":0},
                {"path":"c.txt","version":"3"}]"#,
        )
        .unwrap();
        assert_eq!(parsed[0], FileRecord::deleted(2, "a.txt", 7));
        assert_eq!(parsed[1], FileRecord::file(0, "b.txt", 9));
        assert_eq!(parsed[2], FileRecord::file(0, "c.txt", 3));
    }

    #[test]
    fn test_record_rejects_garbage_version() {
        let parsed = serde_json::from_str::<FileRecord>(r#"{"path":"a","version":"abc"}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_sanitize_relative() {
        assert_eq!(sanitize_relative("/a/b.txt").unwrap(), "a/b.txt");
        assert_eq!(sanitize_relative("a\\b\\c.txt").unwrap(), "a/b/c.txt");
        assert_eq!(sanitize_relative("./a.txt").unwrap(), "a.txt");
        assert!(sanitize_relative("../etc/passwd").is_err());
        assert!(sanitize_relative("a//b").is_err());
        assert!(sanitize_relative("").is_err());
        assert!(sanitize_relative("C:/x").is_err());
    }

    #[test]
    fn test_version_roundtrip_through_mtime() {
        let version = 1_700_000_123;
        assert_eq!(version_from_mtime(mtime_from_version(version)), version);
    }
}
