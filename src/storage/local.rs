use super::{ByteStream, FileMeta, Storage};
use crate::core::file_state::{mtime_from_version, sanitize_relative, version_from_mtime};
use crate::core::scanner::TEMP_SUFFIX;
use crate::error::{Result, SyncError};
use async_trait::async_trait;
use futures::StreamExt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

pub struct LocalStorage {
    base_path: PathBuf,
    name: String,
}

impl LocalStorage {
    pub fn new(path: &Path) -> Result<Self> {
        let base_path = std::fs::canonicalize(path)
            .map_err(|e| SyncError::Config(format!("根目录不存在 {}: {}", path.display(), e)))?;
        let name = format!("local:{}", base_path.display());
        Ok(Self { base_path, name })
    }

    /// 解析相对路径，拒绝越界路径
    fn resolve_path(&self, path: &str) -> Result<PathBuf> {
        let relative = sanitize_relative(path)?;
        Ok(self.base_path.join(relative))
    }

    fn temp_path(full_path: &Path) -> PathBuf {
        let mut name = full_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(TEMP_SUFFIX);
        full_path.with_file_name(name)
    }

    async fn write_temp(temp_path: &Path, mut stream: ByteStream<'_>, version: u64) -> Result<u64> {
        let mut file = fs::File::create(temp_path).await?;
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        let std_file = file.into_std().await;
        std_file.set_modified(mtime_from_version(version))?;
        Ok(written)
    }
}

#[async_trait]
impl Storage for LocalStorage {
    fn root(&self) -> &Path {
        &self.base_path
    }

    async fn stat(&self, path: &str) -> Result<Option<FileMeta>> {
        let full_path = self.resolve_path(path)?;

        match fs::metadata(&full_path).await {
            Ok(metadata) if metadata.is_file() => Ok(Some(FileMeta {
                size: metadata.len(),
                version: version_from_mtime(metadata.modified()?),
            })),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn open(&self, path: &str) -> Result<Option<(fs::File, FileMeta)>> {
        let full_path = self.resolve_path(path)?;

        let file = match fs::File::open(&full_path).await {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let metadata = file.metadata().await?;
        if !metadata.is_file() {
            return Ok(None);
        }
        let meta = FileMeta {
            size: metadata.len(),
            version: version_from_mtime(metadata.modified()?),
        };
        Ok(Some((file, meta)))
    }

    async fn write_stream(&self, path: &str, stream: ByteStream<'_>, version: u64) -> Result<u64> {
        let full_path = self.resolve_path(path)?;

        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // 使用临时文件写入，然后原子重命名
        let temp_path = Self::temp_path(&full_path);
        let written = match Self::write_temp(&temp_path, stream, version).await {
            Ok(n) => n,
            Err(e) => {
                if let Err(cleanup) = fs::remove_file(&temp_path).await {
                    warn!("清理临时文件失败 {}: {}", temp_path.display(), cleanup);
                }
                return Err(e);
            }
        };
        fs::rename(&temp_path, &full_path).await?;

        debug!("写入完成: {} ({} 字节, 版本 {})", full_path.display(), written, version);
        Ok(written)
    }

    async fn delete(&self, path: &str) -> Result<bool> {
        let full_path = self.resolve_path(path)?;

        match fs::remove_file(&full_path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_write_pins_version_and_reads_back() {
        let temp = TempDir::new().unwrap();
        let storage = LocalStorage::new(temp.path()).unwrap();

        let data = vec![7u8; super::super::CHUNK_SIZE * 2 + 11];
        let written = storage.write("nested/dir/blob.bin", &data, 1_650_000_000).await.unwrap();
        assert_eq!(written, data.len() as u64);

        let meta = storage.stat("nested/dir/blob.bin").await.unwrap().unwrap();
        assert_eq!(meta.version, 1_650_000_000);
        assert_eq!(meta.size, data.len() as u64);

        let (mut file, _) = storage.open("nested/dir/blob.bin").await.unwrap().unwrap();
        let mut back = Vec::new();
        file.read_to_end(&mut back).await.unwrap();
        assert_eq!(back, data);

        // 不留下临时文件
        assert!(!temp.path().join("nested/dir/blob.bin.synctmp").exists());
    }

    #[tokio::test]
    async fn test_missing_files_and_delete() {
        let temp = TempDir::new().unwrap();
        let storage = LocalStorage::new(temp.path()).unwrap();

        assert!(storage.stat("none.txt").await.unwrap().is_none());
        assert!(storage.open("none.txt").await.unwrap().is_none());
        assert!(!storage.delete("none.txt").await.unwrap());

        storage.write("a.txt", b"hello", 10).await.unwrap();
        assert!(storage.delete("a.txt").await.unwrap());
        assert!(storage.stat("a.txt").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rejects_escaping_paths() {
        let temp = TempDir::new().unwrap();
        let storage = LocalStorage::new(temp.path()).unwrap();
        let result = storage.write("../escape.txt", b"x", 1).await;
        assert!(matches!(result, Err(SyncError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_failed_stream_leaves_target_untouched() {
        let temp = TempDir::new().unwrap();
        let storage = LocalStorage::new(temp.path()).unwrap();
        storage.write("keep.txt", b"original", 5).await.unwrap();

        let chunks: Vec<std::io::Result<bytes::Bytes>> = vec![
            Ok(bytes::Bytes::from_static(b"partial")),
            Err(std::io::Error::new(ErrorKind::UnexpectedEof, "peer closed")),
        ];
        let result = storage
            .write_stream("keep.txt", Box::pin(futures::stream::iter(chunks)), 6)
            .await;
        assert!(result.is_err());

        let content = std::fs::read(temp.path().join("keep.txt")).unwrap();
        assert_eq!(content, b"original");
        assert!(!temp.path().join("keep.txt.synctmp").exists());
    }
}
