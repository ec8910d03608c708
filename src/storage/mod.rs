pub mod local;

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

pub use local::LocalStorage;

// ============ 公共常量 ============

/// 传输分块大小
pub const CHUNK_SIZE: usize = 64 * 1024;

/// 写入流，可以借用连接
pub type ByteStream<'a> = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send + 'a>>;

/// 文件元数据
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileMeta {
    pub size: u64,
    /// 修改时间（秒）
    pub version: u64,
}

/// 根目录存储接口，路径均为根目录相对路径
#[async_trait]
pub trait Storage: Send + Sync {
    /// 根目录绝对路径
    fn root(&self) -> &Path;

    /// 获取文件元数据，不存在返回 None
    async fn stat(&self, path: &str) -> Result<Option<FileMeta>>;

    /// 打开文件用于读取，不存在返回 None
    async fn open(&self, path: &str) -> Result<Option<(tokio::fs::File, FileMeta)>>;

    /// 流式写入，完成后修改时间固定为 version，返回写入字节数
    async fn write_stream(&self, path: &str, stream: ByteStream<'_>, version: u64) -> Result<u64>;

    /// 写入整个文件
    async fn write(&self, path: &str, data: &[u8], version: u64) -> Result<u64> {
        let chunks: Vec<io::Result<Bytes>> = data
            .chunks(CHUNK_SIZE)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        self.write_stream(path, Box::pin(futures::stream::iter(chunks)), version)
            .await
    }

    /// 删除文件，文件不存在返回 false
    async fn delete(&self, path: &str) -> Result<bool>;

    /// 获取存储名称（用于日志）
    fn name(&self) -> &str;
}

/// 根目录列表，下标即 rootIndex
pub type RootSet = Vec<Arc<dyn Storage>>;

/// 根据配置的根目录创建存储实例
pub fn create_storage(roots: &[PathBuf]) -> Result<RootSet> {
    roots
        .iter()
        .map(|root| {
            tracing::info!("初始化本地存储: {}", root.display());
            Ok(Arc::new(LocalStorage::new(root)?) as Arc<dyn Storage>)
        })
        .collect()
}
