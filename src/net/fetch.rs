//! 出站请求
//!
//! 每次请求新建连接，连接建立和每一次读写都受超时约束，超时即放弃并关闭连接。

use crate::core::engine::SyncMode;
use crate::core::comparator::SyncAction;
use crate::core::file_state::{FileKey, FileRecord};
use crate::error::{Result, SyncError};
use crate::net::protocol::{
    body_stream, encode_path_header, header, route, split_head, NotifyMessage, Request,
    Response, APPLICATION_JSON, OCTET_STREAM,
};
use crate::storage::{Storage, CHUNK_SIZE};
use bytes::BytesMut;
use futures::StreamExt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

/// sync-list 的成功答复
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncListReply {
    /// "Up to date"
    UpToDate,
    /// "All files accepted"
    Accepted,
    Actions(Vec<SyncAction>),
}

/// 面向某个对端的请求客户端
#[derive(Debug, Clone)]
pub struct PeerClient {
    addr: SocketAddr,
    timeout: Duration,
    max_header_bytes: usize,
}

impl PeerClient {
    pub fn new(addr: SocketAddr, timeout: Duration) -> Self {
        Self {
            addr,
            timeout,
            max_header_bytes: 64 * 1024,
        }
    }

    pub fn with_max_header_bytes(mut self, max_header_bytes: usize) -> Self {
        self.max_header_bytes = max_header_bytes;
        self
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    async fn timed<T, F>(&self, what: &str, fut: F) -> Result<T>
    where
        F: Future<Output = io::Result<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(SyncError::Timeout(format!("{} {}", what, self.addr))),
        }
    }

    async fn connect(&self) -> Result<TcpStream> {
        let stream = self.timed("连接", TcpStream::connect(self.addr)).await?;
        let _ = stream.set_nodelay(true);
        Ok(stream)
    }

    /// 读取响应头，返回响应与已读入的消息体前缀
    async fn read_head(&self, stream: &mut TcpStream) -> Result<(Response, BytesMut)> {
        let mut buf = BytesMut::with_capacity(4096);
        loop {
            if let Some(head) = split_head(&mut buf, self.max_header_bytes)? {
                return Ok((Response::parse_head(&head)?, buf));
            }
            if self.timed("读取响应", stream.read_buf(&mut buf)).await? == 0 {
                return Err(SyncError::transport(format!("{} 在响应头之前关闭连接", self.addr)));
            }
        }
    }

    /// 发送请求并读取完整响应
    pub async fn send(&self, request: &Request) -> Result<Response> {
        let mut stream = self.connect().await?;
        self.timed("发送请求", stream.write_all(&request.encode())).await?;

        let (mut response, mut buf) = self.read_head(&mut stream).await?;
        let length = response.headers.content_length()?;
        while buf.len() < length {
            buf.reserve((length - buf.len()).min(CHUNK_SIZE));
            if self.timed("读取响应", stream.read_buf(&mut buf)).await? == 0 {
                return Err(SyncError::transport(format!(
                    "响应体不完整: {}/{} 字节",
                    buf.len(),
                    length
                )));
            }
        }
        buf.truncate(length);
        response.body = buf.freeze();
        Ok(response)
    }

    async fn expect_ok(&self, request: &Request) -> Result<Response> {
        let response = self.send(request).await?;
        if response.is_success() {
            Ok(response)
        } else {
            Err(status_error(&response))
        }
    }

    pub async fn register(&self) -> Result<()> {
        self.expect_ok(&Request::get(route::REGISTER)).await?;
        info!("已注册到服务器 {}", self.addr);
        Ok(())
    }

    pub async fn ping(&self) -> Result<()> {
        self.expect_ok(&Request::get(route::PING)).await?;
        debug!("ping {} 成功", self.addr);
        Ok(())
    }

    /// 提交文件列表；增量提交被拒绝时返回 Conflict
    pub async fn sync_list(&self, entries: &[FileRecord], mode: SyncMode) -> Result<SyncListReply> {
        let body = serde_json::to_vec(entries)?;
        let request = Request::post(route::SYNC_LIST)
            .with_header(header::SYNC_MODE, mode.as_str())
            .with_body(body, APPLICATION_JSON);
        let response = self.expect_ok(&request).await?;

        let is_json = response
            .header(header::CONTENT_TYPE)
            .is_some_and(|t| t.starts_with(APPLICATION_JSON));
        if is_json {
            let actions: Vec<SyncAction> = serde_json::from_slice(&response.body)?;
            return Ok(SyncListReply::Actions(actions));
        }
        match response.text_body().trim() {
            "Up to date" => Ok(SyncListReply::UpToDate),
            _ => Ok(SyncListReply::Accepted),
        }
    }

    /// 上传本地文件，版本取文件当前修改时间；本地文件已不存在时返回 false
    pub async fn upload(&self, storage: &dyn Storage, key: &FileKey) -> Result<bool> {
        let Some((file, meta)) = storage.open(&key.path).await? else {
            debug!("待上传文件已不存在: {}", key);
            return Ok(false);
        };

        let request = Request::post(route::UPLOAD)
            .with_header(header::FILE_PATH, encode_path_header(&key.path))
            .with_header(header::FILE_VERSION, meta.version)
            .with_header(header::FILE_TYPE, "file")
            .with_header(header::FILE_ROOT_INDEX, key.root_index)
            .with_header(header::CONTENT_TYPE, OCTET_STREAM);

        let mut stream = self.connect().await?;
        self.timed("发送请求", stream.write_all(&request.encode_head(meta.size)))
            .await?;

        let mut chunks = ReaderStream::with_capacity(file.take(meta.size), CHUNK_SIZE);
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk?;
            self.timed("上传", stream.write_all(&chunk)).await?;
        }
        self.timed("上传", stream.flush()).await?;

        let (response, _) = self.read_head(&mut stream).await?;
        if !response.is_success() {
            return Err(status_error(&response));
        }
        info!("上传完成: {} (版本 {}, {} 字节)", key, meta.version, meta.size);
        Ok(true)
    }

    /// 下载文件写入存储，修改时间固定为服务器版本
    ///
    /// 文件不存在或请求超时（包括传输中途停顿）返回 None；给出 newer_than 时只有服务器版本更新才写入
    pub async fn download(
        &self,
        storage: &dyn Storage,
        key: &FileKey,
        newer_than: Option<u64>,
    ) -> Result<Option<u64>> {
        match self.download_inner(storage, key, newer_than).await {
            Err(SyncError::Timeout(what)) => {
                warn!("下载超时，按不存在处理: {} ({})", key, what);
                Ok(None)
            }
            Err(SyncError::Io(e)) if e.kind() == io::ErrorKind::TimedOut => {
                warn!("下载中途超时，按不存在处理: {} ({})", key, e);
                Ok(None)
            }
            other => other,
        }
    }

    async fn download_inner(
        &self,
        storage: &dyn Storage,
        key: &FileKey,
        newer_than: Option<u64>,
    ) -> Result<Option<u64>> {
        let request = Request::get(route::DOWNLOAD)
            .with_query("path", &key.path)
            .with_query("rootIndex", key.root_index);

        let mut stream = self.connect().await?;
        self.timed("发送请求", stream.write_all(&request.encode())).await?;

        let (response, prefix) = self.read_head(&mut stream).await?;
        if response.status == 404 {
            debug!("服务器上不存在: {}", key);
            return Ok(None);
        }
        if !response.is_success() {
            return Err(status_error(&response));
        }

        let version = response
            .header(header::FILE_VERSION)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .ok_or_else(|| SyncError::protocol("下载响应缺少 X-File-Version"))?;
        if let Some(local) = newer_than {
            if version <= local {
                debug!("本地版本不旧，跳过下载: {} ({} <= {})", key, version, local);
                return Ok(None);
            }
        }

        let length = response.headers.content_length()? as u64;
        let body = body_stream(stream, prefix, length, self.timeout);
        let written = storage.write_stream(&key.path, body, version).await?;
        info!("下载完成: {} (版本 {}, {} 字节)", key, version, written);
        Ok(Some(version))
    }

    /// 推送变化通知（服务器 -> 客户端）
    pub async fn notify(&self, message: &NotifyMessage) -> Result<()> {
        let body = serde_json::to_vec(message)?;
        let request = Request::post(route::NOTIFY).with_body(body, APPLICATION_JSON);
        self.expect_ok(&request).await?;
        Ok(())
    }
}

/// 按状态码映射错误
fn status_error(response: &Response) -> SyncError {
    let message = response.text_body();
    match response.status {
        400 => SyncError::Protocol(message),
        404 => SyncError::NotFound(message),
        409 => SyncError::Conflict(message),
        status => SyncError::transport(format!("{} {}: {}", status, response.reason, message)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn one_shot_server(reply: &'static [u8]) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let _ = crate::net::protocol::read_request(&mut socket, Default::default()).await;
            socket.write_all(reply).await.unwrap();
            socket.shutdown().await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn test_send_reads_full_body() {
        let addr = one_shot_server(b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\nPong").await;
        let client = PeerClient::new(addr, Duration::from_secs(2));
        let response = client.send(&Request::get(route::PING)).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(&response.body[..], b"Pong");
    }

    #[tokio::test]
    async fn test_sync_list_conflict() {
        let addr = one_shot_server(b"HTTP/1.1 409 Conflict\r\nContent-Length: 5\r\n\r\nstale").await;
        let client = PeerClient::new(addr, Duration::from_secs(2));
        let result = client
            .sync_list(&[FileRecord::file(0, "a", 1)], SyncMode::Partial)
            .await;
        assert!(matches!(result, Err(SyncError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_silent_peer_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _hold = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(socket);
        });

        let client = PeerClient::new(addr, Duration::from_millis(200));
        let result = client.ping().await;
        assert!(matches!(result, Err(SyncError::Timeout(_))));
        assert!(!result.unwrap_err().is_liveness_failure());
    }

    #[tokio::test]
    async fn test_download_timeout_is_not_found() {
        let temp = tempfile::TempDir::new().unwrap();
        let storage = crate::storage::LocalStorage::new(temp.path()).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _hold = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(socket);
        });

        let client = PeerClient::new(addr, Duration::from_millis(200));
        let result = client.download(&storage, &FileKey::new(0, "a.txt"), None).await;
        assert_eq!(result.unwrap(), None);
        assert!(!temp.path().join("a.txt").exists());
    }

    #[tokio::test]
    async fn test_download_stall_mid_body_is_not_found() {
        let temp = tempfile::TempDir::new().unwrap();
        let storage = crate::storage::LocalStorage::new(temp.path()).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _hold = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let _ = crate::net::protocol::read_request(&mut socket, Default::default()).await;
            socket
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\nX-File-Version: 7\r\n\r\n0123456789")
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(socket);
        });

        let client = PeerClient::new(addr, Duration::from_millis(200));
        let result = client.download(&storage, &FileKey::new(0, "slow.bin"), None).await;
        assert_eq!(result.unwrap(), None);
        assert!(!temp.path().join("slow.bin").exists());
        assert!(!temp.path().join("slow.bin.synctmp").exists());
    }

    #[tokio::test]
    async fn test_refused_connection_is_liveness_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = PeerClient::new(addr, Duration::from_secs(2));
        let err = client.ping().await.unwrap_err();
        assert!(err.is_liveness_failure(), "{:?}", err);
    }
}
