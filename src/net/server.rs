//! 同步服务器
//!
//! 持有权威文件表，处理客户端请求，向已注册客户端推送变化，
//! 同时监视本地根目录并把本地修改推送出去。

use crate::config::SyncSettings;
use crate::core::comparator::FileComparator;
use crate::core::engine::{FullSyncOutcome, KeyLocks, ReconcileEngine, SyncMode};
use crate::core::file_state::{sanitize_relative, FileKey, FileRecord, RecordMap};
use crate::core::registry::PeerRegistry;
use crate::core::scanner::FileScanner;
use crate::core::suppressor::{EchoSuppressor, PendingUploads};
use crate::core::watcher::{DirectoryWatcher, WatchEvent};
use crate::error::{Result, SyncError};
use crate::net::discovery::DiscoveryResponder;
use crate::net::fetch::PeerClient;
use crate::net::protocol::{
    body_stream, decode_path_header, header, read_body, read_request_head, route, NotifyMessage,
    Request, Response, OCTET_STREAM,
};
use crate::storage::{create_storage, ByteStream, RootSet, Storage, CHUNK_SIZE};
use bytes::BytesMut;
use futures::StreamExt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant};
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// 处理结果：普通响应，或需要分块发送的文件
pub enum Reply {
    Message(Response),
    File {
        head: Response,
        file: tokio::fs::File,
        size: u64,
    },
}

impl Reply {
    pub fn status(&self) -> u16 {
        match self {
            Reply::Message(r) => r.status,
            Reply::File { head, .. } => head.status,
        }
    }
}

/// 服务器共享状态，所有连接任务与主循环共用
pub struct ServerState {
    settings: SyncSettings,
    roots: RootSet,
    engine: Mutex<ReconcileEngine>,
    registry: Mutex<PeerRegistry>,
    suppressor: Mutex<EchoSuppressor>,
    locks: KeyLocks,
    pending: PendingUploads,
}

impl ServerState {
    pub fn new(settings: SyncSettings, roots: RootSet, records: RecordMap) -> Self {
        let registry = PeerRegistry::new(settings.registry_ttl_secs);
        let suppressor = EchoSuppressor::new(settings.suppression_ttl());
        Self {
            settings,
            roots,
            engine: Mutex::new(ReconcileEngine::new(records)),
            registry: Mutex::new(registry),
            suppressor: Mutex::new(suppressor),
            locks: KeyLocks::default(),
            pending: PendingUploads::default(),
        }
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub fn stored_version(&self, key: &FileKey) -> Option<u64> {
        lock(&self.engine).get(key).map(|r| r.version)
    }

    pub fn registered_peers(&self) -> Vec<IpAddr> {
        lock(&self.registry).targets(None)
    }

    pub fn is_suppressed(&self, key: &FileKey) -> bool {
        lock(&self.suppressor).contains(key)
    }

    fn storage(&self, root_index: usize) -> Result<&Arc<dyn Storage>> {
        self.roots
            .get(root_index)
            .ok_or_else(|| SyncError::protocol(format!("无效的 rootIndex: {}", root_index)))
    }

    fn parse_root_index(&self, raw: Option<&str>) -> Result<usize> {
        let index = match raw {
            None => 0,
            Some(v) => v
                .trim()
                .parse::<usize>()
                .map_err(|_| SyncError::protocol(format!("无效的 rootIndex: {}", v)))?,
        };
        self.storage(index)?;
        Ok(index)
    }

    /// 从 X-File-Path / X-File-Root-Index 取出文件键
    fn key_from_headers(&self, request: &Request) -> Result<FileKey> {
        let raw = request
            .header(header::FILE_PATH)
            .ok_or_else(|| SyncError::protocol("缺少 X-File-Path"))?;
        let path = sanitize_relative(&decode_path_header(raw)?)?;
        let root_index = self.parse_root_index(request.header(header::FILE_ROOT_INDEX))?;
        Ok(FileKey::new(root_index, path))
    }

    /// 处理一个已完整读入的请求
    pub async fn handle_request(&self, peer: IpAddr, request: Request) -> Reply {
        self.touch(peer);

        let result = match (request.method.as_str(), request.path.as_str()) {
            ("GET", route::REGISTER) => Ok(Reply::Message(Response::ok("Registered"))),
            ("GET", route::PING) => Ok(Reply::Message(Response::ok("Pong"))),
            ("POST", route::SYNC_LIST) => self.handle_sync_list(peer, &request).await.map(Reply::Message),
            ("POST", route::UPLOAD) => {
                let body = request.body.clone();
                let stream: ByteStream<'_> = Box::pin(futures::stream::iter([Ok::<_, std::io::Error>(body)]));
                self.handle_upload(peer, &request, stream).await.map(Reply::Message)
            }
            ("GET", route::DOWNLOAD) => self.handle_download(&request).await,
            ("POST", route::DELETE) => self.handle_delete(peer, &request).await.map(Reply::Message),
            _ => {
                debug!("未知请求: {} {} 来自 {}", request.method, request.path, peer);
                Ok(Reply::Message(Response::text(404, "Not Found")))
            }
        };

        self.to_reply(peer, &request, result)
    }

    fn touch(&self, peer: IpAddr) {
        lock(&self.registry).touch(peer);
    }

    fn to_reply(&self, peer: IpAddr, request: &Request, result: Result<Reply>) -> Reply {
        result.unwrap_or_else(|e| {
            match e.status().0 {
                500 => error!("{} {} 处理失败: {}", request.method, request.path, e),
                _ => warn!("{} {} 来自 {}: {}", request.method, request.path, peer, e),
            }
            Reply::Message(Response::from_error(&e))
        })
    }

    async fn handle_sync_list(&self, peer: IpAddr, request: &Request) -> Result<Response> {
        let mut entries: Vec<FileRecord> = serde_json::from_slice(&request.body)?;
        for entry in &mut entries {
            entry.path = sanitize_relative(&entry.path)?;
            self.storage(entry.root_index)?;
        }

        match SyncMode::detect(request.header(header::SYNC_MODE), &entries)? {
            SyncMode::Full => {
                let outcome = lock(&self.engine).full_sync(&entries);
                match outcome {
                    FullSyncOutcome::UpToDate => {
                        info!("{} 完整同步: 已是最新", peer);
                        Ok(Response::ok("Up to date"))
                    }
                    FullSyncOutcome::Actions(actions) => {
                        let summary = FileComparator::summarize_actions(&actions);
                        info!(
                            "{} 完整同步: {} 个下载, {} 个上传, {} 个删除",
                            peer, summary.download_count, summary.upload_count, summary.delete_count
                        );
                        Response::json(&actions)
                    }
                }
            }
            SyncMode::Partial => {
                let mut rejected = 0usize;
                for entry in &entries {
                    let key = entry.key();
                    let _guard = self.locks.lock(&key).await;
                    let outcome = lock(&self.engine).review_partial(std::slice::from_ref(entry));
                    for deletion in &outcome.deletions {
                        self.apply_deletion(&deletion.key(), Some(peer)).await?;
                    }
                    rejected += outcome.rejected.len();
                }

                if rejected > 0 {
                    return Err(SyncError::conflict(format!(
                        "{} 个条目的版本不新于服务器",
                        rejected
                    )));
                }
                Ok(Response::ok("All files accepted"))
            }
        }
    }

    /// 从连接上流式接收上传：先检查版本并标记上传中，再把剩余字节直接写入存储
    pub async fn receive_upload<R>(
        &self,
        peer: IpAddr,
        request: &Request,
        reader: &mut R,
        prefix: BytesMut,
    ) -> Reply
    where
        R: tokio::io::AsyncRead + Unpin + Send,
    {
        self.touch(peer);
        let result = match request.headers.content_length() {
            Ok(length) => {
                let body = body_stream(reader, prefix, length as u64, self.settings.fetch_timeout());
                self.handle_upload(peer, request, body).await
            }
            Err(e) => Err(e),
        };
        self.to_reply(peer, request, result.map(Reply::Message))
    }

    async fn handle_upload(
        &self,
        peer: IpAddr,
        request: &Request,
        body: ByteStream<'_>,
    ) -> Result<Response> {
        let key = self.key_from_headers(request)?;
        let version = request
            .header(header::FILE_VERSION)
            .ok_or_else(|| SyncError::protocol("缺少 X-File-Version"))?;
        let version = version
            .trim()
            .parse::<u64>()
            .map_err(|_| SyncError::protocol(format!("无效的 X-File-Version: {}", version)))?;
        let storage = self.storage(key.root_index)?;

        let _guard = self.locks.lock(&key).await;
        lock(&self.engine).check_upload(&key, version)?;

        if !self.pending.mark(&key) {
            return Err(SyncError::conflict(format!("{} 正在上传", key)));
        }
        let _pending = scopeguard::guard(&key, |k| self.pending.release(k));

        lock(&self.suppressor).insert(key.clone());
        let written = match storage.write_stream(&key.path, body, version).await {
            Ok(n) => n,
            Err(e) => {
                lock(&self.suppressor).release(&key);
                return Err(e);
            }
        };
        lock(&self.engine).commit(FileRecord::file(key.root_index, key.path.clone(), version));

        info!("收到上传: {} (版本 {}, {} 字节, 来自 {})", key, version, written, peer);
        self.broadcast(NotifyMessage::changed(&key), Some(peer));
        Ok(Response::ok("File uploaded"))
    }

    async fn handle_download(&self, request: &Request) -> Result<Reply> {
        let raw = request
            .query_param("path")
            .ok_or_else(|| SyncError::protocol("缺少 path 参数"))?;
        let path = sanitize_relative(raw)?;
        let root_index = self.parse_root_index(request.query_param("rootIndex"))?;
        let storage = self.storage(root_index)?;

        let Some((file, meta)) = storage.open(&path).await? else {
            return Err(SyncError::not_found(format!("[{}] {}", root_index, path)));
        };

        debug!("发送文件: [{}] {} ({} 字节)", root_index, path, meta.size);
        let head = Response::new(200)
            .with_header(header::CONTENT_TYPE, OCTET_STREAM)
            .with_header(header::FILE_VERSION, meta.version)
            .with_header(header::FILE_ROOT_INDEX, root_index);
        Ok(Reply::File {
            head,
            file,
            size: meta.size,
        })
    }

    async fn handle_delete(&self, peer: IpAddr, request: &Request) -> Result<Response> {
        let key = self.key_from_headers(request)?;
        let _guard = self.locks.lock(&key).await;
        self.apply_deletion(&key, Some(peer)).await?;
        Ok(Response::ok("File deleted"))
    }

    /// 删除本地文件并通知其他客户端，调用方持有该键的锁
    async fn apply_deletion(&self, key: &FileKey, origin: Option<IpAddr>) -> Result<bool> {
        let storage = self.storage(key.root_index)?;

        lock(&self.suppressor).insert(key.clone());
        let existed = match storage.delete(&key.path).await {
            Ok(existed) => existed,
            Err(e) => {
                lock(&self.suppressor).release(key);
                return Err(e);
            }
        };
        if !existed {
            // 不会有本地事件
            lock(&self.suppressor).release(key);
        }

        let known = lock(&self.engine).remove(key).is_some();
        if existed || known {
            info!("已删除: {}", key);
            self.broadcast(NotifyMessage::removed(key), origin);
        } else {
            debug!("删除目标不存在: {}", key);
        }
        Ok(existed)
    }

    /// 合并本地监视器事件并推送给客户端
    pub fn on_local_events(&self, events: Vec<WatchEvent>) {
        for event in events {
            let key = event.key();
            if lock(&self.suppressor).consume(&key) {
                continue;
            }
            if self.pending.contains(&key) {
                debug!("上传中，忽略本地事件: {}", key);
                continue;
            }

            let message = {
                let mut engine = lock(&self.engine);
                let known = engine.get(&key).map(|r| r.version);
                match &event {
                    WatchEvent::Changed(record) if known == Some(record.version) => None,
                    WatchEvent::Removed(_) if known.is_none() => None,
                    WatchEvent::Changed(_) => {
                        engine.apply_local(&event);
                        Some(NotifyMessage::changed(&key))
                    }
                    WatchEvent::Removed(_) => {
                        engine.apply_local(&event);
                        Some(NotifyMessage::removed(&key))
                    }
                }
            };

            if let Some(message) = message {
                info!("本地变化: {} (删除: {})", key, message.deleted);
                self.broadcast(message, None);
            }
        }
    }

    /// 向已注册客户端推送，跳过触发该变化的来源
    fn broadcast(&self, message: NotifyMessage, origin: Option<IpAddr>) {
        let targets = lock(&self.registry).targets(origin);
        if targets.is_empty() {
            return;
        }

        let port = self.settings.notify_port;
        let timeout = self.settings.fetch_timeout();
        for target in targets {
            let message = message.clone();
            tokio::spawn(async move {
                let client = PeerClient::new(SocketAddr::new(target, port), timeout);
                match client.notify(&message).await {
                    Ok(()) => debug!("已通知 {}: {}", target, message.path),
                    Err(e) => debug!("通知 {} 失败: {}", target, e),
                }
            });
        }
    }

    /// 注册表与抑制集的定时清理
    pub fn sweep_registry(&self) -> Vec<IpAddr> {
        lock(&self.registry).sweep()
    }

    pub fn sweep_suppression(&self) -> usize {
        lock(&self.suppressor).sweep()
    }
}

/// 写出响应，文件按块发送，每块写入完成后再读下一块
async fn write_reply(stream: &mut TcpStream, reply: Reply, chunk_size: usize) -> Result<()> {
    match reply {
        Reply::Message(response) => {
            stream.write_all(&response.encode()).await?;
        }
        Reply::File { head, file, size } => {
            stream.write_all(&head.encode_head(size)).await?;
            let mut chunks = ReaderStream::with_capacity(file.take(size), chunk_size);
            while let Some(chunk) = chunks.next().await {
                stream.write_all(&chunk?).await?;
            }
        }
    }
    stream.shutdown().await?;
    Ok(())
}

/// 丢弃对端尚未发送完的数据，直到对端关闭或停顿超时
async fn drain(stream: &mut TcpStream, timeout: Duration) {
    let mut buf = vec![0u8; CHUNK_SIZE];
    while let Ok(Ok(n)) = tokio::time::timeout(timeout, stream.read(&mut buf)).await {
        if n == 0 {
            break;
        }
    }
}

async fn serve_connection(state: Arc<ServerState>, mut stream: TcpStream, peer: SocketAddr) {
    let limits = state.settings.frame_limits();
    let (mut request, prefix) = match read_request_head(&mut stream, limits.max_header_bytes).await {
        Ok(Some(head)) => head,
        Ok(None) => return,
        Err(e) => {
            debug!("来自 {} 的请求无效: {}", peer, e);
            if matches!(e, SyncError::Protocol(_)) {
                let _ = write_reply(&mut stream, Reply::Message(Response::from_error(&e)), 0).await;
            }
            return;
        }
    };
    debug!("{} {} 来自 {}", request.method, request.target(), peer);

    // 上传直接从连接流入存储，其余请求整体读入
    if request.method == "POST" && request.path == route::UPLOAD {
        let reply = state.receive_upload(peer.ip(), &request, &mut stream, prefix).await;
        let rejected = reply.status() != 200;
        if let Err(e) = write_reply(&mut stream, reply, state.settings.chunk_size).await {
            debug!("向 {} 发送响应失败: {}", peer, e);
        }
        if rejected {
            drain(&mut stream, state.settings.fetch_timeout()).await;
        }
        return;
    }

    let reply = match read_body(&mut stream, &mut request, prefix, limits.max_body_bytes).await {
        Ok(()) => state.handle_request(peer.ip(), request).await,
        Err(e) => {
            debug!("来自 {} 的请求体无效: {}", peer, e);
            if !matches!(e, SyncError::Protocol(_)) {
                return;
            }
            Reply::Message(Response::from_error(&e))
        }
    };
    if let Err(e) = write_reply(&mut stream, reply, state.settings.chunk_size).await {
        debug!("向 {} 发送响应失败: {}", peer, e);
    }
}

/// 同步服务器
pub struct SyncServer {
    state: Arc<ServerState>,
    listener: TcpListener,
    responder: DiscoveryResponder,
    watcher: DirectoryWatcher,
}

impl SyncServer {
    /// 扫描根目录并绑定端口，任何绑定失败都是致命错误
    pub async fn bind(settings: SyncSettings) -> Result<Self> {
        settings.validate()?;

        let roots = create_storage(&settings.roots)?;
        let scanner = FileScanner::new(&settings.scan_config());
        let mut watcher = DirectoryWatcher::new(&settings.roots, scanner)?;
        watcher.start();
        let records: RecordMap = watcher
            .current_files()
            .into_iter()
            .map(|r| (r.key(), r))
            .collect();

        let control = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), settings.control_port);
        let listener = TcpListener::bind(control)
            .await
            .map_err(|e| SyncError::Config(format!("无法绑定控制端口 {}: {}", control, e)))?;
        let responder = DiscoveryResponder::bind(settings.discovery_port).await?;

        Ok(Self {
            state: Arc::new(ServerState::new(settings, roots, records)),
            listener,
            responder,
            watcher,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn discovery_addr(&self) -> Result<SocketAddr> {
        self.responder.local_addr()
    }

    pub fn state(&self) -> Arc<ServerState> {
        self.state.clone()
    }

    /// 主循环，取消后返回
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let SyncServer {
            state,
            listener,
            responder,
            mut watcher,
        } = self;

        let responder_task = tokio::spawn(responder.run(cancel.child_token()));

        let (notify_tx, mut notify_rx) = mpsc::unbounded_channel();
        if state.settings.live_watch {
            if let Err(e) = watcher.attach_notifier(notify_tx.clone()) {
                warn!("文件通知不可用，仅使用定时扫描: {}", e);
            }
        }

        let rescan_period = state.settings.rescan_interval();
        let sweep_period = state.settings.registry_sweep_interval();
        let mut rescan = interval_at(Instant::now() + rescan_period, rescan_period);
        let mut sweep = interval_at(Instant::now() + sweep_period, sweep_period);

        info!("同步服务器已启动: {:?}", listener.local_addr().ok());

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let state = state.clone();
                        tokio::spawn(serve_connection(state, stream, peer));
                    }
                    Err(e) => warn!("接受连接失败: {}", e),
                },
                Some(event) = notify_rx.recv() => {
                    let events = watcher.handle_notify(event);
                    state.on_local_events(events);
                }
                _ = rescan.tick() => {
                    let events = watcher.rescan_async().await;
                    watcher.update_watch_set();
                    state.on_local_events(events);
                    state.sweep_suppression();
                }
                _ = sweep.tick() => {
                    state.sweep_registry();
                }
            }
        }

        drop(notify_tx);
        if let Err(e) = responder_task.await {
            warn!("发现服务退出异常: {}", e);
        }
        info!("同步服务器已停止");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::comparator::{ActionKind, SyncAction};
    use crate::net::protocol::{encode_path_header, read_request};
    use crate::storage::LocalStorage;
    use tempfile::TempDir;

    fn peer(last: u8) -> IpAddr {
        IpAddr::from([10, 0, 0, last])
    }

    fn state_with_roots(dirs: &[&TempDir], settings: SyncSettings) -> ServerState {
        let roots: RootSet = dirs
            .iter()
            .map(|d| Arc::new(LocalStorage::new(d.path()).unwrap()) as Arc<dyn Storage>)
            .collect();
        ServerState::new(settings, roots, RecordMap::new())
    }

    fn upload(path: &str, root: usize, version: u64, body: &[u8]) -> Request {
        Request::post(route::UPLOAD)
            .with_header(header::FILE_PATH, encode_path_header(path))
            .with_header(header::FILE_VERSION, version)
            .with_header(header::FILE_ROOT_INDEX, root)
            .with_body(body.to_vec(), OCTET_STREAM)
    }

    fn sync_list(entries: &[FileRecord], mode: Option<&str>) -> Request {
        let mut request = Request::post(route::SYNC_LIST)
            .with_body(serde_json::to_vec(entries).unwrap(), "application/json");
        if let Some(mode) = mode {
            request = request.with_header(header::SYNC_MODE, mode);
        }
        request
    }

    /// 单连接服务，走真实的读取路径
    async fn serve_once(state: Arc<ServerState>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            serve_connection(state, stream, peer).await;
        });
        addr
    }

    fn message(reply: Reply) -> Response {
        match reply {
            Reply::Message(r) => r,
            Reply::File { .. } => panic!("expected a message reply"),
        }
    }

    #[tokio::test]
    async fn test_upload_then_download_round_trip() {
        let dir = TempDir::new().unwrap();
        let state = state_with_roots(&[&dir], SyncSettings::default());

        let reply = state.handle_request(peer(1), upload("docs/n.txt", 0, 1_700_000_000, b"payload")).await;
        assert_eq!(reply.status(), 200);
        assert_eq!(state.stored_version(&FileKey::new(0, "docs/n.txt")), Some(1_700_000_000));
        assert!(state.is_suppressed(&FileKey::new(0, "docs/n.txt")));

        let request = Request::get(route::DOWNLOAD)
            .with_query("path", "docs/n.txt")
            .with_query("rootIndex", 0);
        match state.handle_request(peer(1), request).await {
            Reply::File { head, mut file, size } => {
                assert_eq!(head.header(header::FILE_VERSION), Some("1700000000"));
                assert_eq!(size, 7);
                let mut content = Vec::new();
                file.read_to_end(&mut content).await.unwrap();
                assert_eq!(content, b"payload");
            }
            Reply::Message(r) => panic!("unexpected {} {}", r.status, r.text_body()),
        }
    }

    #[tokio::test]
    async fn test_upload_streams_to_disk_while_body_arrives() {
        let dir = TempDir::new().unwrap();
        let state = Arc::new(state_with_roots(&[&dir], SyncSettings::default()));
        let addr = serve_once(state.clone()).await;
        let key = FileKey::new(0, "big.bin");
        let total = 8 * 1024 * 1024;

        let mut socket = TcpStream::connect(addr).await.unwrap();
        socket
            .write_all(&upload("big.bin", 0, 1_700_000_000, b"").encode_head(total as u64))
            .await
            .unwrap();
        socket.write_all(&vec![7u8; total / 2]).await.unwrap();

        // 请求体只到了一半：临时文件已在写入，键处于上传中
        let temp = dir.path().join("big.bin.synctmp");
        for _ in 0..100 {
            if temp.exists() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(temp.exists());
        assert!(state.pending.contains(&key));
        assert_eq!(state.stored_version(&key), None);

        socket.write_all(&vec![7u8; total - total / 2]).await.unwrap();
        let mut response = Vec::new();
        socket.read_to_end(&mut response).await.unwrap();
        assert!(response.starts_with(b"HTTP/1.1 200"), "{}", String::from_utf8_lossy(&response));

        assert_eq!(state.stored_version(&key), Some(1_700_000_000));
        assert!(!state.pending.contains(&key));
        assert!(!temp.exists());
        assert_eq!(std::fs::metadata(dir.path().join("big.bin")).unwrap().len(), total as u64);
    }

    #[tokio::test]
    async fn test_stale_upload_rejected_before_body() {
        let dir = TempDir::new().unwrap();
        let state = Arc::new(state_with_roots(&[&dir], SyncSettings::default()));
        state.handle_request(peer(1), upload("notes.txt", 0, 100, b"v100")).await;
        let addr = serve_once(state.clone()).await;

        // 只发请求头，不发请求体
        let mut socket = TcpStream::connect(addr).await.unwrap();
        socket
            .write_all(&upload("notes.txt", 0, 50, b"").encode_head(8 * 1024 * 1024))
            .await
            .unwrap();

        let mut response = Vec::new();
        tokio::time::timeout(std::time::Duration::from_secs(2), socket.read_to_end(&mut response))
            .await
            .unwrap()
            .unwrap();
        assert!(response.starts_with(b"HTTP/1.1 409"), "{}", String::from_utf8_lossy(&response));
        assert!(!dir.path().join("notes.txt.synctmp").exists());
        assert_eq!(state.stored_version(&FileKey::new(0, "notes.txt")), Some(100));
        assert_eq!(std::fs::read(dir.path().join("notes.txt")).unwrap(), b"v100");
    }

    #[tokio::test]
    async fn test_oversized_sync_list_is_rejected() {
        let dir = TempDir::new().unwrap();
        let settings = SyncSettings {
            max_body_bytes: 1024,
            ..Default::default()
        };
        let state = Arc::new(state_with_roots(&[&dir], settings));
        let addr = serve_once(state).await;

        let mut socket = TcpStream::connect(addr).await.unwrap();
        let head = Request::post(route::SYNC_LIST).encode_head(1024 * 1024);
        socket.write_all(&head).await.unwrap();

        let mut response = Vec::new();
        tokio::time::timeout(std::time::Duration::from_secs(2), socket.read_to_end(&mut response))
            .await
            .unwrap()
            .unwrap();
        assert!(response.starts_with(b"HTTP/1.1 400"), "{}", String::from_utf8_lossy(&response));
    }

    #[tokio::test]
    async fn test_stale_upload_and_partial_sync_conflict() {
        let dir = TempDir::new().unwrap();
        let state = state_with_roots(&[&dir], SyncSettings::default());
        let key = FileKey::new(0, "notes.txt");

        assert_eq!(state.handle_request(peer(1), upload("notes.txt", 0, 100, b"v100")).await.status(), 200);

        let reply = state
            .handle_request(peer(1), sync_list(&[FileRecord::file(0, "notes.txt", 99)], None))
            .await;
        assert_eq!(reply.status(), 409);

        let reply = state.handle_request(peer(2), upload("notes.txt", 0, 100, b"same")).await;
        assert_eq!(reply.status(), 409);
        let reply = state.handle_request(peer(2), upload("notes.txt", 0, 99, b"older")).await;
        assert_eq!(reply.status(), 409);

        assert_eq!(state.stored_version(&key), Some(100));
        assert_eq!(std::fs::read(dir.path().join("notes.txt")).unwrap(), b"v100");
    }

    #[tokio::test]
    async fn test_full_sync_returns_download_action() {
        let dir = TempDir::new().unwrap();
        let roots: RootSet = vec![Arc::new(LocalStorage::new(dir.path()).unwrap()) as Arc<dyn Storage>];
        let records: RecordMap = [FileRecord::file(0, "a.txt", 5)]
            .into_iter()
            .map(|r| (r.key(), r))
            .collect();
        let state = ServerState::new(SyncSettings::default(), roots, records);

        let reply = message(
            state
                .handle_request(peer(1), sync_list(&[], Some("full")))
                .await,
        );
        assert_eq!(reply.status, 200);
        let actions: Vec<SyncAction> = serde_json::from_slice(&reply.body).unwrap();
        assert_eq!(actions, vec![SyncAction::new(&FileKey::new(0, "a.txt"), 5, ActionKind::Download)]);

        let reply = message(
            state
                .handle_request(peer(1), sync_list(&[FileRecord::file(0, "a.txt", 5)], Some("full")))
                .await,
        );
        assert_eq!(reply.text_body(), "Up to date");
    }

    #[tokio::test]
    async fn test_partial_accept_and_delete() {
        let dir = TempDir::new().unwrap();
        let state = state_with_roots(&[&dir], SyncSettings::default());
        state.handle_request(peer(1), upload("gone.txt", 0, 10, b"x")).await;

        let reply = message(
            state
                .handle_request(peer(1), sync_list(&[FileRecord::file(0, "new.txt", 3)], None))
                .await,
        );
        assert_eq!(reply.text_body(), "All files accepted");

        let reply = state
            .handle_request(peer(1), sync_list(&[FileRecord::deleted(0, "gone.txt", 10)], None))
            .await;
        assert_eq!(reply.status(), 200);
        assert!(!dir.path().join("gone.txt").exists());
        assert_eq!(state.stored_version(&FileKey::new(0, "gone.txt")), None);
    }

    #[tokio::test]
    async fn test_bad_requests() {
        let dir = TempDir::new().unwrap();
        let state = state_with_roots(&[&dir], SyncSettings::default());

        let malformed = Request::post(route::SYNC_LIST).with_body("{not json", "application/json");
        assert_eq!(state.handle_request(peer(1), malformed).await.status(), 400);

        let no_meta = Request::post(route::UPLOAD).with_body("x", OCTET_STREAM);
        assert_eq!(state.handle_request(peer(1), no_meta).await.status(), 400);

        let escape = upload("../outside.txt", 0, 5, b"x");
        assert_eq!(state.handle_request(peer(1), escape).await.status(), 400);

        let bad_root = upload("a.txt", 3, 5, b"x");
        assert_eq!(state.handle_request(peer(1), bad_root).await.status(), 400);

        let missing = Request::get(route::DOWNLOAD).with_query("path", "nope.txt");
        assert_eq!(state.handle_request(peer(1), missing).await.status(), 404);

        let unknown = Request::get("/whatever");
        assert_eq!(state.handle_request(peer(1), unknown).await.status(), 404);
    }

    #[tokio::test]
    async fn test_delete_request() {
        let dir = TempDir::new().unwrap();
        let state = state_with_roots(&[&dir], SyncSettings::default());
        state.handle_request(peer(1), upload("d.txt", 0, 10, b"x")).await;

        let request = Request::post(route::DELETE)
            .with_header(header::FILE_PATH, "d.txt")
            .with_header(header::FILE_ROOT_INDEX, 0);
        let reply = message(state.handle_request(peer(1), request.clone()).await);
        assert_eq!(reply.text_body(), "File deleted");
        assert!(!dir.path().join("d.txt").exists());

        // 再次删除仍然成功，且不留下抑制键
        assert_eq!(state.handle_request(peer(1), request).await.status(), 200);
        assert!(!state.is_suppressed(&FileKey::new(0, "d.txt")));
    }

    #[tokio::test]
    async fn test_every_request_registers_peer() {
        let dir = TempDir::new().unwrap();
        let state = state_with_roots(&[&dir], SyncSettings::default());
        state.handle_request(peer(7), Request::get(route::PING)).await;
        state.handle_request(peer(3), Request::get(route::REGISTER)).await;
        assert_eq!(state.registered_peers(), vec![peer(3), peer(7)]);
    }

    #[tokio::test]
    async fn test_local_events_respect_suppression_and_pending() {
        let dir = TempDir::new().unwrap();
        let state = state_with_roots(&[&dir], SyncSettings::default());
        state.handle_request(peer(1), upload("s.txt", 0, 50, b"x")).await;

        // 上传产生的回声被消费
        state.on_local_events(vec![WatchEvent::Changed(FileRecord::file(0, "s.txt", 50))]);
        assert!(!state.is_suppressed(&FileKey::new(0, "s.txt")));

        // 真正的本地修改进入文件表
        state.on_local_events(vec![WatchEvent::Changed(FileRecord::file(0, "s.txt", 60))]);
        assert_eq!(state.stored_version(&FileKey::new(0, "s.txt")), Some(60));

        // 上传中的键被忽略
        let key = FileKey::new(0, "busy.bin");
        state.pending.mark(&key);
        state.on_local_events(vec![WatchEvent::Changed(FileRecord::file(0, "busy.bin", 1))]);
        assert_eq!(state.stored_version(&key), None);

        state.on_local_events(vec![WatchEvent::Removed(FileRecord::file(0, "s.txt", 60))]);
        assert_eq!(state.stored_version(&FileKey::new(0, "s.txt")), None);
    }

    #[tokio::test]
    async fn test_notifications_skip_origin() {
        let dir = TempDir::new().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let settings = SyncSettings {
            notify_port: listener.local_addr().unwrap().port(),
            ..Default::default()
        };
        let state = state_with_roots(&[&dir], settings);
        let subscriber = IpAddr::from([127, 0, 0, 1]);
        state.handle_request(subscriber, Request::get(route::REGISTER)).await;

        // 来源本身不会收到通知
        state.handle_request(subscriber, upload("mine.txt", 0, 5, b"x")).await;
        let nothing = tokio::time::timeout(std::time::Duration::from_millis(300), listener.accept()).await;
        assert!(nothing.is_err());

        // 其他客户端的上传会推送给它
        state.handle_request(peer(9), upload("theirs.txt", 0, 5, b"y")).await;
        let (mut socket, _) = tokio::time::timeout(std::time::Duration::from_secs(2), listener.accept())
            .await
            .unwrap()
            .unwrap();
        let request = read_request(&mut socket, Default::default()).await.unwrap().unwrap();
        assert_eq!(request.path, route::NOTIFY);
        let pushed: NotifyMessage = serde_json::from_slice(&request.body).unwrap();
        assert_eq!(pushed, NotifyMessage::changed(&FileKey::new(0, "theirs.txt")));
        socket.write_all(&Response::ok("OK").encode()).await.unwrap();
    }
}
