//! 同步客户端
//!
//! 一次会话：发现服务器 -> 注册 -> 完整同步 -> 处理本地变化、服务器推送与定时 ping。
//! 连接丢失后从发现重新开始，除磁盘文件外不保留任何状态。

use crate::config::SyncSettings;
use crate::core::comparator::{ActionKind, FileComparator};
use crate::core::engine::SyncMode;
use crate::core::file_state::{sanitize_relative, FileKey, FileRecord};
use crate::core::scanner::FileScanner;
use crate::core::suppressor::EchoSuppressor;
use crate::core::watcher::{DirectoryWatcher, WatchEvent};
use crate::error::{Result, SyncError};
use crate::net::discovery::DiscoveryClient;
use crate::net::fetch::{PeerClient, SyncListReply};
use crate::net::protocol::{read_request, route, FrameLimits, NotifyMessage, Response};
use crate::storage::{create_storage, RootSet, Storage};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 连续多少次 ping 超时视为连接丢失
const MAX_MISSED_PINGS: u32 = 3;

/// 推送队列容量
const PUSH_QUEUE: usize = 256;

/// 接收服务器推送的监听器
pub struct NotifyListener {
    listener: TcpListener,
    limits: FrameLimits,
}

impl NotifyListener {
    pub async fn bind(port: u16, limits: FrameLimits) -> Result<Self> {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| SyncError::Config(format!("无法绑定通知端口 {}: {}", addr, e)))?;
        Ok(Self {
            listener,
            limits,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self, tx: mpsc::Sender<NotifyMessage>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tokio::spawn(serve_notify(stream, peer, tx.clone(), self.limits));
                    }
                    Err(e) => warn!("通知端口接受连接失败: {}", e),
                },
            }
        }
        debug!("通知监听已停止");
    }
}

async fn serve_notify(
    mut stream: TcpStream,
    peer: SocketAddr,
    tx: mpsc::Sender<NotifyMessage>,
    limits: FrameLimits,
) {
    let response = match read_request(&mut stream, limits).await {
        Ok(Some(request)) if request.method == "POST" && request.path == route::NOTIFY => {
            match serde_json::from_slice::<NotifyMessage>(&request.body) {
                Ok(message) => {
                    debug!("收到推送 {}: {:?}", peer, message);
                    if tx.try_send(message).is_err() {
                        warn!("推送队列已满或已关闭，丢弃来自 {} 的通知", peer);
                    }
                    Response::ok("OK")
                }
                Err(e) => Response::from_error(&SyncError::from(e)),
            }
        }
        Ok(Some(_)) => Response::text(404, "Not Found"),
        Ok(None) => return,
        Err(e) => {
            debug!("无效的推送请求 {}: {}", peer, e);
            Response::from_error(&e)
        }
    };

    if let Err(e) = stream.write_all(&response.encode()).await {
        debug!("推送响应发送失败 {}: {}", peer, e);
    }
    let _ = stream.shutdown().await;
}

/// 非连接层面的错误只记录，连接丢失向上传递
fn escalate(context: &str, result: Result<()>) -> Result<()> {
    match result {
        Err(e) if e.is_liveness_failure() => Err(e),
        Err(e) => {
            warn!("{}: {}", context, e);
            Ok(())
        }
        Ok(()) => Ok(()),
    }
}

/// 同步客户端
pub struct SyncClient {
    settings: SyncSettings,
    roots: RootSet,
    watcher: DirectoryWatcher,
    suppressor: EchoSuppressor,
    listener: Option<NotifyListener>,
    missed_pings: u32,
}

impl SyncClient {
    /// 扫描根目录并绑定通知端口
    pub async fn bind(settings: SyncSettings) -> Result<Self> {
        settings.validate()?;

        let roots = create_storage(&settings.roots)?;
        let scanner = FileScanner::new(&settings.scan_config());
        let mut watcher = DirectoryWatcher::new(&settings.roots, scanner)?;
        watcher.start();

        let listener = NotifyListener::bind(settings.notify_port, settings.frame_limits()).await?;
        let suppressor = EchoSuppressor::new(settings.suppression_ttl());

        Ok(Self {
            settings,
            roots,
            watcher,
            suppressor,
            listener: Some(listener),
            missed_pings: 0,
        })
    }

    pub fn notify_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    fn storage(&self, root_index: usize) -> Result<Arc<dyn Storage>> {
        self.roots
            .get(root_index)
            .cloned()
            .ok_or_else(|| SyncError::protocol(format!("无效的 rootIndex: {}", root_index)))
    }

    /// 主循环，取消后返回
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        let (push_tx, mut push_rx) = mpsc::channel(PUSH_QUEUE);
        let listener_task = self
            .listener
            .take()
            .map(|listener| tokio::spawn(listener.run(push_tx, cancel.child_token())));

        let (fs_tx, mut fs_rx) = mpsc::unbounded_channel();
        if self.settings.live_watch {
            if let Err(e) = self.watcher.attach_notifier(fs_tx.clone()) {
                warn!("文件通知不可用，仅使用定时扫描: {}", e);
            }
        }

        let discovery = DiscoveryClient::new(
            self.settings.broadcast_addr,
            self.settings.discovery_port,
            self.settings.discovery_interval(),
        );

        loop {
            let Some(found) = discovery.discover(&cancel).await? else {
                break;
            };
            let server = SocketAddr::new(found.ip(), self.settings.control_port);

            match self.session(server, &cancel, &mut fs_rx, &mut push_rx).await {
                Ok(()) => break,
                Err(e) if e.is_liveness_failure() => {
                    warn!("与服务器 {} 的连接丢失，重新搜索: {}", server, e);
                }
                Err(e) => {
                    warn!("同步会话中断 {}: {}", server, e);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.settings.discovery_interval()) => {}
                    }
                }
            }
        }

        drop(fs_tx);
        if let Some(task) = listener_task {
            if let Err(e) = task.await {
                warn!("通知监听退出异常: {}", e);
            }
        }
        info!("同步客户端已停止");
        Ok(())
    }

    async fn session(
        &mut self,
        server: SocketAddr,
        cancel: &CancellationToken,
        fs_rx: &mut mpsc::UnboundedReceiver<notify::Event>,
        push_rx: &mut mpsc::Receiver<NotifyMessage>,
    ) -> Result<()> {
        let peer = PeerClient::new(server, self.settings.fetch_timeout())
            .with_max_header_bytes(self.settings.max_header_bytes);
        peer.register().await?;
        self.missed_pings = 0;

        // 上一次会话遗留的推送由完整同步覆盖
        while push_rx.try_recv().is_ok() {}
        self.full_sync(&peer).await?;

        let rescan_period = self.settings.rescan_interval();
        let ping_period = self.settings.ping_interval();
        let mut rescan = interval_at(Instant::now() + rescan_period, rescan_period);
        let mut ping = interval_at(Instant::now() + ping_period, ping_period);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                Some(event) = fs_rx.recv() => {
                    let events = self.watcher.handle_notify(event);
                    self.push_local(&peer, events).await?;
                }
                _ = rescan.tick() => {
                    let events = self.watcher.rescan_async().await;
                    self.watcher.update_watch_set();
                    self.push_local(&peer, events).await?;
                    self.suppressor.sweep();
                }
                _ = ping.tick() => self.ping(&peer).await?,
                Some(message) = push_rx.recv() => {
                    let key = message.key();
                    escalate(&format!("处理推送 {} 失败", key), self.apply_push(&peer, message).await)?;
                }
            }
        }
    }

    async fn ping(&mut self, peer: &PeerClient) -> Result<()> {
        match peer.ping().await {
            Ok(()) => {
                self.missed_pings = 0;
                Ok(())
            }
            Err(e) if e.is_liveness_failure() => Err(e),
            Err(e) => {
                self.missed_pings += 1;
                warn!("ping 失败 ({}/{}): {}", self.missed_pings, MAX_MISSED_PINGS, e);
                if self.missed_pings >= MAX_MISSED_PINGS {
                    return Err(SyncError::ConnectionLost(format!(
                        "{} 连续 {} 次无响应",
                        peer.addr(),
                        self.missed_pings
                    )));
                }
                Ok(())
            }
        }
    }

    /// 上报完整文件表并执行服务器给出的动作
    async fn full_sync(&mut self, peer: &PeerClient) -> Result<()> {
        let report = self.watcher.current_files();
        info!("完整同步: 上报 {} 个文件", report.len());

        let actions = match peer.sync_list(&report, SyncMode::Full).await? {
            SyncListReply::UpToDate | SyncListReply::Accepted => {
                info!("完整同步: 已是最新");
                return Ok(());
            }
            SyncListReply::Actions(actions) => actions,
        };

        let summary = FileComparator::summarize_actions(&actions);
        info!(
            "完整同步: {} 个下载, {} 个上传, {} 个删除",
            summary.download_count, summary.upload_count, summary.delete_count
        );

        for action in actions {
            let key = action.key();
            let result = match action.kind {
                ActionKind::Download => self.fetch_file(peer, &key, None).await.map(|_| ()),
                ActionKind::Upload => self.upload_file(peer, &key).await,
                ActionKind::Delete => self.remove_local(&key).await.map(|_| ()),
            };
            escalate(&format!("同步动作 {:?} {} 失败", action.kind, key), result)?;
        }
        Ok(())
    }

    /// 本地变化：增量提交，被接受后上传
    async fn push_local(&mut self, peer: &PeerClient, events: Vec<WatchEvent>) -> Result<()> {
        for event in events {
            let key = event.key();
            if self.suppressor.consume(&key) {
                continue;
            }

            let result = match &event {
                WatchEvent::Changed(record) => self.push_change(peer, record).await,
                WatchEvent::Removed(record) => self.push_removal(peer, record).await,
            };
            escalate(&format!("上报本地变化 {} 失败", key), result)?;
        }
        Ok(())
    }

    async fn push_change(&mut self, peer: &PeerClient, record: &FileRecord) -> Result<()> {
        let key = record.key();
        match peer.sync_list(std::slice::from_ref(record), SyncMode::Partial).await {
            Ok(_) => self.upload_file(peer, &key).await,
            Err(SyncError::Conflict(reason)) => {
                info!("服务器已有更新版本，放弃上传 {}: {}", key, reason);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn push_removal(&mut self, peer: &PeerClient, record: &FileRecord) -> Result<()> {
        let entry = FileRecord::deleted(record.root_index, record.path.clone(), record.version);
        match peer.sync_list(&[entry], SyncMode::Partial).await {
            Ok(_) => {
                info!("已通知服务器删除: {}", record.key());
                Ok(())
            }
            Err(SyncError::Conflict(reason)) => {
                info!("服务器版本更新，不同步删除 {}: {}", record.key(), reason);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn upload_file(&mut self, peer: &PeerClient, key: &FileKey) -> Result<()> {
        let storage = self.storage(key.root_index)?;
        match peer.upload(storage.as_ref(), key).await {
            Ok(_) => Ok(()),
            Err(SyncError::Conflict(reason)) => {
                info!("上传被拒绝 {}: {}", key, reason);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// 服务器推送：删除或按需下载
    async fn apply_push(&mut self, peer: &PeerClient, message: NotifyMessage) -> Result<()> {
        let key = FileKey::new(message.root_index, sanitize_relative(&message.path)?);
        if message.deleted {
            self.remove_local(&key).await?;
            return Ok(());
        }

        let storage = self.storage(key.root_index)?;
        let local = storage.stat(&key.path).await?.map(|m| m.version);
        if self.fetch_file(peer, &key, local).await?.is_none() {
            debug!("推送的文件无需更新: {}", key);
        }
        Ok(())
    }

    /// 下载前插入抑制键，没有写入时撤销
    async fn fetch_file(
        &mut self,
        peer: &PeerClient,
        key: &FileKey,
        newer_than: Option<u64>,
    ) -> Result<Option<u64>> {
        let storage = self.storage(key.root_index)?;
        self.suppressor.insert(key.clone());
        match peer.download(storage.as_ref(), key, newer_than).await {
            Ok(Some(version)) => Ok(Some(version)),
            Ok(None) => {
                self.suppressor.release(key);
                Ok(None)
            }
            Err(e) => {
                self.suppressor.release(key);
                Err(e)
            }
        }
    }

    /// 删除本地文件，文件不存在时返回 false
    async fn remove_local(&mut self, key: &FileKey) -> Result<bool> {
        let storage = self.storage(key.root_index)?;
        self.suppressor.insert(key.clone());
        match storage.delete(&key.path).await {
            Ok(true) => {
                info!("已删除本地文件: {}", key);
                Ok(true)
            }
            Ok(false) => {
                self.suppressor.release(key);
                Ok(false)
            }
            Err(e) => {
                self.suppressor.release(key);
                Err(e)
            }
        }
    }
}
