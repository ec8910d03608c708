//! 运行模式切换
//!
//! 同一时刻只运行一种模式，切换前先停止当前模式并等待其任务结束。

use crate::config::SyncSettings;
use crate::error::Result;
use crate::net::client::SyncClient;
use crate::net::server::SyncServer;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// 运行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ModeKind {
    Idle,
    Server,
    Client,
}

/// 正在运行的模式任务
pub struct Running {
    cancel: CancellationToken,
    task: JoinHandle<Result<()>>,
    local_addr: Option<SocketAddr>,
}

impl Running {
    fn spawn<F>(local_addr: Option<SocketAddr>, start: impl FnOnce(CancellationToken) -> F) -> Self
    where
        F: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(start(cancel.clone()));
        Self {
            cancel,
            task,
            local_addr,
        }
    }

    async fn stop(self) {
        self.cancel.cancel();
        match self.task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("模式任务退出时出错: {}", e),
            Err(e) => warn!("模式任务异常结束: {}", e),
        }
    }
}

pub enum Mode {
    Idle,
    Server(Running),
    Client(Running),
}

/// 模式控制器
pub struct Controller {
    settings: SyncSettings,
    mode: Mode,
}

impl Controller {
    pub fn new(settings: SyncSettings) -> Self {
        Self {
            settings,
            mode: Mode::Idle,
        }
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub fn kind(&self) -> ModeKind {
        match self.mode {
            Mode::Idle => ModeKind::Idle,
            Mode::Server(_) => ModeKind::Server,
            Mode::Client(_) => ModeKind::Client,
        }
    }

    /// 服务器模式下为控制端口地址，客户端模式下为通知端口地址
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.mode {
            Mode::Idle => None,
            Mode::Server(r) | Mode::Client(r) => r.local_addr,
        }
    }

    /// 停止当前模式并启动新模式；启动失败时停留在 Idle
    pub async fn switch_to(&mut self, kind: ModeKind) -> anyhow::Result<()> {
        self.teardown().await;

        match kind {
            ModeKind::Idle => {}
            ModeKind::Server => {
                let server = SyncServer::bind(self.settings.clone())
                    .await
                    .context("启动服务器失败")?;
                let addr = server.local_addr().ok();
                self.mode = Mode::Server(Running::spawn(addr, |cancel| server.run(cancel)));
            }
            ModeKind::Client => {
                let client = SyncClient::bind(self.settings.clone())
                    .await
                    .context("启动客户端失败")?;
                let addr = client.notify_addr();
                self.mode = Mode::Client(Running::spawn(addr, |cancel| client.run(cancel)));
            }
        }

        info!("当前模式: {:?}", kind);
        Ok(())
    }

    /// 停止当前模式
    pub async fn teardown(&mut self) {
        match std::mem::replace(&mut self.mode, Mode::Idle) {
            Mode::Idle => {}
            Mode::Server(running) => {
                info!("停止服务器模式");
                running.stop().await;
            }
            Mode::Client(running) => {
                info!("停止客户端模式");
                running.stop().await;
            }
        }
    }

    /// 等待当前模式自行结束（Idle 时立即返回）
    pub async fn wait(&mut self) -> anyhow::Result<()> {
        let result = match &mut self.mode {
            Mode::Idle => return Ok(()),
            Mode::Server(running) | Mode::Client(running) => (&mut running.task).await,
        };
        self.mode = Mode::Idle;
        result.context("模式任务异常结束")??;
        Ok(())
    }
}
