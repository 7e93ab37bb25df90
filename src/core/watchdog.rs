//! 连接超时看门狗
//!
//! 在发起连接前启动一个计时任务，超时后若连接仍未完成，则通过取消令牌
//! 通知连接方放弃。连接状态只允许从 `NotConnected` 迁移一次，先迁移者决定结果。

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    NotConnected,
    Connected,
    /// 连接调用已返回但未连上
    Failed,
    /// 看门狗已触发
    TimedOut,
}

impl ConnectionStatus {
    fn as_u8(self) -> u8 {
        match self {
            ConnectionStatus::NotConnected => 0,
            ConnectionStatus::Connected => 1,
            ConnectionStatus::Failed => 2,
            ConnectionStatus::TimedOut => 3,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionStatus::Connected,
            2 => ConnectionStatus::Failed,
            3 => ConnectionStatus::TimedOut,
            _ => ConnectionStatus::NotConnected,
        }
    }
}

pub struct ConnectionWatchdog {
    timeout: Duration,
    status: Arc<AtomicU8>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl ConnectionWatchdog {
    /// 启动看门狗；超时为 0 时不计时
    pub fn start(timeout: Duration) -> Self {
        let status = Arc::new(AtomicU8::new(ConnectionStatus::NotConnected.as_u8()));
        let cancel = CancellationToken::new();

        let handle = if timeout.is_zero() {
            debug!("连接超时为 0，不启动看门狗");
            None
        } else {
            let status = status.clone();
            let cancel = cancel.clone();
            Some(tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let fired = status
                    .compare_exchange(
                        ConnectionStatus::NotConnected.as_u8(),
                        ConnectionStatus::TimedOut.as_u8(),
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    )
                    .is_ok();
                if fired {
                    warn!("连接在 {}ms 内未完成，取消连接", timeout.as_millis());
                    cancel.cancel();
                }
            }))
        };

        Self {
            timeout,
            status,
            cancel,
            handle,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// 交给连接调用的取消令牌
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    /// 记录连接成功，返回最终状态（看门狗已触发时为 `TimedOut`）
    pub fn mark_connected(&self) -> ConnectionStatus {
        self.transition(ConnectionStatus::Connected)
    }

    /// 记录连接失败，返回最终状态（看门狗已触发时为 `TimedOut`）
    pub fn mark_failed(&self) -> ConnectionStatus {
        self.transition(ConnectionStatus::Failed)
    }

    fn transition(&self, to: ConnectionStatus) -> ConnectionStatus {
        match self.status.compare_exchange(
            ConnectionStatus::NotConnected.as_u8(),
            to.as_u8(),
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => to,
            Err(current) => ConnectionStatus::from_u8(current),
        }
    }

    /// 停止计时任务，返回停止时的状态
    pub fn stop(mut self) -> ConnectionStatus {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
        self.status()
    }
}

impl Drop for ConnectionWatchdog {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
