//! Socket 包装层抽象
//!
//! 一个 `Communicator` 对应一条物理连接。生命周期事件通过
//! `(generation, SocketEvent)` channel 交给上层，旧连接的事件按 generation 过滤

use crate::error::SocketError;
use crate::protocol::IdentityContext;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// 连接生命周期事件
#[derive(Debug, Clone, PartialEq)]
pub enum SocketEvent {
    Open,
    Authenticated,
    Close { code: u16, reason: String },
    Error(String),
    Message(Value),
}

pub type SocketEventSender = mpsc::UnboundedSender<(u64, SocketEvent)>;
pub type SocketEventReceiver = mpsc::UnboundedReceiver<(u64, SocketEvent)>;

/// 单条连接的事件发射器
///
/// `authenticated` 与 `close` 为边沿触发，每个连接实例最多发出一次
#[derive(Clone)]
pub struct SocketEvents {
    generation: u64,
    tx: SocketEventSender,
    authenticated: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
}

impl SocketEvents {
    pub fn new(generation: u64, tx: SocketEventSender) -> Self {
        Self {
            generation,
            tx,
            authenticated: Arc::new(AtomicBool::new(false)),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn open(&self) {
        self.emit(SocketEvent::Open);
    }

    pub fn authenticated(&self) {
        if self.authenticated.swap(true, Ordering::SeqCst) {
            debug!("[Socket#{}] Duplicate authenticated event ignored", self.generation);
            return;
        }
        self.emit(SocketEvent::Authenticated);
    }

    pub fn close(&self, code: u16, reason: impl Into<String>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.emit(SocketEvent::Close {
            code,
            reason: reason.into(),
        });
    }

    pub fn error(&self, message: impl Into<String>) {
        self.emit(SocketEvent::Error(message.into()));
    }

    pub fn message(&self, frame: Value) {
        self.emit(SocketEvent::Message(frame));
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn emit(&self, event: SocketEvent) {
        // 接收端已关闭说明 ConnectionManager 已停止，直接丢弃
        let _ = self.tx.send((self.generation, event));
    }
}

/// 连接握手参数（客户端身份在重连之间保持不变）
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub client_id: String,
    pub identity: IdentityContext,
}

/// 单条物理连接
#[async_trait]
pub trait Communicator: Send + Sync {
    /// 所属连接代数
    fn generation(&self) -> u64;

    /// 建立连接，握手失败返回 `SocketError::ConnectionFailed`
    async fn connect(&self) -> Result<(), SocketError>;

    /// 写出一帧
    async fn send(&self, frame: Value) -> Result<(), SocketError>;

    /// 关闭连接（幂等）
    async fn close(&self);
}

/// 构造新连接，不做任何 IO
pub trait Connector: Send + Sync {
    fn create(&self, params: ConnectParams, events: SocketEvents) -> Arc<dyn Communicator>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_authenticated_fires_once_per_connection() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let events = SocketEvents::new(3, tx);

        events.open();
        events.authenticated();
        events.clone().authenticated();
        events.message(json!({"type": "response", "id": 1}));

        assert_eq!(rx.try_recv().unwrap(), (3, SocketEvent::Open));
        assert_eq!(rx.try_recv().unwrap(), (3, SocketEvent::Authenticated));
        assert!(matches!(rx.try_recv().unwrap(), (3, SocketEvent::Message(_))));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_close_is_edge_triggered() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let events = SocketEvents::new(1, tx);

        events.close(1006, "gone");
        events.close(1000, "again");
        assert!(events.is_closed());

        assert_eq!(
            rx.try_recv().unwrap(),
            (1, SocketEvent::Close { code: 1006, reason: "gone".into() })
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_connect_params_auth_shape() {
        let params = ConnectParams {
            client_id: "c-1".into(),
            identity: IdentityContext {
                user_id: Some("u".into()),
                ..Default::default()
            },
        };
        assert_eq!(
            serde_json::to_value(&params).unwrap(),
            json!({"clientId": "c-1", "identity": {"userId": "u"}})
        );
    }
}
