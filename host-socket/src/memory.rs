//! 内存连接
//!
//! 不经过网络的 `Connector` 实现，`MemoryPeer` 扮演主机一侧，
//! 用于测试以及把主机嵌入同一进程的场景

use crate::error::SocketError;
use crate::protocol::{ClientCall, Envelope, HostCall};
use crate::socket::{Communicator, ConnectParams, Connector, SocketEvents};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// 内存连接工厂
pub struct MemoryConnector {
    peers: mpsc::UnboundedSender<MemoryPeer>,
    created: AtomicUsize,
    refuse: AtomicBool,
}

/// 接收客户端建立的连接
pub struct MemoryListener {
    peers: mpsc::UnboundedReceiver<MemoryPeer>,
}

impl MemoryConnector {
    pub fn new() -> (Arc<Self>, MemoryListener) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            peers: tx,
            created: AtomicUsize::new(0),
            refuse: AtomicBool::new(false),
        });
        (connector, MemoryListener { peers: rx })
    }

    /// 已构造的连接数量
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// 之后的 connect() 是否直接失败
    pub fn set_refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }
}

impl Connector for MemoryConnector {
    fn create(&self, params: ConnectParams, events: SocketEvents) -> Arc<dyn Communicator> {
        self.created.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        let peer = MemoryPeer {
            params: params.clone(),
            events: events.clone(),
            outbound: rx,
            closed: closed.clone(),
            next_id: 1_000_000,
        };

        Arc::new(MemorySocket {
            events,
            outbound: tx,
            peer: parking_lot::Mutex::new(Some(peer)),
            peers: self.peers.clone(),
            refuse: self.refuse.load(Ordering::SeqCst),
            connected: AtomicBool::new(false),
            closed,
        })
    }
}

impl MemoryListener {
    /// 等待下一条连接
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.peers.recv().await
    }

    pub fn try_accept(&mut self) -> Option<MemoryPeer> {
        self.peers.try_recv().ok()
    }
}

struct MemorySocket {
    events: SocketEvents,
    outbound: mpsc::UnboundedSender<Value>,
    peer: parking_lot::Mutex<Option<MemoryPeer>>,
    peers: mpsc::UnboundedSender<MemoryPeer>,
    refuse: bool,
    connected: AtomicBool,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl Communicator for MemorySocket {
    fn generation(&self) -> u64 {
        self.events.generation()
    }

    async fn connect(&self) -> Result<(), SocketError> {
        if self.refuse {
            return Err(SocketError::ConnectionFailed("connection refused".into()));
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(SocketError::Closed);
        }

        let peer = self.peer.lock().take().ok_or_else(|| {
            SocketError::ConnectionFailed("socket already connected".into())
        })?;
        self.peers
            .send(peer)
            .map_err(|_| SocketError::ConnectionFailed("listener dropped".into()))?;

        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, frame: Value) -> Result<(), SocketError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SocketError::Closed);
        }
        if !self.connected.load(Ordering::SeqCst) {
            return Err(SocketError::NotConnected);
        }
        self.outbound
            .send(frame)
            .map_err(|_| SocketError::EmitFailed("peer dropped".into()))
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("[Memory#{}] Socket closed by client", self.events.generation());
        }
    }
}

/// 主机一侧的连接端点
pub struct MemoryPeer {
    params: ConnectParams,
    events: SocketEvents,
    outbound: mpsc::UnboundedReceiver<Value>,
    closed: Arc<AtomicBool>,
    next_id: u64,
}

impl MemoryPeer {
    pub fn generation(&self) -> u64 {
        self.events.generation()
    }

    /// 客户端握手参数
    pub fn params(&self) -> &ConnectParams {
        &self.params
    }

    /// 客户端是否已关闭这条连接
    pub fn is_closed_by_client(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn open(&self) {
        self.events.open();
    }

    pub fn authenticate(&self) {
        self.events.authenticated();
    }

    /// 模拟连接断开
    pub fn drop_connection(&self, code: u16, reason: &str) {
        self.events.close(code, reason);
    }

    pub fn error(&self, message: &str) {
        self.events.error(message);
    }

    /// 推送原始帧
    pub fn push_frame(&self, frame: Value) {
        self.events.message(frame);
    }

    pub fn push(&self, envelope: &Envelope) {
        if let Ok(frame) = envelope.to_frame() {
            self.push_frame(frame);
        }
    }

    /// 发起主机调用，返回关联 ID
    pub fn call(&mut self, call: &HostCall) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        if let Ok(envelope) = Envelope::host_call(id, call) {
            self.push(&envelope);
        }
        id
    }

    /// 回复客户端请求
    pub fn reply(&self, id: u64, result: Value) {
        self.push(&Envelope::Response { id, result });
    }

    pub fn fail(&self, id: u64, error: &str) {
        self.push(&Envelope::Failure {
            id,
            error: error.to_string(),
        });
    }

    /// 读取客户端写出的下一帧
    pub async fn next_envelope(&mut self) -> Option<Envelope> {
        let frame = self.outbound.recv().await?;
        Envelope::from_frame(frame).ok()
    }

    /// 读取客户端发起的下一个调用，跳过对主机调用的应答
    pub async fn next_call(&mut self) -> Option<(u64, ClientCall)> {
        loop {
            if let Envelope::Call { id, method, payload } = self.next_envelope().await? {
                if let Ok(call) = ClientCall::decode(&method, payload) {
                    return Some((id, call));
                }
            }
        }
    }

    /// 等待对指定主机调用的应答
    pub async fn next_ack(&mut self, id: u64) -> Option<Value> {
        loop {
            match self.next_envelope().await? {
                Envelope::Response { id: got, result } if got == id => return Some(result),
                _ => continue,
            }
        }
    }

    /// 完成认证并应答初始化握手
    pub async fn accept_handshake(&mut self) -> Option<ClientCall> {
        self.open();
        self.authenticate();
        let (id, call) = self.next_call().await?;
        if matches!(call, ClientCall::InitializeClient(_)) {
            self.reply(id, Value::Bool(true));
        }
        Some(call)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::IdentityContext;
    use crate::socket::SocketEvent;
    use serde_json::json;

    fn params() -> ConnectParams {
        ConnectParams {
            client_id: "client-1".into(),
            identity: IdentityContext::default(),
        }
    }

    #[tokio::test]
    async fn test_connect_hands_peer_to_listener() {
        let (connector, mut listener) = MemoryConnector::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let socket = connector.create(params(), SocketEvents::new(1, tx));
        assert!(matches!(socket.send(json!({})).await, Err(SocketError::NotConnected)));

        socket.connect().await.unwrap();
        let mut peer = listener.accept().await.unwrap();
        assert_eq!(peer.params().client_id, "client-1");
        assert_eq!(connector.created(), 1);

        socket
            .send(Envelope::Response { id: 1, result: json!(true) }.to_frame().unwrap())
            .await
            .unwrap();
        assert_eq!(
            peer.next_envelope().await,
            Some(Envelope::Response { id: 1, result: json!(true) })
        );

        peer.authenticate();
        assert_eq!(rx.recv().await, Some((1, SocketEvent::Authenticated)));

        socket.close().await;
        assert!(peer.is_closed_by_client());
        assert!(matches!(socket.send(json!({})).await, Err(SocketError::Closed)));
    }

    #[tokio::test]
    async fn test_refused_connect() {
        let (connector, mut listener) = MemoryConnector::new();
        connector.set_refuse(true);
        let (tx, _rx) = mpsc::unbounded_channel();

        let socket = connector.create(params(), SocketEvents::new(1, tx));
        assert!(matches!(
            socket.connect().await,
            Err(SocketError::ConnectionFailed(_))
        ));
        assert!(listener.try_accept().is_none());
    }
}
