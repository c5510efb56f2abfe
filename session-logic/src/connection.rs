//! 连接生命周期管理
//!
//! 持有进程内唯一的 DuplexRpcClient，负责认证握手、断线重连和身份切换。
//! 重连定时器只负责发起连接尝试，每次尝试在独立 task 中运行

use crate::config::ConnectionConfig;
use crate::registry::SessionRegistry;
use host_socket::{
    is_ack, ClientCall, ConnectParams, Connector, DuplexRpcClient, HostEvent, IdentityContext,
    InitializeClientPayload, RpcError, SocketEvent, SocketEventReceiver, SocketEventSender,
    SocketEvents,
};
use serde_json::Value;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// 首次连接中
    Opening,
    /// 已认证且完成初始化握手
    Connected,
    /// 等待重连
    Reconnecting,
    /// 已关闭（终态）
    Closed,
}

#[derive(Default)]
struct Tasks {
    event_loop: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
    host_watch: Option<JoinHandle<()>>,
}

impl Tasks {
    fn abort_all(&mut self) {
        for task in [
            self.event_loop.take(),
            self.reconnect.take(),
            self.host_watch.take(),
        ]
        .into_iter()
        .flatten()
        {
            task.abort();
        }
    }
}

fn is_running(task: &Option<JoinHandle<()>>) -> bool {
    task.as_ref().is_some_and(|task| !task.is_finished())
}

struct ConnectionInner {
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
    registry: Arc<SessionRegistry>,
    client: Arc<DuplexRpcClient>,
    client_id: String,
    identity: parking_lot::RwLock<IdentityContext>,
    /// 当前连接代数，只在 attach_lock 内递增
    generation: AtomicU64,
    consecutive_errors: AtomicU32,
    state: watch::Sender<ConnectionState>,
    events_tx: SocketEventSender,
    events_rx: parking_lot::Mutex<Option<SocketEventReceiver>>,
    attach_lock: tokio::sync::Mutex<()>,
    tasks: parking_lot::Mutex<Tasks>,
}

/// 连接管理器
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ConnectionInner>,
}

impl ConnectionManager {
    pub fn new(
        config: ConnectionConfig,
        connector: Arc<dyn Connector>,
        identity: IdentityContext,
    ) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        let client = Arc::new(DuplexRpcClient::new(registry.clone()));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Opening);

        Self {
            inner: Arc::new(ConnectionInner {
                config,
                connector,
                registry,
                client,
                client_id: uuid::Uuid::new_v4().to_string(),
                identity: parking_lot::RwLock::new(identity),
                generation: AtomicU64::new(0),
                consecutive_errors: AtomicU32::new(0),
                state,
                events_tx,
                events_rx: parking_lot::Mutex::new(Some(events_rx)),
                attach_lock: tokio::sync::Mutex::new(()),
                tasks: parking_lot::Mutex::new(Tasks::default()),
            }),
        }
    }

    /// 启动事件循环并发起首次连接
    pub fn start(&self) {
        let Some(events) = self.inner.events_rx.lock().take() else {
            warn!("[ConnectionManager] Already started");
            return;
        };

        info!("[ConnectionManager] Starting client {}", self.inner.client_id);
        let weak = Arc::downgrade(&self.inner);
        self.inner.tasks.lock().event_loop = Some(tokio::spawn(run_event_loop(weak, events)));
        tokio::spawn(attempt(self.inner.clone()));
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.inner.registry
    }

    pub fn client(&self) -> &Arc<DuplexRpcClient> {
        &self.inner.client
    }

    /// 客户端 ID，重连之间保持不变
    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    pub fn identity(&self) -> IdentityContext {
        self.inner.identity.read().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// 订阅状态变化
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// 等待进入 Connected，连接关闭时返回 false
    pub async fn wait_connected(&self) -> bool {
        let mut rx = self.inner.state.subscribe();
        let state = rx
            .wait_for(|state| matches!(state, ConnectionState::Connected | ConnectionState::Closed))
            .await
            .map(|state| *state);
        matches!(state, Ok(ConnectionState::Connected))
    }

    /// 通过当前连接发送调用
    pub async fn send(&self, call: ClientCall) -> Result<Value, RpcError> {
        self.inner.send(call).await
    }

    /// 更新身份，变化时强制重连
    pub fn set_identity(&self, identity: IdentityContext) {
        {
            let mut current = self.inner.identity.write();
            if *current == identity {
                return;
            }
            *current = identity;
        }

        if self.inner.events_rx.lock().is_some() || self.state() == ConnectionState::Closed {
            return;
        }
        info!("[ConnectionManager] Identity changed, reconnecting");
        self.inner.reconnect_now();
    }

    /// 启动重连定时器（已在运行时不做任何事）
    pub fn start_reconnecting(&self) {
        self.inner.start_reconnecting();
    }

    /// 立即发起一次连接并重置定时器
    pub fn reconnect_now(&self) {
        self.inner.reconnect_now();
    }

    /// 主机上线事件到达且尚未连接时立即重连
    pub fn watch_host_events(&self, mut events: broadcast::Receiver<HostEvent>) {
        let weak = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        let Some(inner) = weak.upgrade() else { break };
                        if !event.is_host_online() {
                            continue;
                        }
                        match inner.state() {
                            ConnectionState::Connected | ConnectionState::Closed => {}
                            _ => {
                                info!(
                                    "[ConnectionManager] Host {} online, reconnecting now",
                                    event.address.as_deref().unwrap_or("?")
                                );
                                inner.reconnect_now();
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("[ConnectionManager] Missed {} host events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        if let Some(previous) = self.inner.tasks.lock().host_watch.replace(task) {
            previous.abort();
        }
    }

    /// 停止所有后台任务并关闭连接
    pub async fn shutdown(&self) {
        info!("[ConnectionManager] Shutting down client {}", self.inner.client_id);
        self.inner.set_state(ConnectionState::Closed);
        self.inner.tasks.lock().abort_all();
        self.inner.client.close().await;
    }
}

impl ConnectionInner {
    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&self, next: ConnectionState) {
        self.state.send_if_modified(|state| {
            if *state == next || *state == ConnectionState::Closed {
                return false;
            }
            info!("[ConnectionManager] {:?} -> {:?}", state, next);
            *state = next;
            true
        });
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    async fn send(self: &Arc<Self>, call: ClientCall) -> Result<Value, RpcError> {
        let result = self.client.send(call).await;
        if let Err(e) = &result {
            if e.is_write_failure() {
                self.record_error(&e.to_string());
            }
        }
        result
    }

    fn start_reconnecting(self: &Arc<Self>) {
        self.schedule_reconnect(false);
    }

    fn reconnect_now(self: &Arc<Self>) {
        self.schedule_reconnect(true);
    }

    fn schedule_reconnect(self: &Arc<Self>, immediate: bool) {
        let mut tasks = self.tasks.lock();
        if self.state() == ConnectionState::Closed {
            return;
        }

        if is_running(&tasks.reconnect) {
            if !immediate {
                debug!("[ConnectionManager] Reconnect timer already running");
                return;
            }
            if let Some(timer) = tasks.reconnect.take() {
                timer.abort();
            }
        }

        self.set_state(ConnectionState::Reconnecting);
        let period = self.config.reconnect_interval;
        tasks.reconnect = Some(tokio::spawn(run_reconnect_timer(
            Arc::downgrade(self),
            period,
            immediate,
        )));
    }

    fn stop_reconnecting(&self) {
        if let Some(timer) = self.tasks.lock().reconnect.take() {
            debug!("[ConnectionManager] Reconnect timer stopped");
            timer.abort();
        }
    }

    fn record_error(self: &Arc<Self>, message: &str) {
        let errors = self.consecutive_errors.fetch_add(1, Ordering::SeqCst) + 1;
        let max = self.config.max_consecutive_errors;
        warn!("[ConnectionManager] Socket error ({}/{}): {}", errors, max, message);

        if errors >= max {
            error!("[ConnectionManager] Too many consecutive errors, forcing reconnect");
            self.consecutive_errors.store(0, Ordering::SeqCst);
            self.start_reconnecting();
        }
    }

    async fn handle_event(self: &Arc<Self>, generation: u64, event: SocketEvent) {
        match event {
            SocketEvent::Open => {
                debug!("[ConnectionManager] Socket #{} open, awaiting authentication", generation);
            }
            SocketEvent::Authenticated => {
                info!("[ConnectionManager] Socket #{} authenticated", generation);
                self.stop_reconnecting();
                self.consecutive_errors.store(0, Ordering::SeqCst);
                // 应答经由事件循环送达，握手不能阻塞事件循环
                tokio::spawn(handshake(self.clone(), generation));
            }
            SocketEvent::Close { code, reason } => {
                warn!("[ConnectionManager] Socket #{} closed ({}): {}", generation, code, reason);
                self.client.detach(generation).await;
                self.start_reconnecting();
            }
            SocketEvent::Error(message) => self.record_error(&message),
            SocketEvent::Message(frame) => {
                self.consecutive_errors.store(0, Ordering::SeqCst);
                self.client.handle_frame(frame).await;
            }
        }
    }
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        self.tasks.get_mut().abort_all();
    }
}

/// 建立一条新连接
async fn attempt(inner: Arc<ConnectionInner>) {
    if inner.state() == ConnectionState::Closed {
        return;
    }

    // 代数递增与安装连接必须有序，否则旧连接可能覆盖新连接
    let (generation, socket) = {
        let _guard = inner.attach_lock.lock().await;
        let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let params = ConnectParams {
            client_id: inner.client_id.clone(),
            identity: inner.identity.read().clone(),
        };
        let socket = inner
            .connector
            .create(params, SocketEvents::new(generation, inner.events_tx.clone()));
        inner.client.set_communicator(socket.clone()).await;
        (generation, socket)
    };

    debug!("[ConnectionManager] Connect attempt #{}", generation);
    if let Err(e) = socket.connect().await {
        warn!("[ConnectionManager] Connect attempt #{} failed: {}", generation, e);
        if inner.is_current(generation) {
            inner.start_reconnecting();
        }
    }
}

/// 认证后的初始化握手
async fn handshake(inner: Arc<ConnectionInner>, generation: u64) {
    let call = ClientCall::InitializeClient(InitializeClientPayload {
        client_id: inner.client_id.clone(),
        identity: inner.identity.read().clone(),
        client_version: inner.config.client_version.clone(),
    });
    let result = inner.send(call).await;

    if !inner.is_current(generation) {
        debug!("[ConnectionManager] Ignoring handshake result of stale socket #{}", generation);
        return;
    }

    match result {
        Ok(ack) if is_ack(&ack) => {
            info!(
                "[ConnectionManager] Client {} initialized on socket #{}",
                inner.client_id, generation
            );
            inner.set_state(ConnectionState::Connected);
        }
        Ok(ack) => {
            warn!("[ConnectionManager] Host rejected INITIALIZE_CLIENT: {}", ack);
            inner.start_reconnecting();
        }
        Err(e) => {
            warn!("[ConnectionManager] Handshake failed: {}", e);
            inner.start_reconnecting();
        }
    }
}

async fn run_event_loop(weak: Weak<ConnectionInner>, mut events: SocketEventReceiver) {
    while let Some((generation, event)) = events.recv().await {
        let Some(inner) = weak.upgrade() else { break };
        if !inner.is_current(generation) {
            debug!("[ConnectionManager] Ignoring event from stale socket #{}", generation);
            continue;
        }
        inner.handle_event(generation, event).await;
    }
    debug!("[ConnectionManager] Event loop stopped");
}

async fn run_reconnect_timer(weak: Weak<ConnectionInner>, period: Duration, immediate: bool) {
    // interval 不接受零周期
    let period = period.max(Duration::from_millis(1));
    let start = if immediate {
        Instant::now()
    } else {
        Instant::now() + period
    };
    let mut ticker = interval_at(start, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let Some(inner) = weak.upgrade() else { break };
        if matches!(inner.state(), ConnectionState::Connected | ConnectionState::Closed) {
            break;
        }
        tokio::spawn(attempt(inner));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{settle, TestHost};
    use host_socket::{HostEventType, OpenTransactionPayload, SessionKey, TransportError};
    use serde_json::json;

    #[tokio::test(start_paused = true)]
    async fn test_handshake_reaches_connected() {
        let mut host = TestHost::new();
        host.manager.start();
        assert_eq!(host.manager.state(), ConnectionState::Opening);

        let mut peer = host.accept().await;
        assert_eq!(peer.params().client_id, host.manager.client_id());

        match peer.accept_handshake().await {
            Some(ClientCall::InitializeClient(payload)) => {
                assert_eq!(payload.client_id, host.manager.client_id());
                assert_eq!(payload.client_version, env!("CARGO_PKG_VERSION"));
            }
            other => panic!("Expected INITIALIZE_CLIENT, got {:?}", other),
        }

        assert!(host.manager.wait_connected().await);
        assert_eq!(host.manager.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_handshake_reconnects() {
        let mut host = TestHost::new();
        host.manager.start();

        let mut peer = host.accept().await;
        peer.open();
        peer.authenticate();
        let (id, _) = peer.next_call().await.unwrap();
        peer.reply(id, json!(false));
        settle().await;

        assert_eq!(host.manager.state(), ConnectionState::Reconnecting);
        let retry = host.accept().await;
        assert_eq!(retry.generation(), peer.generation() + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_reconnects_after_interval_with_same_client_id() {
        let mut host = TestHost::new();
        let first = host.connect().await;

        let dropped_at = Instant::now();
        first.drop_connection(1006, "transport closed");
        settle().await;
        assert_eq!(host.manager.state(), ConnectionState::Reconnecting);

        let mut second = host.accept().await;
        assert!(dropped_at.elapsed() >= Duration::from_millis(2000));
        assert_eq!(second.params().client_id, first.params().client_id);

        second.accept_handshake().await;
        assert!(host.manager.wait_connected().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_timer_runs_once() {
        let mut host = TestHost::new();
        let first = host.connect().await;
        assert_eq!(host.connector.created(), 1);

        host.manager.start_reconnecting();
        host.manager.start_reconnecting();
        host.manager.start_reconnecting();
        tokio::time::sleep(Duration::from_millis(2100)).await;

        assert_eq!(host.connector.created(), 2);
        assert!(first.is_closed_by_client());
    }

    #[tokio::test(start_paused = true)]
    async fn test_consecutive_errors_force_reconnect() {
        let mut host = TestHost::new();
        let peer = host.connect().await;

        peer.error("timeout");
        peer.error("timeout");
        settle().await;
        assert_eq!(host.manager.state(), ConnectionState::Connected);

        peer.error("timeout");
        settle().await;
        assert_eq!(host.manager.state(), ConnectionState::Reconnecting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_traffic_resets_error_count() {
        let mut host = TestHost::new();
        let peer = host.connect().await;

        peer.error("timeout");
        peer.error("timeout");
        peer.push_frame(json!({"type": "response", "id": 424242, "result": null}));
        peer.error("timeout");
        settle().await;
        assert_eq!(host.manager.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_connect_keeps_retrying() {
        let mut host = TestHost::new();
        host.connector.set_refuse(true);
        host.manager.start();

        tokio::time::sleep(Duration::from_millis(4100)).await;
        assert_eq!(host.connector.created(), 3);
        assert_eq!(host.manager.state(), ConnectionState::Reconnecting);
        assert!(host.listener.try_accept().is_none());

        host.connector.set_refuse(false);
        let mut peer = host.accept().await;
        peer.accept_handshake().await;
        assert!(host.manager.wait_connected().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_calls_rejected_on_close() {
        let mut host = TestHost::new();
        let mut peer = host.connect().await;

        let manager = host.manager.clone();
        let call = tokio::spawn(async move {
            manager
                .send(ClientCall::OpenTransaction(OpenTransactionPayload {
                    transaction_id: SessionKey::from("k1"),
                    action_slug: "hello".into(),
                    params: None,
                }))
                .await
        });
        peer.next_call().await.unwrap();
        peer.drop_connection(1006, "gone");

        assert!(matches!(
            call.await.unwrap(),
            Err(RpcError::Transport(TransportError::Closed))
        ));
        assert_eq!(host.manager.client().pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_socket_events_are_ignored() {
        let mut host = TestHost::new();
        let first = host.connect().await;

        host.manager.reconnect_now();
        let mut second = host.accept().await;
        second.accept_handshake().await;
        assert!(host.manager.wait_connected().await);

        first.drop_connection(1006, "late close");
        first.error("late");
        first.error("late");
        first.error("late");
        settle().await;
        assert_eq!(host.manager.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_identity_change_forces_reconnect() {
        let mut host = TestHost::new();
        let first = host.connect().await;

        let same = host.manager.identity();
        host.manager.set_identity(same);
        settle().await;
        assert_eq!(host.connector.created(), 1);

        let identity = IdentityContext {
            user_id: Some("u-2".into()),
            ..Default::default()
        };
        host.manager.set_identity(identity.clone());

        let mut second = host.accept().await;
        assert_eq!(second.params().identity, identity);
        assert!(first.is_closed_by_client());

        match second.accept_handshake().await {
            Some(ClientCall::InitializeClient(payload)) => assert_eq!(payload.identity, identity),
            other => panic!("Expected INITIALIZE_CLIENT, got {:?}", other),
        }
        assert!(host.manager.wait_connected().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_host_online_event_skips_the_wait() {
        let mut host = TestHost::new();
        let (tx, rx) = broadcast::channel(4);
        host.manager.watch_host_events(rx);

        let first = host.connect().await;
        first.drop_connection(1006, "host restarting");
        settle().await;

        let dropped_at = Instant::now();
        tx.send(HostEvent {
            event_type: HostEventType::Online,
            service: "host".into(),
            address: Some("127.0.0.1:4000".into()),
            timestamp: 0,
        })
        .unwrap();

        host.accept().await;
        assert!(dropped_at.elapsed() < Duration::from_millis(2000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_is_terminal() {
        let mut host = TestHost::new();
        let peer = host.connect().await;

        host.manager.shutdown().await;
        assert_eq!(host.manager.state(), ConnectionState::Closed);
        assert!(peer.is_closed_by_client());
        assert!(!host.manager.wait_connected().await);

        host.manager.start_reconnecting();
        tokio::time::sleep(Duration::from_millis(5000)).await;
        assert_eq!(host.connector.created(), 1);
        assert_eq!(host.manager.state(), ConnectionState::Closed);
    }
}
