//! 会话控制器
//!
//! 一个控制器对应一个事务或页面会话：注册处理器、发送打开请求、
//! 提交用户输入，并根据主机推送维护会话状态

use crate::config::SessionConfig;
use crate::connection::{ConnectionManager, ConnectionState};
use crate::error::SessionError;
use crate::registry::SessionHandlers;
use chrono::{DateTime, Utc};
use host_socket::{
    is_ack, ClientCall, HostReconnectedPayload, LoadingStatePayload, NotifyPayload,
    OpenPagePayload, OpenTransactionPayload, RedirectPayload, RenderPayload, RespondPayload,
    RpcError, SessionKey, SessionRef,
};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// 会话界面状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionUiState {
    Idle,
    /// 已发出打开请求，等待主机推送
    Connecting,
    Connected,
    /// 主机要求跳转（终态，只能 restart）
    Redirecting,
    /// 输入未送达且没有等待中的重连，或被接管
    Dropped,
}

/// 会话类型
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionKind {
    Transaction { action_slug: String },
    Page { page_slug: String },
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionKind::Transaction { action_slug } => write!(f, "transaction {}", action_slug),
            SessionKind::Page { page_slug } => write!(f, "page {}", page_slug),
        }
    }
}

/// 打开会话的参数
#[derive(Debug, Clone, PartialEq)]
pub struct SessionParams {
    pub kind: SessionKind,
    /// 透传给主机的外部参数
    pub params: Option<Value>,
}

impl SessionParams {
    pub fn transaction(action_slug: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            kind: SessionKind::Transaction {
                action_slug: action_slug.into(),
            },
            params,
        }
    }

    pub fn page(page_slug: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            kind: SessionKind::Page {
                page_slug: page_slug.into(),
            },
            params,
        }
    }

    fn session_ref(&self, key: &SessionKey) -> SessionRef {
        match self.kind {
            SessionKind::Transaction { .. } => SessionRef::transaction(key.clone()),
            SessionKind::Page { .. } => SessionRef::page(key.clone()),
        }
    }

    fn open_call(&self, key: &SessionKey) -> ClientCall {
        match &self.kind {
            SessionKind::Transaction { action_slug } => {
                ClientCall::OpenTransaction(OpenTransactionPayload {
                    transaction_id: key.clone(),
                    action_slug: action_slug.clone(),
                    params: self.params.clone(),
                })
            }
            SessionKind::Page { page_slug } => ClientCall::OpenPage(OpenPagePayload {
                page_key: key.clone(),
                page_slug: page_slug.clone(),
                params: self.params.clone(),
            }),
        }
    }

    fn leave_call(&self, key: &SessionKey) -> ClientCall {
        match self.kind {
            SessionKind::Transaction { .. } => ClientCall::LeaveTransaction(self.session_ref(key)),
            SessionKind::Page { .. } => ClientCall::ClosePage(self.session_ref(key)),
        }
    }
}

/// 状态迁移记录
#[derive(Debug, Clone, PartialEq)]
pub struct SessionTransition {
    pub from: SessionUiState,
    pub to: SessionUiState,
    pub key: SessionKey,
    pub at: DateTime<Utc>,
}

/// 会话控制器，释放时注销处理器并停止重试
pub struct SessionController {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    connection: ConnectionManager,
    params: SessionParams,
    config: SessionConfig,
    view: Arc<dyn SessionHandlers>,
    /// 注册表只持有它的弱引用
    handlers: Arc<dyn SessionHandlers>,
    key: parking_lot::RwLock<SessionKey>,
    state: watch::Sender<SessionUiState>,
    transitions: broadcast::Sender<SessionTransition>,
    open_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    reconnect_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    /// 主机通过 HOST_RECONNECTED 接回会话时所在的连接
    reattached_on: parking_lot::Mutex<Option<u64>>,
    usurped: AtomicBool,
    closed: AtomicBool,
}

impl SessionController {
    /// 以新 Key 打开会话，`view` 接收主机推送
    pub fn open(
        connection: &ConnectionManager,
        params: SessionParams,
        config: SessionConfig,
        view: Arc<dyn SessionHandlers>,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<SessionInner>| {
            let (state, _) = watch::channel(SessionUiState::Idle);
            let (transitions, _) = broadcast::channel(32);
            SessionInner {
                connection: connection.clone(),
                params,
                config,
                view,
                handlers: Arc::new(ControllerHandlers {
                    inner: weak.clone(),
                }),
                key: parking_lot::RwLock::new(SessionKey::generate()),
                state,
                transitions,
                open_task: parking_lot::Mutex::new(None),
                reconnect_task: parking_lot::Mutex::new(None),
                reattached_on: parking_lot::Mutex::new(None),
                usurped: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }
        });

        let key = inner.key();
        info!("[Session] Opening {} as {}", inner.params.kind, key);
        inner.connection.registry().register(key, &inner.handlers);
        inner.transition(SessionUiState::Connecting, false);
        inner.spawn_open();
        inner.spawn_reconnect_watch();

        Self { inner }
    }

    /// 提交用户输入
    ///
    /// 送达失败或主机拒绝时以新 Key 重新打开。连接正在重建时进入 Connecting，
    /// 否则进入 Dropped。Redirecting 下不再接受输入
    pub async fn respond(&self, values: Value) -> bool {
        let inner = &self.inner;
        if !inner.is_active() || inner.ui_state() == SessionUiState::Redirecting {
            warn!("[Session] Ignoring response for inactive session {}", inner.key());
            return false;
        }

        let key = inner.key();
        let call = ClientCall::RespondToIoCall(RespondPayload {
            session: inner.params.session_ref(&key),
            values,
        });

        let error = match inner.connection.send(call).await {
            Ok(ack) if is_ack(&ack) => return true,
            Ok(_) => SessionError::Rejected { key },
            Err(source) => SessionError::Delivery { key, source },
        };

        let reconnecting = matches!(
            error,
            SessionError::Delivery {
                source: RpcError::Transport(_),
                ..
            }
        ) && inner.connection.state() != ConnectionState::Connected;

        warn!("[Session] {}, starting over", error);
        if reconnecting {
            inner.transition(SessionUiState::Connecting, false);
        } else {
            inner.transition(SessionUiState::Dropped, false);
        }
        inner.rekey();
        inner.spawn_open();
        false
    }

    /// 以新 Key 重新运行会话
    pub fn restart(&self) {
        let inner = &self.inner;
        if inner.closed.load(Ordering::SeqCst) {
            return;
        }

        let was_usurped = inner.usurped.swap(false, Ordering::SeqCst);
        let previous = inner.key();
        let next = inner.rekey();
        info!("[Session] Restarting {} as {}", inner.params.kind, next);
        if !was_usurped {
            inner.send_leave(previous);
        }
        inner.transition(SessionUiState::Connecting, true);
        inner.spawn_open();
    }

    /// 关闭会话（幂等）
    pub fn close(&self) {
        self.inner.close();
    }

    pub fn state(&self) -> SessionUiState {
        self.inner.ui_state()
    }

    pub fn key(&self) -> SessionKey {
        self.inner.key()
    }

    pub fn params(&self) -> &SessionParams {
        &self.inner.params
    }

    /// 订阅状态迁移
    pub fn subscribe(&self) -> broadcast::Receiver<SessionTransition> {
        self.inner.transitions.subscribe()
    }

    /// 观察当前状态
    pub fn watch(&self) -> watch::Receiver<SessionUiState> {
        self.inner.state.subscribe()
    }

    /// 是否已被另一实例接管
    pub fn is_usurped(&self) -> bool {
        self.inner.usurped.load(Ordering::SeqCst)
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.inner.close();
    }
}

impl SessionInner {
    fn key(&self) -> SessionKey {
        self.key.read().clone()
    }

    fn is_active(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && !self.usurped.load(Ordering::SeqCst)
    }

    fn ui_state(&self) -> SessionUiState {
        *self.state.borrow()
    }

    /// 状态迁移，Redirecting 只能通过 `force` 离开
    fn transition(&self, next: SessionUiState, force: bool) {
        let mut from = None;
        self.state.send_if_modified(|state| {
            if *state == next || (*state == SessionUiState::Redirecting && !force) {
                return false;
            }
            from = Some(*state);
            *state = next;
            true
        });

        if let Some(from) = from {
            let key = self.key();
            info!("[Session] {} {:?} -> {:?}", key, from, next);
            let _ = self.transitions.send(SessionTransition {
                from,
                to: next,
                key,
                at: Utc::now(),
            });
        }
    }

    /// 切换到指定 Key，返回旧 Key
    fn swap_key(&self, next: SessionKey) -> SessionKey {
        let previous = std::mem::replace(&mut *self.key.write(), next.clone());
        let registry = self.connection.registry();
        registry.unregister(&previous);
        registry.register(next.clone(), &self.handlers);
        debug!("[Session] Key {} -> {}", previous, next);
        previous
    }

    /// 生成新 Key，旧 Key 不再使用
    fn rekey(&self) -> SessionKey {
        let next = SessionKey::generate();
        self.swap_key(next.clone());
        next
    }

    fn spawn_open(self: &Arc<Self>) {
        let task = tokio::spawn(run_open_loop(Arc::downgrade(self)));
        if let Some(previous) = self.open_task.lock().replace(task) {
            previous.abort();
        }
    }

    fn stop_open(&self) {
        if let Some(task) = self.open_task.lock().take() {
            task.abort();
        }
    }

    fn open_pending(&self) -> bool {
        self.open_task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    fn spawn_reconnect_watch(self: &Arc<Self>) {
        let task = tokio::spawn(run_reconnect_watch(
            Arc::downgrade(self),
            self.connection.subscribe(),
        ));
        if let Some(previous) = self.reconnect_task.lock().replace(task) {
            previous.abort();
        }
    }

    /// 连接重建后以当前 Key 重新发送打开请求
    fn reopen_after_reconnect(self: &Arc<Self>, socket: Option<u64>) {
        if !self.is_active() || self.ui_state() == SessionUiState::Redirecting {
            return;
        }
        if *self.reattached_on.lock() == socket {
            return;
        }
        // 仍在运行的打开循环会在连接恢复后自行发送
        if self.open_pending() {
            return;
        }

        let key = self.key();
        let registry = self.connection.registry();
        if !registry.contains(&key) {
            registry.register(key.clone(), &self.handlers);
        }
        info!("[Session] Connection restored, reopening {}", key);
        self.spawn_open();
    }

    fn send_leave(&self, key: SessionKey) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!("[Session] No runtime, skipping leave for {}", key);
            return;
        };

        let connection = self.connection.clone();
        let call = self.params.leave_call(&key);
        runtime.spawn(async move {
            if let Err(e) = connection.send(call).await {
                debug!("[Session] Leave for {} not delivered: {}", key, e);
            }
        });
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.stop_open();
        if let Some(task) = self.reconnect_task.lock().take() {
            task.abort();
        }
        let key = self.key();
        self.connection.registry().unregister(&key);
        info!("[Session] Closed {}", key);

        if !self.usurped.load(Ordering::SeqCst) {
            self.send_leave(key);
        }
    }
}

/// 打开循环：等待连接、发送打开请求，失败时换 Key 后重试
async fn run_open_loop(weak: Weak<SessionInner>) {
    loop {
        let Some(inner) = weak.upgrade() else { return };
        if !inner.connection.wait_connected().await {
            debug!("[Session] Connection closed, giving up on {}", inner.key());
            return;
        }

        let key = inner.key();
        let error = match inner.connection.send(inner.params.open_call(&key)).await {
            Ok(ack) if is_ack(&ack) => {
                info!("[Session] Host accepted {} ({})", key, inner.params.kind);
                return;
            }
            Ok(ack) => SessionError::Open {
                key,
                reason: format!("host answered {}", ack),
            },
            Err(e) => SessionError::Open {
                key,
                reason: e.to_string(),
            },
        };

        if !inner.is_active() {
            return;
        }
        let next = inner.rekey();
        warn!(
            "[Session] {}, retrying as {} in {}ms",
            error,
            next,
            inner.config.retry_delay.as_millis()
        );

        let delay = inner.config.retry_delay;
        drop(inner);
        tokio::time::sleep(delay).await;
    }
}

/// 跟随连接状态：每换一条新连接进入 Connected，就重新打开会话
///
/// 首次连接由打开循环负责，这里只处理之后的重连
async fn run_reconnect_watch(
    weak: Weak<SessionInner>,
    mut state: watch::Receiver<ConnectionState>,
) {
    let mut last_socket = None;
    loop {
        let current = *state.borrow_and_update();
        match current {
            ConnectionState::Closed => return,
            ConnectionState::Connected => {
                let Some(inner) = weak.upgrade() else { return };
                let socket = inner.connection.client().generation();
                if last_socket.is_some() && socket != last_socket {
                    inner.reopen_after_reconnect(socket);
                }
                last_socket = socket;
            }
            ConnectionState::Opening | ConnectionState::Reconnecting => {}
        }

        if state.changed().await.is_err() {
            return;
        }
    }
}

/// 注册到注册表的处理器，更新会话状态后转发给 view
struct ControllerHandlers {
    inner: Weak<SessionInner>,
}

impl ControllerHandlers {
    fn active(&self) -> Option<Arc<SessionInner>> {
        self.inner
            .upgrade()
            .filter(|inner| !inner.closed.load(Ordering::SeqCst))
    }
}

impl SessionHandlers for ControllerHandlers {
    fn on_render(&self, payload: RenderPayload) {
        let Some(inner) = self.active() else { return };
        inner.transition(SessionUiState::Connected, false);
        inner.view.on_render(payload);
    }

    fn on_loading_state(&self, payload: LoadingStatePayload) {
        let Some(inner) = self.active() else { return };
        inner.transition(SessionUiState::Connected, false);
        inner.view.on_loading_state(payload);
    }

    fn on_redirect(&self, payload: RedirectPayload) {
        let Some(inner) = self.active() else { return };
        inner.stop_open();
        inner.transition(SessionUiState::Redirecting, false);
        inner.view.on_redirect(payload);
    }

    fn on_notify(&self, payload: NotifyPayload) {
        let Some(inner) = self.active() else { return };
        inner.view.on_notify(payload);
    }

    fn on_host_reconnected(&self, payload: HostReconnectedPayload) {
        let Some(inner) = self.active() else { return };
        // 主机已接回会话，不再需要打开请求
        inner.stop_open();
        *inner.reattached_on.lock() = inner.connection.client().generation();
        if let Some(next) = payload.session.key() {
            if *next != inner.key() {
                let previous = inner.swap_key(next.clone());
                info!("[Session] Host reconnected, {} continues as {}", previous, next);
            }
        }
        inner.transition(SessionUiState::Connected, false);
        inner.view.on_host_reconnected(payload);
    }

    fn on_host_closed_unexpectedly(&self, session: SessionRef) {
        let Some(inner) = self.active() else { return };
        warn!("[Session] Host closed {} unexpectedly", inner.key());
        inner.view.on_host_closed_unexpectedly(session);
    }

    fn on_usurped(&self, session: SessionRef) {
        let Some(inner) = self.active() else { return };
        warn!("[Session] {} usurped by another client", inner.key());
        inner.usurped.store(true, Ordering::SeqCst);
        inner.stop_open();
        inner.transition(SessionUiState::Dropped, false);
        inner.connection.registry().unregister(&inner.key());
        inner.view.on_usurped(session);
    }
}
