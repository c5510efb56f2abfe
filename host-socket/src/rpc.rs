//! 双向 RPC 客户端
//!
//! 出站：按关联 ID 等待主机应答。入站：解码主机调用并交给 `CallDispatcher`。
//! 不做任何重试，重试策略属于 ConnectionManager / SessionController

use crate::error::{RpcError, TransportError};
use crate::protocol::{ClientCall, Envelope, HostCall};
use crate::socket::Communicator;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

/// 入站调用的分发目标
pub trait CallDispatcher: Send + Sync {
    /// 返回 false 表示没有会话接收该调用（已丢弃）
    fn dispatch(&self, call: HostCall) -> bool;
}

/// 等待应答的出站调用
struct PendingCall {
    method: &'static str,
    issued_at: DateTime<Utc>,
    tx: oneshot::Sender<Result<Value, RpcError>>,
}

impl PendingCall {
    fn reject(self, error: TransportError) {
        let _ = self.tx.send(Err(error.into()));
    }
}

#[derive(Default)]
struct RpcState {
    communicator: Option<Arc<dyn Communicator>>,
    pending: HashMap<u64, PendingCall>,
}

/// 双向 RPC 客户端
pub struct DuplexRpcClient {
    state: parking_lot::Mutex<RpcState>,
    next_id: AtomicU64,
    dispatcher: Arc<dyn CallDispatcher>,
}

impl DuplexRpcClient {
    pub fn new(dispatcher: Arc<dyn CallDispatcher>) -> Self {
        Self {
            state: parking_lot::Mutex::new(RpcState::default()),
            next_id: AtomicU64::new(1),
            dispatcher,
        }
    }

    /// 发送调用并等待应答
    ///
    /// 没有请求超时：交互会话可能等待任意长的人工输入
    pub async fn send(&self, call: ClientCall) -> Result<Value, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let method = call.method();
        let frame = Envelope::client_call(id, &call)?.to_frame()?;
        let (tx, rx) = oneshot::channel();

        // 登记与读取当前连接在同一把锁内完成，set_communicator 不会漏掉这次调用
        let communicator = {
            let mut state = self.state.lock();
            let communicator = state
                .communicator
                .clone()
                .ok_or(TransportError::NotConnected)?;
            state.pending.insert(
                id,
                PendingCall {
                    method,
                    issued_at: Utc::now(),
                    tx,
                },
            );
            communicator
        };

        debug!("[DuplexRpc] -> {} #{}", method, id);
        if let Err(e) = communicator.send(frame).await {
            self.state.lock().pending.remove(&id);
            warn!("[DuplexRpc] Failed to write {} #{}: {}", method, id, e);
            return Err(TransportError::Socket(e).into());
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Closed.into()),
        }
    }

    /// 替换底层连接
    ///
    /// 替换前发出且未应答的调用全部以 `Superseded` 拒绝，调用方需显式重试
    pub async fn set_communicator(&self, communicator: Arc<dyn Communicator>) {
        debug!("[DuplexRpc] Attaching socket #{}", communicator.generation());
        self.swap(Some(communicator), None, false).await;
    }

    /// 指定代数的连接关闭后卸下它，未应答的调用以 `Closed` 拒绝
    ///
    /// 已被新连接替换时不做任何事
    pub async fn detach(&self, generation: u64) {
        self.swap(None, Some(generation), true).await;
    }

    /// 无条件卸下当前连接
    pub async fn close(&self) {
        self.swap(None, None, true).await;
    }

    async fn swap(
        &self,
        next: Option<Arc<dyn Communicator>>,
        expected: Option<u64>,
        closing: bool,
    ) {
        let reason = || {
            if closing {
                TransportError::Closed
            } else {
                TransportError::Superseded
            }
        };

        let (previous, drained) = {
            let mut state = self.state.lock();
            if let Some(expected) = expected {
                let attached = state.communicator.as_ref().map(|c| c.generation());
                if attached != Some(expected) {
                    debug!("[DuplexRpc] Socket #{} already replaced, nothing to detach", expected);
                    return;
                }
            }
            let previous = std::mem::replace(&mut state.communicator, next);
            let drained: Vec<(u64, PendingCall)> = state.pending.drain().collect();
            (previous, drained)
        };

        if !drained.is_empty() {
            warn!(
                "[DuplexRpc] Rejecting {} in-flight call(s): {}",
                drained.len(),
                reason()
            );
        }
        for (id, pending) in drained {
            debug!(
                "[DuplexRpc] {} #{} rejected after {}ms",
                pending.method,
                id,
                (Utc::now() - pending.issued_at).num_milliseconds()
            );
            pending.reject(reason());
        }

        if let Some(previous) = previous {
            previous.close().await;
        }
    }

    /// 当前连接代数
    pub fn generation(&self) -> Option<u64> {
        self.state.lock().communicator.as_ref().map(|c| c.generation())
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// 处理一条入站帧，任何错误都只记录日志，不会传回传输循环
    pub async fn handle_frame(&self, frame: Value) {
        let envelope = match Envelope::from_frame(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!("[DuplexRpc] Dropping malformed frame: {}", e);
                return;
            }
        };

        match envelope {
            Envelope::Response { id, result } => self.resolve(id, Ok(result)),
            Envelope::Failure { id, error } => {
                let method = self.pending_method(id).unwrap_or("UNKNOWN");
                self.resolve(
                    id,
                    Err(RpcError::Remote {
                        method: method.to_string(),
                        message: error,
                    }),
                );
            }
            Envelope::Call { id, method, payload } => match HostCall::decode(&method, payload) {
                Ok(call) => {
                    let handled = self.dispatcher.dispatch(call);
                    self.reply(Envelope::Response {
                        id,
                        result: Value::Bool(handled),
                    })
                    .await;
                }
                Err(e) => {
                    error!("[DuplexRpc] Dropping host call {} #{}: {}", method, id, e);
                    self.reply(Envelope::Failure {
                        id,
                        error: e.to_string(),
                    })
                    .await;
                }
            },
        }
    }

    fn pending_method(&self, id: u64) -> Option<&'static str> {
        self.state.lock().pending.get(&id).map(|p| p.method)
    }

    fn resolve(&self, id: u64, result: Result<Value, RpcError>) {
        let pending = self.state.lock().pending.remove(&id);
        match pending {
            Some(pending) => {
                debug!(
                    "[DuplexRpc] <- {} #{} ({}ms)",
                    pending.method,
                    id,
                    (Utc::now() - pending.issued_at).num_milliseconds()
                );
                // 调用方已放弃等待时忽略
                let _ = pending.tx.send(result);
            }
            None => debug!("[DuplexRpc] No pending call #{}, reply ignored", id),
        }
    }

    async fn reply(&self, envelope: Envelope) {
        let communicator = self.state.lock().communicator.clone();
        let Some(communicator) = communicator else {
            debug!("[DuplexRpc] No socket for reply #{}", envelope.id());
            return;
        };

        let frame = match envelope.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                error!("[DuplexRpc] Failed to encode reply: {}", e);
                return;
            }
        };
        if let Err(e) = communicator.send(frame).await {
            warn!("[DuplexRpc] Failed to acknowledge #{}: {}", envelope.id(), e);
        }
    }
}
