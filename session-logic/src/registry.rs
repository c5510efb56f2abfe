//! 会话处理器注册表
//!
//! Session Key → Handler Set。注册表只持有弱引用，处理器由 SessionController 拥有

use host_socket::{
    CallDispatcher, HostCall, HostReconnectedPayload, LoadingStatePayload, NotifyPayload,
    RedirectPayload, RenderPayload, SessionKey, SessionRef,
};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// 单个会话的处理器集合，未实现的方法忽略对应调用
pub trait SessionHandlers: Send + Sync {
    fn on_render(&self, _payload: RenderPayload) {}

    fn on_loading_state(&self, _payload: LoadingStatePayload) {}

    fn on_redirect(&self, _payload: RedirectPayload) {}

    fn on_notify(&self, _payload: NotifyPayload) {}

    fn on_host_reconnected(&self, _payload: HostReconnectedPayload) {}

    fn on_host_closed_unexpectedly(&self, _session: SessionRef) {}

    fn on_usurped(&self, _session: SessionRef) {}
}

/// 会话处理器注册表
#[derive(Default)]
pub struct SessionRegistry {
    handlers: parking_lot::RwLock<HashMap<SessionKey, Weak<dyn SessionHandlers>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册处理器，同一 Key 已有处理器时先注销旧的
    pub fn register(&self, key: SessionKey, handlers: &Arc<dyn SessionHandlers>) {
        let mut map = self.handlers.write();
        if map.remove(&key).is_some() {
            warn!("[SessionRegistry] Superseding handlers for {}", key);
        }
        debug!("[SessionRegistry] Registered {}", key);
        map.insert(key, Arc::downgrade(handlers));
    }

    /// 注销处理器，返回是否存在
    pub fn unregister(&self, key: &SessionKey) -> bool {
        let removed = self.handlers.write().remove(key).is_some();
        if removed {
            debug!("[SessionRegistry] Unregistered {}", key);
        }
        removed
    }

    pub fn contains(&self, key: &SessionKey) -> bool {
        self.handlers.read().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }

    fn lookup(&self, key: &SessionKey) -> Option<Arc<dyn SessionHandlers>> {
        let handlers = self.handlers.read().get(key)?.upgrade();
        if handlers.is_none() {
            // 控制器已释放但未注销
            self.handlers.write().remove(key);
            warn!("[SessionRegistry] Purged stale handlers for {}", key);
        }
        handlers
    }
}

impl CallDispatcher for SessionRegistry {
    fn dispatch(&self, call: HostCall) -> bool {
        let method = call.method();
        let Some(key) = call.session_key().cloned() else {
            warn!("[SessionRegistry] {} carries no session key, dropped", method);
            return false;
        };

        // 取出处理器后释放锁，处理器内部可以重新注册
        let Some(handlers) = self.lookup(&key) else {
            debug!("[SessionRegistry] No handlers for {} ({}), dropped", key, method);
            return false;
        };

        debug!("[SessionRegistry] {} -> {}", method, key);
        match call {
            HostCall::Render(payload) => handlers.on_render(payload),
            HostCall::LoadingState(payload) => handlers.on_loading_state(payload),
            HostCall::Redirect(payload) => handlers.on_redirect(payload),
            HostCall::Notify(payload) => handlers.on_notify(payload),
            HostCall::HostReconnected(payload) => handlers.on_host_reconnected(payload),
            HostCall::HostClosedUnexpectedly(session) => {
                handlers.on_host_closed_unexpectedly(session)
            }
            HostCall::Usurped(session) => handlers.on_usurped(session),
        }
        true
    }
}
