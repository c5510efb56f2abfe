//! 测试用主机

use crate::config::ConnectionConfig;
use crate::connection::ConnectionManager;
use host_socket::{IdentityContext, MemoryConnector, MemoryListener, MemoryPeer};
use std::sync::Arc;
use std::time::Duration;

pub(crate) struct TestHost {
    pub manager: ConnectionManager,
    pub connector: Arc<MemoryConnector>,
    pub listener: MemoryListener,
}

impl TestHost {
    pub fn new() -> Self {
        let (connector, listener) = MemoryConnector::new();
        let manager = ConnectionManager::new(
            ConnectionConfig::default(),
            connector.clone(),
            IdentityContext::default(),
        );
        Self {
            manager,
            connector,
            listener,
        }
    }

    /// 等待客户端建立下一条连接
    pub async fn accept(&mut self) -> MemoryPeer {
        self.listener.accept().await.expect("connector dropped")
    }

    /// 启动并完成握手
    pub async fn connect(&mut self) -> MemoryPeer {
        self.manager.start();
        let mut peer = self.accept().await;
        peer.accept_handshake().await.expect("no handshake");
        assert!(self.manager.wait_connected().await);
        peer
    }
}

/// 让已就绪的 task 全部跑完（暂停时钟下不推进定时器）
pub(crate) async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}
