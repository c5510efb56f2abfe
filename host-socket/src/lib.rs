//! 执行主机连接
//!
//! Socket 包装层、双向 RPC 客户端、线协议以及基于 Redis 的主机发现

mod client;
mod discovery;
mod error;
mod memory;
mod protocol;
mod rpc;
mod socket;

pub use client::{build_tls_connector, SocketConfig, SocketIoConnector, TlsConfig};
pub use discovery::{
    host_priority, DiscoveryConfig, HostEvent, HostEventType, HostInfo, HostRegistry,
};
pub use error::{ProtocolError, RpcError, SocketError, TransportError};
pub use memory::{MemoryConnector, MemoryListener, MemoryPeer};
pub use protocol::{
    is_ack,
    // Envelope
    Envelope, AUTHENTICATED_EVENT, RPC_EVENT,
    // 会话标识
    IdentityContext, SessionKey, SessionRef,
    // 上行调用
    ClientCall, InitializeClientPayload, OpenPagePayload, OpenTransactionPayload, RespondPayload,
    // 下行调用
    HostCall, HostReconnectedPayload, LoadingStatePayload, NotifyPayload, RedirectPayload,
    RenderPayload,
};
pub use rpc::{CallDispatcher, DuplexRpcClient};
pub use socket::{
    Communicator, ConnectParams, Connector, SocketEvent, SocketEventReceiver, SocketEventSender,
    SocketEvents,
};
