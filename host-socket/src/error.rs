//! Socket / RPC 错误定义

use thiserror::Error;

/// Socket 包装层错误
#[derive(Error, Debug)]
pub enum SocketError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Emit failed: {0}")]
    EmitFailed(String),

    #[error("Socket closed")]
    Closed,

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// 传输层错误，总是交给 ConnectionManager 的重连逻辑处理
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("no socket attached")]
    NotConnected,

    #[error("socket closed before a reply arrived")]
    Closed,

    #[error("socket replaced before a reply arrived")]
    Superseded,

    #[error(transparent)]
    Socket(#[from] SocketError),
}

/// 协议错误：帧格式错误或未知方法，记录日志后丢弃
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Unknown method: {0}")]
    UnknownMethod(String),
}

/// `DuplexRpcClient::send` 的错误
#[derive(Error, Debug)]
pub enum RpcError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("{method} failed on host: {message}")]
    Remote { method: String, message: String },
}

impl RpcError {
    /// 是否为 socket 写入失败（计入连续传输错误）
    pub fn is_write_failure(&self) -> bool {
        matches!(self, RpcError::Transport(TransportError::Socket(_)))
    }
}
