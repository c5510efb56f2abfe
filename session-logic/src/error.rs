//! 会话层错误

use host_socket::{RpcError, SessionKey};
use thiserror::Error;

/// 会话操作错误
///
/// 不会直接交给渲染代码，只用于日志和状态迁移
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Failed to open session {key}: {reason}")]
    Open { key: SessionKey, reason: String },

    #[error("Host rejected response for session {key}")]
    Rejected { key: SessionKey },

    #[error("Failed to deliver to session {key}: {source}")]
    Delivery {
        key: SessionKey,
        #[source]
        source: RpcError,
    },
}

impl SessionError {
    pub fn key(&self) -> &SessionKey {
        match self {
            SessionError::Open { key, .. }
            | SessionError::Rejected { key }
            | SessionError::Delivery { key, .. } => key,
        }
    }
}
