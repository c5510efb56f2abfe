//! 会话层
//!
//! 连接生命周期、会话处理器注册表与会话控制器

mod config;
mod connection;
mod error;
mod registry;
mod session;

#[cfg(test)]
mod testing;

pub use config::{ConnectionConfig, SessionConfig};
pub use connection::{ConnectionManager, ConnectionState};
pub use error::SessionError;
pub use registry::{SessionHandlers, SessionRegistry};
pub use session::{
    SessionController, SessionKind, SessionParams, SessionTransition, SessionUiState,
};
