//! 连接与会话配置

use std::time::Duration;

/// ConnectionManager 配置
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// 重连间隔
    pub reconnect_interval: Duration,
    /// 连续错误达到该值时强制重连
    pub max_consecutive_errors: u32,
    /// 客户端版本（随握手上报）
    pub client_version: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            reconnect_interval: Duration::from_millis(2000),
            max_consecutive_errors: 3,
            client_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// SessionController 配置
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// 打开失败后的重试间隔
    pub retry_delay: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_millis(1000),
        }
    }
}
