//! Socket.IO 连接实现
//!
//! 封装 rust_socketio：一个 `SocketIoSocket` 就是一条物理连接，
//! 重连由上层 ConnectionManager 负责，这里关闭 rust_socketio 自带的重连

use crate::error::SocketError;
use crate::protocol::{AUTHENTICATED_EVENT, RPC_EVENT};
use crate::socket::{Communicator, ConnectParams, Connector, SocketEvents};
use async_trait::async_trait;
use futures::FutureExt;
use native_tls::{Certificate, Identity, TlsConnector};
use rust_socketio::{
    asynchronous::{Client, ClientBuilder},
    Payload, TransportType,
};
use serde_json::Value;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// 非正常关闭（对应 WebSocket 1006）
const ABNORMAL_CLOSE: u16 = 1006;

/// TLS 配置
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// CA 证书路径
    pub ca_cert_path: Option<PathBuf>,
    /// 客户端证书路径 (PEM 或 P12)
    pub client_cert_path: Option<PathBuf>,
    /// 客户端私钥路径 (PEM)，P12 时不需要
    pub client_key_path: Option<PathBuf>,
    /// P12 密码
    pub client_p12_password: Option<String>,
    /// 是否跳过服务器证书验证（仅开发用）
    pub danger_accept_invalid_certs: bool,
}

/// Socket 配置
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// 主机 URL（启用服务发现时可被覆盖）
    pub url: String,
    /// 命名空间
    pub namespace: String,
    /// TLS 配置
    pub tls: TlsConfig,
}

impl Default for SocketConfig {
    fn default() -> Self {
        // 从环境变量读取配置，默认 localhost:4000
        let host =
            std::env::var("HOSTLINK_SERVER_HOST").unwrap_or_else(|_| "localhost".to_string());
        let port = std::env::var("HOSTLINK_SERVER_PORT")
            .ok()
            .and_then(|p| p.parse::<u16>().ok())
            .unwrap_or(4000);
        let protocol = if std::env::var("HOSTLINK_USE_TLS").map(|v| v == "true").unwrap_or(true) {
            "https"
        } else {
            "http"
        };

        Self {
            url: format!("{}://{}:{}", protocol, host, port),
            namespace: "/client".to_string(),
            tls: TlsConfig::default(),
        }
    }
}

/// 构建 TLS 连接器（支持 mTLS）
pub fn build_tls_connector(tls: &TlsConfig) -> Result<Option<TlsConnector>, SocketError> {
    if tls.ca_cert_path.is_none()
        && tls.client_cert_path.is_none()
        && !tls.danger_accept_invalid_certs
    {
        return Ok(None);
    }

    let mut builder = native_tls::TlsConnector::builder();

    // 加载 CA 证书
    if let Some(ca_path) = &tls.ca_cert_path {
        info!("Loading CA certificate from {:?}", ca_path);
        let ca_pem = fs::read(ca_path)?;
        let ca_cert = Certificate::from_pem(&ca_pem)
            .map_err(|e| SocketError::TlsError(format!("Failed to parse CA cert: {}", e)))?;
        builder.add_root_certificate(ca_cert);
    }

    // 加载客户端证书（mTLS）
    if let Some(cert_path) = &tls.client_cert_path {
        info!("Loading client certificate from {:?}", cert_path);
        let cert_data = fs::read(cert_path)?;

        let is_p12 = cert_path
            .extension()
            .map(|ext| ext == "p12" || ext == "pfx")
            .unwrap_or(false);

        let identity = if is_p12 {
            let password = tls.client_p12_password.as_deref().unwrap_or("");
            Identity::from_pkcs12(&cert_data, password)
                .map_err(|e| SocketError::TlsError(format!("Failed to parse PKCS#12: {}", e)))?
        } else {
            let key_path = tls.client_key_path.as_ref().ok_or_else(|| {
                SocketError::TlsError("Client key path required for PEM format".into())
            })?;
            let key_pem = fs::read(key_path)?;
            Identity::from_pkcs8(&cert_data, &key_pem).map_err(|e| {
                SocketError::TlsError(format!("Failed to create identity from PEM: {}", e))
            })?
        };
        builder.identity(identity);
    }

    if tls.danger_accept_invalid_certs {
        warn!("TLS certificate verification disabled - FOR DEVELOPMENT ONLY");
        builder.danger_accept_invalid_certs(true);
    }

    let connector = builder
        .build()
        .map_err(|e| SocketError::TlsError(format!("Failed to build TLS connector: {}", e)))?;

    Ok(Some(connector))
}

/// Socket.IO 连接工厂
pub struct SocketIoConnector {
    config: SocketConfig,
    /// 当前使用的主机 URL（可能通过服务发现更新）
    current_url: parking_lot::RwLock<String>,
}

impl SocketIoConnector {
    pub fn new(config: SocketConfig) -> Self {
        let current_url = config.url.clone();
        Self {
            config,
            current_url: parking_lot::RwLock::new(current_url),
        }
    }

    /// 更新下次连接使用的 URL
    pub fn set_url(&self, url: impl Into<String>) {
        let url = url.into();
        info!("[SocketIo] Host URL set to {}", url);
        *self.current_url.write() = url;
    }

    pub fn url(&self) -> String {
        self.current_url.read().clone()
    }
}

impl Connector for SocketIoConnector {
    fn create(&self, params: ConnectParams, events: SocketEvents) -> Arc<dyn Communicator> {
        Arc::new(SocketIoSocket {
            config: self.config.clone(),
            url: self.url(),
            params,
            events,
            client: RwLock::new(None),
            closed: AtomicBool::new(false),
        })
    }
}

/// 主机 URL 必须带 http(s)/ws(s) 协议头和主机名
fn check_url(url: &str) -> Result<(), SocketError> {
    let rest = ["https://", "http://", "wss://", "ws://"]
        .iter()
        .find_map(|scheme| url.strip_prefix(scheme));
    match rest {
        Some(rest) if !rest.is_empty() && !rest.starts_with('/') => Ok(()),
        _ => Err(SocketError::InvalidUrl(url.to_string())),
    }
}

/// 基于 Socket.IO 的单条连接
pub struct SocketIoSocket {
    config: SocketConfig,
    url: String,
    params: ConnectParams,
    events: SocketEvents,
    client: RwLock<Option<Client>>,
    closed: AtomicBool,
}

#[async_trait]
impl Communicator for SocketIoSocket {
    fn generation(&self) -> u64 {
        self.events.generation()
    }

    async fn connect(&self) -> Result<(), SocketError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SocketError::Closed);
        }

        let generation = self.events.generation();
        info!(
            "[SocketIo#{}] Connecting to {}{}",
            generation, self.url, self.config.namespace
        );

        check_url(&self.url)?;
        let tls_connector = build_tls_connector(&self.config.tls)?;
        let auth = serde_json::to_value(&self.params)
            .map_err(|e| SocketError::ConnectionFailed(e.to_string()))?;

        // 强制使用 WebSocket，重连交给上层状态机
        let mut builder = ClientBuilder::new(self.url.as_str())
            .namespace(self.config.namespace.as_str())
            .transport_type(TransportType::Websocket)
            .reconnect(false)
            .auth(auth);

        if let Some(connector) = tls_connector {
            builder = builder.tls_config(connector);
        }

        let client = builder
            .on("close", {
                let events = self.events.clone();
                move |_, _| {
                    let events = events.clone();
                    async move {
                        warn!("[SocketIo#{}] Socket closed", events.generation());
                        events.close(ABNORMAL_CLOSE, "transport closed");
                    }
                    .boxed()
                }
            })
            .on("error", {
                let events = self.events.clone();
                move |payload, _| {
                    let events = events.clone();
                    async move {
                        error!("[SocketIo#{}] Socket error: {:?}", events.generation(), payload);
                        events.error(format!("{:?}", payload));
                    }
                    .boxed()
                }
            })
            .on(AUTHENTICATED_EVENT, {
                let events = self.events.clone();
                move |_, _| {
                    let events = events.clone();
                    async move {
                        events.authenticated();
                    }
                    .boxed()
                }
            })
            .on(RPC_EVENT, {
                let events = self.events.clone();
                move |payload, _| {
                    let events = events.clone();
                    async move {
                        match extract_payload(payload) {
                            Some(frame) => events.message(frame),
                            None => debug!(
                                "[SocketIo#{}] Ignoring non-JSON frame",
                                events.generation()
                            ),
                        }
                    }
                    .boxed()
                }
            })
            .connect()
            .await
            .map_err(|e| SocketError::ConnectionFailed(e.to_string()))?;

        // 连接过程中已被替换：立即断开
        if self.closed.load(Ordering::SeqCst) {
            let _ = client.disconnect().await;
            return Err(SocketError::Closed);
        }

        *self.client.write().await = Some(client);
        info!("[SocketIo#{}] Socket connected", generation);
        self.events.open();
        Ok(())
    }

    async fn send(&self, frame: Value) -> Result<(), SocketError> {
        let client = self.client.read().await;
        let client = client.as_ref().ok_or(SocketError::NotConnected)?;

        client
            .emit(RPC_EVENT, frame)
            .await
            .map_err(|e| SocketError::EmitFailed(e.to_string()))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(client) = self.client.write().await.take() {
            if let Err(e) = client.disconnect().await {
                error!("[SocketIo#{}] Disconnect error: {:?}", self.events.generation(), e);
            }
        }
    }
}

// Helper 函数
fn extract_payload(payload: Payload) -> Option<Value> {
    match payload {
        Payload::Text(values) => values.into_iter().next(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::IdentityContext;
    use tokio::sync::mpsc;

    #[test]
    fn test_socket_config_default() {
        let config = SocketConfig::default();
        assert_eq!(config.url, "https://localhost:4000");
        assert_eq!(config.namespace, "/client");
    }

    #[test]
    fn test_plain_config_needs_no_tls() {
        assert!(build_tls_connector(&TlsConfig::default()).unwrap().is_none());
    }

    #[test]
    fn test_pem_cert_without_key_is_rejected() {
        let cert = std::env::temp_dir().join(format!("hostlink-test-{}.pem", std::process::id()));
        fs::write(&cert, b"not really a certificate").unwrap();

        let tls = TlsConfig {
            client_cert_path: Some(cert.clone()),
            ..Default::default()
        };
        let err = build_tls_connector(&tls).unwrap_err();
        assert!(matches!(err, SocketError::TlsError(msg) if msg.contains("Client key path")));

        let _ = fs::remove_file(cert);
    }

    #[test]
    fn test_missing_ca_cert_is_io_error() {
        let tls = TlsConfig {
            ca_cert_path: Some(PathBuf::from("/nonexistent/hostlink-ca.pem")),
            ..Default::default()
        };
        let err = build_tls_connector(&tls).unwrap_err();
        assert!(matches!(err, SocketError::IoError(_)));
    }

    #[test]
    fn test_check_url() {
        assert!(check_url("https://localhost:4000").is_ok());
        assert!(check_url("ws://10.0.0.2:4000").is_ok());
        assert!(matches!(check_url("localhost:4000"), Err(SocketError::InvalidUrl(_))));
        assert!(matches!(check_url("http://"), Err(SocketError::InvalidUrl(_))));
    }

    #[tokio::test]
    async fn test_invalid_url_fails_before_connecting() {
        let connector = SocketIoConnector::new(SocketConfig::default());
        connector.set_url("localhost:4000");

        let (tx, _rx) = mpsc::unbounded_channel();
        let socket = connector.create(
            ConnectParams {
                client_id: "c".into(),
                identity: IdentityContext::default(),
            },
            SocketEvents::new(1, tx),
        );
        assert!(matches!(
            socket.connect().await,
            Err(SocketError::InvalidUrl(url)) if url == "localhost:4000"
        ));
    }

    #[tokio::test]
    async fn test_send_before_connect_fails() {
        let connector = SocketIoConnector::new(SocketConfig::default());
        connector.set_url("http://127.0.0.1:1");
        assert_eq!(connector.url(), "http://127.0.0.1:1");

        let (tx, _rx) = mpsc::unbounded_channel();
        let socket = connector.create(
            ConnectParams {
                client_id: "c".into(),
                identity: IdentityContext::default(),
            },
            SocketEvents::new(7, tx),
        );

        assert_eq!(socket.generation(), 7);
        assert!(matches!(
            socket.send(serde_json::json!({})).await,
            Err(SocketError::NotConnected)
        ));

        socket.close().await;
        assert!(matches!(socket.connect().await, Err(SocketError::Closed)));
    }
}
