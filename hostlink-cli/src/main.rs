//! Hostlink CLI - 终端会话入口

use anyhow::{bail, Result};
use clap::{ArgGroup, Parser};
use host_socket::{
    DiscoveryConfig, HostReconnectedPayload, HostRegistry, IdentityContext, LoadingStatePayload,
    NotifyPayload, RedirectPayload, RenderPayload, SessionRef, SocketConfig, SocketIoConnector,
    TlsConfig,
};
use serde::Serialize;
use serde_json::{json, Map, Value};
use session_logic::{
    ConnectionConfig, ConnectionManager, ConnectionState, SessionConfig, SessionController,
    SessionHandlers, SessionParams,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Hostlink CLI
#[derive(Parser, Debug)]
#[command(name = "hostlink")]
#[command(version, about = "Run an interactive host session from the terminal")]
#[command(group(ArgGroup::new("target").required(true).args(["action", "page"])))]
struct Args {
    /// Host URL (overridden by discovery when --redis-host is set)
    #[arg(short, long, default_value_t = SocketConfig::default().url)]
    server: String,

    /// Socket.IO namespace
    #[arg(long, default_value = "/client")]
    namespace: String,

    /// Action slug to run as a transaction
    #[arg(short, long)]
    action: Option<String>,

    /// Page slug to open
    #[arg(short, long)]
    page: Option<String>,

    /// Session parameter (key=value, value parsed as JSON when possible)
    #[arg(long = "param", value_parser = parse_param)]
    params: Vec<(String, Value)>,

    /// Device name reported in the identity context
    #[arg(short = 'n', long, default_value_t = get_hostname())]
    hostname: String,

    /// User ID
    #[arg(long)]
    user_id: Option<String>,

    /// Organization ID
    #[arg(long)]
    organization_id: Option<String>,

    /// Environment (e.g. live, development)
    #[arg(long)]
    environment: Option<String>,

    /// Log level or filter directive (RUST_LOG takes precedence)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Reconnect interval in milliseconds
    #[arg(long, default_value = "2000")]
    reconnect_interval_ms: u64,

    /// Retry delay for failed session opens in milliseconds
    #[arg(long, default_value = "1000")]
    retry_delay_ms: u64,

    /// CA certificate path for TLS
    #[arg(long)]
    ca_cert: Option<PathBuf>,

    /// Client certificate path for mTLS
    #[arg(long)]
    client_cert: Option<PathBuf>,

    /// Client key path for mTLS (not needed for P12)
    #[arg(long)]
    client_key: Option<PathBuf>,

    /// P12 password (for PKCS#12 format client cert)
    #[arg(long)]
    p12_password: Option<String>,

    /// Skip TLS certificate verification (DEVELOPMENT ONLY)
    #[arg(long, default_value = "false")]
    insecure: bool,

    // ==================== Redis Host Discovery ====================

    /// Redis host for host discovery
    #[arg(long)]
    redis_host: Option<String>,

    /// Redis port
    #[arg(long, default_value = "6379")]
    redis_port: u16,

    /// Redis password
    #[arg(long)]
    redis_password: Option<String>,
}

fn get_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

fn parse_param(raw: &str) -> Result<(String, Value)> {
    let Some((key, value)) = raw.split_once('=') else {
        bail!("expected key=value, got {:?}", raw);
    };
    if key.is_empty() {
        bail!("empty parameter name in {:?}", raw);
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

/// 由发现的地址构造 URL，沿用配置 URL 的协议
fn host_url(configured: &str, address: &str) -> String {
    let scheme = configured.split_once("://").map(|(s, _)| s).unwrap_or("https");
    format!("{}://{}", scheme, address)
}

/// 把主机推送逐行输出为 JSON
struct TerminalView;

impl TerminalView {
    fn emit(&self, event: &str, payload: impl Serialize) {
        match serde_json::to_value(payload) {
            Ok(payload) => println!("{}", json!({"event": event, "payload": payload})),
            Err(e) => error!("Failed to encode {}: {}", event, e),
        }
    }
}

impl SessionHandlers for TerminalView {
    fn on_render(&self, payload: RenderPayload) {
        self.emit("render", payload);
    }

    fn on_loading_state(&self, payload: LoadingStatePayload) {
        self.emit("loading_state", payload);
    }

    fn on_redirect(&self, payload: RedirectPayload) {
        self.emit("redirect", payload);
    }

    fn on_notify(&self, payload: NotifyPayload) {
        self.emit("notify", payload);
    }

    fn on_host_reconnected(&self, payload: HostReconnectedPayload) {
        self.emit("host_reconnected", payload);
    }

    fn on_host_closed_unexpectedly(&self, session: SessionRef) {
        self.emit("host_closed_unexpectedly", session);
    }

    fn on_usurped(&self, session: SessionRef) {
        self.emit("usurped", session);
    }
}

/// 连接 Redis 并选择就近主机，之后的上线事件会更新连接地址
async fn start_discovery(
    args: &Args,
    redis_host: String,
    connector: &Arc<SocketIoConnector>,
    manager: &ConnectionManager,
) -> Result<Arc<HostRegistry>> {
    info!("Using Redis host discovery: {}:{}", redis_host, args.redis_port);
    let registry = HostRegistry::new(DiscoveryConfig {
        host: redis_host,
        port: args.redis_port,
        password: args.redis_password.clone(),
        ..Default::default()
    })?;
    registry.connect().await?;
    registry.start_listening();

    let hosts = registry.get_hosts().await?;
    info!("Found {} hosts: {:?}", hosts.len(), hosts);
    match hosts.first() {
        Some(address) => connector.set_url(host_url(&args.server, address)),
        None => warn!("No hosts found in Redis, using fallback: {}", args.server),
    }

    // 先更新地址再通知 ConnectionManager
    let (forward_tx, forward_rx) = broadcast::channel(16);
    manager.watch_host_events(forward_rx);

    let mut events = registry.subscribe();
    let connector = connector.clone();
    let configured = args.server.clone();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if event.is_host_online() {
                        if let Some(address) = &event.address {
                            connector.set_url(host_url(&configured, address));
                        }
                    }
                    let _ = forward_tx.send(event);
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    Ok(Arc::new(registry))
}

/// 处理一行标准输入：JSON 作为用户输入提交，`:restart` 重新运行会话
async fn handle_line(controller: &SessionController, line: &str) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    if line == ":restart" {
        controller.restart();
        return;
    }

    match serde_json::from_str::<Value>(line) {
        Ok(values) => {
            if !controller.respond(values).await {
                warn!("Response not delivered, session restarting as {}", controller.key());
            }
        }
        Err(e) => warn!("Ignoring input, not JSON: {}", e),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 初始化日志
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting hostlink...");

    let tls = TlsConfig {
        ca_cert_path: args.ca_cert.clone(),
        client_cert_path: args.client_cert.clone(),
        client_key_path: args.client_key.clone(),
        client_p12_password: args.p12_password.clone(),
        danger_accept_invalid_certs: args.insecure,
    };
    let connector = Arc::new(SocketIoConnector::new(SocketConfig {
        url: args.server.clone(),
        namespace: args.namespace.clone(),
        tls,
    }));

    let identity = IdentityContext {
        user_id: args.user_id.clone(),
        session_id: Some(args.hostname.clone()),
        environment: args.environment.clone(),
        organization_id: args.organization_id.clone(),
    };
    let manager = ConnectionManager::new(
        ConnectionConfig {
            reconnect_interval: Duration::from_millis(args.reconnect_interval_ms),
            ..Default::default()
        },
        connector.clone(),
        identity,
    );

    let discovery = match args.redis_host.clone() {
        Some(redis_host) => Some(start_discovery(&args, redis_host, &connector, &manager).await?),
        None => {
            info!("Using direct host connection: {}", connector.url());
            None
        }
    };

    // 连接状态提示
    let mut states = manager.subscribe();
    tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = *states.borrow_and_update();
            match state {
                ConnectionState::Reconnecting => warn!("Waiting for connection..."),
                ConnectionState::Connected => info!("Connected"),
                _ => {}
            }
        }
    });

    manager.start();

    let params = if args.params.is_empty() {
        None
    } else {
        Some(Value::Object(args.params.iter().cloned().collect::<Map<_, _>>()))
    };
    let params = match (&args.action, &args.page) {
        (Some(action), _) => SessionParams::transaction(action.clone(), params),
        (None, Some(page)) => SessionParams::page(page.clone(), params),
        (None, None) => bail!("either --action or --page is required"),
    };
    let controller = SessionController::open(
        &manager,
        params,
        SessionConfig {
            retry_delay: Duration::from_millis(args.retry_delay_ms),
        },
        Arc::new(TerminalView),
    );

    info!("Session {} running. Press Ctrl+C to stop.", controller.key());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down...");
                break;
            }
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => handle_line(&controller, &line).await,
                Ok(None) => {
                    info!("stdin closed, waiting for Ctrl+C");
                    stdin_open = false;
                }
                Err(e) => {
                    warn!("Failed to read stdin: {}", e);
                    stdin_open = false;
                }
            },
        }
    }

    controller.close();
    // 留出时间发出离开请求
    tokio::time::sleep(Duration::from_millis(200)).await;
    manager.shutdown().await;
    if let Some(discovery) = discovery {
        discovery.disconnect().await;
    }

    info!("Hostlink stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_param() {
        assert_eq!(parse_param("count=3").unwrap(), ("count".to_string(), json!(3)));
        assert_eq!(parse_param("email=a@b.c").unwrap(), ("email".to_string(), json!("a@b.c")));
        assert_eq!(parse_param("flags=[1,2]").unwrap(), ("flags".to_string(), json!([1, 2])));
        assert_eq!(parse_param("empty=").unwrap(), ("empty".to_string(), json!("")));
        assert!(parse_param("novalue").is_err());
        assert!(parse_param("=1").is_err());
    }

    #[test]
    fn test_host_url_keeps_scheme() {
        assert_eq!(host_url("http://localhost:4000", "10.0.0.7:4000"), "http://10.0.0.7:4000");
        assert_eq!(host_url("https://hosts.example.com", "10.0.0.7:4000"), "https://10.0.0.7:4000");
        assert_eq!(host_url("localhost:4000", "10.0.0.7:4000"), "https://10.0.0.7:4000");
    }

    #[test]
    fn test_args_require_a_target() {
        assert!(Args::try_parse_from(["hostlink"]).is_err());
        assert!(Args::try_parse_from(["hostlink", "--action", "a", "--page", "p"]).is_err());

        let args =
            Args::try_parse_from(["hostlink", "--action", "refund-user", "--param", "id=7"])
                .unwrap();
        assert_eq!(args.action.as_deref(), Some("refund-user"));
        assert_eq!(args.params, vec![("id".to_string(), json!(7))]);
        assert_eq!(args.reconnect_interval_ms, 2000);
    }
}
