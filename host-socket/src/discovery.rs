//! Redis 主机发现
//!
//! 执行主机在 Redis 中登记地址，客户端据此选择连接目标，
//! 主机上线事件用于提前触发重连

use anyhow::{Context, Result};
use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// 主机事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostEventType {
    Online,
    Offline,
}

/// 主机事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostEvent {
    #[serde(rename = "type")]
    pub event_type: HostEventType,
    pub service: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    pub timestamp: u64,
}

impl HostEvent {
    /// 是否为执行主机上线
    pub fn is_host_online(&self) -> bool {
        self.event_type == HostEventType::Online && self.service == HOST_SERVICE
    }
}

/// 主机登记信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostInfo {
    pub address: String,
    pub ttl: u64,
    #[serde(rename = "registeredAt")]
    pub registered_at: u64,
}

const HOST_SERVICE: &str = "host";

/// 主机发现配置
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub key_prefix: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            host: std::env::var("REDIS_HOST").unwrap_or_else(|_| "localhost".to_string()),
            port: std::env::var("REDIS_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(6379),
            password: std::env::var("REDIS_PASSWORD").ok(),
            key_prefix: "hostlink:".to_string(),
        }
    }
}

/// Redis 主机注册表（只读端）
pub struct HostRegistry {
    client: Client,
    conn: Arc<RwLock<Option<MultiplexedConnection>>>,
    config: DiscoveryConfig,
    channel: String,
    event_tx: broadcast::Sender<HostEvent>,
    listener: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl HostRegistry {
    pub fn new(config: DiscoveryConfig) -> Result<Self> {
        let url = match &config.password {
            Some(password) => format!("redis://:{}@{}:{}", password, config.host, config.port),
            None => format!("redis://{}:{}", config.host, config.port),
        };

        let client = Client::open(url).context("Failed to create Redis client")?;
        let channel = format!("{}channel:service-registry", config.key_prefix);
        let (event_tx, _) = broadcast::channel(16);

        Ok(Self {
            client,
            conn: Arc::new(RwLock::new(None)),
            config,
            channel,
            event_tx,
            listener: parking_lot::Mutex::new(None),
        })
    }

    /// 连接 Redis
    pub async fn connect(&self) -> Result<()> {
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .context("Failed to connect to Redis")?;

        *self.conn.write().await = Some(conn);
        info!(
            "[HostRegistry] Connected to Redis at {}:{}",
            self.config.host, self.config.port
        );
        Ok(())
    }

    async fn get_conn(&self) -> Result<MultiplexedConnection> {
        self.conn
            .read()
            .await
            .clone()
            .ok_or_else(|| anyhow::anyhow!("Not connected to Redis"))
    }

    /// 获取所有已登记的主机地址，就近优先
    pub async fn get_hosts(&self) -> Result<Vec<String>> {
        let mut conn = self.get_conn().await?;
        let pattern = format!("{}services:{}:*", self.config.key_prefix, HOST_SERVICE);

        let keys: Vec<String> = redis::cmd("KEYS")
            .arg(&pattern)
            .query_async(&mut conn)
            .await
            .context("Failed to get host keys")?;

        let mut addresses = Vec::with_capacity(keys.len());
        for key in keys {
            // 读取期间过期的 Key 直接跳过
            let value: Option<String> = match conn.get(&key).await {
                Ok(value) => value,
                Err(e) => {
                    debug!("[HostRegistry] Skipping {}: {}", key, e);
                    continue;
                }
            };
            match value.map(|v| serde_json::from_str::<HostInfo>(&v)) {
                Some(Ok(info)) => addresses.push(info.address),
                Some(Err(e)) => warn!("[HostRegistry] Bad host entry {}: {}", key, e),
                None => {}
            }
        }

        sort_by_priority(&mut addresses);
        Ok(addresses)
    }

    /// 订阅主机事件
    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.event_tx.subscribe()
    }

    /// 在后台 task 中监听 pub/sub，断开后 5 秒重试
    pub fn start_listening(&self) {
        let mut listener = self.listener.lock();
        if listener.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }

        let client = self.client.clone();
        let channel = self.channel.clone();
        let event_tx = self.event_tx.clone();

        *listener = Some(tokio::spawn(async move {
            loop {
                match client.get_async_pubsub().await {
                    Ok(mut pubsub) => {
                        if let Err(e) = pubsub.subscribe(&channel).await {
                            error!("[HostRegistry] Subscribe failed: {}", e);
                            tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;
                            continue;
                        }
                        info!("[HostRegistry] Subscribed to {}", channel);

                        let mut messages = pubsub.on_message();
                        while let Some(msg) = messages.next().await {
                            let Ok(payload) = msg.get_payload::<String>() else {
                                continue;
                            };
                            match serde_json::from_str::<HostEvent>(&payload) {
                                Ok(event) => {
                                    debug!("[HostRegistry] Event: {:?}", event);
                                    let _ = event_tx.send(event);
                                }
                                Err(e) => debug!("[HostRegistry] Ignoring event: {}", e),
                            }
                        }
                        warn!("[HostRegistry] PubSub connection closed");
                    }
                    Err(e) => {
                        error!("[HostRegistry] PubSub connection failed: {}", e);
                        tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;
                    }
                }
            }
        }));
    }

    /// 断开连接并停止监听
    pub async fn disconnect(&self) {
        if let Some(task) = self.listener.lock().take() {
            task.abort();
        }
        *self.conn.write().await = None;
        info!("[HostRegistry] Disconnected");
    }
}

/// 按优先级降序排序（稳定排序，同级保持原顺序）
fn sort_by_priority(addresses: &mut [String]) {
    addresses.sort_by(|a, b| host_priority(b).cmp(&host_priority(a)));
}

/// 地址优先级
/// 1. 本机最高
/// 2. 内网次之
/// 3. 其他最低
pub fn host_priority(address: &str) -> u8 {
    let host = address.split(':').next().unwrap_or("");

    if host == "localhost" || host == "127.0.0.1" {
        return 3;
    }

    if host.starts_with("192.168.") || host.starts_with("10.") || host.starts_with("172.") {
        return 2;
    }

    1
}
