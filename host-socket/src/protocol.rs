//! 线协议定义
//!
//! 客户端与执行主机之间的 envelope、会话标识以及双向调用

use crate::error::ProtocolError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// 承载 envelope 的 Socket.IO 事件名
pub const RPC_EVENT: &str = "rpc";

/// 主机认证通过后下发的事件名
pub const AUTHENTICATED_EVENT: &str = "authenticated";

// ==================== Envelope ====================

/// 线上帧
///
/// 请求/响应通过 `id` 关联；任意一方都可以发起 `Call`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Envelope {
    Call {
        id: u64,
        method: String,
        #[serde(default)]
        payload: Value,
    },
    Response {
        id: u64,
        #[serde(default)]
        result: Value,
    },
    Failure {
        id: u64,
        error: String,
    },
}

impl Envelope {
    /// 关联 ID
    pub fn id(&self) -> u64 {
        match self {
            Envelope::Call { id, .. }
            | Envelope::Response { id, .. }
            | Envelope::Failure { id, .. } => *id,
        }
    }

    /// 将客户端调用包装为 Call 帧
    pub fn client_call(id: u64, call: &ClientCall) -> Result<Self, ProtocolError> {
        let (method, payload) = split_call(call)?;
        Ok(Envelope::Call { id, method, payload })
    }

    /// 将主机调用包装为 Call 帧
    pub fn host_call(id: u64, call: &HostCall) -> Result<Self, ProtocolError> {
        let (method, payload) = split_call(call)?;
        Ok(Envelope::Call { id, method, payload })
    }

    pub fn to_frame(&self) -> Result<Value, ProtocolError> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_frame(frame: Value) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_value(frame)?)
    }
}

// ==================== 会话标识 ====================

/// 会话 Key（客户端生成，不透明）
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionKey(String);

impl SessionKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// 生成新的随机 Key
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for SessionKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// 会话作用域字段：事务用 `transactionId`，页面用 `pageKey`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<SessionKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_key: Option<SessionKey>,
}

impl SessionRef {
    pub fn transaction(key: SessionKey) -> Self {
        Self {
            transaction_id: Some(key),
            page_key: None,
        }
    }

    pub fn page(key: SessionKey) -> Self {
        Self {
            transaction_id: None,
            page_key: Some(key),
        }
    }

    /// 用于分发的 Key，事务 ID 优先
    pub fn key(&self) -> Option<&SessionKey> {
        self.transaction_id.as_ref().or(self.page_key.as_ref())
    }
}

/// 认证身份上下文（变化时强制重连）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<String>,
}

// ==================== 上行调用 (Client → Host) ====================

/// 客户端发给主机的调用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientCall {
    /// 认证后的初始化握手
    InitializeClient(InitializeClientPayload),

    /// 打开事务
    OpenTransaction(OpenTransactionPayload),

    /// 打开页面
    OpenPage(OpenPagePayload),

    /// 提交用户输入
    RespondToIoCall(RespondPayload),

    /// 离开事务
    LeaveTransaction(SessionRef),

    /// 关闭页面
    ClosePage(SessionRef),
}

const CLIENT_METHODS: &[&str] = &[
    "INITIALIZE_CLIENT",
    "OPEN_TRANSACTION",
    "OPEN_PAGE",
    "RESPOND_TO_IO_CALL",
    "LEAVE_TRANSACTION",
    "CLOSE_PAGE",
];

impl ClientCall {
    pub fn method(&self) -> &'static str {
        match self {
            ClientCall::InitializeClient(_) => "INITIALIZE_CLIENT",
            ClientCall::OpenTransaction(_) => "OPEN_TRANSACTION",
            ClientCall::OpenPage(_) => "OPEN_PAGE",
            ClientCall::RespondToIoCall(_) => "RESPOND_TO_IO_CALL",
            ClientCall::LeaveTransaction(_) => "LEAVE_TRANSACTION",
            ClientCall::ClosePage(_) => "CLOSE_PAGE",
        }
    }

    pub fn decode(method: &str, payload: Value) -> Result<Self, ProtocolError> {
        join_call(method, payload, CLIENT_METHODS)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeClientPayload {
    pub client_id: String,
    #[serde(default)]
    pub identity: IdentityContext,
    pub client_version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenTransactionPayload {
    pub transaction_id: SessionKey,
    pub action_slug: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenPagePayload {
    pub page_key: SessionKey,
    pub page_slug: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RespondPayload {
    #[serde(flatten)]
    pub session: SessionRef,
    pub values: Value,
}

// ==================== 下行调用 (Host → Client) ====================

/// 主机发给客户端的调用，均携带会话 Key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HostCall {
    /// 渲染 IO 调用
    Render(RenderPayload),

    /// 加载状态
    LoadingState(LoadingStatePayload),

    /// 跳转（会话终止）
    Redirect(RedirectPayload),

    /// 通知
    Notify(NotifyPayload),

    /// 主机重连（可能携带新 Key）
    HostReconnected(HostReconnectedPayload),

    /// 主机意外关闭
    HostClosedUnexpectedly(SessionRef),

    /// 被另一实例接管
    Usurped(SessionRef),
}

const HOST_METHODS: &[&str] = &[
    "RENDER",
    "LOADING_STATE",
    "REDIRECT",
    "NOTIFY",
    "HOST_RECONNECTED",
    "HOST_CLOSED_UNEXPECTEDLY",
    "USURPED",
];

impl HostCall {
    pub fn method(&self) -> &'static str {
        match self {
            HostCall::Render(_) => "RENDER",
            HostCall::LoadingState(_) => "LOADING_STATE",
            HostCall::Redirect(_) => "REDIRECT",
            HostCall::Notify(_) => "NOTIFY",
            HostCall::HostReconnected(_) => "HOST_RECONNECTED",
            HostCall::HostClosedUnexpectedly(_) => "HOST_CLOSED_UNEXPECTEDLY",
            HostCall::Usurped(_) => "USURPED",
        }
    }

    pub fn session(&self) -> &SessionRef {
        match self {
            HostCall::Render(p) => &p.session,
            HostCall::LoadingState(p) => &p.session,
            HostCall::Redirect(p) => &p.session,
            HostCall::Notify(p) => &p.session,
            HostCall::HostReconnected(p) => &p.session,
            HostCall::HostClosedUnexpectedly(s) | HostCall::Usurped(s) => s,
        }
    }

    /// 分发用的会话 Key
    ///
    /// `HOST_RECONNECTED` 携带 `previousKey` 时按旧 Key 路由，新 Key 由处理器接管。
    /// 不带 `previousKey` 的 `HOST_RECONNECTED` 只按自身 Key 路由：Key 未变时照常送达，
    /// 换成客户端不认识的新 Key 则找不到处理器，应答 false 后丢弃
    pub fn session_key(&self) -> Option<&SessionKey> {
        match self {
            HostCall::HostReconnected(p) => p.previous_key.as_ref().or_else(|| p.session.key()),
            other => other.session().key(),
        }
    }

    pub fn decode(method: &str, payload: Value) -> Result<Self, ProtocolError> {
        join_call(method, payload, HOST_METHODS)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderPayload {
    #[serde(flatten)]
    pub session: SessionRef,
    pub to_render: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadingStatePayload {
    #[serde(flatten)]
    pub session: SessionRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items_in_queue: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items_completed: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedirectPayload {
    #[serde(flatten)]
    pub session: SessionRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifyPayload {
    #[serde(flatten)]
    pub session: SessionRef,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostReconnectedPayload {
    #[serde(flatten)]
    pub session: SessionRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_key: Option<SessionKey>,
}

// ==================== Helper 函数 ====================

/// 主机的确认值是否为真（null / false / 0 / "" 视为拒绝）
pub fn is_ack(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn split_call<T: Serialize>(call: &T) -> Result<(String, Value), ProtocolError> {
    let mut value = serde_json::to_value(call)?;
    let method = value
        .get("method")
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| ProtocolError::UnknownMethod(String::new()))?;
    let payload = value
        .get_mut("payload")
        .map(Value::take)
        .unwrap_or(Value::Null);
    Ok((method, payload))
}

fn join_call<T: DeserializeOwned>(
    method: &str,
    payload: Value,
    known: &[&str],
) -> Result<T, ProtocolError> {
    if !known.contains(&method) {
        return Err(ProtocolError::UnknownMethod(method.to_string()));
    }

    let mut map = Map::new();
    map.insert("method".into(), Value::String(method.to_string()));
    if !payload.is_null() {
        map.insert("payload".into(), payload);
    }
    Ok(serde_json::from_value(Value::Object(map))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn host_calls() -> Vec<HostCall> {
        let tx = SessionRef::transaction(SessionKey::from("tx-1"));
        let page = SessionRef::page(SessionKey::from("page-1"));
        vec![
            HostCall::Render(RenderPayload {
                session: tx.clone(),
                to_render: json!({"kind": "INPUT_TEXT", "label": "Name"}),
            }),
            HostCall::LoadingState(LoadingStatePayload {
                session: page.clone(),
                label: Some("Importing".into()),
                items_in_queue: Some(10),
                items_completed: Some(3),
                ..Default::default()
            }),
            HostCall::Redirect(RedirectPayload {
                session: tx.clone(),
                route: Some("dashboard".into()),
                params: Some(json!({"id": 7})),
                ..Default::default()
            }),
            HostCall::Notify(NotifyPayload {
                session: page.clone(),
                message: "done".into(),
                title: None,
            }),
            HostCall::HostReconnected(HostReconnectedPayload {
                session: SessionRef::transaction(SessionKey::from("tx-2")),
                previous_key: Some(SessionKey::from("tx-1")),
            }),
            HostCall::HostClosedUnexpectedly(tx.clone()),
            HostCall::Usurped(page),
        ]
    }

    fn client_calls() -> Vec<ClientCall> {
        let key = SessionKey::from("tx-1");
        vec![
            ClientCall::InitializeClient(InitializeClientPayload {
                client_id: "client-1".into(),
                identity: IdentityContext {
                    user_id: Some("u1".into()),
                    environment: Some("live".into()),
                    ..Default::default()
                },
                client_version: "0.1.0".into(),
            }),
            ClientCall::OpenTransaction(OpenTransactionPayload {
                transaction_id: key.clone(),
                action_slug: "refund-user".into(),
                params: Some(json!({"email": "a@b.c"})),
            }),
            ClientCall::OpenPage(OpenPagePayload {
                page_key: SessionKey::from("page-1"),
                page_slug: "users".into(),
                params: None,
            }),
            ClientCall::RespondToIoCall(RespondPayload {
                session: SessionRef::transaction(key.clone()),
                values: json!(["a", 1, true]),
            }),
            ClientCall::LeaveTransaction(SessionRef::transaction(key)),
            ClientCall::ClosePage(SessionRef::page(SessionKey::from("page-1"))),
        ]
    }

    #[test]
    fn test_host_calls_survive_the_wire() {
        for (id, call) in host_calls().into_iter().enumerate() {
            let envelope = Envelope::host_call(id as u64, &call).unwrap();
            let text = serde_json::to_string(&envelope).unwrap();
            let envelope: Envelope = serde_json::from_str(&text).unwrap();
            let Envelope::Call { id: got_id, method, payload } = envelope else {
                panic!("Expected Call envelope");
            };
            assert_eq!(got_id, id as u64);
            assert_eq!(method, call.method());
            assert_eq!(HostCall::decode(&method, payload).unwrap(), call);
        }
    }

    #[test]
    fn test_client_calls_survive_the_wire() {
        for (id, call) in client_calls().into_iter().enumerate() {
            let frame = Envelope::client_call(id as u64, &call).unwrap().to_frame().unwrap();
            let Envelope::Call { method, payload, .. } = Envelope::from_frame(frame).unwrap() else {
                panic!("Expected Call envelope");
            };
            assert_eq!(method, call.method());
            assert_eq!(ClientCall::decode(&method, payload).unwrap(), call);
        }
    }

    #[test]
    fn test_envelope_wire_shape() {
        let frame = Envelope::Response { id: 4, result: json!(true) }.to_frame().unwrap();
        assert_eq!(frame, json!({"type": "response", "id": 4, "result": true}));

        let failure: Envelope =
            serde_json::from_value(json!({"type": "failure", "id": 9, "error": "nope"})).unwrap();
        assert_eq!(failure.id(), 9);

        let call = Envelope::client_call(
            1,
            &ClientCall::LeaveTransaction(SessionRef::transaction(SessionKey::from("k"))),
        )
        .unwrap();
        assert_eq!(
            call.to_frame().unwrap(),
            json!({
                "type": "call",
                "id": 1,
                "method": "LEAVE_TRANSACTION",
                "payload": {"transactionId": "k"}
            })
        );
    }

    #[test]
    fn test_session_key_extraction() {
        let render = HostCall::decode("RENDER", json!({"pageKey": "p-9", "toRender": {}})).unwrap();
        assert_eq!(render.session_key(), Some(&SessionKey::from("p-9")));

        let reconnected = HostCall::decode(
            "HOST_RECONNECTED",
            json!({"transactionId": "k2", "previousKey": "k1"}),
        )
        .unwrap();
        assert_eq!(reconnected.session_key(), Some(&SessionKey::from("k1")));
        assert_eq!(reconnected.session().key(), Some(&SessionKey::from("k2")));

        let bare = HostCall::decode("HOST_RECONNECTED", json!({"transactionId": "k2"})).unwrap();
        assert_eq!(bare.session_key(), Some(&SessionKey::from("k2")));

        let orphan = HostCall::decode("USURPED", json!({})).unwrap();
        assert_eq!(orphan.session_key(), None);
    }

    #[test]
    fn test_unknown_method_is_protocol_error() {
        let err = HostCall::decode("SELF_DESTRUCT", json!({})).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownMethod(m) if m == "SELF_DESTRUCT"));

        let err = HostCall::decode("RENDER", json!({"transactionId": "k"})).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn test_is_ack() {
        assert!(is_ack(&json!(true)));
        assert!(is_ack(&json!({"ok": 1})));
        assert!(is_ack(&json!(1)));
        assert!(!is_ack(&json!(false)));
        assert!(!is_ack(&Value::Null));
        assert!(!is_ack(&json!(0)));
        assert!(!is_ack(&json!("")));
    }
}
