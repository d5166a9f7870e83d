//! The JSON-RPC 2.0 app-message union.
//!
//! Parsing an event's `content` into a [`Message`] *is* the transport's
//! schema-validation step: the `jsonrpc` marker must be exactly `"2.0"`,
//! requests must carry an id, and responses must carry exactly one of
//! `result` / `error`. Anything else fails to deserialize and is dropped by
//! the transports.

use std::fmt::{self, Display};

use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use serde_json::Value;

/// Well-known app-protocol method names the transport inspects.
pub mod method {
    pub const INITIALIZE: &str = "initialize";
    pub const INITIALIZED: &str = "notifications/initialized";
    pub const PROGRESS: &str = "notifications/progress";

    pub const TOOLS_CALL: &str = "tools/call";
    pub const PROMPTS_GET: &str = "prompts/get";
    pub const RESOURCES_READ: &str = "resources/read";

    pub const PAYMENT_REQUIRED: &str = "notifications/payment_required";
    pub const PAYMENT_ACCEPTED: &str = "notifications/payment_accepted";
    pub const PAYMENT_REJECTED: &str = "notifications/payment_rejected";
}

/// The `"2.0"` version marker. Deserializing any other value is an error,
/// which is what rejects non-JSON-RPC payloads during message validation.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct JsonRpcV2;

impl Serialize for JsonRpcV2 {
    fn serialize<S: Serializer>(&self, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str("2.0")
    }
}

impl<'de> Deserialize<'de> for JsonRpcV2 {
    fn deserialize<D: Deserializer<'de>>(de: D) -> Result<Self, D::Error> {
        // NOTE: must deserialize owned; untagged enums buffer their content
        // and can't always hand out borrowed strings.
        let version = String::deserialize(de)?;
        if version == "2.0" {
            Ok(Self)
        } else {
            Err(de::Error::custom(format!(
                "unsupported jsonrpc version: {version}"
            )))
        }
    }
}

/// A JSON-RPC request id: string or integer.
///
/// The transports freely substitute ids (the wire id of a request is the
/// carrying event id), so everything downstream must handle both forms.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl RequestId {
    /// The id as a string key, the form both correlation stores use.
    pub fn as_key(&self) -> String {
        match self {
            Self::Number(n) => n.to_string(),
            Self::String(s) => s.clone(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Number(_) => None,
            Self::String(s) => Some(s),
        }
    }
}

impl Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s}"),
        }
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self::String(s.to_owned())
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

/// A JSON-RPC request.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: JsonRpcV2,
    pub id: RequestId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// A JSON-RPC notification (no id, never answered).
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub jsonrpc: JsonRpcV2,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// A JSON-RPC response: exactly one of `result` / `error`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: JsonRpcV2,
    pub id: RequestId,
    #[serde(flatten)]
    pub payload: ResponsePayload,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponsePayload {
    Result { result: Value },
    Error { error: ErrorObject },
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Any app message. Variant order matters for untagged deserialization:
/// requests carry `id` + `method`, notifications only `method`, responses
/// `id` + `result`/`error`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Request(Request),
    Notification(Notification),
    Response(Response),
}

// --- impl Request --- //

impl Request {
    pub fn new(
        id: impl Into<RequestId>,
        method: &str,
        params: Option<Value>,
    ) -> Self {
        Self {
            jsonrpc: JsonRpcV2,
            id: id.into(),
            method: method.to_owned(),
            params,
        }
    }

    pub fn is_initialize(&self) -> bool {
        self.method == method::INITIALIZE
    }

    /// `params._meta.progressToken`, normalized to a string.
    pub fn progress_token(&self) -> Option<String> {
        meta_field(self.params.as_ref(), "progressToken")
            .and_then(value_as_token)
    }

    /// `params._meta.pmis`: the client's payment-method preference, in
    /// order.
    pub fn client_pmis(&self) -> Option<Vec<String>> {
        let pmis = meta_field(self.params.as_ref(), "pmis")?;
        let pmis = pmis.as_array()?;
        Some(
            pmis.iter()
                .filter_map(|v| v.as_str().map(str::to_owned))
                .collect(),
        )
    }

    /// Injects `params._meta.clientPubkey`, creating `params` / `_meta`
    /// objects as needed.
    pub fn set_client_pubkey(&mut self, pubkey: &str) {
        let params = self
            .params
            .get_or_insert_with(|| Value::Object(Default::default()));
        if !params.is_object() {
            // Positional params; nowhere to hang `_meta` off of.
            return;
        }
        let meta = params
            .as_object_mut()
            .expect("checked is_object above")
            .entry("_meta")
            .or_insert_with(|| Value::Object(Default::default()));
        if let Some(meta) = meta.as_object_mut() {
            meta.insert(
                "clientPubkey".to_owned(),
                Value::String(pubkey.to_owned()),
            );
        }
    }

    /// The capability identifier used for payment matching: `params.name`
    /// for tool/prompt methods, `params.uri` for resource reads. Other
    /// methods have none.
    pub fn capability_identifier(&self) -> Option<&str> {
        let field = match self.method.as_str() {
            method::TOOLS_CALL | method::PROMPTS_GET => "name",
            method::RESOURCES_READ => "uri",
            _ => return None,
        };
        self.params.as_ref()?.get(field)?.as_str()
    }
}

// --- impl Notification --- //

impl Notification {
    pub fn new(method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JsonRpcV2,
            method: method.to_owned(),
            params,
        }
    }

    /// `params.progressToken` for progress notifications, normalized to a
    /// string.
    pub fn progress_token(&self) -> Option<String> {
        self.params
            .as_ref()?
            .get("progressToken")
            .and_then(value_as_token)
    }
}

// --- impl Response --- //

impl Response {
    pub fn result(id: impl Into<RequestId>, result: Value) -> Self {
        Self {
            jsonrpc: JsonRpcV2,
            id: id.into(),
            payload: ResponsePayload::Result { result },
        }
    }

    pub fn error(
        id: impl Into<RequestId>,
        code: i64,
        message: impl Into<String>,
    ) -> Self {
        Self {
            jsonrpc: JsonRpcV2,
            id: id.into(),
            payload: ResponsePayload::Error {
                error: ErrorObject {
                    code,
                    message: message.into(),
                    data: None,
                },
            },
        }
    }
}

// --- impl Message --- //

impl Message {
    /// The method name, for requests and notifications.
    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request(req) => Some(&req.method),
            Self::Notification(notif) => Some(&notif.method),
            Self::Response(_) => None,
        }
    }

    pub fn as_request(&self) -> Option<&Request> {
        match self {
            Self::Request(req) => Some(req),
            _ => None,
        }
    }

    /// Serialize to the wire form carried in an event's `content`.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self)
            .expect("Message serialization is infallible")
    }

    /// Parse and validate an event's `content`.
    pub fn from_json(content: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(content)
    }
}

fn meta_field<'a>(params: Option<&'a Value>, field: &str) -> Option<&'a Value> {
    params?.get("_meta")?.get(field)
}

/// Progress tokens may be strings or integers on the wire.
fn value_as_token(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
