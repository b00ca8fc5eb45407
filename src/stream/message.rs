// src/stream/message.rs
// JSON-RPC message shapes as they travel over the stream

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

use super::errors::{Result, StreamError};

pub const JSONRPC_VERSION: &str = "2.0";

pub type JsonObject = Map<String, Value>;

/// A JSON-RPC identifier. `null` and a missing `id` are not identifiers,
/// they mark a notification.
///
/// Equality is exact: `1` and `"1"` are different ids.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(Number),
    String(String),
}

impl Eq for RequestId {}

// Must agree with `Number`'s equality: integers by value, floats by value with
// both zeroes hashing alike.
impl Hash for RequestId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            RequestId::Number(n) => {
                if let Some(unsigned) = n.as_u64() {
                    0u8.hash(state);
                    unsigned.hash(state);
                } else if let Some(signed) = n.as_i64() {
                    1u8.hash(state);
                    signed.hash(state);
                } else {
                    let float = n.as_f64().unwrap_or_default();
                    let float = if float == 0.0 { 0.0f64 } else { float };
                    2u8.hash(state);
                    float.to_bits().hash(state);
                }
            }
            RequestId::String(s) => {
                3u8.hash(state);
                s.hash(state);
            }
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{}", n),
            RequestId::String(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for RequestId {
    fn from(id: i64) -> Self {
        RequestId::Number(id.into())
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        RequestId::String(id.to_string())
    }
}

impl From<String> for RequestId {
    fn from(id: String) -> Self {
        RequestId::String(id)
    }
}

impl RequestId {
    pub fn to_value(&self) -> Value {
        match self {
            RequestId::Number(n) => Value::Number(n.clone()),
            RequestId::String(s) => Value::String(s.clone()),
        }
    }

    /// Reads an `id` field. `Ok(None)` means the message carries no identifier.
    fn parse(value: Option<&Value>) -> Result<Option<RequestId>> {
        match value {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => Ok(Some(RequestId::Number(n.clone()))),
            Some(Value::String(s)) => Ok(Some(RequestId::String(s.clone()))),
            Some(other) => Err(StreamError::Classification(format!("invalid id {}", other))),
        }
    }
}

/// The shape of an inbound message, decided from field presence alone.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageKind {
    Response,
    Request,
    Notification,
}

/// Classifies a raw message without touching it.
///
/// A `result` or `error` field makes a response regardless of anything else.
/// Otherwise a string `method` makes a request when an id is present and a
/// notification when it is not.
pub fn classify(message: &Value) -> Result<MessageKind> {
    let object = message
        .as_object()
        .ok_or_else(|| StreamError::Classification("not an object".to_string()))?;

    if object.contains_key("result") || object.contains_key("error") {
        return Ok(MessageKind::Response);
    }

    match object.get("method") {
        Some(Value::String(_)) => {}
        Some(_) => {
            return Err(StreamError::Classification(
                "method must be a string".to_string(),
            ))
        }
        None => {
            return Err(StreamError::Classification(
                "neither a response nor request".to_string(),
            ))
        }
    }

    match RequestId::parse(object.get("id"))? {
        Some(_) => Ok(MessageKind::Request),
        None => Ok(MessageKind::Notification),
    }
}

fn method_of(raw: &JsonObject) -> String {
    raw.get("method")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn envelope(method: &str, params: Option<Value>) -> JsonObject {
    let mut raw = JsonObject::new();
    raw.insert("jsonrpc".to_string(), Value::from(JSONRPC_VERSION));
    raw.insert("method".to_string(), Value::from(method));
    if let Some(params) = params {
        raw.insert("params".to_string(), params);
    }
    raw
}

/// A request: carries a method and an identifier, expects a response.
#[derive(Clone, Debug, PartialEq)]
pub struct Request {
    id: RequestId,
    method: String,
    raw: JsonObject,
}

impl Request {
    /// Builds a request with a freshly generated string id.
    pub fn new(method: &str, params: Option<Value>) -> Self {
        Self::with_id(RequestId::from(Uuid::new_v4().to_string()), method, params)
    }

    pub fn with_id(id: RequestId, method: &str, params: Option<Value>) -> Self {
        let mut raw = envelope(method, params);
        raw.insert("id".to_string(), id.to_value());
        Request {
            id,
            method: method.to_string(),
            raw,
        }
    }

    pub fn id(&self) -> &RequestId {
        &self.id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn params(&self) -> Option<&Value> {
        self.raw.get("params")
    }

    pub fn as_object(&self) -> &JsonObject {
        &self.raw
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.raw.clone())
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.raw)
    }
}

/// A one-way message: a method and no identifier.
#[derive(Clone, Debug, PartialEq)]
pub struct Notification {
    method: String,
    raw: JsonObject,
}

impl Notification {
    pub fn new(method: &str, params: Option<Value>) -> Self {
        Notification {
            method: method.to_string(),
            raw: envelope(method, params),
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn params(&self) -> Option<&Value> {
        self.raw.get("params")
    }

    pub fn as_object(&self) -> &JsonObject {
        &self.raw
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.raw)
    }
}

/// A response: carries `result` or `error`. The id may be unusable (null or
/// of a bad type), in which case it can never match a pending call.
#[derive(Clone, Debug, PartialEq)]
pub struct Response {
    id: Option<RequestId>,
    raw: JsonObject,
}

impl Response {
    pub fn ok(id: RequestId, result: Value) -> Self {
        let mut raw = JsonObject::new();
        raw.insert("id".to_string(), id.to_value());
        raw.insert("jsonrpc".to_string(), Value::from(JSONRPC_VERSION));
        raw.insert("result".to_string(), result);
        Response { id: Some(id), raw }
    }

    pub fn error(id: RequestId, code: i64, message: &str) -> Self {
        let mut error = JsonObject::new();
        error.insert("code".to_string(), Value::from(code));
        error.insert("message".to_string(), Value::from(message));

        let mut raw = JsonObject::new();
        raw.insert("id".to_string(), id.to_value());
        raw.insert("jsonrpc".to_string(), Value::from(JSONRPC_VERSION));
        raw.insert("error".to_string(), Value::Object(error));
        Response { id: Some(id), raw }
    }

    pub fn id(&self) -> Option<&RequestId> {
        self.id.as_ref()
    }

    /// The id as it should appear in diagnostics, even when unusable.
    pub fn id_label(&self) -> String {
        match (&self.id, self.raw.get("id")) {
            (Some(id), _) => id.to_string(),
            (None, Some(raw)) => raw.to_string(),
            (None, None) => "undefined".to_string(),
        }
    }

    pub fn result(&self) -> Option<&Value> {
        self.raw.get("result")
    }

    pub fn error_value(&self) -> Option<&Value> {
        self.raw.get("error")
    }

    pub fn as_object(&self) -> &JsonObject {
        &self.raw
    }

    pub fn into_object(self) -> JsonObject {
        self.raw
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.raw)
    }
}

/// A message decoded once at the transport boundary.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    Response(Response),
    Request(Request),
    Notification(Notification),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Response(_) => MessageKind::Response,
            Message::Request(_) => MessageKind::Request,
            Message::Notification(_) => MessageKind::Notification,
        }
    }

    pub fn decode(value: Value) -> Result<Message> {
        let kind = classify(&value)?;
        let raw = match value {
            Value::Object(raw) => raw,
            _ => return Err(StreamError::Classification("not an object".to_string())),
        };

        Ok(match kind {
            MessageKind::Response => {
                let id = RequestId::parse(raw.get("id")).ok().flatten();
                Message::Response(Response { id, raw })
            }
            MessageKind::Request => {
                let id = RequestId::parse(raw.get("id"))?.ok_or_else(|| {
                    StreamError::Classification("request without id".to_string())
                })?;
                Message::Request(Request {
                    id,
                    method: method_of(&raw),
                    raw,
                })
            }
            MessageKind::Notification => Message::Notification(Notification {
                method: method_of(&raw),
                raw,
            }),
        })
    }

    pub fn into_value(self) -> Value {
        match self {
            Message::Response(response) => response.into_value(),
            Message::Request(request) => request.into_value(),
            Message::Notification(notification) => notification.into_value(),
        }
    }
}

/// The caller-owned response object a pending call resolves into.
///
/// Clones share the same object, so the caller can keep one and read it after
/// completion while the engine writes through another.
#[derive(Clone, Debug, Default)]
pub struct ResponseSlot(Arc<Mutex<JsonObject>>);

impl ResponseSlot {
    pub fn new(initial: JsonObject) -> Self {
        ResponseSlot(Arc::new(Mutex::new(initial)))
    }

    /// A slot seeded with the request's `id` and `jsonrpc` fields.
    pub fn for_request(request: &Request) -> Self {
        let mut initial = JsonObject::new();
        initial.insert("id".to_string(), request.id().to_value());
        let version = request
            .as_object()
            .get("jsonrpc")
            .cloned()
            .unwrap_or_else(|| Value::from(JSONRPC_VERSION));
        initial.insert("jsonrpc".to_string(), version);
        Self::new(initial)
    }

    fn lock(&self) -> MutexGuard<'_, JsonObject> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Shallow field-by-field overwrite; fields not present in `fields` survive.
    pub fn merge(&self, fields: JsonObject) {
        let mut slot = self.lock();
        for (key, value) in fields {
            slot.insert(key, value);
        }
    }

    pub fn snapshot(&self) -> JsonObject {
        self.lock().clone()
    }

    pub fn get(&self, field: &str) -> Option<Value> {
        self.lock().get(field).cloned()
    }
}
