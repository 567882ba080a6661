//! Request Protocol - JSON envelope in, JSON reply out
//!
//! A request is one JSON object:
//! `{ "method": ..., "uri": "/a/b", "body": <value | json string>, "seq": n }`
//! No framing header: a request is complete once the bytes read so far
//! form one whole JSON value.

use serde::de::IgnoredAny;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;

use crate::error::{MeshError, Result};

fn root_uri() -> String {
    "/".to_string()
}

/// Wire envelope
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Request {
    #[serde(default)]
    pub method: String,
    #[serde(default = "root_uri")]
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<Value>,
}

impl Request {
    pub fn new(method: Method, uri: impl Into<String>) -> Self {
        Self {
            method: method.as_str().to_string(),
            uri: uri.into(),
            body: None,
            seq: None,
        }
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_seq(mut self, seq: impl Into<Value>) -> Self {
        self.seq = Some(seq.into());
        self
    }

    pub fn method(&self) -> Result<Method> {
        self.method.parse()
    }

    /// `body` with JSON-encoded strings decoded; see [`decode_body`]
    pub fn decoded_body(&self) -> Option<Value> {
        self.body.clone().map(decode_body)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Set,
    Run,
    Show,
    ShowAll,
    Add,
    /// Reserved, no handler
    Pub,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "get",
            Method::Set => "set",
            Method::Run => "run",
            Method::Show => "show",
            Method::ShowAll => "showall",
            Method::Add => "add",
            Method::Pub => "pub",
        }
    }
}

impl FromStr for Method {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "get" => Ok(Method::Get),
            "set" => Ok(Method::Set),
            "run" => Ok(Method::Run),
            "show" => Ok(Method::Show),
            "showall" => Ok(Method::ShowAll),
            "add" => Ok(Method::Add),
            "pub" => Ok(Method::Pub),
            other => Err(MeshError::UnknownMethod(other.to_string())),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A string that parses as JSON becomes the parsed value; any other
/// string stays a raw string. Non-strings pass through.
pub fn decode_body(body: Value) -> Value {
    match body {
        Value::String(text) => serde_json::from_str(&text).unwrap_or(Value::String(text)),
        other => other,
    }
}

/// Like [`decode_body`] but a string must hold valid JSON
pub fn decode_body_strict(body: Value) -> Result<Value> {
    match body {
        Value::String(text) => {
            serde_json::from_str(&text).map_err(|e| MeshError::Decode(e.to_string()))
        }
        other => Ok(other),
    }
}

/// State of a partially received request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame {
    /// The buffer starts with one whole JSON value
    Complete,
    /// Valid so far, more bytes needed
    Incomplete,
    /// Cannot become JSON
    Invalid,
}

pub fn frame_status(buf: &[u8]) -> Frame {
    let mut values = serde_json::Deserializer::from_slice(buf).into_iter::<IgnoredAny>();
    match values.next() {
        None => Frame::Incomplete,
        Some(Ok(_)) => Frame::Complete,
        Some(Err(e)) if e.is_eof() => Frame::Incomplete,
        Some(Err(_)) => Frame::Invalid,
    }
}

/// Decode the first JSON value in `buf` as a request envelope
pub fn decode_request(buf: &[u8]) -> Result<Request> {
    let value = serde_json::Deserializer::from_slice(buf)
        .into_iter::<Value>()
        .next()
        .ok_or_else(|| MeshError::Decode("empty request".into()))?
        .map_err(|e| MeshError::Decode(e.to_string()))?;

    if !value.is_object() {
        return Err(MeshError::Decode("request is not an object".into()));
    }
    serde_json::from_value(value).map_err(|e| MeshError::Decode(e.to_string()))
}

/// Outcome of `add`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppStatus {
    Running,
    AlreadyRunning,
    Error,
}

impl AppStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppStatus::Running => "running",
            AppStatus::AlreadyRunning => "already running",
            AppStatus::Error => "error",
        }
    }
}

/// What goes back on the connection
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Compact JSON
    Json(Value),
    /// Indented JSON, for `show` / `showall`
    Pretty(Value),
}

impl Reply {
    pub fn json_error() -> Self {
        Reply::Json(json!({"json": "error"}))
    }

    pub fn message_error() -> Self {
        Reply::Json(json!({"message": "error"}))
    }

    pub fn app_error() -> Self {
        Reply::Json(json!({"app": "error"}))
    }

    pub fn app(status: AppStatus, port: u16) -> Self {
        Reply::Json(json!({"app": status.as_str(), "port": port}))
    }

    /// Wire rendering of each error kind
    pub fn from_error(err: &MeshError) -> Self {
        match err {
            MeshError::Decode(_) | MeshError::Json(_) => Reply::json_error(),
            MeshError::UnknownWorker(_) | MeshError::WorkerRunning(_) => Reply::app_error(),
            MeshError::BindFailed { port, .. } => Reply::app(AppStatus::Error, *port),
            MeshError::UnknownMethod(_)
            | MeshError::RootNotMapping
            | MeshError::InvalidInterval
            | MeshError::Io(_) => Reply::message_error(),
        }
    }

    pub fn value(&self) -> &Value {
        match self {
            Reply::Json(v) | Reply::Pretty(v) => v,
        }
    }

    /// Wrap as `{"seq": .., "body": ..}` when the request carried a `seq`
    pub fn with_seq(self, seq: Option<Value>) -> Self {
        let Some(seq) = seq else {
            return self;
        };
        match self {
            Reply::Json(body) => Reply::Json(json!({"seq": seq, "body": body})),
            Reply::Pretty(body) => Reply::Pretty(json!({"seq": seq, "body": body})),
        }
    }

    /// Bytes to write, newline terminated
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = match self {
            Reply::Json(v) => serde_json::to_vec(v)?,
            Reply::Pretty(v) => serde_json::to_vec_pretty(v)?,
        };
        out.push(b'\n');
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_defaults() {
        let req = decode_request(br#"{"method":"get"}"#).unwrap();
        assert_eq!(req.method().unwrap(), Method::Get);
        assert_eq!(req.uri, "/");
        assert!(req.body.is_none());
        assert!(req.seq.is_none());
    }

    #[test]
    fn test_decode_errors() {
        assert!(matches!(decode_request(b"not-json"), Err(MeshError::Decode(_))));
        assert!(matches!(decode_request(b"[1,2]"), Err(MeshError::Decode(_))));
        assert!(matches!(
            decode_request(br#"{"method":"get","uri":5}"#),
            Err(MeshError::Decode(_))
        ));
    }

    #[test]
    fn test_unknown_and_missing_method() {
        let req = decode_request(br#"{"method":"delete"}"#).unwrap();
        assert!(matches!(req.method(), Err(MeshError::UnknownMethod(_))));

        let req = decode_request(br#"{"uri":"/a"}"#).unwrap();
        assert!(matches!(req.method(), Err(MeshError::UnknownMethod(_))));
    }

    #[test]
    fn test_body_string_decoding() {
        assert_eq!(decode_body(json!("{\"x\":1}")), json!({"x": 1}));
        assert_eq!(decode_body(json!("5")), json!(5));
        assert_eq!(decode_body(json!("plain text")), json!("plain text"));
        assert_eq!(decode_body(json!({"x": 1})), json!({"x": 1}));

        assert!(decode_body_strict(json!("{bad")).is_err());
        assert_eq!(
            decode_body_strict(json!("{\"port\":5002}")).unwrap(),
            json!({"port": 5002})
        );
    }

    #[test]
    fn test_frame_status() {
        assert_eq!(frame_status(b""), Frame::Incomplete);
        assert_eq!(frame_status(b"  \n"), Frame::Incomplete);
        assert_eq!(frame_status(br#"{"method":"ge"#), Frame::Incomplete);
        assert_eq!(frame_status(br#"{"method":"get"}"#), Frame::Complete);
        assert_eq!(frame_status(b"{\"method\":\"get\"}\n{\"x\""), Frame::Complete);
        assert_eq!(frame_status(b"not-json"), Frame::Invalid);
    }

    #[test]
    fn test_method_names() {
        for name in ["get", "set", "run", "show", "showall", "add", "pub"] {
            let method: Method = name.parse().unwrap();
            assert_eq!(method.as_str(), name);
        }
    }

    #[test]
    fn test_error_replies() {
        assert_eq!(
            Reply::from_error(&MeshError::Decode("x".into())).value(),
            &json!({"json": "error"})
        );
        assert_eq!(
            Reply::from_error(&MeshError::UnknownMethod("x".into())).value(),
            &json!({"message": "error"})
        );
        assert_eq!(
            Reply::from_error(&MeshError::UnknownWorker("x".into())).value(),
            &json!({"app": "error"})
        );
        assert_eq!(
            Reply::from_error(&MeshError::BindFailed {
                port: 5002,
                reason: "in use".into()
            })
            .value(),
            &json!({"app": "error", "port": 5002})
        );
    }

    #[test]
    fn test_seq_wrapping_and_encoding() {
        let reply = Reply::Json(json!({"x": 1})).with_seq(Some(json!(7)));
        assert_eq!(reply.value(), &json!({"seq": 7, "body": {"x": 1}}));
        assert_eq!(Reply::Json(json!(1)).with_seq(None), Reply::Json(json!(1)));

        let bytes = Reply::Json(json!({"a": 1})).encode().unwrap();
        assert_eq!(bytes, b"{\"a\":1}\n");
        let pretty = Reply::Pretty(json!({"a": 1})).encode().unwrap();
        assert!(String::from_utf8(pretty).unwrap().contains("\n  \"a\": 1"));
    }

    #[test]
    fn test_request_serializes_without_empty_fields() {
        let req = Request::new(Method::Set, "/a").with_body(json!({"x": 1}));
        let text = serde_json::to_string(&req).unwrap();
        assert_eq!(text, r#"{"method":"set","uri":"/a","body":{"x":1}}"#);
    }
}
