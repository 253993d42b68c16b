/*
 * Copyright (C) 2025 Fastly, Inc.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Inbound messages and the method registry that decides how each one is
//! interpreted.
//!
//! An inbound message looks like:
//!
//! ```text
//! <sender_id> <conn_id> <path> <len>:<headers>,<len>:<body>,
//! ```
//!
//! The headers are either a tnetstring map or, in the older form, a
//! tnetstring string containing a JSON object.

use crate::httprequest::HttpRequest;
use crate::jsonrequest::JsonRequest;
use crate::response::Response;
use crate::table::{HeaderValue, Table};
use crate::tnetstring::{self, Value};
use crate::websocket::WebSocketFrame;
use crate::xmlrequest::XmlRequest;
use log::{debug, info};
use serde::Deserialize;
use std::collections::HashMap;
use std::str;
use std::sync::Mutex;

pub const DEFAULT_METHOD: &str = "GET";

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("malformed envelope: {0}")]
    Envelope(&'static str),

    #[error("invalid connection id {0:?}")]
    ConnId(String),

    #[error("tnetstring: {0}")]
    Tnetstring(#[from] tnetstring::ParseError),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("xml: {0}")]
    Xml(String),

    #[error("unhandled METHOD {0:?}")]
    UnhandledMethod(String),

    #[error("invalid FLAGS header {0:?}")]
    InvalidFlags(String),
}

/// How to treat a message whose `METHOD` header is missing or is not a
/// single word.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MethodPolicy {
    /// Reject the message with [`ParseError::UnhandledMethod`].
    #[default]
    Strict,

    /// Treat the message as a `GET`.
    DefaultToGet,
}

/// The fields common to every inbound message.
#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
    pub sender_id: String,
    pub conn_id: u64,
    pub path: String,
    pub headers: Table,
    pub body: Vec<u8>,

    /// The message as received, if it came off the wire.
    pub raw: Option<Vec<u8>>,
}

impl Envelope {
    pub fn new(sender_id: &str, conn_id: u64, path: &str) -> Self {
        Self {
            sender_id: sender_id.to_string(),
            conn_id,
            path: path.to_string(),
            headers: Table::new(),
            body: Vec::new(),
            raw: None,
        }
    }

    pub fn method(&self) -> Option<&str> {
        self.headers.get_str("METHOD")
    }
}

#[derive(Clone, Debug)]
pub struct GenericRequest {
    envelope: Envelope,
}

impl GenericRequest {
    pub fn from_envelope(envelope: Envelope) -> Self {
        Self { envelope }
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }
}

#[derive(Clone, Debug)]
pub enum Request {
    Http(HttpRequest),
    Json(JsonRequest),
    Xml(XmlRequest),
    WebSocket(WebSocketFrame),
    Generic(GenericRequest),
}

impl Request {
    pub fn envelope(&self) -> &Envelope {
        match self {
            Self::Http(r) => r.envelope(),
            Self::Json(r) => r.envelope(),
            Self::Xml(r) => r.envelope(),
            Self::WebSocket(r) => r.envelope(),
            Self::Generic(r) => r.envelope(),
        }
    }

    pub fn sender_id(&self) -> &str {
        &self.envelope().sender_id
    }

    pub fn conn_id(&self) -> u64 {
        self.envelope().conn_id
    }

    pub fn path(&self) -> &str {
        &self.envelope().path
    }

    pub fn headers(&self) -> &Table {
        &self.envelope().headers
    }

    pub fn body(&self) -> &[u8] {
        &self.envelope().body
    }

    pub fn method(&self) -> Option<&str> {
        self.envelope().method()
    }

    pub fn raw(&self) -> Option<&[u8]> {
        self.envelope().raw.as_deref()
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Http(_) => RequestType::HTTP.name,
            Self::Json(_) => RequestType::JSON.name,
            Self::Xml(_) => RequestType::XML.name,
            Self::WebSocket(_) => RequestType::WEBSOCKET.name,
            Self::Generic(_) => RequestType::GENERIC.name,
        }
    }

    /// Whether this is the server telling us a client went away.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Self::Json(r) => r.is_disconnect(),
            _ => false,
        }
    }

    /// A response addressed to the same client.
    pub fn response(&self) -> Response {
        Response::from_request(self)
    }
}

pub type Constructor = fn(Envelope) -> Result<Request, ParseError>;

/// A named way to build a [`Request`] from an envelope.
#[derive(Clone, Copy)]
pub struct RequestType {
    pub name: &'static str,
    pub construct: Constructor,
}

impl RequestType {
    pub const HTTP: RequestType = RequestType {
        name: "http",
        construct: |e| Ok(Request::Http(HttpRequest::from_envelope(e))),
    };

    pub const JSON: RequestType = RequestType {
        name: "json",
        construct: |e| Ok(Request::Json(JsonRequest::from_envelope(e)?)),
    };

    pub const XML: RequestType = RequestType {
        name: "xml",
        construct: |e| Ok(Request::Xml(XmlRequest::from_envelope(e)?)),
    };

    pub const WEBSOCKET: RequestType = RequestType {
        name: "websocket",
        construct: |e| Ok(Request::WebSocket(WebSocketFrame::from_envelope(e)?)),
    };

    pub const GENERIC: RequestType = RequestType {
        name: "generic",
        construct: |e| Ok(Request::Generic(GenericRequest::from_envelope(e))),
    };
}

impl PartialEq for RequestType {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl std::fmt::Debug for RequestType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RequestType({})", self.name)
    }
}

pub const HTTP_METHODS: &[&str] = &[
    "OPTIONS", "GET", "HEAD", "POST", "PUT", "DELETE", "TRACE", "CONNECT",
];

struct RegistryInner {
    registered: HashMap<String, RequestType>,
    fallback: RequestType,

    // lookups that resolved to the fallback
    cache: HashMap<String, RequestType>,
}

/// Maps `METHOD` header values to request types.
///
/// Methods without an explicit registration resolve to the fallback type.
/// Those lookups are cached, and the cache is dropped whenever the fallback
/// changes.
pub struct RequestRegistry {
    inner: Mutex<RegistryInner>,
}

impl RequestRegistry {
    /// A registry with no registrations and [`RequestType::GENERIC`] as
    /// the fallback.
    pub fn empty() -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                registered: HashMap::new(),
                fallback: RequestType::GENERIC,
                cache: HashMap::new(),
            }),
        }
    }

    pub fn new() -> Self {
        let r = Self::empty();

        r.register(RequestType::HTTP, HTTP_METHODS);
        r.register(RequestType::JSON, &["JSON"]);
        r.register(RequestType::XML, &["XML"]);
        r.register(RequestType::WEBSOCKET, &["WEBSOCKET"]);

        r
    }

    pub fn register(&self, rtype: RequestType, methods: &[&str]) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        for m in methods {
            debug!("registering {} for the {} method", rtype.name, m);

            inner.cache.remove(*m);
            inner.registered.insert(m.to_string(), rtype);
        }
    }

    /// Replaces the fallback type for every unregistered method, including
    /// ones already looked up.
    pub fn register_default(&self, rtype: RequestType) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        info!("registering {} as the default request type", rtype.name);

        inner.fallback = rtype;
        inner.cache.clear();
    }

    pub fn type_for_method(&self, method: &str) -> RequestType {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(t) = inner.registered.get(method) {
            return *t;
        }

        if let Some(t) = inner.cache.get(method) {
            return *t;
        }

        let t = inner.fallback;
        inner.cache.insert(method.to_string(), t);

        t
    }

    /// Number of cached fallback lookups.
    pub fn cached_len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .cache
            .len()
    }

    pub fn parse(&self, raw: &[u8], policy: MethodPolicy) -> Result<Request, ParseError> {
        parse(raw, self, policy)
    }
}

impl Default for RequestRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn split_field(src: &[u8]) -> Option<(&[u8], &[u8])> {
    let pos = src.iter().position(|&c| c == b' ')?;

    Some((&src[..pos], &src[(pos + 1)..]))
}

fn header_value(v: &Value) -> HeaderValue {
    match v {
        Value::Array(items) => HeaderValue::List(items.iter().map(scalar_string).collect()),
        v => HeaderValue::Single(scalar_string(v)),
    }
}

fn scalar_string(v: &Value) -> String {
    match v {
        Value::String(s) => String::from_utf8_lossy(s).into_owned(),
        Value::Null => String::new(),
        v => v.to_string(),
    }
}

fn parse_headers(v: Value) -> Result<Table, ParseError> {
    let v = match v {
        Value::String(s) => {
            debug!("parsing old-style json headers");

            let j: serde_json::Value = serde_json::from_slice(&s)?;
            Value::from_json(&j)
        }
        v => v,
    };

    let entries = match v.as_map() {
        Some(entries) => entries,
        None => return Err(ParseError::Envelope("headers must be a map")),
    };

    let mut headers = Table::new();
    for (k, v) in entries {
        headers.append(k, header_value(v));
    }

    Ok(headers)
}

fn is_word(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_alphanumeric() || c == '_')
}

/// Splits a raw inbound message into its parts and builds the request type
/// registered for its method.
pub fn parse(
    raw: &[u8],
    registry: &RequestRegistry,
    policy: MethodPolicy,
) -> Result<Request, ParseError> {
    let (sender_id, rest) = split_field(raw).ok_or(ParseError::Envelope("missing sender id"))?;
    let (conn_id, rest) = split_field(rest).ok_or(ParseError::Envelope("missing connection id"))?;
    let (path, rest) = split_field(rest).ok_or(ParseError::Envelope("missing path"))?;

    let sender_id =
        str::from_utf8(sender_id).map_err(|_| ParseError::Envelope("sender id is not utf-8"))?;
    let path = str::from_utf8(path).map_err(|_| ParseError::Envelope("path is not utf-8"))?;

    let conn_id = String::from_utf8_lossy(conn_id);
    let conn_id: u64 = conn_id
        .parse()
        .map_err(|_| ParseError::ConnId(conn_id.to_string()))?;

    let (headers, rest) = tnetstring::decode(rest)?;
    let headers = parse_headers(headers)?;

    let (body, _) = tnetstring::parse_string(rest)?;

    debug!(
        "parsing request for {} from {}:{} ({} header(s), {} byte body)",
        path,
        sender_id,
        conn_id,
        headers.len(),
        body.len()
    );

    let method = match headers.get_str("METHOD") {
        Some(m) if is_word(m) => m.to_string(),
        m => match policy {
            MethodPolicy::Strict => {
                return Err(ParseError::UnhandledMethod(m.unwrap_or("").to_string()))
            }
            MethodPolicy::DefaultToGet => {
                debug!("unusable METHOD {:?}, assuming {}", m, DEFAULT_METHOD);
                DEFAULT_METHOD.to_string()
            }
        },
    };

    let rtype = registry.type_for_method(&method);

    let envelope = Envelope {
        sender_id: sender_id.to_string(),
        conn_id,
        path: path.to_string(),
        headers,
        body: body.to_vec(),
        raw: Some(raw.to_vec()),
    };

    (rtype.construct)(envelope)
}
