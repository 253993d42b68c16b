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

//! Helpers for exercising handlers without a server: an in-memory
//! transport and a factory for requests shaped like the ones the server
//! sends.

use crate::httprequest::HttpRequest;
use crate::jsonrequest::JsonRequest;
use crate::request::{Envelope, ParseError, Request, RequestRegistry};
use crate::table::{HeaderValue, Table};
use crate::tnetstring::{self, Value};
use crate::transport::{InboundSocket, OutboundSocket, RequestSocket, Transport, TransportError};
use crate::websocket::{Opcode, WebSocketFrame};
use crate::xmlrequest::XmlRequest;
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

pub const DEFAULT_TEST_UUID: &str = "BD17D85C-4730-4BF2-999D-9D2B2E0FCCF9";
pub const DEFAULT_CONN_ID: u64 = 0;
pub const TEST_SEND_SPEC: &str = "tcp://127.0.0.1:9998";
pub const TEST_RECV_SPEC: &str = "tcp://127.0.0.1:9997";
pub const DEFAULT_TESTING_HOST: &str = "localhost";
pub const DEFAULT_TESTING_PORT: u16 = 8080;
pub const DEFAULT_TESTING_ROUTE: &str = "/a_handler";

const DEFAULT_TESTING_HEADERS: &[(&str, &str)] = &[
    ("x-forwarded-for", "127.0.0.1"),
    ("accept-language", "en-US,en;q=0.8"),
    ("accept-encoding", "gzip,deflate,sdch"),
    ("connection", "keep-alive"),
    ("accept-charset", "UTF-8,*;q=0.5"),
    ("accept", "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
    ("user-agent", "m2handler-testing"),
    ("VERSION", "HTTP/1.1"),
];

type Responder = Box<dyn FnMut(&[u8]) -> Vec<u8> + Send>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

struct Shared {
    incoming_tx: Mutex<mpsc::Sender<Vec<u8>>>,
    incoming_rx: Mutex<mpsc::Receiver<Vec<u8>>>,
    sent: Mutex<Vec<Vec<u8>>>,
    sent_cond: Condvar,
    opened: Mutex<Vec<String>>,
    identities: Mutex<Vec<String>>,
    responder: Mutex<Option<Responder>>,
    requests: Mutex<Vec<Vec<u8>>>,
}

/// A [`Transport`] whose sockets are in-process queues. Clones share the
/// same queues, so a test can keep one clone and hand another to the code
/// under test.
#[derive(Clone)]
pub struct MemoryTransport {
    shared: Arc<Shared>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();

        Self {
            shared: Arc::new(Shared {
                incoming_tx: Mutex::new(tx),
                incoming_rx: Mutex::new(rx),
                sent: Mutex::new(Vec::new()),
                sent_cond: Condvar::new(),
                opened: Mutex::new(Vec::new()),
                identities: Mutex::new(Vec::new()),
                responder: Mutex::new(None),
                requests: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Queues a message for inbound sockets to receive.
    pub fn push<T: Into<Vec<u8>>>(&self, msg: T) {
        // the receiver lives as long as the sender, in `shared`
        let _ = lock(&self.shared.incoming_tx).send(msg.into());
    }

    /// Everything sent on outbound sockets so far.
    pub fn sent(&self) -> Vec<Vec<u8>> {
        lock(&self.shared.sent).clone()
    }

    pub fn take_sent(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *lock(&self.shared.sent))
    }

    /// Waits until at least `count` messages have been sent, returning
    /// whether they were.
    pub fn wait_for_sent(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut sent = lock(&self.shared.sent);

        while sent.len() < count {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }

            sent = match self.shared.sent_cond.wait_timeout(sent, deadline - now) {
                Ok((guard, _)) => guard,
                Err(e) => e.into_inner().0,
            };
        }

        true
    }

    /// Addresses of every socket opened, in order.
    pub fn opened(&self) -> Vec<String> {
        lock(&self.shared.opened).clone()
    }

    /// Identities given to outbound sockets, in order.
    pub fn identities(&self) -> Vec<String> {
        lock(&self.shared.identities).clone()
    }

    /// Sets the function that answers request sockets.
    pub fn set_responder<F>(&self, f: F)
    where
        F: FnMut(&[u8]) -> Vec<u8> + Send + 'static,
    {
        *lock(&self.shared.responder) = Some(Box::new(f));
    }

    /// Messages sent on request sockets.
    pub fn requests(&self) -> Vec<Vec<u8>> {
        lock(&self.shared.requests).clone()
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

struct MemoryInbound {
    shared: Arc<Shared>,
}

impl InboundSocket for MemoryInbound {
    fn recv(&mut self, timeout: Option<Duration>) -> Result<Option<Vec<u8>>, TransportError> {
        let rx = lock(&self.shared.incoming_rx);

        match timeout {
            Some(t) => match rx.recv_timeout(t) {
                Ok(msg) => Ok(Some(msg)),
                Err(mpsc::RecvTimeoutError::Timeout) => Ok(None),
                Err(mpsc::RecvTimeoutError::Disconnected) => Err(TransportError::Disconnected),
            },
            None => match rx.recv() {
                Ok(msg) => Ok(Some(msg)),
                Err(_) => Err(TransportError::Disconnected),
            },
        }
    }
}

struct MemoryOutbound {
    shared: Arc<Shared>,
}

impl OutboundSocket for MemoryOutbound {
    fn send(&mut self, msg: &[u8]) -> Result<(), TransportError> {
        lock(&self.shared.sent).push(msg.to_vec());
        self.shared.sent_cond.notify_all();

        Ok(())
    }
}

struct MemoryRequest {
    shared: Arc<Shared>,
}

impl RequestSocket for MemoryRequest {
    fn request(&mut self, msg: &[u8], _timeout: Option<Duration>) -> Result<Vec<u8>, TransportError> {
        lock(&self.shared.requests).push(msg.to_vec());

        match &mut *lock(&self.shared.responder) {
            Some(f) => Ok(f(msg)),
            None => Err(TransportError::TimedOut),
        }
    }
}

impl Transport for MemoryTransport {
    fn open_inbound(&self, spec: &str) -> Result<Box<dyn InboundSocket>, TransportError> {
        lock(&self.shared.opened).push(spec.to_string());

        Ok(Box::new(MemoryInbound {
            shared: Arc::clone(&self.shared),
        }))
    }

    fn open_outbound(
        &self,
        spec: &str,
        identity: &str,
    ) -> Result<Box<dyn OutboundSocket>, TransportError> {
        lock(&self.shared.opened).push(spec.to_string());
        lock(&self.shared.identities).push(identity.to_string());

        Ok(Box::new(MemoryOutbound {
            shared: Arc::clone(&self.shared),
        }))
    }

    fn open_request(&self, spec: &str) -> Result<Box<dyn RequestSocket>, TransportError> {
        lock(&self.shared.opened).push(spec.to_string());

        Ok(Box::new(MemoryRequest {
            shared: Arc::clone(&self.shared),
        }))
    }
}

/// Builds requests the way the server would send them for a handler
/// mounted at `route`.
pub struct RequestFactory {
    pub sender_id: String,
    pub conn_id: u64,
    pub host: String,
    pub port: u16,
    pub route: String,
    pub headers: Table,
}

impl Default for RequestFactory {
    fn default() -> Self {
        Self {
            sender_id: DEFAULT_TEST_UUID.to_string(),
            conn_id: DEFAULT_CONN_ID,
            host: DEFAULT_TESTING_HOST.to_string(),
            port: DEFAULT_TESTING_PORT,
            route: DEFAULT_TESTING_ROUTE.to_string(),
            headers: DEFAULT_TESTING_HEADERS.iter().copied().collect(),
        }
    }
}

impl RequestFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_route(route: &str) -> Self {
        Self {
            route: route.to_string(),
            ..Self::default()
        }
    }

    fn headers_for(&self, method: &str, uri: &str) -> Table {
        let mut headers = self.headers.clone();

        let (path, query) = match uri.split_once('?') {
            Some((p, q)) => (p, Some(q)),
            None => (uri, None),
        };

        headers.set("URI", uri);
        headers.set("PATH", path);
        headers.set("METHOD", method);
        headers.set("host", format!("{}:{}", self.host, self.port));
        if let Some(q) = query {
            headers.set("QUERY", q);
        }
        headers.set("PATTERN", self.route.as_str());

        headers
    }

    fn envelope(&self, path: &str, headers: Table, body: &[u8]) -> Envelope {
        let mut env = Envelope::new(&self.sender_id, self.conn_id, path);
        env.headers = headers;
        env.body = body.to_vec();

        env
    }

    fn http(&self, method: &str, uri: &str, body: &[u8]) -> HttpRequest {
        let path = uri.split('?').next().unwrap_or(uri);

        HttpRequest::from_envelope(self.envelope(path, self.headers_for(method, uri), body))
    }

    pub fn get(&self, uri: &str) -> HttpRequest {
        self.http("GET", uri, b"")
    }

    pub fn head(&self, uri: &str) -> HttpRequest {
        self.http("HEAD", uri, b"")
    }

    pub fn options(&self, uri: &str) -> HttpRequest {
        self.http("OPTIONS", uri, b"")
    }

    pub fn delete(&self, uri: &str) -> HttpRequest {
        self.http("DELETE", uri, b"")
    }

    pub fn post(&self, uri: &str, body: &[u8]) -> HttpRequest {
        self.http("POST", uri, body)
    }

    pub fn put(&self, uri: &str, body: &[u8]) -> HttpRequest {
        self.http("PUT", uri, body)
    }

    pub fn json(&self, path: &str, data: &serde_json::Value) -> Result<JsonRequest, ParseError> {
        let mut headers = Table::new();
        headers.set("METHOD", "JSON");
        headers.set("PATH", path);

        JsonRequest::from_envelope(self.envelope(path, headers, data.to_string().as_bytes()))
    }

    /// The notice the server sends when a client goes away.
    pub fn disconnect(&self) -> JsonRequest {
        let mut headers = Table::new();
        headers.set("METHOD", "JSON");
        headers.set("PATH", "@*");

        let body = br#"{"type":"disconnect"}"#;

        match JsonRequest::from_envelope(self.envelope("@*", headers, body)) {
            Ok(req) => req,
            Err(e) => panic!("disconnect notice failed to parse: {}", e),
        }
    }

    pub fn xml(&self, path: &str, body: &str) -> Result<XmlRequest, ParseError> {
        let mut headers = Table::new();
        headers.set("METHOD", "XML");
        headers.set("PATH", path);

        XmlRequest::from_envelope(self.envelope(path, headers, body.as_bytes()))
    }

    /// A frame from a client of a WebSocket handler mounted at the route.
    pub fn websocket(&self, opcode: Opcode, payload: &[u8]) -> WebSocketFrame {
        self.websocket_with_flags(crate::websocket::FIN_FLAG | opcode.bits(), payload)
    }

    pub fn websocket_with_flags(&self, flags: u8, payload: &[u8]) -> WebSocketFrame {
        let mut headers = self.headers_for("WEBSOCKET", &self.route);
        headers.set("FLAGS", format!("0x{:x}", flags));

        match WebSocketFrame::from_envelope(self.envelope(&self.route, headers, payload)) {
            Ok(f) => f,
            Err(e) => panic!("frame flags failed to parse: {}", e),
        }
    }

    /// The raw wire form of a request with `headers` and `body`.
    pub fn wire(&self, path: &str, headers: &Table, body: &[u8]) -> Vec<u8> {
        let map = Value::Map(
            headers
                .iter()
                .map(|(k, v)| {
                    let v = match v {
                        HeaderValue::Single(s) => Value::from(s.as_str()),
                        HeaderValue::List(l) => {
                            Value::Array(l.iter().map(|s| Value::from(s.as_str())).collect())
                        }
                    };

                    (wire_key(k), v)
                })
                .collect(),
        );

        let mut out = format!("{} {} {} ", self.sender_id, self.conn_id, path).into_bytes();
        out.extend_from_slice(&map.to_bytes());
        out.extend_from_slice(&tnetstring::encode(body));

        out
    }

    /// The raw wire form of an HTTP request.
    pub fn wire_http(&self, method: &str, uri: &str, body: &[u8]) -> Vec<u8> {
        let path = uri.split('?').next().unwrap_or(uri);

        self.wire(path, &self.headers_for(method, uri), body)
    }

    /// Parses a raw message with the built-in request types.
    pub fn parse(raw: &[u8]) -> Result<Request, ParseError> {
        RequestRegistry::new().parse(raw, Default::default())
    }
}

// the server sends its own fields in upper case
fn wire_key(key: &str) -> String {
    match key {
        "method" | "version" | "uri" | "path" | "query" | "pattern" | "flags" => {
            key.to_ascii_uppercase()
        }
        k => k.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factory_http() {
        let f = RequestFactory::new();

        let req = f.get("/a_handler/thing?x=1");
        assert_eq!(req.method(), "GET");
        assert_eq!(req.path(), "/a_handler/thing");
        assert_eq!(req.query(), Some("x=1"));
        assert_eq!(req.headers().get_str("host"), Some("localhost:8080"));
        assert_eq!(req.headers().get_str("pattern"), Some("/a_handler"));
        assert_eq!(req.sender_id(), DEFAULT_TEST_UUID);
        assert!(req.is_keepalive());

        let req = f.post("/a_handler", b"data");
        assert_eq!(req.method(), "POST");
        assert_eq!(req.body(), b"data");
    }

    #[test]
    fn factory_wire_round_trip() {
        let f = RequestFactory::new();

        let raw = f.wire_http("PUT", "/a_handler/x", b"body");
        let req = RequestFactory::parse(&raw).unwrap();

        match req {
            Request::Http(r) => {
                assert_eq!(r.method(), "PUT");
                assert_eq!(r.path(), "/a_handler/x");
                assert_eq!(r.body(), b"body");
                assert_eq!(r.version(), Some("HTTP/1.1"));
            }
            r => panic!("unexpected request {:?}", r),
        }
    }

    #[test]
    fn factory_others() {
        let f = RequestFactory::new();

        assert!(f.disconnect().is_disconnect());

        let req = f.json("/chat", &serde_json::json!({"type": "msg"})).unwrap();
        assert!(!req.is_disconnect());

        let req = f.xml("/feed", "<root><a/></root>").unwrap();
        assert_eq!(req.root_name(), "root");

        let frame = f.websocket(Opcode::Ping, b"Hello");
        assert_eq!(frame.opcode(), Opcode::Ping);
        assert!(frame.fin());
        assert_eq!(frame.payload(), b"Hello");
    }

    #[test]
    fn memory_transport() {
        let t = MemoryTransport::new();

        let mut inbound = t.open_inbound("a").unwrap();
        assert_eq!(inbound.recv(Some(Duration::from_millis(1))).unwrap(), None);

        t.push("hello");
        assert_eq!(inbound.recv(None).unwrap(), Some(b"hello".to_vec()));

        let mut outbound = t.open_outbound("b", "ident").unwrap();
        outbound.send(b"out").unwrap();
        assert!(t.wait_for_sent(1, Duration::from_millis(1)));
        assert!(!t.wait_for_sent(2, Duration::from_millis(1)));
        assert_eq!(t.take_sent(), vec![b"out".to_vec()]);

        let mut req = t.open_request("c").unwrap();
        assert!(matches!(req.request(b"x", None), Err(TransportError::TimedOut)));

        t.set_responder(|msg| msg.to_vec());
        assert_eq!(req.request(b"y", None).unwrap(), b"y");
        assert_eq!(t.requests(), vec![b"x".to_vec(), b"y".to_vec()]);

        assert_eq!(t.opened(), vec!["a", "b", "c"]);
        assert_eq!(t.identities(), vec!["ident"]);
    }
}
