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

use crate::constants::MAX_BROADCAST_IDENTS;
use crate::request::{self, MethodPolicy, ParseError, Request, RequestRegistry};
use crate::response::Response;
use crate::transport::{InboundSocket, OutboundSocket, Transport, TransportError};
use crate::websocket::FrameError;
use log::{debug, info, warn};
use sha1::{Digest, Sha1};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("operation on closed Connection")]
    Closed,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("too many connection ids to broadcast to ({0}, max {MAX_BROADCAST_IDENTS})")]
    TooManyIds(usize),
}

/// A unique-per-process socket identity for `app_id`.
pub fn make_identifier(app_id: &str) -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_default();

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);

    let mut hasher = Sha1::new();
    hasher.update(app_id.as_bytes());
    hasher.update(host.as_bytes());
    hasher.update(std::process::id().to_string().as_bytes());
    hasher.update(now.to_string().as_bytes());

    hex::encode(hasher.finalize())
}

/// Formats one outbound message: `<sender> <len>:<ids>, <data>`.
pub fn frame_message(sender_id: &str, conn_ids: &[u64], data: &[u8]) -> Vec<u8> {
    let ids = conn_ids
        .iter()
        .map(u64::to_string)
        .collect::<Vec<String>>()
        .join(" ");

    let mut out = format!("{} {}:{}, ", sender_id, ids.len(), ids).into_bytes();
    out.extend_from_slice(data);

    out
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// The pair of sockets a handler talks to the server through: requests
/// arrive on a PULL socket connected to `sub_addr`, responses leave on a PUB
/// socket connected to `pub_addr`.
///
/// Sockets are opened on first use. Each socket has its own lock, so one
/// thread may send while another is blocked receiving.
pub struct Connection {
    app_id: String,
    sub_addr: String,
    pub_addr: String,
    identifier: String,
    transport: Arc<dyn Transport>,
    registry: Arc<RequestRegistry>,
    policy: MethodPolicy,
    inbound: Mutex<Option<Box<dyn InboundSocket>>>,
    outbound: Mutex<Option<Box<dyn OutboundSocket>>>,
    closed: AtomicBool,
}

impl Connection {
    pub fn new(app_id: &str, sub_addr: &str, pub_addr: &str, transport: Arc<dyn Transport>) -> Self {
        Self::with_identifier(
            app_id,
            sub_addr,
            pub_addr,
            transport,
            make_identifier(app_id),
        )
    }

    fn with_identifier(
        app_id: &str,
        sub_addr: &str,
        pub_addr: &str,
        transport: Arc<dyn Transport>,
        identifier: String,
    ) -> Self {
        Self {
            app_id: app_id.to_string(),
            sub_addr: sub_addr.to_string(),
            pub_addr: pub_addr.to_string(),
            identifier,
            transport,
            registry: Arc::new(RequestRegistry::new()),
            policy: MethodPolicy::default(),
            inbound: Mutex::new(None),
            outbound: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_registry(mut self, registry: Arc<RequestRegistry>) -> Self {
        self.registry = registry;

        self
    }

    pub fn with_method_policy(mut self, policy: MethodPolicy) -> Self {
        self.policy = policy;

        self
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    pub fn sub_addr(&self) -> &str {
        &self.sub_addr
    }

    pub fn pub_addr(&self) -> &str {
        &self.pub_addr
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn registry(&self) -> &Arc<RequestRegistry> {
        &self.registry
    }

    pub fn method_policy(&self) -> MethodPolicy {
        self.policy
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn check_open(&self) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }

        Ok(())
    }

    /// Opens both sockets if they aren't open yet.
    pub fn connect(&self) -> Result<(), ConnectionError> {
        {
            let mut inbound = lock(&self.inbound);
            if inbound.is_none() {
                *inbound = Some(self.open_inbound()?);
            }
        }

        let mut outbound = lock(&self.outbound);
        if outbound.is_none() {
            *outbound = Some(self.open_outbound()?);
        }

        Ok(())
    }

    fn open_inbound(&self) -> Result<Box<dyn InboundSocket>, TransportError> {
        info!("connecting PULL socket to {}", self.sub_addr);

        self.transport.open_inbound(&self.sub_addr)
    }

    fn open_outbound(&self) -> Result<Box<dyn OutboundSocket>, TransportError> {
        info!(
            "connecting PUB socket to {} as {}",
            self.pub_addr, self.identifier
        );

        self.transport
            .open_outbound(&self.pub_addr, &self.identifier)
    }

    /// Waits for one raw message, for at most `timeout`.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<Vec<u8>>, ConnectionError> {
        self.recv_inner(Some(timeout))
    }

    /// Waits for one raw message.
    pub fn recv(&self) -> Result<Vec<u8>, ConnectionError> {
        loop {
            if let Some(msg) = self.recv_inner(None)? {
                return Ok(msg);
            }
        }
    }

    fn recv_inner(&self, timeout: Option<Duration>) -> Result<Option<Vec<u8>>, ConnectionError> {
        self.check_open()?;

        let mut guard = lock(&self.inbound);

        let sock = match &mut *guard {
            Some(sock) => sock,
            None => guard.insert(self.open_inbound()?),
        };

        let ret = sock.recv(timeout);

        // close() can't take the socket while we hold it, so finish the job
        if self.is_closed() {
            guard.take();

            return Err(ConnectionError::Closed);
        }

        Ok(ret?)
    }

    /// Waits for one message and parses it into a request.
    pub fn receive(&self) -> Result<Request, ConnectionError> {
        let raw = self.recv()?;

        self.parse(&raw)
    }

    pub fn receive_timeout(&self, timeout: Duration) -> Result<Option<Request>, ConnectionError> {
        match self.recv_timeout(timeout)? {
            Some(raw) => Ok(Some(self.parse(&raw)?)),
            None => Ok(None),
        }
    }

    fn parse(&self, raw: &[u8]) -> Result<Request, ConnectionError> {
        let req = request::parse(raw, &self.registry, self.policy)?;

        debug!(
            "received {} from {}:{}",
            req.method().unwrap_or("(no method)"),
            req.sender_id(),
            req.conn_id()
        );

        Ok(req)
    }

    fn send_raw(&self, msg: &[u8]) -> Result<(), ConnectionError> {
        self.check_open()?;

        let mut guard = lock(&self.outbound);

        let sock = match &mut *guard {
            Some(sock) => sock,
            None => guard.insert(self.open_outbound()?),
        };

        Ok(sock.send(msg)?)
    }

    /// Sends `data` to one connection of the server `sender_id`.
    pub fn send(&self, sender_id: &str, conn_id: u64, data: &[u8]) -> Result<(), ConnectionError> {
        self.send_raw(&frame_message(sender_id, &[conn_id], data))
    }

    /// Sends `response` to the connection it is addressed to.
    pub fn reply(&self, response: &Response) -> Result<(), ConnectionError> {
        let data = response.to_bytes()?;

        self.send(response.sender_id(), response.conn_id(), &data)
    }

    /// Sends `data` to several connections of the server `sender_id` in one
    /// message.
    pub fn broadcast(
        &self,
        sender_id: &str,
        conn_ids: &[u64],
        data: &[u8],
    ) -> Result<(), ConnectionError> {
        self.check_open()?;

        if conn_ids.len() > MAX_BROADCAST_IDENTS {
            return Err(ConnectionError::TooManyIds(conn_ids.len()));
        }

        self.send_raw(&frame_message(sender_id, conn_ids, data))
    }

    /// Tells the server to close a connection.
    pub fn send_close(&self, sender_id: &str, conn_id: u64) -> Result<(), ConnectionError> {
        self.send(sender_id, conn_id, b"")
    }

    /// Closes the connection `request` came in on.
    pub fn reply_close(&self, request: &Request) -> Result<(), ConnectionError> {
        self.send_close(request.sender_id(), request.conn_id())
    }

    pub fn broadcast_close(&self, sender_id: &str, conn_ids: &[u64]) -> Result<(), ConnectionError> {
        self.broadcast(sender_id, conn_ids, b"")
    }

    /// Marks the connection closed and drops its sockets. Calling it again
    /// does nothing.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        debug!("closing {}", self);

        lock(&self.outbound).take();

        // a receiver blocked on the socket drops it when it wakes
        match self.inbound.try_lock() {
            Ok(mut guard) => {
                guard.take();
            }
            Err(std::sync::TryLockError::Poisoned(e)) => {
                e.into_inner().take();
            }
            Err(std::sync::TryLockError::WouldBlock) => {
                warn!("inbound socket busy, deferring its close");
            }
        }
    }

    /// A fresh, unconnected copy of this connection with the same endpoints
    /// and identifier.
    pub fn reconnect(&self) -> Connection {
        Self::with_identifier(
            &self.app_id,
            &self.sub_addr,
            &self.pub_addr,
            Arc::clone(&self.transport),
            self.identifier.clone(),
        )
        .with_registry(Arc::clone(&self.registry))
        .with_method_policy(self.policy)
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} <-> {}", self.app_id, self.sub_addr, self.pub_addr)?;

        if self.is_closed() {
            write!(f, " (closed)")?;
        }

        Ok(())
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("app_id", &self.app_id)
            .field("sub_addr", &self.sub_addr)
            .field("pub_addr", &self.pub_addr)
            .field("identifier", &self.identifier)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryTransport;
    use crate::websocket::{Opcode, WebSocketFrame};

    const SUB_ADDR: &str = "tcp://127.0.0.1:9998";
    const PUB_ADDR: &str = "tcp://127.0.0.1:9997";

    fn setup() -> (MemoryTransport, Connection) {
        let transport = MemoryTransport::new();
        let conn = Connection::new("test-app", SUB_ADDR, PUB_ADDR, Arc::new(transport.clone()));

        (transport, conn)
    }

    #[test]
    fn identifier() {
        let id = make_identifier("test-app");
        assert_eq!(id.len(), 40);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn lazy_sockets() {
        let (transport, conn) = setup();
        assert!(transport.opened().is_empty());

        conn.connect().unwrap();
        assert_eq!(transport.opened(), vec![SUB_ADDR.to_string(), PUB_ADDR.to_string()]);

        conn.connect().unwrap();
        assert_eq!(transport.opened().len(), 2);

        assert_eq!(transport.identities(), vec![conn.identifier().to_string()]);
    }

    #[test]
    fn send_and_broadcast() {
        let (transport, conn) = setup();

        conn.send("ABCD", 8, b"x").unwrap();
        conn.broadcast("ABCD", &[8, 16, 44], b"x").unwrap();
        conn.send_close("ABCD", 8).unwrap();
        conn.broadcast_close("ABCD", &[8, 16]).unwrap();

        assert_eq!(
            transport.take_sent(),
            vec![
                b"ABCD 1:8, x".to_vec(),
                b"ABCD 8:8 16 44, x".to_vec(),
                b"ABCD 1:8, ".to_vec(),
                b"ABCD 4:8 16, ".to_vec(),
            ]
        );
    }

    #[test]
    fn broadcast_limit() {
        let (transport, conn) = setup();

        let ids: Vec<u64> = (0..MAX_BROADCAST_IDENTS as u64).collect();
        conn.broadcast("ABCD", &ids, b"x").unwrap();

        let ids: Vec<u64> = (0..(MAX_BROADCAST_IDENTS as u64 + 1)).collect();
        assert!(matches!(
            conn.broadcast("ABCD", &ids, b"x"),
            Err(ConnectionError::TooManyIds(101))
        ));

        assert_eq!(transport.take_sent().len(), 1);
    }

    #[test]
    fn receive_and_reply() {
        let (transport, conn) = setup();

        transport.push(&b"ABCD 8 /handler 16:{\"METHOD\":\"GET\"},0:,"[..]);

        let req = conn.receive_timeout(Duration::from_secs(1)).unwrap().unwrap();
        assert_eq!(req.sender_id(), "ABCD");
        assert_eq!(req.conn_id(), 8);

        let resp = match &req {
            Request::Http(r) => r.response(),
            r => panic!("unexpected request {:?}", r),
        };

        conn.reply(&resp.into()).unwrap();
        conn.reply_close(&req).unwrap();

        let sent = transport.take_sent();
        assert_eq!(sent.len(), 2);
        assert!(sent[0].starts_with(b"ABCD 1:8, HTTP/1.1 204 No Content\r\n"));
        assert_eq!(sent[1], b"ABCD 1:8, ");

        assert!(conn.receive_timeout(Duration::from_millis(10)).unwrap().is_none());
    }

    #[test]
    fn reply_rejects_invalid_frame() {
        let (transport, conn) = setup();

        let mut frame = WebSocketFrame::new("ABCD", 8, "/ws");
        frame.set_opcode(Opcode::Ping);
        frame.set_payload(vec![b'x'; 126]);

        assert!(matches!(
            conn.reply(&frame.into()),
            Err(ConnectionError::Frame(_))
        ));
        assert!(transport.take_sent().is_empty());
    }

    #[test]
    fn close_and_reconnect() {
        let (transport, conn) = setup();

        conn.connect().unwrap();
        assert!(!conn.is_closed());

        conn.close();
        conn.close();
        assert!(conn.is_closed());
        assert_eq!(conn.to_string(), format!("test-app {} <-> {} (closed)", SUB_ADDR, PUB_ADDR));

        let e = conn.send("ABCD", 8, b"x").unwrap_err();
        assert_eq!(e.to_string(), "operation on closed Connection");
        assert!(matches!(conn.recv_timeout(Duration::from_millis(1)), Err(ConnectionError::Closed)));
        assert!(matches!(conn.broadcast("ABCD", &[1], b"x"), Err(ConnectionError::Closed)));

        let fresh = conn.reconnect();
        assert!(!fresh.is_closed());
        assert_eq!(fresh.identifier(), conn.identifier());
        assert_eq!(fresh.app_id(), "test-app");
        assert_eq!(fresh.to_string(), format!("test-app {} <-> {}", SUB_ADDR, PUB_ADDR));

        fresh.send("ABCD", 8, b"x").unwrap();
        assert_eq!(transport.take_sent(), vec![b"ABCD 1:8, x".to_vec()]);
        assert_eq!(transport.opened().len(), 3);
    }

    #[test]
    fn parse_errors_surface() {
        let (transport, conn) = setup();

        transport.push(&b"garbage"[..]);

        assert!(matches!(
            conn.receive_timeout(Duration::from_secs(1)),
            Err(ConnectionError::Parse(_))
        ));
    }
}
