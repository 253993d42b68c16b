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

use crate::transport::{InboundSocket, OutboundSocket, RequestSocket, Transport, TransportError};
use log::debug;
use std::fmt;
use std::time::Duration;

#[derive(Clone)]
pub struct SpecInfo {
    pub spec: String,
    pub socket_type: zmq::SocketType,
}

impl fmt::Display for SpecInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}:{}", self.socket_type, self.spec)
    }
}

impl fmt::Debug for SpecInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

fn poll_timeout(timeout: Option<Duration>) -> i64 {
    match timeout {
        Some(d) => d.as_millis().min(i64::MAX as u128) as i64,
        None => -1,
    }
}

// handler sockets always connect; the server side binds
fn setup_spec(ctx: &zmq::Context, spec: &SpecInfo) -> Result<zmq::Socket, TransportError> {
    let sock = ctx.socket(spec.socket_type)?;

    sock.set_linger(0)?;

    match sock.connect(&spec.spec) {
        Ok(_) => {
            debug!("connected {}", spec);

            Ok(sock)
        }
        Err(e) => Err(TransportError::Connect(spec.spec.clone(), e)),
    }
}

fn wait_readable(sock: &zmq::Socket, timeout: Option<Duration>) -> Result<bool, TransportError> {
    Ok(sock.poll(zmq::POLLIN, poll_timeout(timeout))? > 0)
}

struct ZmqInbound {
    sock: zmq::Socket,
}

impl InboundSocket for ZmqInbound {
    fn recv(&mut self, timeout: Option<Duration>) -> Result<Option<Vec<u8>>, TransportError> {
        if !wait_readable(&self.sock, timeout)? {
            return Ok(None);
        }

        Ok(Some(self.sock.recv_bytes(0)?))
    }
}

struct ZmqOutbound {
    sock: zmq::Socket,
}

impl OutboundSocket for ZmqOutbound {
    fn send(&mut self, msg: &[u8]) -> Result<(), TransportError> {
        Ok(self.sock.send(msg, 0)?)
    }
}

struct ZmqRequest {
    ctx: zmq::Context,
    spec: SpecInfo,
    sock: Option<zmq::Socket>,
}

impl RequestSocket for ZmqRequest {
    fn request(&mut self, msg: &[u8], timeout: Option<Duration>) -> Result<Vec<u8>, TransportError> {
        let sock = match self.sock.take() {
            Some(sock) => sock,
            None => setup_spec(&self.ctx, &self.spec)?,
        };

        sock.send(msg, 0)?;

        // a REQ socket that missed its reply can't send again, so it is
        // dropped and recreated on the next request
        if !wait_readable(&sock, timeout)? {
            return Err(TransportError::TimedOut);
        }

        let reply = sock.recv_bytes(0)?;

        self.sock = Some(sock);

        Ok(reply)
    }
}

/// ZeroMQ sockets over a shared context: PULL for requests, PUB for
/// responses, REQ for the control port.
#[derive(Clone)]
pub struct ZmqTransport {
    ctx: zmq::Context,
}

impl ZmqTransport {
    pub fn new() -> Self {
        Self::with_context(zmq::Context::new())
    }

    pub fn with_context(ctx: zmq::Context) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &zmq::Context {
        &self.ctx
    }
}

impl Default for ZmqTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for ZmqTransport {
    fn open_inbound(&self, spec: &str) -> Result<Box<dyn InboundSocket>, TransportError> {
        let sock = setup_spec(
            &self.ctx,
            &SpecInfo {
                spec: spec.to_string(),
                socket_type: zmq::PULL,
            },
        )?;

        Ok(Box::new(ZmqInbound { sock }))
    }

    fn open_outbound(
        &self,
        spec: &str,
        identity: &str,
    ) -> Result<Box<dyn OutboundSocket>, TransportError> {
        let sock = self.ctx.socket(zmq::PUB)?;

        sock.set_linger(0)?;
        sock.set_identity(identity.as_bytes())?;

        if let Err(e) = sock.connect(spec) {
            return Err(TransportError::Connect(spec.to_string(), e));
        }

        debug!("connected PUB:{} as {}", spec, identity);

        Ok(Box::new(ZmqOutbound { sock }))
    }

    fn open_request(&self, spec: &str) -> Result<Box<dyn RequestSocket>, TransportError> {
        let spec = SpecInfo {
            spec: spec.to_string(),
            socket_type: zmq::REQ,
        };

        let sock = setup_spec(&self.ctx, &spec)?;

        Ok(Box::new(ZmqRequest {
            ctx: self.ctx.clone(),
            spec,
            sock: Some(sock),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn inbound_pull() {
        let transport = ZmqTransport::new();

        let push = transport.context().socket(zmq::PUSH).unwrap();
        push.bind("inproc://inbound-test").unwrap();

        let mut inbound = transport.open_inbound("inproc://inbound-test").unwrap();

        assert_eq!(
            inbound.recv(Some(Duration::from_millis(10))).unwrap(),
            None
        );

        push.send("ABCD 8 / 2:{},0:,", 0).unwrap();

        assert_eq!(
            inbound.recv(Some(Duration::from_secs(5))).unwrap(),
            Some(b"ABCD 8 / 2:{},0:,".to_vec())
        );
    }

    #[test]
    fn outbound_pub() {
        let transport = ZmqTransport::new();

        let sub = transport.context().socket(zmq::SUB).unwrap();
        sub.set_subscribe(b"").unwrap();
        sub.bind("inproc://outbound-test").unwrap();

        let mut outbound = transport
            .open_outbound("inproc://outbound-test", "test-ident")
            .unwrap();

        // subscriptions propagate asynchronously, so early messages may drop
        let mut received = None;
        for _ in 0..50 {
            outbound.send(b"ABCD 1:8, x").unwrap();

            if sub.poll(zmq::POLLIN, 100).unwrap() > 0 {
                received = Some(sub.recv_bytes(0).unwrap());
                break;
            }
        }

        assert_eq!(received, Some(b"ABCD 1:8, x".to_vec()));
    }

    #[test]
    fn request_reply() {
        let transport = ZmqTransport::new();

        let rep = transport.context().socket(zmq::REP).unwrap();
        rep.bind("inproc://control-test").unwrap();

        let server = thread::spawn(move || {
            let msg = rep.recv_bytes(0).unwrap();
            rep.send(&msg[..], 0).unwrap();
        });

        let mut req = transport.open_request("inproc://control-test").unwrap();

        let reply = req
            .request(b"10:4:stop,0:}]", Some(Duration::from_secs(5)))
            .unwrap();
        assert_eq!(reply, b"10:4:stop,0:}]");

        server.join().unwrap();
    }

    #[test]
    fn connect_error() {
        let transport = ZmqTransport::new();

        let e = transport.open_inbound("bogus://nowhere").err().unwrap();
        assert!(matches!(e, TransportError::Connect(..)));
    }
}
