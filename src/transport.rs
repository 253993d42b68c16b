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

//! Socket seam between the connection and the message queue. The ZeroMQ
//! implementation lives in [`crate::zmq`]; [`crate::testing`] provides an
//! in-memory one.

use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connect {0}: {1}")]
    Connect(String, zmq::Error),

    #[error(transparent)]
    Zmq(#[from] zmq::Error),

    #[error("timed out")]
    TimedOut,

    #[error("peer disconnected")]
    Disconnected,
}

/// Receiving half, bound to the server's send spec.
pub trait InboundSocket: Send {
    /// Waits for one message. `None` waits indefinitely. Returns `Ok(None)`
    /// if the timeout elapsed without a message.
    fn recv(&mut self, timeout: Option<Duration>) -> Result<Option<Vec<u8>>, TransportError>;
}

/// Sending half, bound to the server's recv spec.
pub trait OutboundSocket: Send {
    fn send(&mut self, msg: &[u8]) -> Result<(), TransportError>;
}

/// Request/reply channel, used for the control port.
pub trait RequestSocket: Send {
    fn request(&mut self, msg: &[u8], timeout: Option<Duration>) -> Result<Vec<u8>, TransportError>;
}

pub trait Transport: Send + Sync {
    fn open_inbound(&self, spec: &str) -> Result<Box<dyn InboundSocket>, TransportError>;

    fn open_outbound(
        &self,
        spec: &str,
        identity: &str,
    ) -> Result<Box<dyn OutboundSocket>, TransportError>;

    fn open_request(&self, spec: &str) -> Result<Box<dyn RequestSocket>, TransportError>;
}
