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

use crate::httpresponse::HttpResponse;
use crate::request::Request;
use crate::table::Table;
use crate::websocket::{FrameError, WebSocketFrame};
use log::debug;

/// A response with no framing of its own. The body is sent as-is.
#[derive(Clone, Debug, PartialEq)]
pub struct BasicResponse {
    pub sender_id: String,
    pub conn_id: u64,
    pub headers: Table,
    pub body: Vec<u8>,
}

impl BasicResponse {
    pub fn new(sender_id: &str, conn_id: u64) -> Self {
        Self {
            sender_id: sender_id.to_string(),
            conn_id,
            headers: Table::new(),
            body: Vec::new(),
        }
    }

    pub fn write(&mut self, data: &[u8]) -> &mut Self {
        self.body.extend_from_slice(data);

        self
    }

    pub fn puts(&mut self, s: &str) -> &mut Self {
        self.write(s.as_bytes()).write(b"\n")
    }
}

#[derive(Clone, Debug)]
pub enum Response {
    Basic(BasicResponse),
    Http(HttpResponse),
    WebSocket(WebSocketFrame),
}

impl Response {
    /// Builds the kind of response that matches the request, addressed to
    /// the same client.
    pub fn from_request(req: &Request) -> Self {
        match req {
            Request::Http(r) => Self::Http(HttpResponse::from_request(r)),
            Request::WebSocket(f) => Self::WebSocket(f.reply(&[])),
            req => {
                debug!(
                    "creating basic response to {} {}",
                    req.sender_id(),
                    req.conn_id()
                );

                Self::Basic(BasicResponse::new(req.sender_id(), req.conn_id()))
            }
        }
    }

    pub fn sender_id(&self) -> &str {
        match self {
            Self::Basic(r) => &r.sender_id,
            Self::Http(r) => r.sender_id(),
            Self::WebSocket(f) => f.sender_id(),
        }
    }

    pub fn conn_id(&self) -> u64 {
        match self {
            Self::Basic(r) => r.conn_id,
            Self::Http(r) => r.conn_id(),
            Self::WebSocket(f) => f.conn_id(),
        }
    }

    /// The bytes to send. Only WebSocket frames can fail, if invalid.
    pub fn to_bytes(&self) -> Result<Vec<u8>, FrameError> {
        match self {
            Self::Basic(r) => Ok(r.body.clone()),
            Self::Http(r) => Ok(r.to_bytes()),
            Self::WebSocket(f) => f.to_bytes(),
        }
    }
}

impl From<BasicResponse> for Response {
    fn from(r: BasicResponse) -> Self {
        Self::Basic(r)
    }
}

impl From<HttpResponse> for Response {
    fn from(r: HttpResponse) -> Self {
        Self::Http(r)
    }
}

impl From<WebSocketFrame> for Response {
    fn from(f: WebSocketFrame) -> Self {
        Self::WebSocket(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{Envelope, GenericRequest};
    use crate::websocket::{Opcode, FIN_FLAG, OPCODE_TEXT};

    #[test]
    fn from_request() {
        let mut env = Envelope::new("ABCD", 8, "/");
        env.headers.set("METHOD", "FOO");

        let req = Request::Generic(GenericRequest::from_envelope(env));
        let mut resp = match req.response() {
            Response::Basic(r) => r,
            _ => panic!("expected basic response"),
        };

        assert_eq!(resp.sender_id, "ABCD");
        assert_eq!(resp.conn_id, 8);

        resp.puts("hi");
        assert_eq!(Response::from(resp).to_bytes().unwrap(), b"hi\n");
    }

    #[test]
    fn websocket_response() {
        let mut f = WebSocketFrame::new("ABCD", 9, "/ws");
        f.set_raw_flags(FIN_FLAG | OPCODE_TEXT);

        let resp = Response::from_request(&Request::WebSocket(f));
        assert_eq!(resp.conn_id(), 9);

        match &resp {
            Response::WebSocket(f) => assert_eq!(f.opcode(), Opcode::Text),
            _ => panic!("expected websocket response"),
        }

        let mut bad = WebSocketFrame::new("ABCD", 9, "/ws");
        bad.set_raw_flags(OPCODE_TEXT | 0x8);
        assert!(Response::from(bad).to_bytes().is_err());
    }
}
