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
use crate::request::Envelope;
use crate::table::Table;

/// A regular HTTP request forwarded by the server.
#[derive(Clone, Debug)]
pub struct HttpRequest {
    envelope: Envelope,
}

impl HttpRequest {
    pub fn from_envelope(envelope: Envelope) -> Self {
        Self { envelope }
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    pub fn sender_id(&self) -> &str {
        &self.envelope.sender_id
    }

    pub fn conn_id(&self) -> u64 {
        self.envelope.conn_id
    }

    pub fn path(&self) -> &str {
        &self.envelope.path
    }

    pub fn headers(&self) -> &Table {
        &self.envelope.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.envelope.body
    }

    pub fn set_body<T: Into<Vec<u8>>>(&mut self, body: T) {
        self.envelope.body = body.into();
    }

    pub fn method(&self) -> &str {
        self.envelope.method().unwrap_or("")
    }

    pub fn version(&self) -> Option<&str> {
        self.envelope.headers.get_str("VERSION")
    }

    pub fn uri(&self) -> Option<&str> {
        self.envelope.headers.get_str("URI")
    }

    pub fn query(&self) -> Option<&str> {
        self.envelope.headers.get_str("QUERY")
    }

    pub fn content_type(&self) -> Option<&str> {
        self.envelope.headers.get_str("Content-Type")
    }

    /// Whether the client expects the connection to stay open. Only
    /// HTTP/1.1 connections persist, and only if the client didn't ask
    /// for `Connection: close`.
    pub fn is_keepalive(&self) -> bool {
        if self.version() != Some("HTTP/1.1") {
            return false;
        }

        let conn = match self.envelope.headers.get("Connection") {
            Some(v) => v,
            None => return true,
        };

        !conn
            .values()
            .iter()
            .flat_map(|v| v.split(','))
            .any(|token| token.trim().eq_ignore_ascii_case("close"))
    }

    pub fn response(&self) -> HttpResponse {
        HttpResponse::from_request(self)
    }
}
