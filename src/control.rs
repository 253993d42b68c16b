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

//! Client for the server's administrative control port.

use crate::constants::DEFAULT_CONTROL_SOCKET;
use crate::tnetstring::{self, Value};
use crate::transport::{RequestSocket, Transport, TransportError};
use log::debug;
use std::collections::BTreeMap;
use std::time::Duration;
use time::OffsetDateTime;

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("control command rejected ({code}): {message}")]
    Rejected { code: String, message: String },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("malformed reply: {0}")]
    Decode(#[from] tnetstring::ParseError),

    #[error("malformed reply: {0}")]
    Malformed(String),
}

/// One row of a tabular reply, keyed by column name.
pub type Row = BTreeMap<String, Value>;

fn text(v: &Value) -> String {
    match v.as_str() {
        Some(s) => s.to_string(),
        None => v.to_string(),
    }
}

/// Turns a decoded reply into rows, or the error it carries.
pub fn parse_reply(reply: &Value) -> Result<Vec<Row>, ControlError> {
    if reply.as_map().is_none() {
        return Err(ControlError::Malformed(format!(
            "expected a dict, got {}",
            reply.frame_type()
        )));
    }

    if let Some(code) = reply.get("code") {
        return Err(ControlError::Rejected {
            code: text(code),
            message: reply.get("error").map(text).unwrap_or_default(),
        });
    }

    let headers = match reply.get("headers").and_then(Value::as_array) {
        Some(headers) => headers,
        None => return Err(ControlError::Malformed("missing headers".to_string())),
    };

    let rows = match reply.get("rows").and_then(Value::as_array) {
        Some(rows) => rows,
        None => return Err(ControlError::Malformed("missing rows".to_string())),
    };

    let headers: Vec<String> = headers.iter().map(text).collect();

    let mut out = Vec::with_capacity(rows.len());

    for row in rows {
        let values = match row.as_array() {
            Some(values) => values,
            None => return Err(ControlError::Malformed("row is not a list".to_string())),
        };

        out.push(headers.iter().cloned().zip(values.iter().cloned()).collect());
    }

    Ok(out)
}

fn options(pairs: &[(&str, Value)]) -> Value {
    Value::Map(
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect(),
    )
}

/// Request/reply client for the control port. Requests are
/// `[command, {options}]` tnetstrings.
pub struct ControlClient {
    sock: Box<dyn RequestSocket>,
    timeout: Option<Duration>,
}

impl ControlClient {
    pub fn connect(transport: &dyn Transport, spec: &str) -> Result<Self, ControlError> {
        debug!("connecting to control port {}", spec);

        Ok(Self {
            sock: transport.open_request(spec)?,
            timeout: None,
        })
    }

    pub fn connect_default(transport: &dyn Transport) -> Result<Self, ControlError> {
        Self::connect(transport, DEFAULT_CONTROL_SOCKET)
    }

    /// Gives up waiting for a reply after `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);

        self
    }

    /// Sends a command and returns the decoded reply as-is.
    pub fn request_raw(&mut self, command: &str, opts: &[(&str, Value)]) -> Result<Value, ControlError> {
        let msg = Value::Array(vec![Value::from(command), options(opts)]).to_bytes();

        debug!("control request: {}", String::from_utf8_lossy(&msg));

        let reply = self.sock.request(&msg, self.timeout)?;

        let (value, _) = tnetstring::decode(&reply)?;

        Ok(value)
    }

    /// Sends a command and returns the rows of its reply.
    pub fn request(&mut self, command: &str, opts: &[(&str, Value)]) -> Result<Vec<Row>, ControlError> {
        let reply = self.request_raw(command, opts)?;

        parse_reply(&reply)
    }

    pub fn stop(&mut self) -> Result<Vec<Row>, ControlError> {
        self.request("stop", &[])
    }

    pub fn reload(&mut self) -> Result<Vec<Row>, ControlError> {
        self.request("reload", &[])
    }

    pub fn terminate(&mut self) -> Result<Vec<Row>, ControlError> {
        self.request("terminate", &[])
    }

    pub fn help(&mut self) -> Result<Vec<Row>, ControlError> {
        self.request("help", &[])
    }

    pub fn uuid(&mut self) -> Result<Vec<Row>, ControlError> {
        self.request("uuid", &[])
    }

    pub fn info(&mut self) -> Result<Vec<Row>, ControlError> {
        self.request("info", &[])
    }

    pub fn tasklist(&mut self) -> Result<Vec<Row>, ControlError> {
        self.request("status", &[("what", Value::from("tasks"))])
    }

    pub fn conn_status(&mut self) -> Result<Vec<Row>, ControlError> {
        self.request("status", &[("what", Value::from("net"))])
    }

    /// The server's clock.
    pub fn time(&mut self) -> Result<OffsetDateTime, ControlError> {
        let rows = self.request("time", &[])?;

        let v = match rows.first().and_then(|row| row.get("time")) {
            Some(v) => v,
            None => return Err(ControlError::Malformed("no time in reply".to_string())),
        };

        let secs = match v {
            Value::Int(i) => Some(*i),
            v => v.as_str().and_then(|s| s.trim().parse().ok()),
        };

        let secs = match secs {
            Some(secs) => secs,
            None => return Err(ControlError::Malformed(format!("bad time {}", v))),
        };

        OffsetDateTime::from_unix_timestamp(secs)
            .map_err(|e| ControlError::Malformed(e.to_string()))
    }

    /// Closes a client connection.
    pub fn kill(&mut self, conn_id: u64) -> Result<Vec<Row>, ControlError> {
        self.request("kill", &[("id", Value::Int(conn_id as i64))])
    }

    /// Shuts down the control port itself.
    pub fn control_stop(&mut self) -> Result<Vec<Row>, ControlError> {
        self.request("control_stop", &[])
    }
}
