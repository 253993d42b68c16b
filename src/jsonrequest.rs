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

use crate::request::{Envelope, ParseError};
use log::debug;

/// A message from the server itself (or a JSON socket client), with a JSON
/// body.
#[derive(Clone, Debug)]
pub struct JsonRequest {
    envelope: Envelope,
    data: serde_json::Value,
}

impl JsonRequest {
    pub fn from_envelope(envelope: Envelope) -> Result<Self, ParseError> {
        let data = serde_json::from_slice(&envelope.body)?;

        debug!("json body: {}", data);

        Ok(Self { envelope, data })
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

    pub fn data(&self) -> &serde_json::Value {
        &self.data
    }

    pub fn is_disconnect(&self) -> bool {
        self.data.get("type").and_then(|v| v.as_str()) == Some("disconnect")
    }
}
