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

/// A message with an XML body. The body is checked for well-formedness
/// on construction.
#[derive(Clone, Debug)]
pub struct XmlRequest {
    envelope: Envelope,
    text: String,
    root: String,
}

impl XmlRequest {
    pub fn from_envelope(envelope: Envelope) -> Result<Self, ParseError> {
        let text = String::from_utf8(envelope.body.clone())
            .map_err(|_| ParseError::Xml("body is not utf-8".to_string()))?;

        let root = {
            let doc = roxmltree::Document::parse(&text).map_err(|e| ParseError::Xml(e.to_string()))?;

            doc.root_element().tag_name().name().to_string()
        };

        debug!("xml body with root element <{}>", root);

        Ok(Self {
            envelope,
            text,
            root,
        })
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

    pub fn root_name(&self) -> &str {
        &self.root
    }

    /// The parsed document, borrowing from this request.
    pub fn document(&self) -> Result<roxmltree::Document<'_>, roxmltree::Error> {
        roxmltree::Document::parse(&self.text)
    }
}
