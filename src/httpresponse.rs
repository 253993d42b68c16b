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

use crate::constants::{http, version_string};
use crate::httprequest::HttpRequest;
use crate::table::Table;
use log::{debug, warn};
use std::io::Write;
use time::macros::format_description;
use time::OffsetDateTime;

pub const DEFAULT_HTTP_STATUS: u16 = http::NO_CONTENT;
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

pub fn http_date(t: OffsetDateTime) -> Option<String> {
    let format = format_description!(
        "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
    );

    t.to_offset(time::UtcOffset::UTC).format(&format).ok()
}

/// An HTTP response, serialized whole.
///
/// Until a status is set the response is considered unhandled. Serializing
/// it anyway uses `204 No Content`.
#[derive(Clone, Debug)]
pub struct HttpResponse {
    sender_id: String,
    conn_id: u64,
    status: Option<u16>,
    headers: Table,
    body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(sender_id: &str, conn_id: u64) -> Self {
        let mut r = Self {
            sender_id: sender_id.to_string(),
            conn_id,
            status: None,
            headers: Table::new(),
            body: Vec::new(),
        };

        r.reset();

        r
    }

    pub fn from_request(req: &HttpRequest) -> Self {
        debug!(
            "creating http response to {} {}",
            req.sender_id(),
            req.conn_id()
        );

        Self::new(req.sender_id(), req.conn_id())
    }

    pub fn sender_id(&self) -> &str {
        &self.sender_id
    }

    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    pub fn status(&self) -> Option<u16> {
        self.status
    }

    pub fn set_status(&mut self, status: u16) {
        self.status = Some(status);
    }

    pub fn headers(&self) -> &Table {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Table {
        &mut self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn set_body<T: Into<Vec<u8>>>(&mut self, body: T) {
        self.body = body.into();
    }

    pub fn write(&mut self, data: &[u8]) -> &mut Self {
        self.body.extend_from_slice(data);

        self
    }

    pub fn puts(&mut self, s: &str) -> &mut Self {
        self.write(s.as_bytes()).write(b"\n")
    }

    /// Clears headers, status and body, leaving only the `Server` header.
    pub fn reset(&mut self) {
        self.headers.clear();
        self.headers.set("server", version_string());
        self.status = None;
        self.body.clear();
    }

    pub fn is_handled(&self) -> bool {
        self.status.is_some()
    }

    pub fn is_bodiless(&self) -> bool {
        match self.status {
            Some(s) => http::BODILESS_RESPONSE_CODES.contains(&s),
            None => false,
        }
    }

    /// The hundreds digit of the status, or 0 if unset.
    pub fn status_category(&self) -> u16 {
        self.status.map(|s| s / 100).unwrap_or(0)
    }

    pub fn is_informational(&self) -> bool {
        self.status_category() == 1
    }

    pub fn is_successful(&self) -> bool {
        self.status_category() == 2
    }

    pub fn is_redirect(&self) -> bool {
        self.status_category() == 3
    }

    pub fn is_client_error(&self) -> bool {
        self.status_category() == 4
    }

    pub fn is_server_error(&self) -> bool {
        self.status_category() == 5
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get_str("content_type")
    }

    pub fn set_content_type(&mut self, value: &str) {
        self.headers.set("content_type", value);
    }

    pub fn set_keepalive(&mut self, value: bool) {
        self.headers
            .set("connection", if value { "keep-alive" } else { "close" });
    }

    pub fn is_keepalive(&self) -> bool {
        match self.headers.get_str("connection") {
            Some(v) => v.to_ascii_lowercase().contains("keep-alive"),
            None => false,
        }
    }

    pub fn content_length(&self) -> usize {
        if self.is_bodiless() {
            0
        } else {
            self.body.len()
        }
    }

    pub fn status_line(&self) -> String {
        let status = match self.status {
            Some(s) => s,
            None => {
                warn!("building status line for unset status");
                DEFAULT_HTTP_STATUS
            }
        };

        format!("HTTP/1.1 {:03} {}", status, http::status_name(status))
    }

    /// The headers as they will be sent, with `Date`, `Content-Length` and
    /// `Content-Type` filled in where missing.
    pub fn normalized_headers(&self) -> Table {
        let mut headers = self.headers.clone();

        if !headers.contains_key("date") {
            if let Some(date) = http_date(OffsetDateTime::now_utc()) {
                headers.set("date", date);
            }
        }

        if !headers.contains_key("content_length") {
            headers.set("content_length", self.content_length().to_string());
        }

        if self.is_bodiless() {
            headers.remove("content_type");
        } else if !headers.contains_key("content_type") {
            headers.set("content_type", DEFAULT_CONTENT_TYPE);
        }

        headers
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256 + self.body.len());

        // writing to a vec can't fail
        let _ = write!(
            &mut out,
            "{}\r\n{}\r\n",
            self.status_line(),
            self.normalized_headers()
        );

        if !self.is_bodiless() {
            out.extend_from_slice(&self.body);
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str;
    use time::macros::datetime;

    fn response() -> HttpResponse {
        HttpResponse::new("ABCD", 8)
    }

    #[test]
    fn test_http_date() {
        let t = datetime!(1994-11-06 08:49:37 UTC);
        assert_eq!(http_date(t).unwrap(), "Sun, 06 Nov 1994 08:49:37 GMT");
    }

    #[test]
    fn test_no_content() {
        let mut resp = response();
        assert!(!resp.is_handled());

        resp.set_status(http::NO_CONTENT);
        resp.headers_mut().set("Date", "Sun, 06 Nov 1994 08:49:37 GMT");
        resp.write(b"ignored");

        let out = resp.to_bytes();
        let out = str::from_utf8(&out).unwrap();

        assert_eq!(
            out,
            format!(
                "HTTP/1.1 204 No Content\r\n\
                 Content-Length: 0\r\n\
                 Date: Sun, 06 Nov 1994 08:49:37 GMT\r\n\
                 Server: {}\r\n\
                 \r\n",
                version_string()
            )
        );
    }

    #[test]
    fn test_with_body() {
        let mut resp = response();
        resp.set_status(http::OK);
        resp.set_content_type("text/plain");
        resp.puts("Hello, world!");

        let out = resp.to_bytes();
        let out = str::from_utf8(&out).unwrap();

        assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(out.contains("\r\nContent-Length: 14\r\n"));
        assert!(out.contains("\r\nContent-Type: text/plain\r\n"));
        assert!(out.contains("\r\nDate: "));
        assert!(out.ends_with("\r\n\r\nHello, world!\n"));
    }

    #[test]
    fn test_defaults() {
        let mut resp = response();
        assert_eq!(resp.status_line(), "HTTP/1.1 204 No Content");

        // unset status isn't bodiless, so a content type is added
        let headers = resp.normalized_headers();
        assert_eq!(headers.get_str("content-type"), Some(DEFAULT_CONTENT_TYPE));

        resp.set_status(http::NOT_MODIFIED);
        assert!(resp.is_bodiless());
        resp.set_content_type("text/html");
        assert!(resp.normalized_headers().get("content-type").is_none());
    }

    #[test]
    fn test_categories() {
        let mut resp = response();
        assert_eq!(resp.status_category(), 0);

        resp.set_status(http::SWITCHING_PROTOCOLS);
        assert!(resp.is_informational());

        resp.set_status(http::CREATED);
        assert!(resp.is_successful());

        resp.set_status(http::SEE_OTHER);
        assert!(resp.is_redirect());

        resp.set_status(http::NOT_FOUND);
        assert!(resp.is_client_error());

        resp.set_status(http::BAD_GATEWAY);
        assert!(resp.is_server_error());
    }

    #[test]
    fn test_keepalive_and_reset() {
        let mut resp = response();
        assert!(!resp.is_keepalive());

        resp.set_keepalive(true);
        assert!(resp.is_keepalive());
        assert_eq!(resp.headers().get_str("Connection"), Some("keep-alive"));

        resp.set_keepalive(false);
        assert!(!resp.is_keepalive());

        resp.set_status(http::OK);
        resp.write(b"data");
        resp.reset();

        assert!(!resp.is_handled());
        assert!(resp.body().is_empty());
        assert_eq!(resp.headers().len(), 1);
        assert_eq!(resp.headers().get_str("server"), Some(version_string().as_str()));
    }
}
