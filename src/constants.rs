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

/// Most connection ids a single outbound message may address.
pub const MAX_BROADCAST_IDENTS: usize = 100;

pub const DEFAULT_CONTROL_SOCKET: &str = "ipc://run/control";

pub fn version_string() -> String {
    format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
}

pub mod http {
    pub const CONTINUE: u16 = 100;
    pub const SWITCHING_PROTOCOLS: u16 = 101;
    pub const PROCESSING: u16 = 102;

    pub const OK: u16 = 200;
    pub const CREATED: u16 = 201;
    pub const ACCEPTED: u16 = 202;
    pub const NON_AUTHORITATIVE: u16 = 203;
    pub const NO_CONTENT: u16 = 204;
    pub const RESET_CONTENT: u16 = 205;
    pub const PARTIAL_CONTENT: u16 = 206;
    pub const MULTI_STATUS: u16 = 207;

    pub const MULTIPLE_CHOICES: u16 = 300;
    pub const MOVED_PERMANENTLY: u16 = 301;
    pub const MOVED_TEMPORARILY: u16 = 302;
    pub const SEE_OTHER: u16 = 303;
    pub const NOT_MODIFIED: u16 = 304;
    pub const USE_PROXY: u16 = 305;
    pub const TEMPORARY_REDIRECT: u16 = 307;

    pub const BAD_REQUEST: u16 = 400;
    pub const UNAUTHORIZED: u16 = 401;
    pub const PAYMENT_REQUIRED: u16 = 402;
    pub const FORBIDDEN: u16 = 403;
    pub const NOT_FOUND: u16 = 404;
    pub const METHOD_NOT_ALLOWED: u16 = 405;
    pub const NOT_ACCEPTABLE: u16 = 406;
    pub const PROXY_AUTHENTICATION_REQUIRED: u16 = 407;
    pub const REQUEST_TIME_OUT: u16 = 408;
    pub const CONFLICT: u16 = 409;
    pub const GONE: u16 = 410;
    pub const LENGTH_REQUIRED: u16 = 411;
    pub const PRECONDITION_FAILED: u16 = 412;
    pub const REQUEST_ENTITY_TOO_LARGE: u16 = 413;
    pub const REQUEST_URI_TOO_LARGE: u16 = 414;
    pub const UNSUPPORTED_MEDIA_TYPE: u16 = 415;
    pub const RANGE_NOT_SATISFIABLE: u16 = 416;
    pub const EXPECTATION_FAILED: u16 = 417;
    pub const UNPROCESSABLE_ENTITY: u16 = 422;
    pub const LOCKED: u16 = 423;
    pub const FAILED_DEPENDENCY: u16 = 424;

    pub const SERVER_ERROR: u16 = 500;
    pub const NOT_IMPLEMENTED: u16 = 501;
    pub const BAD_GATEWAY: u16 = 502;
    pub const SERVICE_UNAVAILABLE: u16 = 503;
    pub const GATEWAY_TIME_OUT: u16 = 504;
    pub const VERSION_NOT_SUPPORTED: u16 = 505;
    pub const VARIANT_ALSO_VARIES: u16 = 506;
    pub const INSUFFICIENT_STORAGE: u16 = 507;
    pub const NOT_EXTENDED: u16 = 510;

    /// Statuses whose responses never carry a body.
    pub const BODILESS_RESPONSE_CODES: &[u16] = &[CONTINUE, SWITCHING_PROTOCOLS, PROCESSING, NO_CONTENT, NOT_MODIFIED];

    pub fn status_name(code: u16) -> &'static str {
        match code {
            100 => "Continue",
            101 => "Switching Protocols",
            102 => "Processing",
            200 => "OK",
            201 => "Created",
            202 => "Accepted",
            203 => "Non-Authoritative Information",
            204 => "No Content",
            205 => "Reset Content",
            206 => "Partial Content",
            207 => "Multi-Status",
            300 => "Multiple Choices",
            301 => "Moved Permanently",
            302 => "Found",
            303 => "See Other",
            304 => "Not Modified",
            305 => "Use Proxy",
            307 => "Temporary Redirect",
            400 => "Bad Request",
            401 => "Authorization Required",
            402 => "Payment Required",
            403 => "Forbidden",
            404 => "Not Found",
            405 => "Method Not Allowed",
            406 => "Not Acceptable",
            407 => "Proxy Authentication Required",
            408 => "Request Time-out",
            409 => "Conflict",
            410 => "Gone",
            411 => "Length Required",
            412 => "Precondition Failed",
            413 => "Request Entity Too Large",
            414 => "Request-URI Too Large",
            415 => "Unsupported Media Type",
            416 => "Requested Range Not Satisfiable",
            417 => "Expectation Failed",
            422 => "Unprocessable Entity",
            423 => "Locked",
            424 => "Failed Dependency",
            425 => "No code",
            426 => "Upgrade Required",
            500 => "Internal Server Error",
            501 => "Method Not Implemented",
            502 => "Bad Gateway",
            503 => "Service Temporarily Unavailable",
            504 => "Gateway Time-out",
            505 => "HTTP Version Not Supported",
            506 => "Variant Also Negotiates",
            507 => "Insufficient Storage",
            510 => "Not Extended",
            _ => "Undefined HTTP Status",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_names() {
        assert_eq!(http::status_name(http::NO_CONTENT), "No Content");
        assert_eq!(http::status_name(http::MOVED_TEMPORARILY), "Found");
        assert_eq!(http::status_name(418), "Undefined HTTP Status");
        assert!(http::BODILESS_RESPONSE_CODES.contains(&http::NOT_MODIFIED));
        assert!(!http::BODILESS_RESPONSE_CODES.contains(&http::OK));
    }

    #[test]
    fn version() {
        assert!(version_string().starts_with("m2handler/"));
    }
}
