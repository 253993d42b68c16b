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

//! WebSocket frames as exchanged with the edge server.
//!
//! The server delivers one frame per message with the frame's first header
//! byte in the `FLAGS` header. Outbound frames are encoded in full, and are
//! never masked.

use crate::request::{Envelope, ParseError};
use log::{debug, error, warn};
use std::fmt;
use std::io;
use std::str;

const PSIZE_3BYTE: usize = 126;
const PSIZE_9BYTE: usize = 65536;

pub const FIN_FLAG: u8 = 0b1000_0000;
pub const RSV1_FLAG: u8 = 0b0100_0000;
pub const RSV2_FLAG: u8 = 0b0010_0000;
pub const RSV3_FLAG: u8 = 0b0001_0000;
pub const RSV_FLAG_MASK: u8 = 0b0111_0000;
pub const OPCODE_BITMASK: u8 = 0b0000_1111;
pub const OPCODE_CONTROL_MASK: u8 = 0b0000_1000;

pub const OPCODE_CONTINUATION: u8 = 0x0;
pub const OPCODE_TEXT: u8 = 0x1;
pub const OPCODE_BINARY: u8 = 0x2;
pub const OPCODE_CLOSE: u8 = 0x8;
pub const OPCODE_PING: u8 = 0x9;
pub const OPCODE_PONG: u8 = 0xa;

pub const CONTROL_FRAME_PAYLOAD_MAX: usize = 125;

pub const DEFAULT_FLAGS: u8 = FIN_FLAG | OPCODE_CLOSE;

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_GOING_AWAY: u16 = 1001;
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;
pub const CLOSE_BAD_DATA_TYPE: u16 = 1003;
pub const CLOSE_RESERVED: u16 = 1004;
pub const CLOSE_MISSING_STATUS: u16 = 1005;
pub const CLOSE_ABNORMAL_STATUS: u16 = 1006;
pub const CLOSE_BAD_DATA: u16 = 1007;
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
pub const CLOSE_MESSAGE_TOO_LARGE: u16 = 1009;
pub const CLOSE_MISSING_EXTENSION: u16 = 1010;
pub const CLOSE_EXCEPTION: u16 = 1011;
pub const CLOSE_TLS_ERROR: u16 = 1015;

/// Description sent along with a close status. Codes 1004, 1005, 1006 and
/// 1015 are reserved and should never be sent by an endpoint.
pub fn close_status_description(code: u16) -> Option<&'static str> {
    let desc = match code {
        CLOSE_NORMAL => "Session closed normally.",
        CLOSE_GOING_AWAY => "Endpoint going away.",
        CLOSE_PROTOCOL_ERROR => "Protocol error.",
        CLOSE_BAD_DATA_TYPE => "Unhandled data type.",
        CLOSE_RESERVED => "Reserved for future use.",
        CLOSE_MISSING_STATUS => "No status code was present.",
        CLOSE_ABNORMAL_STATUS => "Abnormal close.",
        CLOSE_BAD_DATA => "Bad or malformed data.",
        CLOSE_POLICY_VIOLATION => "Policy violation.",
        CLOSE_MESSAGE_TOO_LARGE => "Message too large for endpoint.",
        CLOSE_MISSING_EXTENSION => "Missing extension.",
        CLOSE_EXCEPTION => "Unexpected condition/exception.",
        CLOSE_TLS_ERROR => "TLS handshake failure.",
        _ => return None,
    };

    Some(desc)
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
    Reserved(u8),
}

impl Opcode {
    pub fn from_bits(bits: u8) -> Self {
        match bits & OPCODE_BITMASK {
            OPCODE_CONTINUATION => Self::Continuation,
            OPCODE_TEXT => Self::Text,
            OPCODE_BINARY => Self::Binary,
            OPCODE_CLOSE => Self::Close,
            OPCODE_PING => Self::Ping,
            OPCODE_PONG => Self::Pong,
            x => Self::Reserved(x),
        }
    }

    pub fn bits(self) -> u8 {
        match self {
            Self::Continuation => OPCODE_CONTINUATION,
            Self::Text => OPCODE_TEXT,
            Self::Binary => OPCODE_BINARY,
            Self::Close => OPCODE_CLOSE,
            Self::Ping => OPCODE_PING,
            Self::Pong => OPCODE_PONG,
            Self::Reserved(x) => x & OPCODE_BITMASK,
        }
    }

    pub fn is_reserved(self) -> bool {
        matches!(self, Self::Reserved(_))
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Continuation => "continuation",
            Self::Text => "text",
            Self::Binary => "binary",
            Self::Close => "close",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Reserved(_) => "reserved",
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Modifications applied by [`WebSocketFrame::set_flags`].
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Flag {
    Fin,
    Rsv1,
    Rsv2,
    Rsv3,
    Opcode(Opcode),
    Bits(u8),
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum FrameError {
    #[error("invalid frame: {}", .0.join(", "))]
    Invalid(Vec<String>),
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FrameInfo {
    pub flags: u8,
    pub mask: Option<[u8; 4]>,
    pub payload_offset: usize,
    pub payload_size: usize,
}

pub fn header_size(payload_size: usize, masked: bool) -> usize {
    let size = if payload_size < PSIZE_3BYTE {
        1 + 1
    } else if payload_size < PSIZE_9BYTE {
        1 + 3
    } else {
        1 + 9
    };

    if masked {
        size + 4
    } else {
        size
    }
}

/// Parses a frame header, masked or not.
pub fn read_header(buf: &[u8]) -> Result<FrameInfo, io::Error> {
    if buf.len() < 2 {
        return Err(io::Error::from(io::ErrorKind::UnexpectedEof));
    }

    let b1 = buf[1] & 0x7f;

    let (mut hsize, psize) = match b1 as usize {
        x if x < PSIZE_3BYTE => (2, x),
        PSIZE_3BYTE => {
            let arr: [u8; 2] = buf
                .get(2..4)
                .and_then(|s| s.try_into().ok())
                .ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))?;

            (4, u16::from_be_bytes(arr) as usize)
        }
        _ => {
            let arr: [u8; 8] = buf
                .get(2..10)
                .and_then(|s| s.try_into().ok())
                .ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))?;

            let size = usize::try_from(u64::from_be_bytes(arr))
                .map_err(|_| io::Error::from(io::ErrorKind::InvalidData))?;

            (10, size)
        }
    };

    let mask = if buf[1] & 0x80 != 0 {
        let mask: [u8; 4] = buf
            .get(hsize..(hsize + 4))
            .and_then(|s| s.try_into().ok())
            .ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))?;

        hsize += 4;

        Some(mask)
    } else {
        None
    };

    Ok(FrameInfo {
        flags: buf[0],
        mask,
        payload_offset: hsize,
        payload_size: psize,
    })
}

/// Appends an unmasked frame header.
pub fn write_header(flags: u8, payload_size: usize, out: &mut Vec<u8>) {
    out.push(flags);

    if payload_size < PSIZE_3BYTE {
        out.push(payload_size as u8);
    } else if payload_size < PSIZE_9BYTE {
        out.push(PSIZE_3BYTE as u8);
        out.extend_from_slice(&(payload_size as u16).to_be_bytes());
    } else {
        out.push(0x7f);
        out.extend_from_slice(&(payload_size as u64).to_be_bytes());
    }
}

pub fn apply_mask(buf: &mut [u8], mask: [u8; 4], offset: usize) {
    for (i, c) in buf.iter_mut().enumerate() {
        *c ^= mask[(offset + i) % 4];
    }
}

/// Encodes a frame without any validation.
pub fn encode_frame(flags: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(header_size(payload.len(), false) + payload.len());

    write_header(flags, payload.len(), &mut out);
    out.extend_from_slice(payload);

    out
}

/// Decodes a complete frame, unmasking the payload if needed. Returns the
/// flags byte, the payload and the total number of bytes consumed.
pub fn decode_frame(buf: &[u8]) -> Result<(u8, Vec<u8>, usize), io::Error> {
    let fi = read_header(buf)?;

    let end = fi
        .payload_offset
        .checked_add(fi.payload_size)
        .ok_or_else(|| io::Error::from(io::ErrorKind::InvalidData))?;

    let mut payload = match buf.get(fi.payload_offset..end) {
        Some(data) => data.to_vec(),
        None => return Err(io::Error::from(io::ErrorKind::UnexpectedEof)),
    };

    if let Some(mask) = fi.mask {
        apply_mask(&mut payload, mask, 0);
    }

    Ok((fi.flags, payload, end))
}

fn parse_flags(s: &str) -> Option<u8> {
    let s = s.trim();

    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

/// A single WebSocket frame, received from or sent to a client.
#[derive(Clone, Debug)]
pub struct WebSocketFrame {
    envelope: Envelope,
    flags: u8,
    errors: Vec<String>,
    response: Option<Box<WebSocketFrame>>,
}

impl WebSocketFrame {
    pub fn new(sender_id: &str, conn_id: u64, path: &str) -> Self {
        Self {
            envelope: Envelope::new(sender_id, conn_id, path),
            flags: DEFAULT_FLAGS,
            errors: Vec::new(),
            response: None,
        }
    }

    /// Builds a frame from a parsed envelope. Flags come from the `FLAGS`
    /// header, as hex (`0x89`) or decimal.
    pub fn from_envelope(envelope: Envelope) -> Result<Self, ParseError> {
        let flags = match envelope.headers.get_str("flags") {
            Some(s) => parse_flags(s).ok_or_else(|| ParseError::InvalidFlags(s.to_string()))?,
            None => DEFAULT_FLAGS,
        };

        Ok(Self {
            envelope,
            flags,
            errors: Vec::new(),
            response: None,
        })
    }

    /// An empty frame addressed to the same client as `frame`.
    pub fn from_request(frame: &WebSocketFrame) -> Self {
        debug!(
            "creating websocket response to {} {}",
            frame.sender_id(),
            frame.conn_id()
        );

        Self::new(frame.sender_id(), frame.conn_id(), frame.path())
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

    pub fn payload(&self) -> &[u8] {
        &self.envelope.body
    }

    pub fn payload_mut(&mut self) -> &mut Vec<u8> {
        &mut self.envelope.body
    }

    pub fn set_payload<T: Into<Vec<u8>>>(&mut self, payload: T) {
        self.envelope.body = payload.into();
    }

    pub fn write(&mut self, data: &[u8]) -> &mut Self {
        self.envelope.body.extend_from_slice(data);

        self
    }

    /// Appends `s` followed by a newline.
    pub fn puts(&mut self, s: &str) -> &mut Self {
        self.write(s.trim_end_matches('\n').as_bytes()).write(b"\n")
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }

    pub fn set_raw_flags(&mut self, flags: u8) {
        self.flags = flags;
    }

    fn set_bit(&mut self, bit: u8, value: bool) {
        if value {
            self.flags |= bit;
        } else {
            self.flags &= !bit;
        }
    }

    pub fn fin(&self) -> bool {
        self.flags & FIN_FLAG != 0
    }

    pub fn set_fin(&mut self, value: bool) {
        self.set_bit(FIN_FLAG, value);
    }

    pub fn rsv1(&self) -> bool {
        self.flags & RSV1_FLAG != 0
    }

    pub fn set_rsv1(&mut self, value: bool) {
        self.set_bit(RSV1_FLAG, value);
    }

    pub fn rsv2(&self) -> bool {
        self.flags & RSV2_FLAG != 0
    }

    pub fn set_rsv2(&mut self, value: bool) {
        self.set_bit(RSV2_FLAG, value);
    }

    pub fn rsv3(&self) -> bool {
        self.flags & RSV3_FLAG != 0
    }

    pub fn set_rsv3(&mut self, value: bool) {
        self.set_bit(RSV3_FLAG, value);
    }

    pub fn has_rsv_flags(&self) -> bool {
        self.flags & RSV_FLAG_MASK != 0
    }

    pub fn numeric_opcode(&self) -> u8 {
        self.flags & OPCODE_BITMASK
    }

    pub fn opcode(&self) -> Opcode {
        Opcode::from_bits(self.flags)
    }

    pub fn set_opcode(&mut self, opcode: Opcode) {
        self.flags = (self.flags & !OPCODE_BITMASK) | opcode.bits();
    }

    pub fn is_control(&self) -> bool {
        self.flags & OPCODE_CONTROL_MASK != 0
    }

    pub fn set_flags(&mut self, flags: &[Flag]) {
        for flag in flags {
            match *flag {
                Flag::Fin => self.set_fin(true),
                Flag::Rsv1 => self.set_rsv1(true),
                Flag::Rsv2 => self.set_rsv2(true),
                Flag::Rsv3 => self.set_rsv3(true),
                Flag::Opcode(opcode) => self.set_opcode(opcode),
                Flag::Bits(bits) => self.flags |= bits,
            }
        }
    }

    /// Replaces the payload with a close status line, e.g.
    /// `1000 Session closed normally.`.
    pub fn set_status(&mut self, code: u16) {
        let desc = match close_status_description(code) {
            Some(desc) => desc,
            None => {
                warn!("unknown close status code {}", code);
                ""
            }
        };

        self.set_payload(format!("{} {}", code, desc));
    }

    fn check(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.opcode() != Opcode::Binary && str::from_utf8(self.payload()).is_err() {
            errors.push("Invalid UTF8 in payload".to_string());
        }

        if self.is_control() {
            if self.payload().len() > CONTROL_FRAME_PAYLOAD_MAX {
                error!(
                    "payload of control frame exceeds {} bytes ({})",
                    CONTROL_FRAME_PAYLOAD_MAX,
                    self.payload().len()
                );
                errors.push("payload of control frame cannot exceed 125 bytes".to_string());
            }

            if !self.fin() {
                error!("control frame fragmented (FIN is unset)");
                errors.push("control frame is fragmented (no FIN flag set)".to_string());
            }
        }

        if self.opcode().is_reserved() {
            error!("frame uses reserved opcode 0x{:x}", self.numeric_opcode());
            errors.push("Frame uses reserved opcode".to_string());
        }

        if self.has_rsv_flags() {
            error!("frame has one or more reserved flags set");
            errors.push("Frame has one or more reserved flags set.".to_string());
        }

        errors
    }

    /// Checks the frame, replacing the contents of `errors()`.
    pub fn validate(&mut self) {
        self.errors = self.check();
    }

    pub fn is_valid(&mut self) -> bool {
        self.validate();

        self.errors.is_empty()
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    /// Wire encoding of the frame. Fails if the frame is invalid.
    pub fn to_bytes(&self) -> Result<Vec<u8>, FrameError> {
        let errors = self.check();
        if !errors.is_empty() {
            return Err(FrameError::Invalid(errors));
        }

        Ok(encode_frame(self.flags, self.payload()))
    }

    /// A fresh reply to this frame, without memoization.
    pub fn reply(&self, flags: &[Flag]) -> WebSocketFrame {
        let mut resp = Self::from_request(self);

        if self.opcode() == Opcode::Ping {
            resp.set_opcode(Opcode::Pong);
            resp.set_payload(self.payload());
        } else {
            resp.set_opcode(self.opcode());
        }

        if !flags.is_empty() {
            debug!("applying custom flags {:?}", flags);
            resp.set_flags(flags);
        }

        resp
    }

    /// The reply to this frame, created on first call. The reply mirrors
    /// this frame's opcode, except that a ping is answered by a pong
    /// carrying the same payload. `flags` only apply on creation.
    pub fn response(&mut self, flags: &[Flag]) -> &mut WebSocketFrame {
        if self.response.is_none() {
            self.response = Some(Box::new(self.reply(flags)));
        }

        match &mut self.response {
            Some(resp) => &mut **resp,
            None => unreachable!(),
        }
    }

    /// Like [`response`](Self::response), but takes ownership of the reply.
    pub fn into_response(mut self, flags: &[Flag]) -> WebSocketFrame {
        match self.response.take() {
            Some(resp) => *resp,
            None => self.reply(flags),
        }
    }
}

impl fmt::Display for WebSocketFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "FIN:{} RSV1:{} RSV2:{} RSV3:{} OPCODE:{} (0x{:x}) -- {:.2}K body",
            self.fin() as u8,
            self.rsv1() as u8,
            self.rsv2() as u8,
            self.rsv3() as u8,
            self.opcode(),
            self.numeric_opcode(),
            self.payload().len() as f64 / 1024.0
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::Table;

    fn frame(flags: u8, payload: &[u8]) -> WebSocketFrame {
        let mut f = WebSocketFrame::new("ABCD", 8, "/ws");
        f.set_raw_flags(flags);
        f.set_payload(payload);

        f
    }

    #[test]
    fn test_header_size() {
        assert_eq!(header_size(0, false), 2);
        assert_eq!(header_size(125, false), 2);
        assert_eq!(header_size(125, true), 6);

        assert_eq!(header_size(126, false), 4);
        assert_eq!(header_size(65535, false), 4);
        assert_eq!(header_size(65535, true), 8);

        assert_eq!(header_size(65536, false), 10);
        assert_eq!(header_size(65536, true), 14);
    }

    #[test]
    fn test_write_header() {
        let mut out = Vec::new();
        write_header(FIN_FLAG | OPCODE_TEXT, 5, &mut out);
        assert_eq!(out, [0x81, 5]);

        let mut out = Vec::new();
        write_header(OPCODE_BINARY, 126, &mut out);
        assert_eq!(out, [0x02, 126, 0x00, 0x7e]);

        let mut out = Vec::new();
        write_header(OPCODE_BINARY, 65535, &mut out);
        assert_eq!(out, [0x02, 126, 0xff, 0xff]);

        let mut out = Vec::new();
        write_header(OPCODE_BINARY, 65536, &mut out);
        assert_eq!(out, [0x02, 127, 0, 0, 0, 0, 0, 0x01, 0x00, 0x00]);
    }

    #[test]
    fn test_read_header() {
        let fi = read_header(&[0x89, 0x05]).unwrap();
        assert_eq!(
            fi,
            FrameInfo {
                flags: 0x89,
                mask: None,
                payload_offset: 2,
                payload_size: 5,
            }
        );

        let fi = read_header(&[0x82, 0xfe, 0x01, 0x00, 1, 2, 3, 4]).unwrap();
        assert_eq!(fi.mask, Some([1, 2, 3, 4]));
        assert_eq!(fi.payload_offset, 8);
        assert_eq!(fi.payload_size, 256);

        let e = read_header(&[0x81]).unwrap_err();
        assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof);

        let e = read_header(&[0x81, 126, 0x01]).unwrap_err();
        assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof);

        let e = read_header(&[0x81, 0x85, 1, 2]).unwrap_err();
        assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_apply_mask() {
        let mut buf = [b'a', b'b', b'c', b'd', b'e'];
        apply_mask(&mut buf, [0x01, 0x02, 0x03, 0x04], 0);
        assert_eq!(buf, [0x60, 0x60, 0x60, 0x60, 0x64]);

        apply_mask(&mut buf, [0x01, 0x02, 0x03, 0x04], 0);
        assert_eq!(&buf, b"abcde");
    }

    #[test]
    fn test_decode_frame() {
        for size in [0, 5, 125, 126, 65535, 65536] {
            let payload = vec![b'x'; size];
            let data = encode_frame(FIN_FLAG | OPCODE_BINARY, &payload);

            let (flags, decoded, consumed) = decode_frame(&data).unwrap();
            assert_eq!(flags, FIN_FLAG | OPCODE_BINARY);
            assert_eq!(decoded, payload);
            assert_eq!(consumed, data.len());
        }

        // masked client frame
        let mut data = vec![0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d];
        data.extend_from_slice(&[0x7f, 0x9f, 0x4d, 0x51, 0x58]);
        let (flags, payload, _) = decode_frame(&data).unwrap();
        assert_eq!(flags, 0x81);
        assert_eq!(payload, b"Hello");

        let e = decode_frame(&[0x81, 0x05, b'H', b'e']).unwrap_err();
        assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_flags_header() {
        let mut headers = Table::new();
        headers.set("METHOD", "WEBSOCKET");
        headers.set("FLAGS", "0x89");

        let mut env = Envelope::new("ABCD", 8, "/ws");
        env.headers = headers;

        let f = WebSocketFrame::from_envelope(env.clone()).unwrap();
        assert_eq!(f.flags(), 0x89);
        assert_eq!(f.opcode(), Opcode::Ping);
        assert!(f.fin());
        assert!(f.is_control());

        env.headers.set("FLAGS", "130");
        let f = WebSocketFrame::from_envelope(env.clone()).unwrap();
        assert_eq!(f.opcode(), Opcode::Binary);

        env.headers.remove("FLAGS");
        let f = WebSocketFrame::from_envelope(env.clone()).unwrap();
        assert_eq!(f.flags(), DEFAULT_FLAGS);

        env.headers.set("FLAGS", "0xzz");
        assert!(WebSocketFrame::from_envelope(env).is_err());
    }

    #[test]
    fn test_flag_accessors() {
        let mut f = frame(0, b"");
        assert_eq!(f.opcode(), Opcode::Continuation);
        assert!(!f.fin());

        f.set_fin(true);
        f.set_rsv2(true);
        assert_eq!(f.flags(), FIN_FLAG | RSV2_FLAG);
        assert!(f.has_rsv_flags());

        f.set_rsv2(false);
        assert!(!f.has_rsv_flags());

        f.set_opcode(Opcode::Text);
        assert_eq!(f.flags(), FIN_FLAG | OPCODE_TEXT);

        f.set_flags(&[Flag::Opcode(Opcode::Close), Flag::Rsv1, Flag::Bits(RSV3_FLAG)]);
        assert_eq!(f.opcode(), Opcode::Close);
        assert!(f.rsv1());
        assert!(f.rsv3());
        assert!(f.fin());

        assert_eq!(Opcode::from_bits(0x3), Opcode::Reserved(3));
        assert_eq!(Opcode::from_bits(0xb).as_str(), "reserved");
    }

    #[test]
    fn test_control_frame_length() {
        let mut f = frame(FIN_FLAG | OPCODE_PING, &[b'a'; 125]);
        assert!(f.is_valid());
        assert_eq!(f.to_bytes().unwrap().len(), 2 + 125);

        let mut f = frame(FIN_FLAG | OPCODE_PING, &[b'a'; 126]);
        assert!(!f.is_valid());
        assert_eq!(
            f.errors(),
            &["payload of control frame cannot exceed 125 bytes".to_string()]
        );

        let e = f.to_bytes().unwrap_err();
        assert_eq!(
            e.to_string(),
            "invalid frame: payload of control frame cannot exceed 125 bytes"
        );
    }

    #[test]
    fn test_control_frame_fragmented() {
        let mut f = frame(OPCODE_CLOSE, b"");
        assert!(!f.is_valid());
        assert_eq!(
            f.errors(),
            &["control frame is fragmented (no FIN flag set)".to_string()]
        );

        // data frames may be fragmented
        let mut f = frame(OPCODE_TEXT, b"part");
        assert!(f.is_valid());
    }

    #[test]
    fn test_validation_errors() {
        let mut f = frame(FIN_FLAG | OPCODE_TEXT, b"\xff\xfe");
        assert!(!f.is_valid());
        assert_eq!(f.errors(), &["Invalid UTF8 in payload".to_string()]);

        let mut f = frame(FIN_FLAG | OPCODE_BINARY, b"\xff\xfe");
        assert!(f.is_valid());

        let mut f = frame(FIN_FLAG | 0x3, b"");
        assert!(!f.is_valid());
        assert_eq!(f.errors(), &["Frame uses reserved opcode".to_string()]);

        let mut f = frame(FIN_FLAG | RSV1_FLAG | OPCODE_TEXT, b"hi");
        assert!(!f.is_valid());
        assert_eq!(
            f.errors(),
            &["Frame has one or more reserved flags set.".to_string()]
        );

        // errors accumulate and are replaced on revalidation
        let mut f = frame(RSV2_FLAG | OPCODE_PING, &[b'a'; 200]);
        f.validate();
        assert_eq!(f.errors().len(), 3);

        f.set_raw_flags(FIN_FLAG | OPCODE_PING);
        f.set_payload("ok");
        f.validate();
        assert!(f.errors().is_empty());

        let e = frame(RSV2_FLAG | OPCODE_CLOSE, b"").to_bytes().unwrap_err();
        assert_eq!(
            e.to_string(),
            "invalid frame: control frame is fragmented (no FIN flag set), Frame has one or more reserved flags set."
        );
    }

    #[test]
    fn test_to_bytes() {
        let f = frame(FIN_FLAG | OPCODE_TEXT, b"Hello");
        assert_eq!(f.to_bytes().unwrap(), b"\x81\x05Hello");

        let f = frame(FIN_FLAG | OPCODE_BINARY, &[0; 300]);
        let data = f.to_bytes().unwrap();
        assert_eq!(&data[..4], &[0x82, 126, 0x01, 0x2c]);
        assert_eq!(data.len(), 304);

        let f = frame(FIN_FLAG | OPCODE_BINARY, &vec![0; 70000]);
        let data = f.to_bytes().unwrap();
        assert_eq!(&data[..2], &[0x82, 127]);
        assert_eq!(&data[2..10], &70000u64.to_be_bytes());

        // never masked
        assert_eq!(data[1] & 0x80, 0);
    }

    #[test]
    fn test_ping_response() {
        let mut ping = frame(FIN_FLAG | OPCODE_PING, b"Hello");

        let resp = ping.response(&[]);
        assert_eq!(resp.opcode(), Opcode::Pong);
        assert_eq!(resp.payload(), b"Hello");
        assert!(resp.fin());
        assert_eq!(resp.sender_id(), "ABCD");
        assert_eq!(resp.conn_id(), 8);

        assert_eq!(resp.to_bytes().unwrap(), b"\x8a\x05Hello");
    }

    #[test]
    fn test_response_memoized() {
        let mut text = frame(FIN_FLAG | OPCODE_TEXT, b"hi");

        let resp = text.response(&[]);
        assert_eq!(resp.opcode(), Opcode::Text);
        assert!(resp.payload().is_empty());
        resp.write(b"there");

        // later flags don't rebuild the response
        let resp = text.response(&[Flag::Opcode(Opcode::Close)]);
        assert_eq!(resp.opcode(), Opcode::Text);
        assert_eq!(resp.payload(), b"there");

        let resp = text.into_response(&[]);
        assert_eq!(resp.payload(), b"there");

        let close = frame(FIN_FLAG | OPCODE_TEXT, b"bye")
            .into_response(&[Flag::Opcode(Opcode::Close), Flag::Fin]);
        assert_eq!(close.opcode(), Opcode::Close);
        assert!(close.fin());
    }

    #[test]
    fn test_set_status() {
        let mut f = frame(DEFAULT_FLAGS, b"");
        f.set_status(CLOSE_NORMAL);
        assert_eq!(f.payload(), b"1000 Session closed normally.");

        f.set_status(CLOSE_EXCEPTION);
        assert_eq!(f.payload(), b"1011 Unexpected condition/exception.");

        assert_eq!(close_status_description(1012), None);
        assert_eq!(
            close_status_description(CLOSE_TLS_ERROR),
            Some("TLS handshake failure.")
        );
    }

    #[test]
    fn test_puts_and_display() {
        let mut f = frame(FIN_FLAG | OPCODE_TEXT, b"");
        f.puts("one\n").puts("two");
        assert_eq!(f.payload(), b"one\ntwo\n");

        assert_eq!(
            f.to_string(),
            "FIN:1 RSV1:0 RSV2:0 RSV3:0 OPCODE:text (0x1) -- 0.01K body"
        );
    }
}
