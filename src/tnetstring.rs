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

//! Length-prefixed "tnetstring" codec.
//!
//! Every value is written as `<decimal length>:<payload><type tag>`. Arrays
//! and maps nest further values inside their payload.

use std::ascii;
use std::fmt;
use std::io;
use std::str;

const TRUE_BYTES: &[u8] = b"true";
const FALSE_BYTES: &[u8] = b"false";

// a length prefix longer than this can't describe a real buffer
const SIZE_DIGITS_MAX: usize = 20;

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum FrameType {
    Null,
    Bool,
    Int,
    Float,
    String,
    Array,
    Map,
}

impl FrameType {
    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            b'~' => Some(Self::Null),
            b'!' => Some(Self::Bool),
            b'#' => Some(Self::Int),
            b'^' => Some(Self::Float),
            b',' => Some(Self::String),
            b']' => Some(Self::Array),
            b'}' => Some(Self::Map),
            _ => None,
        }
    }

    fn tag(self) -> u8 {
        match self {
            Self::Null => b'~',
            Self::Bool => b'!',
            Self::Int => b'#',
            Self::Float => b'^',
            Self::String => b',',
            Self::Array => b']',
            Self::Map => b'}',
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Float => "float",
            Self::String => "string",
            Self::Array => "array",
            Self::Map => "map",
        }
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, PartialEq)]
pub enum ParseError {
    UnexpectedEof,
    InvalidData,
    WrongType(FrameType, FrameType), // got, expected
    InvalidKey,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnexpectedEof => write!(f, "unexpected eof"),
            Self::InvalidData => write!(f, "invalid data"),
            Self::WrongType(got, expected) => {
                write!(f, "wrong type {}, expected {}", got, expected)
            }
            Self::InvalidKey => write!(f, "map key must be a utf-8 string"),
        }
    }
}

impl std::error::Error for ParseError {}

/// A single undecoded element: its type and the raw payload bytes.
#[derive(Debug)]
pub struct Frame<'a> {
    pub ftype: FrameType,
    pub data: &'a [u8],
}

/// Reads one element from the front of `src`, returning it along with the
/// bytes that follow it.
pub fn parse_frame(src: &[u8]) -> Result<(Frame<'_>, &[u8]), ParseError> {
    let colon = match src.iter().position(|&c| c == b':') {
        Some(pos) => pos,
        None => {
            // only digits so far, so the prefix may still be arriving
            if src.len() <= SIZE_DIGITS_MAX && src.iter().all(u8::is_ascii_digit) {
                return Err(ParseError::UnexpectedEof);
            }

            return Err(ParseError::InvalidData);
        }
    };

    let digits = &src[..colon];

    if digits.is_empty()
        || digits.len() > SIZE_DIGITS_MAX
        || !digits.iter().all(u8::is_ascii_digit)
    {
        return Err(ParseError::InvalidData);
    }

    let size: usize = str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(ParseError::InvalidData)?;

    let start = colon + 1;
    let end = start.checked_add(size).ok_or(ParseError::InvalidData)?;

    if end >= src.len() {
        return Err(ParseError::UnexpectedEof);
    }

    let ftype = FrameType::from_tag(src[end]).ok_or(ParseError::InvalidData)?;

    Ok((
        Frame {
            ftype,
            data: &src[start..end],
        },
        &src[(end + 1)..],
    ))
}

/// Reads a string element without copying it.
pub fn parse_string(src: &[u8]) -> Result<(&[u8], &[u8]), ParseError> {
    let (frame, rest) = parse_frame(src)?;

    match frame.ftype {
        FrameType::String => Ok((frame.data, rest)),
        ftype => Err(ParseError::WrongType(ftype, FrameType::String)),
    }
}

/// Encodes raw bytes as a string element.
pub fn encode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + SIZE_DIGITS_MAX + 2);
    write_element(&mut out, data, FrameType::String);

    out
}

/// Decodes one element, recursing into arrays and maps. Returns the value
/// and the undecoded remainder.
pub fn decode(src: &[u8]) -> Result<(Value, &[u8]), ParseError> {
    let (frame, rest) = parse_frame(src)?;

    Ok((decode_payload(&frame)?, rest))
}

fn decode_payload(frame: &Frame) -> Result<Value, ParseError> {
    let value = match frame.ftype {
        FrameType::Null => {
            if !frame.data.is_empty() {
                return Err(ParseError::InvalidData);
            }

            Value::Null
        }
        FrameType::Bool => match frame.data {
            TRUE_BYTES => Value::Bool(true),
            FALSE_BYTES => Value::Bool(false),
            _ => return Err(ParseError::InvalidData),
        },
        FrameType::Int => Value::Int(parse_number(frame.data)?),
        FrameType::Float => Value::Float(parse_number(frame.data)?),
        FrameType::String => Value::String(frame.data.to_vec()),
        FrameType::Array => {
            let mut items = Vec::new();
            let mut src = frame.data;

            while !src.is_empty() {
                let (item, rest) = decode(src)?;
                items.push(item);
                src = rest;
            }

            Value::Array(items)
        }
        FrameType::Map => {
            let mut entries = Vec::new();
            let mut src = frame.data;

            while !src.is_empty() {
                let (key, rest) = parse_frame(src)?;

                let key = match key.ftype {
                    FrameType::String => {
                        str::from_utf8(key.data).map_err(|_| ParseError::InvalidKey)?
                    }
                    _ => return Err(ParseError::InvalidKey),
                };

                let (item, rest) = decode(rest)?;
                entries.push((key.to_string(), item));
                src = rest;
            }

            Value::Map(entries)
        }
    };

    Ok(value)
}

fn parse_number<T: str::FromStr>(data: &[u8]) -> Result<T, ParseError> {
    str::from_utf8(data)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(ParseError::InvalidData)
}

fn write_element(out: &mut Vec<u8>, payload: &[u8], ftype: FrameType) {
    out.extend_from_slice(payload.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(payload);
    out.push(ftype.tag());
}

/// An owned, fully decoded element.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(Vec<u8>),
    Array(Vec<Value>),
    Map(Vec<(String, Value)>),
}

impl Value {
    pub fn frame_type(&self) -> FrameType {
        match self {
            Self::Null => FrameType::Null,
            Self::Bool(_) => FrameType::Bool,
            Self::Int(_) => FrameType::Int,
            Self::Float(_) => FrameType::Float,
            Self::String(_) => FrameType::String,
            Self::Array(_) => FrameType::Array,
            Self::Map(_) => FrameType::Map,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(x) => Some(*x),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(x) => Some(*x),
            Self::Int(x) => Some(*x as f64),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|s| str::from_utf8(s).ok())
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&[(String, Value)]> {
        match self {
            Self::Map(entries) => Some(entries),
            _ => None,
        }
    }

    /// Looks up a map entry. Returns `None` for non-maps.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_map()?
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        match self {
            Self::Null => write_element(out, b"", FrameType::Null),
            Self::Bool(b) => {
                let data = if *b { TRUE_BYTES } else { FALSE_BYTES };
                write_element(out, data, FrameType::Bool);
            }
            Self::Int(x) => write_element(out, x.to_string().as_bytes(), FrameType::Int),
            Self::Float(x) => write_element(out, x.to_string().as_bytes(), FrameType::Float),
            Self::String(s) => write_element(out, s, FrameType::String),
            Self::Array(items) => {
                let mut payload = Vec::new();
                for item in items {
                    item.write_to(&mut payload);
                }

                write_element(out, &payload, FrameType::Array);
            }
            Self::Map(entries) => {
                let mut payload = Vec::new();
                for (k, v) in entries {
                    write_element(&mut payload, k.as_bytes(), FrameType::String);
                    v.write_to(&mut payload);
                }

                write_element(out, &payload, FrameType::Map);
            }
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.write_to(&mut out);

        out
    }

    pub fn serialize(&self, w: &mut dyn io::Write) -> Result<(), io::Error> {
        w.write_all(&self.to_bytes())
    }

    /// Converts to JSON. Non-UTF-8 strings are replaced lossily and
    /// non-finite floats become null.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Null => serde_json::Value::Null,
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Int(x) => serde_json::Value::from(*x),
            Self::Float(x) => serde_json::Number::from_f64(*x)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Self::String(s) => serde_json::Value::String(String::from_utf8_lossy(s).into_owned()),
            Self::Array(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Self::Map(entries) => serde_json::Value::Object(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }

    pub fn from_json(v: &serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(x) => Self::Int(x),
                None => Self::Float(n.as_f64().unwrap_or_default()),
            },
            serde_json::Value::String(s) => Self::String(s.as_bytes().to_vec()),
            serde_json::Value::Array(items) => {
                Self::Array(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => Self::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.as_bytes().to_vec())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s.into_bytes())
    }
}

impl From<&[u8]> for Value {
    fn from(s: &[u8]) -> Self {
        Self::String(s.to_vec())
    }
}

impl From<i64> for Value {
    fn from(x: i64) -> Self {
        Self::Int(x)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Self::Array(items)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(b) => write!(f, "{}", b),
            Self::Int(x) => write!(f, "{}", x),
            Self::Float(x) => write!(f, "{}", x),
            Self::String(s) => {
                write!(f, "\"")?;

                for b in s {
                    write!(f, "{}", ascii::escape_default(*b))?;
                }

                write!(f, "\"")
            }
            Self::Array(items) => {
                write!(f, "[ ")?;

                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }

                    write!(f, "{}", item)?;
                }

                write!(f, " ]")
            }
            Self::Map(entries) => {
                write!(f, "{{ ")?;

                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }

                    write!(f, "\"{}\": {}", k, v)?;
                }

                write!(f, " }}")
            }
        }
    }
}
