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

use std::fmt;

#[derive(Clone, Debug, PartialEq)]
pub enum HeaderValue {
    Single(String),
    List(Vec<String>),
}

impl HeaderValue {
    /// The first value, or an empty string for an empty list.
    pub fn first(&self) -> &str {
        match self {
            Self::Single(s) => s,
            Self::List(l) => l.first().map(String::as_str).unwrap_or(""),
        }
    }

    pub fn values(&self) -> Vec<&str> {
        match self {
            Self::Single(s) => vec![s.as_str()],
            Self::List(l) => l.iter().map(String::as_str).collect(),
        }
    }

    fn combine(self, other: HeaderValue) -> HeaderValue {
        let mut out = match self {
            Self::Single(s) => vec![s],
            Self::List(l) => l,
        };

        match other {
            Self::Single(s) => out.push(s),
            Self::List(l) => out.extend(l),
        }

        Self::List(out)
    }
}

impl From<&str> for HeaderValue {
    fn from(s: &str) -> Self {
        Self::Single(s.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(s: String) -> Self {
        Self::Single(s)
    }
}

impl From<Vec<String>> for HeaderValue {
    fn from(l: Vec<String>) -> Self {
        Self::List(l)
    }
}

/// Ordered multimap with case-insensitive keys, where `-` and `_` are
/// equivalent. Keys are stored in normalized form.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Table {
    entries: Vec<(String, HeaderValue)>,
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn normalize_key(key: &str) -> String {
        key.to_ascii_lowercase().replace('-', "_")
    }

    /// Turns a normalized key into a header label, e.g. `content_type`
    /// becomes `Content-Type`.
    pub fn header_label(key: &str) -> String {
        key.split('_')
            .map(|part| {
                let mut chars = part.chars();
                match chars.next() {
                    Some(c) => c
                        .to_uppercase()
                        .chain(chars.flat_map(char::to_lowercase))
                        .collect::<String>(),
                    None => String::new(),
                }
            })
            .collect::<Vec<String>>()
            .join("-")
    }

    fn position(&self, key: &str) -> Option<usize> {
        let key = Self::normalize_key(key);

        self.entries.iter().position(|(k, _)| *k == key)
    }

    pub fn get(&self, key: &str) -> Option<&HeaderValue> {
        self.position(key).map(|i| &self.entries[i].1)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).map(HeaderValue::first)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.position(key).is_some()
    }

    /// Sets a value, replacing any previous one for the key.
    pub fn set<V: Into<HeaderValue>>(&mut self, key: &str, value: V) {
        let value = value.into();

        match self.position(key) {
            Some(i) => self.entries[i].1 = value,
            None => self.entries.push((Self::normalize_key(key), value)),
        }
    }

    /// Adds a value. A key that is already present collects its values
    /// into a list.
    pub fn append<V: Into<HeaderValue>>(&mut self, key: &str, value: V) {
        let value = value.into();

        match self.position(key) {
            Some(i) => {
                let prev = std::mem::replace(&mut self.entries[i].1, HeaderValue::List(Vec::new()));
                self.entries[i].1 = prev.combine(value);
            }
            None => self.entries.push((Self::normalize_key(key), value)),
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<HeaderValue> {
        self.position(key).map(|i| self.entries.remove(i).1)
    }

    /// Copies every entry of `other` into this table, replacing values for
    /// keys present in both.
    pub fn merge(&mut self, other: &Table) {
        for (k, v) in other.iter() {
            self.set(k, v.clone());
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &HeaderValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Yields one `(label, value)` pair per value, expanding lists.
    pub fn each_header(&self) -> impl Iterator<Item = (String, &str)> {
        self.entries.iter().flat_map(|(k, v)| {
            let label = Self::header_label(k);

            v.values().into_iter().map(move |s| (label.clone(), s))
        })
    }
}

impl<K: AsRef<str>, V: Into<HeaderValue>> FromIterator<(K, V)> for Table {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut t = Table::new();

        for (k, v) in iter {
            t.append(k.as_ref(), v);
        }

        t
    }
}

// sorted header lines, each terminated by CRLF
impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut lines: Vec<String> = self
            .each_header()
            .map(|(label, value)| format!("{}: {}", label, value))
            .collect();

        lines.sort();

        write!(f, "{}\r\n", lines.join("\r\n"))
    }
}
