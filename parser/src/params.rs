// Copyright 2024 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Case-insensitive string map used for headers, query parameters and cookies

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// Map key that preserves the case it was inserted with but compares
/// ASCII-case-insensitively, so `Content-Type` and `content-type` address
/// the same entry.
#[derive(Debug, Clone)]
struct IgnoreCase(String);

impl PartialEq for IgnoreCase {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_ignore_ascii_case(&other.0)
    }
}

impl Eq for IgnoreCase {}

impl PartialOrd for IgnoreCase {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IgnoreCase {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .bytes()
            .map(|b| b.to_ascii_lowercase())
            .cmp(other.0.bytes().map(|b| b.to_ascii_lowercase()))
    }
}

/// An ordered map from ASCII-case-insensitive names to values.
#[derive(Debug, Clone, Default)]
pub struct ParamMap {
    entries: BTreeMap<IgnoreCase, String>,
}

impl ParamMap {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces an entry. The stored key keeps the caller's
    /// casing; replacement matches case-insensitively.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(IgnoreCase(key.into()), value.into());
    }

    /// Looks up a value by name, ignoring ASCII case.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .get(&IgnoreCase(key.to_owned()))
            .map(String::as_str)
    }

    /// Looks up a value by name, falling back to `default` when absent.
    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }

    /// Whether an entry with this name exists.
    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Removes an entry by name, returning its value if present.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.entries.remove(&IgnoreCase(key.to_owned()))
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates entries in case-insensitive name order, keys as inserted.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.0.as_str(), v.as_str()))
    }
}

impl fmt::Display for ParamMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (k, v) in self.iter() {
            writeln!(f, "{}: {}", k, v)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::ParamMap;

    #[test]
    fn lookup_ignores_ascii_case() {
        let mut map = ParamMap::new();
        map.insert("Content-Type", "text/plain");
        assert_eq!(Some("text/plain"), map.get("content-type"));
        assert_eq!(Some("text/plain"), map.get("CONTENT-TYPE"));
        assert_eq!(None, map.get("content-length"));
    }

    #[test]
    fn insert_replaces_entry_with_different_case() {
        let mut map = ParamMap::new();
        map.insert("Host", "a");
        map.insert("host", "b");
        assert_eq!(1, map.len());
        assert_eq!(Some("b"), map.get("HOST"));
    }

    #[test]
    fn keys_keep_inserted_casing() {
        let mut map = ParamMap::new();
        map.insert("X-Request-Id", "42");
        let (key, _) = map.iter().next().expect("one entry");
        assert_eq!("X-Request-Id", key);
    }

    #[test]
    fn get_or_falls_back_to_default() {
        let map = ParamMap::new();
        assert_eq!("", map.get_or("missing", ""));
        assert_eq!("def", map.get_or("missing", "def"));
    }
}
