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

//! HTTP request representation and line-level parsing

use core::fmt::Display;
use std::time::Instant;

use crate::escape::url_decode;
use crate::method::Method;
use crate::params::ParamMap;
use crate::version::Version;

/// Represents possible failures while parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// Unrecognized method token.
    Method,
    /// Malformed request target.
    Target,
    /// Version token other than HTTP/1.0 or HTTP/1.1.
    Version,
}

impl ParseError {
    fn description_str(&self) -> &'static str {
        match *self {
            ParseError::Method => "Invalid token in method",
            ParseError::Target => "Invalid request target",
            ParseError::Version => "Invalid version",
        }
    }
}

impl Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.description_str())
    }
}

impl std::error::Error for ParseError {}

const QUERY_PARSED: u8 = 0x1;
const BODY_PARSED: u8 = 0x2;
const COOKIES_PARSED: u8 = 0x4;

/// A single parsed HTTP/1.x request.
///
/// The request line and headers are filled by the streaming parser; query
/// parameters, form-body parameters and cookies are populated lazily the
/// first time they are asked for, tracked by a per-source parsed flag.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    method: Method,
    version: Version,
    uri: String,
    path: String,
    query: String,
    fragment: String,
    body: String,
    headers: ParamMap,
    params: ParamMap,
    cookies: ParamMap,
    close: bool,
    websocket: bool,
    parse_flags: u8,
    receive_time: Option<Instant>,
}

impl Default for HttpRequest {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpRequest {
    /// Creates an empty request: `GET / HTTP/1.1` with no headers.
    pub fn new() -> Self {
        Self {
            method: Method::Get,
            version: Version::Http11,
            uri: String::new(),
            path: "/".to_owned(),
            query: String::new(),
            fragment: String::new(),
            body: String::new(),
            headers: ParamMap::new(),
            params: ParamMap::new(),
            cookies: ParamMap::new(),
            close: false,
            websocket: false,
            parse_flags: 0,
            receive_time: None,
        }
    }

    /// The request method.
    pub fn method(&self) -> Method {
        self.method
    }

    /// Sets the request method.
    pub fn set_method(&mut self, method: Method) {
        self.method = method;
    }

    /// The protocol version.
    pub fn version(&self) -> Version {
        self.version
    }

    /// Sets the protocol version.
    pub fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    /// The decoded-from-the-request-line path component, `/` when absent.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Sets the path component.
    pub fn set_path(&mut self, path: impl Into<String>) {
        self.path = path.into();
    }

    /// The raw query string, without the leading `?`.
    pub fn query(&self) -> &str {
        &self.query
    }

    /// Sets the raw query string.
    pub fn set_query(&mut self, query: impl Into<String>) {
        self.query = query.into();
    }

    /// The full request target as it appeared on the request line.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// The fragment component, without the leading `#`.
    pub fn fragment(&self) -> &str {
        &self.fragment
    }

    /// The request body.
    pub fn body(&self) -> &str {
        &self.body
    }

    /// Sets the request body.
    pub fn set_body(&mut self, body: impl Into<String>) {
        self.body = body.into();
    }

    /// The header map.
    pub fn headers(&self) -> &ParamMap {
        &self.headers
    }

    /// Looks up a header value by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// Inserts or replaces a header.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name, value);
    }

    /// Removes a header by name.
    pub fn remove_header(&mut self, name: &str) -> Option<String> {
        self.headers.remove(name)
    }

    /// Looks up a query or form parameter, populating the parameter map
    /// from the query string and the urlencoded body on first use.
    pub fn param(&mut self, name: &str) -> Option<&str> {
        self.init_query_params();
        self.init_body_params();
        self.params.get(name)
    }

    /// The parameter map, populated on first use.
    pub fn params(&mut self) -> &ParamMap {
        self.init_query_params();
        self.init_body_params();
        &self.params
    }

    /// Looks up a cookie, populating the cookie map from the `Cookie`
    /// header on first use.
    pub fn cookie(&mut self, name: &str) -> Option<&str> {
        self.init_cookies();
        self.cookies.get(name)
    }

    /// The cookie map, populated on first use.
    pub fn cookies(&mut self) -> &ParamMap {
        self.init_cookies();
        &self.cookies
    }

    /// Whether the peer asked for the connection to be closed.
    pub fn close(&self) -> bool {
        self.close
    }

    /// Sets the close flag.
    pub fn set_close(&mut self, close: bool) {
        self.close = close;
    }

    /// Whether this request asked for a websocket upgrade.
    pub fn websocket(&self) -> bool {
        self.websocket
    }

    /// Sets the websocket flag.
    pub fn set_websocket(&mut self, websocket: bool) {
        self.websocket = websocket;
    }

    /// When the bytes completing the request line were received.
    pub fn receive_time(&self) -> Option<Instant> {
        self.receive_time
    }

    /// Records the receive timestamp.
    pub fn set_receive_time(&mut self, at: Instant) {
        self.receive_time = Some(at);
    }

    fn init_query_params(&mut self) {
        if self.parse_flags & QUERY_PARSED != 0 {
            return;
        }
        let query = self.query.clone();
        parse_params(&query, '&', false, &mut self.params);
        self.parse_flags |= QUERY_PARSED;
    }

    fn init_body_params(&mut self) {
        if self.parse_flags & BODY_PARSED != 0 {
            return;
        }
        let form = self
            .header("Content-Type")
            .map(|v| {
                v.to_ascii_lowercase()
                    .contains("application/x-www-form-urlencoded")
            })
            .unwrap_or(false);
        if form {
            let body = self.body.clone();
            parse_params(&body, '&', false, &mut self.params);
        }
        self.parse_flags |= BODY_PARSED;
    }

    fn init_cookies(&mut self) {
        if self.parse_flags & COOKIES_PARSED != 0 {
            return;
        }
        if let Some(cookie) = self.header("Cookie").map(str::to_owned) {
            parse_params(&cookie, ';', true, &mut self.cookies);
        }
        self.parse_flags |= COOKIES_PARSED;
    }

    /// Serializes the request line, headers and body back to wire form.
    pub fn append_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.method.as_str().as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.path.as_bytes());
        if !self.query.is_empty() {
            out.push(b'?');
            out.extend_from_slice(self.query.as_bytes());
        }
        if !self.fragment.is_empty() {
            out.push(b'#');
            out.extend_from_slice(self.fragment.as_bytes());
        }
        out.push(b' ');
        out.extend_from_slice(self.version.as_str().as_bytes());
        out.extend_from_slice(b"\r\n");
        for (name, value) in self.headers.iter() {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(self.body.as_bytes());
    }
}

/// Splits `key=value` pairs separated by `sep` into `out`, url-decoding the
/// values (`+` as space). Pairs without `=` end the scan; keys are
/// optionally trimmed of surrounding whitespace (cookies).
fn parse_params(input: &str, sep: char, trim_keys: bool, out: &mut ParamMap) {
    let mut rest = input;
    while let Some(eq) = rest.find('=') {
        let key = &rest[..eq];
        let after = &rest[eq + 1..];
        let (value, next) = match after.find(sep) {
            Some(pos) => (&after[..pos], Some(&after[pos + 1..])),
            None => (after, None),
        };
        let key = if trim_keys { key.trim() } else { key };
        out.insert(key, url_decode(value, true));
        match next {
            Some(n) => rest = n,
            None => break,
        }
    }
}

/// Parses a request line (without its CRLF) into `request`.
///
/// The line is split on its two single spaces: method, target, version. An
/// unknown method, a target that is not UTF-8, or a version other than
/// `HTTP/1.0`/`HTTP/1.1` rejects the line. The target is decomposed into
/// path (`/` when empty), raw query and fragment.
pub fn parse_request_line(line: &[u8], request: &mut HttpRequest) -> Result<(), ParseError> {
    let mut parts = line.splitn(3, |&b| b == b' ');
    let method = Method::from_bytes(parts.next().unwrap_or(b""));
    if method == Method::Invalid {
        return Err(ParseError::Method);
    }
    let target = parts.next().ok_or(ParseError::Target)?;
    let target = std::str::from_utf8(target).map_err(|_| ParseError::Target)?;
    if target.is_empty() {
        return Err(ParseError::Target);
    }
    let version =
        Version::from_bytes(parts.next().ok_or(ParseError::Version)?).ok_or(ParseError::Version)?;

    request.method = method;
    request.version = version;
    request.uri = target.to_owned();

    let (rest, fragment) = match target.find('#') {
        Some(pos) => (&target[..pos], &target[pos + 1..]),
        None => (target, ""),
    };
    let (path, query) = match rest.find('?') {
        Some(pos) => (&rest[..pos], &rest[pos + 1..]),
        None => (rest, ""),
    };
    request.path = if path.is_empty() {
        "/".to_owned()
    } else {
        path.to_owned()
    };
    request.query = query.to_owned();
    request.fragment = fragment.to_owned();
    Ok(())
}

/// Parses one header line (without its CRLF) into `request`.
///
/// Returns `true` when the line contained a `name: value` pair; the value
/// is left-trimmed of ASCII whitespace. A line without a colon is not a
/// header and returns `false`.
pub fn parse_header_line(line: &[u8], request: &mut HttpRequest) -> bool {
    let Some(colon) = line.iter().position(|&b| b == b':') else {
        return false;
    };
    let name = String::from_utf8_lossy(&line[..colon]).into_owned();
    let value = &line[colon + 1..];
    let start = value
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(value.len());
    let value = String::from_utf8_lossy(&value[start..]).into_owned();
    request.headers.insert(name, value);
    true
}

#[cfg(test)]
mod test {
    use super::{parse_header_line, parse_request_line, HttpRequest, ParseError};
    use crate::method::Method;
    use crate::version::Version;

    fn parsed(line: &[u8]) -> HttpRequest {
        let mut request = HttpRequest::new();
        parse_request_line(line, &mut request).expect("request line parses");
        request
    }

    #[test]
    fn request_line_splits_method_target_version() {
        let req = parsed(b"GET /index.html HTTP/1.1");
        assert_eq!(Method::Get, req.method());
        assert_eq!("/index.html", req.path());
        assert_eq!(Version::Http11, req.version());
        assert_eq!("/index.html", req.uri());
    }

    #[test]
    fn request_line_splits_query_from_path() {
        let req = parsed(b"GET /search?q=rust&lang=en HTTP/1.0");
        assert_eq!("/search", req.path());
        assert_eq!("q=rust&lang=en", req.query());
        assert_eq!(Version::Http10, req.version());
    }

    #[test]
    fn request_line_splits_fragment_after_query() {
        let req = parsed(b"GET /doc?x=1#part2 HTTP/1.1");
        assert_eq!("/doc", req.path());
        assert_eq!("x=1", req.query());
        assert_eq!("part2", req.fragment());
    }

    #[test]
    fn empty_path_parses_as_root() {
        let req = parsed(b"GET ?a=1 HTTP/1.1");
        assert_eq!("/", req.path());
        assert_eq!("a=1", req.query());
    }

    #[test]
    fn unknown_method_is_rejected() {
        let mut request = HttpRequest::new();
        assert_eq!(
            Err(ParseError::Method),
            parse_request_line(b"PATCH /x HTTP/1.1", &mut request)
        );
    }

    #[test]
    fn bad_version_is_rejected() {
        let mut request = HttpRequest::new();
        assert_eq!(
            Err(ParseError::Version),
            parse_request_line(b"GET / HXXP/1.1", &mut request)
        );
        assert_eq!(
            Err(ParseError::Version),
            parse_request_line(b"GET / HTTP/2.0", &mut request)
        );
        assert_eq!(
            Err(ParseError::Version),
            parse_request_line(b"GET /", &mut request)
        );
    }

    #[test]
    fn header_line_left_trims_value() {
        let mut request = HttpRequest::new();
        assert!(parse_header_line(b"Host:   example.com", &mut request));
        assert_eq!(Some("example.com"), request.header("host"));
    }

    #[test]
    fn header_line_without_colon_is_not_a_header() {
        let mut request = HttpRequest::new();
        assert!(!parse_header_line(b"not a header line", &mut request));
        assert!(request.headers().is_empty());
    }

    #[test]
    fn query_params_populate_lazily_and_once() {
        let mut req = parsed(b"GET /x?a=1&b=two+words&c=%2Fetc HTTP/1.1");
        assert_eq!(Some("1"), req.param("a"));
        assert_eq!(Some("two words"), req.param("b"));
        assert_eq!(Some("/etc"), req.param("c"));

        // Mutating the query after the first access must not re-populate.
        req.set_query("a=999");
        assert_eq!(Some("1"), req.param("a"));
    }

    #[test]
    fn empty_query_yields_empty_param_map() {
        let mut req = parsed(b"GET /x HTTP/1.1");
        assert!(req.params().is_empty());
    }

    #[test]
    fn body_params_parse_only_for_urlencoded_forms() {
        let mut req = parsed(b"POST /submit HTTP/1.1");
        req.set_header("Content-Type", "application/x-www-form-urlencoded");
        req.set_body("name=alice&city=oslo");
        assert_eq!(Some("alice"), req.param("name"));
        assert_eq!(Some("oslo"), req.param("city"));

        let mut plain = parsed(b"POST /submit HTTP/1.1");
        plain.set_header("Content-Type", "text/plain");
        plain.set_body("name=alice");
        assert_eq!(None, plain.param("name"));
    }

    #[test]
    fn cookies_split_on_semicolons_and_trim() {
        let mut req = parsed(b"GET / HTTP/1.1");
        req.set_header("Cookie", "sid=abc123; theme=dark ; lang=en");
        assert_eq!(Some("abc123"), req.cookie("sid"));
        assert_eq!(Some("dark "), req.cookie("theme"));
        assert_eq!(Some("en"), req.cookie("lang"));
    }

    #[test]
    fn cookie_header_without_semicolons_yields_one_entry() {
        let mut req = parsed(b"GET / HTTP/1.1");
        req.set_header("Cookie", "sid=abc123");
        assert_eq!(1, req.cookies().len());
        assert_eq!(Some("abc123"), req.cookie("sid"));
    }

    #[test]
    fn serialization_round_trips_request_line_and_headers() {
        let raw = b"GET /x?a=1 HTTP/1.1\r\nHost: h\r\n\r\n";
        let mut req = HttpRequest::new();
        parse_request_line(b"GET /x?a=1 HTTP/1.1", &mut req).expect("parses");
        parse_header_line(b"Host: h", &mut req);

        let mut out = Vec::new();
        req.append_to(&mut out);
        assert_eq!(raw.as_slice(), out.as_slice());
    }
}
