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

//! Per-connection streaming request parser
//!
//! One [`HttpContext`] rides in each HTTP connection's context slot and
//! consumes the input buffer line by line as bytes arrive. Partial input
//! parks the machine until the next read; only a malformed request line is
//! a hard error.

use std::time::Instant;

use rill_parser::{parse_header_line, parse_request_line, HttpRequest};

use crate::buffer::Buffer;

/// Parser progress for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    /// Waiting for the request line.
    ExpectRequestLine,
    /// Request line done; consuming header lines.
    ExpectHeaders,
    /// Headers done; body framing is not implemented, so the parser never
    /// enters this state itself.
    ExpectBody,
    /// A complete request is ready.
    GotAll,
}

/// Streaming request parser state machine.
#[derive(Debug)]
pub struct HttpContext {
    state: ParseState,
    request: HttpRequest,
}

impl Default for HttpContext {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpContext {
    /// A fresh context expecting a request line.
    pub fn new() -> Self {
        Self {
            state: ParseState::ExpectRequestLine,
            request: HttpRequest::new(),
        }
    }

    /// Consumes as much of `buffer` as a complete parse step allows.
    /// Returns `false` only for a malformed request line; incomplete input
    /// returns `true` with the machine parked where it stopped.
    pub fn parse(&mut self, buffer: &mut Buffer, receive_time: Instant) -> bool {
        let mut ok = true;
        let mut has_more = true;
        while has_more {
            match self.state {
                ParseState::ExpectRequestLine => match buffer.find_crlf() {
                    Some(pos) => {
                        let line = buffer.peek()[..pos].to_vec();
                        match parse_request_line(&line, &mut self.request) {
                            Ok(()) => {
                                self.request.set_receive_time(receive_time);
                                buffer.retrieve_until(pos + 2);
                                self.state = ParseState::ExpectHeaders;
                            }
                            Err(_) => {
                                ok = false;
                                has_more = false;
                            }
                        }
                    }
                    None => has_more = false,
                },
                ParseState::ExpectHeaders => match buffer.find_crlf() {
                    Some(pos) => {
                        if pos == 0 {
                            // Blank line: end of headers.
                            self.state = ParseState::GotAll;
                            has_more = false;
                        } else {
                            let line = buffer.peek()[..pos].to_vec();
                            if !parse_header_line(&line, &mut self.request) {
                                // No colon: not a header, stop here.
                                self.state = ParseState::GotAll;
                                has_more = false;
                            }
                        }
                        buffer.retrieve_until(pos + 2);
                    }
                    None => has_more = false,
                },
                ParseState::ExpectBody | ParseState::GotAll => has_more = false,
            }
        }
        ok
    }

    /// Whether a complete request is ready.
    pub fn got_all(&self) -> bool {
        self.state == ParseState::GotAll
    }

    /// Current machine state.
    pub fn state(&self) -> ParseState {
        self.state
    }

    /// The request being assembled.
    pub fn request(&self) -> &HttpRequest {
        &self.request
    }

    /// Mutable access to the request (lazy param population needs it).
    pub fn request_mut(&mut self) -> &mut HttpRequest {
        &mut self.request
    }

    /// Hands out the finished request and re-arms for the next one.
    pub fn take_request(&mut self) -> HttpRequest {
        let request = std::mem::take(&mut self.request);
        self.state = ParseState::ExpectRequestLine;
        request
    }

    /// Re-arms for the next request on the connection.
    pub fn reset(&mut self) {
        self.state = ParseState::ExpectRequestLine;
        self.request = HttpRequest::new();
    }
}

#[cfg(test)]
mod test {
    use super::{HttpContext, ParseState};
    use crate::buffer::Buffer;
    use rill_parser::{Method, Version};
    use std::time::Instant;

    fn buffer_of(bytes: &[u8]) -> Buffer {
        let mut buffer = Buffer::new();
        buffer.append(bytes);
        buffer
    }

    #[test]
    fn complete_request_parses_in_one_pass() {
        let mut buffer = buffer_of(b"GET /index.html?a=1 HTTP/1.1\r\nHost: example.com\r\n\r\n");
        let mut context = HttpContext::new();
        assert!(context.parse(&mut buffer, Instant::now()));
        assert!(context.got_all());

        let request = context.request();
        assert_eq!(Method::Get, request.method());
        assert_eq!("/index.html", request.path());
        assert_eq!("a=1", request.query());
        assert_eq!(Version::Http11, request.version());
        assert_eq!(Some("example.com"), request.header("Host"));
        assert_eq!(0, buffer.readable_bytes());
    }

    #[test]
    fn partial_input_parks_and_resumes() {
        let mut context = HttpContext::new();

        let mut buffer = buffer_of(b"POST /submit HT");
        assert!(context.parse(&mut buffer, Instant::now()));
        assert_eq!(ParseState::ExpectRequestLine, context.state());

        buffer.append(b"TP/1.0\r\nContent-Le");
        assert!(context.parse(&mut buffer, Instant::now()));
        assert_eq!(ParseState::ExpectHeaders, context.state());

        buffer.append(b"ngth: 0\r\n\r\n");
        assert!(context.parse(&mut buffer, Instant::now()));
        assert!(context.got_all());
        assert_eq!(Some("0"), context.request().header("content-length"));
    }

    #[test]
    fn malformed_request_line_is_the_only_hard_error() {
        let mut buffer = buffer_of(b"GET / HXXP/1.1\r\n\r\n");
        let mut context = HttpContext::new();
        assert!(!context.parse(&mut buffer, Instant::now()));
        assert!(!context.got_all());
    }

    #[test]
    fn unknown_method_rejects_the_request_line() {
        let mut buffer = buffer_of(b"BREW /pot HTTP/1.1\r\n\r\n");
        let mut context = HttpContext::new();
        assert!(!context.parse(&mut buffer, Instant::now()));
    }

    #[test]
    fn take_request_rearms_for_the_next_request() {
        let mut buffer = buffer_of(b"GET /one HTTP/1.1\r\n\r\n");
        let mut context = HttpContext::new();
        assert!(context.parse(&mut buffer, Instant::now()));
        assert!(context.got_all());
        let first = context.take_request();
        assert_eq!("/one", first.path());
        assert_eq!(ParseState::ExpectRequestLine, context.state());

        buffer.append(b"GET /two HTTP/1.1\r\n\r\n");
        assert!(context.parse(&mut buffer, Instant::now()));
        assert!(context.got_all());
        assert_eq!("/two", context.request().path());
    }

    #[test]
    fn receive_time_is_stamped_with_the_request_line() {
        let before = Instant::now();
        let mut buffer = buffer_of(b"GET / HTTP/1.1\r\n\r\n");
        let mut context = HttpContext::new();
        assert!(context.parse(&mut buffer, before));
        assert_eq!(Some(before), context.request().receive_time());
    }
}
