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

//! HTTP response representation and serialization

use crate::params::ParamMap;
use crate::status::StatusCode;

/// A response under construction by a request handler.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    status: StatusCode,
    headers: ParamMap,
    body: String,
    close: bool,
}

impl HttpResponse {
    /// Creates an empty `200 OK` response with the given close flag.
    pub fn new(close: bool) -> Self {
        Self {
            status: StatusCode::Ok,
            headers: ParamMap::new(),
            body: String::new(),
            close,
        }
    }

    /// The response status.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Sets the response status.
    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    /// The response body.
    pub fn body(&self) -> &str {
        &self.body
    }

    /// Sets the response body.
    pub fn set_body(&mut self, body: impl Into<String>) {
        self.body = body.into();
    }

    /// Inserts or replaces a custom header.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name, value);
    }

    /// Whether the connection should be closed after this response.
    pub fn close(&self) -> bool {
        self.close
    }

    /// Sets the close flag.
    pub fn set_close(&mut self, close: bool) {
        self.close = close;
    }

    /// Serializes the response to wire form.
    ///
    /// The status line always advertises HTTP/1.1. A closing response
    /// carries `Connection: close`; a keep-alive response carries
    /// `Content-Length` and `Connection: Keep-Alive`. Custom headers follow,
    /// then the blank line and the body.
    pub fn append_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(b"HTTP/1.1 ");
        out.extend_from_slice(self.status.code().to_string().as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.status.reason().as_bytes());
        out.extend_from_slice(b"\r\n");

        if self.close {
            out.extend_from_slice(b"Connection: close\r\n");
        } else {
            out.extend_from_slice(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
            out.extend_from_slice(b"Connection: Keep-Alive\r\n");
        }

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

#[cfg(test)]
mod test {
    use super::HttpResponse;
    use crate::status::StatusCode;

    fn serialized(response: &HttpResponse) -> Vec<u8> {
        let mut out = Vec::new();
        response.append_to(&mut out);
        out
    }

    #[test]
    fn keep_alive_response_carries_content_length() {
        let mut response = HttpResponse::new(false);
        response.set_status(StatusCode::Ok);
        response.set_body("ok");
        assert_eq!(
            b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: Keep-Alive\r\n\r\nok".as_slice(),
            serialized(&response).as_slice()
        );
    }

    #[test]
    fn closing_response_omits_content_length() {
        let mut response = HttpResponse::new(true);
        response.set_status(StatusCode::NotFound);
        assert_eq!(
            b"HTTP/1.1 404 Not Found\r\nConnection: close\r\n\r\n".as_slice(),
            serialized(&response).as_slice()
        );
    }

    #[test]
    fn custom_headers_follow_connection_headers() {
        let mut response = HttpResponse::new(false);
        response.set_body("x");
        response.set_header("Content-Type", "text/plain");
        let bytes = serialized(&response);
        let text = String::from_utf8(bytes).expect("ascii response");
        assert_eq!(
            "HTTP/1.1 200 OK\r\nContent-Length: 1\r\nConnection: Keep-Alive\r\n\
             Content-Type: text/plain\r\n\r\nx",
            text
        );
    }
}
