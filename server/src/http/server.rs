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

//! HTTP/1.x server
//!
//! A thin adapter wiring the codec into a [`TcpServer`]: each new
//! connection gets a fresh [`HttpContext`]; each complete request runs the
//! user handler and the serialized response goes straight back out.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use rill_parser::{HttpRequest, HttpResponse, StatusCode, Version};

use crate::buffer::Buffer;
use crate::connection::TcpConnectionPtr;
use crate::event_loop::EventLoop;
use crate::http::HttpContext;
use crate::loop_thread::ThreadInitCallback;
use crate::server::TcpServer;

/// User request handler: fill in the response for a parsed request.
pub type HttpCallback = Arc<dyn Fn(&mut HttpRequest, &mut HttpResponse) + Send + Sync>;

fn default_http_callback(_request: &mut HttpRequest, response: &mut HttpResponse) {
    response.set_status(StatusCode::NotFound);
    response.set_close(true);
}

/// HTTP/1.x server over the multi-loop TCP server.
pub struct HttpServer {
    server: Arc<TcpServer>,
    http_callback: Mutex<HttpCallback>,
}

impl HttpServer {
    /// Binds an HTTP server on `loop_`.
    pub fn new(
        loop_: &Arc<EventLoop>,
        listen_addr: &SocketAddr,
        name: impl Into<String>,
        reuse_port: bool,
    ) -> io::Result<Arc<Self>> {
        let server = TcpServer::new(loop_, listen_addr, name, reuse_port)?;
        let http_server = Arc::new(Self {
            server,
            http_callback: Mutex::new(Arc::new(default_http_callback)),
        });

        http_server
            .server
            .set_connection_callback(Arc::new(on_connection));
        let weak = Arc::downgrade(&http_server);
        http_server.server.set_message_callback(Arc::new(
            move |conn: &TcpConnectionPtr, buffer: &mut Buffer, at: Instant| {
                if let Some(http_server) = weak.upgrade() {
                    http_server.on_message(conn, buffer, at);
                }
            },
        ));
        Ok(http_server)
    }

    /// The underlying TCP server.
    pub fn tcp_server(&self) -> &Arc<TcpServer> {
        &self.server
    }

    /// The actually bound address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.server.local_addr()
    }

    /// Installs the request handler.
    pub fn set_http_callback(&self, callback: HttpCallback) {
        *self.http_callback.lock().unwrap() = callback;
    }

    /// Number of worker loops.
    pub fn set_thread_num(&self, num: usize) {
        self.server.set_thread_num(num);
    }

    /// Installs the worker-loop init callback.
    pub fn set_thread_init_callback(&self, callback: ThreadInitCallback) {
        self.server.set_thread_init_callback(callback);
    }

    /// Starts listening.
    pub fn start(&self) {
        log::warn!(
            "HttpServer[{}] starts listening on {}",
            self.server.name(),
            self.server.ip_port()
        );
        self.server.start();
    }

    fn on_message(&self, conn: &TcpConnectionPtr, buffer: &mut Buffer, receive_time: Instant) {
        let parsed = conn.with_context_mut::<HttpContext, _>(|context| {
            let ok = context.parse(buffer, receive_time);
            let request = context.got_all().then(|| context.take_request());
            (ok, request)
        });
        let Some((ok, request)) = parsed else {
            return;
        };

        if !ok {
            conn.send(b"HTTP/1.1 400 Bad Request\r\n\r\n");
            conn.shutdown();
        }
        if let Some(mut request) = request {
            self.on_request(conn, &mut request);
        }
    }

    fn on_request(&self, conn: &TcpConnectionPtr, request: &mut HttpRequest) {
        let connection = request.header("Connection").unwrap_or("").to_owned();
        let close = connection == "close"
            || (request.version() == Version::Http10 && connection != "Keep-Alive");
        let mut response = HttpResponse::new(close);
        (self.http_callback.lock().unwrap().clone())(request, &mut response);

        let mut bytes = Vec::new();
        response.append_to(&mut bytes);
        let mut out = Buffer::with_capacity(bytes.len());
        out.append(&bytes);
        conn.send_buffer(&mut out);

        if response.close() {
            conn.shutdown();
        }
    }
}

impl std::fmt::Debug for HttpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpServer")
            .field("server", &self.server)
            .finish()
    }
}

fn on_connection(conn: &TcpConnectionPtr) {
    log::trace!(
        "HttpServer connection {} is {}",
        conn.name(),
        if conn.connected() { "UP" } else { "DOWN" }
    );
    if conn.connected() {
        conn.set_context(Box::new(HttpContext::new()));
    }
}
