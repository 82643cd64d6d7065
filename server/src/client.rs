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

//! TCP client
//!
//! One connector, at most one live connection. With retry enabled, losing
//! the connection restarts the connector from the initial backoff.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::connection::{
    default_connection_callback, default_message_callback, CloseCallback, ConnectionCallback,
    MessageCallback, TcpConnection, TcpConnectionPtr, WriteCompleteCallback,
};
use crate::connector::Connector;
use crate::event_loop::EventLoop;
use crate::socket::{unspecified_addr, Socket};

/// TCP client driving a single outbound connection.
pub struct TcpClient {
    loop_: Arc<EventLoop>,
    connector: Arc<Connector>,
    name: String,
    connection_callback: Mutex<ConnectionCallback>,
    message_callback: Mutex<MessageCallback>,
    write_complete_callback: Mutex<Option<WriteCompleteCallback>>,
    retry: AtomicBool,
    connect: AtomicBool,
    next_conn_id: AtomicU64,
    connection: Mutex<Option<TcpConnectionPtr>>,
}

impl TcpClient {
    /// Creates an idle client targeting `server_addr`.
    pub fn new(
        loop_: &Arc<EventLoop>,
        server_addr: std::net::SocketAddr,
        name: impl Into<String>,
    ) -> Arc<Self> {
        let name = name.into();
        let client = Arc::new(Self {
            loop_: loop_.clone(),
            connector: Connector::new(loop_, server_addr),
            name,
            connection_callback: Mutex::new(Arc::new(default_connection_callback)),
            message_callback: Mutex::new(Arc::new(default_message_callback)),
            write_complete_callback: Mutex::new(None),
            retry: AtomicBool::new(false),
            connect: AtomicBool::new(true),
            next_conn_id: AtomicU64::new(1),
            connection: Mutex::new(None),
        });

        let weak = Arc::downgrade(&client);
        client
            .connector
            .set_new_connection_callback(Box::new(move |socket| {
                if let Some(client) = weak.upgrade() {
                    client.new_connection(socket);
                }
            }));
        log::info!("TcpClient::new [{}] - connector to {}", client.name, server_addr);
        client
    }

    /// The client name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The current connection, if established.
    pub fn connection(&self) -> Option<TcpConnectionPtr> {
        self.connection.lock().unwrap().clone()
    }

    /// Whether reconnect-on-loss is enabled.
    pub fn retry(&self) -> bool {
        self.retry.load(Ordering::SeqCst)
    }

    /// Reconnect automatically whenever an established connection drops.
    pub fn enable_retry(&self) {
        self.retry.store(true, Ordering::SeqCst);
    }

    /// Starts connecting. Callable from any thread.
    pub fn connect(&self) {
        log::info!(
            "TcpClient::connect [{}] - connecting to {}",
            self.name,
            self.connector.server_addr()
        );
        self.connect.store(true, Ordering::SeqCst);
        self.connector.start();
    }

    /// Gracefully shuts down the established connection, if any.
    pub fn disconnect(&self) {
        self.connect.store(false, Ordering::SeqCst);
        if let Some(conn) = &*self.connection.lock().unwrap() {
            conn.shutdown();
        }
    }

    /// Stops connecting without touching an established connection.
    pub fn stop(&self) {
        self.connect.store(false, Ordering::SeqCst);
        self.connector.stop();
    }

    /// Installs the up/down callback for future connections.
    pub fn set_connection_callback(&self, callback: ConnectionCallback) {
        *self.connection_callback.lock().unwrap() = callback;
    }

    /// Installs the inbound-data callback for future connections.
    pub fn set_message_callback(&self, callback: MessageCallback) {
        *self.message_callback.lock().unwrap() = callback;
    }

    /// Installs the output-drained callback for future connections.
    pub fn set_write_complete_callback(&self, callback: WriteCompleteCallback) {
        *self.write_complete_callback.lock().unwrap() = Some(callback);
    }

    fn new_connection(self: Arc<Self>, socket: Socket) {
        self.loop_.assert_in_loop_thread();
        let peer_addr = socket.peer_addr().unwrap_or_else(|_| unspecified_addr());
        let local_addr = socket.local_addr().unwrap_or_else(|_| unspecified_addr());
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let conn_name = format!("{}:{}#{}", self.name, peer_addr, id);

        let conn = TcpConnection::new(&self.loop_, conn_name, socket, local_addr, peer_addr);
        conn.set_connection_callback(self.connection_callback.lock().unwrap().clone());
        conn.set_message_callback(self.message_callback.lock().unwrap().clone());
        if let Some(callback) = self.write_complete_callback.lock().unwrap().clone() {
            conn.set_write_complete_callback(callback);
        }
        let weak = Arc::downgrade(&self);
        conn.set_close_callback(Arc::new(move |conn: &TcpConnectionPtr| {
            if let Some(client) = weak.upgrade() {
                client.remove_connection(conn);
            }
        }));

        *self.connection.lock().unwrap() = Some(conn.clone());
        conn.connect_established();
    }

    fn remove_connection(self: Arc<Self>, conn: &TcpConnectionPtr) {
        self.loop_.assert_in_loop_thread();

        {
            let mut slot = self.connection.lock().unwrap();
            debug_assert!(slot.as_ref().map_or(false, |c| Arc::ptr_eq(c, conn)));
            slot.take();
        }
        let conn = conn.clone();
        self.loop_.queue_in_loop(move || conn.connect_destroyed());

        if self.retry() && self.connect.load(Ordering::SeqCst) {
            log::info!(
                "TcpClient::remove_connection [{}] - reconnecting to {}",
                self.name,
                self.connector.server_addr()
            );
            self.connector.restart();
        }
    }
}

impl Drop for TcpClient {
    /// A uniquely-held connection is force-closed; otherwise the close
    /// callback is redirected so the connection can finish its teardown
    /// without the client. With no connection, the connector is stopped
    /// and kept alive briefly for callbacks still in flight.
    fn drop(&mut self) {
        log::info!("TcpClient::drop [{}]", self.name);
        let conn = {
            let slot = self.connection.lock().unwrap();
            slot.as_ref()
                .map(|c| (c.clone(), Arc::strong_count(c) == 2))
        };

        match conn {
            Some((conn, unique)) => {
                let loop_ = self.loop_.clone();
                let callback: CloseCallback = Arc::new(move |conn: &TcpConnectionPtr| {
                    let conn = conn.clone();
                    loop_.queue_in_loop(move || conn.connect_destroyed());
                });
                let target = conn.clone();
                self.loop_
                    .run_in_loop(move || target.set_close_callback(callback));
                if unique {
                    conn.force_close();
                }
            }
            None => {
                self.connector.stop();
                let connector = self.connector.clone();
                self.loop_.run_after(Duration::from_secs(1), move || {
                    let _ = &connector;
                });
            }
        }
    }
}

impl std::fmt::Debug for TcpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpClient")
            .field("name", &self.name)
            .field("server_addr", &self.connector.server_addr())
            .field("connected", &self.connection().is_some())
            .finish()
    }
}
