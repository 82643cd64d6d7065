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

//! TCP server
//!
//! The acceptor lives on the base loop; every accepted connection is
//! assigned to the next worker loop round-robin and tracked in a
//! name-keyed table until its close routes back here.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::acceptor::Acceptor;
use crate::connection::{
    default_connection_callback, default_message_callback, ConnectionCallback, MessageCallback,
    TcpConnection, TcpConnectionPtr, WriteCompleteCallback,
};
use crate::event_loop::EventLoop;
use crate::loop_pool::EventLoopThreadPool;
use crate::loop_thread::ThreadInitCallback;
use crate::socket::{unspecified_addr, Socket};

/// Multi-loop TCP server.
pub struct TcpServer {
    loop_: Arc<EventLoop>,
    ip_port: String,
    name: String,
    acceptor: Arc<Acceptor>,
    thread_pool: Arc<EventLoopThreadPool>,
    connection_callback: Mutex<ConnectionCallback>,
    message_callback: Mutex<MessageCallback>,
    write_complete_callback: Mutex<Option<WriteCompleteCallback>>,
    thread_init_callback: Mutex<Option<ThreadInitCallback>>,
    started: AtomicBool,
    next_conn_id: AtomicU64,
    connections: Mutex<HashMap<String, TcpConnectionPtr>>,
}

impl TcpServer {
    /// Binds a server on `loop_` (its base loop). `reuse_port` allows a
    /// second server on the same address for kernel accept sharding.
    pub fn new(
        loop_: &Arc<EventLoop>,
        listen_addr: &SocketAddr,
        name: impl Into<String>,
        reuse_port: bool,
    ) -> io::Result<Arc<Self>> {
        let name = name.into();
        let acceptor = Acceptor::new(loop_, listen_addr, reuse_port)?;
        let server = Arc::new(Self {
            loop_: loop_.clone(),
            ip_port: listen_addr.to_string(),
            name: name.clone(),
            acceptor,
            thread_pool: Arc::new(EventLoopThreadPool::new(loop_.clone(), name)),
            connection_callback: Mutex::new(Arc::new(default_connection_callback)),
            message_callback: Mutex::new(Arc::new(default_message_callback)),
            write_complete_callback: Mutex::new(None),
            thread_init_callback: Mutex::new(None),
            started: AtomicBool::new(false),
            next_conn_id: AtomicU64::new(1),
            connections: Mutex::new(HashMap::new()),
        });

        let weak = Arc::downgrade(&server);
        server
            .acceptor
            .set_new_connection_callback(Box::new(move |socket, peer_addr| {
                if let Some(server) = weak.upgrade() {
                    server.new_connection(socket, peer_addr);
                }
            }));
        Ok(server)
    }

    /// The server name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The listen address as given at construction.
    pub fn ip_port(&self) -> &str {
        &self.ip_port
    }

    /// The actually bound address (resolves a port-0 bind).
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.acceptor.local_addr()
    }

    /// The base loop.
    pub fn owner_loop(&self) -> &Arc<EventLoop> {
        &self.loop_
    }

    /// Number of worker loops to spawn at [`TcpServer::start`].
    pub fn set_thread_num(&self, num: usize) {
        self.thread_pool.set_thread_num(num);
    }

    /// Installs the per-connection up/down callback.
    pub fn set_connection_callback(&self, callback: ConnectionCallback) {
        *self.connection_callback.lock().unwrap() = callback;
    }

    /// Installs the per-connection inbound-data callback.
    pub fn set_message_callback(&self, callback: MessageCallback) {
        *self.message_callback.lock().unwrap() = callback;
    }

    /// Installs the per-connection output-drained callback.
    pub fn set_write_complete_callback(&self, callback: WriteCompleteCallback) {
        *self.write_complete_callback.lock().unwrap() = Some(callback);
    }

    /// Installs the worker-loop init callback.
    pub fn set_thread_init_callback(&self, callback: ThreadInitCallback) {
        *self.thread_init_callback.lock().unwrap() = Some(callback);
    }

    /// Starts the pool and the listener. Idempotent; extra calls are
    /// no-ops.
    pub fn start(&self) {
        if self
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let init = self.thread_init_callback.lock().unwrap().clone();
            if let Err(e) = self.thread_pool.start(init) {
                fatal!("TcpServer::start [{}] pool start failed: {}", self.name, e);
            }
            assert!(!self.acceptor.listening());
            let acceptor = self.acceptor.clone();
            self.loop_.run_in_loop(move || acceptor.listen());
        }
    }

    /// Number of live connections in the table.
    pub fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    fn new_connection(self: Arc<Self>, socket: Socket, peer_addr: SocketAddr) {
        self.loop_.assert_in_loop_thread();
        let io_loop = self.thread_pool.get_next_loop();
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let conn_name = format!("{}-{}#{}", self.name, self.ip_port, id);
        log::info!(
            "TcpServer::new_connection [{}] - new connection [{}] from {}",
            self.name,
            conn_name,
            peer_addr
        );

        let local_addr = socket.local_addr().unwrap_or_else(|e| {
            log::error!("TcpServer::new_connection local_addr: {}", e);
            unspecified_addr()
        });
        let conn = TcpConnection::new(&io_loop, conn_name.clone(), socket, local_addr, peer_addr);

        conn.set_connection_callback(self.connection_callback.lock().unwrap().clone());
        conn.set_message_callback(self.message_callback.lock().unwrap().clone());
        if let Some(callback) = self.write_complete_callback.lock().unwrap().clone() {
            conn.set_write_complete_callback(callback);
        }
        let weak = Arc::downgrade(&self);
        conn.set_close_callback(Arc::new(move |conn: &TcpConnectionPtr| {
            if let Some(server) = weak.upgrade() {
                server.remove_connection(conn);
            }
        }));

        self.connections
            .lock()
            .unwrap()
            .insert(conn_name, conn.clone());
        io_loop.run_in_loop(move || conn.connect_established());
    }

    fn remove_connection(self: Arc<Self>, conn: &TcpConnectionPtr) {
        let conn = conn.clone();
        let loop_ = self.loop_.clone();
        loop_.run_in_loop(move || self.remove_connection_in_loop(&conn));
    }

    fn remove_connection_in_loop(&self, conn: &TcpConnectionPtr) {
        self.loop_.assert_in_loop_thread();
        log::info!(
            "TcpServer::remove_connection_in_loop [{}] - connection {}",
            self.name,
            conn.name()
        );
        let removed = self.connections.lock().unwrap().remove(conn.name());
        assert!(removed.is_some());

        let io_loop = conn.owner_loop().clone();
        let conn = conn.clone();
        io_loop.queue_in_loop(move || conn.connect_destroyed());
    }
}

impl Drop for TcpServer {
    /// Schedules `connect_destroyed` for every tracked connection on its
    /// own loop. The caller keeps those loops running long enough for the
    /// tasks to execute.
    fn drop(&mut self) {
        log::trace!("TcpServer::drop [{}]", self.name);
        let connections: Vec<TcpConnectionPtr> = {
            let mut table = self.connections.lock().unwrap();
            table.drain().map(|(_, conn)| conn).collect()
        };
        for conn in connections {
            let io_loop = conn.owner_loop().clone();
            io_loop.run_in_loop(move || conn.connect_destroyed());
        }
    }
}

impl std::fmt::Debug for TcpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpServer")
            .field("name", &self.name)
            .field("ip_port", &self.ip_port)
            .field("connections", &self.connection_count())
            .finish()
    }
}
