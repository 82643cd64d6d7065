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

//! Listening-socket state machine
//!
//! Accepted descriptors are handed to the server as owned [`Socket`]s
//! together with their peer address. A reserve descriptor on `/dev/null`
//! keeps the listener drainable through EMFILE storms: close the reserve,
//! accept the pending connection into the freed slot, drop it, reopen the
//! reserve.

use std::fs::File;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::channel::{Channel, EventHandler};
use crate::event_loop::EventLoop;
use crate::socket::Socket;

/// Callback invoked with each accepted connection.
pub type NewConnectionCallback = Box<dyn FnMut(Socket, SocketAddr) + Send>;

/// Accepts connections on one listening socket, on its loop's thread.
pub struct Acceptor {
    loop_: Arc<EventLoop>,
    accept_socket: Socket,
    accept_channel: Arc<Channel>,
    listening: AtomicBool,
    idle_fd: Mutex<Option<File>>,
    new_connection_callback: Mutex<Option<NewConnectionCallback>>,
}

impl Acceptor {
    /// Binds a listening socket. `reuse_port` opts into kernel-level accept
    /// sharding across listeners on the same address.
    pub fn new(
        loop_: &Arc<EventLoop>,
        listen_addr: &SocketAddr,
        reuse_port: bool,
    ) -> io::Result<Arc<Self>> {
        let accept_socket = Socket::new_nonblocking(listen_addr)?;
        accept_socket.set_reuse_addr(true);
        accept_socket.set_reuse_port(reuse_port);
        accept_socket.bind(listen_addr)?;

        let accept_channel = Channel::new(Arc::downgrade(loop_), accept_socket.fd());
        let acceptor = Arc::new(Self {
            loop_: loop_.clone(),
            accept_socket,
            accept_channel,
            listening: AtomicBool::new(false),
            idle_fd: Mutex::new(File::open("/dev/null").ok()),
            new_connection_callback: Mutex::new(None),
        });
        acceptor.accept_channel.tie(&acceptor);
        Ok(acceptor)
    }

    /// Installs the accepted-connection callback. Without one, accepted
    /// sockets are closed immediately.
    pub fn set_new_connection_callback(&self, callback: NewConnectionCallback) {
        *self.new_connection_callback.lock().unwrap() = Some(callback);
    }

    /// Whether [`Acceptor::listen`] has run.
    pub fn listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }

    /// The bound address, with the kernel-assigned port when bound to 0.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.accept_socket.local_addr()
    }

    /// Starts listening and subscribes to read readiness. Loop thread
    /// only. A listen failure is fatal: the server cannot exist without
    /// its socket.
    pub fn listen(&self) {
        self.loop_.assert_in_loop_thread();
        self.listening.store(true, Ordering::SeqCst);
        if let Err(e) = self.accept_socket.listen() {
            fatal!("Acceptor::listen: {}", e);
        }
        self.accept_channel.enable_reading();
    }

    /// Accepts until the kernel has nothing pending. The poller is
    /// edge-triggered, so stopping early would strand connections.
    fn accept_loop(&self) {
        self.loop_.assert_in_loop_thread();
        loop {
            match self.accept_socket.accept() {
                Ok((socket, peer_addr)) => {
                    let mut callback = self.new_connection_callback.lock().unwrap();
                    match callback.as_mut() {
                        Some(callback) => callback(socket, peer_addr),
                        None => drop(socket),
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => match e.raw_os_error() {
                    Some(libc::ECONNABORTED) | Some(libc::EPROTO) | Some(libc::EPERM) => {
                        log::warn!("Acceptor::accept transient error: {}", e);
                        continue;
                    }
                    Some(libc::EMFILE) => {
                        log::error!("Acceptor::accept hit the descriptor ceiling");
                        self.drain_one_with_reserve_fd();
                        continue;
                    }
                    _ => fatal!("Acceptor::accept: {}", e),
                },
            }
        }
    }

    /// See "The special problem of accept()ing when you can't" in libev's
    /// documentation: free the reserve descriptor, accept the pending
    /// connection into it, close it, reopen the reserve.
    fn drain_one_with_reserve_fd(&self) {
        let mut idle = self.idle_fd.lock().unwrap();
        idle.take();
        let fd = unsafe {
            libc::accept(
                self.accept_socket.fd(),
                std::ptr::null_mut(),
                std::ptr::null_mut(),
            )
        };
        if fd >= 0 {
            unsafe { libc::close(fd) };
        }
        *idle = File::open("/dev/null").ok();
    }
}

impl EventHandler for Acceptor {
    fn handle_read(self: Arc<Self>, _at: Instant) {
        self.accept_loop();
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        let channel = self.accept_channel.clone();
        self.loop_.run_in_loop(move || {
            channel.disable_all();
            channel.remove();
        });
    }
}

impl std::fmt::Debug for Acceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Acceptor")
            .field("fd", &self.accept_socket.fd())
            .field("listening", &self.listening())
            .finish()
    }
}
