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

//! Established TCP connection
//!
//! A [`TcpConnection`] owns its socket, channel and both buffers, and runs
//! a four-state lifecycle:
//!
//! ```text
//!           connect/accept
//!    CONNECTING ─────────────► CONNECTED
//!        │                        │
//!        │ failure                │ shutdown()
//!        ▼                        ▼
//!    DISCONNECTED            DISCONNECTING
//!                                │
//!                                ▼
//!                          DISCONNECTED
//! ```
//!
//! Connections are shared as `Arc<TcpConnection>` between the server's
//! table, in-flight callbacks and queued loop tasks; the channel holds only
//! a weak tie, and the last owner standing drops the socket — always after
//! [`TcpConnection::connect_destroyed`] ran on the owner loop.

use std::any::Any;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::buffer::Buffer;
use crate::channel::{Channel, EventHandler};
use crate::event_loop::EventLoop;
use crate::socket::Socket;

/// Shared handle to a connection.
pub type TcpConnectionPtr = Arc<TcpConnection>;

/// Invoked when a connection is established and when it goes down.
pub type ConnectionCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;
/// Invoked with freshly read bytes and the poll return time.
pub type MessageCallback = Arc<dyn Fn(&TcpConnectionPtr, &mut Buffer, Instant) + Send + Sync>;
/// Invoked after the output buffer fully drained.
pub type WriteCompleteCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;
/// Invoked when the output buffer crosses the high-water mark upward.
pub type HighWaterMarkCallback = Arc<dyn Fn(&TcpConnectionPtr, usize) + Send + Sync>;
/// Internal: routes a closing connection back to its server or client.
pub type CloseCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;

const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    /// Socket exists, not yet handed to its loop.
    Connecting = 0,
    /// Fully established; the only state that may send.
    Connected = 1,
    /// Local shutdown requested; output still draining.
    Disconnecting = 2,
    /// Terminal.
    Disconnected = 3,
}

fn state_from(value: u8) -> State {
    match value {
        0 => State::Connecting,
        1 => State::Connected,
        2 => State::Disconnecting,
        _ => State::Disconnected,
    }
}

/// Logs the default up/down transition trace.
pub fn default_connection_callback(conn: &TcpConnectionPtr) {
    log::trace!(
        "{} -> {} is {}",
        conn.local_addr(),
        conn.peer_addr(),
        if conn.connected() { "UP" } else { "DOWN" }
    );
}

/// Discards whatever arrived.
pub fn default_message_callback(_conn: &TcpConnectionPtr, buffer: &mut Buffer, _at: Instant) {
    buffer.retrieve_all();
}

/// One established connection, pinned to an owner loop.
pub struct TcpConnection {
    self_weak: std::sync::Weak<TcpConnection>,
    loop_: Arc<EventLoop>,
    name: String,
    state: AtomicU8,
    reading: AtomicBool,
    socket: Socket,
    channel: Arc<Channel>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    high_water_mark: AtomicUsize,
    input_buffer: Mutex<Buffer>,
    output_buffer: Mutex<Buffer>,
    connection_callback: Mutex<Option<ConnectionCallback>>,
    message_callback: Mutex<Option<MessageCallback>>,
    write_complete_callback: Mutex<Option<WriteCompleteCallback>>,
    high_water_mark_callback: Mutex<Option<HighWaterMarkCallback>>,
    close_callback: Mutex<Option<CloseCallback>>,
    context: Mutex<Option<Box<dyn Any + Send>>>,
}

impl TcpConnection {
    /// Wraps an established socket. Keepalive is enabled by default; the
    /// channel stays idle until [`TcpConnection::connect_established`].
    pub fn new(
        loop_: &Arc<EventLoop>,
        name: String,
        socket: Socket,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> TcpConnectionPtr {
        log::debug!("TcpConnection::new [{}] fd = {}", name, socket.fd());
        socket.set_keep_alive(true);
        let channel = Channel::new(Arc::downgrade(loop_), socket.fd());
        Arc::new_cyclic(|self_weak| Self {
            self_weak: self_weak.clone(),
            loop_: loop_.clone(),
            name,
            state: AtomicU8::new(State::Connecting as u8),
            reading: AtomicBool::new(true),
            socket,
            channel,
            local_addr,
            peer_addr,
            high_water_mark: AtomicUsize::new(DEFAULT_HIGH_WATER_MARK),
            input_buffer: Mutex::new(Buffer::new()),
            output_buffer: Mutex::new(Buffer::new()),
            connection_callback: Mutex::new(None),
            message_callback: Mutex::new(None),
            write_complete_callback: Mutex::new(None),
            high_water_mark_callback: Mutex::new(None),
            close_callback: Mutex::new(None),
            context: Mutex::new(None),
        })
    }

    /// The connection's unique name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The loop this connection lives on.
    pub fn owner_loop(&self) -> &Arc<EventLoop> {
        &self.loop_
    }

    /// Local endpoint.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Peer endpoint.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Current lifecycle state.
    pub fn state(&self) -> State {
        state_from(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Whether the connection is in the CONNECTED state.
    pub fn connected(&self) -> bool {
        self.state() == State::Connected
    }

    /// Whether the connection reached its terminal state.
    pub fn disconnected(&self) -> bool {
        self.state() == State::Disconnected
    }

    /// Toggles Nagle's algorithm on the underlying socket.
    pub fn set_tcp_no_delay(&self, on: bool) {
        self.socket.set_tcp_no_delay(on);
    }

    /// Installs the up/down callback.
    pub fn set_connection_callback(&self, callback: ConnectionCallback) {
        *self.connection_callback.lock().unwrap() = Some(callback);
    }

    /// Installs the inbound-data callback.
    pub fn set_message_callback(&self, callback: MessageCallback) {
        *self.message_callback.lock().unwrap() = Some(callback);
    }

    /// Installs the output-drained callback.
    pub fn set_write_complete_callback(&self, callback: WriteCompleteCallback) {
        *self.write_complete_callback.lock().unwrap() = Some(callback);
    }

    /// Installs the backpressure callback, fired when the output buffer
    /// crosses `mark` bytes from below.
    pub fn set_high_water_mark_callback(&self, callback: HighWaterMarkCallback, mark: usize) {
        self.high_water_mark.store(mark, Ordering::SeqCst);
        *self.high_water_mark_callback.lock().unwrap() = Some(callback);
    }

    /// Installs the close-routing callback.
    pub fn set_close_callback(&self, callback: CloseCallback) {
        *self.close_callback.lock().unwrap() = Some(callback);
    }

    /// Attaches caller-owned state (a codec, a session) to this
    /// connection.
    pub fn set_context(&self, context: Box<dyn Any + Send>) {
        *self.context.lock().unwrap() = Some(context);
    }

    /// Runs `f` on the attached context when one of type `T` is present.
    pub fn with_context_mut<T: 'static, R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut context = self.context.lock().unwrap();
        context.as_mut()?.downcast_mut::<T>().map(f)
    }

    /// Bytes currently queued for write.
    pub fn output_bytes(&self) -> usize {
        self.output_buffer.lock().unwrap().readable_bytes()
    }

    /// A strong handle to this connection. Valid whenever a method runs,
    /// since the caller necessarily holds one.
    fn self_ptr(&self) -> TcpConnectionPtr {
        self.self_weak.upgrade().expect("connection is alive")
    }

    /// Sends bytes. Only valid in CONNECTED; otherwise the data is
    /// dropped. Off-loop callers pay one copy for the hop.
    pub fn send(&self, data: &[u8]) {
        if self.state() != State::Connected {
            return;
        }
        if self.loop_.is_in_loop_thread() {
            self.send_in_loop(data);
        } else {
            let this = self.self_ptr();
            let message = data.to_vec();
            self.loop_.run_in_loop(move || this.send_in_loop(&message));
        }
    }

    /// Sends and drains a buffer. The buffer contents move with the hop;
    /// no extra copy beyond the retrieve.
    pub fn send_buffer(&self, buffer: &mut Buffer) {
        if self.state() != State::Connected {
            return;
        }
        if self.loop_.is_in_loop_thread() {
            self.send_in_loop(buffer.peek());
            buffer.retrieve_all();
        } else {
            let this = self.self_ptr();
            let message = buffer.retrieve_all_as_bytes();
            self.loop_.run_in_loop(move || this.send_in_loop(&message));
        }
    }

    /// Loop-side send: writes directly when the channel is idle and the
    /// output buffer empty; anything the kernel does not take is buffered
    /// and write interest enabled. EPIPE/ECONNRESET mark a fault and stop
    /// queueing.
    fn send_in_loop(&self, data: &[u8]) {
        self.loop_.assert_in_loop_thread();
        let mut nwrote = 0usize;
        let mut remaining = data.len();
        let mut fault = false;

        if self.state() == State::Disconnected {
            log::warn!("TcpConnection::send_in_loop [{}] disconnected, give up writing", self.name);
            return;
        }

        if !self.channel.is_writing() && self.output_buffer.lock().unwrap().readable_bytes() == 0 {
            match self.socket.write(data) {
                Ok(n) => {
                    nwrote = n;
                    remaining = data.len() - n;
                    if remaining == 0 {
                        self.queue_write_complete();
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    log::error!("TcpConnection::send_in_loop [{}]: {}", self.name, e);
                    if matches!(e.raw_os_error(), Some(libc::EPIPE) | Some(libc::ECONNRESET)) {
                        fault = true;
                    }
                }
            }
        }

        debug_assert!(remaining <= data.len());
        if !fault && remaining > 0 {
            let mut output = self.output_buffer.lock().unwrap();
            let old_len = output.readable_bytes();
            let mark = self.high_water_mark.load(Ordering::SeqCst);
            if old_len + remaining >= mark && old_len < mark {
                if let Some(callback) = self.high_water_mark_callback.lock().unwrap().clone() {
                    let this = self.self_ptr();
                    let queued = old_len + remaining;
                    self.loop_.queue_in_loop(move || callback(&this, queued));
                }
            }
            output.append(&data[nwrote..]);
            drop(output);
            if !self.channel.is_writing() {
                self.channel.enable_writing();
            }
        }
    }

    /// Half-closes the write side once pending output drains. Valid only
    /// in CONNECTED.
    pub fn shutdown(&self) {
        if self.state() == State::Connected {
            self.set_state(State::Disconnecting);
            let this = self.self_ptr();
            self.loop_.run_in_loop(move || this.shutdown_in_loop());
        }
    }

    fn shutdown_in_loop(&self) {
        self.loop_.assert_in_loop_thread();
        if !self.channel.is_writing() {
            // Nothing queued; the writable handler re-issues this once the
            // output buffer empties otherwise.
            self.socket.shutdown_write();
        }
    }

    /// Tears the connection down without waiting for output to drain.
    pub fn force_close(&self) {
        if matches!(self.state(), State::Connected | State::Disconnecting) {
            self.set_state(State::Disconnecting);
            let this = self.self_ptr();
            self.loop_.queue_in_loop(move || this.force_close_in_loop());
        }
    }

    fn force_close_in_loop(&self) {
        self.loop_.assert_in_loop_thread();
        if matches!(self.state(), State::Connected | State::Disconnecting) {
            self.on_close();
        }
    }

    /// Resumes reading after [`TcpConnection::stop_read`].
    pub fn start_read(&self) {
        let this = self.self_ptr();
        self.loop_.run_in_loop(move || {
            if !this.reading.load(Ordering::SeqCst) || !this.channel.is_reading() {
                this.channel.enable_reading();
                this.reading.store(true, Ordering::SeqCst);
            }
        });
    }

    /// Stops reading; inbound bytes stay in the kernel until resumed.
    pub fn stop_read(&self) {
        let this = self.self_ptr();
        self.loop_.run_in_loop(move || {
            if this.reading.load(Ordering::SeqCst) || this.channel.is_reading() {
                this.channel.disable_reading();
                this.reading.store(false, Ordering::SeqCst);
            }
        });
    }

    /// Whether reading is enabled.
    pub fn is_reading(&self) -> bool {
        self.reading.load(Ordering::SeqCst)
    }

    /// CONNECTING → CONNECTED on the owner loop: tie the channel, enable
    /// reading, fire the connection callback. Called exactly once.
    pub fn connect_established(&self) {
        self.loop_.assert_in_loop_thread();
        assert_eq!(State::Connecting, self.state());
        self.set_state(State::Connected);
        let me = self.self_ptr();
        self.channel.tie(&me);
        self.channel.enable_reading();

        if let Some(callback) = self.connection_callback.lock().unwrap().clone() {
            callback(&me);
        }
    }

    /// Final lifecycle hook, run on the owner loop before the last owner
    /// releases the connection. Idempotent after a close.
    pub fn connect_destroyed(&self) {
        self.loop_.assert_in_loop_thread();
        if self.state() == State::Connected {
            self.set_state(State::Disconnected);
            self.channel.disable_all();
            if let Some(callback) = self.connection_callback.lock().unwrap().clone() {
                callback(&self.self_ptr());
            }
        }
        self.channel.remove();
    }

    fn queue_write_complete(&self) {
        if let Some(callback) = self.write_complete_callback.lock().unwrap().clone() {
            let this = self.self_ptr();
            self.loop_.queue_in_loop(move || callback(&this));
        }
    }

    /// Reads until the kernel runs dry (the poller is edge-triggered), and
    /// feeds each chunk to the message callback. Zero means the peer
    /// closed.
    fn on_read(&self, at: Instant) {
        self.loop_.assert_in_loop_thread();
        loop {
            let result = {
                let mut input = self.input_buffer.lock().unwrap();
                input.read_from_fd(self.channel.fd())
            };
            match result {
                Ok(0) => {
                    self.on_close();
                    return;
                }
                Ok(_) => {
                    let callback = self.message_callback.lock().unwrap().clone();
                    let mut input = self.input_buffer.lock().unwrap();
                    match callback {
                        Some(callback) => callback(&self.self_ptr(), &mut input, at),
                        None => input.retrieve_all(),
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::error!("TcpConnection::handle_read [{}]: {}", self.name, e);
                    self.on_error();
                    return;
                }
            }
            if self.state() == State::Disconnected {
                return;
            }
        }
    }

    /// Writes from the output buffer. On drain: disable write interest,
    /// post the write-complete callback, and finish a pending shutdown.
    fn on_write(&self) {
        self.loop_.assert_in_loop_thread();
        if !self.channel.is_writing() {
            log::trace!("connection fd = {} is down, no more writing", self.channel.fd());
            return;
        }
        let mut output = self.output_buffer.lock().unwrap();
        match self.socket.write(output.peek()) {
            Ok(n) => {
                output.retrieve(n);
                if output.readable_bytes() == 0 {
                    drop(output);
                    self.channel.disable_writing();
                    self.queue_write_complete();
                    if self.state() == State::Disconnecting {
                        self.shutdown_in_loop();
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => log::error!("TcpConnection::handle_write [{}]: {}", self.name, e),
        }
    }

    fn on_close(&self) {
        self.loop_.assert_in_loop_thread();
        log::trace!("fd = {} state = {:?}", self.channel.fd(), self.state());
        assert!(matches!(self.state(), State::Connected | State::Disconnecting));
        self.set_state(State::Disconnected);
        self.channel.disable_all();

        // Keep a strong reference across both callbacks: the user may drop
        // every other owner inside them.
        let guard = self.self_ptr();
        if let Some(callback) = self.connection_callback.lock().unwrap().clone() {
            callback(&guard);
        }
        if let Some(callback) = self.close_callback.lock().unwrap().clone() {
            callback(&guard);
        }
    }

    fn on_error(&self) {
        let error = match self.socket.take_error() {
            Ok(Some(e)) => e,
            Ok(None) => io::Error::from_raw_os_error(0),
            Err(e) => e,
        };
        log::error!(
            "TcpConnection::handle_error [{}] - SO_ERROR = {}",
            self.name,
            error
        );
    }
}

impl EventHandler for TcpConnection {
    fn handle_read(self: Arc<Self>, at: Instant) {
        self.on_read(at);
    }

    fn handle_write(self: Arc<Self>) {
        self.on_write();
    }

    fn handle_close(self: Arc<Self>) {
        self.on_close();
    }

    fn handle_error(self: Arc<Self>) {
        self.on_error();
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        log::debug!(
            "TcpConnection::drop [{}] fd = {} state = {:?}",
            self.name,
            self.socket.fd(),
            self.state()
        );
    }
}

impl std::fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConnection")
            .field("name", &self.name)
            .field("fd", &self.socket.fd())
            .field("state", &self.state())
            .field("local_addr", &self.local_addr)
            .field("peer_addr", &self.peer_addr)
            .finish()
    }
}
