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

//! Outbound-connection state machine with exponential backoff
//!
//! A nonblocking connect either completes, goes in-flight (write
//! readiness reports the outcome), or fails with a transient errno that
//! schedules a retry. The retry delay starts at 500 ms and doubles up to
//! 30 s.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::channel::{Channel, EventHandler};
use crate::event_loop::EventLoop;
use crate::socket::Socket;

const INIT_RETRY_DELAY_MS: u64 = 500;
const MAX_RETRY_DELAY_MS: u64 = 30_000;

/// Callback invoked with the connected socket.
pub type NewConnectionCallback = Box<dyn FnMut(Socket) + Send>;

/// Connector lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    /// No attempt in flight.
    Disconnected = 0,
    /// Nonblocking connect issued; awaiting write readiness.
    Connecting = 1,
    /// Connect completed and the socket was handed off.
    Connected = 2,
}

fn state_from(value: u8) -> State {
    match value {
        1 => State::Connecting,
        2 => State::Connected,
        _ => State::Disconnected,
    }
}

/// Drives connection establishment toward one server address.
pub struct Connector {
    self_weak: Weak<Connector>,
    loop_: Arc<EventLoop>,
    server_addr: SocketAddr,
    connect: AtomicBool,
    state: AtomicU8,
    retry_delay_ms: AtomicU64,
    /// The in-flight attempt: its channel and the socket it watches.
    in_flight: Mutex<Option<(Arc<Channel>, Socket)>>,
    new_connection_callback: Mutex<Option<NewConnectionCallback>>,
}

impl Connector {
    /// Creates an idle connector for `server_addr`.
    pub fn new(loop_: &Arc<EventLoop>, server_addr: SocketAddr) -> Arc<Self> {
        Arc::new_cyclic(|self_weak| Self {
            self_weak: self_weak.clone(),
            loop_: loop_.clone(),
            server_addr,
            connect: AtomicBool::new(false),
            state: AtomicU8::new(State::Disconnected as u8),
            retry_delay_ms: AtomicU64::new(INIT_RETRY_DELAY_MS),
            in_flight: Mutex::new(None),
            new_connection_callback: Mutex::new(None),
        })
    }

    /// The target address.
    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    /// Installs the connected-socket callback.
    pub fn set_new_connection_callback(&self, callback: NewConnectionCallback) {
        *self.new_connection_callback.lock().unwrap() = Some(callback);
    }

    /// Current state.
    pub fn state(&self) -> State {
        state_from(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// A strong handle to this connector; valid while any owner holds one.
    fn self_ptr(&self) -> Arc<Connector> {
        self.self_weak.upgrade().expect("connector is alive")
    }

    /// Begins connecting. Callable from any thread.
    pub fn start(&self) {
        self.connect.store(true, Ordering::SeqCst);
        let this = self.self_ptr();
        self.loop_.run_in_loop(move || this.start_in_loop());
    }

    /// Abandons the current attempt and stops retrying. Callable from any
    /// thread.
    pub fn stop(&self) {
        self.connect.store(false, Ordering::SeqCst);
        let this = self.self_ptr();
        self.loop_.queue_in_loop(move || this.stop_in_loop());
    }

    /// Resets the backoff and starts over. Loop thread only.
    pub fn restart(&self) {
        self.loop_.assert_in_loop_thread();
        self.set_state(State::Disconnected);
        self.retry_delay_ms
            .store(INIT_RETRY_DELAY_MS, Ordering::SeqCst);
        self.connect.store(true, Ordering::SeqCst);
        self.start_in_loop();
    }

    fn start_in_loop(&self) {
        self.loop_.assert_in_loop_thread();
        debug_assert_eq!(State::Disconnected, self.state());
        if self.connect.load(Ordering::SeqCst) {
            self.do_connect();
        } else {
            log::debug!("Connector to {} told not to connect", self.server_addr);
        }
    }

    fn stop_in_loop(&self) {
        self.loop_.assert_in_loop_thread();
        if self.state() == State::Connecting {
            self.set_state(State::Disconnected);
            if let Some(socket) = self.remove_and_reset_channel() {
                self.retry(socket);
            }
        }
    }

    /// Issues the nonblocking connect and classifies errno.
    fn do_connect(&self) {
        let socket = match Socket::new_nonblocking(&self.server_addr) {
            Ok(socket) => socket,
            Err(e) => {
                log::error!("Connector::connect socket creation failed: {}", e);
                return;
            }
        };
        let errno = match socket.connect(&self.server_addr) {
            Ok(()) => 0,
            Err(e) => e.raw_os_error().unwrap_or(-1),
        };
        match errno {
            0 | libc::EINPROGRESS | libc::EINTR | libc::EISCONN => self.connecting(socket),

            libc::EAGAIN
            | libc::EADDRINUSE
            | libc::EADDRNOTAVAIL
            | libc::ECONNREFUSED
            | libc::ENETUNREACH => self.retry(socket),

            _ => {
                log::error!(
                    "Connector::connect to {} unexpected errno {}: {}",
                    self.server_addr,
                    errno,
                    io::Error::from_raw_os_error(errno.max(0))
                );
                // Dropping the socket closes it; no retry for these.
            }
        }
    }

    /// Parks the in-flight socket behind a channel subscribed to write and
    /// error readiness.
    fn connecting(&self, socket: Socket) {
        self.set_state(State::Connecting);
        let channel = Channel::new(Arc::downgrade(&self.loop_), socket.fd());
        channel.tie(&self.self_ptr());
        {
            let mut in_flight = self.in_flight.lock().unwrap();
            debug_assert!(in_flight.is_none());
            *in_flight = Some((channel.clone(), socket));
        }
        // Write interest also reports connect errors.
        channel.enable_writing();
    }

    /// Detaches the in-flight channel from the poller and returns the
    /// socket. The channel itself is parked until the next task round: it
    /// must not be dropped inside its own event dispatch.
    fn remove_and_reset_channel(&self) -> Option<Socket> {
        let (channel, socket) = self.in_flight.lock().unwrap().take()?;
        channel.disable_all();
        channel.remove();
        self.loop_.queue_in_loop(move || drop(channel));
        Some(socket)
    }

    /// Closes the failed socket and schedules the next attempt with the
    /// doubled delay.
    fn retry(&self, socket: Socket) {
        drop(socket);
        self.set_state(State::Disconnected);
        if self.connect.load(Ordering::SeqCst) {
            let delay = self.retry_delay_ms.load(Ordering::SeqCst);
            log::info!(
                "Connector::retry - retry connecting to {} in {} ms",
                self.server_addr,
                delay
            );
            let this = self.self_ptr();
            self.loop_
                .run_after(Duration::from_millis(delay), move || this.start_in_loop());
            self.retry_delay_ms
                .store((delay * 2).min(MAX_RETRY_DELAY_MS), Ordering::SeqCst);
        } else {
            log::debug!("Connector to {} told not to connect", self.server_addr);
        }
    }
}

impl EventHandler for Connector {
    /// Write readiness on a connecting socket reports the outcome: check
    /// SO_ERROR, reject self-connects, and hand a clean socket to the
    /// callback.
    fn handle_write(self: Arc<Self>) {
        log::trace!("Connector::handle_write state = {:?}", self.state());
        if self.state() != State::Connecting {
            debug_assert_eq!(State::Disconnected, self.state());
            return;
        }
        let Some(socket) = self.remove_and_reset_channel() else {
            return;
        };

        let so_error = self.take_socket_error(&socket);
        if let Some(e) = so_error {
            log::warn!("Connector::handle_write - SO_ERROR = {}", e);
            self.retry(socket);
        } else if socket.is_self_connect() {
            log::warn!("Connector::handle_write - self connect");
            self.retry(socket);
        } else {
            self.set_state(State::Connected);
            if self.connect.load(Ordering::SeqCst) {
                let mut callback = self.new_connection_callback.lock().unwrap();
                match callback.as_mut() {
                    Some(callback) => callback(socket),
                    None => drop(socket),
                }
            }
        }
    }

    fn handle_error(self: Arc<Self>) {
        log::error!("Connector::handle_error state = {:?}", self.state());
        if self.state() == State::Connecting {
            if let Some(socket) = self.remove_and_reset_channel() {
                if let Some(e) = self.take_socket_error(&socket) {
                    log::trace!("SO_ERROR = {}", e);
                }
                self.retry(socket);
            }
        }
    }
}

impl Connector {
    fn take_socket_error(&self, socket: &Socket) -> Option<io::Error> {
        match socket.take_error() {
            Ok(error) => error,
            Err(e) => Some(e),
        }
    }
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("server_addr", &self.server_addr)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::{Connector, State, INIT_RETRY_DELAY_MS};
    use crate::event_loop::EventLoop;
    use std::sync::atomic::Ordering;

    #[test]
    fn new_connector_is_disconnected_with_initial_delay() {
        let loop_ = EventLoop::new().expect("event loop");
        let connector = Connector::new(&loop_, "127.0.0.1:1".parse().expect("addr"));
        assert_eq!(State::Disconnected, connector.state());
        assert_eq!(
            INIT_RETRY_DELAY_MS,
            connector.retry_delay_ms.load(Ordering::SeqCst)
        );
    }

    #[test]
    fn retry_doubles_the_delay_up_to_the_cap() {
        let loop_ = EventLoop::new().expect("event loop");
        let addr = "127.0.0.1:1".parse().expect("addr");
        let connector = Connector::new(&loop_, addr);
        connector.connect.store(true, Ordering::SeqCst);

        let mut observed = vec![];
        for _ in 0..8 {
            observed.push(connector.retry_delay_ms.load(Ordering::SeqCst));
            let socket = crate::socket::Socket::new_nonblocking(&addr).expect("socket");
            connector.retry(socket);
        }
        assert_eq!(
            vec![500, 1000, 2000, 4000, 8000, 16000, 30000, 30000],
            observed
        );
    }
}
