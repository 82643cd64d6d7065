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

//! Per-descriptor readiness record and event dispatcher
//!
//! A [`Channel`] couples a file descriptor with its interest mask, the
//! readiness the poller last observed, and a weak reference to the object
//! that handles its events. It never owns the descriptor.

use std::fmt;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicI8, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use crate::event_loop::EventLoop;
use crate::poller;

/// Readiness and interest bits, phrased in POSIX poll terms.
pub mod ready {
    /// No readiness.
    pub const NONE: u32 = 0;
    /// Data can be read (POLLIN).
    pub const READABLE: u32 = 0x01;
    /// Priority data can be read (POLLPRI).
    pub const PRIORITY: u32 = 0x02;
    /// Writing will not block (POLLOUT).
    pub const WRITABLE: u32 = 0x04;
    /// Error condition (POLLERR).
    pub const ERROR: u32 = 0x08;
    /// Peer shut down its write side (POLLRDHUP).
    pub const READ_CLOSED: u32 = 0x10;
    /// Hangup: both directions are gone (POLLHUP).
    pub const HUP: u32 = 0x20;
    /// Invalid descriptor (POLLNVAL). Kept so the dispatch contract covers
    /// full poll semantics; the epoll backend never sets it — a stale
    /// descriptor is rejected with EBADF at `epoll_ctl` time instead of
    /// being reported as readiness.
    pub const NVAL: u32 = 0x40;
}

/// The typed event callbacks of a [`Channel`], dispatched while an upgraded
/// strong reference to the handler is held (the channel's tie).
///
/// Every method has an empty default so handlers implement only the events
/// they subscribe to.
pub trait EventHandler: Send + Sync {
    /// The descriptor is readable; `at` is the poll return time.
    fn handle_read(self: Arc<Self>, at: Instant) {
        let _ = at;
    }

    /// The descriptor is writable.
    fn handle_write(self: Arc<Self>) {}

    /// The peer hung up and nothing is left to read.
    fn handle_close(self: Arc<Self>) {}

    /// The descriptor is in an error state.
    fn handle_error(self: Arc<Self>) {}
}

/// Sentinel token for a channel that is not in any poller table.
pub(crate) const NO_TOKEN: usize = usize::MAX;

/// Interest/readiness record for one descriptor, owned by whoever owns the
/// descriptor and shared with the owner loop's poller while registered.
///
/// All mutation happens on the owner loop's thread; the fields are atomics
/// only so the record can be handed across threads inside its owner.
pub struct Channel {
    self_weak: Weak<Channel>,
    loop_: Weak<EventLoop>,
    fd: RawFd,
    events: AtomicU32,
    revents: AtomicU32,
    index: AtomicI8,
    token: AtomicUsize,
    handler: Mutex<Option<Weak<dyn EventHandler>>>,
}

impl Channel {
    /// Creates an idle channel for `fd` on the given loop. The channel is
    /// registered with the poller on first interest enable.
    pub fn new(loop_: Weak<EventLoop>, fd: RawFd) -> Arc<Self> {
        Arc::new_cyclic(|self_weak| Self {
            self_weak: self_weak.clone(),
            loop_,
            fd,
            events: AtomicU32::new(ready::NONE),
            revents: AtomicU32::new(ready::NONE),
            index: AtomicI8::new(poller::INDEX_NEW),
            token: AtomicUsize::new(NO_TOKEN),
            handler: Mutex::new(None),
        })
    }

    /// The descriptor this channel watches.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// The current interest mask.
    pub fn events(&self) -> u32 {
        self.events.load(Ordering::SeqCst)
    }

    /// The readiness the poller last observed.
    pub fn revents(&self) -> u32 {
        self.revents.load(Ordering::SeqCst)
    }

    pub(crate) fn set_revents(&self, revents: u32) {
        self.revents.store(revents, Ordering::SeqCst);
    }

    pub(crate) fn index(&self) -> i8 {
        self.index.load(Ordering::SeqCst)
    }

    pub(crate) fn set_index(&self, index: i8) {
        self.index.store(index, Ordering::SeqCst);
    }

    pub(crate) fn token(&self) -> usize {
        self.token.load(Ordering::SeqCst)
    }

    pub(crate) fn set_token(&self, token: usize) {
        self.token.store(token, Ordering::SeqCst);
    }

    /// Whether the interest mask is empty.
    pub fn is_none_event(&self) -> bool {
        self.events() == ready::NONE
    }

    /// Whether read interest is enabled.
    pub fn is_reading(&self) -> bool {
        self.events() & ready::READABLE != 0
    }

    /// Whether write interest is enabled.
    pub fn is_writing(&self) -> bool {
        self.events() & ready::WRITABLE != 0
    }

    /// Ties this channel to its event handler. The weak reference is
    /// upgraded for the duration of each dispatch, keeping the handler
    /// alive even if every other owner releases it inside a callback.
    pub fn tie<H: EventHandler + 'static>(&self, handler: &Arc<H>) {
        let handler: Arc<dyn EventHandler> = handler.clone();
        let weak: Weak<dyn EventHandler> = Arc::downgrade(&handler);
        *self.handler.lock().unwrap() = Some(weak);
    }

    /// Subscribes to read readiness.
    pub fn enable_reading(&self) {
        self.events.fetch_or(ready::READABLE, Ordering::SeqCst);
        self.update();
    }

    /// Unsubscribes from read readiness.
    pub fn disable_reading(&self) {
        self.events.fetch_and(!ready::READABLE, Ordering::SeqCst);
        self.update();
    }

    /// Subscribes to write readiness.
    pub fn enable_writing(&self) {
        self.events.fetch_or(ready::WRITABLE, Ordering::SeqCst);
        self.update();
    }

    /// Unsubscribes from write readiness.
    pub fn disable_writing(&self) {
        self.events.fetch_and(!ready::WRITABLE, Ordering::SeqCst);
        self.update();
    }

    /// Clears the interest mask, unregistering from the kernel.
    pub fn disable_all(&self) {
        self.events.store(ready::NONE, Ordering::SeqCst);
        self.update();
    }

    /// Drops this channel from the owner loop's poller table. Interest must
    /// already be empty.
    pub fn remove(&self) {
        let (Some(loop_), Some(me)) = (self.loop_.upgrade(), self.self_weak.upgrade()) else {
            return;
        };
        loop_.remove_channel(&me);
    }

    fn update(&self) {
        let (Some(loop_), Some(me)) = (self.loop_.upgrade(), self.self_weak.upgrade()) else {
            return;
        };
        loop_.update_channel(&me);
    }

    /// Dispatches the last observed readiness to the tied handler, in POSIX
    /// poll order: hangup-without-input first, then the invalid-descriptor
    /// warning, error, read, write. If the tie cannot be upgraded the event
    /// is dropped.
    pub fn handle_event(&self, at: Instant) {
        let handler = self
            .handler
            .lock()
            .unwrap()
            .as_ref()
            .and_then(Weak::upgrade);
        let Some(handler) = handler else {
            log::trace!("channel fd = {} event with no live handler", self.fd);
            return;
        };

        let revents = self.revents();
        log::trace!("channel fd = {} revents = {:#x}", self.fd, revents);

        if revents & ready::HUP != 0 && revents & ready::READABLE == 0 {
            handler.clone().handle_close();
        }
        if revents & ready::NVAL != 0 {
            log::warn!("channel fd = {} POLLNVAL", self.fd);
        }
        if revents & (ready::ERROR | ready::NVAL) != 0 {
            handler.clone().handle_error();
        }
        if revents & (ready::READABLE | ready::PRIORITY | ready::READ_CLOSED) != 0 {
            handler.clone().handle_read(at);
        }
        if revents & ready::WRITABLE != 0 {
            handler.handle_write();
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("fd", &self.fd)
            .field("events", &self.events())
            .field("revents", &self.revents())
            .field("index", &self.index())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::{ready, Channel, EventHandler};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Weak};
    use std::time::Instant;

    struct Counter {
        reads: AtomicUsize,
        writes: AtomicUsize,
        closes: AtomicUsize,
        errors: AtomicUsize,
    }

    impl Counter {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                reads: AtomicUsize::new(0),
                writes: AtomicUsize::new(0),
                closes: AtomicUsize::new(0),
                errors: AtomicUsize::new(0),
            })
        }
    }

    impl EventHandler for Counter {
        fn handle_read(self: Arc<Self>, _at: Instant) {
            self.reads.fetch_add(1, Ordering::SeqCst);
        }
        fn handle_write(self: Arc<Self>) {
            self.writes.fetch_add(1, Ordering::SeqCst);
        }
        fn handle_close(self: Arc<Self>) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
        fn handle_error(self: Arc<Self>) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn channel_with(revents: u32) -> (Arc<Channel>, Arc<Counter>) {
        let channel = Channel::new(Weak::new(), 0);
        let counter = Counter::new();
        channel.tie(&counter);
        channel.set_revents(revents);
        (channel, counter)
    }

    #[test]
    fn readable_dispatches_read_only() {
        let (channel, counter) = channel_with(ready::READABLE);
        channel.handle_event(Instant::now());
        assert_eq!(1, counter.reads.load(Ordering::SeqCst));
        assert_eq!(0, counter.writes.load(Ordering::SeqCst));
        assert_eq!(0, counter.closes.load(Ordering::SeqCst));
    }

    #[test]
    fn hangup_without_input_dispatches_close() {
        let (channel, counter) = channel_with(ready::HUP);
        channel.handle_event(Instant::now());
        assert_eq!(1, counter.closes.load(Ordering::SeqCst));
        assert_eq!(0, counter.reads.load(Ordering::SeqCst));
    }

    #[test]
    fn hangup_with_input_reads_instead_of_closing() {
        let (channel, counter) = channel_with(ready::HUP | ready::READABLE);
        channel.handle_event(Instant::now());
        assert_eq!(0, counter.closes.load(Ordering::SeqCst));
        assert_eq!(1, counter.reads.load(Ordering::SeqCst));
    }

    #[test]
    fn read_closed_counts_as_readable() {
        let (channel, counter) = channel_with(ready::READ_CLOSED);
        channel.handle_event(Instant::now());
        assert_eq!(1, counter.reads.load(Ordering::SeqCst));
    }

    #[test]
    fn error_and_write_dispatch_in_order() {
        let (channel, counter) = channel_with(ready::ERROR | ready::WRITABLE);
        channel.handle_event(Instant::now());
        assert_eq!(1, counter.errors.load(Ordering::SeqCst));
        assert_eq!(1, counter.writes.load(Ordering::SeqCst));
    }

    #[test]
    fn invalid_descriptor_dispatches_error() {
        let (channel, counter) = channel_with(ready::NVAL);
        channel.handle_event(Instant::now());
        assert_eq!(1, counter.errors.load(Ordering::SeqCst));
        assert_eq!(0, counter.reads.load(Ordering::SeqCst));
        assert_eq!(0, counter.closes.load(Ordering::SeqCst));
    }

    #[test]
    fn error_and_invalid_together_dispatch_error_once() {
        let (channel, counter) = channel_with(ready::ERROR | ready::NVAL);
        channel.handle_event(Instant::now());
        assert_eq!(1, counter.errors.load(Ordering::SeqCst));
    }

    #[test]
    fn dropped_handler_drops_the_event() {
        let channel = Channel::new(Weak::new(), 0);
        {
            let counter = Counter::new();
            channel.tie(&counter);
        }
        channel.set_revents(ready::READABLE);
        // Handler is gone; dispatch must be a no-op rather than a panic.
        channel.handle_event(Instant::now());
    }

    #[test]
    fn interest_mask_tracks_enables_and_disables() {
        let channel = Channel::new(Weak::new(), 0);
        assert!(channel.is_none_event());
        channel.enable_reading();
        channel.enable_writing();
        assert!(channel.is_reading());
        assert!(channel.is_writing());
        channel.disable_writing();
        assert!(!channel.is_writing());
        channel.disable_all();
        assert!(channel.is_none_event());
    }
}
