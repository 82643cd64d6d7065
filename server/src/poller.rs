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

//! Readiness multiplexer
//!
//! Wraps one `mio::Poll` (epoll on Linux, edge-triggered) and maps poll
//! tokens back to [`Channel`]s through a slab. Raw descriptors of any kind
//! — sockets, eventfd, timerfd — register through `SourceFd`, so every
//! channel takes the same path into the kernel.

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use slab::Slab;

use crate::channel::{ready, Channel, NO_TOKEN};

/// Channel is not known to the poller.
pub(crate) const INDEX_NEW: i8 = -1;
/// Channel is in the table and registered with the kernel.
pub(crate) const INDEX_ADDED: i8 = 1;
/// Channel is in the table but unregistered (empty interest).
pub(crate) const INDEX_DELETED: i8 = 2;

const INIT_EVENT_LIST_SIZE: usize = 16;

/// The per-loop readiness multiplexer. Owned by an event loop and only
/// touched from that loop's thread.
#[derive(Debug)]
pub(crate) struct Poller {
    poll: Poll,
    events: Events,
    events_capacity: usize,
    channels: Slab<Arc<Channel>>,
}

impl Poller {
    pub(crate) fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(INIT_EVENT_LIST_SIZE),
            events_capacity: INIT_EVENT_LIST_SIZE,
            channels: Slab::new(),
        })
    }

    /// Waits up to `timeout` for readiness. Every returned channel has its
    /// readiness mask stored before this returns. The events list capacity
    /// doubles whenever a poll fills it.
    pub(crate) fn poll(&mut self, timeout: Duration) -> (Instant, Vec<Arc<Channel>>) {
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => log::error!("Poller::poll: {}", e),
        }
        let now = Instant::now();

        let mut active = Vec::new();
        let mut num_events = 0;
        for event in self.events.iter() {
            num_events += 1;
            let Token(key) = event.token();
            if let Some(channel) = self.channels.get(key) {
                channel.set_revents(ready_bits(event));
                active.push(channel.clone());
            }
        }
        log::trace!(
            "{} events happened, fd total count {}",
            num_events,
            self.channels.len()
        );

        if num_events == self.events_capacity {
            self.events_capacity *= 2;
            self.events = Events::with_capacity(self.events_capacity);
        }
        (now, active)
    }

    /// Applies the channel's interest to the kernel, walking the
    /// NEW/ADDED/DELETED index protocol. The table entry survives interest
    /// removal; only [`Poller::remove_channel`] forgets the channel.
    pub(crate) fn update_channel(&mut self, channel: &Arc<Channel>) {
        let index = channel.index();
        log::trace!(
            "fd = {} events = {:#x} index = {}",
            channel.fd(),
            channel.events(),
            index
        );

        if channel.is_none_event() {
            if index == INDEX_ADDED {
                self.deregister(channel);
                channel.set_index(INDEX_DELETED);
            }
            return;
        }

        match index {
            INDEX_NEW => {
                let token = self.channels.insert(channel.clone());
                channel.set_token(token);
                channel.set_index(INDEX_ADDED);
                self.register(channel);
            }
            INDEX_DELETED => {
                debug_assert!(self.has_channel(channel));
                channel.set_index(INDEX_ADDED);
                self.register(channel);
            }
            _ => {
                debug_assert_eq!(INDEX_ADDED, index);
                self.reregister(channel);
            }
        }
    }

    /// Forgets the channel. Interest must already be empty.
    pub(crate) fn remove_channel(&mut self, channel: &Arc<Channel>) {
        let token = channel.token();
        if token == NO_TOKEN || !self.has_channel(channel) {
            return;
        }
        log::trace!("remove channel fd = {}", channel.fd());
        assert!(channel.is_none_event());

        if channel.index() == INDEX_ADDED {
            self.deregister(channel);
        }
        self.channels.remove(token);
        channel.set_index(INDEX_NEW);
        channel.set_token(NO_TOKEN);
    }

    pub(crate) fn has_channel(&self, channel: &Arc<Channel>) -> bool {
        self.channels
            .get(channel.token())
            .map_or(false, |c| Arc::ptr_eq(c, channel))
    }

    fn register(&self, channel: &Arc<Channel>) {
        let fd = channel.fd();
        if let Err(e) =
            self.poll
                .registry()
                .register(&mut SourceFd(&fd), Token(channel.token()), interest(channel))
        {
            fatal!("Poller::register fd = {}: {}", fd, e);
        }
    }

    fn reregister(&self, channel: &Arc<Channel>) {
        let fd = channel.fd();
        if let Err(e) = self.poll.registry().reregister(
            &mut SourceFd(&fd),
            Token(channel.token()),
            interest(channel),
        ) {
            fatal!("Poller::reregister fd = {}: {}", fd, e);
        }
    }

    fn deregister(&self, channel: &Arc<Channel>) {
        let fd = channel.fd();
        if let Err(e) = self.poll.registry().deregister(&mut SourceFd(&fd)) {
            // The descriptor may already be closed; losing a deregistration
            // is harmless because the kernel dropped it with the fd.
            log::error!("Poller::deregister fd = {}: {}", fd, e);
        }
    }
}

/// Converts a channel's interest mask into mio's (non-empty) form. Callers
/// guarantee at least one of read/write interest is set.
fn interest(channel: &Arc<Channel>) -> Interest {
    let events = channel.events();
    let readable = events & (ready::READABLE | ready::PRIORITY) != 0;
    let writable = events & ready::WRITABLE != 0;
    match (readable, writable) {
        (true, true) => Interest::READABLE | Interest::WRITABLE,
        (false, true) => Interest::WRITABLE,
        _ => Interest::READABLE,
    }
}

/// Maps mio readiness onto the crate's poll-style bits. A full hangup
/// (both directions gone) becomes `HUP`; a peer write-shutdown alone
/// becomes `READ_CLOSED`.
fn ready_bits(event: &mio::event::Event) -> u32 {
    let mut bits = ready::NONE;
    if event.is_readable() {
        bits |= ready::READABLE;
    }
    if event.is_writable() {
        bits |= ready::WRITABLE;
    }
    if event.is_error() {
        bits |= ready::ERROR;
    }
    if event.is_priority() {
        bits |= ready::PRIORITY;
    }
    if event.is_read_closed() {
        if event.is_write_closed() {
            bits |= ready::HUP;
        } else {
            bits |= ready::READ_CLOSED;
        }
    }
    bits
}
