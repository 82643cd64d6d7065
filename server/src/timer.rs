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

//! Timer queue driven by a monotonic timerfd
//!
//! Each event loop owns one [`TimerQueue`]. Timers live in an ordered map
//! keyed on `(expiration, sequence)`; the queue re-arms a CLOCK_MONOTONIC
//! timerfd to the earliest expiration and fires due timers from that
//! descriptor's read event.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use crate::channel::{Channel, EventHandler};
use crate::event_loop::EventLoop;

/// Callback type run when a timer expires.
pub type TimerCallback = Box<dyn FnMut() + Send>;

static NUM_CREATED: AtomicU64 = AtomicU64::new(0);

/// Opaque handle identifying a scheduled timer for cancellation.
///
/// The sequence inside is drawn from a process-wide counter, so a handle
/// can never alias a later timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerId(u64);

struct Timer {
    callback: TimerCallback,
    expiration: Instant,
    interval: Duration,
    repeat: bool,
    sequence: u64,
}

impl Timer {
    fn new(callback: TimerCallback, expiration: Instant, interval: Duration) -> Self {
        Self {
            callback,
            expiration,
            interval,
            // A zero interval means one-shot.
            repeat: interval > Duration::ZERO,
            sequence: NUM_CREATED.fetch_add(1, Ordering::Relaxed) + 1,
        }
    }

    fn run(&mut self) {
        (self.callback)();
    }

    fn restart(&mut self, now: Instant) {
        self.expiration = now + self.interval;
    }
}

/// Nonblocking, close-on-exec CLOCK_MONOTONIC timer descriptor.
#[derive(Debug)]
pub(crate) struct TimerFd(OwnedFd);

impl TimerFd {
    pub(crate) fn new() -> io::Result<Self> {
        let fd = unsafe {
            libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_NONBLOCK | libc::TFD_CLOEXEC)
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self(unsafe { OwnedFd::from_raw_fd(fd) }))
    }

    /// Arms the descriptor to fire at `when`, flooring the delay at 100 µs
    /// so an already-due expiration still ticks.
    fn set(&self, when: Instant) {
        let delay = when
            .saturating_duration_since(Instant::now())
            .max(Duration::from_micros(100));
        let new_value = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: libc::timespec {
                tv_sec: delay.as_secs() as libc::time_t,
                tv_nsec: delay.subsec_nanos() as libc::c_long,
            },
        };
        let ret = unsafe {
            libc::timerfd_settime(self.0.as_raw_fd(), 0, &new_value, std::ptr::null_mut())
        };
        if ret != 0 {
            log::error!("timerfd_settime: {}", io::Error::last_os_error());
        }
    }

    /// Drains the expiration counter after a read event.
    fn read(&self) {
        let mut count: u64 = 0;
        let n = unsafe {
            libc::read(
                self.0.as_raw_fd(),
                &mut count as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        log::trace!("TimerQueue::handle_read {} expirations", count);
        if n != std::mem::size_of::<u64>() as isize {
            log::trace!("TimerFd::read returned {}", n);
        }
    }
}

#[derive(Default)]
struct Inner {
    /// Ordered by `(expiration, sequence)`; ties break by creation order.
    timers: BTreeMap<(Instant, u64), Timer>,
    /// sequence → expiration, for cancellation lookup. Always the same
    /// membership as `timers`.
    active: HashMap<u64, Instant>,
    /// Timers cancelled while their callback runs; they must not re-arm.
    canceling: HashSet<u64>,
    calling_expired: bool,
}

/// Time-ordered set of timers fired via a timerfd owned by one loop.
pub struct TimerQueue {
    self_weak: Weak<TimerQueue>,
    loop_: Weak<EventLoop>,
    timerfd: TimerFd,
    channel: Arc<Channel>,
    inner: Mutex<Inner>,
}

impl TimerQueue {
    pub(crate) fn new(
        self_weak: Weak<TimerQueue>,
        loop_: Weak<EventLoop>,
        timerfd: TimerFd,
    ) -> Self {
        let channel = Channel::new(loop_.clone(), timerfd.0.as_raw_fd());
        Self {
            self_weak,
            loop_,
            timerfd,
            channel,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub(crate) fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    /// Schedules `callback` for `when`, repeating every `interval` when
    /// non-zero. Safe to call from any thread; insertion happens on the
    /// owner loop.
    pub fn add_timer(&self, callback: TimerCallback, when: Instant, interval: Duration) -> TimerId {
        let timer = Timer::new(callback, when, interval);
        let id = TimerId(timer.sequence);
        if let (Some(loop_), Some(queue)) = (self.loop_.upgrade(), self.self_weak.upgrade()) {
            loop_.run_in_loop(move || queue.add_timer_in_loop(timer));
        }
        id
    }

    /// Cancels a scheduled timer. A timer currently running its callback is
    /// recorded so it will not re-arm. Safe to call from any thread.
    pub fn cancel(&self, id: TimerId) {
        if let (Some(loop_), Some(queue)) = (self.loop_.upgrade(), self.self_weak.upgrade()) {
            loop_.run_in_loop(move || queue.cancel_in_loop(id));
        }
    }

    fn add_timer_in_loop(&self, timer: Timer) {
        self.assert_in_loop_thread();
        let expiration = timer.expiration;
        let earliest_changed = {
            let mut inner = self.inner.lock().unwrap();
            let earliest_changed = inner
                .timers
                .keys()
                .next()
                .map_or(true, |&(earliest, _)| expiration < earliest);
            inner.active.insert(timer.sequence, expiration);
            inner.timers.insert((expiration, timer.sequence), timer);
            debug_assert_eq!(inner.timers.len(), inner.active.len());
            earliest_changed
        };
        if earliest_changed {
            self.timerfd.set(expiration);
        }
    }

    fn cancel_in_loop(&self, id: TimerId) {
        self.assert_in_loop_thread();
        let mut inner = self.inner.lock().unwrap();
        if let Some(when) = inner.active.remove(&id.0) {
            let removed = inner.timers.remove(&(when, id.0));
            debug_assert!(removed.is_some());
        } else if inner.calling_expired {
            inner.canceling.insert(id.0);
        }
        debug_assert_eq!(inner.timers.len(), inner.active.len());
    }

    fn assert_in_loop_thread(&self) {
        if let Some(loop_) = self.loop_.upgrade() {
            loop_.assert_in_loop_thread();
        }
    }

    #[cfg(test)]
    fn len(&self) -> (usize, usize) {
        let inner = self.inner.lock().unwrap();
        (inner.timers.len(), inner.active.len())
    }
}

impl EventHandler for TimerQueue {
    /// Fires every due timer in expiration order, then re-arms repeating
    /// timers that were not cancelled mid-fire and points the timerfd at
    /// the next expiration. Callbacks run without the queue lock held.
    fn handle_read(self: Arc<Self>, _at: Instant) {
        self.assert_in_loop_thread();
        let now = Instant::now();
        self.timerfd.read();

        let mut expired: Vec<Timer> = {
            let mut inner = self.inner.lock().unwrap();
            let remaining = inner.timers.split_off(&(now, u64::MAX));
            let due = std::mem::replace(&mut inner.timers, remaining);
            for &(_, sequence) in due.keys() {
                inner.active.remove(&sequence);
            }
            debug_assert_eq!(inner.timers.len(), inner.active.len());
            inner.calling_expired = true;
            inner.canceling.clear();
            due.into_values().collect()
        };

        for timer in &mut expired {
            timer.run();
        }

        let next_expire = {
            let mut inner = self.inner.lock().unwrap();
            inner.calling_expired = false;
            for mut timer in expired {
                if timer.repeat && !inner.canceling.contains(&timer.sequence) {
                    timer.restart(now);
                    inner.active.insert(timer.sequence, timer.expiration);
                    inner.timers.insert((timer.expiration, timer.sequence), timer);
                }
            }
            debug_assert_eq!(inner.timers.len(), inner.active.len());
            inner.timers.keys().next().map(|&(when, _)| when)
        };

        if let Some(when) = next_expire {
            self.timerfd.set(when);
        }
    }
}

impl std::fmt::Debug for TimerQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("TimerQueue")
            .field("timerfd", &self.timerfd.0.as_raw_fd())
            .field("timers", &inner.timers.len())
            .finish()
    }
}
