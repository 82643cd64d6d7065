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

//! Single-threaded reactor
//!
//! An [`EventLoop`] belongs to the thread that created it. Each iteration
//! polls for readiness (bounded by ten seconds), dispatches every active
//! channel, then drains the cross-thread task queue. Foreign threads never
//! touch loop-owned state directly: they enqueue a task and wake the loop
//! by writing to its eventfd.

use std::cell::RefCell;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Once, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use crate::channel::{Channel, EventHandler};
use crate::poller::Poller;
use crate::timer::{TimerCallback, TimerFd, TimerId, TimerQueue};

const POLL_TIMEOUT: Duration = Duration::from_secs(10);

/// A task enqueued for execution on a loop's thread.
pub type Task = Box<dyn FnOnce() + Send>;

thread_local! {
    static LOOP_IN_THIS_THREAD: RefCell<Weak<EventLoop>> = RefCell::new(Weak::new());
}

static IGNORE_SIGPIPE: Once = Once::new();

/// Broken-pipe writes must surface as write errors, not kill the process.
fn ignore_sigpipe() {
    IGNORE_SIGPIPE.call_once(|| unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    });
}

/// Nonblocking, close-on-exec eventfd used to wake a sleeping poll.
#[derive(Debug)]
struct EventFd(OwnedFd);

impl EventFd {
    fn new() -> io::Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self(unsafe { OwnedFd::from_raw_fd(fd) }))
    }

    fn write_one(&self) {
        let one: u64 = 1;
        let n = unsafe {
            libc::write(
                self.0.as_raw_fd(),
                &one as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if n != std::mem::size_of::<u64>() as isize {
            log::error!("EventLoop::wakeup writes {} bytes instead of 8", n);
        }
    }

    fn drain(&self) {
        let mut value: u64 = 0;
        let n = unsafe {
            libc::read(
                self.0.as_raw_fd(),
                &mut value as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if n != std::mem::size_of::<u64>() as isize {
            log::error!("EventLoop wake drain reads {} bytes instead of 8", n);
        }
    }
}

/// One reactor, pinned to the thread that constructed it.
///
/// The loop owns its poller, timer queue and wake descriptor. It is shared
/// as `Arc<EventLoop>` so connections, servers and foreign threads can hand
/// it work, but every state-mutating entry point either runs on the owner
/// thread or enqueues onto it.
pub struct EventLoop {
    poller: Mutex<Poller>,
    timer_queue: Arc<TimerQueue>,
    wakeup_fd: EventFd,
    wakeup_channel: Arc<Channel>,
    pending: Mutex<Vec<Task>>,
    thread_id: ThreadId,
    looping: AtomicBool,
    quit: AtomicBool,
    event_handling: AtomicBool,
    calling_pending: AtomicBool,
    iteration: AtomicU64,
    current_active_fd: AtomicI32,
    poll_return_time: Mutex<Instant>,
}

impl EventLoop {
    /// Creates the loop for the current thread. Aborts if this thread
    /// already hosts one.
    pub fn new() -> io::Result<Arc<Self>> {
        ignore_sigpipe();

        let poller = Poller::new()?;
        let wakeup_fd = EventFd::new()?;
        let timerfd = TimerFd::new()?;

        let loop_ = Arc::new_cyclic(|weak: &Weak<EventLoop>| {
            let wakeup_channel = Channel::new(weak.clone(), wakeup_fd.0.as_raw_fd());
            let timer_queue = Arc::new_cyclic(|queue_weak: &Weak<TimerQueue>| {
                TimerQueue::new(queue_weak.clone(), weak.clone(), timerfd)
            });
            EventLoop {
                poller: Mutex::new(poller),
                timer_queue,
                wakeup_fd,
                wakeup_channel,
                pending: Mutex::new(Vec::new()),
                thread_id: thread::current().id(),
                looping: AtomicBool::new(false),
                quit: AtomicBool::new(false),
                event_handling: AtomicBool::new(false),
                calling_pending: AtomicBool::new(false),
                iteration: AtomicU64::new(0),
                current_active_fd: AtomicI32::new(-1),
                poll_return_time: Mutex::new(Instant::now()),
            }
        });

        LOOP_IN_THIS_THREAD.with(|current| {
            if current.borrow().upgrade().is_some() {
                fatal!(
                    "another EventLoop already exists in thread {:?}",
                    thread::current().id()
                );
            }
            *current.borrow_mut() = Arc::downgrade(&loop_);
        });
        log::debug!(
            "EventLoop created in thread {:?}",
            thread::current().id()
        );

        loop_.wakeup_channel.tie(&loop_);
        loop_.wakeup_channel.enable_reading();
        loop_.timer_queue.channel().tie(&loop_.timer_queue);
        loop_.timer_queue.channel().enable_reading();
        Ok(loop_)
    }

    /// The loop constructed on the current thread, if any.
    pub fn current() -> Option<Arc<EventLoop>> {
        LOOP_IN_THIS_THREAD.with(|current| current.borrow().upgrade())
    }

    /// Runs the reactor until [`EventLoop::quit`]. Must be called on the
    /// owner thread.
    pub fn run(&self) {
        assert!(!self.looping.load(Ordering::SeqCst));
        self.assert_in_loop_thread();
        self.looping.store(true, Ordering::SeqCst);
        self.quit.store(false, Ordering::SeqCst);
        log::trace!("EventLoop start looping");

        while !self.quit.load(Ordering::SeqCst) {
            let (at, active) = self.poller.lock().unwrap().poll(POLL_TIMEOUT);
            *self.poll_return_time.lock().unwrap() = at;
            self.iteration.fetch_add(1, Ordering::Relaxed);

            self.event_handling.store(true, Ordering::SeqCst);
            for channel in &active {
                self.current_active_fd.store(channel.fd(), Ordering::SeqCst);
                channel.handle_event(at);
            }
            self.current_active_fd.store(-1, Ordering::SeqCst);
            self.event_handling.store(false, Ordering::SeqCst);

            self.do_pending_tasks();
        }

        log::trace!("EventLoop stop looping");
        self.looping.store(false, Ordering::SeqCst);
    }

    /// Asks the loop to stop after the current iteration. Pending events
    /// and tasks complete first. Callable from any thread.
    pub fn quit(&self) {
        self.quit.store(true, Ordering::SeqCst);
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
    }

    /// Runs `task` immediately when called on the owner thread, otherwise
    /// enqueues it.
    pub fn run_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        if self.is_in_loop_thread() {
            task();
        } else {
            self.queue_in_loop(task);
        }
    }

    /// Enqueues `task` for the owner thread and wakes the loop when the
    /// caller is foreign or the loop is currently draining tasks (so tasks
    /// queued from inside a task are picked up promptly).
    pub fn queue_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        self.pending.lock().unwrap().push(Box::new(task));
        if !self.is_in_loop_thread() || self.calling_pending.load(Ordering::SeqCst) {
            self.wakeup();
        }
    }

    /// Number of tasks waiting for the owner thread.
    pub fn queue_size(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Schedules `callback` at an absolute time.
    pub fn run_at(&self, when: Instant, callback: impl FnMut() + Send + 'static) -> TimerId {
        self.timer_queue
            .add_timer(Box::new(callback) as TimerCallback, when, Duration::ZERO)
    }

    /// Schedules `callback` after a delay.
    pub fn run_after(&self, delay: Duration, callback: impl FnMut() + Send + 'static) -> TimerId {
        self.run_at(Instant::now() + delay, callback)
    }

    /// Schedules `callback` every `interval`, first firing one interval
    /// from now. A zero interval degenerates to one-shot.
    pub fn run_every(&self, interval: Duration, callback: impl FnMut() + Send + 'static) -> TimerId {
        self.timer_queue
            .add_timer(Box::new(callback) as TimerCallback, Instant::now() + interval, interval)
    }

    /// Cancels a timer scheduled on this loop.
    pub fn cancel(&self, id: TimerId) {
        self.timer_queue.cancel(id);
    }

    /// Applies a channel's interest to this loop's poller. Owner thread
    /// only.
    pub fn update_channel(&self, channel: &Arc<Channel>) {
        self.assert_in_loop_thread();
        self.poller.lock().unwrap().update_channel(channel);
    }

    /// Forgets a channel. Owner thread only.
    pub fn remove_channel(&self, channel: &Arc<Channel>) {
        self.assert_in_loop_thread();
        self.poller.lock().unwrap().remove_channel(channel);
    }

    /// Whether the channel is in this loop's poller table.
    pub fn has_channel(&self, channel: &Arc<Channel>) -> bool {
        self.assert_in_loop_thread();
        self.poller.lock().unwrap().has_channel(channel)
    }

    /// Forces a sleeping poll to return by writing to the wake descriptor.
    pub fn wakeup(&self) {
        self.wakeup_fd.write_one();
    }

    /// Whether the caller is on the loop's owner thread.
    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Aborts unless called on the owner thread.
    pub fn assert_in_loop_thread(&self) {
        if !self.is_in_loop_thread() {
            fatal!(
                "EventLoop::assert_in_loop_thread - loop was created in {:?}, current thread is {:?}",
                self.thread_id,
                thread::current().id()
            );
        }
    }

    /// When the last poll returned.
    pub fn poll_return_time(&self) -> Instant {
        *self.poll_return_time.lock().unwrap()
    }

    /// Completed loop iterations.
    pub fn iteration(&self) -> u64 {
        self.iteration.load(Ordering::Relaxed)
    }

    pub(crate) fn timer_queue(&self) -> &Arc<TimerQueue> {
        &self.timer_queue
    }

    fn do_pending_tasks(&self) {
        self.calling_pending.store(true, Ordering::SeqCst);
        let tasks = std::mem::take(&mut *self.pending.lock().unwrap());
        for task in tasks {
            task();
        }
        self.calling_pending.store(false, Ordering::SeqCst);
    }
}

/// Wake-channel handler: drain the eventfd counter so the next write
/// triggers a fresh edge.
impl EventHandler for EventLoop {
    fn handle_read(self: Arc<Self>, _at: Instant) {
        self.wakeup_fd.drain();
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        log::debug!("EventLoop of thread {:?} destructs", self.thread_id);
        if thread::current().id() == self.thread_id {
            LOOP_IN_THIS_THREAD.with(|current| {
                *current.borrow_mut() = Weak::new();
            });
        }
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("thread_id", &self.thread_id)
            .field("looping", &self.looping.load(Ordering::SeqCst))
            .field("event_handling", &self.event_handling.load(Ordering::SeqCst))
            .field("current_active_fd", &self.current_active_fd.load(Ordering::SeqCst))
            .field("iteration", &self.iteration())
            .finish()
    }
}
