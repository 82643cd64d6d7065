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

//! Pool of worker event loops
//!
//! A server keeps its acceptor on the base loop and spreads connections
//! over the pool. With zero worker threads, the base loop carries
//! everything.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::event_loop::EventLoop;
use crate::loop_thread::{EventLoopThread, ThreadInitCallback};

/// Owns N worker threads, each hosting one loop, and hands loops out
/// round-robin or by hash.
pub struct EventLoopThreadPool {
    base_loop: Arc<EventLoop>,
    name: String,
    started: AtomicBool,
    num_threads: AtomicUsize,
    next: AtomicUsize,
    threads: Mutex<Vec<EventLoopThread>>,
    loops: Mutex<Vec<Arc<EventLoop>>>,
}

impl EventLoopThreadPool {
    /// Creates an empty pool around the base loop.
    pub fn new(base_loop: Arc<EventLoop>, name: impl Into<String>) -> Self {
        Self {
            base_loop,
            name: name.into(),
            started: AtomicBool::new(false),
            num_threads: AtomicUsize::new(0),
            next: AtomicUsize::new(0),
            threads: Mutex::new(Vec::new()),
            loops: Mutex::new(Vec::new()),
        }
    }

    /// Sets the number of worker threads to spawn at [`Self::start`].
    pub fn set_thread_num(&self, num: usize) {
        self.num_threads.store(num, Ordering::SeqCst);
    }

    /// Whether the pool has started.
    pub fn started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Spawns the workers. Must run on the base loop's thread, once. The
    /// init callback runs on every worker loop's own thread — or, with
    /// zero workers, once on the base loop.
    pub fn start(&self, init: Option<ThreadInitCallback>) -> io::Result<()> {
        assert!(!self.started());
        self.base_loop.assert_in_loop_thread();
        self.started.store(true, Ordering::SeqCst);

        let num = self.num_threads.load(Ordering::SeqCst);
        for i in 0..num {
            let name = format!("{}{}", self.name, i);
            let (thread, loop_) = EventLoopThread::start(name, init.clone())?;
            self.threads.lock().unwrap().push(thread);
            self.loops.lock().unwrap().push(loop_);
        }
        if num == 0 {
            if let Some(init) = &init {
                init(&self.base_loop);
            }
        }
        Ok(())
    }

    /// The next loop, round-robin; the base loop when the pool is empty.
    pub fn get_next_loop(&self) -> Arc<EventLoop> {
        let loops = self.loops.lock().unwrap();
        if loops.is_empty() {
            self.base_loop.clone()
        } else {
            let index = self.next.fetch_add(1, Ordering::Relaxed) % loops.len();
            loops[index].clone()
        }
    }

    /// A loop chosen deterministically by `hash`, so the same key always
    /// lands on the same loop.
    pub fn get_loop_for_hash(&self, hash: usize) -> Arc<EventLoop> {
        let loops = self.loops.lock().unwrap();
        if loops.is_empty() {
            self.base_loop.clone()
        } else {
            loops[hash % loops.len()].clone()
        }
    }

    /// Every loop in the pool; just the base loop when empty.
    pub fn get_all_loops(&self) -> Vec<Arc<EventLoop>> {
        let loops = self.loops.lock().unwrap();
        if loops.is_empty() {
            vec![self.base_loop.clone()]
        } else {
            loops.clone()
        }
    }
}

impl std::fmt::Debug for EventLoopThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoopThreadPool")
            .field("name", &self.name)
            .field("started", &self.started())
            .field("loops", &self.loops.lock().unwrap().len())
            .finish()
    }
}
