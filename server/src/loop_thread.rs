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

//! A worker thread hosting one event loop

use std::io;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crate::event_loop::EventLoop;

/// Callback run on each worker thread after its loop is constructed and
/// before it starts polling.
pub type ThreadInitCallback = Arc<dyn Fn(&Arc<EventLoop>) + Send + Sync>;

/// Owns an OS thread whose whole life is one [`EventLoop`]. The loop is
/// constructed on the spawned thread (loops are pinned to their creator),
/// handed back over a channel, and quit + joined when this is dropped.
#[derive(Debug)]
pub struct EventLoopThread {
    loop_: Mutex<Option<Arc<EventLoop>>>,
    thread: Option<JoinHandle<()>>,
}

impl EventLoopThread {
    /// Spawns the worker and blocks until its loop is running-ready.
    pub fn start(
        name: String,
        init: Option<ThreadInitCallback>,
    ) -> io::Result<(EventLoopThread, Arc<EventLoop>)> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let thread = thread::Builder::new().name(name).spawn(move || {
            let loop_ = match EventLoop::new() {
                Ok(loop_) => loop_,
                Err(e) => {
                    let _ = tx.send(Err(e));
                    return;
                }
            };
            if let Some(init) = &init {
                init(&loop_);
            }
            let _ = tx.send(Ok(loop_.clone()));
            loop_.run();
        })?;

        let loop_ = rx
            .recv()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "loop thread died during startup"))??;
        Ok((
            EventLoopThread {
                loop_: Mutex::new(Some(loop_.clone())),
                thread: Some(thread),
            },
            loop_,
        ))
    }

    /// The hosted loop.
    pub fn event_loop(&self) -> Option<Arc<EventLoop>> {
        self.loop_.lock().unwrap().clone()
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        if let Some(loop_) = self.loop_.lock().unwrap().take() {
            loop_.quit();
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
