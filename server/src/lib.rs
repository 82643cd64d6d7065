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

#![deny(missing_docs, rust_2018_idioms, unused_imports)]
// Disallow warnings in examples.
#![doc(test(attr(deny(warnings))))]

//! rill is a multi-reactor networking library for building high-concurrency
//! TCP and HTTP/1.x servers and clients on Linux.
//!
//! The building blocks are cooperating single-threaded event loops: each
//! [`event_loop::EventLoop`] runs on the thread that created it and owns an
//! epoll-backed poller, a timerfd-driven timer queue, an eventfd wake
//! channel, and every connection assigned to it. A [`server::TcpServer`]
//! accepts on its base loop and distributes connections round-robin over an
//! [`loop_pool::EventLoopThreadPool`]; [`http::HttpServer`] layers a
//! streaming HTTP/1.x codec on top.
//!
//! Cross-thread interaction follows one rule: state owned by a loop is only
//! touched on that loop's thread. Public entry points that may be called
//! from foreign threads hand a task to the owner loop and return.

#[macro_use]
mod macros;

pub mod acceptor;
pub mod buffer;
pub mod channel;
pub mod client;
pub mod connection;
pub mod connector;
pub mod event_loop;
pub mod http;
pub mod loop_pool;
pub mod loop_thread;
mod poller;
pub mod server;
pub mod socket;
pub mod timer;

pub use buffer::Buffer;
pub use client::TcpClient;
pub use connection::{TcpConnection, TcpConnectionPtr};
pub use event_loop::EventLoop;
pub use http::HttpServer;
pub use server::TcpServer;
pub use timer::TimerId;
