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

//! Echo server: four worker loops, every byte sent straight back.

use std::io::Result;
use std::sync::Arc;

use rill::{EventLoop, TcpServer};

fn main() -> Result<()> {
    let loop_ = EventLoop::new()?;
    let addr = "0.0.0.0:2007".parse().expect("listen address");
    let server = TcpServer::new(&loop_, &addr, "EchoServer", false)?;

    server.set_message_callback(Arc::new(|conn, buffer, _at| {
        let message = buffer.retrieve_all_as_bytes();
        conn.send(&message);
    }));
    server.set_thread_num(4);
    server.start();

    println!("echo server listening on {}", addr);
    loop_.run();
    Ok(())
}
