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

//! Echo round trip over a real socket.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use rill::{EventLoop, TcpServer};

#[test]
fn echo_server_returns_bytes_and_sees_up_then_down() {
    let loop_ = EventLoop::new().expect("event loop");
    let addr = "127.0.0.1:2007".parse().expect("addr");
    let server = TcpServer::new(&loop_, &addr, "EchoServer", false).expect("bind");

    let transitions = Arc::new(Mutex::new(Vec::new()));
    let seen = transitions.clone();
    server.set_connection_callback(Arc::new(move |conn| {
        seen.lock().unwrap().push(conn.connected());
    }));
    server.set_message_callback(Arc::new(|conn, buffer, _at| {
        let message = buffer.retrieve_all_as_bytes();
        conn.send(&message);
    }));
    server.start();

    let quit_handle = loop_.clone();
    let client = thread::spawn(move || {
        let mut stream = TcpStream::connect(addr).expect("connect");
        stream.write_all(b"hello").expect("send");

        let mut echoed = [0u8; 5];
        stream.read_exact(&mut echoed).expect("echo");
        assert_eq!(b"hello", &echoed);

        drop(stream);
        // Give the server a moment to process the close before stopping.
        thread::sleep(Duration::from_millis(300));
        quit_handle.quit();
    });

    loop_.run();
    client.join().expect("client thread");

    assert_eq!(vec![true, false], *transitions.lock().unwrap());
    assert_eq!(0, server.connection_count());
}

#[test]
fn echo_survives_multiple_chunks_on_worker_loops() {
    let loop_ = EventLoop::new().expect("event loop");
    let addr = "127.0.0.1:2017".parse().expect("addr");
    let server = TcpServer::new(&loop_, &addr, "ChunkEcho", false).expect("bind");
    server.set_thread_num(2);
    server.set_message_callback(Arc::new(|conn, buffer, _at| {
        let message = buffer.retrieve_all_as_bytes();
        conn.send(&message);
    }));
    server.start();

    let quit_handle = loop_.clone();
    let client = thread::spawn(move || {
        let mut stream = TcpStream::connect(addr).expect("connect");
        let mut received = Vec::new();
        for chunk in [&b"first "[..], &b"second "[..], &b"third"[..]] {
            stream.write_all(chunk).expect("send");
            let mut buf = vec![0u8; chunk.len()];
            stream.read_exact(&mut buf).expect("echo");
            received.extend_from_slice(&buf);
        }
        drop(stream);
        thread::sleep(Duration::from_millis(200));
        quit_handle.quit();
        received
    });

    loop_.run();
    let received = client.join().expect("client thread");
    assert_eq!(b"first second third".as_slice(), received.as_slice());
}
