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

//! TcpClient against a TcpServer on one loop.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rill::connection::State;
use rill::{EventLoop, TcpClient, TcpServer};

#[test]
fn client_round_trips_and_ends_disconnected() {
    let loop_ = EventLoop::new().expect("event loop");
    let addr = "127.0.0.1:2027".parse().expect("addr");

    let server = TcpServer::new(&loop_, &addr, "EchoServer", false).expect("bind");
    server.set_message_callback(Arc::new(|conn, buffer, _at| {
        let message = buffer.retrieve_all_as_bytes();
        conn.send(&message);
    }));
    server.start();

    let client = TcpClient::new(&loop_, addr, "EchoClient");
    let received = Arc::new(Mutex::new(Vec::new()));
    let last_conn = Arc::new(Mutex::new(None));

    let sink = received.clone();
    client.set_message_callback(Arc::new(move |conn, buffer, _at| {
        sink.lock().unwrap().extend_from_slice(buffer.peek());
        buffer.retrieve_all();
        // One round trip is enough; close our side.
        conn.shutdown();
    }));

    let track = last_conn.clone();
    let quit_handle = loop_.clone();
    client.set_connection_callback(Arc::new(move |conn| {
        if conn.connected() {
            conn.send(b"ping");
            *track.lock().unwrap() = Some(conn.clone());
        } else {
            quit_handle.quit();
        }
    }));
    client.connect();

    let watchdog = loop_.clone();
    loop_.run_after(Duration::from_secs(3), move || {
        watchdog.quit();
    });
    loop_.run();

    assert_eq!(b"ping".as_slice(), received.lock().unwrap().as_slice());
    let conn = last_conn.lock().unwrap().take().expect("connection seen");
    assert_eq!(State::Disconnected, conn.state());
    assert!(client.connection().is_none());
}

#[test]
fn client_retry_reconnects_after_server_side_close() {
    let loop_ = EventLoop::new().expect("event loop");
    let addr = "127.0.0.1:2037".parse().expect("addr");

    // The server slams every connection shut as soon as it is up.
    let server = TcpServer::new(&loop_, &addr, "Slammer", false).expect("bind");
    server.set_connection_callback(Arc::new(|conn| {
        if conn.connected() {
            conn.force_close();
        }
    }));
    server.start();

    let client = TcpClient::new(&loop_, addr, "Retrier");
    client.enable_retry();

    let ups = Arc::new(AtomicUsize::new(0));
    let seen = ups.clone();
    let quit_handle = loop_.clone();
    client.set_connection_callback(Arc::new(move |conn| {
        if conn.connected() && seen.fetch_add(1, Ordering::SeqCst) + 1 >= 2 {
            conn.force_close();
            quit_handle.quit();
        }
    }));
    client.connect();

    let watchdog = loop_.clone();
    loop_.run_after(Duration::from_secs(5), move || {
        watchdog.quit();
    });
    loop_.run();

    assert!(
        ups.load(Ordering::SeqCst) >= 2,
        "client reconnected {} times",
        ups.load(Ordering::SeqCst)
    );
    client.stop();
}
