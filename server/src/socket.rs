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

//! Thin semantic wrapper over OS TCP sockets
//!
//! Addresses are plain [`std::net::SocketAddr`] values — already the
//! dual-stack IPv4/IPv6 discriminated union, with network byte order kept
//! inside the standard library types.

use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr, Shutdown, SocketAddr, ToSocketAddrs};
use std::os::fd::{AsRawFd, RawFd};

use socket2::{Domain, Protocol, SockAddr, Type};

/// Blocking name resolution; the first resolved address wins.
pub fn resolve(host: &str, port: u16) -> Option<SocketAddr> {
    (host, port).to_socket_addrs().ok()?.next()
}

/// Fallback address used when the kernel cannot report one for a live
/// socket.
pub(crate) fn unspecified_addr() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
}

/// A nonblocking, close-on-exec TCP socket. The descriptor is closed on
/// drop.
#[derive(Debug)]
pub struct Socket {
    inner: socket2::Socket,
}

impl Socket {
    /// Creates a nonblocking stream socket for the address family of
    /// `addr`.
    pub fn new_nonblocking(addr: &SocketAddr) -> io::Result<Self> {
        let inner = socket2::Socket::new(
            Domain::for_address(*addr),
            Type::STREAM.nonblocking(),
            Some(Protocol::TCP),
        )?;
        Ok(Self { inner })
    }

    pub(crate) fn from_socket2(inner: socket2::Socket) -> Self {
        Self { inner }
    }

    /// The raw descriptor.
    pub fn fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }

    /// Binds to a local address.
    pub fn bind(&self, addr: &SocketAddr) -> io::Result<()> {
        self.inner.bind(&SockAddr::from(*addr))
    }

    /// Starts listening with the system backlog.
    pub fn listen(&self) -> io::Result<()> {
        self.inner.listen(libc::SOMAXCONN)
    }

    /// Accepts one pending connection. The returned socket is nonblocking
    /// and close-on-exec. Errors are returned with their errno intact so
    /// the acceptor can classify transient conditions.
    pub fn accept(&self) -> io::Result<(Socket, SocketAddr)> {
        let (socket, addr) = self.inner.accept()?;
        socket.set_nonblocking(true)?;
        let addr = addr
            .as_socket()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "non-inet peer address"))?;
        Ok((Socket { inner: socket }, addr))
    }

    /// Initiates a nonblocking connect.
    pub fn connect(&self, addr: &SocketAddr) -> io::Result<()> {
        self.inner.connect(&SockAddr::from(*addr))
    }

    /// Closes the write half, letting queued data drain first.
    pub fn shutdown_write(&self) {
        if let Err(e) = self.inner.shutdown(Shutdown::Write) {
            log::error!("Socket::shutdown_write: {}", e);
        }
    }

    /// Toggles Nagle's algorithm.
    pub fn set_tcp_no_delay(&self, on: bool) {
        if let Err(e) = self.inner.set_nodelay(on) {
            log::error!("Socket::set_tcp_no_delay: {}", e);
        }
    }

    /// Toggles address reuse for fast listener restarts.
    pub fn set_reuse_addr(&self, on: bool) {
        if let Err(e) = self.inner.set_reuse_address(on) {
            log::error!("Socket::set_reuse_addr: {}", e);
        }
    }

    /// Toggles port sharing between listeners.
    pub fn set_reuse_port(&self, on: bool) {
        if let Err(e) = self.inner.set_reuse_port(on) {
            log::error!("Socket::set_reuse_port: {}", e);
        }
    }

    /// Toggles TCP keepalive probing.
    pub fn set_keep_alive(&self, on: bool) {
        if let Err(e) = self.inner.set_keepalive(on) {
            log::error!("Socket::set_keep_alive: {}", e);
        }
    }

    /// Takes the pending SO_ERROR, if any.
    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        self.inner.take_error()
    }

    /// The locally bound address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner
            .local_addr()?
            .as_socket()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "non-inet local address"))
    }

    /// The peer's address.
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.inner
            .peer_addr()?
            .as_socket()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "non-inet peer address"))
    }

    /// Detects the TCP self-connect anomaly: a connect that "succeeded"
    /// onto our own ephemeral port.
    pub fn is_self_connect(&self) -> bool {
        match (self.local_addr(), self.peer_addr()) {
            (Ok(local), Ok(peer)) => local == peer,
            _ => false,
        }
    }

    /// Writes from `data`, returning the number of bytes the kernel took.
    pub fn write(&self, data: &[u8]) -> io::Result<usize> {
        (&self.inner).write(data)
    }

    /// Reads into `buf`.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.inner).read(buf)
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

#[cfg(test)]
mod test {
    use super::{resolve, Socket};
    use std::net::SocketAddr;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().expect("addr")
    }

    #[test]
    fn bind_and_listen_on_ephemeral_port() {
        let socket = Socket::new_nonblocking(&loopback()).expect("socket");
        socket.set_reuse_addr(true);
        socket.bind(&loopback()).expect("bind");
        socket.listen().expect("listen");
        let local = socket.local_addr().expect("local addr");
        assert!(local.port() != 0);
        assert!(local.ip().is_loopback());
    }

    #[test]
    fn accept_surfaces_would_block_on_idle_listener() {
        let socket = Socket::new_nonblocking(&loopback()).expect("socket");
        socket.bind(&loopback()).expect("bind");
        socket.listen().expect("listen");
        let err = socket.accept().expect_err("no pending connection");
        assert_eq!(std::io::ErrorKind::WouldBlock, err.kind());
    }

    #[test]
    fn resolve_localhost_yields_loopback() {
        let addr = resolve("localhost", 80).expect("resolves");
        assert!(addr.ip().is_loopback());
        assert_eq!(80, addr.port());
    }
}
