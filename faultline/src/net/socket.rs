//! UDP socket wrapper for mio-based I/O.
//!
//! Thin wrapper around [`mio::net::UdpSocket`] adding buffer-size options
//! and bind-before-connect setup for the per-peer relay sockets.

use std::io::{self, ErrorKind};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::fd::{AsFd, BorrowedFd};

use mio::event::Source;
use mio::net::UdpSocket as MioUdpSocket;
use mio::{Interest, Registry, Token};

/// A non-blocking UDP socket.
#[derive(Debug)]
pub struct DatagramSocket {
    inner: MioUdpSocket,
}

impl DatagramSocket {
    /// Creates a socket bound to `addr`.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound (e.g., address in use).
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        Ok(Self {
            inner: MioUdpSocket::bind(addr)?,
        })
    }

    /// Creates a socket connected to `remote`, bound to `local` if given and
    /// to an ephemeral port of the matching family otherwise.
    ///
    /// # Errors
    ///
    /// Returns an error if binding or connecting fails.
    pub fn connect(remote: SocketAddr, local: Option<SocketAddr>) -> io::Result<Self> {
        let local = local.unwrap_or_else(|| unspecified(remote));
        let socket = Self::bind(local)?;
        socket.inner.connect(remote)?;
        Ok(socket)
    }

    /// Returns the local address this socket is bound to.
    ///
    /// # Errors
    ///
    /// Returns an error if the local address cannot be retrieved.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// Sends a datagram to `dest`.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure or `WouldBlock`.
    pub fn send_to(&self, buf: &[u8], dest: SocketAddr) -> io::Result<usize> {
        self.inner.send_to(buf, dest)
    }

    /// Receives a datagram and its source address. A zero length is an
    /// empty datagram, not end of stream.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure or `WouldBlock`.
    pub fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.inner.recv_from(buf)
    }

    /// Sends a datagram to the connected peer.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure or `WouldBlock`.
    pub fn send(&self, buf: &[u8]) -> io::Result<usize> {
        self.inner.send(buf)
    }

    /// Receives a datagram from the connected peer.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure or `WouldBlock`.
    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.recv(buf)
    }

    /// Attempts to receive, returning `Ok(None)` instead of `WouldBlock`.
    ///
    /// # Errors
    ///
    /// Returns any error other than `WouldBlock`.
    pub fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        match self.recv_from(buf) {
            Ok(received) => Ok(Some(received)),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Attempts to receive from the connected peer, returning `Ok(None)`
    /// instead of `WouldBlock`.
    ///
    /// # Errors
    ///
    /// Returns any error other than `WouldBlock`.
    pub fn try_recv(&self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        match self.recv(buf) {
            Ok(n) => Ok(Some(n)),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Applies optional buffer sizes; `None` keeps the system default.
    ///
    /// # Errors
    ///
    /// Returns an error if an option cannot be set.
    pub fn set_buffer_sizes(&self, rcv: Option<usize>, snd: Option<usize>) -> io::Result<()> {
        if let Some(size) = rcv {
            self.set_recv_buffer_size(size)?;
        }
        if let Some(size) = snd {
            self.set_send_buffer_size(size)?;
        }
        Ok(())
    }

    /// Sets the socket's send buffer size.
    ///
    /// # Errors
    ///
    /// Returns an error if the option cannot be set.
    pub fn set_send_buffer_size(&self, size: usize) -> io::Result<()> {
        rustix::net::sockopt::set_socket_send_buffer_size(self.inner.as_fd(), size)?;
        Ok(())
    }

    /// Sets the socket's receive buffer size.
    ///
    /// # Errors
    ///
    /// Returns an error if the option cannot be set.
    pub fn set_recv_buffer_size(&self, size: usize) -> io::Result<()> {
        rustix::net::sockopt::set_socket_recv_buffer_size(self.inner.as_fd(), size)?;
        Ok(())
    }

    /// Gets the socket's receive buffer size.
    ///
    /// # Errors
    ///
    /// Returns an error if the option cannot be retrieved.
    pub fn recv_buffer_size(&self) -> io::Result<usize> {
        Ok(rustix::net::sockopt::get_socket_recv_buffer_size(self.inner.as_fd())?)
    }
}

fn unspecified(remote: SocketAddr) -> SocketAddr {
    let ip = match remote.ip() {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    SocketAddr::new(ip, 0)
}

impl AsFd for DatagramSocket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.inner.as_fd()
    }
}

impl Source for DatagramSocket {
    fn register(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.inner.register(registry, token, interests)
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.inner.reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        self.inner.deregister(registry)
    }
}
