//! TCP socket setup and teardown.

use std::io;
use std::net::{Shutdown, SocketAddr};
use std::os::fd::{AsFd, OwnedFd};
use std::time::Duration;

use mio::net::{TcpListener, TcpStream};
use rustix::io::Errno;
use rustix::net::{sockopt, AddressFamily, SocketFlags, SocketType};

use crate::tcp::TcpSocketConfig;

fn socket_for(addr: SocketAddr) -> io::Result<OwnedFd> {
    let family = match addr {
        SocketAddr::V4(_) => AddressFamily::INET,
        SocketAddr::V6(_) => AddressFamily::INET6,
    };
    Ok(rustix::net::socket_with(
        family,
        SocketType::STREAM,
        SocketFlags::NONBLOCK | SocketFlags::CLOEXEC,
        None,
    )?)
}

fn set_buffer_sizes<Fd: AsFd>(fd: Fd, config: &TcpSocketConfig) -> io::Result<()> {
    if let Some(size) = config.rcv_buffer_size {
        sockopt::set_socket_recv_buffer_size(&fd, size)?;
    }
    if let Some(size) = config.snd_buffer_size {
        sockopt::set_socket_send_buffer_size(&fd, size)?;
    }
    Ok(())
}

/// Binds a non-blocking listener with `SO_REUSEADDR` and the configured
/// backlog. Buffer sizes set here are inherited by accepted sockets.
pub(crate) fn listen(addr: SocketAddr, config: &TcpSocketConfig) -> io::Result<TcpListener> {
    let fd = socket_for(addr)?;
    sockopt::set_socket_reuseaddr(&fd, true)?;
    set_buffer_sizes(&fd, config)?;
    rustix::net::bind(&fd, &addr)?;
    let backlog = i32::try_from(config.backlog).unwrap_or(i32::MAX);
    rustix::net::listen(&fd, backlog)?;
    Ok(TcpListener::from_std(std::net::TcpListener::from(fd)))
}

/// Starts a non-blocking connect to `remote`, optionally from a fixed local
/// address. Completion is signalled by writability; see [`finish_connect`].
pub(crate) fn connect(remote: SocketAddr, config: &TcpSocketConfig) -> io::Result<TcpStream> {
    let fd = socket_for(remote)?;
    set_buffer_sizes(&fd, config)?;

    if let Some(local) = config.bind_before_connect {
        sockopt::set_socket_reuseaddr(&fd, true)?;
        rustix::net::bind(&fd, &local)?;
    }

    match rustix::net::connect(&fd, &remote) {
        Ok(()) | Err(Errno::INPROGRESS) => {}
        Err(e) => return Err(e.into()),
    }

    Ok(TcpStream::from_std(std::net::TcpStream::from(fd)))
}

/// Checks a connecting stream after a writable event. `Ok(true)` once
/// connected, `Ok(false)` if still in progress.
pub(crate) fn finish_connect(stream: &TcpStream) -> io::Result<bool> {
    if let Some(e) = stream.take_error()? {
        return Err(e);
    }
    match stream.peer_addr() {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
        Err(e) => Err(e),
    }
}

/// Applies per-connection options to a connected or accepted stream.
pub(crate) fn configure(stream: &TcpStream, config: &TcpSocketConfig) -> io::Result<()> {
    stream.set_nodelay(config.tcp_nodelay)?;
    if config.keep_alive {
        sockopt::set_socket_keepalive(stream, true)?;
    }
    set_buffer_sizes(stream, config)
}

/// Half-closes the write side and drops the socket, letting the kernel
/// flush whatever is still queued.
pub(crate) fn close_graceful(stream: TcpStream) {
    let _ = stream.shutdown(Shutdown::Write);
    drop(stream);
}

/// Closes with a zero linger so the peer sees a reset instead of an
/// orderly end of stream.
pub(crate) fn close_abrupt(stream: TcpStream) {
    let _ = sockopt::set_socket_linger(&stream, Some(Duration::ZERO));
    drop(stream);
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::thread;

    use super::*;

    fn localhost() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    fn wait_connected(stream: &TcpStream) {
        for _ in 0..1000 {
            if finish_connect(stream).unwrap() {
                return;
            }
            thread::sleep(Duration::from_millis(1));
        }
        panic!("connect did not complete");
    }

    #[test]
    fn listen_and_connect() {
        let config = TcpSocketConfig::default();
        let listener = listen(localhost(), &config).unwrap();
        let addr = listener.local_addr().unwrap();

        let stream = connect(addr, &config).unwrap();
        wait_connected(&stream);
        configure(&stream, &config).unwrap();
        assert_eq!(stream.peer_addr().unwrap(), addr);
    }

    #[test]
    fn bind_before_connect_sets_source() {
        let listener = std::net::TcpListener::bind(localhost()).unwrap();
        let probe = std::net::TcpListener::bind(localhost()).unwrap();
        let local = probe.local_addr().unwrap();
        drop(probe);

        let config = TcpSocketConfig::default().with_bind_before_connect(local);
        let stream = connect(listener.local_addr().unwrap(), &config).unwrap();
        wait_connected(&stream);

        let (_, peer) = listener.accept().unwrap();
        assert_eq!(peer, local);
    }

    #[test]
    fn graceful_close_delivers_eof() {
        let listener = std::net::TcpListener::bind(localhost()).unwrap();
        let stream = connect(listener.local_addr().unwrap(), &TcpSocketConfig::default()).unwrap();
        wait_connected(&stream);
        let (mut accepted, _) = listener.accept().unwrap();

        (&stream).write_all(b"bye").unwrap();
        close_graceful(stream);

        let mut buf = Vec::new();
        accepted.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"bye");
    }

    #[test]
    fn abrupt_close_resets() {
        let listener = std::net::TcpListener::bind(localhost()).unwrap();
        let stream = connect(listener.local_addr().unwrap(), &TcpSocketConfig::default()).unwrap();
        wait_connected(&stream);
        let (mut accepted, _) = listener.accept().unwrap();

        close_abrupt(stream);

        let mut buf = [0u8; 8];
        let err = accepted.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
    }
}
