//! Socket plumbing for the relays.
//!
//! mio provides the non-blocking sockets and readiness registration; rustix
//! fills in the socket options and setup steps mio does not expose
//! (listen backlog, bind-before-connect, linger).

mod interest;
mod socket;
mod stream;

use std::io;

pub(crate) use interest::Registration;
pub use socket::DatagramSocket;
pub(crate) use stream::{close_abrupt, close_graceful, configure, connect, finish_connect, listen};

/// Returns `true` for errors meaning the peer already closed the
/// connection. These end a relay quietly.
pub(crate) fn is_peer_closed(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_peer_closed_errors() {
        for kind in [
            io::ErrorKind::BrokenPipe,
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::ConnectionAborted,
            io::ErrorKind::NotConnected,
        ] {
            assert!(is_peer_closed(&kind.into()), "{kind:?}");
        }
        assert!(!is_peer_closed(&io::ErrorKind::PermissionDenied.into()));
        assert!(!is_peer_closed(&io::ErrorKind::WouldBlock.into()));
    }
}
