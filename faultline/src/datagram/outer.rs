//! Per-peer relay socket connected to the backend.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use minstant::Instant;
use mio::{Interest, Token};

use super::{DatagramMeters, DatagramProxyConfig};
use crate::buffer::{DatagramQueue, Drain};
use crate::filter::{self, PassFilter, TransformFilter};
use crate::net::{DatagramSocket, Registration};
use crate::reactor::Core;
use crate::throttle;
use crate::trace::{debug, trace};

/// One remote peer of the relay. Datagrams from the peer are queued here
/// and sent to the backend from a socket dedicated to that peer; replies
/// are handed back to the relay for delivery.
pub(crate) struct Outer {
    peer: SocketAddr,
    socket: DatagramSocket,
    registration: Registration,
    /// Datagrams waiting to be sent to the backend.
    queue: DatagramQueue,
    outgoing_filter: Option<Box<dyn TransformFilter>>,
    outgoing_pass: Option<Box<dyn PassFilter>>,
    incoming_filter: Option<Box<dyn TransformFilter>>,
    incoming_pass: Option<Box<dyn PassFilter>>,
    meters: DatagramMeters,
    last_activity: Instant,
    send_throttled: bool,
    frozen: bool,
}

impl Outer {
    /// Connects a fresh socket to the backend and starts receiving.
    pub(crate) fn open(
        core: &Core,
        token: Token,
        config: &DatagramProxyConfig,
        peer: SocketAddr,
        now: Instant,
    ) -> io::Result<Self> {
        let socket = DatagramSocket::connect(config.connect_addr, config.socket.bind_before_connect)?;
        socket.set_buffer_sizes(config.socket.rcv_buffer_size, config.socket.snd_buffer_size)?;

        let mut outer = Self {
            peer,
            socket,
            registration: Registration::new(token),
            queue: DatagramQueue::new(
                config.pending_limit,
                throttle::allocate(config.outgoing_throttler.as_ref(), peer),
            ),
            outgoing_filter: filter::allocate(config.outgoing_filter.as_ref(), peer),
            outgoing_pass: filter::allocate_pass(config.outgoing_pass_filter.as_ref(), peer),
            incoming_filter: filter::allocate(config.incoming_filter.as_ref(), peer),
            incoming_pass: filter::allocate_pass(config.incoming_pass_filter.as_ref(), peer),
            meters: DatagramMeters::default(),
            last_activity: now,
            send_throttled: false,
            frozen: true,
        };
        outer.unfreeze(core)?;
        Ok(outer)
    }

    pub(crate) fn token(&self) -> Token {
        self.registration.token()
    }

    pub(crate) fn meters(&self) -> &DatagramMeters {
        &self.meters
    }

    /// Time since the peer or the backend last sent anything.
    pub(crate) fn idle(&self, now: Instant) -> Duration {
        now.checked_duration_since(self.last_activity)
            .unwrap_or_default()
    }

    pub(crate) fn freeze(&mut self, core: &Core) -> io::Result<()> {
        if self.frozen {
            return Ok(());
        }
        self.frozen = true;
        self.registration.clear(core.registry(), &mut self.socket)
    }

    pub(crate) fn unfreeze(&mut self, core: &Core) -> io::Result<()> {
        if !self.frozen {
            return Ok(());
        }
        self.frozen = false;
        let interest = if self.queue.is_empty() || self.send_throttled {
            Interest::READABLE
        } else {
            Interest::READABLE | Interest::WRITABLE
        };
        self.registration
            .enable(core.registry(), &mut self.socket, interest)
    }

    /// Filters a datagram from the peer and queues it for the backend.
    /// Returns `true` if it was queued.
    pub(crate) fn enqueue(&mut self, now: Instant, mut data: Vec<u8>) -> bool {
        self.last_activity = now;
        if let Some(pass) = self.outgoing_pass.as_mut() {
            if !pass.check(&data) {
                trace!(peer = %self.peer, len = data.len(), "outgoing datagram filtered out");
                return false;
            }
        }
        let kept = filter::apply(self.outgoing_filter.as_mut(), &mut data);
        data.truncate(kept);
        self.queue.push(now, self.peer, data)
    }

    /// Sends queued datagrams until the socket would block or the head is
    /// throttled. Returns the throttle delay, if any.
    pub(crate) fn flush(&mut self, core: &Core, now: Instant) -> io::Result<Option<Duration>> {
        if self.frozen || self.send_throttled {
            return Ok(None);
        }
        loop {
            let socket = &self.socket;
            let sent = self.queue.send_with(now, |_, data| socket.send(data));
            match sent {
                Ok(Drain::Written(n)) => {
                    self.meters.bytes.sent.update(n as u64);
                    self.meters.packets.sent.update(1);
                    trace!(peer = %self.peer, bytes = n, "sent to backend");
                }
                Ok(Drain::Delayed(delay)) => {
                    self.send_throttled = true;
                    self.registration
                        .disable(core.registry(), &mut self.socket, Interest::WRITABLE)?;
                    return Ok(Some(delay));
                }
                Ok(Drain::Idle) => {
                    self.registration
                        .disable(core.registry(), &mut self.socket, Interest::WRITABLE)?;
                    return Ok(None);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.registration
                        .enable(core.registry(), &mut self.socket, Interest::WRITABLE)?;
                    return Ok(None);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                    // Reported for an earlier datagram; this one is lost too.
                    debug!(peer = %self.peer, error = %e, "backend refused datagram");
                    self.queue.discard();
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Clears the throttle flag set by [`flush`](Self::flush).
    pub(crate) fn unthrottle(&mut self) {
        self.send_throttled = false;
    }

    /// Receives backend replies until the socket would block and queues
    /// them on `outbound` for delivery to the peer.
    pub(crate) fn receive(
        &mut self,
        now: Instant,
        buf: &mut [u8],
        outbound: &mut DatagramQueue,
    ) -> io::Result<usize> {
        let mut queued = 0;
        while !self.frozen {
            let n = match self.socket.recv(buf) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                    debug!(peer = %self.peer, error = %e, "backend unreachable");
                    continue;
                }
                Err(e) => return Err(e),
            };
            self.last_activity = now;
            self.meters.bytes.read.update(n as u64);
            self.meters.packets.read.update(1);
            trace!(peer = %self.peer, bytes = n, "received from backend");

            let data = &mut buf[..n];
            if let Some(pass) = self.incoming_pass.as_mut() {
                if !pass.check(data) {
                    trace!(peer = %self.peer, len = n, "incoming datagram filtered out");
                    continue;
                }
            }
            let kept = filter::apply(self.incoming_filter.as_mut(), data);
            if outbound.push(now, self.peer, data[..kept].to_vec()) {
                queued += 1;
            }
        }
        Ok(queued)
    }

    /// Deregisters and releases the token. The socket closes on drop.
    pub(crate) fn close(&mut self, core: &mut Core) {
        let _ = self.registration.clear(core.registry(), &mut self.socket);
        core.release_token(self.registration.token());
        self.queue.clear();
        self.frozen = true;
    }
}
