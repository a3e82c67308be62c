//! Bound socket of a [`DatagramProxy`](super::DatagramProxy).

use std::any::Any;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use minstant::Instant;
use mio::event::Event;
use mio::{Interest, Token};

use super::outer::Outer;
use super::{DatagramMeters, DatagramProxyConfig};
use crate::buffer::{DatagramQueue, Drain};
use crate::net::{DatagramSocket, Registration};
use crate::reactor::{Core, Handler, HandlerKey};
use crate::throttle;
use crate::trace::{debug, trace, warn};

/// Largest payload a UDP datagram can carry, rounded up.
const MAX_DATAGRAM: usize = 64 * 1024;

/// Demultiplexes datagrams by source address into one [`Outer`] per peer
/// and sends the backend's replies back to their peers.
///
/// Every outer socket's token routes to this handler.
pub(crate) struct Relay {
    socket: DatagramSocket,
    registration: Registration,
    config: Arc<DatagramProxyConfig>,
    meters: DatagramMeters,
    /// Replies waiting to be sent to peers.
    outbound: DatagramQueue,
    outers: HashMap<SocketAddr, Outer>,
    routes: HashMap<Token, SocketAddr>,
    buf: Box<[u8]>,
    send_throttled: bool,
    frozen: bool,
}

impl Relay {
    /// Binds the socket and registers a running relay.
    pub(crate) fn open(
        core: &mut Core,
        config: Arc<DatagramProxyConfig>,
        meters: DatagramMeters,
    ) -> io::Result<(HandlerKey, SocketAddr)> {
        let socket = DatagramSocket::bind(config.bind_addr)?;
        socket.set_buffer_sizes(config.socket.rcv_buffer_size, config.socket.snd_buffer_size)?;
        let local_addr = socket.local_addr()?;

        let key = core.insert(|core, key| {
            let outbound = DatagramQueue::new(
                config.pending_limit,
                throttle::allocate(config.incoming_throttler.as_ref(), local_addr),
            );
            let mut relay = Self {
                socket,
                registration: Registration::new(core.token(key)),
                config,
                meters,
                outbound,
                outers: HashMap::new(),
                routes: HashMap::new(),
                buf: vec![0; MAX_DATAGRAM].into_boxed_slice(),
                send_throttled: false,
                frozen: false,
            };
            if let Err(e) =
                relay
                    .registration
                    .enable(core.registry(), &mut relay.socket, Interest::READABLE)
            {
                core.release_token(relay.registration.token());
                return Err(e);
            }
            Ok(relay)
        })?;

        Ok((key, local_addr))
    }

    /// Closes every peer, deregisters and removes itself.
    pub(crate) fn close(&mut self, core: &mut Core, key: HandlerKey) {
        let _ = self.registration.clear(core.registry(), &mut self.socket);
        core.release_token(self.registration.token());
        self.outbound.clear();

        let peers: Vec<SocketAddr> = self.outers.keys().copied().collect();
        for peer in peers {
            self.close_peer(core, peer);
        }
        core.remove(key);
    }

    pub(crate) fn freeze(&mut self, core: &mut Core) -> io::Result<()> {
        self.frozen = true;
        self.registration.clear(core.registry(), &mut self.socket)?;
        for outer in self.outers.values_mut() {
            outer.freeze(core)?;
        }
        Ok(())
    }

    pub(crate) fn unfreeze(&mut self, core: &mut Core) -> io::Result<()> {
        self.frozen = false;
        for outer in self.outers.values_mut() {
            outer.unfreeze(core)?;
        }
        let interest = if self.outbound.is_empty() || self.send_throttled {
            Interest::READABLE
        } else {
            Interest::READABLE | Interest::WRITABLE
        };
        self.registration
            .enable(core.registry(), &mut self.socket, interest)
    }

    pub(crate) fn clients(&self) -> Vec<SocketAddr> {
        self.outers.keys().copied().collect()
    }

    pub(crate) fn client_meters(&self, peer: SocketAddr) -> Option<DatagramMeters> {
        self.outers.get(&peer).map(|outer| outer.meters().clone())
    }

    /// Closes the relay for `peer`. Returns `false` if there was none.
    pub(crate) fn close_peer(&mut self, core: &mut Core, peer: SocketAddr) -> bool {
        let Some(mut outer) = self.outers.remove(&peer) else {
            return false;
        };
        self.routes.remove(&outer.token());
        outer.close(core);
        if let Some(listener) = &self.config.on_client_deleted {
            listener(peer, outer.meters());
        }
        debug!(%peer, "peer closed");
        true
    }

    /// Closes every peer silent for longer than `threshold`.
    pub(crate) fn close_idle(&mut self, core: &mut Core, threshold: Duration) -> usize {
        let now = Instant::now();
        let idle: Vec<SocketAddr> = self
            .outers
            .iter()
            .filter(|(_, outer)| outer.idle(now) > threshold)
            .map(|(&peer, _)| peer)
            .collect();

        let before = self.outers.len();
        for &peer in &idle {
            self.close_peer(core, peer);
        }
        if !idle.is_empty() {
            debug!(before, after = self.outers.len(), "idle peers evicted");
        }
        idle.len()
    }

    fn admit(
        &mut self,
        core: &mut Core,
        key: HandlerKey,
        peer: SocketAddr,
        now: Instant,
    ) -> io::Result<bool> {
        if self.outers.contains_key(&peer) {
            return Ok(true);
        }
        if let Some(admission) = &self.config.admission {
            if !admission(peer) {
                trace!(%peer, "datagram rejected by admission filter");
                return Ok(false);
            }
        }
        if let Some(max_idle) = self.config.max_idle {
            self.close_idle(core, max_idle);
        }

        let token = core.token(key);
        let outer = match Outer::open(core, token, &self.config, peer, now) {
            Ok(outer) => outer,
            Err(e) => {
                core.release_token(token);
                return Err(e);
            }
        };
        self.routes.insert(token, peer);
        self.outers.insert(peer, outer);

        if let Some(listener) = &self.config.on_client_created {
            listener(peer);
        }
        debug!(%peer, peers = self.outers.len(), "peer created");
        Ok(true)
    }

    /// Receives from peers until the socket would block and hands each
    /// datagram to its peer's outer relay.
    fn on_readable(&mut self, core: &mut Core, key: HandlerKey) -> io::Result<()> {
        while !self.frozen {
            let (n, peer) = match self.socket.recv_from(&mut self.buf) {
                Ok(received) => received,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => continue,
                Err(e) => return Err(e),
            };
            let now = Instant::now();
            self.meters.bytes.read.update(n as u64);
            self.meters.packets.read.update(1);
            trace!(%peer, bytes = n, "received from peer");

            match self.admit(core, key, peer, now) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    warn!(%peer, error = %e, "failed to open peer relay, datagram dropped");
                    continue;
                }
            }
            let Some(outer) = self.outers.get_mut(&peer) else {
                continue;
            };
            if outer.enqueue(now, self.buf[..n].to_vec()) {
                let flushed = outer.flush(core, now);
                self.settle_peer(core, key, peer, flushed);
            }
        }
        Ok(())
    }

    /// Sends queued replies until the socket would block or the head is
    /// throttled.
    fn on_writable(&mut self, core: &mut Core, key: HandlerKey) -> io::Result<()> {
        if self.frozen || self.send_throttled {
            return Ok(());
        }
        loop {
            let socket = &self.socket;
            let sent = self
                .outbound
                .send_with(Instant::now(), |peer, data| socket.send_to(data, peer));
            match sent {
                Ok(Drain::Written(n)) => {
                    self.meters.bytes.sent.update(n as u64);
                    self.meters.packets.sent.update(1);
                }
                Ok(Drain::Delayed(delay)) => {
                    self.send_throttled = true;
                    self.registration
                        .disable(core.registry(), &mut self.socket, Interest::WRITABLE)?;
                    core.schedule_for::<Self, _>(key, delay, move |relay, core| {
                        relay.send_throttled = false;
                        if let Err(e) = relay.on_writable(core, key) {
                            warn!(error = %e, "send to peer failed");
                        }
                    });
                    return Ok(());
                }
                Ok(Drain::Idle) => {
                    return self
                        .registration
                        .disable(core.registry(), &mut self.socket, Interest::WRITABLE);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return self
                        .registration
                        .enable(core.registry(), &mut self.socket, Interest::WRITABLE);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    // The peer address is unusable; later replies may not be.
                    debug!(error = %e, "send to peer failed, datagram dropped");
                    self.outbound.discard();
                }
            }
        }
    }

    /// Applies the outcome of an outer flush: schedules the throttle timer,
    /// or drops the peer on a hard error.
    fn settle_peer(
        &mut self,
        core: &mut Core,
        key: HandlerKey,
        peer: SocketAddr,
        flushed: io::Result<Option<Duration>>,
    ) {
        match flushed {
            Ok(None) => {}
            Ok(Some(delay)) => {
                core.schedule_for::<Self, _>(key, delay, move |relay, core| {
                    relay.unthrottle_peer(core, key, peer);
                });
            }
            Err(e) => {
                warn!(%peer, error = %e, "peer relay failed");
                self.close_peer(core, peer);
            }
        }
    }

    fn unthrottle_peer(&mut self, core: &mut Core, key: HandlerKey, peer: SocketAddr) {
        let Some(outer) = self.outers.get_mut(&peer) else {
            return;
        };
        outer.unthrottle();
        let flushed = outer.flush(core, Instant::now());
        self.settle_peer(core, key, peer, flushed);
    }

    fn on_peer_event(&mut self, core: &mut Core, key: HandlerKey, peer: SocketAddr, event: &Event) {
        let now = Instant::now();
        let Some(outer) = self.outers.get_mut(&peer) else {
            return;
        };

        if event.is_writable() {
            let flushed = outer.flush(core, now);
            self.settle_peer(core, key, peer, flushed);
        }

        let Some(outer) = self.outers.get_mut(&peer) else {
            return;
        };
        if event.is_readable() || event.is_error() {
            match outer.receive(now, &mut self.buf, &mut self.outbound) {
                Ok(0) => {}
                Ok(_) => {
                    if let Err(e) = self.on_writable(core, key) {
                        warn!(error = %e, "send to peer failed");
                    }
                }
                Err(e) => {
                    warn!(%peer, error = %e, "peer relay failed");
                    self.close_peer(core, peer);
                }
            }
        }
    }
}

impl Handler for Relay {
    fn ready(&mut self, core: &mut Core, key: HandlerKey, event: &Event) -> io::Result<()> {
        let token = event.token();
        if token != self.registration.token() {
            if let Some(&peer) = self.routes.get(&token) {
                self.on_peer_event(core, key, peer, event);
            }
            return Ok(());
        }

        if event.is_readable() {
            self.on_readable(core, key)?;
        }
        if event.is_writable() {
            self.on_writable(core, key)?;
        }
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
