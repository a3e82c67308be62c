//! One relayed client connection.
//!
//! A [`TcpPair`] owns the client-facing (inner) and backend-facing (outer)
//! streams. Each half owns the queue of bytes waiting to be written to its
//! own socket, so reading from one half fills the other half's queue:
//!
//! ```text
//!   client ─read─▶ inner ──▶ outer.incoming ─write─▶ backend
//!   client ◀write─ inner.incoming ◀── outer ◀─read─ backend
//! ```
//!
//! Events are edge-triggered: every read and write loops until the socket
//! would block, and re-enabling an interest re-arms it.

use std::any::Any;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::sync::Arc;

use minstant::Instant;
use mio::event::Event;
use mio::net::TcpStream;
use mio::{Interest, Token};

use super::acceptor::Acceptor;
use super::{TcpPairMeters, TcpProxyConfig, LINGER};
use crate::buffer::{BufferQueue, Drain};
use crate::filter;
use crate::meter::RateMeters;
use crate::net::{self, Registration};
use crate::reactor::{Core, Handler, HandlerKey};
use crate::throttle;
use crate::trace::{debug, error, trace, warn};

/// Everything a pair inherits from the acceptor that spawned it.
pub(crate) struct PairContext {
    pub owner: HandlerKey,
    pub config: Arc<TcpProxyConfig>,
    pub global: RateMeters,
    pub meters: TcpPairMeters,
    pub frozen: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Inner,
    Outer,
}

impl Side {
    const fn index(self) -> usize {
        match self {
            Self::Inner => 0,
            Self::Outer => 1,
        }
    }

    const fn other(self) -> Self {
        match self {
            Self::Inner => Self::Outer,
            Self::Outer => Self::Inner,
        }
    }

    const fn name(self) -> &'static str {
        match self {
            Self::Inner => "inner",
            Self::Outer => "outer",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HalfState {
    Frozen,
    Open,
    Closed,
}

struct ChannelHalf {
    stream: Option<TcpStream>,
    registration: Registration,
    /// Bytes waiting to be written to `stream`.
    incoming: BufferQueue,
    meters: RateMeters,
    global: RateMeters,
    state: HalfState,
    read_eof: bool,
    send_throttled: bool,
    /// The peer half hit end of stream; shut down writes once drained.
    shutdown_pending: bool,
    write_shut: bool,
}

impl ChannelHalf {
    fn new(
        stream: TcpStream,
        token: Token,
        incoming: BufferQueue,
        meters: RateMeters,
        global: RateMeters,
    ) -> Self {
        Self {
            stream: Some(stream),
            registration: Registration::new(token),
            incoming,
            meters,
            global,
            state: HalfState::Frozen,
            read_eof: false,
            send_throttled: false,
            shutdown_pending: false,
            write_shut: false,
        }
    }

    fn enable(&mut self, core: &Core, interest: Interest) -> io::Result<()> {
        match self.stream.as_mut() {
            Some(stream) => self.registration.enable(core.registry(), stream, interest),
            None => Ok(()),
        }
    }

    fn disable(&mut self, core: &Core, interest: Interest) -> io::Result<()> {
        match self.stream.as_mut() {
            Some(stream) => self.registration.disable(core.registry(), stream, interest),
            None => Ok(()),
        }
    }

    fn clear(&mut self, core: &Core) -> io::Result<()> {
        match self.stream.as_mut() {
            Some(stream) => self.registration.clear(core.registry(), stream),
            None => Ok(()),
        }
    }

    fn freeze(&mut self, core: &Core) -> io::Result<()> {
        if self.state != HalfState::Open {
            return Ok(());
        }
        self.state = HalfState::Frozen;
        self.clear(core)
    }

    fn unfreeze(&mut self, core: &Core) -> io::Result<()> {
        if self.state != HalfState::Frozen {
            return Ok(());
        }
        self.state = HalfState::Open;
        if !self.read_eof {
            self.enable(core, Interest::READABLE)?;
        }
        if self.incoming.has_readable() && !self.send_throttled && !self.write_shut {
            self.enable(core, Interest::WRITABLE)?;
        }
        Ok(())
    }

    fn shutdown_write(&mut self) {
        if self.write_shut {
            return;
        }
        if let Some(stream) = &self.stream {
            let _ = stream.shutdown(Shutdown::Write);
        }
        self.write_shut = true;
        self.shutdown_pending = false;
    }

    fn record_read(&self, n: usize) {
        self.meters.read.update(n as u64);
        self.global.read.update(n as u64);
    }

    fn record_sent(&self, n: usize) {
        self.meters.sent.update(n as u64);
        self.global.sent.update(n as u64);
    }

    /// Closes gracefully when anything was sent through this half and
    /// abruptly otherwise, unless `abrupt` forces a reset.
    fn close(&mut self, core: &mut Core, abrupt: bool) {
        if self.state == HalfState::Closed {
            return;
        }
        self.state = HalfState::Closed;
        if let Some(mut stream) = self.stream.take() {
            let _ = self.registration.clear(core.registry(), &mut stream);
            if abrupt || self.meters.sent.total_count() == 0 {
                net::close_abrupt(stream);
            } else {
                net::close_graceful(stream);
            }
        }
        core.release_token(self.registration.token());
        self.incoming.reset();
    }
}

/// Handler relaying one client connection to the backend.
pub(crate) struct TcpPair {
    halves: [ChannelHalf; 2],
    owner: HandlerKey,
    client_addr: SocketAddr,
    config: Arc<TcpProxyConfig>,
    meters: TcpPairMeters,
    connected: bool,
    frozen: bool,
    closing_scheduled: bool,
    closed: bool,
}

impl TcpPair {
    /// Builds a pair whose backend connect is in flight. The outer half
    /// waits for writability; both halves stay frozen until connected.
    pub(crate) fn connecting(
        core: &mut Core,
        key: HandlerKey,
        context: PairContext,
        client: TcpStream,
        client_addr: SocketAddr,
        backend: TcpStream,
    ) -> io::Result<Self> {
        let PairContext {
            owner,
            config,
            global,
            meters,
            frozen,
        } = context;

        let to_client = BufferQueue::new(
            &config.buffers,
            filter::allocate(config.incoming_filter.as_ref(), client_addr),
            throttle::allocate(config.incoming_throttler.as_ref(), client_addr),
        );
        let to_backend = BufferQueue::new(
            &config.buffers,
            filter::allocate(config.outgoing_filter.as_ref(), client_addr),
            throttle::allocate(config.outgoing_throttler.as_ref(), client_addr),
        );

        let inner_token = core.token(key);
        let outer_token = core.token(key);
        let mut pair = Self {
            halves: [
                ChannelHalf::new(
                    client,
                    inner_token,
                    to_client,
                    meters.inner.clone(),
                    global.clone(),
                ),
                ChannelHalf::new(backend, outer_token, to_backend, meters.outer.clone(), global),
            ],
            owner,
            client_addr,
            config,
            meters,
            connected: false,
            frozen,
            closing_scheduled: false,
            closed: false,
        };

        if !frozen {
            if let Err(e) = pair.half_mut(Side::Outer).enable(core, Interest::WRITABLE) {
                core.release_token(inner_token);
                core.release_token(outer_token);
                return Err(e);
            }
        }

        core.schedule_for::<Self, _>(key, pair.config.socket.connect_timeout, move |pair, core| {
            if !pair.connected && !pair.closed {
                warn!(
                    client = %pair.client_addr,
                    connect_addr = %pair.config.connect_addr,
                    "backend connect timed out"
                );
                pair.abort(core, key);
            }
        });

        Ok(pair)
    }

    fn half_mut(&mut self, side: Side) -> &mut ChannelHalf {
        &mut self.halves[side.index()]
    }

    /// Returns `(side, side.other())`.
    fn split(&mut self, side: Side) -> (&mut ChannelHalf, &mut ChannelHalf) {
        let [inner, outer] = &mut self.halves;
        match side {
            Side::Inner => (inner, outer),
            Side::Outer => (outer, inner),
        }
    }

    fn side_of(&self, token: Token) -> Side {
        if token == self.halves[Side::Inner.index()].registration.token() {
            Side::Inner
        } else {
            Side::Outer
        }
    }

    pub(crate) fn freeze(&mut self, core: &mut Core, key: HandlerKey) {
        if self.closed || self.frozen {
            return;
        }
        self.frozen = true;
        let result = if self.connected {
            self.halves.iter_mut().try_for_each(|half| half.freeze(core))
        } else {
            self.half_mut(Side::Outer).clear(core)
        };
        if let Err(e) = result {
            self.fail(core, key, Side::Inner, &e);
        }
    }

    pub(crate) fn unfreeze(&mut self, core: &mut Core, key: HandlerKey) {
        if self.closed || !self.frozen {
            return;
        }
        self.frozen = false;
        let result = if self.connected {
            self.halves.iter_mut().try_for_each(|half| half.unfreeze(core))
        } else {
            self.half_mut(Side::Outer).enable(core, Interest::WRITABLE)
        };
        if let Err(e) = result {
            self.fail(core, key, Side::Inner, &e);
        }
    }

    fn on_connect_event(&mut self, core: &mut Core, key: HandlerKey) {
        let Some(stream) = self.halves[Side::Outer.index()].stream.as_ref() else {
            return;
        };
        match net::finish_connect(stream) {
            Ok(false) => {}
            Ok(true) => {
                if let Err(e) = self.on_connected(core) {
                    self.fail(core, key, Side::Outer, &e);
                }
            }
            Err(e) => {
                warn!(
                    client = %self.client_addr,
                    connect_addr = %self.config.connect_addr,
                    error = %e,
                    "backend connect failed"
                );
                self.abort(core, key);
            }
        }
    }

    fn on_connected(&mut self, core: &mut Core) -> io::Result<()> {
        self.connected = true;
        let outer = &mut self.halves[Side::Outer.index()];
        outer.clear(core)?;
        if let Some(stream) = &outer.stream {
            net::configure(stream, &self.config.socket)?;
        }
        debug!(client = %self.client_addr, connect_addr = %self.config.connect_addr, "backend connected");

        if let Some(listener) = &self.config.on_client_created {
            listener(self.client_addr);
        }

        if !self.frozen {
            for half in &mut self.halves {
                half.unfreeze(core)?;
            }
        }
        Ok(())
    }

    /// Reads from `side` into the other half's queue until the socket would
    /// block, the queue fills up or the peer ends the stream.
    fn on_readable(&mut self, core: &mut Core, key: HandlerKey, side: Side) -> io::Result<()> {
        loop {
            let (this, other) = self.split(side);
            if this.state != HalfState::Open || this.read_eof {
                return Ok(());
            }
            if !other.incoming.has_writable() {
                // Re-enabled by `after_write` once the other half drains.
                return this.disable(core, Interest::READABLE);
            }
            let Some(stream) = this.stream.as_ref() else {
                return Ok(());
            };

            let read = other.incoming.fill_with(Instant::now(), |bufs| {
                let mut stream = stream;
                stream.read_vectored(bufs)
            });
            match read {
                Ok(0) => return self.on_eof(core, key, side),
                Ok(n) => {
                    this.record_read(n);
                    trace!(client = %self.client_addr, side = side.name(), bytes = n, "read");
                    self.on_writable(core, key, side.other())?;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// Writes the ready prefix of `side`'s queue to its socket.
    fn on_writable(&mut self, core: &mut Core, key: HandlerKey, side: Side) -> io::Result<()> {
        loop {
            let this = self.half_mut(side);
            if this.state != HalfState::Open || this.send_throttled || this.write_shut {
                break;
            }
            let Some(stream) = this.stream.as_ref() else {
                break;
            };

            let drained = this.incoming.drain_with(Instant::now(), |bufs| {
                let mut stream = stream;
                stream.write_vectored(bufs)
            });
            match drained {
                Ok(Drain::Written(0)) => {
                    this.enable(core, Interest::WRITABLE)?;
                    break;
                }
                Ok(Drain::Written(n)) => {
                    this.record_sent(n);
                    trace!(client = %self.client_addr, side = side.name(), bytes = n, "sent");
                }
                Ok(Drain::Delayed(delay)) => {
                    this.send_throttled = true;
                    this.disable(core, Interest::WRITABLE)?;
                    trace!(client = %self.client_addr, side = side.name(), ?delay, "throttled");
                    core.schedule_for::<Self, _>(key, delay, move |pair, core| {
                        pair.unthrottle(core, key, side);
                    });
                    break;
                }
                Ok(Drain::Idle) => {
                    this.disable(core, Interest::WRITABLE)?;
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    this.enable(core, Interest::WRITABLE)?;
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        self.after_write(core, key, side)
    }

    fn after_write(&mut self, core: &mut Core, key: HandlerKey, side: Side) -> io::Result<()> {
        let (this, other) = self.split(side);
        // `other` reads into `this.incoming`.
        if other.state == HalfState::Open
            && !other.read_eof
            && this.incoming.has_writable()
            && !other.registration.is_enabled(Interest::READABLE)
        {
            other.enable(core, Interest::READABLE)?;
        }
        if this.shutdown_pending && !this.incoming.has_readable() {
            this.shutdown_write();
            debug!(client = %self.client_addr, side = side.name(), "write side shut down");
        }
        self.check_drained(core, key);
        Ok(())
    }

    fn on_eof(&mut self, core: &mut Core, key: HandlerKey, side: Side) -> io::Result<()> {
        let (this, other) = self.split(side);
        this.read_eof = true;
        this.disable(core, Interest::READABLE)?;
        other.shutdown_pending = true;
        if !other.incoming.has_readable() {
            other.shutdown_write();
        }
        debug!(client = %self.client_addr, side = side.name(), "end of stream");
        self.check_drained(core, key);
        Ok(())
    }

    /// Schedules the close once both directions reached end of stream and
    /// nothing is left to write.
    fn check_drained(&mut self, core: &mut Core, key: HandlerKey) {
        if self.closing_scheduled {
            return;
        }
        let drained = self
            .halves
            .iter()
            .all(|half| half.read_eof && !half.incoming.has_readable());
        if drained {
            self.closing_scheduled = true;
            debug!(client = %self.client_addr, ?LINGER, "both directions finished");
            core.schedule_for::<Self, _>(key, LINGER, move |pair, core| pair.close(core, key));
        }
    }

    fn unthrottle(&mut self, core: &mut Core, key: HandlerKey, side: Side) {
        let half = self.half_mut(side);
        if half.state == HalfState::Closed || !half.send_throttled {
            return;
        }
        half.send_throttled = false;
        if half.state == HalfState::Open && half.incoming.has_readable() {
            if let Err(e) = self.on_writable(core, key, side) {
                self.fail(core, key, side, &e);
            }
        }
    }

    fn fail(&mut self, core: &mut Core, key: HandlerKey, side: Side, e: &io::Error) {
        if net::is_peer_closed(e) {
            debug!(client = %self.client_addr, side = side.name(), error = %e, "peer closed connection");
        } else {
            error!(client = %self.client_addr, side = side.name(), error = %e, "relay failed");
        }
        self.close(core, key);
    }

    /// Closes both halves and removes the pair. Idempotent.
    pub(crate) fn close(&mut self, core: &mut Core, key: HandlerKey) {
        self.shutdown(core, key, false);
    }

    /// Like [`close`](Self::close) but resets both sockets.
    fn abort(&mut self, core: &mut Core, key: HandlerKey) {
        self.shutdown(core, key, true);
    }

    fn shutdown(&mut self, core: &mut Core, key: HandlerKey, abrupt: bool) {
        if self.closed {
            return;
        }
        self.closed = true;
        for half in &mut self.halves {
            half.close(core, abrupt);
        }
        core.remove(key);
        core.with_handler::<Acceptor, _, _>(self.owner, |acceptor, _| acceptor.forget(key));

        if self.connected {
            if let Some(listener) = &self.config.on_client_deleted {
                listener(self.client_addr, &self.meters);
            }
        }
        debug!(client = %self.client_addr, abrupt, "client closed");
    }
}

impl Handler for TcpPair {
    fn ready(&mut self, core: &mut Core, key: HandlerKey, event: &Event) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        let side = self.side_of(event.token());
        if !self.connected {
            if side == Side::Outer {
                self.on_connect_event(core, key);
            }
            return Ok(());
        }

        let mut result = Ok(());
        if event.is_readable() || event.is_read_closed() || event.is_error() {
            result = self.on_readable(core, key, side);
        }
        if result.is_ok() && !self.closed && (event.is_writable() || event.is_write_closed()) {
            result = self.on_writable(core, key, side);
        }
        if let Err(e) = result {
            self.fail(core, key, side, &e);
        }
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
