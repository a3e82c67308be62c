//! UDP fault-injecting proxy.
//!
//! A [`DatagramProxy`] binds one socket and relays every datagram it
//! receives to a fixed backend. Each distinct source address gets its own
//! connected socket towards the backend (an *outer* relay), so replies can
//! be routed back to the right peer. Outer relays are created on the first
//! datagram from a peer and removed on request or after going idle.
//!
//! Direction naming: *outgoing* is peer → backend, *incoming* is
//! backend → peer.

mod outer;
mod relay;

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use relay::Relay;

use crate::buffer::DEFAULT_PENDING_LIMIT;
use crate::error::{Error, Result};
use crate::filter::{AdmissionFilter, PassFilterFactory, TransformFilterFactory};
use crate::meter::RateMeters;
use crate::proxy::{ClientCreated, ClientDeleted, ProxyState, Transition};
use crate::reactor::{Core, HandlerKey, Reactor};
use crate::throttle::ThrottlerFactory;
use crate::trace::{debug, info, warn};

/// Socket options for the bound socket and the per-peer sockets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DatagramSocketConfig {
    /// `SO_RCVBUF`; `None` keeps the system default.
    pub rcv_buffer_size: Option<usize>,
    /// `SO_SNDBUF`; `None` keeps the system default.
    pub snd_buffer_size: Option<usize>,
    /// Local address for per-peer sockets. Only one peer can be served
    /// when this names a fixed port.
    pub bind_before_connect: Option<SocketAddr>,
}

impl DatagramSocketConfig {
    /// Builder-style setter for `SO_RCVBUF`.
    #[must_use]
    pub const fn with_rcv_buffer_size(mut self, size: usize) -> Self {
        self.rcv_buffer_size = Some(size);
        self
    }

    /// Builder-style setter for `SO_SNDBUF`.
    #[must_use]
    pub const fn with_snd_buffer_size(mut self, size: usize) -> Self {
        self.snd_buffer_size = Some(size);
        self
    }

    /// Builder-style setter for the per-peer local address.
    #[must_use]
    pub const fn with_bind_before_connect(mut self, addr: SocketAddr) -> Self {
        self.bind_before_connect = Some(addr);
        self
    }
}

/// Byte and packet meters of one side of the relay.
///
/// For a peer, `read` counts backend → proxy and `sent` proxy → backend.
/// For the bound socket, `read` counts peers → proxy and `sent`
/// proxy → peers.
#[derive(Debug, Clone, Default)]
pub struct DatagramMeters {
    /// Payload bytes.
    pub bytes: RateMeters,
    /// Whole datagrams, including empty ones.
    pub packets: RateMeters,
}

/// Configuration of a [`DatagramProxy`].
#[derive(Clone)]
pub struct DatagramProxyConfig {
    /// Address peers send to.
    pub bind_addr: SocketAddr,
    /// Backend address.
    pub connect_addr: SocketAddr,
    /// Socket options.
    pub socket: DatagramSocketConfig,
    /// Most datagrams queued per direction before the newest is dropped.
    pub pending_limit: usize,
    /// Peers silent for longer are evicted when a new peer arrives.
    pub max_idle: Option<Duration>,
    /// Rewrites backend → peer datagrams.
    pub incoming_filter: Option<TransformFilterFactory>,
    /// Rewrites peer → backend datagrams.
    pub outgoing_filter: Option<TransformFilterFactory>,
    /// Drops backend → peer datagrams.
    pub incoming_pass_filter: Option<PassFilterFactory>,
    /// Drops peer → backend datagrams.
    pub outgoing_pass_filter: Option<PassFilterFactory>,
    /// Throttles every reply sent from the bound socket. Created once per
    /// open, keyed by the bound address.
    pub incoming_throttler: Option<ThrottlerFactory>,
    /// Throttles datagrams to the backend, one instance per peer.
    pub outgoing_throttler: Option<ThrottlerFactory>,
    /// Decides whether a new peer is relayed.
    pub admission: Option<AdmissionFilter>,
    /// Fired when a peer's relay is created.
    pub on_client_created: Option<ClientCreated>,
    /// Fired when a peer's relay is closed.
    pub on_client_deleted: Option<ClientDeleted<DatagramMeters>>,
}

impl std::fmt::Debug for DatagramProxyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatagramProxyConfig")
            .field("bind_addr", &self.bind_addr)
            .field("connect_addr", &self.connect_addr)
            .field("socket", &self.socket)
            .field("pending_limit", &self.pending_limit)
            .field("max_idle", &self.max_idle)
            .finish_non_exhaustive()
    }
}

impl DatagramProxyConfig {
    /// Relays `bind_addr` to `connect_addr` with default options.
    #[must_use]
    pub fn new(bind_addr: SocketAddr, connect_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            connect_addr,
            socket: DatagramSocketConfig::default(),
            pending_limit: DEFAULT_PENDING_LIMIT,
            max_idle: None,
            incoming_filter: None,
            outgoing_filter: None,
            incoming_pass_filter: None,
            outgoing_pass_filter: None,
            incoming_throttler: None,
            outgoing_throttler: None,
            admission: None,
            on_client_created: None,
            on_client_deleted: None,
        }
    }

    /// Builder-style setter for socket options.
    #[must_use]
    pub fn with_socket(mut self, socket: DatagramSocketConfig) -> Self {
        self.socket = socket;
        self
    }

    /// Builder-style setter for the per-queue datagram limit.
    #[must_use]
    pub fn with_pending_limit(mut self, limit: usize) -> Self {
        self.pending_limit = limit;
        self
    }

    /// Builder-style setter for the idle eviction threshold.
    #[must_use]
    pub fn with_max_idle(mut self, max_idle: Duration) -> Self {
        self.max_idle = Some(max_idle);
        self
    }

    /// Builder-style setter for the backend → peer filter.
    #[must_use]
    pub fn with_incoming_filter(mut self, factory: TransformFilterFactory) -> Self {
        self.incoming_filter = Some(factory);
        self
    }

    /// Builder-style setter for the peer → backend filter.
    #[must_use]
    pub fn with_outgoing_filter(mut self, factory: TransformFilterFactory) -> Self {
        self.outgoing_filter = Some(factory);
        self
    }

    /// Builder-style setter for the backend → peer pass filter.
    #[must_use]
    pub fn with_incoming_pass_filter(mut self, factory: PassFilterFactory) -> Self {
        self.incoming_pass_filter = Some(factory);
        self
    }

    /// Builder-style setter for the peer → backend pass filter.
    #[must_use]
    pub fn with_outgoing_pass_filter(mut self, factory: PassFilterFactory) -> Self {
        self.outgoing_pass_filter = Some(factory);
        self
    }

    /// Builder-style setter for the backend → peer throttler.
    #[must_use]
    pub fn with_incoming_throttler(mut self, factory: ThrottlerFactory) -> Self {
        self.incoming_throttler = Some(factory);
        self
    }

    /// Builder-style setter for the peer → backend throttler.
    #[must_use]
    pub fn with_outgoing_throttler(mut self, factory: ThrottlerFactory) -> Self {
        self.outgoing_throttler = Some(factory);
        self
    }

    /// Builder-style setter for the admission filter.
    #[must_use]
    pub fn with_admission(mut self, admission: AdmissionFilter) -> Self {
        self.admission = Some(admission);
        self
    }

    /// Builder-style setter for the creation listener.
    #[must_use]
    pub fn with_on_client_created(mut self, listener: ClientCreated) -> Self {
        self.on_client_created = Some(listener);
        self
    }

    /// Builder-style setter for the deletion listener.
    #[must_use]
    pub fn with_on_client_deleted(mut self, listener: ClientDeleted<DatagramMeters>) -> Self {
        self.on_client_deleted = Some(listener);
        self
    }
}

#[derive(Debug)]
struct Lifecycle {
    state: ProxyState,
    relay: Option<HandlerKey>,
    local_addr: Option<SocketAddr>,
}

/// UDP proxy handle.
///
/// Same threading rules as [`TcpProxy`](crate::tcp::TcpProxy): every call
/// blocks until the reactor thread has applied it, and only
/// [`close`](Self::close) may be issued from that thread.
pub struct DatagramProxy {
    reactor: Reactor,
    config: Arc<DatagramProxyConfig>,
    lifecycle: Mutex<Lifecycle>,
    meters: DatagramMeters,
}

impl std::fmt::Debug for DatagramProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatagramProxy")
            .field("config", &self.config)
            .field("lifecycle", &*self.lock())
            .finish_non_exhaustive()
    }
}

impl DatagramProxy {
    /// Creates a closed proxy driven by `reactor`.
    #[must_use]
    pub fn new(reactor: &Reactor, config: DatagramProxyConfig) -> Self {
        Self {
            reactor: reactor.clone(),
            config: Arc::new(config),
            lifecycle: Mutex::new(Lifecycle {
                state: ProxyState::Closed,
                relay: None,
                local_addr: None,
            }),
            meters: DatagramMeters::default(),
        }
    }

    /// Creates a proxy and opens it.
    ///
    /// # Errors
    ///
    /// See [`open`](Self::open).
    pub fn open_new(reactor: &Reactor, config: DatagramProxyConfig) -> Result<Self> {
        let proxy = Self::new(reactor, config);
        proxy.open()?;
        Ok(proxy)
    }

    fn lock(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Binds the socket and starts relaying.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] unless closed,
    /// [`Error::InvalidConfig`] for an unusable configuration, and
    /// [`Error::Io`] if the socket cannot be bound.
    pub fn open(&self) -> Result<()> {
        let mut lifecycle = self.lock();
        let next = lifecycle.state.transition(Transition::Open)?;
        self.start(&mut lifecycle)?;
        lifecycle.state = next;
        Ok(())
    }

    fn start(&self, lifecycle: &mut Lifecycle) -> Result<()> {
        if self.config.pending_limit == 0 {
            return Err(Error::InvalidConfig("pending limit must be > 0"));
        }
        let config = Arc::clone(&self.config);
        let meters = self.meters.clone();
        let (key, local_addr) = self
            .reactor
            .execute(move |core| Ok(Relay::open(core, config, meters)?))?;

        lifecycle.relay = Some(key);
        lifecycle.local_addr = Some(local_addr);
        info!(bind_addr = %local_addr, connect_addr = %self.config.connect_addr, "datagram proxy open");
        Ok(())
    }

    fn stop(&self, lifecycle: &mut Lifecycle) {
        lifecycle.local_addr = None;
        let Some(key) = lifecycle.relay.take() else {
            return;
        };

        let teardown = move |core: &mut Core| {
            core.with_handler::<Relay, _, _>(key, |relay, core| relay.close(core, key));
        };
        // Called from a listener: tear down once the current callback returns.
        let result = if self.reactor.is_reactor_thread() {
            self.reactor.submit(teardown)
        } else {
            self.reactor.execute(move |core| {
                teardown(core);
                Ok(())
            })
        };
        match result {
            Ok(()) => info!(bind_addr = %self.config.bind_addr, "datagram proxy closed"),
            Err(e) => warn!(error = %e, "datagram proxy closed without reactor cleanup"),
        }
    }

    /// Closes the socket and every peer relay. Idempotent.
    ///
    /// May be called from a listener on the reactor thread; the teardown then
    /// runs as soon as the listener returns.
    pub fn close(&self) {
        let mut lifecycle = self.lock();
        if lifecycle.state == ProxyState::Closed {
            return;
        }
        self.stop(&mut lifecycle);
        lifecycle.state = ProxyState::Closed;
    }

    /// Closes and rebinds, dropping every peer relay.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if closed, [`Error::ReactorThread`]
    /// when called from the reactor thread, and [`Error::Io`] if the
    /// socket cannot be bound again, in which case the proxy ends up closed.
    pub fn reopen(&self) -> Result<()> {
        let mut lifecycle = self.lock();
        let next = lifecycle.state.transition(Transition::Reopen)?;
        if self.reactor.is_reactor_thread() {
            return Err(Error::ReactorThread);
        }
        self.stop(&mut lifecycle);
        lifecycle.state = ProxyState::Closed;
        self.start(&mut lifecycle)?;
        lifecycle.state = next;
        Ok(())
    }

    /// Stops receiving and sending on every socket; queued datagrams stay
    /// queued.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] unless running.
    pub fn freeze(&self) -> Result<()> {
        self.set_frozen(Transition::Freeze, true)
    }

    /// Resumes after [`freeze`](Self::freeze).
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] unless frozen.
    pub fn unfreeze(&self) -> Result<()> {
        self.set_frozen(Transition::Unfreeze, false)
    }

    fn set_frozen(&self, op: Transition, frozen: bool) -> Result<()> {
        let mut lifecycle = self.lock();
        let next = lifecycle.state.transition(op)?;
        let key = lifecycle.relay.ok_or(Error::ReactorClosed)?;

        self.reactor.execute(move |core| {
            core.with_handler::<Relay, _, _>(key, |relay, core| {
                if frozen {
                    relay.freeze(core)
                } else {
                    relay.unfreeze(core)
                }
            })
            .transpose()?;
            Ok(())
        })?;

        lifecycle.state = next;
        debug!(bind_addr = %self.config.bind_addr, frozen, "datagram proxy freeze state changed");
        Ok(())
    }

    /// Returns `true` unless closed.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.lock().state.is_open()
    }

    /// Returns `true` while frozen.
    #[must_use]
    pub fn is_frozen(&self) -> bool {
        self.lock().state == ProxyState::Frozen
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ProxyState {
        self.lock().state
    }

    /// Actual bound address while open.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.lock().local_addr
    }

    /// Configuration this proxy was built with.
    #[must_use]
    pub fn config(&self) -> &DatagramProxyConfig {
        &self.config
    }

    /// Bytes received from and sent to peers on the bound socket.
    #[must_use]
    pub fn inner_byte_meters(&self) -> &RateMeters {
        &self.meters.bytes
    }

    /// Datagrams received from and sent to peers on the bound socket.
    #[must_use]
    pub fn inner_packet_meters(&self) -> &RateMeters {
        &self.meters.packets
    }

    fn with_relay<T, F>(&self, f: F) -> Result<Option<T>>
    where
        T: Send + 'static,
        F: FnOnce(&mut Relay, &mut Core) -> T + Send + 'static,
    {
        let Some(key) = self.lock().relay else {
            return Ok(None);
        };
        self.reactor
            .execute(move |core| Ok(core.with_handler::<Relay, _, _>(key, f)))
    }

    /// Addresses of peers with a live relay.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ReactorClosed`] if the reactor is gone.
    pub fn clients(&self) -> Result<Vec<SocketAddr>> {
        Ok(self.with_relay(|relay, _| relay.clients())?.unwrap_or_default())
    }

    /// Closes the relay for `addr`. Returns `false` if there was none.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ReactorClosed`] if the reactor is gone.
    pub fn close_client(&self, addr: SocketAddr) -> Result<bool> {
        Ok(self
            .with_relay(move |relay, core| relay.close_peer(core, addr))?
            .unwrap_or(false))
    }

    /// Closes every peer relay silent for longer than `threshold`. Returns
    /// how many were closed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ReactorClosed`] if the reactor is gone.
    pub fn close_idle_clients(&self, threshold: Duration) -> Result<usize> {
        Ok(self
            .with_relay(move |relay, core| relay.close_idle(core, threshold))?
            .unwrap_or(0))
    }

    /// Meters of the relay for `addr`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ReactorClosed`] if the reactor is gone.
    pub fn client_meters(&self, addr: SocketAddr) -> Result<Option<DatagramMeters>> {
        Ok(self
            .with_relay(move |relay, _| relay.client_meters(addr))?
            .flatten())
    }

    /// Byte meters of the relay for `addr`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ReactorClosed`] if the reactor is gone.
    pub fn client_byte_meters(&self, addr: SocketAddr) -> Result<Option<RateMeters>> {
        Ok(self.client_meters(addr)?.map(|meters| meters.bytes))
    }

    /// Packet meters of the relay for `addr`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ReactorClosed`] if the reactor is gone.
    pub fn client_packet_meters(&self, addr: SocketAddr) -> Result<Option<RateMeters>> {
        Ok(self.client_meters(addr)?.map(|meters| meters.packets))
    }
}

impl Drop for DatagramProxy {
    fn drop(&mut self) {
        if self.reactor.is_open() {
            self.close();
        }
    }
}
