//! TCP fault-injecting proxy.
//!
//! A [`TcpProxy`] listens on one address and, for every accepted client,
//! opens a connection to a fixed backend and relays bytes both ways through
//! a pair of [`BufferQueue`](crate::buffer::BufferQueue)s. All socket work
//! happens on the reactor thread; the methods here marshal onto it.
//!
//! Direction naming: *outgoing* is client → backend, *incoming* is
//! backend → client.

mod acceptor;
mod pair;

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use acceptor::Acceptor;

use crate::buffer::BufferConfig;
use crate::error::{Error, Result};
use crate::filter::{AdmissionFilter, TransformFilterFactory};
use crate::meter::RateMeters;
use crate::proxy::{ClientCreated, ClientDeleted, ProxyState, Transition};
use crate::reactor::{Core, HandlerKey, Reactor};
use crate::throttle::ThrottlerFactory;
use crate::trace::{debug, info, warn};

/// Default listen backlog.
pub const DEFAULT_BACKLOG: u32 = 1024;

/// Default backend connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Delay between both directions reaching end of stream and the pair being
/// closed, so trailing acknowledgements can flush.
pub const LINGER: Duration = Duration::from_millis(500);

/// Socket options for accepted and backend connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpSocketConfig {
    /// `SO_RCVBUF`; `None` keeps the system default.
    pub rcv_buffer_size: Option<usize>,
    /// `SO_SNDBUF`; `None` keeps the system default.
    pub snd_buffer_size: Option<usize>,
    /// Listen backlog.
    pub backlog: u32,
    /// How long a backend connect may take before the client is dropped.
    pub connect_timeout: Duration,
    /// Local address for backend connections.
    pub bind_before_connect: Option<SocketAddr>,
    /// `TCP_NODELAY` on both sides.
    pub tcp_nodelay: bool,
    /// `SO_KEEPALIVE` on both sides.
    pub keep_alive: bool,
}

impl Default for TcpSocketConfig {
    fn default() -> Self {
        Self {
            rcv_buffer_size: None,
            snd_buffer_size: None,
            backlog: DEFAULT_BACKLOG,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            bind_before_connect: None,
            tcp_nodelay: true,
            keep_alive: false,
        }
    }
}

impl TcpSocketConfig {
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

    /// Builder-style setter for the listen backlog.
    #[must_use]
    pub const fn with_backlog(mut self, backlog: u32) -> Self {
        self.backlog = backlog;
        self
    }

    /// Builder-style setter for the connect timeout.
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Builder-style setter for the backend-side local address.
    #[must_use]
    pub const fn with_bind_before_connect(mut self, addr: SocketAddr) -> Self {
        self.bind_before_connect = Some(addr);
        self
    }

    /// Builder-style setter for `TCP_NODELAY`.
    #[must_use]
    pub const fn with_tcp_nodelay(mut self, nodelay: bool) -> Self {
        self.tcp_nodelay = nodelay;
        self
    }

    /// Builder-style setter for `SO_KEEPALIVE`.
    #[must_use]
    pub const fn with_keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }
}

/// Read/sent meters of one client connection.
#[derive(Debug, Clone, Default)]
pub struct TcpPairMeters {
    /// Client-facing socket: `read` is client → proxy, `sent` is proxy → client.
    pub inner: RateMeters,
    /// Backend-facing socket: `read` is backend → proxy, `sent` is proxy → backend.
    pub outer: RateMeters,
}

/// Configuration of a [`TcpProxy`].
#[derive(Clone)]
pub struct TcpProxyConfig {
    /// Address clients connect to.
    pub bind_addr: SocketAddr,
    /// Backend address.
    pub connect_addr: SocketAddr,
    /// Slot pool per direction per connection.
    pub buffers: BufferConfig,
    /// Socket options.
    pub socket: TcpSocketConfig,
    /// Filter applied to backend → client data.
    pub incoming_filter: Option<TransformFilterFactory>,
    /// Filter applied to client → backend data.
    pub outgoing_filter: Option<TransformFilterFactory>,
    /// Throttler for backend → client data.
    pub incoming_throttler: Option<ThrottlerFactory>,
    /// Throttler for client → backend data.
    pub outgoing_throttler: Option<ThrottlerFactory>,
    /// Decides whether an accepted client is relayed.
    pub admission: Option<AdmissionFilter>,
    /// Fired once a client's backend connection is established.
    pub on_client_created: Option<ClientCreated>,
    /// Fired when an established client connection is closed.
    pub on_client_deleted: Option<ClientDeleted<TcpPairMeters>>,
}

impl std::fmt::Debug for TcpProxyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpProxyConfig")
            .field("bind_addr", &self.bind_addr)
            .field("connect_addr", &self.connect_addr)
            .field("buffers", &self.buffers)
            .field("socket", &self.socket)
            .finish_non_exhaustive()
    }
}

impl TcpProxyConfig {
    /// Relays `bind_addr` to `connect_addr` with default options.
    #[must_use]
    pub fn new(bind_addr: SocketAddr, connect_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            connect_addr,
            buffers: BufferConfig::default(),
            socket: TcpSocketConfig::default(),
            incoming_filter: None,
            outgoing_filter: None,
            incoming_throttler: None,
            outgoing_throttler: None,
            admission: None,
            on_client_created: None,
            on_client_deleted: None,
        }
    }

    /// Builder-style setter for the slot pool.
    #[must_use]
    pub fn with_buffers(mut self, buffers: BufferConfig) -> Self {
        self.buffers = buffers;
        self
    }

    /// Builder-style setter for socket options.
    #[must_use]
    pub fn with_socket(mut self, socket: TcpSocketConfig) -> Self {
        self.socket = socket;
        self
    }

    /// Builder-style setter for the backend → client filter.
    #[must_use]
    pub fn with_incoming_filter(mut self, factory: TransformFilterFactory) -> Self {
        self.incoming_filter = Some(factory);
        self
    }

    /// Builder-style setter for the client → backend filter.
    #[must_use]
    pub fn with_outgoing_filter(mut self, factory: TransformFilterFactory) -> Self {
        self.outgoing_filter = Some(factory);
        self
    }

    /// Builder-style setter for the backend → client throttler.
    #[must_use]
    pub fn with_incoming_throttler(mut self, factory: ThrottlerFactory) -> Self {
        self.incoming_throttler = Some(factory);
        self
    }

    /// Builder-style setter for the client → backend throttler.
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
    pub fn with_on_client_deleted(mut self, listener: ClientDeleted<TcpPairMeters>) -> Self {
        self.on_client_deleted = Some(listener);
        self
    }
}

#[derive(Debug)]
struct Lifecycle {
    state: ProxyState,
    acceptor: Option<HandlerKey>,
    local_addr: Option<SocketAddr>,
}

/// TCP proxy handle.
///
/// Lifecycle calls are serialized by an internal lock and each blocks until
/// the reactor thread has applied it. From the reactor thread itself, for
/// example inside a listener, only [`close`](Self::close) is allowed; every
/// other call fails with [`Error::ReactorThread`] and changes nothing.
pub struct TcpProxy {
    reactor: Reactor,
    config: Arc<TcpProxyConfig>,
    lifecycle: Mutex<Lifecycle>,
    meters: RateMeters,
}

impl std::fmt::Debug for TcpProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpProxy")
            .field("config", &self.config)
            .field("lifecycle", &*self.lock())
            .finish_non_exhaustive()
    }
}

impl TcpProxy {
    /// Creates a closed proxy driven by `reactor`.
    #[must_use]
    pub fn new(reactor: &Reactor, config: TcpProxyConfig) -> Self {
        Self {
            reactor: reactor.clone(),
            config: Arc::new(config),
            lifecycle: Mutex::new(Lifecycle {
                state: ProxyState::Closed,
                acceptor: None,
                local_addr: None,
            }),
            meters: RateMeters::new(),
        }
    }

    /// Creates a proxy and opens it.
    ///
    /// # Errors
    ///
    /// See [`open`](Self::open).
    pub fn open_new(reactor: &Reactor, config: TcpProxyConfig) -> Result<Self> {
        let proxy = Self::new(reactor, config);
        proxy.open()?;
        Ok(proxy)
    }

    fn lock(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Binds the listener and starts accepting.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] unless closed,
    /// [`Error::InvalidConfig`] for an unusable configuration, and
    /// [`Error::Io`] if the listener cannot be bound. A failed open leaves the proxy closed.
    pub fn open(&self) -> Result<()> {
        let mut lifecycle = self.lock();
        let next = lifecycle.state.transition(Transition::Open)?;
        self.start(&mut lifecycle)?;
        lifecycle.state = next;
        Ok(())
    }

    fn start(&self, lifecycle: &mut Lifecycle) -> Result<()> {
        self.config.buffers.validate()?;
        let config = Arc::clone(&self.config);
        let meters = self.meters.clone();
        let (key, local_addr) = self
            .reactor
            .execute(move |core| Ok(Acceptor::open(core, config, meters)?))?;

        lifecycle.acceptor = Some(key);
        lifecycle.local_addr = Some(local_addr);
        info!(bind_addr = %local_addr, connect_addr = %self.config.connect_addr, "tcp proxy open");
        Ok(())
    }

    fn stop(&self, lifecycle: &mut Lifecycle) {
        lifecycle.local_addr = None;
        let Some(key) = lifecycle.acceptor.take() else {
            return;
        };

        let teardown = move |core: &mut Core| {
            core.with_handler::<Acceptor, _, _>(key, |acceptor, core| acceptor.close(core, key));
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
            Ok(()) => info!(bind_addr = %self.config.bind_addr, "tcp proxy closed"),
            Err(e) => warn!(error = %e, "tcp proxy closed without reactor cleanup"),
        }
    }

    /// Stops accepting and closes every client connection. Idempotent.
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

    /// Closes and reopens the listener, dropping every client connection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if closed, [`Error::ReactorThread`]
    /// when called from the reactor thread, and [`Error::Io`] if the
    /// listener cannot be bound again, in which case the proxy ends up
    /// closed.
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

    /// Pauses accepting and every relay without dropping buffered data.
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
        let key = lifecycle.acceptor.ok_or(Error::ReactorClosed)?;

        self.reactor.execute(move |core| {
            core.with_handler::<Acceptor, _, _>(key, |acceptor, core| {
                if frozen {
                    acceptor.freeze(core)
                } else {
                    acceptor.unfreeze(core)
                }
            })
            .transpose()?;
            Ok(())
        })?;

        lifecycle.state = next;
        debug!(bind_addr = %self.config.bind_addr, frozen, "tcp proxy freeze state changed");
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

    /// Actual listening address while open. Differs from the configured
    /// address when binding to port 0.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.lock().local_addr
    }

    /// Configuration this proxy was built with.
    #[must_use]
    pub fn config(&self) -> &TcpProxyConfig {
        &self.config
    }

    /// Bytes read from and sent to any socket, over all connections and
    /// reopens.
    #[must_use]
    pub fn byte_meters(&self) -> &RateMeters {
        &self.meters
    }

    fn with_acceptor<T, F>(&self, f: F) -> Result<Option<T>>
    where
        T: Send + 'static,
        F: FnOnce(&mut Acceptor, &mut Core) -> T + Send + 'static,
    {
        let Some(key) = self.lock().acceptor else {
            return Ok(None);
        };
        self.reactor
            .execute(move |core| Ok(core.with_handler::<Acceptor, _, _>(key, f)))
    }

    /// Addresses of connected clients.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ReactorClosed`] if the reactor is gone.
    pub fn clients(&self) -> Result<Vec<SocketAddr>> {
        Ok(self
            .with_acceptor(|acceptor, _| acceptor.clients())?
            .unwrap_or_default())
    }

    /// Closes every connection from `addr`. Returns how many were closed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ReactorClosed`] if the reactor is gone.
    pub fn close_client(&self, addr: SocketAddr) -> Result<usize> {
        Ok(self
            .with_acceptor(move |acceptor, core| acceptor.close_client(core, addr))?
            .unwrap_or(0))
    }

    /// Meters of the connection from `addr`, if connected.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ReactorClosed`] if the reactor is gone.
    pub fn client_meters(&self, addr: SocketAddr) -> Result<Option<TcpPairMeters>> {
        Ok(self
            .with_acceptor(move |acceptor, _| acceptor.client_meters(addr))?
            .flatten())
    }
}

impl Drop for TcpProxy {
    fn drop(&mut self) {
        if self.reactor.is_open() {
            self.close();
        }
    }
}
