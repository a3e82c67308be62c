//! Listening socket of a [`TcpProxy`](super::TcpProxy).

use std::any::Any;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use mio::event::Event;
use mio::net::{TcpListener, TcpStream};
use mio::Interest;

use super::pair::{PairContext, TcpPair};
use super::{TcpPairMeters, TcpProxyConfig};
use crate::meter::RateMeters;
use crate::net::{self, Registration};
use crate::reactor::{Core, Handler, HandlerKey};
use crate::trace::{debug, error, warn};

struct PairEntry {
    client: SocketAddr,
    meters: TcpPairMeters,
}

/// Accepts clients and spawns one [`TcpPair`] handler per client.
pub(crate) struct Acceptor {
    listener: TcpListener,
    registration: Registration,
    config: Arc<TcpProxyConfig>,
    meters: RateMeters,
    pairs: HashMap<HandlerKey, PairEntry>,
    frozen: bool,
}

impl Acceptor {
    /// Binds the listener and registers a running acceptor.
    pub(crate) fn open(
        core: &mut Core,
        config: Arc<TcpProxyConfig>,
        meters: RateMeters,
    ) -> io::Result<(HandlerKey, SocketAddr)> {
        let listener = net::listen(config.bind_addr, &config.socket)?;
        let local_addr = listener.local_addr()?;

        let key = core.insert(|core, key| {
            let mut acceptor = Self {
                listener,
                registration: Registration::new(core.token(key)),
                config,
                meters,
                pairs: HashMap::new(),
                frozen: false,
            };
            if let Err(e) = acceptor.registration.enable(
                core.registry(),
                &mut acceptor.listener,
                Interest::READABLE,
            ) {
                core.release_token(acceptor.registration.token());
                return Err(e);
            }
            Ok(acceptor)
        })?;

        Ok((key, local_addr))
    }

    /// Deregisters the listener, closes every pair and removes itself.
    pub(crate) fn close(&mut self, core: &mut Core, key: HandlerKey) {
        let _ = self.registration.clear(core.registry(), &mut self.listener);
        core.release_token(self.registration.token());

        for (pair_key, _) in self.pairs.drain() {
            core.with_handler::<TcpPair, _, _>(pair_key, |pair, core| pair.close(core, pair_key));
        }

        core.remove(key);
    }

    pub(crate) fn freeze(&mut self, core: &mut Core) -> io::Result<()> {
        self.frozen = true;
        self.registration.clear(core.registry(), &mut self.listener)?;
        for &pair_key in self.pairs.keys() {
            core.with_handler::<TcpPair, _, _>(pair_key, |pair, core| pair.freeze(core, pair_key));
        }
        self.prune(core);
        Ok(())
    }

    pub(crate) fn unfreeze(&mut self, core: &mut Core) -> io::Result<()> {
        self.frozen = false;
        for &pair_key in self.pairs.keys() {
            core.with_handler::<TcpPair, _, _>(pair_key, |pair, core| pair.unfreeze(core, pair_key));
        }
        self.prune(core);
        self.registration
            .enable(core.registry(), &mut self.listener, Interest::READABLE)
    }

    /// Pairs that closed while this acceptor was busy could not call
    /// [`forget`](Self::forget); drop them here.
    fn prune(&mut self, core: &Core) {
        self.pairs.retain(|&pair_key, _| core.contains(pair_key));
    }

    /// Drops the bookkeeping for a pair that closed on its own.
    pub(crate) fn forget(&mut self, pair_key: HandlerKey) {
        self.pairs.remove(&pair_key);
    }

    pub(crate) fn clients(&self) -> Vec<SocketAddr> {
        self.pairs.values().map(|entry| entry.client).collect()
    }

    pub(crate) fn client_meters(&self, addr: SocketAddr) -> Option<TcpPairMeters> {
        self.pairs
            .values()
            .find(|entry| entry.client == addr)
            .map(|entry| entry.meters.clone())
    }

    pub(crate) fn close_client(&mut self, core: &mut Core, addr: SocketAddr) -> usize {
        let keys: Vec<HandlerKey> = self
            .pairs
            .iter()
            .filter(|(_, entry)| entry.client == addr)
            .map(|(&key, _)| key)
            .collect();

        for &pair_key in &keys {
            self.pairs.remove(&pair_key);
            core.with_handler::<TcpPair, _, _>(pair_key, |pair, core| pair.close(core, pair_key));
        }
        keys.len()
    }

    fn accept_all(&mut self, core: &mut Core, key: HandlerKey) {
        while !self.frozen {
            match self.listener.accept() {
                Ok((stream, client)) => self.admit(core, key, stream, client),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    error!(bind_addr = %self.config.bind_addr, error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    fn admit(&mut self, core: &mut Core, key: HandlerKey, client: TcpStream, addr: SocketAddr) {
        if let Some(admission) = &self.config.admission {
            if !admission(addr) {
                debug!(client = %addr, "client rejected by admission filter");
                net::close_abrupt(client);
                return;
            }
        }

        if let Err(e) = net::configure(&client, &self.config.socket) {
            warn!(client = %addr, error = %e, "failed to configure client socket");
            net::close_abrupt(client);
            return;
        }

        let backend = match net::connect(self.config.connect_addr, &self.config.socket) {
            Ok(backend) => backend,
            Err(e) => {
                warn!(client = %addr, connect_addr = %self.config.connect_addr, error = %e, "backend connect failed");
                net::close_abrupt(client);
                return;
            }
        };

        let meters = TcpPairMeters::default();
        let context = PairContext {
            owner: key,
            config: Arc::clone(&self.config),
            global: self.meters.clone(),
            meters: meters.clone(),
            frozen: self.frozen,
        };
        let inserted = core.insert(|core, pair_key| {
            TcpPair::connecting(core, pair_key, context, client, addr, backend)
        });

        match inserted {
            Ok(pair_key) => {
                debug!(client = %addr, "client accepted");
                self.pairs.insert(pair_key, PairEntry { client: addr, meters });
            }
            Err(e) => warn!(client = %addr, error = %e, "failed to register client"),
        }
    }
}

impl Handler for Acceptor {
    fn ready(&mut self, core: &mut Core, key: HandlerKey, event: &Event) -> io::Result<()> {
        if event.is_readable() {
            self.accept_all(core, key);
        }
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
