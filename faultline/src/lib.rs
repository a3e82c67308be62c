//! Intercepting TCP and UDP proxy that injects network faults.
//!
//! A proxy sits between a client and a fixed backend and lets a test
//! disconnect, freeze, throttle or rewrite the traffic in between. Every
//! socket is driven by one [`Reactor`] thread; [`TcpProxy`] and
//! [`DatagramProxy`] are handles that marshal lifecycle calls onto it.
//!
//! ```no_run
//! use faultline::{Reactor, ReactorConfig, TcpProxy, TcpProxyConfig};
//!
//! let reactor = Reactor::new(ReactorConfig::default())?;
//! let config = TcpProxyConfig::new("127.0.0.1:10080".parse()?, "127.0.0.1:80".parse()?);
//! let proxy = TcpProxy::open_new(&reactor, config)?;
//!
//! proxy.freeze()?;
//! proxy.unfreeze()?;
//! proxy.reopen()?;
//! proxy.close();
//! reactor.close();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

// Some bindings exist only to be logged.
#![cfg_attr(not(feature = "tracing"), allow(unused_variables))]

pub mod buffer;
pub mod datagram;
pub mod error;
pub mod filter;
pub mod meter;
pub mod net;
pub mod proxy;
pub mod reactor;
pub mod tcp;
pub mod throttle;
pub mod trace;

pub use datagram::{DatagramMeters, DatagramProxy, DatagramProxyConfig, DatagramSocketConfig};
pub use error::{Error, Result};
pub use meter::{RateMeter, RateMeterPeriod, RateMeters};
pub use proxy::ProxyState;
pub use reactor::{Reactor, ReactorConfig};
pub use tcp::{TcpPairMeters, TcpProxy, TcpProxyConfig, TcpSocketConfig};
pub use trace::init_tracing;
