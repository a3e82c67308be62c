//! Lifecycle state shared by [`TcpProxy`](crate::tcp::TcpProxy) and
//! [`DatagramProxy`](crate::datagram::DatagramProxy).
//!
//! Transition legality lives here so both proxies reject the same misuse
//! with the same error.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::error::{Error, Result};

/// Called on the reactor thread when a client relay is created.
pub type ClientCreated = Arc<dyn Fn(SocketAddr) + Send + Sync>;

/// Called on the reactor thread when a client relay is closed, with the
/// relay's final meters.
pub type ClientDeleted<M> = Arc<dyn Fn(SocketAddr, &M) + Send + Sync>;

/// Lifecycle state of a proxy instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    /// Not bound. Initial state, and the state after `close()`.
    Closed,
    /// Bound and relaying.
    Running,
    /// Bound, but no socket has any interest registered.
    Frozen,
}

impl fmt::Display for ProxyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => f.write_str("closed"),
            Self::Running => f.write_str("running"),
            Self::Frozen => f.write_str("frozen"),
        }
    }
}

/// Lifecycle operations checked by [`ProxyState::transition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Open,
    Reopen,
    Freeze,
    Unfreeze,
}

impl Transition {
    const fn name(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Reopen => "reopen",
            Self::Freeze => "freeze",
            Self::Unfreeze => "unfreeze",
        }
    }
}

impl ProxyState {
    /// Returns the state reached by applying `op`, or an
    /// [`Error::InvalidState`] if `op` is illegal here.
    ///
    /// `close()` is deliberately absent: it is legal from every state.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] on double open, freeze while not
    /// running, unfreeze while not frozen, or reopen while closed.
    pub fn transition(self, op: Transition) -> Result<Self> {
        let next = match (self, op) {
            (Self::Closed, Transition::Open) => Some(Self::Running),
            (Self::Running | Self::Frozen, Transition::Reopen) => Some(Self::Running),
            (Self::Running, Transition::Freeze) => Some(Self::Frozen),
            (Self::Frozen, Transition::Unfreeze) => Some(Self::Running),
            _ => None,
        };
        next.ok_or(Error::InvalidState {
            op: op.name(),
            state: self,
        })
    }

    /// Returns `true` unless closed.
    #[must_use]
    pub const fn is_open(self) -> bool {
        !matches!(self, Self::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_only_from_closed() {
        assert_eq!(
            ProxyState::Closed.transition(Transition::Open).unwrap(),
            ProxyState::Running
        );
        assert!(matches!(
            ProxyState::Running.transition(Transition::Open),
            Err(Error::InvalidState { op: "open", state: ProxyState::Running })
        ));
        assert!(ProxyState::Frozen.transition(Transition::Open).is_err());
    }

    #[test]
    fn freeze_unfreeze_alternate() {
        let frozen = ProxyState::Running.transition(Transition::Freeze).unwrap();
        assert_eq!(frozen, ProxyState::Frozen);
        assert!(frozen.transition(Transition::Freeze).is_err());

        let running = frozen.transition(Transition::Unfreeze).unwrap();
        assert_eq!(running, ProxyState::Running);
        assert!(running.transition(Transition::Unfreeze).is_err());
    }

    #[test]
    fn nothing_but_open_after_close() {
        for op in [Transition::Reopen, Transition::Freeze, Transition::Unfreeze] {
            assert!(ProxyState::Closed.transition(op).is_err(), "{op:?}");
        }
    }

    #[test]
    fn error_message_names_op_and_state() {
        let err = ProxyState::Closed.transition(Transition::Reopen).unwrap_err();
        assert_eq!(err.to_string(), "cannot reopen a proxy that is closed");
    }
}
