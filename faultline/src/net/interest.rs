//! Interest bookkeeping for one registered socket.
//!
//! mio cannot register an empty interest set, so "no interest" means
//! deregistered. [`Registration`] hides that: callers enable and disable
//! individual directions and it issues whichever of register, reregister or
//! deregister gets the socket there. Every change goes through
//! `EPOLL_CTL_MOD` or a fresh registration, which re-arms edge-triggered
//! readiness for the enabled directions.

use std::io;

use mio::event::Source;
use mio::{Interest, Registry, Token};

#[derive(Debug)]
pub(crate) struct Registration {
    token: Token,
    interest: Option<Interest>,
}

impl Registration {
    pub(crate) const fn new(token: Token) -> Self {
        Self {
            token,
            interest: None,
        }
    }

    pub(crate) const fn token(&self) -> Token {
        self.token
    }

    pub(crate) fn is_enabled(&self, interest: Interest) -> bool {
        self.interest.is_some_and(|current| {
            (!interest.is_readable() || current.is_readable())
                && (!interest.is_writable() || current.is_writable())
        })
    }

    /// Adds `interest` to the current set.
    pub(crate) fn enable<S>(&mut self, registry: &Registry, source: &mut S, interest: Interest) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        let next = self.interest.map_or(interest, |current| current | interest);
        self.set(registry, source, Some(next))
    }

    /// Removes `interest` from the current set.
    pub(crate) fn disable<S>(&mut self, registry: &Registry, source: &mut S, interest: Interest) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        let next = self.interest.and_then(|current| current.remove(interest));
        self.set(registry, source, next)
    }

    /// Drops all interest.
    pub(crate) fn clear<S>(&mut self, registry: &Registry, source: &mut S) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        self.set(registry, source, None)
    }

    fn set<S>(&mut self, registry: &Registry, source: &mut S, next: Option<Interest>) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        if next == self.interest {
            return Ok(());
        }
        match (self.interest, next) {
            (None, Some(interest)) => registry.register(source, self.token, interest)?,
            (Some(_), Some(interest)) => registry.reregister(source, self.token, interest)?,
            (Some(_), None) => registry.deregister(source)?,
            (None, None) => {}
        }
        self.interest = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use mio::Poll;
    use mio::net::UdpSocket;

    use super::*;

    #[test]
    fn tracks_interest_through_transitions() {
        let poll = Poll::new().unwrap();
        let mut socket = UdpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let mut reg = Registration::new(Token(7));

        assert!(!reg.is_enabled(Interest::READABLE));

        reg.enable(poll.registry(), &mut socket, Interest::READABLE).unwrap();
        reg.enable(poll.registry(), &mut socket, Interest::WRITABLE).unwrap();
        assert!(reg.is_enabled(Interest::READABLE | Interest::WRITABLE));

        reg.disable(poll.registry(), &mut socket, Interest::READABLE).unwrap();
        assert!(!reg.is_enabled(Interest::READABLE));
        assert!(reg.is_enabled(Interest::WRITABLE));

        reg.disable(poll.registry(), &mut socket, Interest::WRITABLE).unwrap();
        assert!(!reg.is_enabled(Interest::WRITABLE));

        // Registering again after a full deregistration must succeed.
        reg.enable(poll.registry(), &mut socket, Interest::READABLE).unwrap();
        reg.clear(poll.registry(), &mut socket).unwrap();
        reg.clear(poll.registry(), &mut socket).unwrap();
    }
}
