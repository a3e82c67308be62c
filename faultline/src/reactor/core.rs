//! Loop-thread state: handler table, token map and timers.
//!
//! Everything reachable from [`Core`] is touched only by the reactor thread.
//! Handlers are lent out of the table while they run, so a handler may
//! freely call back into `Core`, including removing itself or reaching a
//! different handler through [`Core::with_handler`].

use std::any::Any;
use std::collections::HashMap;
use std::io;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::thread::{self, ThreadId};
use std::time::Duration;

use minstant::Instant;
use mio::event::Event;
use mio::{Registry, Token};

use super::slab::{Slab, SlabKey};
use super::timer::TimerQueue;
use crate::trace::{error, trace};

/// Key of a handler registered with a [`Core`].
pub type HandlerKey = SlabKey;

/// Token reserved for the cross-thread waker.
pub(crate) const WAKER: Token = Token(0);

type TimerAction = Box<dyn FnOnce(&mut Core)>;

/// Readiness callback owning one or more sockets.
pub trait Handler: Any {
    /// Handles readiness for one of the handler's tokens.
    ///
    /// # Errors
    ///
    /// Errors are logged by the loop and otherwise ignored; a handler that
    /// wants to tear itself down on error must do so before returning.
    fn ready(&mut self, core: &mut Core, key: HandlerKey, event: &Event) -> io::Result<()>;

    /// Upcast for [`Core::with_handler`].
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("<non-string panic>")
}

/// Reactor-thread state passed to handlers, timers and marshaled tasks.
pub struct Core {
    registry: Registry,
    handlers: Slab<Box<dyn Handler>>,
    tokens: HashMap<Token, HandlerKey>,
    next_token: usize,
    timers: TimerQueue<TimerAction>,
    worker: ThreadId,
}

impl Core {
    pub(crate) fn new(registry: Registry) -> Self {
        Self {
            registry,
            handlers: Slab::new(),
            tokens: HashMap::new(),
            next_token: WAKER.0 + 1,
            timers: TimerQueue::default(),
            worker: thread::current().id(),
        }
    }

    /// Registry for socket registration.
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Panics in debug builds if called off the reactor thread.
    #[inline]
    pub fn assert_worker(&self) {
        debug_assert_eq!(
            thread::current().id(),
            self.worker,
            "reactor state touched off the reactor thread"
        );
    }

    /// Allocates a fresh token routed to `key`.
    pub fn token(&mut self, key: HandlerKey) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        self.tokens.insert(token, key);
        token
    }

    /// Stops routing events for `token`.
    pub fn release_token(&mut self, token: Token) {
        self.tokens.remove(&token);
    }

    /// Number of tokens still routed to a handler.
    #[must_use]
    pub fn token_count(&self) -> usize {
        self.tokens.len()
    }

    /// Number of live handlers.
    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Builds a handler that knows its own key and inserts it.
    ///
    /// # Errors
    ///
    /// Propagates the error from `build`; nothing is inserted in that case.
    pub fn insert<H, F>(&mut self, build: F) -> io::Result<HandlerKey>
    where
        H: Handler,
        F: FnOnce(&mut Self, HandlerKey) -> io::Result<H>,
    {
        self.assert_worker();
        let key = self.handlers.reserve();
        match build(self, key) {
            Ok(handler) => {
                // The reserved slot may only disappear if `build` removed it.
                let _ = self.handlers.restore(key, Box::new(handler));
                Ok(key)
            }
            Err(e) => {
                self.handlers.remove(key);
                Err(e)
            }
        }
    }

    /// Removes the handler behind `key`. The handler must already have
    /// deregistered its sockets and released its tokens.
    ///
    /// Returns `false` if `key` is stale. Removing a handler that is
    /// currently running frees its slot; the running instance is dropped
    /// when it returns.
    pub fn remove(&mut self, key: HandlerKey) -> bool {
        self.assert_worker();
        let live = self.handlers.contains(key);
        drop(self.handlers.remove(key));
        live
    }

    /// Returns `true` if `key` refers to a live handler.
    #[must_use]
    pub fn contains(&self, key: HandlerKey) -> bool {
        self.handlers.contains(key)
    }

    /// Runs `f` against the handler behind `key` if it is live and of type
    /// `H`. Returns `None` for stale keys, type mismatches and handlers that
    /// are already running further up the stack.
    pub fn with_handler<H, R, F>(&mut self, key: HandlerKey, f: F) -> Option<R>
    where
        H: Handler,
        F: FnOnce(&mut H, &mut Self) -> R,
    {
        self.assert_worker();
        let mut handler = self.handlers.take(key)?;
        let result = catch_unwind(AssertUnwindSafe(|| {
            handler
                .as_any_mut()
                .downcast_mut::<H>()
                .map(|h| f(h, self))
        }));
        match result {
            Ok(result) => {
                let _ = self.handlers.restore(key, handler);
                result
            }
            Err(payload) => {
                self.evict(key);
                resume_unwind(payload);
            }
        }
    }

    /// Forgets a handler whose callback panicked. Its sockets close when
    /// the lent-out instance is dropped.
    fn evict(&mut self, key: HandlerKey) {
        self.handlers.remove(key);
        self.tokens.retain(|_, routed| *routed != key);
    }

    /// Keys of every live handler.
    #[must_use]
    pub fn handler_keys(&self) -> Vec<HandlerKey> {
        self.handlers.keys()
    }

    /// Runs `action` on the reactor thread after `delay`.
    ///
    /// The action must re-validate whatever state it acts on: nothing
    /// cancels a scheduled action.
    pub fn schedule<F>(&mut self, delay: Duration, action: F)
    where
        F: FnOnce(&mut Self) + 'static,
    {
        self.assert_worker();
        self.timers.push(Instant::now() + delay, Box::new(action));
    }

    /// Runs `f` against handler `key` after `delay`, if it is still live.
    pub fn schedule_for<H, F>(&mut self, key: HandlerKey, delay: Duration, f: F)
    where
        H: Handler,
        F: FnOnce(&mut H, &mut Self) + 'static,
    {
        self.schedule(delay, move |core| {
            core.with_handler::<H, _, _>(key, f);
        });
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    pub(crate) fn dispatch(&mut self, event: &Event) {
        let token = event.token();
        let Some(&key) = self.tokens.get(&token) else {
            trace!(token = token.0, "event for released token");
            return;
        };
        let Some(mut handler) = self.handlers.take(key) else {
            return;
        };

        match catch_unwind(AssertUnwindSafe(|| handler.ready(self, key, event))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(%key, token = token.0, error = %e, "handler failed"),
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(%key, token = token.0, panic = message, "handler panicked, dropping it");
                self.evict(key);
                return;
            }
        }

        let _ = self.handlers.restore(key, handler);
    }

    pub(crate) fn run_due_timers(&mut self, now: Instant) {
        while let Some(action) = self.timers.pop_due(now) {
            action(self);
        }
    }

    /// Drops every handler and pending timer without running anything.
    pub(crate) fn teardown(&mut self) {
        self.timers.clear();
        drop(self.handlers.drain());
        self.tokens.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter {
        hits: usize,
    }

    impl Handler for Counter {
        fn ready(&mut self, _: &mut Core, _: HandlerKey, _: &Event) -> io::Result<()> {
            self.hits += 1;
            Ok(())
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    fn core() -> Core {
        let poll = mio::Poll::new().unwrap();
        Core::new(poll.registry().try_clone().unwrap())
    }

    #[test]
    fn insert_and_reach_handler() {
        let mut core = core();
        let key = core.insert(|_, _| Ok(Counter { hits: 3 })).unwrap();

        assert_eq!(core.with_handler::<Counter, _, _>(key, |h, _| h.hits), Some(3));
        assert!(core.remove(key));
        assert_eq!(core.with_handler::<Counter, _, _>(key, |h, _| h.hits), None);
        assert!(!core.remove(key));
    }

    #[test]
    fn failed_build_inserts_nothing() {
        let mut core = core();
        let result = core.insert::<Counter, _>(|_, _| Err(io::ErrorKind::Other.into()));
        assert!(result.is_err());
        assert_eq!(core.handler_count(), 0);
    }

    #[test]
    fn panicking_handler_is_evicted() {
        let mut core = core();
        let key = core
            .insert(|core, key| {
                core.token(key);
                Ok(Counter { hits: 0 })
            })
            .unwrap();
        assert_eq!(core.token_count(), 1);

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            core.with_handler::<Counter, (), _>(key, |_, _| panic!("boom"));
        }));
        assert!(outcome.is_err());
        assert!(!core.contains(key));
        assert_eq!(core.token_count(), 0);
    }

    #[test]
    fn handler_can_remove_itself() {
        let mut core = core();
        let key = core.insert(|_, _| Ok(Counter { hits: 0 })).unwrap();

        core.with_handler::<Counter, _, _>(key, |_, core| core.remove(key));
        assert!(!core.contains(key));
        assert_eq!(core.handler_count(), 0);
    }

    #[test]
    fn timers_skip_removed_handlers() {
        let mut core = core();
        let key = core.insert(|_, _| Ok(Counter { hits: 0 })).unwrap();
        let gone = core.insert(|_, _| Ok(Counter { hits: 0 })).unwrap();

        core.schedule_for::<Counter, _>(key, Duration::ZERO, |h, _| h.hits += 1);
        core.schedule_for::<Counter, _>(gone, Duration::ZERO, |h, _| h.hits += 1);
        core.remove(gone);

        core.run_due_timers(Instant::now() + Duration::from_millis(1));
        assert_eq!(core.with_handler::<Counter, _, _>(key, |h, _| h.hits), Some(1));
    }

    #[test]
    fn tokens_route_to_keys() {
        let mut core = core();
        let key = core.insert(|_, _| Ok(Counter { hits: 0 })).unwrap();
        let a = core.token(key);
        let b = core.token(key);

        assert_ne!(a, b);
        assert_ne!(a, WAKER);
        assert_eq!(core.token_count(), 2);
        core.release_token(a);
        assert_eq!(core.token_count(), 1);
    }
}
