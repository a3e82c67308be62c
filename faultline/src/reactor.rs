//! Single-threaded readiness reactor.
//!
//! # Architecture
//!
//! One worker thread owns a [`mio::Poll`] and a [`Core`]. Each loop
//! iteration:
//!
//! 1. polls for readiness, bounded by the tick interval or the next timer
//!    deadline, whichever is sooner;
//! 2. dispatches every ready token to its handler, logging handler errors
//!    and panics without leaving the loop;
//! 3. runs all due timers in deadline order;
//! 4. drains the cross-thread task queue.
//!
//! Other threads reach the loop only through [`Reactor::execute`], which
//! posts a task, wakes the poller and blocks on a one-shot reply channel.
//! All socket and buffer state therefore lives on one thread and needs no
//! locking.

mod core;
mod slab;
mod timer;

use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender};
use minstant::Instant;
use mio::{Events, Poll, Waker};

pub use self::core::{Core, Handler, HandlerKey};
pub(crate) use self::core::WAKER;

use crate::error::{Error, Result};
use crate::trace::{debug, error, info, warn};

/// Default upper bound on one poll.
pub const DEFAULT_TICK: Duration = Duration::from_millis(10);

const EVENTS_CAPACITY: usize = 1024;

type Task = Box<dyn FnOnce(&mut Core) + Send>;

/// Reactor configuration.
#[derive(Debug, Clone)]
pub struct ReactorConfig {
    /// Longest the loop blocks in one poll. Timers firing earlier shorten it.
    pub tick: Duration,
    /// Name given to the worker thread.
    pub thread_name: String,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            tick: DEFAULT_TICK,
            thread_name: "faultline-reactor".into(),
        }
    }
}

impl ReactorConfig {
    /// Builder-style setter for the tick interval.
    #[must_use]
    pub const fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Builder-style setter for the worker thread name.
    #[must_use]
    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }
}

struct Shared {
    tasks: Sender<Task>,
    waker: Waker,
    /// Set by `close()` and by the loop when it terminates on its own.
    closed: Arc<AtomicBool>,
    worker: ThreadId,
    handle: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a reactor thread. Cheap to clone; every clone drives the
/// same loop.
///
/// Closing is explicit: dropping the last handle does not stop the thread.
#[derive(Clone)]
pub struct Reactor {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("open", &self.is_open())
            .field("worker", &self.shared.worker)
            .finish()
    }
}

impl Reactor {
    /// Starts a reactor thread.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the poller cannot be created and
    /// [`Error::Spawn`] if the thread cannot be started.
    pub fn new(config: ReactorConfig) -> Result<Self> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER)?;
        let registry = poll.registry().try_clone()?;
        let (tasks, inbox) = channel::unbounded::<Task>();
        let closed = Arc::new(AtomicBool::new(false));

        let tick = config.tick;
        let loop_closed = Arc::clone(&closed);
        let handle = thread::Builder::new()
            .name(config.thread_name.clone())
            .spawn(move || {
                info!("reactor thread started");
                let core = Core::new(registry);
                run(poll, core, &inbox, tick, &loop_closed);
                info!("reactor thread exiting");
            })
            .map_err(Error::Spawn)?;

        let worker = handle.thread().id();
        debug!(thread = %config.thread_name, tick_ms = tick.as_millis() as u64, "reactor started");

        Ok(Self {
            shared: Arc::new(Shared {
                tasks,
                waker,
                closed,
                worker,
                handle: Mutex::new(Some(handle)),
            }),
        })
    }

    /// Returns `true` until [`close`](Self::close) is called or the loop
    /// terminates.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.shared.closed.load(Ordering::Acquire)
    }

    /// Returns `true` if the caller is the reactor thread.
    #[must_use]
    pub fn is_reactor_thread(&self) -> bool {
        thread::current().id() == self.shared.worker
    }

    /// Runs `op` on the reactor thread and waits for its result.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ReactorThread`] when called from the reactor thread
    /// (the call would wait on itself), [`Error::ReactorClosed`] if the
    /// reactor is closed or closes before running `op`, and otherwise
    /// whatever `op` returns.
    pub fn execute<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Core) -> Result<T> + Send + 'static,
    {
        if self.is_reactor_thread() {
            return Err(Error::ReactorThread);
        }
        if !self.is_open() {
            return Err(Error::ReactorClosed);
        }

        let (reply, response) = channel::bounded(1);
        let task: Task = Box::new(move |core| {
            let _ = reply.send(op(core));
        });

        self.shared
            .tasks
            .send(task)
            .map_err(|_| Error::ReactorClosed)?;
        self.shared.waker.wake()?;

        response.recv().map_err(|_| Error::ReactorClosed)?
    }

    /// Posts `op` to the reactor thread without waiting for it. Legal from
    /// any thread; from the reactor thread itself `op` runs once the current
    /// handler, timer or task returns, within the same loop iteration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ReactorClosed`] if the reactor is closed. `op` may
    /// still be dropped unrun if the reactor closes before reaching it.
    pub fn submit<F>(&self, op: F) -> Result<()>
    where
        F: FnOnce(&mut Core) + Send + 'static,
    {
        if !self.is_open() {
            return Err(Error::ReactorClosed);
        }
        self.shared
            .tasks
            .send(Box::new(op))
            .map_err(|_| Error::ReactorClosed)?;
        if !self.is_reactor_thread() {
            self.shared.waker.wake()?;
        }
        Ok(())
    }

    /// Stops the loop and joins the thread. Pending tasks are dropped
    /// unrun and their callers receive [`Error::ReactorClosed`].
    ///
    /// Every proxy using this reactor should be closed first; handlers still
    /// registered are reported and dropped. Idempotent.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("reactor close requested");

        if let Err(e) = self.shared.waker.wake() {
            warn!(error = %e, "failed to wake reactor thread");
        }

        let handle = self
            .shared
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if self.is_reactor_thread() {
                // Closing from inside the loop; the loop exits on its own.
                return;
            }
            if handle.join().is_err() {
                error!("reactor thread panicked");
            }
        }
        info!("reactor closed");
    }
}

/// Marks the reactor closed when the loop exits, including by unwinding.
struct ClosedOnExit<'a>(&'a AtomicBool);

impl Drop for ClosedOnExit<'_> {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Release);
    }
}

/// Runs a timer or task. A panic is logged and contained so the loop keeps
/// running; `Core::dispatch` contains handler panics itself.
fn contained(what: &'static str, f: impl FnOnce()) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(f)) {
        let message = self::core::panic_message(payload.as_ref());
        error!(what, panic = message, "reactor work panicked");
    }
}

fn run(mut poll: Poll, mut core: Core, inbox: &Receiver<Task>, tick: Duration, closed: &AtomicBool) {
    let _exit = ClosedOnExit(closed);
    let mut events = Events::with_capacity(EVENTS_CAPACITY);

    loop {
        let timeout = core.next_deadline().map_or(tick, |deadline| {
            deadline
                .checked_duration_since(Instant::now())
                .unwrap_or_default()
                .min(tick)
        });

        if let Err(e) = poll.poll(&mut events, Some(timeout)) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            error!(error = %e, "reactor poll failed, loop terminating");
            break;
        }

        if closed.load(Ordering::Acquire) {
            break;
        }

        for event in &events {
            if event.token() != WAKER {
                core.dispatch(event);
            }
        }

        contained("timer", || core.run_due_timers(Instant::now()));

        while let Ok(task) = inbox.try_recv() {
            contained("task", || task(&mut core));
        }
    }

    closed.store(true, Ordering::Release);

    let dropped = inbox.try_iter().count();
    if dropped > 0 {
        debug!(dropped, "pending reactor tasks dropped");
    }

    if core.token_count() > 0 || core.handler_count() > 0 {
        warn!(
            tokens = core.token_count(),
            handlers = core.handler_count(),
            "reactor closed with sockets still registered"
        );
    }
    core.teardown();
}
