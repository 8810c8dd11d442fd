//! Single-threaded cooperative reactor.
//!
//! One `Reactor` owns everything that can wake the process: a deferred-job
//! queue, a timer wheel and an OS readiness poller (mio). All completion
//! callbacks in this crate are delivered through jobs, which is what allows
//! deeply stacked packet pipelines to run without re-entrant calls: each
//! `done` unwinds to the reactor and the next hop fires from the queue.
//!
//! Scheduling order per iteration: drain the job queue to fixed point, block
//! on the poller with a timeout derived from the earliest timer, fire due
//! timers, then dispatch ready I/O handlers. Jobs scheduled by timers or I/O
//! handlers run before the next blocking wait.

mod io;
mod job;
mod limit;
#[cfg(target_os = "linux")]
pub mod signal;
mod timer;

pub use io::{IoToken, Readiness};
pub use job::Job;
pub use limit::DispatchLimit;
pub use timer::Timer;

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io::ErrorKind;
use std::rc::Rc;
use std::time::{Duration, Instant};

use mio::event::Source;
use mio::{Events, Interest, Poll, Token};
use tracing::trace;

use io::IoSlots;
use job::JobCore;
use timer::{TimerCore, TimerWheel};

/// Upper bound on simultaneously registered I/O sources.
const MAX_IO_SOURCES: usize = 4096;

/// Cheap-clone handle to the reactor. All methods take `&self`; internal
/// borrows are released before any user callback runs.
#[derive(Clone)]
pub struct Reactor {
    inner: Rc<Inner>,
}

struct Inner {
    poll: RefCell<Poll>,
    io: RefCell<IoSlots>,
    jobs: RefCell<VecDeque<Rc<JobCore>>>,
    timers: RefCell<TimerWheel>,
    iteration: Cell<u64>,
    exit: Cell<Option<i32>>,
}

impl Reactor {
    pub fn new() -> std::io::Result<Reactor> {
        Ok(Reactor {
            inner: Rc::new(Inner {
                poll: RefCell::new(Poll::new()?),
                io: RefCell::new(IoSlots::new(MAX_IO_SOURCES)),
                jobs: RefCell::new(VecDeque::new()),
                timers: RefCell::new(TimerWheel::new()),
                iteration: Cell::new(0),
                exit: Cell::new(None),
            }),
        })
    }

    /// Runs the event loop until `quit` is called from some callback.
    pub fn run(&self) -> i32 {
        let mut events = Events::with_capacity(1024);
        loop {
            self.drain_jobs();
            if let Some(code) = self.inner.exit.take() {
                trace!(code, "reactor exiting");
                return code;
            }

            let timeout = self
                .inner
                .timers
                .borrow()
                .next_deadline()
                .map(|d| d.saturating_duration_since(Instant::now()));

            let res = {
                let mut poll = self.inner.poll.borrow_mut();
                poll.poll(&mut events, timeout)
            };
            if let Err(e) = res {
                if e.kind() != ErrorKind::Interrupted {
                    // Nothing sensible to do; treat as a fatal wait failure.
                    self.inner.exit.set(Some(1));
                }
                continue;
            }
            self.inner.iteration.set(self.inner.iteration.get() + 1);

            self.fire_due_timers();

            for event in events.iter() {
                let Token(index) = event.token();
                let entry = self.inner.io.borrow().handler_at(index);
                if let Some((stamp, handler)) = entry {
                    // Stamp re-check guards against a slot recycled by an
                    // earlier handler in this same batch.
                    if !self.inner.io.borrow().contains(IoToken { index, stamp }) {
                        continue;
                    }
                    let readiness = Readiness {
                        readable: event.is_readable(),
                        writable: event.is_writable(),
                        error: event.is_error(),
                        read_closed: event.is_read_closed(),
                    };
                    let mut handler = handler.borrow_mut();
                    (*handler)(readiness);
                }
            }
        }
    }

    /// Requests loop exit. Callbacks already being dispatched this iteration
    /// still run; scheduling new jobs becomes a no-op.
    pub fn quit(&self, code: i32) {
        if self.inner.exit.get().is_none() {
            self.inner.exit.set(Some(code));
        }
    }

    pub fn exit_requested(&self) -> bool {
        self.inner.exit.get().is_some()
    }

    /// Number of completed OS waits; used by `DispatchLimit` to reset its
    /// per-iteration counters.
    pub fn iteration(&self) -> u64 {
        self.inner.iteration.get()
    }

    pub fn schedule_job(&self, job: &Job) {
        if self.exit_requested() {
            return;
        }
        let core = &job.core;
        core.scheduled.set(true);
        if !core.queued.get() {
            core.queued.set(true);
            self.inner.jobs.borrow_mut().push_back(core.clone());
        }
    }

    /// Idempotent; a queued entry is skipped lazily when it reaches the
    /// front.
    pub fn cancel_job(&self, job: &Job) {
        job.core.scheduled.set(false);
    }

    /// Runs queued jobs from the front until `marker` is reached. The marker
    /// stays scheduled; the caller is expected to cancel it. Jobs scheduled
    /// *during* the drain land behind the marker and are not run here.
    pub fn synchronize(&self, marker: &Job) {
        if !marker.is_scheduled() {
            return;
        }
        loop {
            let next = {
                let mut q = self.inner.jobs.borrow_mut();
                match q.front() {
                    None => None,
                    Some(front) if Rc::ptr_eq(front, &marker.core) => None,
                    Some(_) => q.pop_front(),
                }
            };
            let Some(core) = next else { break };
            core.queued.set(false);
            if !core.scheduled.get() {
                continue;
            }
            core.scheduled.set(false);
            JobCore::fire(&core);
        }
    }

    /// Flushes everything currently queued, but not jobs scheduled during
    /// the flush. Used by adapters that must see their pipeline effects
    /// settle before returning into a non-reentrant library.
    pub fn flush_pending(&self) {
        if self.exit_requested() {
            return;
        }
        let marker = Job::noop();
        self.schedule_job(&marker);
        self.synchronize(&marker);
        self.cancel_job(&marker);
    }

    pub fn set_timer_relative(&self, timer: &Timer, after: Duration) {
        self.set_timer_absolute(timer, Instant::now() + after);
    }

    pub fn set_timer_absolute(&self, timer: &Timer, deadline: Instant) {
        self.inner.timers.borrow_mut().arm(&timer.core, deadline);
    }

    pub fn remove_timer(&self, timer: &Timer) {
        TimerWheel::disarm(&timer.core);
    }

    /// Registers an I/O source. Fails when the OS registration fails or the
    /// source table is full.
    pub fn add_io(
        &self,
        source: &mut dyn Source,
        interest: Interest,
        handler: Box<dyn FnMut(Readiness)>,
    ) -> std::io::Result<IoToken> {
        let token = self
            .inner
            .io
            .borrow_mut()
            .insert(handler)
            .ok_or_else(|| std::io::Error::other("too many registered I/O sources"))?;
        let res = {
            let poll = self.inner.poll.borrow();
            poll.registry().register(source, Token(token.index), interest)
        };
        if let Err(e) = res {
            self.inner.io.borrow_mut().remove(token);
            return Err(e);
        }
        Ok(token)
    }

    /// Changes the interest set. Re-registering with an unchanged interest is
    /// also how a still-ready source is re-armed after a deliberate back-off.
    pub fn update_io(
        &self,
        token: IoToken,
        source: &mut dyn Source,
        interest: Interest,
    ) -> std::io::Result<()> {
        debug_assert!(self.inner.io.borrow().contains(token));
        let poll = self.inner.poll.borrow();
        poll.registry().reregister(source, Token(token.index), interest)
    }

    pub fn remove_io(&self, token: IoToken, source: &mut dyn Source) {
        let poll = self.inner.poll.borrow();
        let _ = poll.registry().deregister(source);
        drop(poll);
        self.inner.io.borrow_mut().remove(token);
    }

    fn drain_jobs(&self) {
        loop {
            if self.inner.exit.get().is_some() {
                return;
            }
            let next = self.inner.jobs.borrow_mut().pop_front();
            let Some(core) = next else { return };
            core.queued.set(false);
            if !core.scheduled.get() {
                continue;
            }
            core.scheduled.set(false);
            JobCore::fire(&core);
        }
    }

    fn fire_due_timers(&self) {
        let due = self.inner.timers.borrow_mut().take_due(Instant::now());
        for core in due {
            TimerCore::fire(&core);
        }
    }
}
