use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::Instant;

/// A one-shot timer. Arming an already-armed timer re-schedules it; stale
/// wheel entries are invalidated by a per-timer stamp instead of being
/// removed eagerly.
#[derive(Clone)]
pub struct Timer {
    pub(crate) core: Rc<TimerCore>,
}

pub(crate) struct TimerCore {
    handler: RefCell<Option<Box<dyn FnMut()>>>,
    pub(crate) armed: Cell<bool>,
    pub(crate) stamp: Cell<u64>,
}

impl Timer {
    pub fn new(handler: impl FnMut() + 'static) -> Self {
        Timer {
            core: Rc::new(TimerCore {
                handler: RefCell::new(Some(Box::new(handler))),
                armed: Cell::new(false),
                stamp: Cell::new(0),
            }),
        }
    }

    pub fn is_armed(&self) -> bool {
        self.core.armed.get()
    }
}

impl TimerCore {
    pub(crate) fn fire(core: &Rc<TimerCore>) {
        let taken = core.handler.borrow_mut().take();
        if let Some(mut f) = taken {
            f();
            let mut slot = core.handler.borrow_mut();
            if slot.is_none() {
                *slot = Some(f);
            }
        }
    }
}

/// Expiry-ordered timer storage. Ties on the deadline fire in insertion
/// order thanks to the monotonic sequence component of the key.
pub(crate) struct TimerWheel {
    entries: BTreeMap<(Instant, u64), (Rc<TimerCore>, u64)>,
    seq: u64,
}

impl TimerWheel {
    pub(crate) fn new() -> Self {
        TimerWheel {
            entries: BTreeMap::new(),
            seq: 0,
        }
    }

    pub(crate) fn arm(&mut self, core: &Rc<TimerCore>, deadline: Instant) {
        let stamp = core.stamp.get().wrapping_add(1);
        core.stamp.set(stamp);
        core.armed.set(true);
        let seq = self.seq;
        self.seq = self.seq.wrapping_add(1);
        self.entries.insert((deadline, seq), (core.clone(), stamp));
    }

    pub(crate) fn disarm(core: &Rc<TimerCore>) {
        core.armed.set(false);
        core.stamp.set(core.stamp.get().wrapping_add(1));
    }

    /// Earliest deadline with a possibly-live entry. Stale entries make this
    /// conservative (an early wakeup that fires nothing), never late.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.entries.keys().next().map(|(d, _)| *d)
    }

    /// Removes all entries due at `now` and returns the timers that are
    /// still validly armed, in expiry order.
    pub(crate) fn take_due(&mut self, now: Instant) -> Vec<Rc<TimerCore>> {
        let mut due = Vec::new();
        while let Some((&key, _)) = self.entries.iter().next() {
            if key.0 > now {
                break;
            }
            let (core, stamp) = self.entries.remove(&key).unwrap();
            if core.armed.get() && core.stamp.get() == stamp {
                core.armed.set(false);
                due.push(core);
            }
        }
        due
    }
}
