use std::cell::Cell;

use super::Reactor;

/// Per-iteration dispatch budget. A connection direction uses one of these
/// to cap how many operations it completes inline per OS wait, so a single
/// busy descriptor cannot starve the rest of the reactor.
pub struct DispatchLimit {
    reactor: Reactor,
    max: u32,
    count: Cell<u32>,
    iteration: Cell<u64>,
}

impl DispatchLimit {
    pub fn new(reactor: &Reactor, max: u32) -> Self {
        DispatchLimit {
            reactor: reactor.clone(),
            max,
            count: Cell::new(0),
            iteration: Cell::new(reactor.iteration()),
        }
    }

    /// Returns false when the budget for the current iteration is spent; the
    /// caller must then fall back to readiness-driven dispatch.
    pub fn increment(&self) -> bool {
        let current = self.reactor.iteration();
        if self.iteration.get() != current {
            self.iteration.set(current);
            self.count.set(0);
        }
        if self.count.get() >= self.max {
            return false;
        }
        self.count.set(self.count.get() + 1);
        true
    }
}
