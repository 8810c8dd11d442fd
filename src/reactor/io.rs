use std::cell::RefCell;
use std::rc::Rc;

/// Readiness bits delivered to an I/O handler. A handler only sees bits it
/// asked for, possibly unioned with the error/closed conditions the OS
/// reports unconditionally.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
    pub read_closed: bool,
}

/// Handle to a registered I/O source. Carries a stamp so a recycled slot
/// index can never be confused with its previous occupant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IoToken {
    pub(crate) index: usize,
    pub(crate) stamp: u64,
}

pub(crate) struct IoSlot {
    pub(crate) stamp: u64,
    pub(crate) handler: Rc<RefCell<Box<dyn FnMut(Readiness)>>>,
}

pub(crate) struct IoSlots {
    slots: Vec<Option<IoSlot>>,
    free: Vec<usize>,
    next_stamp: u64,
    limit: usize,
}

impl IoSlots {
    pub(crate) fn new(limit: usize) -> Self {
        IoSlots {
            slots: Vec::new(),
            free: Vec::new(),
            next_stamp: 1,
            limit,
        }
    }

    pub(crate) fn insert(&mut self, handler: Box<dyn FnMut(Readiness)>) -> Option<IoToken> {
        let stamp = self.next_stamp;
        self.next_stamp = self.next_stamp.wrapping_add(1);
        let slot = IoSlot {
            stamp,
            handler: Rc::new(RefCell::new(handler)),
        };
        let index = match self.free.pop() {
            Some(i) => {
                self.slots[i] = Some(slot);
                i
            }
            None => {
                if self.slots.len() >= self.limit {
                    return None;
                }
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        };
        Some(IoToken { index, stamp })
    }

    pub(crate) fn remove(&mut self, token: IoToken) {
        if let Some(Some(slot)) = self.slots.get(token.index) {
            if slot.stamp == token.stamp {
                self.slots[token.index] = None;
                self.free.push(token.index);
            }
        }
    }

    pub(crate) fn contains(&self, token: IoToken) -> bool {
        matches!(self.slots.get(token.index), Some(Some(s)) if s.stamp == token.stamp)
    }

    /// Looks up the handler for a raw slot index as reported by the OS wait.
    pub(crate) fn handler_at(
        &self,
        index: usize,
    ) -> Option<(u64, Rc<RefCell<Box<dyn FnMut(Readiness)>>>)> {
        match self.slots.get(index) {
            Some(Some(slot)) => Some((slot.stamp, slot.handler.clone())),
            _ => None,
        }
    }
}
