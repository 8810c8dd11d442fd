//! Strict-priority multiplexer of `PacketPass` input flows into one output.
//! Lower numeric priority wins; equal priorities are served in submission
//! order. Shares the busy/release lifecycle of the fair queue.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};

use bytes::Bytes;

use crate::flow::PacketPass;
use crate::reactor::{Job, Reactor};

pub struct PriorityQueue {
    core: Rc<QueueCore>,
}

struct QueueCore {
    reactor: Reactor,
    output: PacketPass,
    state: RefCell<QueueState>,
    advance_job: RefCell<Option<Job>>,
}

struct QueueState {
    /// Keyed by (priority, submission sequence); iteration order is the
    /// service order.
    waiting: BTreeMap<(u32, u64), Rc<FlowCore>>,
    seq: u64,
    sending: Option<Rc<FlowCore>>,
    stopping: bool,
}

pub struct PriorityQueueFlow {
    core: Rc<FlowCore>,
}

struct FlowCore {
    queue: Weak<QueueCore>,
    iface: PacketPass,
    priority: u32,
    pending: RefCell<Option<Bytes>>,
    queued_key: Cell<Option<(u32, u64)>>,
    active: Cell<bool>,
    removed: Cell<bool>,
    release_handler: RefCell<Option<Box<dyn FnMut()>>>,
}

impl PriorityQueue {
    pub fn new(reactor: &Reactor, output: PacketPass) -> Self {
        let core = Rc::new(QueueCore {
            reactor: reactor.clone(),
            output,
            state: RefCell::new(QueueState {
                waiting: BTreeMap::new(),
                seq: 0,
                sending: None,
                stopping: false,
            }),
            advance_job: RefCell::new(None),
        });

        let weak = Rc::downgrade(&core);
        let job = Job::new(move || {
            if let Some(core) = weak.upgrade() {
                QueueCore::advance(&core);
            }
        });
        *core.advance_job.borrow_mut() = Some(job);

        let weak = Rc::downgrade(&core);
        core.output.set_done_handler(move || {
            if let Some(core) = weak.upgrade() {
                QueueCore::on_output_done(&core);
            }
        });

        PriorityQueue { core }
    }

    pub fn mtu(&self) -> usize {
        self.core.output.mtu()
    }

    /// Creates a flow with a fixed priority; lower values are served first.
    pub fn create_flow(&self, priority: u32) -> PriorityQueueFlow {
        let flow = Rc::new(FlowCore {
            queue: Rc::downgrade(&self.core),
            iface: PacketPass::new(&self.core.reactor, self.core.output.mtu()),
            priority,
            pending: RefCell::new(None),
            queued_key: Cell::new(None),
            active: Cell::new(false),
            removed: Cell::new(false),
            release_handler: RefCell::new(None),
        });

        let weak = Rc::downgrade(&flow);
        flow.iface.set_send_handler(move |packet: Bytes| {
            if let Some(flow) = weak.upgrade() {
                FlowCore::on_submit(&flow, packet);
            }
        });

        PriorityQueueFlow { core: flow }
    }

    pub fn prepare_release(&self) {
        self.core.state.borrow_mut().stopping = true;
    }
}

impl Drop for PriorityQueue {
    fn drop(&mut self) {
        self.core.output.detach();
        if let Some(job) = self.core.advance_job.borrow().as_ref() {
            self.core.reactor.cancel_job(job);
        }
    }
}

impl QueueCore {
    fn schedule_advance(core: &Rc<QueueCore>) {
        if let Some(job) = core.advance_job.borrow().as_ref() {
            core.reactor.schedule_job(job);
        }
    }

    fn advance(core: &Rc<QueueCore>) {
        let chosen = {
            let mut state = core.state.borrow_mut();
            if state.stopping || state.sending.is_some() {
                return;
            }
            let mut chosen = None;
            while let Some((&key, _)) = state.waiting.iter().next() {
                let flow = state.waiting.remove(&key).unwrap();
                flow.queued_key.set(None);
                if flow.removed.get() || flow.pending.borrow().is_none() {
                    continue;
                }
                chosen = Some(flow);
                break;
            }
            if let Some(flow) = &chosen {
                flow.active.set(true);
                state.sending = Some(flow.clone());
            }
            chosen
        };
        if let Some(flow) = chosen {
            let packet = flow.pending.borrow().clone().expect("chosen flow has a packet");
            core.output.send(packet);
        }
    }

    fn on_output_done(core: &Rc<QueueCore>) {
        let flow = core.state.borrow_mut().sending.take();
        let Some(flow) = flow else { return };
        flow.active.set(false);
        *flow.pending.borrow_mut() = None;
        let handler = flow.release_handler.borrow_mut().take();
        if let Some(mut f) = handler {
            let job = Job::new(move || f());
            core.reactor.schedule_job(&job);
        }
        if !flow.removed.get() {
            flow.iface.done();
        }
        Self::schedule_advance(core);
    }
}

impl FlowCore {
    fn on_submit(flow: &Rc<FlowCore>, packet: Bytes) {
        debug_assert!(flow.pending.borrow().is_none());
        *flow.pending.borrow_mut() = Some(packet);
        let Some(queue) = flow.queue.upgrade() else { return };
        let mut state = queue.state.borrow_mut();
        if flow.queued_key.get().is_none() {
            let key = (flow.priority, state.seq);
            state.seq += 1;
            flow.queued_key.set(Some(key));
            state.waiting.insert(key, flow.clone());
        }
        drop(state);
        QueueCore::schedule_advance(&queue);
    }
}

impl PriorityQueueFlow {
    pub fn iface(&self) -> &PacketPass {
        &self.core.iface
    }

    pub fn priority(&self) -> u32 {
        self.core.priority
    }

    pub fn is_busy(&self) -> bool {
        self.core.active.get()
    }

    pub fn set_release_handler(&self, f: impl FnMut() + 'static) {
        debug_assert!(self.core.active.get());
        *self.core.release_handler.borrow_mut() = Some(Box::new(f));
    }
}

impl Drop for PriorityQueueFlow {
    fn drop(&mut self) {
        self.core.removed.set(true);
        if let Some(key) = self.core.queued_key.take() {
            if let Some(queue) = self.core.queue.upgrade() {
                queue.state.borrow_mut().waiting.remove(&key);
            }
        }
        self.core.iface.detach();
        *self.core.release_handler.borrow_mut() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tagging_output(
        reactor: &Reactor,
        served: Rc<RefCell<Vec<u8>>>,
        stop_after: usize,
    ) -> PacketPass {
        let output = PacketPass::new(reactor, 16);
        let iface = output.clone();
        let r = reactor.clone();
        output.set_send_handler(move |pkt: Bytes| {
            served.borrow_mut().push(pkt[0]);
            iface.done();
            if served.borrow().len() >= stop_after {
                r.quit(0);
            }
        });
        output
    }

    #[test]
    fn lower_priority_value_wins() {
        let reactor = Reactor::new().unwrap();
        let served = Rc::new(RefCell::new(Vec::new()));
        let output = tagging_output(&reactor, served.clone(), 4);
        let queue = PriorityQueue::new(&reactor, output);

        let low = queue.create_flow(7);
        let high = queue.create_flow(0);

        // Submit to the low-priority flow first; the high-priority flow must
        // still be served first because scheduling happens on the job, after
        // both submissions.
        low.iface().send(Bytes::from_static(&[7]));
        high.iface().send(Bytes::from_static(&[0]));

        // Keep both flows loaded: each resubmits exactly once more.
        for (flow, tag) in [(&low, 7u8), (&high, 0u8)] {
            let iface = flow.iface().clone();
            let sent_again = Rc::new(Cell::new(false));
            let s = sent_again.clone();
            flow.iface().set_done_handler(move || {
                if !s.get() {
                    s.set(true);
                    iface.send(Bytes::copy_from_slice(&[tag]));
                }
            });
        }

        assert_eq!(reactor.run(), 0);
        // High priority always ahead of low when both are pending.
        assert_eq!(*served.borrow(), vec![0, 0, 7, 7]);
    }

    #[test]
    fn equal_priorities_fifo() {
        let reactor = Reactor::new().unwrap();
        let served = Rc::new(RefCell::new(Vec::new()));
        let output = tagging_output(&reactor, served.clone(), 3);
        let queue = PriorityQueue::new(&reactor, output);

        let a = queue.create_flow(3);
        let b = queue.create_flow(3);
        let c = queue.create_flow(3);
        b.iface().send(Bytes::from_static(&[1]));
        a.iface().send(Bytes::from_static(&[0]));
        c.iface().send(Bytes::from_static(&[2]));

        assert_eq!(reactor.run(), 0);
        assert_eq!(*served.borrow(), vec![1, 0, 2]);
    }
}
