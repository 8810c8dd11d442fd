//! Round-robin multiplexer of N `PacketPass` input flows into one output.
//!
//! Exactly one flow occupies the output at any time. A completed flow goes
//! to the back of the line, which yields the round-robin guarantee: every
//! flow with a pending packet is served at least once per N outputs.
//!
//! Teardown uses the prepare-release protocol: `prepare_release` inhibits
//! new activations, and a flow that is mid-transmission gets its release
//! handler called (on a reactor job) once the output lets go of its buffer.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::{Rc, Weak};

use bytes::Bytes;

use crate::flow::PacketPass;
use crate::reactor::{Job, Reactor};

pub struct FairQueue {
    core: Rc<QueueCore>,
}

struct QueueCore {
    reactor: Reactor,
    output: PacketPass,
    state: RefCell<QueueState>,
    advance_job: RefCell<Option<Job>>,
}

struct QueueState {
    waiting: VecDeque<Rc<FlowCore>>,
    sending: Option<Rc<FlowCore>>,
    stopping: bool,
}

pub struct FairQueueFlow {
    core: Rc<FlowCore>,
}

struct FlowCore {
    queue: Weak<QueueCore>,
    iface: PacketPass,
    pending: RefCell<Option<Bytes>>,
    queued: Cell<bool>,
    active: Cell<bool>,
    suspend_requested: Cell<bool>,
    suspended: Cell<bool>,
    removed: Cell<bool>,
    release_handler: RefCell<Option<Box<dyn FnMut()>>>,
}

impl FairQueue {
    pub fn new(reactor: &Reactor, output: PacketPass) -> Self {
        let core = Rc::new(QueueCore {
            reactor: reactor.clone(),
            output,
            state: RefCell::new(QueueState {
                waiting: VecDeque::new(),
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

        FairQueue { core }
    }

    pub fn mtu(&self) -> usize {
        self.core.output.mtu()
    }

    /// Creates a new input flow. The returned handle's `iface()` is what the
    /// sender talks to.
    pub fn create_flow(&self) -> FairQueueFlow {
        let flow = Rc::new(FlowCore {
            queue: Rc::downgrade(&self.core),
            iface: PacketPass::new(&self.core.reactor, self.core.output.mtu()),
            pending: RefCell::new(None),
            queued: Cell::new(false),
            active: Cell::new(false),
            suspend_requested: Cell::new(false),
            suspended: Cell::new(false),
            removed: Cell::new(false),
            release_handler: RefCell::new(None),
        });

        let weak = Rc::downgrade(&flow);
        flow.iface.set_send_handler(move |packet: Bytes| {
            if let Some(flow) = weak.upgrade() {
                FlowCore::on_submit(&flow, packet);
            }
        });

        FairQueueFlow { core: flow }
    }

    /// First phase of teardown: no flow becomes active after this. Flows can
    /// then be dropped one by one, using release handlers for the one that
    /// is still occupying the output.
    pub fn prepare_release(&self) {
        self.core.state.borrow_mut().stopping = true;
    }
}

impl Drop for FairQueue {
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
            while let Some(flow) = state.waiting.pop_front() {
                flow.queued.set(false);
                if flow.removed.get() || flow.suspended.get() {
                    continue;
                }
                if flow.pending.borrow().is_none() {
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
        if flow.suspend_requested.get() {
            flow.suspend_requested.set(false);
            flow.suspended.set(true);
        }
        // Release handler fires on its own job, never from inside the
        // output's completion path.
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
        if flow.suspended.get() {
            return;
        }
        if !flow.queued.get() {
            flow.queued.set(true);
            queue.state.borrow_mut().waiting.push_back(flow.clone());
        }
        QueueCore::schedule_advance(&queue);
    }
}

impl FairQueueFlow {
    /// The `PacketPass` endpoint the sender submits into.
    pub fn iface(&self) -> &PacketPass {
        &self.core.iface
    }

    /// Whether this flow currently occupies the queue output.
    pub fn is_busy(&self) -> bool {
        self.core.active.get()
    }

    /// Registers the handler called exactly once when the flow stops being
    /// busy. Only meaningful while busy, as part of the release protocol.
    pub fn set_release_handler(&self, f: impl FnMut() + 'static) {
        debug_assert!(self.core.active.get());
        *self.core.release_handler.borrow_mut() = Some(Box::new(f));
    }

    /// Excludes the flow from scheduling. Takes effect immediately when the
    /// flow is idle or waiting; a busy flow is suspended once the output
    /// completes its packet.
    pub fn suspend(&self) {
        if self.core.active.get() {
            self.core.suspend_requested.set(true);
        } else {
            self.core.suspended.set(true);
        }
    }

    pub fn resume(&self) {
        self.core.suspend_requested.set(false);
        if !self.core.suspended.get() {
            return;
        }
        self.core.suspended.set(false);
        if self.core.pending.borrow().is_some() {
            if let Some(queue) = self.core.queue.upgrade() {
                if !self.core.queued.get() {
                    self.core.queued.set(true);
                    queue.state.borrow_mut().waiting.push_back(self.core.clone());
                }
                QueueCore::schedule_advance(&queue);
            }
        }
    }
}

impl Drop for FairQueueFlow {
    fn drop(&mut self) {
        self.core.removed.set(true);
        self.core.iface.detach();
        *self.core.release_handler.borrow_mut() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Output endpoint recording the payload tag of every packet.
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

    /// Wires a flow whose sender resubmits a one-byte packet (its tag)
    /// every time the previous one completes.
    fn perpetual_sender(flow: &FairQueueFlow, tag: u8) {
        let iface = flow.iface().clone();
        let resend = iface.clone();
        iface.set_done_handler(move || {
            resend.send(Bytes::copy_from_slice(&[tag]));
        });
        iface.send(Bytes::copy_from_slice(&[tag]));
    }

    #[test]
    fn round_robin_across_busy_flows() {
        let reactor = Reactor::new().unwrap();
        let served = Rc::new(RefCell::new(Vec::new()));
        let output = tagging_output(&reactor, served.clone(), 9);
        let queue = FairQueue::new(&reactor, output);

        let flows: Vec<FairQueueFlow> = (0..3).map(|_| queue.create_flow()).collect();
        for (i, flow) in flows.iter().enumerate() {
            perpetual_sender(flow, i as u8);
        }

        assert_eq!(reactor.run(), 0);
        let served = served.borrow();
        assert_eq!(served.len(), 9);
        // Every flow appears exactly once in every window of three outputs.
        for window in served.chunks(3) {
            let mut tags: Vec<u8> = window.to_vec();
            tags.sort_unstable();
            assert_eq!(tags, vec![0, 1, 2]);
        }
    }

    #[test]
    fn suspended_flow_is_skipped_until_resume() {
        let reactor = Reactor::new().unwrap();
        let served: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
        let flows: Rc<RefCell<Vec<FairQueueFlow>>> = Rc::new(RefCell::new(Vec::new()));

        // Resume the suspended flow after four packets from the other one;
        // quit once the resumed flow has been served.
        let output = PacketPass::new(&reactor, 16);
        let iface = output.clone();
        let r = reactor.clone();
        let s = served.clone();
        let fl = flows.clone();
        output.set_send_handler(move |pkt: Bytes| {
            s.borrow_mut().push(pkt[0]);
            iface.done();
            let len = s.borrow().len();
            if len == 4 {
                assert_eq!(*s.borrow(), vec![0, 0, 0, 0]);
                fl.borrow()[1].resume();
            }
            if s.borrow().contains(&1) {
                r.quit(0);
            } else if len > 16 {
                r.quit(1);
            }
        });
        let queue = FairQueue::new(&reactor, output);

        let a = queue.create_flow();
        let b = queue.create_flow();
        b.suspend();
        perpetual_sender(&a, 0);
        perpetual_sender(&b, 1);
        flows.borrow_mut().push(a);
        flows.borrow_mut().push(b);

        assert_eq!(reactor.run(), 0);
        assert!(served.borrow().contains(&1));
    }

    #[test]
    fn prepare_release_frees_busy_flow_via_handler() {
        let reactor = Reactor::new().unwrap();

        // Output that holds on to the first packet until told to finish.
        let output = PacketPass::new(&reactor, 16);
        let queue = FairQueue::new(&reactor, output.clone());

        let flow = queue.create_flow();
        let sent = Rc::new(Cell::new(false));
        let s = sent.clone();
        output.set_send_handler(move |_pkt| {
            // Deliberately do not complete; the flow stays busy.
            s.set(true);
        });

        flow.iface().send(Bytes::from_static(b"x"));
        reactor.flush_pending();
        assert!(sent.get());
        assert!(flow.is_busy());

        // Two-phase teardown: inhibit activations, then wait for release.
        queue.prepare_release();
        let released = Rc::new(Cell::new(0u32));
        let rel = released.clone();
        let r = reactor.clone();
        flow.set_release_handler(move || {
            rel.set(rel.get() + 1);
            r.quit(0);
        });

        // The output finally completes the in-flight packet.
        output.done();
        assert_eq!(reactor.run(), 0);
        assert_eq!(released.get(), 1);
        assert!(!flow.is_busy());
    }
}
