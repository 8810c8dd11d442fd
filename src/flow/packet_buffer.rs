//! Fixed-capacity packet buffer between a producing `BufferWriter` and a
//! downstream `PacketPass`. The writer side is a two-call API: reserve a
//! maximum-size slot, then commit the actual length. The consumer side is an
//! internal loop that drains committed packets downstream in FIFO order.
//!
//! The writer is deliberately conservative: it refuses a slot whenever a
//! *maximum-size* packet would not fit, so a refusal is never transient for
//! a packet that would actually have fit.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use bytes::{Bytes, BytesMut};

use crate::flow::{PacketPass, HEADER_LEN};
use crate::reactor::{Job, Reactor};

pub struct PacketBuffer {
    core: Rc<Core>,
}

/// Producer handle into the same buffer.
#[derive(Clone)]
pub struct BufferWriter {
    core: Rc<Core>,
}

struct Core {
    reactor: Reactor,
    output: PacketPass,
    mtu: usize,
    /// Total byte capacity, counting each packet's length header.
    capacity: usize,
    used: Cell<usize>,
    queue: RefCell<VecDeque<Bytes>>,
    scratch: RefCell<Option<BytesMut>>,
    writing: Cell<bool>,
    sending: Cell<bool>,
    submit_job: RefCell<Option<Job>>,
}

impl PacketBuffer {
    /// `num_packets` is the capacity in maximum-size packets.
    pub fn new(reactor: &Reactor, output: PacketPass, num_packets: usize) -> (PacketBuffer, BufferWriter) {
        assert!(num_packets >= 1);
        let mtu = output.mtu();
        let core = Rc::new(Core {
            reactor: reactor.clone(),
            output,
            mtu,
            capacity: num_packets * (mtu + HEADER_LEN),
            used: Cell::new(0),
            queue: RefCell::new(VecDeque::new()),
            scratch: RefCell::new(None),
            writing: Cell::new(false),
            sending: Cell::new(false),
            submit_job: RefCell::new(None),
        });

        let weak = Rc::downgrade(&core);
        let job = Job::new(move || {
            if let Some(core) = weak.upgrade() {
                Core::pump(&core);
            }
        });
        *core.submit_job.borrow_mut() = Some(job);

        let weak = Rc::downgrade(&core);
        core.output.set_done_handler(move || {
            if let Some(core) = weak.upgrade() {
                Core::on_output_done(&core);
            }
        });

        let writer = BufferWriter { core: core.clone() };
        (PacketBuffer { core }, writer)
    }
}

impl BufferWriter {
    pub fn mtu(&self) -> usize {
        self.core.mtu
    }

    /// Reserves a slot for one packet. Returns a zero-filled buffer of MTU
    /// length to write into, or `None` when the buffer is full.
    pub fn start_packet(&self) -> Option<BytesMut> {
        debug_assert!(!self.core.writing.get(), "start_packet while one is open");
        if self.core.capacity - self.core.used.get() < self.core.mtu + HEADER_LEN {
            return None;
        }
        self.core.writing.set(true);
        let mut buf = self
            .core
            .scratch
            .borrow_mut()
            .take()
            .unwrap_or_else(BytesMut::new);
        buf.clear();
        buf.resize(self.core.mtu, 0);
        Some(buf)
    }

    /// Commits the first `len` bytes of the slot obtained from
    /// `start_packet`. The packet becomes visible to the consumer loop via a
    /// deferred job.
    pub fn end_packet(&self, mut buf: BytesMut, len: usize) {
        debug_assert!(self.core.writing.get(), "end_packet without start_packet");
        debug_assert!(len <= self.core.mtu);
        self.core.writing.set(false);
        buf.truncate(len);
        self.core.used.set(self.core.used.get() + len + HEADER_LEN);
        self.core.queue.borrow_mut().push_back(buf.freeze());
        if let Some(job) = self.core.submit_job.borrow().as_ref() {
            self.core.reactor.schedule_job(job);
        }
    }
}

impl Core {
    fn pump(core: &Rc<Core>) {
        if core.sending.get() {
            return;
        }
        let next = core.queue.borrow().front().cloned();
        if let Some(pkt) = next {
            core.sending.set(true);
            core.output.send(pkt);
        }
    }

    fn on_output_done(core: &Rc<Core>) {
        let pkt = core.queue.borrow_mut().pop_front();
        let Some(pkt) = pkt else { return };
        core.used.set(core.used.get() - (pkt.len() + HEADER_LEN));
        // Try to reclaim the allocation for the next writer slot.
        if let Ok(buf) = pkt.try_into_mut() {
            let mut scratch = core.scratch.borrow_mut();
            if scratch.is_none() {
                *scratch = Some(buf);
            }
        }
        core.sending.set(false);
        Core::pump(core);
    }
}

impl Drop for PacketBuffer {
    fn drop(&mut self) {
        self.core.output.detach();
        if let Some(job) = self.core.submit_job.borrow().as_ref() {
            self.core.reactor.cancel_job(job);
        }
    }
}
