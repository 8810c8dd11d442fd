//! The four packet-flow interfaces. Each is a shared two-sided handle: the
//! receiving/producing side installs the operation handler, the initiating
//! side installs the done handler. Completions are always delivered through
//! a reactor job, never synchronously from the initiating call, which is
//! what keeps arbitrarily deep pipelines free of re-entrance.
//!
//! Buffer discipline: pass-direction operations transfer an immutable
//! `Bytes`; recv-direction operations lend an empty `BytesMut` plus a byte
//! limit to the producer and get it back filled. Ownership moving through
//! the interface is what enforces "the buffer stays untouched until done".

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use bytes::{Bytes, BytesMut};

use crate::reactor::{Job, Reactor};

/// Runs a handler slot with the box temporarily taken out, so the handler
/// may be replaced or cleared from within its own invocation.
fn invoke<A>(slot: &RefCell<Option<Box<dyn FnMut(A)>>>, arg: A) {
    let taken = slot.borrow_mut().take();
    if let Some(mut f) = taken {
        f(arg);
        let mut s = slot.borrow_mut();
        if s.is_none() {
            *s = Some(f);
        }
    }
}

// ---------------------------------------------------------------------------
// PacketPass
// ---------------------------------------------------------------------------

/// Sender-initiated, whole-packet interface with a fixed MTU. The receiver
/// must eventually call `done()` for every `send`.
#[derive(Clone)]
pub struct PacketPass {
    core: Rc<PacketPassCore>,
}

struct PacketPassCore {
    reactor: Reactor,
    mtu: usize,
    busy: Cell<bool>,
    on_send: RefCell<Option<Box<dyn FnMut(Bytes)>>>,
    on_done: RefCell<Option<Box<dyn FnMut(())>>>,
    done_job: RefCell<Option<Job>>,
}

impl PacketPass {
    pub fn new(reactor: &Reactor, mtu: usize) -> Self {
        let core = Rc::new(PacketPassCore {
            reactor: reactor.clone(),
            mtu,
            busy: Cell::new(false),
            on_send: RefCell::new(None),
            on_done: RefCell::new(None),
            done_job: RefCell::new(None),
        });
        let weak = Rc::downgrade(&core);
        let job = Job::new(move || {
            if let Some(core) = weak.upgrade() {
                core.busy.set(false);
                invoke(&core.on_done, ());
            }
        });
        *core.done_job.borrow_mut() = Some(job);
        PacketPass { core }
    }

    pub fn mtu(&self) -> usize {
        self.core.mtu
    }

    pub fn is_busy(&self) -> bool {
        self.core.busy.get()
    }

    /// Receiver side: handler invoked for each submitted packet.
    pub fn set_send_handler(&self, f: impl FnMut(Bytes) + 'static) {
        *self.core.on_send.borrow_mut() = Some(Box::new(f));
    }

    /// Sender side: handler invoked (via job) when the packet is consumed.
    pub fn set_done_handler(&self, f: impl FnMut() + 'static) {
        let mut f = f;
        *self.core.on_done.borrow_mut() = Some(Box::new(move |()| f()));
    }

    pub fn send(&self, packet: Bytes) {
        debug_assert!(!self.core.busy.get(), "send while operation outstanding");
        debug_assert!(packet.len() <= self.core.mtu);
        self.core.busy.set(true);
        invoke(&self.core.on_send, packet);
    }

    pub fn done(&self) {
        debug_assert!(self.core.busy.get(), "done without outstanding send");
        if let Some(job) = self.core.done_job.borrow().as_ref() {
            self.core.reactor.schedule_job(job);
        }
    }

    /// Clears both sides' handlers and any queued completion. Allowed only
    /// during teardown.
    pub fn detach(&self) {
        *self.core.on_send.borrow_mut() = None;
        *self.core.on_done.borrow_mut() = None;
        if let Some(job) = self.core.done_job.borrow().as_ref() {
            self.core.reactor.cancel_job(job);
        }
    }
}

// ---------------------------------------------------------------------------
// StreamPass
// ---------------------------------------------------------------------------

/// Sender-initiated byte-stream interface; the receiver consumes at least
/// one byte per operation and reports the amount via `done(consumed)`.
#[derive(Clone)]
pub struct StreamPass {
    core: Rc<StreamPassCore>,
}

struct StreamPassCore {
    reactor: Reactor,
    busy: Cell<bool>,
    in_flight_len: Cell<usize>,
    consumed: Cell<usize>,
    on_send: RefCell<Option<Box<dyn FnMut(Bytes)>>>,
    on_done: RefCell<Option<Box<dyn FnMut(usize)>>>,
    done_job: RefCell<Option<Job>>,
}

impl StreamPass {
    pub fn new(reactor: &Reactor) -> Self {
        let core = Rc::new(StreamPassCore {
            reactor: reactor.clone(),
            busy: Cell::new(false),
            in_flight_len: Cell::new(0),
            consumed: Cell::new(0),
            on_send: RefCell::new(None),
            on_done: RefCell::new(None),
            done_job: RefCell::new(None),
        });
        let weak = Rc::downgrade(&core);
        let job = Job::new(move || {
            if let Some(core) = weak.upgrade() {
                core.busy.set(false);
                let n = core.consumed.get();
                invoke(&core.on_done, n);
            }
        });
        *core.done_job.borrow_mut() = Some(job);
        StreamPass { core }
    }

    pub fn is_busy(&self) -> bool {
        self.core.busy.get()
    }

    pub fn set_send_handler(&self, f: impl FnMut(Bytes) + 'static) {
        *self.core.on_send.borrow_mut() = Some(Box::new(f));
    }

    pub fn set_done_handler(&self, f: impl FnMut(usize) + 'static) {
        *self.core.on_done.borrow_mut() = Some(Box::new(f));
    }

    pub fn send(&self, data: Bytes) {
        debug_assert!(!self.core.busy.get(), "send while operation outstanding");
        debug_assert!(!data.is_empty());
        self.core.busy.set(true);
        self.core.in_flight_len.set(data.len());
        invoke(&self.core.on_send, data);
    }

    /// Receiver side; `1 <= consumed <= len of the in-flight data`.
    pub fn done(&self, consumed: usize) {
        debug_assert!(self.core.busy.get(), "done without outstanding send");
        debug_assert!(consumed >= 1 && consumed <= self.core.in_flight_len.get());
        self.core.consumed.set(consumed);
        if let Some(job) = self.core.done_job.borrow().as_ref() {
            self.core.reactor.schedule_job(job);
        }
    }

    pub fn detach(&self) {
        *self.core.on_send.borrow_mut() = None;
        *self.core.on_done.borrow_mut() = None;
        if let Some(job) = self.core.done_job.borrow().as_ref() {
            self.core.reactor.cancel_job(job);
        }
    }
}

// ---------------------------------------------------------------------------
// PacketRecv
// ---------------------------------------------------------------------------

/// Receiver-initiated whole-packet interface. The receiver lends an empty
/// buffer and a limit; the producer returns it holding one packet.
#[derive(Clone)]
pub struct PacketRecv {
    core: Rc<PacketRecvCore>,
}

struct PacketRecvCore {
    reactor: Reactor,
    busy: Cell<bool>,
    limit: Cell<usize>,
    result: RefCell<Option<BytesMut>>,
    on_recv: RefCell<Option<Box<dyn FnMut(BytesMut, usize)>>>,
    on_done: RefCell<Option<Box<dyn FnMut(BytesMut)>>>,
    done_job: RefCell<Option<Job>>,
}

impl PacketRecv {
    pub fn new(reactor: &Reactor) -> Self {
        let core = Rc::new(PacketRecvCore {
            reactor: reactor.clone(),
            busy: Cell::new(false),
            limit: Cell::new(0),
            result: RefCell::new(None),
            on_recv: RefCell::new(None),
            on_done: RefCell::new(None),
            done_job: RefCell::new(None),
        });
        let weak = Rc::downgrade(&core);
        let job = Job::new(move || {
            if let Some(core) = weak.upgrade() {
                core.busy.set(false);
                if let Some(buf) = core.result.borrow_mut().take() {
                    invoke2(&core.on_done, buf);
                }
            }
        });
        *core.done_job.borrow_mut() = Some(job);
        PacketRecv { core }
    }

    pub fn is_busy(&self) -> bool {
        self.core.busy.get()
    }

    /// Producer side: handler receives the lent buffer and the byte limit.
    pub fn set_recv_handler(&self, f: impl FnMut(BytesMut, usize) + 'static) {
        *self.core.on_recv.borrow_mut() = Some(Box::new(f));
    }

    /// Receiver side: handler gets the buffer back, filled with one packet.
    pub fn set_done_handler(&self, f: impl FnMut(BytesMut) + 'static) {
        *self.core.on_done.borrow_mut() = Some(Box::new(f));
    }

    pub fn recv(&self, buf: BytesMut, max: usize) {
        debug_assert!(!self.core.busy.get(), "recv while operation outstanding");
        debug_assert!(buf.is_empty());
        debug_assert!(max >= 1);
        self.core.busy.set(true);
        self.core.limit.set(max);
        let taken = self.core.on_recv.borrow_mut().take();
        if let Some(mut f) = taken {
            f(buf, max);
            let mut s = self.core.on_recv.borrow_mut();
            if s.is_none() {
                *s = Some(f);
            }
        }
    }

    pub fn done(&self, filled: BytesMut) {
        debug_assert!(self.core.busy.get(), "done without outstanding recv");
        debug_assert!(filled.len() >= 1 && filled.len() <= self.core.limit.get());
        *self.core.result.borrow_mut() = Some(filled);
        if let Some(job) = self.core.done_job.borrow().as_ref() {
            self.core.reactor.schedule_job(job);
        }
    }

    pub fn detach(&self) {
        *self.core.on_recv.borrow_mut() = None;
        *self.core.on_done.borrow_mut() = None;
        if let Some(job) = self.core.done_job.borrow().as_ref() {
            self.core.reactor.cancel_job(job);
        }
    }
}

// ---------------------------------------------------------------------------
// StreamRecv
// ---------------------------------------------------------------------------

/// Receiver-initiated byte-stream interface; the producer fills at least one
/// byte, at most the lent limit.
#[derive(Clone)]
pub struct StreamRecv {
    core: Rc<StreamRecvCore>,
}

struct StreamRecvCore {
    reactor: Reactor,
    busy: Cell<bool>,
    limit: Cell<usize>,
    result: RefCell<Option<BytesMut>>,
    on_recv: RefCell<Option<Box<dyn FnMut(BytesMut, usize)>>>,
    on_done: RefCell<Option<Box<dyn FnMut(BytesMut)>>>,
    done_job: RefCell<Option<Job>>,
}

impl StreamRecv {
    pub fn new(reactor: &Reactor) -> Self {
        let core = Rc::new(StreamRecvCore {
            reactor: reactor.clone(),
            busy: Cell::new(false),
            limit: Cell::new(0),
            result: RefCell::new(None),
            on_recv: RefCell::new(None),
            on_done: RefCell::new(None),
            done_job: RefCell::new(None),
        });
        let weak = Rc::downgrade(&core);
        let job = Job::new(move || {
            if let Some(core) = weak.upgrade() {
                core.busy.set(false);
                if let Some(buf) = core.result.borrow_mut().take() {
                    invoke2(&core.on_done, buf);
                }
            }
        });
        *core.done_job.borrow_mut() = Some(job);
        StreamRecv { core }
    }

    pub fn is_busy(&self) -> bool {
        self.core.busy.get()
    }

    pub fn set_recv_handler(&self, f: impl FnMut(BytesMut, usize) + 'static) {
        *self.core.on_recv.borrow_mut() = Some(Box::new(f));
    }

    pub fn set_done_handler(&self, f: impl FnMut(BytesMut) + 'static) {
        *self.core.on_done.borrow_mut() = Some(Box::new(f));
    }

    pub fn recv(&self, buf: BytesMut, max: usize) {
        debug_assert!(!self.core.busy.get(), "recv while operation outstanding");
        debug_assert!(buf.is_empty());
        debug_assert!(max >= 1);
        self.core.busy.set(true);
        self.core.limit.set(max);
        let taken = self.core.on_recv.borrow_mut().take();
        if let Some(mut f) = taken {
            f(buf, max);
            let mut s = self.core.on_recv.borrow_mut();
            if s.is_none() {
                *s = Some(f);
            }
        }
    }

    pub fn done(&self, filled: BytesMut) {
        debug_assert!(self.core.busy.get(), "done without outstanding recv");
        debug_assert!(filled.len() >= 1 && filled.len() <= self.core.limit.get());
        *self.core.result.borrow_mut() = Some(filled);
        if let Some(job) = self.core.done_job.borrow().as_ref() {
            self.core.reactor.schedule_job(job);
        }
    }

    pub fn detach(&self) {
        *self.core.on_recv.borrow_mut() = None;
        *self.core.on_done.borrow_mut() = None;
        if let Some(job) = self.core.done_job.borrow().as_ref() {
            self.core.reactor.cancel_job(job);
        }
    }
}

/// Like `invoke` for the buffer-returning done handlers.
fn invoke2(slot: &RefCell<Option<Box<dyn FnMut(BytesMut)>>>, buf: BytesMut) {
    let taken = slot.borrow_mut().take();
    if let Some(mut f) = taken {
        f(buf);
        let mut s = slot.borrow_mut();
        if s.is_none() {
            *s = Some(f);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::Reactor;

    #[test]
    fn packet_pass_done_is_deferred() {
        let reactor = Reactor::new().unwrap();
        let iface = PacketPass::new(&reactor, 100);

        let got: Rc<RefCell<Vec<Bytes>>> = Rc::new(RefCell::new(Vec::new()));
        let done_count = Rc::new(Cell::new(0));

        let g = got.clone();
        let receiver_iface = iface.clone();
        iface.set_send_handler(move |pkt| {
            g.borrow_mut().push(pkt);
            // Completing from within the send handler must not call the
            // sender's done handler synchronously.
            receiver_iface.done();
        });
        let d = done_count.clone();
        let r = reactor.clone();
        iface.set_done_handler(move || {
            d.set(d.get() + 1);
            r.quit(0);
        });

        iface.send(Bytes::from_static(b"hello"));
        assert!(iface.is_busy());
        // Not yet: completion travels through the job queue.
        assert_eq!(done_count.get(), 0);
        assert_eq!(reactor.run(), 0);
        assert_eq!(done_count.get(), 1);
        assert!(!iface.is_busy());
        assert_eq!(got.borrow()[0].as_ref(), b"hello");
    }

    #[test]
    fn stream_pass_partial_consume_resend() {
        let reactor = Reactor::new().unwrap();
        let iface = StreamPass::new(&reactor);

        // Receiver consumes at most 3 bytes per operation.
        let sink: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
        let s = sink.clone();
        let recv_side = iface.clone();
        iface.set_send_handler(move |data| {
            let n = data.len().min(3);
            s.borrow_mut().extend_from_slice(&data[..n]);
            recv_side.done(n);
        });

        // Sender re-sends the unconsumed tail until everything went through.
        let payload = Rc::new(RefCell::new(Bytes::from_static(b"abcdefgh")));
        let send_side = iface.clone();
        let p = payload.clone();
        let r = reactor.clone();
        iface.set_done_handler(move |consumed| {
            let rest = p.borrow().slice(consumed..);
            if rest.is_empty() {
                r.quit(0);
            } else {
                *p.borrow_mut() = rest.clone();
                send_side.send(rest);
            }
        });

        let first = payload.borrow().clone();
        iface.send(first);
        assert_eq!(reactor.run(), 0);
        assert_eq!(sink.borrow().as_slice(), b"abcdefgh");
    }

    #[test]
    fn stream_recv_round_trip() {
        let reactor = Reactor::new().unwrap();
        let iface = StreamRecv::new(&reactor);

        let producer_side = iface.clone();
        iface.set_recv_handler(move |mut buf, max| {
            let data = b"xyz";
            let n = data.len().min(max);
            buf.extend_from_slice(&data[..n]);
            producer_side.done(buf);
        });

        let got: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
        let g = got.clone();
        let r = reactor.clone();
        iface.set_done_handler(move |buf| {
            g.borrow_mut().extend_from_slice(&buf);
            r.quit(0);
        });

        iface.recv(BytesMut::with_capacity(16), 16);
        assert_eq!(reactor.run(), 0);
        assert_eq!(got.borrow().as_slice(), b"xyz");
    }
}
