//! Length-prefixed record framing over byte streams: a 2-byte little-endian
//! length followed by that many payload bytes. The decoder turns a
//! `StreamRecv` byte source into whole packets on a `PacketPass`; the
//! encoder is its symmetric sender.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::flow::{PacketPass, StreamPass, StreamRecv};
use crate::reactor::{Job, Reactor};

/// Length header size on the wire.
pub const HEADER_LEN: usize = 2;

/// Reassembles length-prefixed records from a byte stream.
///
/// A record longer than the output MTU fires the fail handler exactly once
/// and permanently stops the decoder; no partial packet is ever delivered.
pub struct PacketProtoDecoder {
    core: Rc<DecoderCore>,
}

struct DecoderCore {
    input: StreamRecv,
    output: PacketPass,
    mtu: usize,
    acc: RefCell<BytesMut>,
    delivering: Cell<bool>,
    failed: Cell<bool>,
    on_fail: RefCell<Option<Box<dyn FnMut()>>>,
}

impl PacketProtoDecoder {
    pub fn new(
        reactor: &Reactor,
        input: StreamRecv,
        output: PacketPass,
        on_fail: impl FnMut() + 'static,
    ) -> Self {
        let mtu = output.mtu();
        let core = Rc::new(DecoderCore {
            input,
            output,
            mtu,
            acc: RefCell::new(BytesMut::with_capacity(mtu + HEADER_LEN)),
            delivering: Cell::new(false),
            failed: Cell::new(false),
            on_fail: RefCell::new(Some(Box::new(on_fail))),
        });

        let weak = Rc::downgrade(&core);
        core.input.set_done_handler(move |chunk: BytesMut| {
            if let Some(core) = weak.upgrade() {
                if core.failed.get() {
                    return;
                }
                core.acc.borrow_mut().extend_from_slice(&chunk);
                DecoderCore::process(&core);
            }
        });

        let weak = Rc::downgrade(&core);
        core.output.set_done_handler(move || {
            if let Some(core) = weak.upgrade() {
                core.delivering.set(false);
                DecoderCore::process(&core);
            }
        });

        let weak = Rc::downgrade(&core);
        let start = Job::new(move || {
            if let Some(core) = weak.upgrade() {
                DecoderCore::request(&core);
            }
        });
        reactor.schedule_job(&start);

        PacketProtoDecoder { core }
    }
}

impl DecoderCore {
    fn request(core: &Rc<DecoderCore>) {
        let have = core.acc.borrow().len();
        let room = core.mtu + HEADER_LEN - have;
        debug_assert!(room >= 1);
        core.input.recv(BytesMut::with_capacity(room), room);
    }

    fn process(core: &Rc<DecoderCore>) {
        loop {
            if core.delivering.get() || core.failed.get() {
                return;
            }
            let have = core.acc.borrow().len();
            if have < HEADER_LEN {
                Self::request(core);
                return;
            }
            let len = {
                let acc = core.acc.borrow();
                u16::from_le_bytes([acc[0], acc[1]]) as usize
            };
            if len > core.mtu {
                core.failed.set(true);
                let taken = core.on_fail.borrow_mut().take();
                if let Some(mut f) = taken {
                    f();
                }
                return;
            }
            if have < HEADER_LEN + len {
                Self::request(core);
                return;
            }
            let packet = {
                let mut acc = core.acc.borrow_mut();
                acc.advance(HEADER_LEN);
                acc.split_to(len).freeze()
            };
            core.delivering.set(true);
            core.output.send(packet);
        }
    }
}

/// Prepends the length header to each submitted packet and streams the
/// result to a `StreamPass` downstream, re-sending tails across partial
/// consumes. The packet is acknowledged once its last byte went out.
pub struct PacketProtoEncoder {
    core: Rc<EncoderCore>,
}

struct EncoderCore {
    input: PacketPass,
    output: StreamPass,
    pending: RefCell<Option<Bytes>>,
}

impl PacketProtoEncoder {
    pub fn new(_reactor: &Reactor, input: PacketPass, output: StreamPass) -> Self {
        let core = Rc::new(EncoderCore {
            input,
            output,
            pending: RefCell::new(None),
        });

        let weak = Rc::downgrade(&core);
        core.input.set_send_handler(move |packet: Bytes| {
            if let Some(core) = weak.upgrade() {
                debug_assert!(core.pending.borrow().is_none());
                debug_assert!(packet.len() <= u16::MAX as usize);
                let mut framed = BytesMut::with_capacity(HEADER_LEN + packet.len());
                framed.put_u16_le(packet.len() as u16);
                framed.extend_from_slice(&packet);
                let framed = framed.freeze();
                *core.pending.borrow_mut() = Some(framed.clone());
                core.output.send(framed);
            }
        });

        let weak = Rc::downgrade(&core);
        core.output.set_done_handler(move |consumed: usize| {
            if let Some(core) = weak.upgrade() {
                let rest = {
                    let mut pending = core.pending.borrow_mut();
                    let data = pending.take().expect("done without pending frame");
                    let rest = data.slice(consumed..);
                    if !rest.is_empty() {
                        *pending = Some(rest.clone());
                    }
                    rest
                };
                if rest.is_empty() {
                    core.input.done();
                } else {
                    core.output.send(rest);
                }
            }
        });

        PacketProtoEncoder { core }
    }
}

impl Drop for PacketProtoEncoder {
    fn drop(&mut self) {
        self.core.input.detach();
        self.core.output.detach();
    }
}

impl Drop for PacketProtoDecoder {
    fn drop(&mut self) {
        self.core.input.detach();
        self.core.output.detach();
    }
}
