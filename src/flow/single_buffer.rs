//! One-slot pump between a `PacketRecv` producer and a `PacketPass`
//! consumer. Holds a single packet at a time, so ordering is trivially FIFO
//! and the producer is back-pressured by the consumer.

use std::cell::RefCell;
use std::rc::Rc;

use bytes::BytesMut;

use crate::flow::{PacketPass, PacketRecv};
use crate::reactor::{Job, Reactor};

pub struct SinglePacketBuffer {
    core: Rc<Core>,
}

struct Core {
    input: PacketRecv,
    output: PacketPass,
    mtu: usize,
    scratch: RefCell<Option<BytesMut>>,
}

impl SinglePacketBuffer {
    pub fn new(reactor: &Reactor, input: PacketRecv, output: PacketPass) -> Self {
        let mtu = output.mtu();
        let core = Rc::new(Core {
            input,
            output,
            mtu,
            scratch: RefCell::new(None),
        });

        let weak = Rc::downgrade(&core);
        core.input.set_done_handler(move |buf: BytesMut| {
            if let Some(core) = weak.upgrade() {
                core.output.send(buf.freeze());
            }
        });

        let weak = Rc::downgrade(&core);
        core.output.set_done_handler(move || {
            if let Some(core) = weak.upgrade() {
                Core::start_recv(&core);
            }
        });

        // First pull happens from the reactor, once the rest of the pipeline
        // had a chance to finish initializing. The queue keeps the job alive
        // until it fires.
        let weak = Rc::downgrade(&core);
        let start = Job::new(move || {
            if let Some(core) = weak.upgrade() {
                Core::start_recv(&core);
            }
        });
        reactor.schedule_job(&start);

        SinglePacketBuffer { core }
    }
}

impl Core {
    fn start_recv(core: &Rc<Core>) {
        let mut buf = core
            .scratch
            .borrow_mut()
            .take()
            .unwrap_or_else(|| BytesMut::with_capacity(core.mtu));
        buf.clear();
        core.input.recv(buf, core.mtu);
    }
}

impl Drop for SinglePacketBuffer {
    fn drop(&mut self) {
        self.core.input.detach();
        self.core.output.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::cell::Cell;

    #[test]
    fn packets_flow_in_order() {
        let reactor = Reactor::new().unwrap();
        let input = PacketRecv::new(&reactor);
        let output = PacketPass::new(&reactor, 64);

        // Producer: three packets, then silence.
        let produced = Rc::new(Cell::new(0u32));
        let p = produced.clone();
        let prod_iface = input.clone();
        input.set_recv_handler(move |mut buf, _max| {
            let n = p.get();
            if n < 3 {
                p.set(n + 1);
                buf.extend_from_slice(format!("pkt{}", n).as_bytes());
                prod_iface.done(buf);
            }
        });

        // Consumer: collect and ack.
        let got: Rc<RefCell<Vec<Bytes>>> = Rc::new(RefCell::new(Vec::new()));
        let g = got.clone();
        let out_iface = output.clone();
        let r = reactor.clone();
        output.set_send_handler(move |pkt| {
            g.borrow_mut().push(pkt);
            out_iface.done();
            if g.borrow().len() == 3 {
                r.quit(0);
            }
        });

        let _buffer = SinglePacketBuffer::new(&reactor, input, output);
        assert_eq!(reactor.run(), 0);
        let got = got.borrow();
        assert_eq!(got.len(), 3);
        assert_eq!(got[0].as_ref(), b"pkt0");
        assert_eq!(got[1].as_ref(), b"pkt1");
        assert_eq!(got[2].as_ref(), b"pkt2");
    }
}
