//! Non-blocking datagram socket with `PacketPass` send and `PacketRecv`
//! receive endpoints. The send side targets a configurable remote address;
//! zero-length incoming datagrams are dropped because a receive completion
//! must carry at least one byte.

use std::cell::{Cell, RefCell};
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;

use bytes::{Bytes, BytesMut};
use mio::net::UdpSocket;
use mio::Interest;
use tracing::debug;

use crate::flow::{PacketPass, PacketRecv};
use crate::reactor::{IoToken, Readiness, Reactor};

/// Fatal notification for a datagram socket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DatagramEvent {
    Error,
}

pub struct Datagram {
    core: Rc<DgramCore>,
}

struct DgramCore {
    reactor: Reactor,
    socket: RefCell<UdpSocket>,
    token: Cell<Option<IoToken>>,
    send_addr: Cell<Option<SocketAddr>>,
    on_event: RefCell<Option<Box<dyn FnMut(DatagramEvent)>>>,
    send_iface: PacketPass,
    send_pending: RefCell<Option<Bytes>>,
    recv_iface: PacketRecv,
    recv_pending: RefCell<Option<(BytesMut, usize)>>,
    errored: Cell<bool>,
}

impl Datagram {
    pub fn bind(
        reactor: &Reactor,
        addr: SocketAddr,
        mtu: usize,
        on_event: impl FnMut(DatagramEvent) + 'static,
    ) -> io::Result<Datagram> {
        let raw = socket2::Socket::new(
            socket2::Domain::for_address(addr),
            socket2::Type::DGRAM,
            Some(socket2::Protocol::UDP),
        )?;
        raw.set_nonblocking(true)?;
        raw.set_reuse_address(true)?;
        raw.bind(&addr.into())?;
        let socket = UdpSocket::from_std(raw.into());
        let core = Rc::new(DgramCore {
            reactor: reactor.clone(),
            socket: RefCell::new(socket),
            token: Cell::new(None),
            send_addr: Cell::new(None),
            on_event: RefCell::new(Some(Box::new(on_event))),
            send_iface: PacketPass::new(reactor, mtu),
            send_pending: RefCell::new(None),
            recv_iface: PacketRecv::new(reactor),
            recv_pending: RefCell::new(None),
            errored: Cell::new(false),
        });

        let weak = Rc::downgrade(&core);
        core.send_iface.set_send_handler(move |packet: Bytes| {
            if let Some(core) = weak.upgrade() {
                debug_assert!(core.send_pending.borrow().is_none());
                *core.send_pending.borrow_mut() = Some(packet);
                if !core.errored.get() {
                    DgramCore::try_send(&core);
                }
            }
        });

        let weak = Rc::downgrade(&core);
        core.recv_iface.set_recv_handler(move |buf: BytesMut, max: usize| {
            if let Some(core) = weak.upgrade() {
                debug_assert!(core.recv_pending.borrow().is_none());
                *core.recv_pending.borrow_mut() = Some((buf, max));
                if !core.errored.get() {
                    DgramCore::try_recv(&core);
                }
            }
        });

        let weak = Rc::downgrade(&core);
        let token = reactor.add_io(
            &mut *core.socket.borrow_mut(),
            Interest::READABLE | Interest::WRITABLE,
            Box::new(move |ready: Readiness| {
                if let Some(core) = weak.upgrade() {
                    DgramCore::on_ready(&core, ready);
                }
            }),
        )?;
        core.token.set(Some(token));

        Ok(Datagram { core })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.core.socket.borrow().local_addr()
    }

    /// Sets the remote address for subsequent sends.
    pub fn set_send_addr(&self, addr: SocketAddr) {
        self.core.send_addr.set(Some(addr));
    }

    pub fn send_if(&self) -> PacketPass {
        self.core.send_iface.clone()
    }

    pub fn recv_if(&self) -> PacketRecv {
        self.core.recv_iface.clone()
    }
}

impl DgramCore {
    fn on_ready(core: &Rc<DgramCore>, ready: Readiness) {
        if core.errored.get() {
            return;
        }
        if ready.error {
            Self::report_error(core);
            return;
        }
        if ready.writable && core.send_pending.borrow().is_some() {
            Self::try_send(core);
        }
        if ready.readable && core.recv_pending.borrow().is_some() {
            Self::try_recv(core);
        }
    }

    fn try_send(core: &Rc<DgramCore>) {
        let Some(addr) = core.send_addr.get() else {
            debug!("datagram: send without remote address, dropping");
            *core.send_pending.borrow_mut() = None;
            core.send_iface.done();
            return;
        };
        let data = {
            let pending = core.send_pending.borrow();
            match pending.as_ref() {
                Some(d) => d.clone(),
                None => return,
            }
        };
        let res = core.socket.borrow().send_to(&data, addr);
        match res {
            Ok(_n) => {
                *core.send_pending.borrow_mut() = None;
                core.send_iface.done();
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                debug!(error = %e, "datagram: send failed");
                Self::report_error(core);
            }
        }
    }

    fn try_recv(core: &Rc<DgramCore>) {
        let (mut buf, max) = {
            let mut pending = core.recv_pending.borrow_mut();
            match pending.take() {
                Some(p) => p,
                None => return,
            }
        };
        buf.resize(max, 0);
        loop {
            let res = core.socket.borrow().recv_from(&mut buf[..max]);
            match res {
                Ok((0, _from)) => {
                    // Empty datagram; keep waiting.
                    continue;
                }
                Ok((n, _from)) => {
                    buf.truncate(n);
                    core.recv_iface.done(buf);
                    return;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    buf.truncate(0);
                    *core.recv_pending.borrow_mut() = Some((buf, max));
                    return;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(error = %e, "datagram: recv failed");
                    Self::report_error(core);
                    return;
                }
            }
        }
    }

    fn report_error(core: &Rc<DgramCore>) {
        if core.errored.get() {
            return;
        }
        core.errored.set(true);
        let taken = core.on_event.borrow_mut().take();
        if let Some(mut f) = taken {
            f(DatagramEvent::Error);
            let mut slot = core.on_event.borrow_mut();
            if slot.is_none() {
                *slot = Some(f);
            }
        }
    }
}

impl Drop for Datagram {
    fn drop(&mut self) {
        if let Some(token) = self.core.token.take() {
            self.core
                .reactor
                .remove_io(token, &mut *self.core.socket.borrow_mut());
        }
        self.core.send_iface.detach();
        self.core.recv_iface.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn datagram_round_trip() {
        let reactor = Reactor::new().unwrap();

        let a = Datagram::bind(&reactor, "127.0.0.1:0".parse().unwrap(), 1500, |_e| {}).unwrap();
        let b = Datagram::bind(&reactor, "127.0.0.1:0".parse().unwrap(), 1500, |_e| {}).unwrap();
        a.set_send_addr(b.local_addr().unwrap());

        let got: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
        let g = got.clone();
        let r = reactor.clone();
        b.recv_if().set_done_handler(move |buf: BytesMut| {
            g.borrow_mut().extend_from_slice(&buf);
            r.quit(0);
        });
        b.recv_if().recv(BytesMut::new(), 1500);

        a.send_if().set_done_handler(|| {});
        a.send_if().send(Bytes::from_static(b"datagram"));

        let r = reactor.clone();
        let guard = crate::reactor::Timer::new(move || r.quit(2));
        reactor.set_timer_relative(&guard, Duration::from_secs(5));

        assert_eq!(reactor.run(), 0);
        assert_eq!(got.borrow().as_slice(), b"datagram");
    }
}
