//! SOCKS5 (RFC 1928) client over a reactor connection.
//!
//! CONNECT command only, no-authentication method only. The handshake runs
//! through the connection's stream interfaces; once the tunnel is up the
//! client steps aside entirely — the same interfaces are handed to the user
//! and no application byte is ever buffered here.

use std::cell::{Cell, RefCell};
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;

use bytes::{BufMut, Bytes, BytesMut};
use tracing::debug;

use crate::flow::{StreamPass, StreamRecv};
use crate::net::{Connection, ConnectionEvent, Connector};
use crate::reactor::Reactor;

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NONE: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Lifecycle notifications. `Error` may fire any time before `Up`;
/// afterwards failures surface as `ErrorClosed`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SocksEvent {
    Error,
    ErrorClosed,
    Up,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Connecting,
    SendingGreeting,
    ReadingMethod,
    SendingRequest,
    ReadingReplyHead,
    ReadingReplyDomainLen,
    ReadingReplyAddr,
    Up,
    Closed,
}

pub struct SocksClient {
    core: Rc<SocksCore>,
}

struct SocksCore {
    reactor: Reactor,
    dest: SocketAddr,
    state: Cell<State>,
    connector: RefCell<Option<Connector>>,
    conn: RefCell<Option<Connection>>,
    send_iface: RefCell<Option<StreamPass>>,
    recv_iface: RefCell<Option<StreamRecv>>,
    ctrl_out: RefCell<Bytes>,
    ctrl_in: RefCell<BytesMut>,
    ctrl_need: Cell<usize>,
    on_event: RefCell<Option<Box<dyn FnMut(SocksEvent)>>>,
}

impl SocksClient {
    /// Starts connecting to `server` and tunneling towards `dest`.
    pub fn new(
        reactor: &Reactor,
        server: SocketAddr,
        dest: SocketAddr,
        on_event: impl FnMut(SocksEvent) + 'static,
    ) -> io::Result<SocksClient> {
        let core = Rc::new(SocksCore {
            reactor: reactor.clone(),
            dest,
            state: Cell::new(State::Connecting),
            connector: RefCell::new(None),
            conn: RefCell::new(None),
            send_iface: RefCell::new(None),
            recv_iface: RefCell::new(None),
            ctrl_out: RefCell::new(Bytes::new()),
            ctrl_in: RefCell::new(BytesMut::new()),
            ctrl_need: Cell::new(0),
            on_event: RefCell::new(Some(Box::new(on_event))),
        });

        let weak = Rc::downgrade(&core);
        let connector = Connector::new(reactor, server, move |is_error| {
            if let Some(core) = weak.upgrade() {
                SocksCore::on_connect(&core, is_error);
            }
        })?;
        *core.connector.borrow_mut() = Some(connector);

        Ok(SocksClient { core })
    }

    /// Stream towards the SOCKS server; valid once `Up` was reported. The
    /// caller installs its own done handler.
    pub fn send_if(&self) -> StreamPass {
        self.core
            .send_iface
            .borrow()
            .clone()
            .expect("send_if before the tunnel is up")
    }

    /// Stream from the SOCKS server; valid once `Up` was reported.
    pub fn recv_if(&self) -> StreamRecv {
        self.core
            .recv_iface
            .borrow()
            .clone()
            .expect("recv_if before the tunnel is up")
    }
}

impl SocksCore {
    fn on_connect(core: &Rc<SocksCore>, is_error: bool) {
        debug_assert_eq!(core.state.get(), State::Connecting);
        if is_error {
            debug!(server_error = true, "socks: connection failed");
            Self::fail(core);
            return;
        }
        let stream = {
            let connector = core.connector.borrow();
            connector.as_ref().and_then(|c| c.take_stream())
        };
        *core.connector.borrow_mut() = None;
        let Some(stream) = stream else {
            Self::fail(core);
            return;
        };

        let weak = Rc::downgrade(core);
        let conn = match Connection::new(&core.reactor, stream, move |event| {
            if let Some(core) = weak.upgrade() {
                SocksCore::on_conn_event(&core, event);
            }
        }) {
            Ok(c) => c,
            Err(e) => {
                debug!(error = %e, "socks: connection setup failed");
                Self::fail(core);
                return;
            }
        };

        let send_iface = conn.send_if();
        let recv_iface = conn.recv_if();

        let weak = Rc::downgrade(core);
        send_iface.set_done_handler(move |consumed: usize| {
            if let Some(core) = weak.upgrade() {
                SocksCore::on_ctrl_sent(&core, consumed);
            }
        });
        let weak = Rc::downgrade(core);
        recv_iface.set_done_handler(move |buf: BytesMut| {
            if let Some(core) = weak.upgrade() {
                SocksCore::on_ctrl_received(&core, buf);
            }
        });

        *core.send_iface.borrow_mut() = Some(send_iface);
        *core.recv_iface.borrow_mut() = Some(recv_iface);
        *core.conn.borrow_mut() = Some(conn);

        // Greeting: version, one method, no authentication.
        core.state.set(State::SendingGreeting);
        Self::ctrl_send(core, Bytes::from_static(&[SOCKS_VERSION, 0x01, METHOD_NONE]));
    }

    fn on_conn_event(core: &Rc<SocksCore>, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Error | ConnectionEvent::RecvClosed => {
                debug!(state = ?core.state.get(), "socks: connection failed");
                Self::fail(core);
            }
        }
    }

    fn ctrl_send(core: &Rc<SocksCore>, data: Bytes) {
        *core.ctrl_out.borrow_mut() = data.clone();
        if let Some(iface) = core.send_iface.borrow().as_ref() {
            iface.send(data);
        }
    }

    fn on_ctrl_sent(core: &Rc<SocksCore>, consumed: usize) {
        if matches!(core.state.get(), State::Up | State::Closed) {
            return;
        }
        let rest = {
            let mut out = core.ctrl_out.borrow_mut();
            let rest = out.slice(consumed..);
            *out = rest.clone();
            rest
        };
        if !rest.is_empty() {
            if let Some(iface) = core.send_iface.borrow().as_ref() {
                iface.send(rest);
            }
            return;
        }
        match core.state.get() {
            State::SendingGreeting => {
                core.state.set(State::ReadingMethod);
                Self::ctrl_read(core, 2);
            }
            State::SendingRequest => {
                core.state.set(State::ReadingReplyHead);
                Self::ctrl_read(core, 4);
            }
            s => debug_assert!(false, "unexpected send completion in {:?}", s),
        }
    }

    fn ctrl_read(core: &Rc<SocksCore>, need: usize) {
        core.ctrl_need.set(need);
        core.ctrl_in.borrow_mut().clear();
        Self::ctrl_read_more(core);
    }

    fn ctrl_read_more(core: &Rc<SocksCore>) {
        let missing = core.ctrl_need.get() - core.ctrl_in.borrow().len();
        debug_assert!(missing >= 1);
        if let Some(iface) = core.recv_iface.borrow().as_ref() {
            // Never ask for more than the control message needs, so no
            // application byte is consumed by the handshake.
            iface.recv(BytesMut::with_capacity(missing), missing);
        }
    }

    fn on_ctrl_received(core: &Rc<SocksCore>, buf: BytesMut) {
        if matches!(core.state.get(), State::Up | State::Closed) {
            return;
        }
        core.ctrl_in.borrow_mut().extend_from_slice(&buf);
        if core.ctrl_in.borrow().len() < core.ctrl_need.get() {
            Self::ctrl_read_more(core);
            return;
        }
        match core.state.get() {
            State::ReadingMethod => {
                let ok = {
                    let data = core.ctrl_in.borrow();
                    data[0] == SOCKS_VERSION && data[1] == METHOD_NONE
                };
                if !ok {
                    debug!("socks: server refused the no-auth method");
                    Self::fail(core);
                    return;
                }
                core.state.set(State::SendingRequest);
                Self::ctrl_send(core, Self::build_request(core.dest));
            }
            State::ReadingReplyHead => {
                let (ver, rep, atyp) = {
                    let data = core.ctrl_in.borrow();
                    (data[0], data[1], data[3])
                };
                if ver != SOCKS_VERSION || rep != 0x00 {
                    debug!(reply = rep, "socks: request rejected");
                    Self::fail(core);
                    return;
                }
                match atyp {
                    ATYP_IPV4 => {
                        core.state.set(State::ReadingReplyAddr);
                        Self::ctrl_read(core, 4 + 2);
                    }
                    ATYP_IPV6 => {
                        core.state.set(State::ReadingReplyAddr);
                        Self::ctrl_read(core, 16 + 2);
                    }
                    ATYP_DOMAIN => {
                        core.state.set(State::ReadingReplyDomainLen);
                        Self::ctrl_read(core, 1);
                    }
                    other => {
                        debug!(atyp = other, "socks: unknown bound address type");
                        Self::fail(core);
                    }
                }
            }
            State::ReadingReplyDomainLen => {
                let len = core.ctrl_in.borrow()[0] as usize;
                core.state.set(State::ReadingReplyAddr);
                Self::ctrl_read(core, len + 2);
            }
            State::ReadingReplyAddr => {
                // Bound address consumed and ignored; the tunnel is up.
                core.state.set(State::Up);
                debug!(dest = %core.dest, "socks: tunnel established");
                Self::report(core, SocksEvent::Up);
            }
            s => debug_assert!(false, "unexpected receive completion in {:?}", s),
        }
    }

    fn build_request(dest: SocketAddr) -> Bytes {
        let mut req = BytesMut::with_capacity(22);
        req.put_slice(&[SOCKS_VERSION, CMD_CONNECT, 0x00]);
        match dest {
            SocketAddr::V4(addr) => {
                req.put_u8(ATYP_IPV4);
                req.put_slice(&addr.ip().octets());
            }
            SocketAddr::V6(addr) => {
                req.put_u8(ATYP_IPV6);
                req.put_slice(&addr.ip().octets());
            }
        }
        req.put_u16(dest.port());
        req.freeze()
    }

    fn fail(core: &Rc<SocksCore>) {
        let was_up = core.state.get() == State::Up;
        if core.state.get() == State::Closed {
            return;
        }
        core.state.set(State::Closed);
        let event = if was_up {
            SocksEvent::ErrorClosed
        } else {
            SocksEvent::Error
        };
        Self::report(core, event);
    }

    fn report(core: &Rc<SocksCore>, event: SocksEvent) {
        let taken = core.on_event.borrow_mut().take();
        if let Some(mut f) = taken {
            f(event);
            let mut slot = core.on_event.borrow_mut();
            if slot.is_none() {
                *slot = Some(f);
            }
        }
    }
}
