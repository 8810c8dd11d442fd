//! TCP listener, connector and established-connection wrappers.
//!
//! All sockets are registered edge-style with both interests up front; every
//! operation attempts its syscall inline first and only then waits for
//! readiness, which is the discipline edge-triggered polling requires. A
//! `DispatchLimit` caps inline completions per iteration so one busy socket
//! cannot monopolize the loop; when the budget runs out the registration is
//! re-armed to get the readiness redelivered on the next wait.

use std::cell::{Cell, RefCell};
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::rc::Rc;

use bytes::{Bytes, BytesMut};
use mio::net::{TcpListener, TcpStream};
use mio::Interest;
use tracing::{debug, trace};

use crate::flow::{StreamPass, StreamRecv};
use crate::reactor::{DispatchLimit, IoToken, Job, Readiness, Reactor};

use super::DISPATCH_LIMIT;

/// Fatal and half-close notifications for a connection. ERROR means the
/// owner must drop the connection; RECV_CLOSED means the peer half-closed
/// and the receive side will produce nothing further, while sending remains
/// usable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    Error,
    RecvClosed,
}

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

/// Accepting socket. For each incoming connection the handler runs once; if
/// it does not consume the connection via `accept()` before returning to the
/// reactor, a default job silently drops it so an accept storm cannot pin a
/// stale descriptor.
pub struct Listener {
    core: Rc<ListenerCore>,
}

struct ListenerCore {
    reactor: Reactor,
    listener: RefCell<TcpListener>,
    token: Cell<Option<IoToken>>,
    on_incoming: RefCell<Option<Box<dyn FnMut()>>>,
    pending: RefCell<Option<(TcpStream, SocketAddr)>>,
    default_job: RefCell<Option<Job>>,
}

impl Listener {
    pub fn new(
        reactor: &Reactor,
        addr: SocketAddr,
        on_incoming: impl FnMut() + 'static,
    ) -> io::Result<Listener> {
        let listener = TcpListener::bind(addr)?;
        let core = Rc::new(ListenerCore {
            reactor: reactor.clone(),
            listener: RefCell::new(listener),
            token: Cell::new(None),
            on_incoming: RefCell::new(Some(Box::new(on_incoming))),
            pending: RefCell::new(None),
            default_job: RefCell::new(None),
        });

        let weak = Rc::downgrade(&core);
        let job = Job::new(move || {
            if let Some(core) = weak.upgrade() {
                // Unconsumed connection: close it.
                if core.pending.borrow_mut().take().is_some() {
                    trace!("listener: dropping unconsumed connection");
                }
            }
        });
        *core.default_job.borrow_mut() = Some(job);

        let weak = Rc::downgrade(&core);
        let token = reactor.add_io(
            &mut *core.listener.borrow_mut(),
            Interest::READABLE,
            Box::new(move |ready: Readiness| {
                if let Some(core) = weak.upgrade() {
                    if ready.readable {
                        ListenerCore::on_readable(&core);
                    }
                }
            }),
        )?;
        core.token.set(Some(token));

        Ok(Listener { core })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.core.listener.borrow().local_addr()
    }

    /// Consumes the connection currently offered to the handler. Only valid
    /// from within the handler's turn.
    pub fn accept(&self) -> Option<(TcpStream, SocketAddr)> {
        if let Some(job) = self.core.default_job.borrow().as_ref() {
            self.core.reactor.cancel_job(job);
        }
        self.core.pending.borrow_mut().take()
    }
}

impl ListenerCore {
    fn on_readable(core: &Rc<ListenerCore>) {
        loop {
            let accepted = core.listener.borrow().accept();
            match accepted {
                Ok((stream, addr)) => {
                    *core.pending.borrow_mut() = Some((stream, addr));
                    if let Some(job) = core.default_job.borrow().as_ref() {
                        core.reactor.schedule_job(job);
                    }
                    let taken = core.on_incoming.borrow_mut().take();
                    if let Some(mut f) = taken {
                        f();
                        let mut slot = core.on_incoming.borrow_mut();
                        if slot.is_none() {
                            *slot = Some(f);
                        }
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(error = %e, "listener: accept failed");
                    break;
                }
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(token) = self.core.token.take() {
            self.core
                .reactor
                .remove_io(token, &mut *self.core.listener.borrow_mut());
        }
        if let Some(job) = self.core.default_job.borrow().as_ref() {
            self.core.reactor.cancel_job(job);
        }
    }
}

// ---------------------------------------------------------------------------
// Connector
// ---------------------------------------------------------------------------

/// In-progress outgoing connection. The handler receives `is_error`; on
/// success the stream is claimed with `take_stream`.
pub struct Connector {
    core: Rc<ConnectorCore>,
}

struct ConnectorCore {
    reactor: Reactor,
    stream: RefCell<Option<TcpStream>>,
    token: Cell<Option<IoToken>>,
    completed: Cell<bool>,
    on_done: RefCell<Option<Box<dyn FnMut(bool)>>>,
}

impl Connector {
    pub fn new(
        reactor: &Reactor,
        addr: SocketAddr,
        on_done: impl FnMut(bool) + 'static,
    ) -> io::Result<Connector> {
        let stream = TcpStream::connect(addr)?;
        let core = Rc::new(ConnectorCore {
            reactor: reactor.clone(),
            stream: RefCell::new(Some(stream)),
            token: Cell::new(None),
            completed: Cell::new(false),
            on_done: RefCell::new(Some(Box::new(on_done))),
        });

        let weak = Rc::downgrade(&core);
        let token = reactor.add_io(
            core.stream.borrow_mut().as_mut().unwrap(),
            Interest::WRITABLE,
            Box::new(move |ready: Readiness| {
                if let Some(core) = weak.upgrade() {
                    if ready.writable || ready.error {
                        ConnectorCore::on_ready(&core);
                    }
                }
            }),
        )?;
        core.token.set(Some(token));

        Ok(Connector { core })
    }

    /// Claims the connected stream. Valid once the handler reported success.
    pub fn take_stream(&self) -> Option<TcpStream> {
        debug_assert!(self.core.completed.get());
        self.core.stream.borrow_mut().take()
    }
}

impl ConnectorCore {
    fn on_ready(core: &Rc<ConnectorCore>) {
        if core.completed.get() {
            return;
        }
        let is_error = {
            let stream = core.stream.borrow();
            let Some(stream) = stream.as_ref() else { return };
            match stream.take_error() {
                Ok(None) => stream.peer_addr().is_err(),
                Ok(Some(_)) | Err(_) => true,
            }
        };
        core.completed.set(true);
        // Stop watching; the stream is handed off (or dropped) from here.
        if let Some(token) = core.token.take() {
            if let Some(stream) = core.stream.borrow_mut().as_mut() {
                core.reactor.remove_io(token, stream);
            }
        }
        let taken = core.on_done.borrow_mut().take();
        if let Some(mut f) = taken {
            f(is_error);
        }
    }
}

impl Drop for Connector {
    fn drop(&mut self) {
        if let Some(token) = self.core.token.take() {
            if let Some(stream) = self.core.stream.borrow_mut().as_mut() {
                self.core.reactor.remove_io(token, stream);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// Established stream connection exposing a `StreamPass` send side and a
/// `StreamRecv` receive side, each attached lazily.
pub struct Connection {
    core: Rc<ConnCore>,
}

struct ConnCore {
    reactor: Reactor,
    stream: RefCell<TcpStream>,
    token: Cell<Option<IoToken>>,
    on_event: RefCell<Option<Box<dyn FnMut(ConnectionEvent)>>>,
    send_iface: RefCell<Option<StreamPass>>,
    send_pending: RefCell<Option<Bytes>>,
    send_limit: DispatchLimit,
    recv_iface: RefCell<Option<StreamRecv>>,
    recv_pending: RefCell<Option<(BytesMut, usize)>>,
    recv_limit: DispatchLimit,
    recv_closed: Cell<bool>,
    errored: Cell<bool>,
}

impl Connection {
    /// Wraps a connected non-blocking stream (from a listener, a completed
    /// connector, or a raw descriptor converted upstream).
    pub fn new(
        reactor: &Reactor,
        stream: TcpStream,
        on_event: impl FnMut(ConnectionEvent) + 'static,
    ) -> io::Result<Connection> {
        let core = Rc::new(ConnCore {
            reactor: reactor.clone(),
            stream: RefCell::new(stream),
            token: Cell::new(None),
            on_event: RefCell::new(Some(Box::new(on_event))),
            send_iface: RefCell::new(None),
            send_pending: RefCell::new(None),
            send_limit: DispatchLimit::new(reactor, DISPATCH_LIMIT),
            recv_iface: RefCell::new(None),
            recv_pending: RefCell::new(None),
            recv_limit: DispatchLimit::new(reactor, DISPATCH_LIMIT),
            recv_closed: Cell::new(false),
            errored: Cell::new(false),
        });

        let weak = Rc::downgrade(&core);
        let token = reactor.add_io(
            &mut *core.stream.borrow_mut(),
            Interest::READABLE | Interest::WRITABLE,
            Box::new(move |ready: Readiness| {
                if let Some(core) = weak.upgrade() {
                    ConnCore::on_ready(&core, ready);
                }
            }),
        )?;
        core.token.set(Some(token));

        Ok(Connection { core })
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.core.stream.borrow().peer_addr()
    }

    /// Lazily attaches the send-side interface.
    pub fn send_if(&self) -> StreamPass {
        let mut slot = self.core.send_iface.borrow_mut();
        if let Some(iface) = slot.as_ref() {
            return iface.clone();
        }
        let iface = StreamPass::new(&self.core.reactor);
        let weak = Rc::downgrade(&self.core);
        iface.set_send_handler(move |data: Bytes| {
            if let Some(core) = weak.upgrade() {
                debug_assert!(core.send_pending.borrow().is_none());
                *core.send_pending.borrow_mut() = Some(data);
                if core.errored.get() {
                    return;
                }
                if core.send_limit.increment() {
                    ConnCore::try_send(&core);
                } else {
                    ConnCore::rearm(&core);
                }
            }
        });
        *slot = Some(iface.clone());
        iface
    }

    /// Lazily attaches the receive-side interface.
    pub fn recv_if(&self) -> StreamRecv {
        let mut slot = self.core.recv_iface.borrow_mut();
        if let Some(iface) = slot.as_ref() {
            return iface.clone();
        }
        let iface = StreamRecv::new(&self.core.reactor);
        let weak = Rc::downgrade(&self.core);
        iface.set_recv_handler(move |buf: BytesMut, max: usize| {
            if let Some(core) = weak.upgrade() {
                debug_assert!(core.recv_pending.borrow().is_none());
                *core.recv_pending.borrow_mut() = Some((buf, max));
                if core.errored.get() || core.recv_closed.get() {
                    return;
                }
                if core.recv_limit.increment() {
                    ConnCore::try_recv(&core);
                } else {
                    ConnCore::rearm(&core);
                }
            }
        });
        *slot = Some(iface.clone());
        iface
    }
}

impl ConnCore {
    fn on_ready(core: &Rc<ConnCore>, ready: Readiness) {
        if core.errored.get() {
            return;
        }
        if ready.error {
            let taken_err = core.stream.borrow().take_error().ok().flatten();
            if let Some(e) = taken_err {
                debug!(error = %e, "connection: socket error");
            }
            Self::report_error(core);
            return;
        }
        if ready.writable && core.send_pending.borrow().is_some() {
            Self::try_send(core);
        }
        if core.errored.get() {
            return;
        }
        if (ready.readable || ready.read_closed)
            && !core.recv_closed.get()
            && core.recv_pending.borrow().is_some()
        {
            Self::try_recv(core);
        }
    }

    fn try_send(core: &Rc<ConnCore>) {
        let data = {
            let pending = core.send_pending.borrow();
            match pending.as_ref() {
                Some(d) => d.clone(),
                None => return,
            }
        };
        loop {
            let res = (&*core.stream.borrow()).write(&data);
            match res {
                Ok(0) => {
                    Self::report_error(core);
                    return;
                }
                Ok(n) => {
                    *core.send_pending.borrow_mut() = None;
                    let iface = core.send_iface.borrow().clone();
                    if let Some(iface) = iface {
                        iface.done(n);
                    }
                    return;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    // Parked; the readiness event retries.
                    return;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(error = %e, "connection: send failed");
                    Self::report_error(core);
                    return;
                }
            }
        }
    }

    fn try_recv(core: &Rc<ConnCore>) {
        let (mut buf, max) = {
            let mut pending = core.recv_pending.borrow_mut();
            match pending.take() {
                Some(p) => p,
                None => return,
            }
        };
        buf.resize(max, 0);
        loop {
            let res = (&*core.stream.borrow()).read(&mut buf[..max]);
            match res {
                Ok(0) => {
                    buf.truncate(0);
                    *core.recv_pending.borrow_mut() = Some((buf, max));
                    core.recv_closed.set(true);
                    Self::report_event(core, ConnectionEvent::RecvClosed);
                    return;
                }
                Ok(n) => {
                    buf.truncate(n);
                    let iface = core.recv_iface.borrow().clone();
                    if let Some(iface) = iface {
                        iface.done(buf);
                    }
                    return;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    buf.truncate(0);
                    *core.recv_pending.borrow_mut() = Some((buf, max));
                    return;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(error = %e, "connection: recv failed");
                    Self::report_error(core);
                    return;
                }
            }
        }
    }

    /// Forces the OS to redeliver readiness for a still-ready socket after a
    /// dispatch budget ran out.
    fn rearm(core: &Rc<ConnCore>) {
        if let Some(token) = core.token.get() {
            let _ = core.reactor.update_io(
                token,
                &mut *core.stream.borrow_mut(),
                Interest::READABLE | Interest::WRITABLE,
            );
        }
    }

    fn report_error(core: &Rc<ConnCore>) {
        if core.errored.get() {
            return;
        }
        core.errored.set(true);
        Self::report_event(core, ConnectionEvent::Error);
    }

    fn report_event(core: &Rc<ConnCore>, event: ConnectionEvent) {
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

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(token) = self.core.token.take() {
            self.core
                .reactor
                .remove_io(token, &mut *self.core.stream.borrow_mut());
        }
        if let Some(iface) = self.core.send_iface.borrow().as_ref() {
            iface.detach();
        }
        if let Some(iface) = self.core.recv_iface.borrow().as_ref() {
            iface.detach();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    /// Accept side wiring used by the loopback tests: echoes everything it
    /// receives back to the sender.
    struct Echo {
        _conn: Connection,
        recv: StreamRecv,
        send: StreamPass,
    }

    fn start_echo(reactor: &Reactor, stream: TcpStream) -> Rc<RefCell<Echo>> {
        let conn = Connection::new(reactor, stream, |_event| {}).unwrap();
        let recv = conn.recv_if();
        let send = conn.send_if();
        let echo = Rc::new(RefCell::new(Echo {
            _conn: conn,
            recv,
            send,
        }));

        // Received chunks go straight out the send side.
        let pending: Rc<RefCell<Option<Bytes>>> = Rc::new(RefCell::new(None));
        let e = echo.clone();
        let p = pending.clone();
        echo.borrow().recv.set_done_handler(move |buf: BytesMut| {
            let data = buf.freeze();
            *p.borrow_mut() = Some(data.clone());
            e.borrow().send.send(data);
        });
        let e = echo.clone();
        let p = pending.clone();
        echo.borrow().send.set_done_handler(move |consumed: usize| {
            let rest = {
                let mut pending = p.borrow_mut();
                let data = pending.take().unwrap();
                let rest = data.slice(consumed..);
                if !rest.is_empty() {
                    *pending = Some(rest.clone());
                }
                rest
            };
            let echo = e.borrow();
            if rest.is_empty() {
                echo.recv.recv(BytesMut::new(), 1024);
            } else {
                echo.send.send(rest);
            }
        });
        echo.borrow().recv.recv(BytesMut::new(), 1024);
        echo
    }

    #[test]
    fn connect_send_recv_round_trip() {
        let reactor = Reactor::new().unwrap();
        let finished = Rc::new(Cell::new(false));

        // Echo server made of this crate's own primitives.
        let echoes: Rc<RefCell<Vec<Rc<RefCell<Echo>>>>> = Rc::new(RefCell::new(Vec::new()));
        let listener_slot: Rc<RefCell<Option<Listener>>> = Rc::new(RefCell::new(None));
        let ls = listener_slot.clone();
        let r = reactor.clone();
        let es = echoes.clone();
        let listener = Listener::new(&reactor, "127.0.0.1:0".parse().unwrap(), move || {
            let guard = ls.borrow();
            let listener = guard.as_ref().unwrap();
            if let Some((stream, _addr)) = listener.accept() {
                es.borrow_mut().push(start_echo(&r, stream));
            }
        })
        .unwrap();
        let addr = listener.local_addr().unwrap();
        *listener_slot.borrow_mut() = Some(listener);

        // Client: connect, send a greeting, read the echo back.
        let client: Rc<RefCell<Option<Connection>>> = Rc::new(RefCell::new(None));
        let connector_slot: Rc<RefCell<Option<Connector>>> = Rc::new(RefCell::new(None));
        let r = reactor.clone();
        let c = client.clone();
        let cs = connector_slot.clone();
        let f = finished.clone();
        let connector = Connector::new(&reactor, addr, move |is_error| {
            assert!(!is_error, "connect failed");
            let stream = cs.borrow().as_ref().unwrap().take_stream().unwrap();
            let conn = Connection::new(&r, stream, |_event| {}).unwrap();
            let send = conn.send_if();
            let recv = conn.recv_if();

            let got: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
            let g = got.clone();
            let r2 = r.clone();
            let f2 = f.clone();
            let recv2 = recv.clone();
            recv.set_done_handler(move |buf: BytesMut| {
                g.borrow_mut().extend_from_slice(&buf);
                if g.borrow().as_slice() == b"ping" {
                    f2.set(true);
                    r2.quit(0);
                } else {
                    recv2.recv(BytesMut::new(), 64);
                }
            });

            send.send(Bytes::from_static(b"ping"));
            recv.recv(BytesMut::new(), 64);
            *c.borrow_mut() = Some(conn);
        })
        .unwrap();
        *connector_slot.borrow_mut() = Some(connector);

        let r = reactor.clone();
        let guard = crate::reactor::Timer::new(move || r.quit(2));
        reactor.set_timer_relative(&guard, Duration::from_secs(5));

        assert_eq!(reactor.run(), 0);
        assert!(finished.get());
    }

    #[test]
    fn peer_close_reports_recv_closed() {
        let reactor = Reactor::new().unwrap();
        let events: Rc<RefCell<Vec<ConnectionEvent>>> = Rc::new(RefCell::new(Vec::new()));

        let listener_slot: Rc<RefCell<Option<Listener>>> = Rc::new(RefCell::new(None));
        let server_conn: Rc<RefCell<Option<Connection>>> = Rc::new(RefCell::new(None));
        let ls = listener_slot.clone();
        let sc = server_conn.clone();
        let r = reactor.clone();
        let ev = events.clone();
        let listener = Listener::new(&reactor, "127.0.0.1:0".parse().unwrap(), move || {
            let guard = ls.borrow();
            let listener = guard.as_ref().unwrap();
            if let Some((stream, _)) = listener.accept() {
                let r2 = r.clone();
                let ev2 = ev.clone();
                let conn = Connection::new(&r, stream, move |event| {
                    ev2.borrow_mut().push(event);
                    r2.quit(0);
                })
                .unwrap();
                // Post a receive so the close is noticed.
                conn.recv_if().set_done_handler(|_buf| {});
                conn.recv_if().recv(BytesMut::new(), 64);
                *sc.borrow_mut() = Some(conn);
            }
        })
        .unwrap();
        let addr = listener.local_addr().unwrap();
        *listener_slot.borrow_mut() = Some(listener);

        // A client that connects and immediately closes.
        let connector_slot: Rc<RefCell<Option<Connector>>> = Rc::new(RefCell::new(None));
        let cs = connector_slot.clone();
        let connector = Connector::new(&reactor, addr, move |is_error| {
            assert!(!is_error);
            // Dropping the stream sends FIN.
            drop(cs.borrow().as_ref().unwrap().take_stream());
        })
        .unwrap();
        *connector_slot.borrow_mut() = Some(connector);

        let r = reactor.clone();
        let guard = crate::reactor::Timer::new(move || r.quit(2));
        reactor.set_timer_relative(&guard, Duration::from_secs(5));

        assert_eq!(reactor.run(), 0);
        assert_eq!(*events.borrow(), vec![ConnectionEvent::RecvClosed]);
    }
}
