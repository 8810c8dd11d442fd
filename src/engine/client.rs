//! Per-connection bridge between an intercepted TCP connection and its
//! SOCKS5 tunnel.
//!
//! A client has two half-lifecycles that end independently: the stack side
//! (`client_closed`) and the SOCKS side (`socks_closed`). Whichever side
//! finishes last is responsible for deallocation, and both teardown paths
//! are idempotent with respect to each other: each one re-checks the other
//! side's flags instead of assuming an ordering.

use std::cell::RefCell;
use std::net::{SocketAddr, SocketAddrV4};
use std::rc::Rc;

use bytes::{Bytes, BytesMut};
use tracing::{error, info};

use crate::common::{SOCKS_RECV_BUF_SIZE, TCP_WND};
use crate::flow::{StreamPass, StreamRecv};
use crate::reactor::Job;
use crate::socks::{SocksClient, SocksEvent};
use crate::stack::{
    Aborted, AcceptError, ConnHandle, ConnHooks, Pbuf, RecvError, WriteError,
};

use super::EngineCore;

pub struct TcpClient {
    pub(crate) slot: usize,
    pub(crate) local_addr: SocketAddrV4,
    pub(crate) remote_addr: SocketAddrV4,
    /// Stack-side handle; `None` once that side is torn down.
    pub(crate) pcb: Option<ConnHandle>,
    pub(crate) client_closed: bool,
    /// Whether the stack side ended in an abort; consulted after
    /// synchronization windows to propagate `Aborted` to the stack.
    pub(crate) client_abrt: bool,
    /// Bytes from the stack not yet fully handed to SOCKS.
    pub(crate) buf: Vec<u8>,
    pub(crate) buf_used: usize,
    pub(crate) socks: Option<SocksClient>,
    pub(crate) socks_up: bool,
    pub(crate) socks_closed: bool,
    pub(crate) socks_send_if: Option<StreamPass>,
    /// `buf_used` snapshot at the last send bookkeeping point; `None` when
    /// no send cycle is active.
    pub(crate) socks_send_prev_buf_used: Option<usize>,
    pub(crate) socks_send_finished_job: Option<Job>,
    pub(crate) socks_recv_if: Option<StreamRecv>,
    /// Owned when not lent out to the SOCKS receive side.
    pub(crate) socks_recv_buf: Option<BytesMut>,
    pub(crate) socks_recv_used: Option<usize>,
    pub(crate) socks_recv_sent: usize,
    pub(crate) socks_recv_waiting: bool,
    pub(crate) socks_recv_tcp_pending: usize,
}

type ClientRef = Rc<RefCell<TcpClient>>;

// ---------------------------------------------------------------------------
// Accept
// ---------------------------------------------------------------------------

pub(crate) fn on_accept(
    engine: &Rc<EngineCore>,
    conn: ConnHandle,
    local: SocketAddrV4,
    remote: SocketAddrV4,
) -> Result<(), AcceptError> {
    if engine.quitting.get() {
        return Err(AcceptError::Mem);
    }

    // The SOCKS destination is the address the connection was intercepted
    // for, unless overridden for testing.
    let dest = engine
        .cfg
        .override_dest
        .unwrap_or(SocketAddr::V4(local));

    let client: ClientRef = Rc::new(RefCell::new(TcpClient {
        slot: usize::MAX,
        local_addr: local,
        remote_addr: remote,
        pcb: Some(conn),
        client_closed: false,
        client_abrt: false,
        buf: vec![0u8; TCP_WND],
        buf_used: 0,
        socks: None,
        socks_up: false,
        socks_closed: false,
        socks_send_if: None,
        socks_send_prev_buf_used: None,
        socks_send_finished_job: None,
        socks_recv_if: None,
        socks_recv_buf: None,
        socks_recv_used: None,
        socks_recv_sent: 0,
        socks_recv_waiting: false,
        socks_recv_tcp_pending: 0,
    }));

    let weak_engine = Rc::downgrade(engine);
    let weak_client = Rc::downgrade(&client);
    let socks = match SocksClient::new(&engine.reactor, engine.cfg.socks_server, dest, move |ev| {
        if let (Some(engine), Some(client)) = (weak_engine.upgrade(), weak_client.upgrade()) {
            on_socks_event(&engine, &client, ev);
        }
    }) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "listener accept: SOCKS init failed");
            return Err(AcceptError::Mem);
        }
    };
    client.borrow_mut().socks = Some(socks);

    // Stack-side callbacks. The sent hook is inert until SOCKS comes up
    // because nothing is written before that.
    let weak_engine = Rc::downgrade(engine);
    let weak_client = Rc::downgrade(&client);
    let recv_hook = Box::new(move |c: ConnHandle, data: Option<Pbuf>| {
        match (weak_engine.upgrade(), weak_client.upgrade()) {
            (Some(engine), Some(client)) => on_pcb_recv(&engine, &client, c, data),
            _ => Err(RecvError::Aborted),
        }
    });
    let weak_engine = Rc::downgrade(engine);
    let weak_client = Rc::downgrade(&client);
    let sent_hook = Box::new(move |c: ConnHandle, len: usize| {
        match (weak_engine.upgrade(), weak_client.upgrade()) {
            (Some(engine), Some(client)) => on_pcb_sent(&engine, &client, c, len),
            _ => Err(Aborted),
        }
    });
    let weak_engine = Rc::downgrade(engine);
    let weak_client = Rc::downgrade(&client);
    let err_hook = Box::new(move |_c: ConnHandle| {
        if let (Some(engine), Some(client)) = (weak_engine.upgrade(), weak_client.upgrade()) {
            on_pcb_err(&engine, &client);
        }
    });
    engine.stack.set_conn_hooks(
        conn,
        ConnHooks {
            recv: recv_hook,
            sent: sent_hook,
            err: err_hook,
        },
    );

    let slot = engine.clients.borrow_mut().insert(client.clone());
    client.borrow_mut().slot = slot;

    info!(
        count = engine.clients.borrow().count(),
        local = %local,
        remote = %remote,
        "client accepted"
    );

    // Let any effects the setup produced settle before returning into the
    // stack, and translate a teardown that happened meanwhile.
    engine.reactor.flush_pending();
    if client.borrow().client_abrt {
        return Err(AcceptError::Aborted);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Stack-side callbacks
// ---------------------------------------------------------------------------

fn on_pcb_recv(
    engine: &Rc<EngineCore>,
    client: &ClientRef,
    _conn: ConnHandle,
    data: Option<Pbuf>,
) -> Result<(), RecvError> {
    debug_assert!(!client.borrow().client_closed);

    // After the SOCKS side went away the stack side only drains: data is
    // discarded (with the window kept open), a close finishes the client.
    if client.borrow().socks_closed {
        return match data {
            Some(pbuf) => {
                let pcb = client.borrow().pcb;
                if let Some(pcb) = pcb {
                    engine.stack.advance_window(pcb, pbuf.total_len());
                }
                Ok(())
            }
            None => {
                client_log_closed(client);
                if free_client(engine, client) {
                    Err(RecvError::Aborted)
                } else {
                    Ok(())
                }
            }
        };
    }

    let Some(pbuf) = data else {
        client_log_closed(client);
        return if free_client(engine, client) {
            Err(RecvError::Aborted)
        } else {
            Ok(())
        };
    };

    debug_assert!(pbuf.total_len() > 0);

    let kick = {
        let mut c = client.borrow_mut();
        if pbuf.total_len() > TCP_WND - c.buf_used {
            error!(local = %c.local_addr, remote = %c.remote_addr, "no buffer for data");
            return Err(RecvError::Mem);
        }
        let start = c.buf_used;
        let n = pbuf.copy_to(&mut c.buf[start..start + pbuf.total_len()]);
        debug_assert_eq!(n, pbuf.total_len());
        c.buf_used += n;

        // Only a fully idle buffer starts a new send cycle; an active cycle
        // picks appended bytes up on its own (the done handler re-sends, the
        // finished job relaunches). The snapshot is bumped so window
        // accounting stays exact.
        let was_idle = c.socks_send_prev_buf_used.is_none();
        if let Some(k) = c.socks_send_prev_buf_used {
            c.socks_send_prev_buf_used = Some(k + n);
        }
        c.buf_used == n && was_idle && c.socks_up
    };

    if kick {
        debug_assert!(!client.borrow().socks_closed);
        send_to_socks(engine, client);
        engine.reactor.flush_pending();
        if client.borrow().client_abrt {
            return Err(RecvError::Aborted);
        }
    }
    Ok(())
}

fn on_pcb_sent(
    engine: &Rc<EngineCore>,
    client: &ClientRef,
    _conn: ConnHandle,
    len: usize,
) -> Result<(), Aborted> {
    let resume = {
        let mut c = client.borrow_mut();
        debug_assert!(!c.client_closed);
        debug_assert!(c.socks_up);
        debug_assert!(len > 0 && len <= c.socks_recv_tcp_pending);
        c.socks_recv_tcp_pending -= len;
        c.socks_recv_used.is_some()
    };

    if resume {
        {
            let mut c = client.borrow_mut();
            debug_assert!(c.socks_recv_waiting);
            debug_assert!(c.socks_recv_sent < c.socks_recv_used.unwrap_or(0));
            c.socks_recv_waiting = false;
        }
        socks_recv_send_out(engine, client)?;

        // Something was just queued, so it cannot all be acknowledged yet.
        debug_assert!(client.borrow().socks_recv_tcp_pending > 0);

        let (drained, socks_closed) = {
            let c = client.borrow();
            (c.socks_recv_used.is_none(), c.socks_closed)
        };
        if drained && !socks_closed {
            socks_recv_initiate(engine, client);
            engine.reactor.flush_pending();
            if client.borrow().client_abrt {
                return Err(Aborted);
            }
        }
        return Ok(());
    }

    // All bytes the SOCKS side left behind have been acknowledged?
    let finish = {
        let c = client.borrow();
        c.socks_closed && c.socks_recv_tcp_pending == 0
    };
    if finish {
        {
            let c = client.borrow();
            info!(local = %c.local_addr, remote = %c.remote_addr, "removing after SOCKS went down");
        }
        if free_client(engine, client) {
            return Err(Aborted);
        }
    }
    Ok(())
}

fn on_pcb_err(engine: &Rc<EngineCore>, client: &ClientRef) {
    {
        let mut c = client.borrow_mut();
        debug_assert!(!c.client_closed);
        info!(local = %c.local_addr, remote = %c.remote_addr, "client error");
        // The stack already dropped the connection; the handle is stale.
        c.pcb = None;
    }
    handle_freed_client(engine, client, false);
}

// ---------------------------------------------------------------------------
// SOCKS events
// ---------------------------------------------------------------------------

fn on_socks_event(engine: &Rc<EngineCore>, client: &ClientRef, event: SocksEvent) {
    debug_assert!(!client.borrow().socks_closed);

    match event {
        SocksEvent::Error => {
            {
                let c = client.borrow();
                info!(local = %c.local_addr, remote = %c.remote_addr, "SOCKS error");
            }
            free_socks(engine, client);
        }
        SocksEvent::ErrorClosed => {
            debug_assert!(client.borrow().socks_up);
            {
                let c = client.borrow();
                info!(local = %c.local_addr, remote = %c.remote_addr, "SOCKS closed");
            }
            free_socks(engine, client);
        }
        SocksEvent::Up => {
            on_socks_up(engine, client);
        }
    }
}

fn on_socks_up(engine: &Rc<EngineCore>, client: &ClientRef) {
    let (send_if, recv_if) = {
        let c = client.borrow();
        debug_assert!(!c.socks_up);
        info!(local = %c.local_addr, remote = %c.remote_addr, "SOCKS up");
        let socks = c.socks.as_ref().expect("SOCKS up without client");
        (socks.send_if(), socks.recv_if())
    };

    // Sending side.
    let weak_engine = Rc::downgrade(engine);
    let weak_client = Rc::downgrade(client);
    send_if.set_done_handler(move |consumed: usize| {
        if let (Some(engine), Some(client)) = (weak_engine.upgrade(), weak_client.upgrade()) {
            on_socks_send_done(&engine, &client, consumed);
        }
    });
    let weak_engine = Rc::downgrade(engine);
    let weak_client = Rc::downgrade(client);
    let finished_job = Job::new(move || {
        if let (Some(engine), Some(client)) = (weak_engine.upgrade(), weak_client.upgrade()) {
            on_send_finished(&engine, &client);
        }
    });

    // Receiving side.
    let weak_engine = Rc::downgrade(engine);
    let weak_client = Rc::downgrade(client);
    recv_if.set_done_handler(move |buf: BytesMut| {
        if let (Some(engine), Some(client)) = (weak_engine.upgrade(), weak_client.upgrade()) {
            on_socks_recv_done(&engine, &client, buf);
        }
    });

    let (start_send, start_recv) = {
        let mut c = client.borrow_mut();
        c.socks_send_if = Some(send_if);
        c.socks_send_prev_buf_used = None;
        c.socks_send_finished_job = Some(finished_job);
        c.socks_recv_if = Some(recv_if);
        c.socks_recv_buf = Some(BytesMut::with_capacity(SOCKS_RECV_BUF_SIZE));
        c.socks_recv_used = None;
        c.socks_recv_tcp_pending = 0;
        c.socks_up = true;
        (c.buf_used > 0, !c.client_closed)
    };

    if start_send {
        send_to_socks(engine, client);
    }
    if start_recv {
        socks_recv_initiate(engine, client);
    }
}

// ---------------------------------------------------------------------------
// Stack → SOCKS
// ---------------------------------------------------------------------------

fn send_to_socks(engine: &Rc<EngineCore>, client: &ClientRef) {
    let (iface, data) = {
        let mut c = client.borrow_mut();
        debug_assert!(!c.socks_closed);
        debug_assert!(c.socks_up);
        debug_assert!(c.buf_used > 0);
        debug_assert!(c.socks_send_prev_buf_used.is_none());
        c.socks_send_prev_buf_used = Some(c.buf_used);
        (
            c.socks_send_if.clone().expect("send interface missing"),
            Bytes::copy_from_slice(&c.buf[..c.buf_used]),
        )
    };
    iface.send(data);
    // The bookkeeping job runs after the completion that the send may have
    // triggered, so it observes the consumed amount.
    schedule_finished(engine, client);
}

fn on_socks_send_done(engine: &Rc<EngineCore>, client: &ClientRef, consumed: usize) {
    let resend = {
        let mut c = client.borrow_mut();
        debug_assert!(!c.socks_closed);
        debug_assert!(c.socks_up);
        debug_assert!(consumed > 0 && consumed <= c.buf_used);
        let used = c.buf_used;
        c.buf.copy_within(consumed..used, 0);
        c.buf_used -= consumed;
        if c.buf_used > 0 {
            Some((
                c.socks_send_if.clone().expect("send interface missing"),
                Bytes::copy_from_slice(&c.buf[..c.buf_used]),
            ))
        } else {
            None
        }
    };
    if let Some((iface, data)) = resend {
        iface.send(data);
    }
    // Window bookkeeping happens in the finished job, never here.
    schedule_finished(engine, client);
}

fn schedule_finished(engine: &Rc<EngineCore>, client: &ClientRef) {
    let c = client.borrow();
    if c.socks_closed {
        return;
    }
    if let Some(job) = c.socks_send_finished_job.as_ref() {
        engine.reactor.schedule_job(job);
    }
}

fn on_send_finished(engine: &Rc<EngineCore>, client: &ClientRef) {
    let mut free = false;
    let mut open_window: Option<(ConnHandle, usize)> = None;
    let mut resend: Option<(StreamPass, Bytes)> = None;

    {
        let mut c = client.borrow_mut();
        debug_assert!(!c.socks_closed);
        debug_assert!(c.socks_up);
        let Some(k) = c.socks_send_prev_buf_used.take() else {
            return;
        };
        debug_assert!(c.buf_used <= k);
        let sent = k - c.buf_used;

        if c.client_closed {
            if c.buf_used == 0 {
                info!(local = %c.local_addr, remote = %c.remote_addr, "removing after client went down");
                free = true;
            } else {
                // Still draining; keep the cycle's snapshot alive.
                c.socks_send_prev_buf_used = Some(c.buf_used);
            }
        } else {
            if c.buf_used > 0 {
                c.socks_send_prev_buf_used = Some(c.buf_used);
                // Bytes that arrived after the last completion but before
                // this job have no operation carrying them; relaunch.
                let iface = c.socks_send_if.clone().expect("send interface missing");
                if !iface.is_busy() {
                    resend = Some((iface, Bytes::copy_from_slice(&c.buf[..c.buf_used])));
                }
            }
            if sent > 0 {
                if let Some(pcb) = c.pcb {
                    open_window = Some((pcb, sent));
                }
            }
        }
    }

    if free {
        free_socks(engine, client);
        return;
    }
    if let Some((pcb, sent)) = open_window {
        engine.stack.advance_window(pcb, sent);
    }
    if let Some((iface, data)) = resend {
        iface.send(data);
        schedule_finished(engine, client);
    }
}

// ---------------------------------------------------------------------------
// SOCKS → stack
// ---------------------------------------------------------------------------

fn socks_recv_initiate(_engine: &Rc<EngineCore>, client: &ClientRef) {
    let (iface, buf) = {
        let mut c = client.borrow_mut();
        debug_assert!(!c.client_closed);
        debug_assert!(!c.socks_closed);
        debug_assert!(c.socks_up);
        debug_assert!(c.socks_recv_used.is_none());
        let mut buf = c.socks_recv_buf.take().expect("receive buffer lent twice");
        buf.clear();
        (c.socks_recv_if.clone().expect("recv interface missing"), buf)
    };
    iface.recv(buf, SOCKS_RECV_BUF_SIZE);
}

fn on_socks_recv_done(engine: &Rc<EngineCore>, client: &ClientRef, buf: BytesMut) {
    let proceed = {
        let mut c = client.borrow_mut();
        debug_assert!(!c.socks_closed);
        debug_assert!(c.socks_up);
        debug_assert!(c.socks_recv_used.is_none());
        let len = buf.len();
        debug_assert!(len > 0 && len <= SOCKS_RECV_BUF_SIZE);
        c.socks_recv_buf = Some(buf);
        if c.client_closed {
            // No more receives are initiated; drop the data silently.
            false
        } else {
            c.socks_recv_used = Some(len);
            c.socks_recv_sent = 0;
            c.socks_recv_waiting = false;
            true
        }
    };
    if !proceed {
        return;
    }

    if socks_recv_send_out(engine, client).is_err() {
        return;
    }

    let drained = client.borrow().socks_recv_used.is_none();
    if drained {
        socks_recv_initiate(engine, client);
    }
}

/// Queues as much of the received chunk into the stack as it accepts.
/// Returns `Err(Aborted)` when the connection had to be aborted.
fn socks_recv_send_out(engine: &Rc<EngineCore>, client: &ClientRef) -> Result<(), Aborted> {
    let pcb = {
        let c = client.borrow();
        debug_assert!(!c.client_closed);
        debug_assert!(c.socks_up);
        debug_assert!(c.socks_recv_used.is_some());
        debug_assert!(c.socks_recv_sent < c.socks_recv_used.unwrap_or(0));
        debug_assert!(!c.socks_recv_waiting);
        c.pcb.expect("stack side already gone")
    };

    loop {
        let write_res = {
            let mut c = client.borrow_mut();
            let used = c.socks_recv_used.expect("no receive in progress");
            let to_write = (used - c.socks_recv_sent).min(engine.stack.sndbuf(pcb));
            if to_write == 0 {
                break;
            }
            let start = c.socks_recv_sent;
            let res = {
                let buf = c.socks_recv_buf.as_ref().expect("receive buffer missing");
                engine.stack.write(pcb, &buf[start..start + to_write])
            };
            if res.is_ok() {
                c.socks_recv_sent += to_write;
                c.socks_recv_tcp_pending += to_write;
            }
            res
        };
        match write_res {
            Ok(()) => {
                let done = {
                    let c = client.borrow();
                    c.socks_recv_sent >= c.socks_recv_used.unwrap_or(0)
                };
                if done {
                    break;
                }
            }
            Err(WriteError::Mem) => break,
            Err(WriteError::Fatal) => {
                {
                    let c = client.borrow();
                    info!(local = %c.local_addr, remote = %c.remote_addr, "stack write failed");
                }
                abort_client(engine, client);
                return Err(Aborted);
            }
        }
    }

    if engine.stack.flush(pcb).is_err() {
        {
            let c = client.borrow();
            info!(local = %c.local_addr, remote = %c.remote_addr, "stack flush failed");
        }
        abort_client(engine, client);
        return Err(Aborted);
    }

    let mut c = client.borrow_mut();
    let used = c.socks_recv_used.expect("no receive in progress");
    if c.socks_recv_sent < used {
        if c.socks_recv_tcp_pending == 0 {
            error!(
                local = %c.local_addr,
                remote = %c.remote_addr,
                "cannot queue data although everything is acknowledged"
            );
            drop(c);
            abort_client(engine, client);
            return Err(Aborted);
        }
        // Resume from the sent callback.
        c.socks_recv_waiting = true;
        return Ok(());
    }

    c.socks_recv_used = None;
    c.socks_recv_sent = 0;
    Ok(())
}

// ---------------------------------------------------------------------------
// Teardown
// ---------------------------------------------------------------------------

fn client_log_closed(client: &ClientRef) {
    let c = client.borrow();
    info!(local = %c.local_addr, remote = %c.remote_addr, "client closed");
}

/// Stack side finished (either the stack said so or we closed it). Decides
/// what is left to do based on the SOCKS side.
fn handle_freed_client(engine: &Rc<EngineCore>, client: &ClientRef, was_abrt: bool) {
    let next = {
        let mut c = client.borrow_mut();
        debug_assert!(!c.client_closed);
        c.client_abrt = was_abrt;
        c.client_closed = true;
        c.pcb = None;

        if c.buf_used > 0 && !c.socks_closed {
            info!(
                local = %c.local_addr,
                remote = %c.remote_addr,
                "waiting until buffered data is sent to SOCKS"
            );
            None
        } else if !c.socks_closed {
            Some(true)
        } else {
            Some(false)
        }
    };
    match next {
        None => {}
        Some(true) => free_socks(engine, client),
        Some(false) => dealloc(engine, client),
    }
}

/// Orderly close of the stack side, falling back to an abort when the close
/// is refused. Returns whether it ended in an abort.
fn free_client(engine: &Rc<EngineCore>, client: &ClientRef) -> bool {
    let (pcb, addrs) = {
        let c = client.borrow();
        debug_assert!(!c.client_closed);
        (c.pcb.expect("stack side already gone"), (c.local_addr, c.remote_addr))
    };
    engine.stack.clear_conn_hooks(pcb);
    let was_abrt = match engine.stack.close(pcb) {
        Ok(()) => false,
        Err(_) => {
            error!(local = %addrs.0, remote = %addrs.1, "close failed, aborting");
            engine.stack.abort(pcb);
            true
        }
    };
    handle_freed_client(engine, client, was_abrt);
    was_abrt
}

fn abort_client(engine: &Rc<EngineCore>, client: &ClientRef) {
    let pcb = {
        let c = client.borrow();
        debug_assert!(!c.client_closed);
        c.pcb.expect("stack side already gone")
    };
    engine.stack.clear_conn_hooks(pcb);
    engine.stack.abort(pcb);
    handle_freed_client(engine, client, true);
}

/// SOCKS side finished. Decides what is left to do based on the stack side.
fn free_socks(engine: &Rc<EngineCore>, client: &ClientRef) {
    let next = {
        let mut c = client.borrow_mut();
        debug_assert!(!c.socks_closed);

        if c.socks_up {
            if let Some(job) = c.socks_send_finished_job.take() {
                engine.reactor.cancel_job(&job);
            }
        }
        // Dropping the client tears down its connection and interfaces.
        c.socks = None;
        c.socks_send_if = None;
        c.socks_recv_if = None;
        c.socks_closed = true;

        if c.socks_up
            && (c.socks_recv_used.is_some() || c.socks_recv_tcp_pending > 0)
            && !c.client_closed
        {
            info!(
                local = %c.local_addr,
                remote = %c.remote_addr,
                "waiting until buffered data is sent to client"
            );
            None
        } else if !c.client_closed {
            Some(true)
        } else {
            Some(false)
        }
    };
    match next {
        None => {}
        Some(true) => {
            free_client(engine, client);
        }
        Some(false) => dealloc(engine, client),
    }
}

/// Unconditional destruction, used at reactor exit.
pub(crate) fn murder(engine: &Rc<EngineCore>, client: &ClientRef) {
    let pcb = {
        let mut c = client.borrow_mut();
        if !c.client_closed {
            c.client_closed = true;
            c.client_abrt = true;
            c.pcb.take()
        } else {
            None
        }
    };
    if let Some(pcb) = pcb {
        engine.stack.clear_conn_hooks(pcb);
        engine.stack.abort(pcb);
    }
    {
        let mut c = client.borrow_mut();
        if !c.socks_closed {
            if let Some(job) = c.socks_send_finished_job.take() {
                engine.reactor.cancel_job(&job);
            }
            c.socks = None;
            c.socks_send_if = None;
            c.socks_recv_if = None;
            c.socks_closed = true;
        }
    }
    dealloc(engine, client);
}

fn dealloc(engine: &Rc<EngineCore>, client: &ClientRef) {
    let slot = {
        let mut c = client.borrow_mut();
        debug_assert!(c.client_closed);
        debug_assert!(c.socks_closed);
        debug_assert!(c.pcb.is_none());
        if let Some(job) = c.socks_send_finished_job.take() {
            engine.reactor.cancel_job(&job);
        }
        c.slot
    };
    engine.clients.borrow_mut().remove(slot);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Engine, EngineConfig};
    use crate::flow::{PacketPass, PacketRecv};
    use crate::reactor::testing::run_until;
    use crate::reactor::{Reactor, Timer};
    use crate::stack::{CloseRefused, Netstack, StackHooks};
    use std::collections::HashMap;
    use std::io::{Read, Write};
    use std::time::Duration;

    // -----------------------------------------------------------------
    // Scripted stack
    // -----------------------------------------------------------------

    struct MockConn {
        hooks: Option<ConnHooks>,
        cleared: bool,
        written: Vec<u8>,
        recved: usize,
        unacked: usize,
        closed: bool,
        aborted: bool,
    }

    struct MockState {
        output: Option<Box<dyn FnMut(&Pbuf)>>,
        accept: Option<
            Box<dyn FnMut(ConnHandle, SocketAddrV4, SocketAddrV4) -> Result<(), AcceptError>>,
        >,
        conns: HashMap<usize, MockConn>,
        sndbuf: usize,
        /// One-shot write fault: returns `Mem` once the connection has this
        /// many bytes written.
        mem_fault_at: Option<usize>,
    }

    struct MockStack {
        state: RefCell<MockState>,
    }

    impl MockStack {
        fn new(sndbuf: usize) -> Rc<MockStack> {
            Rc::new(MockStack {
                state: RefCell::new(MockState {
                    output: None,
                    accept: None,
                    conns: HashMap::new(),
                    sndbuf,
                    mem_fault_at: None,
                }),
            })
        }

        fn add_conn(&self, index: usize) {
            self.state.borrow_mut().conns.insert(
                index,
                MockConn {
                    hooks: None,
                    cleared: false,
                    written: Vec::new(),
                    recved: 0,
                    unacked: 0,
                    closed: false,
                    aborted: false,
                },
            );
        }

        fn arm_mem_fault(&self, at: usize) {
            self.state.borrow_mut().mem_fault_at = Some(at);
        }

        fn written(&self, index: usize) -> Vec<u8> {
            self.state.borrow().conns[&index].written.clone()
        }

        fn recved(&self, index: usize) -> usize {
            self.state.borrow().conns[&index].recved
        }

        fn unacked(&self, index: usize) -> usize {
            self.state.borrow().conns[&index].unacked
        }

        fn closed(&self, index: usize) -> bool {
            self.state.borrow().conns[&index].closed
        }

        fn aborted(&self, index: usize) -> bool {
            self.state.borrow().conns[&index].aborted
        }

        fn fire_accept(
            &self,
            conn: ConnHandle,
            local: SocketAddrV4,
            remote: SocketAddrV4,
        ) -> Result<(), AcceptError> {
            let taken = self.state.borrow_mut().accept.take();
            let mut f = taken.expect("stack not started");
            let res = f(conn, local, remote);
            let mut s = self.state.borrow_mut();
            if s.accept.is_none() {
                s.accept = Some(f);
            }
            res
        }

        fn take_hooks(&self, index: usize) -> Option<ConnHooks> {
            self.state
                .borrow_mut()
                .conns
                .get_mut(&index)
                .and_then(|e| e.hooks.take())
        }

        fn restore_hooks(&self, index: usize, hooks: ConnHooks) {
            let mut s = self.state.borrow_mut();
            if let Some(entry) = s.conns.get_mut(&index) {
                if !entry.cleared && entry.hooks.is_none() {
                    entry.hooks = Some(hooks);
                }
            }
        }

        fn fire_recv(&self, conn: ConnHandle, data: Option<Pbuf>) -> Result<(), RecvError> {
            let Some(mut hooks) = self.take_hooks(conn.index) else {
                return Ok(());
            };
            let res = (hooks.recv)(conn, data);
            self.restore_hooks(conn.index, hooks);
            res
        }

        fn fire_sent(&self, conn: ConnHandle, len: usize) -> Result<(), Aborted> {
            {
                let mut s = self.state.borrow_mut();
                let entry = s.conns.get_mut(&conn.index).unwrap();
                assert!(entry.unacked >= len);
                entry.unacked -= len;
            }
            let Some(mut hooks) = self.take_hooks(conn.index) else {
                return Ok(());
            };
            let res = (hooks.sent)(conn, len);
            self.restore_hooks(conn.index, hooks);
            res
        }
    }

    impl Netstack for Rc<MockStack> {
        fn start(&self, hooks: StackHooks) -> Result<(), crate::common::Error> {
            let mut s = self.state.borrow_mut();
            s.output = Some(hooks.output);
            s.accept = Some(hooks.accept);
            Ok(())
        }

        fn inject(&self, _frame: &[u8]) {}

        fn tick(&self) {}

        fn set_conn_hooks(&self, conn: ConnHandle, hooks: ConnHooks) {
            let mut s = self.state.borrow_mut();
            let entry = s.conns.get_mut(&conn.index).unwrap();
            entry.hooks = Some(hooks);
            entry.cleared = false;
        }

        fn clear_conn_hooks(&self, conn: ConnHandle) {
            let mut s = self.state.borrow_mut();
            if let Some(entry) = s.conns.get_mut(&conn.index) {
                entry.hooks = None;
                entry.cleared = true;
            }
        }

        fn sndbuf(&self, conn: ConnHandle) -> usize {
            let s = self.state.borrow();
            let entry = &s.conns[&conn.index];
            if entry.closed || entry.aborted {
                0
            } else {
                s.sndbuf.saturating_sub(entry.unacked)
            }
        }

        fn write(&self, conn: ConnHandle, data: &[u8]) -> Result<(), WriteError> {
            let mut s = self.state.borrow_mut();
            {
                let entry = &s.conns[&conn.index];
                if entry.closed || entry.aborted {
                    return Err(WriteError::Fatal);
                }
            }
            let written_len = s.conns[&conn.index].written.len();
            if let Some(at) = s.mem_fault_at {
                if written_len >= at {
                    s.mem_fault_at = None;
                    return Err(WriteError::Mem);
                }
            }
            let avail = s.sndbuf.saturating_sub(s.conns[&conn.index].unacked);
            if data.len() > avail {
                return Err(WriteError::Mem);
            }
            let entry = s.conns.get_mut(&conn.index).unwrap();
            entry.written.extend_from_slice(data);
            entry.unacked += data.len();
            Ok(())
        }

        fn flush(&self, _conn: ConnHandle) -> Result<(), WriteError> {
            Ok(())
        }

        fn advance_window(&self, conn: ConnHandle, amount: usize) {
            let mut s = self.state.borrow_mut();
            if let Some(entry) = s.conns.get_mut(&conn.index) {
                entry.recved += amount;
            }
        }

        fn close(&self, conn: ConnHandle) -> Result<(), CloseRefused> {
            let mut s = self.state.borrow_mut();
            if let Some(entry) = s.conns.get_mut(&conn.index) {
                entry.closed = true;
            }
            Ok(())
        }

        fn abort(&self, conn: ConnHandle) {
            let mut s = self.state.borrow_mut();
            if let Some(entry) = s.conns.get_mut(&conn.index) {
                entry.aborted = true;
            }
        }
    }

    // -----------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------

    fn spawn_socks_server(
        script: impl FnOnce(&mut std::net::TcpStream) + Send + 'static,
    ) -> (SocketAddr, std::thread::JoinHandle<()>) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = std::thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();

            let mut greeting = [0u8; 3];
            sock.read_exact(&mut greeting).unwrap();
            assert_eq!(greeting, [0x05, 0x01, 0x00]);
            sock.write_all(&[0x05, 0x00]).unwrap();

            let mut request = [0u8; 10];
            sock.read_exact(&mut request).unwrap();
            assert_eq!(&request[..4], &[0x05, 0x01, 0x00, 0x01]);
            sock.write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .unwrap();

            script(&mut sock);
        });
        (addr, handle)
    }

    fn build_engine(
        reactor: &Reactor,
        stack: Rc<MockStack>,
        socks_server: SocketAddr,
    ) -> Rc<Engine> {
        let device_output = PacketRecv::new(reactor);
        let device_input = PacketPass::new(reactor, 1500);
        let sink = device_input.clone();
        device_input.set_send_handler(move |_pkt| sink.done());

        let engine = Engine::new(
            reactor,
            EngineConfig {
                mtu: 1500,
                socks_server,
                override_dest: None,
            },
            Box::new(stack),
            device_output,
            device_input,
        )
        .unwrap();
        // Run the deferred stack init now.
        reactor.flush_pending();
        Rc::new(engine)
    }

    fn client_flag(engine: &Rc<Engine>, slot: usize, f: impl Fn(&TcpClient) -> bool) -> bool {
        engine
            .core
            .clients
            .borrow()
            .get(slot)
            .map(|c| f(&c.borrow()))
            .unwrap_or(false)
    }

    fn conn0() -> ConnHandle {
        ConnHandle { index: 0, stamp: 1 }
    }

    fn addr_pair() -> (SocketAddrV4, SocketAddrV4) {
        (
            "10.0.0.5:80".parse().unwrap(),
            "192.168.7.2:51000".parse().unwrap(),
        )
    }

    /// Periodically acknowledges queued bytes, like a peer ACKing segments.
    fn auto_ack(reactor: &Reactor, stack: &Rc<MockStack>, conn: ConnHandle, chunk: usize) -> Timer {
        let stack = stack.clone();
        let r = reactor.clone();
        let slot: Rc<RefCell<Option<Timer>>> = Rc::new(RefCell::new(None));
        let slot2 = slot.clone();
        let timer = Timer::new(move || {
            let unacked = stack.unacked(conn.index);
            if unacked > 0 {
                let _ = stack.fire_sent(conn, unacked.min(chunk));
            }
            if let Some(t) = slot2.borrow().as_ref() {
                r.set_timer_relative(t, Duration::from_millis(3));
            }
        });
        *slot.borrow_mut() = Some(timer.clone());
        reactor.set_timer_relative(&timer, Duration::from_millis(3));
        timer
    }

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    // -----------------------------------------------------------------
    // Scenarios
    // -----------------------------------------------------------------

    #[test]
    fn straight_relay_both_directions() {
        let reactor = Reactor::new().unwrap();
        let (socks_addr, server) = spawn_socks_server(|sock| {
            let mut data = [0u8; 5];
            sock.read_exact(&mut data).unwrap();
            assert_eq!(&data, b"HELLO");
            sock.write_all(b"WORLD\n").unwrap();
            // Stay up until the engine goes away.
            let mut tail = [0u8; 16];
            let _ = sock.read(&mut tail);
        });

        let stack = MockStack::new(8192);
        let engine = build_engine(&reactor, stack.clone(), socks_addr);

        stack.add_conn(0);
        let (local, remote) = addr_pair();
        assert!(stack.fire_accept(conn0(), local, remote).is_ok());
        assert_eq!(engine.client_count(), 1);

        // SOCKS handshake completes.
        let e = engine.clone();
        assert!(run_until(&reactor, TEST_TIMEOUT, move || {
            client_flag(&e, 0, |c| c.socks_up)
        }));

        // Stack delivers "HELLO"; the engine forwards it and reopens the
        // window by exactly the drained amount.
        let pbuf = Pbuf::from_single(Bytes::from_static(b"HELLO"));
        assert!(stack.fire_recv(conn0(), Some(pbuf)).is_ok());
        let s = stack.clone();
        assert!(run_until(&reactor, TEST_TIMEOUT, move || s.recved(0) == 5));

        // The reply comes back and is queued into the stack.
        let s = stack.clone();
        assert!(run_until(&reactor, TEST_TIMEOUT, move || {
            s.written(0) == b"WORLD\n"
        }));

        // The stack acknowledges; nothing remains pending.
        assert!(stack.fire_sent(conn0(), 6).is_ok());
        assert!(client_flag(&engine, 0, |c| c.socks_recv_tcp_pending == 0));
        assert!(!stack.aborted(0));

        engine.shutdown();
        assert_eq!(engine.client_count(), 0);
        server.join().unwrap();
    }

    #[test]
    fn mem_pressure_retries_until_delivered() {
        let reactor = Reactor::new().unwrap();
        let payload: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();
        let (socks_addr, server) = spawn_socks_server(move |sock| {
            sock.write_all(&payload).unwrap();
            let mut tail = [0u8; 16];
            let _ = sock.read(&mut tail);
        });

        // Small send buffer forces partial queueing; the armed fault makes
        // one mid-stream write fail with the transient error.
        let stack = MockStack::new(1000);
        stack.arm_mem_fault(1000);
        let engine = build_engine(&reactor, stack.clone(), socks_addr);

        stack.add_conn(0);
        let (local, remote) = addr_pair();
        assert!(stack.fire_accept(conn0(), local, remote).is_ok());

        let _ack = auto_ack(&reactor, &stack, conn0(), 700);

        let s = stack.clone();
        assert!(run_until(&reactor, TEST_TIMEOUT, move || {
            s.written(0).len() == 3000 && s.unacked(0) == 0
        }));

        assert_eq!(stack.written(0), expected);
        assert!(!stack.aborted(0));
        assert!(!stack.closed(0));

        engine.shutdown();
        server.join().unwrap();
    }

    #[test]
    fn socks_close_finishes_client() {
        let reactor = Reactor::new().unwrap();
        let (socks_addr, server) = spawn_socks_server(|sock| {
            // Consume part of the stream, then vanish.
            let mut part = [0u8; 400];
            sock.read_exact(&mut part).unwrap();
        });

        let stack = MockStack::new(8192);
        let engine = build_engine(&reactor, stack.clone(), socks_addr);

        stack.add_conn(0);
        let (local, remote) = addr_pair();
        assert!(stack.fire_accept(conn0(), local, remote).is_ok());

        let e = engine.clone();
        assert!(run_until(&reactor, TEST_TIMEOUT, move || {
            client_flag(&e, 0, |c| c.socks_up)
        }));

        let data = Pbuf::from_single(Bytes::from(vec![0x61u8; 1000]));
        assert!(stack.fire_recv(conn0(), Some(data)).is_ok());

        // The SOCKS side goes away; the client winds down and closes the
        // stack side once nothing is left pending.
        let e = engine.clone();
        assert!(run_until(&reactor, TEST_TIMEOUT, move || {
            e.client_count() == 0
        }));
        assert!(stack.closed(0));
        assert!(!stack.aborted(0));

        server.join().unwrap();
    }

    #[test]
    fn shutdown_murders_live_clients() {
        let reactor = Reactor::new().unwrap();
        let (socks_addr, server) = spawn_socks_server(|sock| {
            let mut tail = [0u8; 16];
            let _ = sock.read(&mut tail);
        });

        let stack = MockStack::new(8192);
        let engine = build_engine(&reactor, stack.clone(), socks_addr);

        stack.add_conn(0);
        let (local, remote) = addr_pair();
        assert!(stack.fire_accept(conn0(), local, remote).is_ok());

        let e = engine.clone();
        assert!(run_until(&reactor, TEST_TIMEOUT, move || {
            client_flag(&e, 0, |c| c.socks_up)
        }));

        engine.terminate();
        engine.shutdown();
        assert_eq!(engine.client_count(), 0);
        assert!(stack.aborted(0));

        server.join().unwrap();
    }

    #[test]
    fn accept_refused_while_quitting() {
        let reactor = Reactor::new().unwrap();
        let (socks_addr, server) = spawn_socks_server(|_sock| {});

        let stack = MockStack::new(8192);
        let engine = build_engine(&reactor, stack.clone(), socks_addr);

        engine.terminate();
        stack.add_conn(0);
        let (local, remote) = addr_pair();
        assert!(matches!(
            stack.fire_accept(conn0(), local, remote),
            Err(AcceptError::Mem)
        ));
        assert_eq!(engine.client_count(), 0);

        drop(server);
    }
}
