//! smoltcp-backed implementation of the [`Netstack`] contract.
//!
//! A virtual IP-medium device couples the stack to the engine: injected
//! frames queue into the device's receive side, frames the stack emits are
//! drained from its transmit side and surfaced through the output hook.
//!
//! Interception works by combining `set_any_ip` (the interface accepts
//! packets for arbitrary destinations) with per-SYN listening sockets bound
//! to the exact destination the client asked for, so every TCP connection to
//! any address terminates locally.
//!
//! Window discipline: bytes handed to the recv hook stay in the socket's
//! receive buffer (peeked, not consumed) until `advance_window` consumes
//! them, which is what keeps the advertised window in lockstep with the
//! engine's downstream back-pressure.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::rc::Rc;

use bytes::Bytes;
use smoltcp::iface::{Config, Interface, SocketHandle, SocketSet};
use smoltcp::phy::{Device, DeviceCapabilities, Medium, RxToken, TxToken};
use smoltcp::socket::tcp;
use smoltcp::time::Instant as SmolInstant;
use smoltcp::wire::{HardwareAddress, IpAddress, IpCidr, IpListenEndpoint};
use tracing::{debug, error, trace, warn};

use crate::common::{Error, TCP_WND};
use crate::reactor::{Job, Reactor};

use super::{
    Aborted, AcceptError, CloseRefused, ConnHandle, ConnHooks, Netstack, Pbuf, RecvError,
    StackHooks, WriteError,
};

/// Per-connection transmit buffer.
const SND_BUF: usize = 8 * 1024;

// ---------------------------------------------------------------------------
// Virtual device
// ---------------------------------------------------------------------------

struct VirtualDevice {
    rx: VecDeque<Vec<u8>>,
    tx: VecDeque<Vec<u8>>,
    mtu: usize,
}

impl VirtualDevice {
    fn new(mtu: usize) -> Self {
        VirtualDevice {
            rx: VecDeque::new(),
            tx: VecDeque::new(),
            mtu,
        }
    }
}

struct VirtualRxToken {
    data: Vec<u8>,
}

impl RxToken for VirtualRxToken {
    fn consume<R, F>(self, f: F) -> R
    where
        F: FnOnce(&[u8]) -> R,
    {
        f(&self.data)
    }
}

struct VirtualTxToken<'a> {
    tx: &'a mut VecDeque<Vec<u8>>,
}

impl<'a> TxToken for VirtualTxToken<'a> {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut buf = vec![0u8; len];
        let result = f(&mut buf);
        self.tx.push_back(buf);
        result
    }
}

impl Device for VirtualDevice {
    type RxToken<'a> = VirtualRxToken;
    type TxToken<'a> = VirtualTxToken<'a>;

    fn receive(&mut self, _ts: SmolInstant) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        self.rx.pop_front().map(|data| {
            (
                VirtualRxToken { data },
                VirtualTxToken { tx: &mut self.tx },
            )
        })
    }

    fn transmit(&mut self, _ts: SmolInstant) -> Option<Self::TxToken<'_>> {
        Some(VirtualTxToken { tx: &mut self.tx })
    }

    fn capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::default();
        caps.medium = Medium::Ip;
        caps.max_transmission_unit = self.mtu;
        caps
    }
}

// ---------------------------------------------------------------------------
// Stack
// ---------------------------------------------------------------------------

struct ListenEntry {
    handle: SocketHandle,
    key: (Ipv4Addr, u16),
}

struct ConnEntry {
    stamp: u64,
    sock: SocketHandle,
    local: SocketAddrV4,
    remote: SocketAddrV4,
    /// Bytes peeked out of the receive buffer and delivered upward, still
    /// holding the window shut.
    delivered: usize,
    /// Last observed send-queue length; decreases mean acknowledged bytes.
    prev_sendq: usize,
    fin_delivered: bool,
    closing: bool,
    dead: bool,
    hooks_cleared: bool,
}

struct Core {
    device: VirtualDevice,
    iface: Interface,
    sockets: SocketSet<'static>,
    listeners: Vec<ListenEntry>,
    conns: Vec<Option<ConnEntry>>,
    free: Vec<usize>,
    next_stamp: u64,
}

enum StackEvent {
    Output(Vec<u8>),
    Accept {
        conn: ConnHandle,
        local: SocketAddrV4,
        remote: SocketAddrV4,
    },
    Recv {
        conn: ConnHandle,
        data: Option<Pbuf>,
    },
    Sent {
        conn: ConnHandle,
        len: usize,
    },
    ConnError {
        conn: ConnHandle,
    },
}

pub struct SmolStack {
    reactor: Reactor,
    core: RefCell<Core>,
    output_hook: RefCell<Option<Box<dyn FnMut(&Pbuf)>>>,
    accept_hook:
        RefCell<Option<Box<dyn FnMut(ConnHandle, SocketAddrV4, SocketAddrV4) -> Result<(), AcceptError>>>>,
    conn_hooks: RefCell<HashMap<usize, (u64, ConnHooks)>>,
    service_job: RefCell<Option<Job>>,
    servicing: Cell<bool>,
}

impl SmolStack {
    pub fn new(reactor: &Reactor, addr: Ipv4Addr, netmask: Ipv4Addr, mtu: usize) -> Rc<SmolStack> {
        let mut device = VirtualDevice::new(mtu);
        let config = Config::new(HardwareAddress::Ip);
        let mut iface = Interface::new(config, &mut device, SmolInstant::now());
        iface.set_any_ip(true);
        let prefix = netmask_prefix(netmask);
        iface.update_ip_addrs(|addrs| {
            let _ = addrs.push(IpCidr::new(IpAddress::Ipv4(addr), prefix));
        });
        let _ = iface
            .routes_mut()
            .add_default_ipv4_route(Ipv4Addr::new(0, 0, 0, 1));

        let stack = Rc::new(SmolStack {
            reactor: reactor.clone(),
            core: RefCell::new(Core {
                device,
                iface,
                sockets: SocketSet::new(Vec::new()),
                listeners: Vec::new(),
                conns: Vec::new(),
                free: Vec::new(),
                next_stamp: 1,
            }),
            output_hook: RefCell::new(None),
            accept_hook: RefCell::new(None),
            conn_hooks: RefCell::new(HashMap::new()),
            service_job: RefCell::new(None),
            servicing: Cell::new(false),
        });

        let weak = Rc::downgrade(&stack);
        let job = Job::new(move || {
            if let Some(stack) = weak.upgrade() {
                SmolStack::service(&stack);
            }
        });
        *stack.service_job.borrow_mut() = Some(job);

        stack
    }

    /// Defers a service pass to the job queue; used by mutations that may be
    /// called from inside a hook dispatch.
    fn kick(&self) {
        if let Some(job) = self.service_job.borrow().as_ref() {
            self.reactor.schedule_job(job);
        }
    }

    fn service(stack: &Rc<SmolStack>) {
        if stack.servicing.get() {
            stack.kick();
            return;
        }
        stack.servicing.set(true);
        loop {
            let events = stack.core.borrow_mut().poll_once();
            if events.is_empty() {
                break;
            }
            for ev in events {
                SmolStack::dispatch(stack, ev);
            }
        }
        stack.servicing.set(false);
    }

    fn dispatch(stack: &Rc<SmolStack>, ev: StackEvent) {
        match ev {
            StackEvent::Output(frame) => {
                let taken = stack.output_hook.borrow_mut().take();
                if let Some(mut f) = taken {
                    let pbuf = Pbuf::from_single(Bytes::from(frame));
                    f(&pbuf);
                    let mut slot = stack.output_hook.borrow_mut();
                    if slot.is_none() {
                        *slot = Some(f);
                    }
                }
            }
            StackEvent::Accept { conn, local, remote } => {
                let taken = stack.accept_hook.borrow_mut().take();
                let Some(mut f) = taken else {
                    stack.abort(conn);
                    return;
                };
                let res = f(conn, local, remote);
                {
                    let mut slot = stack.accept_hook.borrow_mut();
                    if slot.is_none() {
                        *slot = Some(f);
                    }
                }
                match res {
                    Ok(()) => {}
                    Err(AcceptError::Mem) => {
                        warn!("stack: accept refused, aborting connection");
                        stack.abort(conn);
                    }
                    Err(AcceptError::Aborted) => {}
                }
            }
            StackEvent::Recv { conn, data } => {
                if !stack.is_alive(conn) {
                    return;
                }
                if let Some(mut hooks) = stack.take_conn_hooks(conn) {
                    let res = (hooks.recv)(conn, data);
                    stack.restore_conn_hooks(conn, hooks);
                    if let Err(RecvError::Mem) = res {
                        error!("stack: receive refused, aborting connection");
                        stack.abort(conn);
                    }
                }
            }
            StackEvent::Sent { conn, len } => {
                if !stack.is_alive(conn) {
                    return;
                }
                if let Some(mut hooks) = stack.take_conn_hooks(conn) {
                    let res: Result<(), Aborted> = (hooks.sent)(conn, len);
                    stack.restore_conn_hooks(conn, hooks);
                    let _ = res;
                }
            }
            StackEvent::ConnError { conn } => {
                let hooks = {
                    let mut map = stack.conn_hooks.borrow_mut();
                    match map.remove(&conn.index) {
                        Some((stamp, hooks)) if stamp == conn.stamp => Some(hooks),
                        Some(other) => {
                            map.insert(conn.index, other);
                            None
                        }
                        None => None,
                    }
                };
                if let Some(mut hooks) = hooks {
                    (hooks.err)(conn);
                }
            }
        }
    }

    fn is_alive(&self, conn: ConnHandle) -> bool {
        let core = self.core.borrow();
        matches!(
            core.conns.get(conn.index),
            Some(Some(e)) if e.stamp == conn.stamp && !e.dead
        )
    }

    fn take_conn_hooks(&self, conn: ConnHandle) -> Option<ConnHooks> {
        let mut map = self.conn_hooks.borrow_mut();
        match map.remove(&conn.index) {
            Some((stamp, hooks)) if stamp == conn.stamp => Some(hooks),
            Some(other) => {
                map.insert(conn.index, other);
                None
            }
            None => None,
        }
    }

    fn restore_conn_hooks(&self, conn: ConnHandle, hooks: ConnHooks) {
        let valid = {
            let core = self.core.borrow();
            matches!(
                core.conns.get(conn.index),
                Some(Some(e)) if e.stamp == conn.stamp && !e.hooks_cleared
            )
        };
        if !valid {
            return;
        }
        let mut map = self.conn_hooks.borrow_mut();
        map.entry(conn.index).or_insert((conn.stamp, hooks));
    }
}

impl Netstack for Rc<SmolStack> {
    fn start(&self, hooks: StackHooks) -> Result<(), Error> {
        *self.output_hook.borrow_mut() = Some(hooks.output);
        *self.accept_hook.borrow_mut() = Some(hooks.accept);
        debug!("stack: started");
        Ok(())
    }

    fn inject(&self, frame: &[u8]) {
        {
            let mut core = self.core.borrow_mut();
            if let Some((dst, port)) = parse_tcp_syn(frame) {
                core.ensure_listener(dst, port);
            }
            core.device.rx.push_back(frame.to_vec());
        }
        SmolStack::service(self);
    }

    fn tick(&self) {
        SmolStack::service(self);
    }

    fn set_conn_hooks(&self, conn: ConnHandle, hooks: ConnHooks) {
        {
            let mut core = self.core.borrow_mut();
            if let Some(Some(entry)) = core.conns.get_mut(conn.index) {
                if entry.stamp == conn.stamp {
                    entry.hooks_cleared = false;
                } else {
                    return;
                }
            } else {
                return;
            }
        }
        self.conn_hooks
            .borrow_mut()
            .insert(conn.index, (conn.stamp, hooks));
    }

    fn clear_conn_hooks(&self, conn: ConnHandle) {
        {
            let mut core = self.core.borrow_mut();
            if let Some(Some(entry)) = core.conns.get_mut(conn.index) {
                if entry.stamp == conn.stamp {
                    entry.hooks_cleared = true;
                }
            }
        }
        let mut map = self.conn_hooks.borrow_mut();
        if matches!(map.get(&conn.index), Some((stamp, _)) if *stamp == conn.stamp) {
            map.remove(&conn.index);
        }
    }

    fn sndbuf(&self, conn: ConnHandle) -> usize {
        let mut core = self.core.borrow_mut();
        let Some(sock) = core.socket_for(conn) else {
            return 0;
        };
        sock.send_capacity() - sock.send_queue()
    }

    fn write(&self, conn: ConnHandle, data: &[u8]) -> Result<(), WriteError> {
        {
            let mut core = self.core.borrow_mut();
            let Some(entry) = core.entry_for(conn) else {
                return Err(WriteError::Fatal);
            };
            let sock_handle = entry.sock;
            let sock = core.sockets.get_mut::<tcp::Socket>(sock_handle);
            if !sock.may_send() {
                return Err(WriteError::Fatal);
            }
            if sock.send_capacity() - sock.send_queue() < data.len() {
                return Err(WriteError::Mem);
            }
            match sock.send_slice(data) {
                Ok(n) if n == data.len() => {
                    let entry = core.entry_for(conn).expect("entry vanished during write");
                    entry.prev_sendq += n;
                }
                Ok(_) => return Err(WriteError::Mem),
                Err(_) => return Err(WriteError::Fatal),
            }
        }
        self.kick();
        Ok(())
    }

    fn flush(&self, _conn: ConnHandle) -> Result<(), WriteError> {
        self.kick();
        Ok(())
    }

    fn advance_window(&self, conn: ConnHandle, amount: usize) {
        {
            let mut core = self.core.borrow_mut();
            let Some(entry) = core.entry_for(conn) else { return };
            debug_assert!(entry.delivered >= amount);
            entry.delivered -= amount;
            let sock_handle = entry.sock;
            let sock = core.sockets.get_mut::<tcp::Socket>(sock_handle);
            let mut scratch = vec![0u8; amount];
            match sock.recv_slice(&mut scratch) {
                Ok(n) if n == amount => {}
                other => {
                    debug_assert!(false, "window consume failed: {:?}", other);
                }
            }
        }
        self.kick();
    }

    fn close(&self, conn: ConnHandle) -> Result<(), CloseRefused> {
        {
            let mut core = self.core.borrow_mut();
            let Some(entry) = core.entry_for(conn) else {
                return Ok(());
            };
            entry.closing = true;
            let sock_handle = entry.sock;
            core.sockets.get_mut::<tcp::Socket>(sock_handle).close();
        }
        self.kick();
        Ok(())
    }

    fn abort(&self, conn: ConnHandle) {
        {
            let mut core = self.core.borrow_mut();
            let Some(entry) = core.entry_for(conn) else { return };
            entry.dead = true;
            let sock_handle = entry.sock;
            core.sockets.get_mut::<tcp::Socket>(sock_handle).abort();
        }
        self.conn_hooks.borrow_mut().remove(&conn.index);
        self.kick();
    }
}

impl Core {
    fn entry_for(&mut self, conn: ConnHandle) -> Option<&mut ConnEntry> {
        match self.conns.get_mut(conn.index) {
            Some(Some(entry)) if entry.stamp == conn.stamp && !entry.dead => Some(entry),
            _ => None,
        }
    }

    fn socket_for(&mut self, conn: ConnHandle) -> Option<&mut tcp::Socket<'static>> {
        let handle = self.entry_for(conn)?.sock;
        Some(self.sockets.get_mut::<tcp::Socket>(handle))
    }

    fn ensure_listener(&mut self, dst: Ipv4Addr, port: u16) {
        let key = (dst, port);
        let has_ready = self.listeners.iter().any(|l| {
            l.key == key && self.sockets.get::<tcp::Socket>(l.handle).state() == tcp::State::Listen
        });
        if has_ready {
            return;
        }
        let rx = tcp::SocketBuffer::new(vec![0u8; TCP_WND]);
        let tx = tcp::SocketBuffer::new(vec![0u8; SND_BUF]);
        let mut socket = tcp::Socket::new(rx, tx);
        let endpoint = IpListenEndpoint {
            addr: Some(IpAddress::Ipv4(dst)),
            port,
        };
        socket.set_ack_delay(None);
        if let Err(e) = socket.listen(endpoint) {
            debug!(error = ?e, "stack: listen failed");
            return;
        }
        let handle = self.sockets.add(socket);
        self.listeners.push(ListenEntry { handle, key });
        trace!(dst = %dst, port, "stack: listener armed");
    }

    fn alloc_conn(&mut self, entry: ConnEntry) -> ConnHandle {
        let stamp = entry.stamp;
        let index = match self.free.pop() {
            Some(i) => {
                self.conns[i] = Some(entry);
                i
            }
            None => {
                self.conns.push(Some(entry));
                self.conns.len() - 1
            }
        };
        ConnHandle { index, stamp }
    }

    fn poll_once(&mut self) -> Vec<StackEvent> {
        let mut events = Vec::new();
        let ts = SmolInstant::now();
        let _ = self.iface.poll(ts, &mut self.device, &mut self.sockets);

        // Reap connections that finished dying: aborted ones have emitted
        // their reset in the poll above, orderly-closed ones reached Closed.
        for idx in 0..self.conns.len() {
            let remove = match &self.conns[idx] {
                Some(e) => {
                    e.dead
                        || (e.closing
                            && self.sockets.get::<tcp::Socket>(e.sock).state() == tcp::State::Closed)
                }
                None => false,
            };
            if remove {
                let entry = self.conns[idx].take().unwrap();
                self.sockets.remove(entry.sock);
                self.free.push(idx);
            }
        }

        // Promote listeners whose handshake completed.
        let mut i = 0;
        while i < self.listeners.len() {
            let state = self
                .sockets
                .get::<tcp::Socket>(self.listeners[i].handle)
                .state();
            match state {
                tcp::State::Listen | tcp::State::SynReceived => {
                    i += 1;
                }
                tcp::State::Established => {
                    let listen = self.listeners.swap_remove(i);
                    let sock = self.sockets.get::<tcp::Socket>(listen.handle);
                    let (Some(local), Some(remote)) =
                        (sock.local_endpoint(), sock.remote_endpoint())
                    else {
                        self.sockets.remove(listen.handle);
                        continue;
                    };
                    let (Some(local), Some(remote)) =
                        (endpoint_v4(local.addr, local.port), endpoint_v4(remote.addr, remote.port))
                    else {
                        self.sockets.remove(listen.handle);
                        continue;
                    };
                    let stamp = self.next_stamp;
                    self.next_stamp += 1;
                    let conn = self.alloc_conn(ConnEntry {
                        stamp,
                        sock: listen.handle,
                        local,
                        remote,
                        delivered: 0,
                        prev_sendq: 0,
                        fin_delivered: false,
                        closing: false,
                        dead: false,
                        hooks_cleared: false,
                    });
                    events.push(StackEvent::Accept { conn, local, remote });
                }
                _ => {
                    // Handshake fell apart; recycle the socket.
                    let listen = self.listeners.swap_remove(i);
                    self.sockets.remove(listen.handle);
                }
            }
        }

        // Per-connection progress.
        for idx in 0..self.conns.len() {
            let Some(entry) = self.conns[idx].as_mut() else {
                continue;
            };
            if entry.dead {
                continue;
            }
            let conn = ConnHandle {
                index: idx,
                stamp: entry.stamp,
            };
            let sock = self.sockets.get_mut::<tcp::Socket>(entry.sock);
            let state = sock.state();

            // Acknowledged bytes: the send queue shrank.
            let sendq = sock.send_queue();
            if sendq < entry.prev_sendq {
                let len = entry.prev_sendq - sendq;
                entry.prev_sendq = sendq;
                events.push(StackEvent::Sent { conn, len });
            }

            // Newly arrived bytes: peek past what was already delivered.
            let queued = sock.recv_queue();
            if queued > entry.delivered {
                let mut tmp = vec![0u8; queued];
                if let Ok(n) = sock.peek_slice(&mut tmp) {
                    if n > entry.delivered {
                        let fresh = Bytes::copy_from_slice(&tmp[entry.delivered..n]);
                        entry.delivered = n;
                        events.push(StackEvent::Recv {
                            conn,
                            data: Some(Pbuf::from_single(fresh)),
                        });
                    }
                }
            }

            if !entry.closing {
                match state {
                    tcp::State::CloseWait => {
                        // Remote sent FIN; report it once all data went up.
                        if !entry.fin_delivered && sock.recv_queue() == entry.delivered {
                            entry.fin_delivered = true;
                            events.push(StackEvent::Recv { conn, data: None });
                        }
                    }
                    tcp::State::Closed => {
                        // Reset or failure; the connection is gone.
                        entry.dead = true;
                        events.push(StackEvent::ConnError { conn });
                    }
                    _ => {}
                }
            }
        }

        while let Some(frame) = self.device.tx.pop_front() {
            events.push(StackEvent::Output(frame));
        }

        events
    }
}

fn endpoint_v4(addr: IpAddress, port: u16) -> Option<SocketAddrV4> {
    match addr {
        IpAddress::Ipv4(v4) => Some(SocketAddrV4::new(v4, port)),
        #[allow(unreachable_patterns)]
        _ => None,
    }
}

fn netmask_prefix(mask: Ipv4Addr) -> u8 {
    u32::from_be_bytes(mask.octets()).count_ones() as u8
}

/// Extracts (destination, destination port) from an IPv4 TCP SYN (without
/// ACK), which is the trigger for arming a catch-all listener.
fn parse_tcp_syn(frame: &[u8]) -> Option<(Ipv4Addr, u16)> {
    if frame.len() < 20 || frame[0] >> 4 != 4 {
        return None;
    }
    let ihl = ((frame[0] & 0x0F) as usize) * 4;
    if ihl < 20 || frame.len() < ihl + 20 {
        return None;
    }
    if frame[9] != 6 {
        return None;
    }
    let flags = frame[ihl + 13];
    let syn = flags & 0x02 != 0;
    let ack = flags & 0x10 != 0;
    if !syn || ack {
        return None;
    }
    let dst = Ipv4Addr::new(frame[16], frame[17], frame[18], frame[19]);
    let port = u16::from_be_bytes([frame[ihl + 2], frame[ihl + 3]]);
    Some((dst, port))
}

#[cfg(test)]
pub(crate) mod testing {
    //! IPv4/TCP segment builders for driving the stack from tests.

    use std::net::SocketAddrV4;

    pub fn build_tcp_packet(
        src: SocketAddrV4,
        dst: SocketAddrV4,
        seq: u32,
        ack: u32,
        flags: u8,
        payload: &[u8],
    ) -> Vec<u8> {
        let total_len = 20 + 20 + payload.len();
        let mut packet = vec![0u8; total_len];
        packet[0] = 0x45;
        packet[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
        packet[8] = 64;
        packet[9] = 6;
        packet[12..16].copy_from_slice(&src.ip().octets());
        packet[16..20].copy_from_slice(&dst.ip().octets());

        packet[20..22].copy_from_slice(&src.port().to_be_bytes());
        packet[22..24].copy_from_slice(&dst.port().to_be_bytes());
        packet[24..28].copy_from_slice(&seq.to_be_bytes());
        packet[28..32].copy_from_slice(&ack.to_be_bytes());
        packet[32] = 5 << 4;
        packet[33] = flags;
        packet[34..36].copy_from_slice(&8192u16.to_be_bytes());
        packet[40..].copy_from_slice(payload);

        let ip_csum = ipv4_header_checksum(&packet[..20]);
        packet[10..12].copy_from_slice(&ip_csum.to_be_bytes());
        let tcp_len = (20 + payload.len()) as u16;
        let tcp_csum = tcp_checksum(*src.ip(), *dst.ip(), &packet[20..], tcp_len);
        packet[36..38].copy_from_slice(&tcp_csum.to_be_bytes());
        packet
    }

    pub fn ipv4_header_checksum(header: &[u8]) -> u16 {
        let mut sum: u32 = 0;
        let mut i = 0;
        while i + 1 < header.len() {
            if i == 10 {
                i += 2;
                continue;
            }
            sum = sum.wrapping_add(u16::from_be_bytes([header[i], header[i + 1]]) as u32);
            i += 2;
        }
        while (sum >> 16) != 0 {
            sum = (sum & 0xFFFF) + (sum >> 16);
        }
        !(sum as u16)
    }

    pub fn tcp_checksum(
        src: std::net::Ipv4Addr,
        dst: std::net::Ipv4Addr,
        segment: &[u8],
        tcp_len: u16,
    ) -> u16 {
        let mut sum: u32 = 0;
        let s = src.octets();
        let d = dst.octets();
        sum = sum.wrapping_add(u16::from_be_bytes([s[0], s[1]]) as u32);
        sum = sum.wrapping_add(u16::from_be_bytes([s[2], s[3]]) as u32);
        sum = sum.wrapping_add(u16::from_be_bytes([d[0], d[1]]) as u32);
        sum = sum.wrapping_add(u16::from_be_bytes([d[2], d[3]]) as u32);
        sum = sum.wrapping_add(6u32);
        sum = sum.wrapping_add(tcp_len as u32);

        let mut i = 0;
        while i + 1 < segment.len() {
            // Checksum field itself is zero while computing.
            if i != 16 {
                sum = sum.wrapping_add(u16::from_be_bytes([segment[i], segment[i + 1]]) as u32);
            }
            i += 2;
        }
        if i < segment.len() {
            sum = sum.wrapping_add((segment[i] as u32) << 8);
        }
        while (sum >> 16) != 0 {
            sum = (sum & 0xFFFF) + (sum >> 16);
        }
        !(sum as u16)
    }

    /// Parsed view of an emitted frame, enough for handshake scripting.
    pub struct TcpView {
        pub src: SocketAddrV4,
        pub dst: SocketAddrV4,
        pub seq: u32,
        pub ack: u32,
        pub flags: u8,
        pub payload: Vec<u8>,
    }

    pub fn parse_tcp(frame: &[u8]) -> Option<TcpView> {
        if frame.len() < 20 || frame[0] >> 4 != 4 || frame[9] != 6 {
            return None;
        }
        let ihl = ((frame[0] & 0x0F) as usize) * 4;
        let total = u16::from_be_bytes([frame[2], frame[3]]) as usize;
        if frame.len() < total || total < ihl + 20 {
            return None;
        }
        let src_ip = std::net::Ipv4Addr::new(frame[12], frame[13], frame[14], frame[15]);
        let dst_ip = std::net::Ipv4Addr::new(frame[16], frame[17], frame[18], frame[19]);
        let sport = u16::from_be_bytes([frame[ihl], frame[ihl + 1]]);
        let dport = u16::from_be_bytes([frame[ihl + 2], frame[ihl + 3]]);
        let seq = u32::from_be_bytes([frame[ihl + 4], frame[ihl + 5], frame[ihl + 6], frame[ihl + 7]]);
        let ack = u32::from_be_bytes([frame[ihl + 8], frame[ihl + 9], frame[ihl + 10], frame[ihl + 11]]);
        let data_off = ihl + ((frame[ihl + 12] >> 4) as usize) * 4;
        let flags = frame[ihl + 13];
        Some(TcpView {
            src: SocketAddrV4::new(src_ip, sport),
            dst: SocketAddrV4::new(dst_ip, dport),
            seq,
            ack,
            flags,
            payload: frame[data_off..total].to_vec(),
        })
    }
}
