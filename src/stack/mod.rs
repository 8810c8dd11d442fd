//! Contract between the bridging engine and the embedded TCP/IP stack.
//!
//! The engine only ever talks to `Netstack`; the production backing lives in
//! [`smol`] and tests drive the engine with a scripted implementation.
//! Connection handles are generation-stamped: a handle that outlived its
//! connection is detected and ignored instead of reaching freed state.

pub mod smol;

use std::net::SocketAddrV4;

use bytes::Bytes;

use crate::common::Error;

/// Marker for "the connection handle was aborted while this callback was on
/// the stack"; callers translate it into their abort bookkeeping instead of
/// touching the handle again.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Aborted;

/// Generation-stamped handle to one TCP connection inside the stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnHandle {
    pub(crate) index: usize,
    pub(crate) stamp: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteError {
    /// Transient out-of-buffer condition; retry after the next sent
    /// notification.
    Mem,
    /// Anything else; the connection must be aborted.
    Fatal,
}

/// Graceful close was refused; the caller falls back to `abort`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CloseRefused;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcceptError {
    /// Resources were unavailable; the stack gives up on the connection.
    Mem,
    /// The new connection was aborted during the callback.
    Aborted,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecvError {
    Mem,
    Aborted,
}

/// Chained packet buffer handed across the stack boundary, possibly
/// fragmented into several contiguous segments.
#[derive(Clone, Debug, Default)]
pub struct Pbuf {
    segs: Vec<Bytes>,
    total: usize,
}

impl Pbuf {
    pub fn from_single(data: Bytes) -> Pbuf {
        let total = data.len();
        Pbuf {
            segs: vec![data],
            total,
        }
    }

    pub fn from_segments(segs: Vec<Bytes>) -> Pbuf {
        let total = segs.iter().map(|s| s.len()).sum();
        Pbuf { segs, total }
    }

    pub fn total_len(&self) -> usize {
        self.total
    }

    pub fn segments(&self) -> impl Iterator<Item = &[u8]> {
        self.segs.iter().map(|s| s.as_ref())
    }

    /// Copies up to `out.len()` bytes from the front of the chain; returns
    /// the amount copied.
    pub fn copy_to(&self, out: &mut [u8]) -> usize {
        let mut off = 0;
        for seg in &self.segs {
            if off >= out.len() {
                break;
            }
            let n = seg.len().min(out.len() - off);
            out[off..off + n].copy_from_slice(&seg[..n]);
            off += n;
        }
        off
    }
}

/// Hooks installed at stack start.
pub struct StackHooks {
    /// Outgoing frame towards the device (the netif output path).
    pub output: Box<dyn FnMut(&Pbuf)>,
    /// New connection completed its handshake on the catch-all listener.
    pub accept: Box<dyn FnMut(ConnHandle, SocketAddrV4, SocketAddrV4) -> Result<(), AcceptError>>,
}

/// Hooks installed per accepted connection.
pub struct ConnHooks {
    /// Data (or `None` for an orderly remote close) arrived. Undelivered
    /// window is only reopened by `advance_window`.
    pub recv: Box<dyn FnMut(ConnHandle, Option<Pbuf>) -> Result<(), RecvError>>,
    /// Previously written bytes were acknowledged by the peer.
    pub sent: Box<dyn FnMut(ConnHandle, usize) -> Result<(), Aborted>>,
    /// The connection failed; the stack side is already gone and the handle
    /// is stale.
    pub err: Box<dyn FnMut(ConnHandle)>,
}

/// The embedded TCP/IP stack as consumed by the engine.
pub trait Netstack {
    /// Installs the catch-all listener and the global hooks.
    fn start(&self, hooks: StackHooks) -> Result<(), Error>;

    /// Feeds one raw IP frame from the device into the stack. Accept/recv
    /// hooks may run synchronously from here.
    fn inject(&self, frame: &[u8]);

    /// Periodic timer tick driving retransmissions and time-based state.
    fn tick(&self);

    fn set_conn_hooks(&self, conn: ConnHandle, hooks: ConnHooks);
    fn clear_conn_hooks(&self, conn: ConnHandle);

    /// Bytes the stack can currently accept via `write`.
    fn sndbuf(&self, conn: ConnHandle) -> usize;

    /// Queues bytes for transmission; all-or-nothing. `Mem` is transient.
    fn write(&self, conn: ConnHandle, data: &[u8]) -> Result<(), WriteError>;

    /// Requests transmission of queued bytes.
    fn flush(&self, conn: ConnHandle) -> Result<(), WriteError>;

    /// Reopens the receive window by `amount` bytes previously delivered to
    /// the recv hook.
    fn advance_window(&self, conn: ConnHandle, amount: usize);

    /// Orderly close of the stack side. On refusal the caller aborts.
    fn close(&self, conn: ConnHandle) -> Result<(), CloseRefused>;

    /// Hard teardown; the peer sees a reset. Safe to call on a stale handle.
    fn abort(&self, conn: ConnHandle);
}
